//! Write statements issued by a flush.
//!
//! Every statement addresses exactly one physical table. Rows are identified
//! by a single key column: the primary key for entity tables, the owner's
//! join column for value-collection tables. Embedded values have already been
//! flattened into component columns by the time a statement is built.

use ormctx_core::{Value, quote_ident};
use std::fmt;

/// Kind of write statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
}

impl StatementKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `INSERT INTO table (...) VALUES (...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: String,
    /// Column values, in insertion order.
    pub values: Vec<(String, Value)>,
    /// Primary-key column of the table. `None` for keyless tables, such as
    /// the tables holding value collections.
    pub key: Option<String>,
    /// Primary-key column the store must generate a value for, if any.
    pub generated_key: Option<String>,
}

/// `UPDATE table SET ... WHERE key = ?`.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: String,
    pub set: Vec<(String, Value)>,
    pub key: (String, Value),
}

/// `DELETE FROM table WHERE key = ?`.
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: String,
    pub key: (String, Value),
}

/// A single-table write statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

impl Statement {
    pub fn kind(&self) -> StatementKind {
        match self {
            Statement::Insert(_) => StatementKind::Insert,
            Statement::Update(_) => StatementKind::Update,
            Statement::Delete(_) => StatementKind::Delete,
        }
    }

    /// Target table.
    pub fn table(&self) -> &str {
        match self {
            Statement::Insert(i) => &i.table,
            Statement::Update(u) => &u.table,
            Statement::Delete(d) => &d.table,
        }
    }

    /// Columns written by this statement (empty for DELETE).
    pub fn columns(&self) -> Vec<&str> {
        match self {
            Statement::Insert(i) => i.values.iter().map(|(c, _)| c.as_str()).collect(),
            Statement::Update(u) => u.set.iter().map(|(c, _)| c.as_str()).collect(),
            Statement::Delete(_) => Vec::new(),
        }
    }

    /// Value written to (or, for UPDATE/DELETE, matched on) a column.
    pub fn value_of(&self, column: &str) -> Option<&Value> {
        fn find<'a>(pairs: &'a [(String, Value)], column: &str) -> Option<&'a Value> {
            pairs.iter().find(|(c, _)| c == column).map(|(_, v)| v)
        }
        match self {
            Statement::Insert(i) => find(&i.values, column),
            Statement::Update(u) => {
                find(&u.set, column).or_else(|| (u.key.0 == column).then_some(&u.key.1))
            }
            Statement::Delete(d) => (d.key.0 == column).then_some(&d.key.1),
        }
    }

    /// Render as SQL text with `$n` placeholders.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        match self {
            Statement::Insert(i) => {
                let cols: Vec<String> = i.values.iter().map(|(c, _)| quote_ident(c)).collect();
                let placeholders: Vec<String> =
                    (1..=i.values.len()).map(|n| format!("${}", n)).collect();
                let mut sql = if cols.is_empty() {
                    format!("INSERT INTO {} DEFAULT VALUES", quote_ident(&i.table))
                } else {
                    format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        quote_ident(&i.table),
                        cols.join(", "),
                        placeholders.join(", ")
                    )
                };
                if let Some(key) = &i.generated_key {
                    sql.push_str(&format!(" RETURNING {}", quote_ident(key)));
                }
                let params = i.values.iter().map(|(_, v)| v.clone()).collect();
                (sql, params)
            }
            Statement::Update(u) => {
                let sets: Vec<String> = u
                    .set
                    .iter()
                    .enumerate()
                    .map(|(n, (c, _))| format!("{} = ${}", quote_ident(c), n + 1))
                    .collect();
                let sql = format!(
                    "UPDATE {} SET {} WHERE {} = ${}",
                    quote_ident(&u.table),
                    sets.join(", "),
                    quote_ident(&u.key.0),
                    u.set.len() + 1
                );
                let mut params: Vec<Value> = u.set.iter().map(|(_, v)| v.clone()).collect();
                params.push(u.key.1.clone());
                (sql, params)
            }
            Statement::Delete(d) => (
                format!(
                    "DELETE FROM {} WHERE {} = $1",
                    quote_ident(&d.table),
                    quote_ident(&d.key.0)
                ),
                vec![d.key.1.clone()],
            ),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql().0)
    }
}
