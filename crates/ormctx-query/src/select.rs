//! SELECT shapes used for entity reads.
//!
//! A [`Select`] reads one root table, optionally joins further tables on
//! column equality, projects named output columns and filters on simple
//! equality/membership predicates. That is all the inheritance strategies
//! need; richer SQL is the store's concern.

use ormctx_core::{Value, quote_ident};

/// A table with its alias inside a query.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub table: String,
    pub alias: String,
}

/// Qualified column reference, `alias.column`.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub alias: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(alias: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            column: column.into(),
        }
    }

    fn to_sql(&self) -> String {
        format!("{}.{}", quote_ident(&self.alias), quote_ident(&self.column))
    }
}

/// Types of joins used by read plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
}

impl JoinType {
    /// Get the SQL keyword for this join type.
    pub const fn as_str(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT JOIN",
        }
    }
}

/// `JOIN table alias ON left = right`.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub join_type: JoinType,
    pub table: TableRef,
    /// Column of an already-joined table.
    pub left: ColumnRef,
    /// Column of the joined table.
    pub right: ColumnRef,
}

/// Where a projected output column comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Column(ColumnRef),
    /// Constant, e.g. NULL padding or a type tag in a union branch.
    Literal(Value),
}

/// One output column of a SELECT.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub source: Source,
    /// Output column name.
    pub name: String,
}

/// Filter predicate. All predicates of a SELECT are AND-ed.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(ColumnRef, Value),
    In(ColumnRef, Vec<Value>),
}

impl Condition {
    /// The column this predicate tests.
    pub fn column(&self) -> &ColumnRef {
        match self {
            Condition::Eq(c, _) | Condition::In(c, _) => c,
        }
    }

    /// Check whether a value satisfies the predicate.
    ///
    /// NULL never matches, as in SQL.
    pub fn matches(&self, value: &Value) -> bool {
        if value.is_null() {
            return false;
        }
        match self {
            Condition::Eq(_, expected) => value.key_eq(expected),
            Condition::In(_, set) => set.iter().any(|v| value.key_eq(v)),
        }
    }
}

/// A single SELECT statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub from: TableRef,
    pub joins: Vec<Join>,
    pub projections: Vec<Projection>,
    pub filters: Vec<Condition>,
}

impl Select {
    /// Start a SELECT from `table AS alias`.
    pub fn from(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            from: TableRef {
                table: table.into(),
                alias: alias.into(),
            },
            joins: Vec::new(),
            projections: Vec::new(),
            filters: Vec::new(),
        }
    }

    /// Join `table AS alias ON left = alias.right_column`.
    pub fn join(
        mut self,
        join_type: JoinType,
        table: impl Into<String>,
        alias: impl Into<String>,
        left: ColumnRef,
        right_column: impl Into<String>,
    ) -> Self {
        let alias = alias.into();
        self.joins.push(Join {
            join_type,
            right: ColumnRef::new(alias.clone(), right_column),
            table: TableRef {
                table: table.into(),
                alias,
            },
            left,
        });
        self
    }

    /// Project `alias.column AS name`.
    pub fn column(mut self, column: ColumnRef, name: impl Into<String>) -> Self {
        self.projections.push(Projection {
            source: Source::Column(column),
            name: name.into(),
        });
        self
    }

    /// Project a constant as `name`.
    pub fn literal(mut self, value: Value, name: impl Into<String>) -> Self {
        self.projections.push(Projection {
            source: Source::Literal(value),
            name: name.into(),
        });
        self
    }

    /// Add a filter predicate.
    pub fn filter(mut self, condition: Condition) -> Self {
        self.filters.push(condition);
        self
    }

    /// All physical tables this SELECT reads, FROM table first.
    pub fn tables(&self) -> Vec<&str> {
        std::iter::once(self.from.table.as_str())
            .chain(self.joins.iter().map(|j| j.table.table.as_str()))
            .collect()
    }

    /// Output column names, in order.
    pub fn output_columns(&self) -> Vec<&str> {
        self.projections.iter().map(|p| p.name.as_str()).collect()
    }

    /// Render as SQL, numbering placeholders from `param_offset + 1`.
    pub fn to_sql_with_offset(&self, param_offset: usize) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let next_param = |value: &Value, params: &mut Vec<Value>| {
            params.push(value.clone());
            format!("${}", param_offset + params.len())
        };

        let cols: Vec<String> = self
            .projections
            .iter()
            .map(|p| {
                let expr = match &p.source {
                    Source::Column(c) => c.to_sql(),
                    Source::Literal(Value::Null) => "NULL".to_string(),
                    Source::Literal(v) => next_param(v, &mut params),
                };
                format!("{} AS {}", expr, quote_ident(&p.name))
            })
            .collect();

        let mut sql = format!(
            "SELECT {} FROM {} {}",
            if cols.is_empty() {
                "*".to_string()
            } else {
                cols.join(", ")
            },
            quote_ident(&self.from.table),
            quote_ident(&self.from.alias)
        );

        for join in &self.joins {
            sql.push_str(&format!(
                " {} {} {} ON {} = {}",
                join.join_type.as_str(),
                quote_ident(&join.table.table),
                quote_ident(&join.table.alias),
                join.left.to_sql(),
                join.right.to_sql()
            ));
        }

        if !self.filters.is_empty() {
            let preds: Vec<String> = self
                .filters
                .iter()
                .map(|cond| match cond {
                    Condition::Eq(c, v) => format!("{} = {}", c.to_sql(), next_param(v, &mut params)),
                    Condition::In(c, vs) => {
                        let list: Vec<String> =
                            vs.iter().map(|v| next_param(v, &mut params)).collect();
                        format!("{} IN ({})", c.to_sql(), list.join(", "))
                    }
                })
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&preds.join(" AND "));
        }

        (sql, params)
    }

    /// Render as SQL with `$n` placeholders.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        self.to_sql_with_offset(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_select() {
        let select = Select::from("products", "t0")
            .column(ColumnRef::new("t0", "id"), "id")
            .column(ColumnRef::new("t0", "product_type"), "product_type")
            .filter(Condition::In(
                ColumnRef::new("t0", "product_type"),
                vec!["FOOD".into(), "CLOTHING".into()],
            ));
        let (sql, params) = select.to_sql();
        assert_eq!(
            sql,
            "SELECT \"t0\".\"id\" AS \"id\", \"t0\".\"product_type\" AS \"product_type\" \
             FROM \"products\" \"t0\" WHERE \"t0\".\"product_type\" IN ($1, $2)"
        );
        assert_eq!(params, vec![Value::from("FOOD"), Value::from("CLOTHING")]);
        assert_eq!(select.output_columns(), vec!["id", "product_type"]);
    }

    #[test]
    fn test_join_and_literals() {
        let select = Select::from("items", "t0")
            .join(
                JoinType::Left,
                "books",
                "t1",
                ColumnRef::new("t0", "id"),
                "id",
            )
            .column(ColumnRef::new("t0", "id"), "id")
            .literal(Value::Null, "isbn")
            .literal(Value::from("Book"), "__entity")
            .filter(Condition::Eq(ColumnRef::new("t0", "id"), Value::BigInt(3)));
        let (sql, params) = select.to_sql_with_offset(2);
        assert_eq!(
            sql,
            "SELECT \"t0\".\"id\" AS \"id\", NULL AS \"isbn\", $3 AS \"__entity\" \
             FROM \"items\" \"t0\" LEFT JOIN \"books\" \"t1\" ON \"t0\".\"id\" = \"t1\".\"id\" \
             WHERE \"t0\".\"id\" = $4"
        );
        assert_eq!(params, vec![Value::from("Book"), Value::BigInt(3)]);
        assert_eq!(select.tables(), vec!["items", "books"]);
    }

    #[test]
    fn test_condition_matches() {
        let c = Condition::Eq(ColumnRef::new("t", "x"), Value::BigInt(1));
        assert!(c.matches(&Value::BigInt(1)));
        assert!(!c.matches(&Value::BigInt(2)));
        assert!(!Condition::Eq(ColumnRef::new("t", "x"), Value::Null).matches(&Value::Null));
    }
}
