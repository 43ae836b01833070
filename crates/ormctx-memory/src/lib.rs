//! In-memory transactional store for ormctx.
//!
//! [`MemoryStore`] implements [`Storage`] by interpreting statements and read
//! plans directly, without SQL. It is meant for tests and embedding: tables
//! appear on first write, every write is logged, and failures can be injected
//! per table and statement kind.
//!
//! Handles are cheap clones sharing one database, so a test can keep a handle
//! to inspect rows while a unit of work owns another.

use ormctx_core::{Result, Row, StorageError, StorageErrorKind, Value};
use ormctx_query::{
    Condition, Executed, JoinType, QueryPlan, Select, Source, Statement, StatementKind, Storage,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Record = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default)]
struct Table {
    /// Column names in first-written order.
    columns: Vec<String>,
    rows: Vec<Record>,
    /// Primary-key column, learned from the first INSERT naming one. Tables
    /// without one hold value-collection rows.
    key: Option<String>,
    next_id: i64,
}

impl Table {
    fn learn_key(&mut self, column: &str) {
        if self.key.is_none() {
            self.key = Some(column.to_string());
        }
    }

    fn learn_columns<'a>(&mut self, columns: impl Iterator<Item = &'a String>) {
        for column in columns {
            if !self.columns.contains(column) {
                self.columns.push(column.clone());
            }
        }
    }

    fn contains_key(&self, value: &Value) -> bool {
        let Some(key) = &self.key else {
            return false;
        };
        self.rows
            .iter()
            .any(|row| row.get(key).is_some_and(|v| v.key_eq(value)))
    }

    fn matching(&self, column: &str, value: &Value) -> Vec<usize> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.get(column).is_some_and(|v| v.key_eq(value)))
            .map(|(i, _)| i)
            .collect()
    }
}

/// `table.column` must name an existing key of `referenced`.
#[derive(Debug, Clone)]
struct ForeignKey {
    table: String,
    column: String,
    referenced: String,
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<String, Table>,
    sequences: HashMap<String, i64>,
    foreign_keys: Vec<ForeignKey>,
    failures: Vec<(String, StatementKind)>,
    executed: Vec<Statement>,
    /// Table contents as of `begin`, restored on abort.
    saved: Option<BTreeMap<String, Table>>,
}

/// A shared in-memory database.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enforce that non-null values of `table.column` reference an existing
    /// row of `referenced`, and that referenced rows are not deleted while
    /// still referenced.
    pub fn with_foreign_key(
        self,
        table: impl Into<String>,
        column: impl Into<String>,
        referenced: impl Into<String>,
    ) -> Self {
        self.lock().foreign_keys.push(ForeignKey {
            table: table.into(),
            column: column.into(),
            referenced: referenced.into(),
        });
        self
    }

    /// Make every subsequent `kind` statement on `table` fail.
    pub fn fail_on(&self, table: impl Into<String>, kind: StatementKind) {
        self.lock().failures.push((table.into(), kind));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Every statement executed so far, including failed ones.
    pub fn executed(&self) -> Vec<Statement> {
        self.lock().executed.clone()
    }

    /// `(kind, table)` of every executed statement, in order.
    pub fn executed_summary(&self) -> Vec<(StatementKind, String)> {
        self.lock()
            .executed
            .iter()
            .map(|s| (s.kind(), s.table().to_string()))
            .collect()
    }

    /// Forget the statement log.
    pub fn clear_log(&self) {
        self.lock().executed.clear();
    }

    /// Current rows of `table`, columns in first-written order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        let inner = self.lock();
        let Some(t) = inner.tables.get(table) else {
            return Vec::new();
        };
        t.rows
            .iter()
            .map(|record| {
                let values = t
                    .columns
                    .iter()
                    .map(|c| record.get(c).cloned().unwrap_or(Value::Null))
                    .collect();
                Row::new(t.columns.clone(), values)
            })
            .collect()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Check whether a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.lock().saved.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn execute(&mut self, statement: &Statement) -> Result<Executed> {
        let kind = statement.kind();
        let table = statement.table();
        if self
            .failures
            .iter()
            .any(|(t, k)| t == table && *k == kind)
        {
            return Err(StorageError::new(
                StorageErrorKind::Database,
                format!("injected failure for {} on {}", kind, table),
            )
            .into());
        }

        match statement {
            Statement::Insert(insert) => {
                let mut record: Record = insert.values.iter().cloned().collect();
                let t = self.tables.entry(insert.table.clone()).or_default();
                if let Some(column) = insert.key.as_ref().or(insert.generated_key.as_ref()) {
                    t.learn_key(column);
                }
                let generated = match &insert.generated_key {
                    Some(column) => {
                        t.next_id = t.next_id.max(1);
                        let id = Value::BigInt(t.next_id);
                        t.next_id += 1;
                        record.insert(column.clone(), id.clone());
                        Some(id)
                    }
                    None => None,
                };

                // Keyless tables accept any row.
                if let Some(key_column) = t.key.clone() {
                    let key_value = record.get(&key_column).cloned().unwrap_or(Value::Null);
                    if key_value.is_null() {
                        return Err(StorageError::new(
                            StorageErrorKind::Constraint,
                            format!("{}.{} must not be null", insert.table, key_column),
                        )
                        .into());
                    }
                    if generated.is_none() && t.contains_key(&key_value) {
                        return Err(StorageError::new(
                            StorageErrorKind::Constraint,
                            format!(
                                "duplicate primary key {} in {}.{}",
                                key_value, insert.table, key_column
                            ),
                        )
                        .into());
                    }
                    if let Some(explicit) = key_value.as_i64() {
                        t.next_id = t.next_id.max(explicit + 1);
                    }
                }
                self.check_references(&insert.table, &record)?;

                let t = self.tables.entry(insert.table.clone()).or_default();
                t.learn_columns(record.keys());
                t.rows.push(record);
                Ok(match generated {
                    Some(id) => Executed::GeneratedKey(id),
                    None => Executed::RowsAffected(1),
                })
            }
            Statement::Update(update) => {
                let (column, value) = &update.key;
                let hits = match self.tables.get(&update.table) {
                    Some(t) => t.matching(column, value),
                    None => return Ok(Executed::RowsAffected(0)),
                };
                for &i in &hits {
                    let mut record = self.tables[&update.table].rows[i].clone();
                    record.extend(update.set.iter().cloned());
                    self.check_references(&update.table, &record)?;
                    if let Some(t) = self.tables.get_mut(&update.table) {
                        t.learn_columns(update.set.iter().map(|(c, _)| c));
                        t.rows[i] = record;
                    }
                }
                Ok(Executed::RowsAffected(hits.len() as u64))
            }
            Statement::Delete(delete) => {
                let (column, value) = &delete.key;
                let Some(t) = self.tables.get(&delete.table) else {
                    return Ok(Executed::RowsAffected(0));
                };
                if t.matching(column, value).is_empty() {
                    return Ok(Executed::RowsAffected(0));
                }
                if t.key.as_deref() == Some(column.as_str()) {
                    self.check_not_referenced(&delete.table, value)?;
                }
                let Some(t) = self.tables.get_mut(&delete.table) else {
                    return Ok(Executed::RowsAffected(0));
                };
                let before = t.rows.len();
                t.rows
                    .retain(|row| !row.get(column).is_some_and(|v| v.key_eq(value)));
                Ok(Executed::RowsAffected((before - t.rows.len()) as u64))
            }
        }
    }

    fn check_references(&self, table: &str, record: &Record) -> Result<()> {
        for fk in self.foreign_keys.iter().filter(|fk| fk.table == table) {
            let Some(value) = record.get(&fk.column).filter(|v| !v.is_null()) else {
                continue;
            };
            let exists = self
                .tables
                .get(&fk.referenced)
                .is_some_and(|t| t.contains_key(value));
            if !exists {
                return Err(StorageError::new(
                    StorageErrorKind::Constraint,
                    format!(
                        "{}.{} = {} references a missing row of {}",
                        table, fk.column, value, fk.referenced
                    ),
                )
                .into());
            }
        }
        Ok(())
    }

    fn check_not_referenced(&self, table: &str, key: &Value) -> Result<()> {
        for fk in self.foreign_keys.iter().filter(|fk| fk.referenced == table) {
            let referenced = self
                .tables
                .get(&fk.table)
                .is_some_and(|t| !t.matching(&fk.column, key).is_empty());
            if referenced {
                return Err(StorageError::new(
                    StorageErrorKind::Constraint,
                    format!(
                        "{} row {} is still referenced by {}.{}",
                        table, key, fk.table, fk.column
                    ),
                )
                .into());
            }
        }
        Ok(())
    }

    fn query(&self, plan: &QueryPlan) -> Vec<Row> {
        let mut out = Vec::new();
        for select in plan.branches() {
            out.extend(self.select(select));
        }
        out
    }

    fn select(&self, select: &Select) -> Vec<Row> {
        let empty = Table::default();
        let table = |name: &str| self.tables.get(name).unwrap_or(&empty);

        // Each binding maps alias to the joined record, `None` for a LEFT
        // JOIN without a match.
        let mut bindings: Vec<HashMap<&str, Option<&Record>>> = table(&select.from.table)
            .rows
            .iter()
            .map(|row| HashMap::from([(select.from.alias.as_str(), Some(row))]))
            .collect();

        for join in &select.joins {
            let right = table(&join.table.table);
            let mut next = Vec::with_capacity(bindings.len());
            for binding in bindings {
                let left = lookup(&binding, &join.left.alias, &join.left.column);
                let matches: Vec<&Record> = if left.is_null() {
                    Vec::new()
                } else {
                    right
                        .rows
                        .iter()
                        .filter(|row| row.get(&join.right.column).is_some_and(|v| v.key_eq(&left)))
                        .collect()
                };
                if matches.is_empty() {
                    if join.join_type == JoinType::Left {
                        let mut b = binding.clone();
                        b.insert(join.table.alias.as_str(), None);
                        next.push(b);
                    }
                    continue;
                }
                for row in matches {
                    let mut b = binding.clone();
                    b.insert(join.table.alias.as_str(), Some(row));
                    next.push(b);
                }
            }
            bindings = next;
        }

        let names: Vec<String> = select.projections.iter().map(|p| p.name.clone()).collect();
        bindings
            .into_iter()
            .filter(|b| {
                select.filters.iter().all(|condition: &Condition| {
                    let column = condition.column();
                    condition.matches(&lookup(b, &column.alias, &column.column))
                })
            })
            .map(|b| {
                let values = select
                    .projections
                    .iter()
                    .map(|p| match &p.source {
                        Source::Column(c) => lookup(&b, &c.alias, &c.column),
                        Source::Literal(v) => v.clone(),
                    })
                    .collect();
                Row::new(names.clone(), values)
            })
            .collect()
    }
}

fn lookup(binding: &HashMap<&str, Option<&Record>>, alias: &str, column: &str) -> Value {
    binding
        .get(alias)
        .copied()
        .flatten()
        .and_then(|row| row.get(column))
        .cloned()
        .unwrap_or(Value::Null)
}

impl Storage for MemoryStore {
    fn execute(&mut self, statement: &Statement) -> Result<Executed> {
        let mut inner = self.lock();
        inner.executed.push(statement.clone());
        let result = inner.execute(statement);
        match &result {
            Ok(outcome) => tracing::trace!(
                kind = %statement.kind(),
                table = statement.table(),
                rows = outcome.rows_affected(),
                "Executed"
            ),
            Err(e) => tracing::debug!(
                kind = %statement.kind(),
                table = statement.table(),
                error = %e,
                "Statement failed"
            ),
        }
        result
    }

    fn query(&mut self, plan: &QueryPlan) -> Result<Vec<Row>> {
        let rows = self.lock().query(plan);
        tracing::trace!(tables = ?plan.tables(), rows = rows.len(), "Queried");
        Ok(rows)
    }

    fn next_sequence_value(&mut self, sequence: &str) -> Result<Value> {
        let mut inner = self.lock();
        let next = inner.sequences.entry(sequence.to_string()).or_insert(0);
        *next += 1;
        Ok(Value::BigInt(*next))
    }

    fn begin(&mut self) -> Result<()> {
        let mut inner = self.lock();
        if inner.saved.is_some() {
            return Err(transaction_error("a transaction is already open"));
        }
        inner.saved = Some(inner.tables.clone());
        tracing::debug!("Transaction started");
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let mut inner = self.lock();
        if inner.saved.take().is_none() {
            return Err(transaction_error("no transaction is open"));
        }
        tracing::debug!("Transaction committed");
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        let mut inner = self.lock();
        let Some(saved) = inner.saved.take() else {
            return Err(transaction_error("no transaction is open"));
        };
        inner.tables = saved;
        tracing::debug!("Transaction aborted");
        Ok(())
    }
}

fn transaction_error(message: &str) -> ormctx_core::Error {
    StorageError::new(StorageErrorKind::Transaction, message).into()
}
