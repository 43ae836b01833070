//! The storage collaborator contract.

use crate::plan::QueryPlan;
use crate::statement::Statement;
use ormctx_core::{Result, Row, Value};

/// Outcome of executing a write statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Executed {
    /// Number of rows the statement touched.
    RowsAffected(u64),
    /// Key the store generated for an INSERT with a generated key column.
    GeneratedKey(Value),
}

impl Executed {
    /// Rows touched; a generated key implies one inserted row.
    pub fn rows_affected(&self) -> u64 {
        match self {
            Executed::RowsAffected(n) => *n,
            Executed::GeneratedKey(_) => 1,
        }
    }

    pub fn generated_key(&self) -> Option<&Value> {
        match self {
            Executed::GeneratedKey(v) => Some(v),
            Executed::RowsAffected(_) => None,
        }
    }
}

/// A transactional tabular store.
///
/// A unit of work owns its store exclusively for its whole lifetime, so every
/// method takes `&mut self`. All calls are blocking: a call returns once the
/// store has acknowledged it.
///
/// # Example
///
/// ```rust,ignore
/// store.begin()?;
/// let id = store.execute(&insert)?.generated_key().cloned();
/// let rows = store.query(&plan)?;
/// store.commit()?;
/// ```
pub trait Storage {
    /// Execute a single-table write.
    ///
    /// An INSERT carrying `generated_key` must answer with
    /// [`Executed::GeneratedKey`].
    fn execute(&mut self, statement: &Statement) -> Result<Executed>;

    /// Run a read plan. Each row exposes the plan's output column names.
    fn query(&mut self, plan: &QueryPlan) -> Result<Vec<Row>>;

    /// Draw the next value of a named sequence.
    fn next_sequence_value(&mut self, sequence: &str) -> Result<Value>;

    /// Begin a transaction.
    fn begin(&mut self) -> Result<()>;

    /// Commit the current transaction.
    fn commit(&mut self) -> Result<()>;

    /// Abort the current transaction, discarding its writes.
    fn abort(&mut self) -> Result<()>;
}

impl<S: Storage + ?Sized> Storage for &mut S {
    fn execute(&mut self, statement: &Statement) -> Result<Executed> {
        (**self).execute(statement)
    }

    fn query(&mut self, plan: &QueryPlan) -> Result<Vec<Row>> {
        (**self).query(plan)
    }

    fn next_sequence_value(&mut self, sequence: &str) -> Result<Value> {
        (**self).next_sequence_value(sequence)
    }

    fn begin(&mut self) -> Result<()> {
        (**self).begin()
    }

    fn commit(&mut self) -> Result<()> {
        (**self).commit()
    }

    fn abort(&mut self) -> Result<()> {
        (**self).abort()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executed_accessors() {
        let key = Executed::GeneratedKey(Value::BigInt(5));
        assert_eq!(key.rows_affected(), 1);
        assert_eq!(key.generated_key(), Some(&Value::BigInt(5)));

        let rows = Executed::RowsAffected(0);
        assert_eq!(rows.rows_affected(), 0);
        assert_eq!(rows.generated_key(), None);
    }
}
