//! Read plans handed to the storage collaborator.

use crate::select::Select;
use ormctx_core::Value;

/// Type of set operation combining plan branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOpType {
    /// UNION ALL - combines results, keeps duplicates
    UnionAll,
}

impl SetOpType {
    /// Get the SQL keyword for this set operation.
    pub const fn as_sql(&self) -> &'static str {
        match self {
            SetOpType::UnionAll => "UNION ALL",
        }
    }
}

/// A structured read query.
///
/// Stores may render it with [`QueryPlan::to_sql`] or evaluate its structure
/// directly. Every branch of a union projects the same output columns in the
/// same order.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryPlan {
    Select(Select),
    Compound {
        op: SetOpType,
        branches: Vec<Select>,
    },
}

impl QueryPlan {
    /// Combine SELECTs with UNION ALL. A single branch stays a plain SELECT.
    pub fn union_all(mut branches: Vec<Select>) -> Self {
        if branches.len() == 1 {
            if let Some(only) = branches.pop() {
                return QueryPlan::Select(only);
            }
        }
        QueryPlan::Compound {
            op: SetOpType::UnionAll,
            branches,
        }
    }

    /// The SELECTs making up this plan.
    pub fn branches(&self) -> &[Select] {
        match self {
            QueryPlan::Select(s) => std::slice::from_ref(s),
            QueryPlan::Compound { branches, .. } => branches,
        }
    }

    pub fn branches_mut(&mut self) -> &mut [Select] {
        match self {
            QueryPlan::Select(s) => std::slice::from_mut(s),
            QueryPlan::Compound { branches, .. } => branches,
        }
    }

    /// Check whether this plan is a UNION ALL of several branches.
    pub fn is_union(&self) -> bool {
        matches!(self, QueryPlan::Compound { op: SetOpType::UnionAll, .. })
    }

    /// Distinct physical tables read by the plan, in first-seen order.
    pub fn tables(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for table in self.branches().iter().flat_map(Select::tables) {
            if !out.contains(&table) {
                out.push(table);
            }
        }
        out
    }

    /// Render as SQL with `$n` placeholders numbered across branches.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        match self {
            QueryPlan::Select(s) => s.to_sql(),
            QueryPlan::Compound { op, branches } => {
                let mut parts = Vec::with_capacity(branches.len());
                let mut params = Vec::new();
                for branch in branches {
                    let (sql, branch_params) = branch.to_sql_with_offset(params.len());
                    parts.push(sql);
                    params.extend(branch_params);
                }
                let sep = format!(" {} ", op.as_sql());
                (parts.join(&sep), params)
            }
        }
    }
}

impl From<Select> for QueryPlan {
    fn from(select: Select) -> Self {
        QueryPlan::Select(select)
    }
}
