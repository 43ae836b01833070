//! Flush ordering and execution.
//!
//! Writes are expanded into one operation per physical table and executed in
//! an order that respects foreign keys:
//! - DELETE child-first (descending table rank)
//! - INSERT parent-first (ascending table rank); inside one table an INSERT
//!   waits for the pending INSERT its owning references point at
//! - UPDATE after the INSERTs their foreign keys reference
//! - An UPDATE that moves or clears an owning foreign key runs before the
//!   DELETEs of rows of the type it used to reference
//!
//! Operations are scheduled over that dependency graph. Among ready
//! operations DELETEs go first, then INSERTs by rank, then UPDATEs, each in
//! enqueue order. A reference cycle between pending INSERTs falls back to
//! enqueue order.
//!
//! Statements are rendered lazily, right before they run, so an id generated
//! by one INSERT is visible to every later statement that references it.

use crate::instance::{Association, EntityRef, LifecycleState};
use ormctx_core::{EntityKey, Error, Result, StorageError, StorageErrorKind, Value};
use ormctx_query::{Statement, StatementKind, Storage};
use ormctx_schema::{EntityMeta, RowImage, SchemaRegistry, WriteScope, targets_for};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

/// One instance's pending write.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    kind: StatementKind,
    instance: EntityRef,
    /// Identity-map key at the time the write was queued.
    key: EntityKey,
    /// Changed members, for updates.
    changed: BTreeSet<String>,
}

impl PendingWrite {
    pub fn insert(key: EntityKey, instance: EntityRef) -> Self {
        Self {
            kind: StatementKind::Insert,
            instance,
            key,
            changed: BTreeSet::new(),
        }
    }

    pub fn update(key: EntityKey, instance: EntityRef, changed: BTreeSet<String>) -> Self {
        Self {
            kind: StatementKind::Update,
            instance,
            key,
            changed,
        }
    }

    pub fn delete(key: EntityKey, instance: EntityRef) -> Self {
        Self {
            kind: StatementKind::Delete,
            instance,
            key,
            changed: BTreeSet::new(),
        }
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn instance(&self) -> &EntityRef {
        &self.instance
    }

    /// Key to report on failure: the real key once the id is known.
    fn failing_key(&self) -> EntityKey {
        match self.instance.id() {
            Some(id) if self.key.is_provisional() => EntityKey::new(self.key.entity(), id),
            _ => self.key.clone(),
        }
    }

    /// Whether the write sets the owning association `edge`.
    fn writes_edge(&self, edge: &str) -> bool {
        match self.kind {
            StatementKind::Insert => true,
            StatementKind::Update => self.changed.contains(edge),
            StatementKind::Delete => false,
        }
    }
}

/// One statement slot: a write restricted to one table.
#[derive(Debug, Clone)]
struct TableOp {
    write: usize,
    table: String,
    rank: usize,
}

/// Ordering constraints between table operations.
#[derive(Debug)]
struct Dependencies {
    successors: Vec<Vec<usize>>,
    blockers: Vec<usize>,
}

impl Dependencies {
    fn new(ops: usize) -> Self {
        Self {
            successors: vec![Vec::new(); ops],
            blockers: vec![0; ops],
        }
    }

    fn before(&mut self, first: usize, then: usize) {
        if first != then {
            self.successors[first].push(then);
            self.blockers[then] += 1;
        }
    }
}

/// Orders pending writes for flush using the registry's table ranks.
#[derive(Debug)]
pub struct FlushOrderer {
    registry: Arc<SchemaRegistry>,
}

impl FlushOrderer {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    /// Expand and order `writes` into a flush plan.
    pub fn order(&self, writes: Vec<PendingWrite>) -> Result<FlushPlan> {
        let mut ops = Vec::new();
        // Each write's operations, in the order they must run.
        let mut own: Vec<Vec<usize>> = Vec::with_capacity(writes.len());
        for (index, write) in writes.iter().enumerate() {
            let meta = self.registry.entity(&write.instance.entity())?;
            let mut tables: Vec<&str> = meta.write_tables().iter().map(String::as_str).collect();
            for member in meta.collections() {
                if write.kind == StatementKind::Update && !write.changed.contains(&member.field.name)
                {
                    continue;
                }
                tables.extend(member.field.collection_table());
            }
            let mut slots: Vec<TableOp> = tables
                .into_iter()
                .map(|table| TableOp {
                    write: index,
                    table: table.to_string(),
                    rank: self.registry.table_rank(table),
                })
                .collect();
            match write.kind {
                StatementKind::Delete => slots.sort_by(|a, b| b.rank.cmp(&a.rank)),
                _ => slots.sort_by_key(|op| op.rank),
            }
            let first = ops.len();
            ops.extend(slots);
            own.push((first..ops.len()).collect());
        }

        let deps = self.dependencies(&writes, &ops, &own)?;
        let order = schedule(&writes, &ops, deps);
        let ops = order.into_iter().map(|i| ops[i].clone()).collect();

        Ok(FlushPlan {
            registry: Arc::clone(&self.registry),
            writes,
            ops,
        })
    }

    fn dependencies(
        &self,
        writes: &[PendingWrite],
        ops: &[TableOp],
        own: &[Vec<usize>],
    ) -> Result<Dependencies> {
        let mut deps = Dependencies::new(ops.len());
        for chain in own {
            for pair in chain.windows(2) {
                deps.before(pair[0], pair[1]);
            }
        }

        let inserts: HashMap<usize, usize> = writes
            .iter()
            .enumerate()
            .filter(|(_, w)| w.kind == StatementKind::Insert)
            .map(|(i, w)| (w.instance.addr(), i))
            .collect();
        let deletes: Vec<usize> = (0..writes.len())
            .filter(|&i| writes[i].kind == StatementKind::Delete)
            .collect();

        for (index, write) in writes.iter().enumerate() {
            if write.kind == StatementKind::Delete {
                continue;
            }
            let meta = self.registry.entity(&write.instance.entity())?;
            let links: Vec<(&str, Option<usize>)> = {
                let guard = write.instance.read();
                meta.owning_edges()
                    .filter(|member| write.writes_edge(&member.edge.name))
                    .map(|member| {
                        let target = match guard.association(&member.edge.name) {
                            Some(Association::One(Some(target))) => Some(target.addr()),
                            _ => None,
                        };
                        (member.edge.target.as_str(), target)
                    })
                    .collect()
            };
            let (Some(&first), Some(&last)) = (own[index].first(), own[index].last()) else {
                continue;
            };
            for (target_type, target) in links {
                if let Some(&parent) = target.and_then(|addr| inserts.get(&addr)) {
                    if let Some(&key_op) = own[parent].first() {
                        deps.before(key_op, first);
                    }
                }
                if write.kind != StatementKind::Update {
                    continue;
                }
                // The old target may be among the rows being deleted.
                for &removed in &deletes {
                    let entity = writes[removed].instance.entity();
                    if !self.registry.is_subtype(&entity, target_type) {
                        continue;
                    }
                    if let Some(&op) = own[removed].first() {
                        deps.before(last, op);
                    }
                }
            }
        }

        let mut by_rank: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, op) in ops.iter().enumerate() {
            if writes[op.write].kind == StatementKind::Delete {
                by_rank.entry(op.rank).or_default().push(i);
            }
        }
        let groups: Vec<&Vec<usize>> = by_rank.values().rev().collect();
        for pair in groups.windows(2) {
            for &child in pair[0] {
                for &parent in pair[1] {
                    deps.before(child, parent);
                }
            }
        }
        Ok(deps)
    }
}

/// Topologically order `ops`, preferring DELETE, then INSERT by rank, then
/// UPDATE, then enqueue order.
fn schedule(writes: &[PendingWrite], ops: &[TableOp], mut deps: Dependencies) -> Vec<usize> {
    let priority = |i: usize| {
        let op = &ops[i];
        match writes[op.write].kind {
            StatementKind::Delete => (0u8, usize::MAX - op.rank, i),
            StatementKind::Insert => (1, op.rank, i),
            StatementKind::Update => (2, 0, i),
        }
    };

    let mut ready: BTreeSet<(u8, usize, usize)> = (0..ops.len())
        .filter(|&i| deps.blockers[i] == 0)
        .map(priority)
        .collect();
    let mut done = vec![false; ops.len()];
    let mut order = Vec::with_capacity(ops.len());

    while order.len() < ops.len() {
        let next = match ready.pop_first() {
            Some((_, _, i)) => i,
            None => {
                let Some(i) = (0..ops.len())
                    .filter(|&i| !done[i])
                    .min_by_key(|&i| priority(i))
                else {
                    break;
                };
                let write = &writes[ops[i].write];
                tracing::warn!(
                    table = %ops[i].table,
                    key = %write.key,
                    "Reference cycle between pending inserts, using enqueue order"
                );
                i
            }
        };
        done[next] = true;
        order.push(next);
        for &then in &deps.successors[next] {
            deps.blockers[then] = deps.blockers[then].saturating_sub(1);
            if deps.blockers[then] == 0 && !done[then] {
                ready.insert(priority(then));
            }
        }
    }
    order
}

/// Ordered table operations ready to execute.
#[derive(Debug)]
pub struct FlushPlan {
    registry: Arc<SchemaRegistry>,
    writes: Vec<PendingWrite>,
    ops: Vec<TableOp>,
}

impl FlushPlan {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Number of table operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Tables in execution order, with the kind of write each belongs to.
    pub fn sequence(&self) -> Vec<(StatementKind, &str)> {
        self.ops
            .iter()
            .map(|op| (self.writes[op.write].kind, op.table.as_str()))
            .collect()
    }

    /// Execute every statement, stopping at the first failure.
    ///
    /// A failure is reported as [`Error::Flush`] carrying the key of the
    /// instance whose statement failed.
    #[tracing::instrument(level = "info", skip(self, storage))]
    pub fn execute<S: Storage + ?Sized>(&self, storage: &mut S) -> Result<FlushResult> {
        let count = |kind: StatementKind| self.writes.iter().filter(|w| w.kind == kind).count();
        tracing::info!(
            deletes = count(StatementKind::Delete),
            inserts = count(StatementKind::Insert),
            updates = count(StatementKind::Update),
            ops = self.ops.len(),
            "Executing flush plan"
        );

        let start = Instant::now();
        let mut result = FlushResult::default();

        for op in &self.ops {
            let write = &self.writes[op.write];
            self.execute_op(storage, write, &op.table, &mut result)
                .map_err(|e| Error::flush(write.failing_key(), e))?;
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            "Flush complete"
        );

        Ok(result)
    }

    /// Render and run the statements `write` has for `table`, counting each
    /// one into `result`.
    fn execute_op<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        write: &PendingWrite,
        table: &str,
        result: &mut FlushResult,
    ) -> Result<()> {
        let entity = write.instance.entity();
        let meta = self.registry.entity(&entity)?;
        let image = row_image(meta, &write.instance)?;
        let scope = match write.kind {
            StatementKind::Insert => WriteScope::Insert,
            StatementKind::Update => WriteScope::Update(&write.changed),
            StatementKind::Delete => WriteScope::Delete,
        };
        // Rows of value collections may legitimately be absent.
        let keyed = meta.write_tables().iter().any(|t| t == table);

        for statement in targets_for(&self.registry, &entity, &image, scope)?
            .into_iter()
            .filter(|s| s.table() == table)
        {
            if let Statement::Insert(insert) = &statement {
                if keyed && insert.generated_key.is_none() && image.id.is_none() {
                    return Err(Error::illegal_state(
                        entity,
                        "flush",
                        format!("no primary key available for table '{}'", table),
                    ));
                }
            }

            tracing::trace!(sql = %statement.to_sql().0, key = %write.key, "Executing");
            let executed = storage
                .execute(&statement)
                .map_err(|e| attach_sql(e, &statement))?;

            match &statement {
                Statement::Insert(insert) if insert.generated_key.is_some() => {
                    let Some(id) = executed.generated_key().cloned() else {
                        return Err(StorageError::new(
                            StorageErrorKind::Database,
                            format!("store returned no generated key for '{}'", table),
                        )
                        .into());
                    };
                    tracing::debug!(key = %write.key, id = %id, "Back-filled generated key");
                    write.instance.write().set_id(Some(id));
                }
                Statement::Update(_) | Statement::Delete(_)
                    if keyed && executed.rows_affected() == 0 =>
                {
                    return Err(StorageError::new(
                        StorageErrorKind::StaleRow,
                        format!(
                            "{} on '{}' matched no row for {}",
                            statement.kind(),
                            table,
                            write.key
                        ),
                    )
                    .into());
                }
                _ => {}
            }
            match statement.kind() {
                StatementKind::Delete => result.deleted += 1,
                StatementKind::Insert => result.inserted += 1,
                StatementKind::Update => result.updated += 1,
            }
        }
        Ok(())
    }
}

fn attach_sql(err: Error, statement: &Statement) -> Error {
    match err {
        Error::Storage(e) if e.sql.is_none() => Error::Storage(e.with_sql(statement.to_sql().0)),
        other => other,
    }
}

/// Current values of `instance` as a row image, with owning associations
/// resolved to foreign-key values.
pub(crate) fn row_image(meta: &EntityMeta, instance: &EntityRef) -> Result<RowImage> {
    let guard = instance.read();
    let mut image = RowImage::new(guard.id().cloned());
    image.values = guard.fields().clone();

    for member in meta.owning_edges() {
        let name = &member.edge.name;
        let fk = match guard.association(name) {
            None | Some(Association::One(None)) | Some(Association::Unfetched(None)) => {
                Value::Null
            }
            Some(Association::Unfetched(Some(fk))) => fk.clone(),
            Some(Association::One(Some(target))) => foreign_key(meta.name(), name, target)?,
            Some(Association::Many(_)) => {
                return Err(Error::illegal_state(
                    meta.name(),
                    "flush",
                    format!("'{}' is a single-valued association", name),
                ));
            }
        };
        image.values.insert(name.clone(), fk);
    }
    Ok(image)
}

fn foreign_key(entity: &str, edge: &str, target: &EntityRef) -> Result<Value> {
    let guard = target.read();
    if guard.state() == LifecycleState::Transient {
        return Err(Error::illegal_state(
            entity,
            "flush",
            format!(
                "'{}' references a transient {} that was never persisted",
                edge,
                guard.entity()
            ),
        ));
    }
    guard.id().cloned().ok_or_else(|| {
        Error::illegal_state(
            entity,
            "flush",
            format!("'{}' references a {} without a primary key", edge, guard.entity()),
        )
    })
}

/// Result of a flush operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of INSERT statements executed.
    pub inserted: usize,
    /// Number of UPDATE statements executed.
    pub updated: usize,
    /// Number of DELETE statements executed.
    pub deleted: usize,
}

impl FlushResult {
    /// Total number of statements executed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}
