// ============================================================================
// In-memory relational engine
// ============================================================================
//
// Committed rows live in shared `Table`s behind one `tokio::sync::RwLock`.
// Each open transaction buffers its writes in a persistent `im::OrdMap`
// overlay, so a savepoint is a cheap clone of the overlay. Reads merge the
// committed state with the session's own overlay (read committed with
// read-your-writes).
//
// Commit validation is first-committer-wins: every row a transaction wrote
// remembers the committed version it was based on, and commit fails with
// SQLSTATE 40001 when another transaction committed that row in between.
// Constraints are checked per statement and again against the state being
// committed.
//
// ============================================================================

use super::eval::{sort_rows, ConditionEvaluator};
use super::table::Table;
use super::{SelectStatement, Statement, StatementResult, StorageEngine, StorageSession};
use crate::core::error::{FOREIGN_KEY_VIOLATION, SERIALIZATION_FAILURE, UNIQUE_VIOLATION};
use crate::core::{DbError, DefaultValue, EntityModel, Fields, Result, Value};
use crate::parser::{BoundStatement, Projection, SortKey};
use crate::query::{Direction, Predicate};
use async_trait::async_trait;
use im::OrdMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

type RowKey = (String, Value);

#[derive(Debug, Clone, PartialEq)]
enum PendingWrite {
    Put(Fields),
    Delete,
}

#[derive(Debug, Clone, Default)]
struct Overlay {
    writes: OrdMap<RowKey, PendingWrite>,
    /// Committed version each written row was based on; `None` when it did not exist.
    base_versions: OrdMap<RowKey, Option<u64>>,
}

impl Overlay {
    fn record(&mut self, db: &Database, key: RowKey, write: PendingWrite) {
        if !self.base_versions.contains_key(&key) {
            let base = db.tables.get(&key.0).and_then(|t| t.version_of(&key.1));
            self.base_versions.insert(key.clone(), base);
        }
        self.writes.insert(key, write);
    }
}

#[derive(Debug, Default)]
struct TxState {
    overlay: Overlay,
    savepoints: Vec<(String, Overlay)>,
}

#[derive(Debug, Default)]
struct Database {
    tables: HashMap<String, Table>,
    commit_version: u64,
}

/// Commit failures injected by tests to exercise driver-side error paths.
#[derive(Debug, Default)]
struct FaultPlan {
    commit_failures: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    db: Arc<RwLock<Database>>,
    faults: Arc<Mutex<FaultPlan>>,
    sessions: Arc<AtomicU64>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `times` commits fail with the given SQLSTATE.
    pub fn fail_next_commits(&self, code: &str, times: usize) {
        if let Ok(mut plan) = self.faults.lock() {
            plan.commit_failures
                .extend(std::iter::repeat_n(code.to_string(), times));
        }
    }

    /// Number of committed rows in a table.
    pub async fn row_count(&self, table: &str) -> Result<usize> {
        let db = self.db.read().await;
        Ok(table_ref(&db, table)?.len())
    }

    pub async fn tables(&self) -> Vec<String> {
        let db = self.db.read().await;
        let mut names: Vec<String> = db.tables.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn sessions_opened(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    async fn register_model(&self, model: Arc<EntityModel>) -> Result<()> {
        model.validate()?;
        let mut db = self.db.write().await;
        match db.tables.get(model.name()) {
            Some(existing) if existing.model().as_ref() == model.as_ref() => Ok(()),
            Some(_) => Err(DbError::Validation(format!(
                "Model '{}' is already registered with a different shape",
                model.name()
            ))),
            None => {
                debug!(table = model.name(), "Registered model");
                db.tables
                    .insert(model.name().to_string(), Table::new(model));
                Ok(())
            }
        }
    }

    async fn open_session(&self) -> Result<Box<dyn StorageSession>> {
        let id = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Box::new(MemorySession {
            id,
            db: Arc::clone(&self.db),
            faults: Arc::clone(&self.faults),
            tx: None,
        }))
    }
}

pub struct MemorySession {
    id: u64,
    db: Arc<RwLock<Database>>,
    faults: Arc<Mutex<FaultPlan>>,
    tx: Option<TxState>,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn take_injected_failure(&self) -> Option<DbError> {
        let mut plan = self.faults.lock().ok()?;
        if plan.commit_failures.is_empty() {
            return None;
        }
        let code = plan.commit_failures.remove(0);
        Some(DbError::from_sqlstate(&code, "injected commit failure"))
    }

    async fn run(&mut self, statement: Statement) -> Result<StatementResult> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| DbError::TransactionState("No transaction in progress".into()))?;

        match statement {
            Statement::Select(select) => {
                let db = self.db.read().await;
                let view = View::new(&db, &tx.overlay);
                view.select(&select).map(StatementResult::Rows)
            }
            Statement::Count { table, predicates } => {
                let db = self.db.read().await;
                let view = View::new(&db, &tx.overlay);
                let rows = view.filtered(&table, &predicates)?;
                Ok(StatementResult::Count(rows.len() as u64))
            }
            Statement::Insert { table, values } => {
                let mut db = self.db.write().await;
                let row = insert_row(&mut db, &mut tx.overlay, &table, values)?;
                Ok(StatementResult::Rows(vec![row]))
            }
            Statement::Update { table, id, values } => {
                let mut db = self.db.write().await;
                let row = update_row(&mut db, &mut tx.overlay, &table, &id, values)?;
                Ok(StatementResult::Rows(row.into_iter().collect()))
            }
            Statement::Delete { table, id } => {
                let mut db = self.db.write().await;
                let deleted = delete_row(&mut db, &mut tx.overlay, &table, &id)?;
                Ok(StatementResult::Affected(u64::from(deleted)))
            }
            Statement::Raw(bound) => {
                if bound.is_read_only() {
                    let db = self.db.read().await;
                    run_raw_select(&db, &tx.overlay, &bound)
                } else {
                    let mut db = self.db.write().await;
                    run_raw_write(&mut db, &mut tx.overlay, bound)
                }
            }
        }
    }
}

#[async_trait]
impl StorageSession for MemorySession {
    async fn begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(DbError::TransactionState(
                "Transaction already in progress".into(),
            ));
        }
        trace!(session = self.id, "BEGIN");
        self.tx = Some(TxState::default());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| DbError::TransactionState("No transaction to commit".into()))?;

        if let Some(err) = self.take_injected_failure() {
            warn!(session = self.id, error = %err, "Commit failed");
            return Err(err);
        }

        let mut db = self.db.write().await;

        for (key, base) in tx.overlay.base_versions.iter() {
            let current = db.tables.get(&key.0).and_then(|t| t.version_of(&key.1));
            if current == *base {
                continue;
            }
            let err = match base {
                None => DbError::constraint(
                    UNIQUE_VIOLATION,
                    format!("duplicate key value {} in '{}'", key.1, key.0),
                ),
                Some(_) => DbError::conflict(
                    SERIALIZATION_FAILURE,
                    format!(
                        "could not serialize access to '{}' row {} due to concurrent update",
                        key.0, key.1
                    ),
                ),
            };
            debug!(session = self.id, error = %err, "Commit rejected");
            return Err(err);
        }

        {
            let view = View::new(&db, &tx.overlay);
            for ((table, key), write) in tx.overlay.writes.iter() {
                match write {
                    PendingWrite::Put(row) => view.check_row(table, key, row)?,
                    PendingWrite::Delete => {
                        if let Some(old) = db.tables.get(table).and_then(|t| t.get(key)) {
                            view.check_not_referenced(table, &old.values)?;
                        }
                    }
                }
            }
        }

        db.commit_version += 1;
        let version = db.commit_version;
        let written = tx.overlay.writes.len();
        for ((table, key), write) in tx.overlay.writes {
            let Some(target) = db.tables.get_mut(&table) else {
                continue;
            };
            match write {
                PendingWrite::Put(row) => target.put(key, row, version),
                PendingWrite::Delete => {
                    target.remove(&key);
                }
            }
        }

        trace!(session = self.id, version, rows = written, "COMMIT");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.tx.take().is_none() {
            return Err(DbError::TransactionState(
                "No transaction to roll back".into(),
            ));
        }
        trace!(session = self.id, "ROLLBACK");
        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        let tx = self.tx.as_mut().ok_or_else(|| {
            DbError::TransactionState("SAVEPOINT requires a transaction".into())
        })?;
        tx.savepoints.push((name.to_string(), tx.overlay.clone()));
        trace!(session = self.id, savepoint = name, "SAVEPOINT");
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        let tx = self.tx.as_mut().ok_or_else(|| {
            DbError::TransactionState("RELEASE SAVEPOINT requires a transaction".into())
        })?;
        let pos = savepoint_position(&tx.savepoints, name)?;
        tx.savepoints.truncate(pos);
        trace!(session = self.id, savepoint = name, "RELEASE SAVEPOINT");
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        let tx = self.tx.as_mut().ok_or_else(|| {
            DbError::TransactionState("ROLLBACK TO SAVEPOINT requires a transaction".into())
        })?;
        let pos = savepoint_position(&tx.savepoints, name)?;
        tx.overlay = tx.savepoints[pos].1.clone();
        tx.savepoints.truncate(pos + 1);
        trace!(session = self.id, savepoint = name, "ROLLBACK TO SAVEPOINT");
        Ok(())
    }

    async fn execute(&mut self, statement: Statement) -> Result<StatementResult> {
        if self.tx.is_some() {
            return self.run(statement).await;
        }

        // Autocommit: one implicit transaction per statement.
        self.begin().await?;
        match self.run(statement).await {
            Ok(result) => {
                self.commit().await?;
                Ok(result)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback().await {
                    warn!(session = self.id, error = %rollback_err, "Autocommit rollback failed");
                }
                Err(err)
            }
        }
    }

    fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }
}

fn savepoint_position(savepoints: &[(String, Overlay)], name: &str) -> Result<usize> {
    savepoints
        .iter()
        .rposition(|(n, _)| n == name)
        .ok_or_else(|| DbError::TransactionState(format!("Savepoint '{}' does not exist", name)))
}

fn table_ref<'a>(db: &'a Database, name: &str) -> Result<&'a Table> {
    db.tables
        .get(name)
        .ok_or_else(|| DbError::from_sqlstate("42P01", format!("relation '{}' does not exist", name)))
}

fn table_mut<'a>(db: &'a mut Database, name: &str) -> Result<&'a mut Table> {
    db.tables
        .get_mut(name)
        .ok_or_else(|| DbError::from_sqlstate("42P01", format!("relation '{}' does not exist", name)))
}

// ============================================================================
// Merged view: committed rows + one session's overlay
// ============================================================================

struct View<'a> {
    db: &'a Database,
    overlay: &'a Overlay,
}

impl<'a> View<'a> {
    fn new(db: &'a Database, overlay: &'a Overlay) -> Self {
        Self { db, overlay }
    }

    fn get(&self, table: &str, key: &Value) -> Result<Option<Fields>> {
        let committed = table_ref(self.db, table)?;
        match self.overlay.writes.get(&(table.to_string(), key.clone())) {
            Some(PendingWrite::Put(row)) => Ok(Some(row.clone())),
            Some(PendingWrite::Delete) => Ok(None),
            None => Ok(committed.get(key).map(|row| row.values.clone())),
        }
    }

    /// All visible rows of a table in primary-key order.
    fn scan(&self, table: &str) -> Result<Vec<Fields>> {
        let committed = table_ref(self.db, table)?;
        let mut merged: BTreeMap<Value, Fields> = committed
            .rows()
            .map(|(key, row)| (key.clone(), row.values.clone()))
            .collect();

        for ((name, key), write) in self.overlay.writes.iter() {
            if name != table {
                continue;
            }
            match write {
                PendingWrite::Put(row) => {
                    merged.insert(key.clone(), row.clone());
                }
                PendingWrite::Delete => {
                    merged.remove(key);
                }
            }
        }

        Ok(merged.into_values().collect())
    }

    fn filtered(&self, table: &str, predicates: &[Predicate]) -> Result<Vec<Fields>> {
        let model = table_ref(self.db, table)?.model();
        for predicate in predicates {
            model.ensure_known(predicate.field())?;
        }
        let mut rows = self.scan(table)?;
        rows.retain(|row| predicates.iter().all(|p| p.matches(row)));
        Ok(rows)
    }

    fn select(&self, select: &SelectStatement) -> Result<Vec<Fields>> {
        let model = Arc::clone(table_ref(self.db, &select.table)?.model());
        let mut rows = self.filtered(&select.table, &select.predicates)?;

        let mut keys = Vec::with_capacity(select.order.len());
        for order in &select.order {
            model.ensure_known(&order.field)?;
            keys.push((order.field.clone(), order.direction == Direction::Desc));
        }
        sort_rows(&mut rows, &keys, model.primary_key());

        Ok(paginate(rows, select.offset, select.limit))
    }

    /// Unique and foreign-key checks for a row about to be written under `key`.
    fn check_row(&self, table: &str, key: &Value, row: &Fields) -> Result<()> {
        let model = table_ref(self.db, table)?.model();

        let unique: Vec<&str> = model
            .attributes()
            .iter()
            .filter(|a| a.unique && a.name != model.primary_key())
            .map(|a| a.name.as_str())
            .collect();
        if !unique.is_empty() {
            for other in self.scan(table)? {
                if other.get(model.primary_key()) == Some(key) {
                    continue;
                }
                for column in &unique {
                    let (Some(mine), Some(theirs)) = (row.get(*column), other.get(*column)) else {
                        continue;
                    };
                    if mine.sql_eq(theirs) {
                        return Err(DbError::constraint(
                            UNIQUE_VIOLATION,
                            format!(
                                "duplicate key value violates unique constraint on '{}.{}' ({})",
                                table, column, mine
                            ),
                        ));
                    }
                }
            }
        }

        for attr in model.attributes() {
            let Some(fk) = &attr.references else {
                continue;
            };
            let Some(value) = row.get(&attr.name).filter(|v| !v.is_null()) else {
                continue;
            };
            if !self.references_exist(&fk.table, &fk.column, value)? {
                return Err(DbError::constraint(
                    FOREIGN_KEY_VIOLATION,
                    format!(
                        "insert or update on '{}' violates foreign key '{}': {}={} is not present in '{}'",
                        table, attr.name, fk.column, value, fk.table
                    ),
                ));
            }
        }

        Ok(())
    }

    fn references_exist(&self, table: &str, column: &str, value: &Value) -> Result<bool> {
        let target = table_ref(self.db, table)?;
        if target.model().primary_key() == column {
            return Ok(self.get(table, value)?.is_some());
        }
        Ok(self
            .scan(table)?
            .iter()
            .any(|row| row.get(column).is_some_and(|v| v.sql_eq(value))))
    }

    /// Restrict semantics: a row may not be deleted while others reference it.
    fn check_not_referenced(&self, table: &str, row: &Fields) -> Result<()> {
        for referencing in self.db.tables.values() {
            for attr in referencing.model().attributes() {
                let Some(fk) = &attr.references else {
                    continue;
                };
                if fk.table != table {
                    continue;
                }
                let Some(target) = row.get(&fk.column).filter(|v| !v.is_null()) else {
                    continue;
                };
                let in_use = self
                    .scan(referencing.name())?
                    .iter()
                    .any(|other| other.get(&attr.name).is_some_and(|v| v.sql_eq(target)));
                if in_use {
                    return Err(DbError::constraint(
                        FOREIGN_KEY_VIOLATION,
                        format!(
                            "delete on '{}' violates foreign key '{}.{}': {} is still referenced",
                            table,
                            referencing.name(),
                            attr.name,
                            target
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn paginate(rows: Vec<Fields>, offset: usize, limit: Option<usize>) -> Vec<Fields> {
    let rows = rows.into_iter().skip(offset);
    match limit {
        Some(limit) => rows.take(limit).collect(),
        None => rows.collect(),
    }
}

// ============================================================================
// Writes
// ============================================================================

fn insert_row(db: &mut Database, overlay: &mut Overlay, table: &str, values: Fields) -> Result<Fields> {
    let target = table_mut(db, table)?;
    let model = Arc::clone(target.model());

    let mut values = values;
    for attr in model.attributes() {
        if attr.default != Some(DefaultValue::AutoIncrement) {
            continue;
        }
        match values.get(&attr.name) {
            None | Some(Value::Null) => {
                let next = target.next_sequence();
                values.insert(attr.name.clone(), Value::Integer(next));
            }
            Some(Value::Integer(explicit)) => target.observe_sequence(*explicit),
            Some(_) => {}
        }
    }
    let row = target.prepare_insert(values)?;
    let key = row
        .get(model.primary_key())
        .cloned()
        .unwrap_or(Value::Null);

    let view = View::new(db, overlay);
    if view.get(table, &key)?.is_some() {
        return Err(DbError::constraint(
            UNIQUE_VIOLATION,
            format!(
                "duplicate key value violates primary key of '{}' ({})",
                table, key
            ),
        ));
    }
    view.check_row(table, &key, &row)?;

    overlay.record(db, (table.to_string(), key), PendingWrite::Put(row.clone()));
    Ok(row)
}

fn update_row(
    db: &mut Database,
    overlay: &mut Overlay,
    table: &str,
    id: &Value,
    changes: Fields,
) -> Result<Option<Fields>> {
    let target = table_ref(db, table)?;
    let model = Arc::clone(target.model());
    let view = View::new(db, overlay);

    let Some(mut row) = view.get(table, id)? else {
        return Ok(None);
    };

    for (field, value) in changes {
        if field == model.primary_key() && !value.sql_eq(id) {
            return Err(DbError::Validation(format!(
                "Primary key '{}' of '{}' cannot be changed",
                field, table
            )));
        }
        row.insert(field, value);
    }
    let row = target.normalize(row)?;
    view.check_row(table, id, &row)?;

    overlay.record(db, (table.to_string(), id.clone()), PendingWrite::Put(row.clone()));
    Ok(Some(row))
}

fn delete_row(db: &mut Database, overlay: &mut Overlay, table: &str, id: &Value) -> Result<bool> {
    let view = View::new(db, overlay);
    let Some(row) = view.get(table, id)? else {
        return Ok(false);
    };
    view.check_not_referenced(table, &row)?;

    overlay.record(db, (table.to_string(), id.clone()), PendingWrite::Delete);
    Ok(true)
}

// ============================================================================
// Raw statements
// ============================================================================

fn run_raw_select(db: &Database, overlay: &Overlay, bound: &BoundStatement) -> Result<StatementResult> {
    let BoundStatement::Select {
        table,
        projection,
        filter,
        order,
        limit,
        offset,
    } = bound
    else {
        return Err(DbError::Execution("Expected a SELECT statement".into()));
    };

    let model = Arc::clone(table_ref(db, table)?.model());
    let view = View::new(db, overlay);

    let mut evaluator = ConditionEvaluator::new();
    let mut rows = Vec::new();
    for row in view.scan(table)? {
        let keep = match filter {
            Some(condition) => evaluator.matches(condition, &row)?,
            None => true,
        };
        if keep {
            rows.push(row);
        }
    }

    if let Projection::Count = projection {
        return Ok(StatementResult::Count(rows.len() as u64));
    }

    let keys = sort_keys(&model, order)?;
    sort_rows(&mut rows, &keys, model.primary_key());
    let rows = paginate(rows, *offset, *limit);

    match projection {
        Projection::Columns(columns) => {
            for column in columns {
                model.ensure_known(column)?;
            }
            let projected = rows
                .into_iter()
                .map(|row| {
                    columns
                        .iter()
                        .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                        .collect()
                })
                .collect();
            Ok(StatementResult::Rows(projected))
        }
        _ => Ok(StatementResult::Rows(rows)),
    }
}

fn sort_keys(model: &EntityModel, order: &[SortKey]) -> Result<Vec<(String, bool)>> {
    order
        .iter()
        .map(|key| {
            model.ensure_known(&key.column)?;
            Ok((key.column.clone(), key.descending))
        })
        .collect()
}

fn run_raw_write(db: &mut Database, overlay: &mut Overlay, bound: BoundStatement) -> Result<StatementResult> {
    match bound {
        BoundStatement::Insert {
            table,
            columns,
            rows,
        } => {
            let columns = match columns {
                Some(columns) => columns,
                None => table_ref(db, &table)?
                    .model()
                    .attributes()
                    .iter()
                    .map(|a| a.name.clone())
                    .collect(),
            };
            let mut inserted = 0u64;
            for values in rows {
                if values.len() != columns.len() {
                    return Err(DbError::Validation(format!(
                        "INSERT has {} columns but {} values",
                        columns.len(),
                        values.len()
                    )));
                }
                let fields: Fields = columns.iter().cloned().zip(values).collect();
                insert_row(db, overlay, &table, fields)?;
                inserted += 1;
            }
            Ok(StatementResult::Affected(inserted))
        }
        BoundStatement::Update {
            table,
            assignments,
            filter,
        } => {
            let targets = matching_keys(db, overlay, &table, filter.as_ref())?;
            let changes: Fields = assignments.into_iter().collect();
            let mut updated = 0u64;
            for id in targets {
                if update_row(db, overlay, &table, &id, changes.clone())?.is_some() {
                    updated += 1;
                }
            }
            Ok(StatementResult::Affected(updated))
        }
        BoundStatement::Delete { table, filter } => {
            let targets = matching_keys(db, overlay, &table, filter.as_ref())?;
            let mut deleted = 0u64;
            for id in targets {
                if delete_row(db, overlay, &table, &id)? {
                    deleted += 1;
                }
            }
            Ok(StatementResult::Affected(deleted))
        }
        BoundStatement::Select { .. } => run_raw_select(db, overlay, &bound),
    }
}

fn matching_keys(
    db: &Database,
    overlay: &Overlay,
    table: &str,
    filter: Option<&crate::parser::Condition>,
) -> Result<Vec<Value>> {
    let model = Arc::clone(table_ref(db, table)?.model());
    let view = View::new(db, overlay);
    let mut evaluator = ConditionEvaluator::new();

    let mut keys = Vec::new();
    for row in view.scan(table)? {
        let keep = match filter {
            Some(condition) => evaluator.matches(condition, &row)?,
            None => true,
        };
        if keep {
            keys.push(row.get(model.primary_key()).cloned().unwrap_or(Value::Null));
        }
    }
    Ok(keys)
}
