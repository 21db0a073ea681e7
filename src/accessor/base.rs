use super::{Filter, Page, PageRequest, WriteOptions, sanitize::Redactor};
use crate::core::model::{CREATED_AT, UPDATED_AT};
use crate::core::{DbError, EntityModel, Fields, Record, Result, Value};
use crate::parser::{BoundStatement, Projection, RawSqlGuard};
use crate::query::{
    Association, AssociationKind, Direction, OrderBy, Pagination, Predicate,
    QueryConditionBuilder, QueryDescriptor,
};
use crate::result::QueryResult;
use crate::storage::{SelectStatement, Statement, StatementResult};
use crate::transaction::TransactionManager;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Generic CRUD accessor for one entity model.
///
/// Accessors are cheap to clone and hold no connection of their own; each
/// call borrows one from the pool unless a transaction is in scope.
#[derive(Clone)]
pub struct BaseAccessor {
    model: Arc<EntityModel>,
    transactions: Arc<TransactionManager>,
    redactor: Arc<Redactor>,
    raw_guard: Arc<RawSqlGuard>,
    max_page_size: usize,
}

impl BaseAccessor {
    pub fn new(
        model: Arc<EntityModel>,
        transactions: Arc<TransactionManager>,
        redactor: Arc<Redactor>,
        max_page_size: usize,
    ) -> Self {
        Self {
            model,
            transactions,
            redactor,
            raw_guard: Arc::new(RawSqlGuard::new()),
            max_page_size: max_page_size.max(1),
        }
    }

    pub fn model(&self) -> &Arc<EntityModel> {
        &self.model
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    /// A query builder preconfigured with this accessor's page size limit.
    pub fn query(&self) -> QueryConditionBuilder {
        QueryConditionBuilder::new().with_max_page_size(self.max_page_size)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Inserts one record and returns it with generated attributes filled in.
    ///
    /// # Errors
    /// `Validation` for unknown attributes, wrong types or missing required
    /// attributes; `Constraint` for unique and foreign-key violations.
    pub async fn create(&self, attributes: Fields, options: &WriteOptions) -> Result<Record> {
        let started = Instant::now();
        let result = self.insert(attributes.clone(), options).await;
        self.log_write("create", &attributes, started, options, &result);
        result
    }

    /// Inserts every row in one transaction scope: all rows or none.
    pub async fn bulk_create(
        &self,
        rows: Vec<Fields>,
        options: &WriteOptions,
    ) -> Result<Vec<Record>> {
        let started = Instant::now();
        let count = rows.len();

        let result = match &options.transaction {
            Some(ctx) => self.insert_all(rows, &WriteOptions::in_transaction(ctx)).await,
            None => {
                self.transactions
                    .with_transaction(|ctx| async move {
                        self.insert_all(rows, &WriteOptions::in_transaction(&ctx)).await
                    })
                    .await
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(
                operation = "bulk_create",
                entity = self.model.name(),
                rows = count,
                elapsed_ms,
                transaction = ?self.transaction_label(options),
                "write"
            ),
            Err(err) => warn!(
                operation = "bulk_create",
                entity = self.model.name(),
                rows = count,
                elapsed_ms,
                transaction = ?self.transaction_label(options),
                error = %err,
                "write failed"
            ),
        }
        result
    }

    /// Applies `attributes` to the record with primary key `id`.
    ///
    /// # Errors
    /// `NotFound` when no record has that key; `Validation` when the change
    /// would alter the primary key.
    pub async fn update_by_id(
        &self,
        id: impl Into<Value>,
        attributes: Fields,
        options: &WriteOptions,
    ) -> Result<Record> {
        let id = id.into();
        let started = Instant::now();
        let result = self.update(&id, attributes.clone(), options).await;
        self.log_write("update_by_id", &attributes, started, options, &result);
        result
    }

    /// Removes the record if present. Returns whether a row was removed.
    pub async fn delete_by_id(&self, id: impl Into<Value>, options: &WriteOptions) -> Result<bool> {
        let id = id.into();
        let started = Instant::now();
        let statement = Statement::Delete {
            table: self.model.name().to_string(),
            id: id.clone(),
        };
        let result = self
            .run(statement, options)
            .await
            .map(|outcome| outcome.count() > 0);

        let mut key = Fields::new();
        key.insert(self.model.primary_key().to_string(), id);
        self.log_write("delete_by_id", &key, started, options, &result);
        result
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn find_by_id(&self, id: impl Into<Value>) -> Result<Option<Record>> {
        self.find_by_id_in(id, &WriteOptions::default()).await
    }

    /// `find_by_id` inside an explicitly passed transaction.
    pub async fn find_by_id_in(
        &self,
        id: impl Into<Value>,
        options: &WriteOptions,
    ) -> Result<Option<Record>> {
        let mut select = SelectStatement::new(self.model.name());
        select.predicates.push(Predicate::Eq {
            field: self.model.primary_key().to_string(),
            value: id.into(),
        });
        select.limit = Some(1);

        let rows = self.run(Statement::Select(select), options).await?;
        Ok(rows.into_rows().into_iter().next().map(Record::new))
    }

    /// Records matching `filter` and the descriptor's predicates, in the
    /// descriptor's order (primary key ascending by default).
    ///
    /// A descriptor predicate replaces a filter entry on the same field.
    pub async fn find_all(
        &self,
        filter: &Filter,
        query: Option<&QueryDescriptor>,
    ) -> Result<Vec<Record>> {
        let started = Instant::now();
        let mut select = SelectStatement::new(self.model.name());
        select.predicates = self.predicates(filter, query)?;
        select.order = self.ordering(query)?;
        if let Some(pagination) = query.and_then(QueryDescriptor::pagination) {
            select.limit = Some(pagination.size);
            select.offset = pagination.offset();
        }

        let rows = self
            .run(Statement::Select(select), &WriteOptions::default())
            .await
            .inspect_err(|err| {
                warn!(operation = "find_all", entity = self.model.name(), error = %err, "read failed")
            })?;
        let mut records: Vec<Record> = rows.into_rows().into_iter().map(Record::new).collect();

        if let Some(query) = query {
            for association in query.includes() {
                self.load_association(&mut records, association).await?;
            }
        }

        debug!(
            operation = "find_all",
            entity = self.model.name(),
            rows = records.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "read"
        );
        Ok(records)
    }

    pub async fn find_one(
        &self,
        filter: &Filter,
        query: Option<&QueryDescriptor>,
    ) -> Result<Option<Record>> {
        let mut descriptor = query.cloned().unwrap_or_default();
        descriptor.pagination = Some(Pagination { page: 1, size: 1 });
        Ok(self.find_all(filter, Some(&descriptor)).await?.into_iter().next())
    }

    /// Number of records matching the same predicates `find_all` would use.
    /// Pagination and ordering are ignored.
    pub async fn count(&self, filter: &Filter, query: Option<&QueryDescriptor>) -> Result<u64> {
        let statement = Statement::Count {
            table: self.model.name().to_string(),
            predicates: self.predicates(filter, query)?,
        };
        let outcome = self.run(statement, &WriteOptions::default()).await?;
        Ok(outcome.count())
    }

    /// One page of records plus the total match count.
    ///
    /// The total comes from a separate count statement over the same
    /// predicates, so the two can disagree under concurrent writes unless
    /// both run inside one transaction.
    pub async fn find_with_pagination(
        &self,
        filter: &Filter,
        request: PageRequest,
    ) -> Result<Page<Record>> {
        let mut builder = self.query();
        builder.add_pagination(request.page, request.size)?;
        if let Some(sort) = &request.sort {
            builder.add_order_by(sort.clone(), request.order.to_string())?;
        }
        let descriptor = builder.get_query();
        let pagination = descriptor
            .pagination()
            .ok_or_else(|| DbError::Validation("Pagination is required".into()))?;

        let total_count = self.count(filter, Some(&descriptor)).await?;
        let data = self.find_all(filter, Some(&descriptor)).await?;
        let has_next_page = (pagination.page as u64).saturating_mul(pagination.size as u64) < total_count;

        Ok(Page {
            data,
            total_count,
            has_next_page,
            page: pagination.page,
            size: pagination.size,
        })
    }

    /// Runs parameterized SQL. Every dynamic value must be a `$n` placeholder
    /// with a matching entry in `bindings`; literals are rejected.
    pub async fn execute_raw_query(&self, sql: &str, bindings: &[Value]) -> Result<QueryResult> {
        let started = Instant::now();
        let raw = self.raw_guard.bind(sql, bindings).inspect_err(|err| {
            warn!(operation = "execute_raw_query", entity = self.model.name(), error = %err, "Rejected raw SQL")
        })?;

        let columns = match &raw.statement {
            BoundStatement::Select {
                projection: Projection::Columns(columns),
                ..
            } => Some(columns.clone()),
            _ => None,
        };
        let read_only = raw.statement.is_read_only();

        let outcome = self
            .run(Statement::Raw(raw.statement), &WriteOptions::default())
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(operation = "execute_raw_query", sql = %raw.sql, bindings = raw.bindings.len(), elapsed_ms, error = %err, "raw query failed");
                return Err(err);
            }
        };
        if !read_only {
            info!(
                operation = "execute_raw_query",
                sql = %raw.sql,
                bindings = raw.bindings.len(),
                elapsed_ms,
                transaction = ?self.transactions.ambient().map(|ctx| ctx.to_string()),
                "write"
            );
        }

        Ok(match outcome {
            StatementResult::Count(n) => QueryResult::scalar("count", Value::Integer(n as i64)),
            StatementResult::Affected(n) => QueryResult::affected(n),
            StatementResult::Rows(rows) => {
                let columns = columns.unwrap_or_else(|| match rows.first() {
                    Some(first) => first.keys().cloned().collect(),
                    None => Vec::new(),
                });
                QueryResult::rows(columns, rows)
            }
        })
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn run(&self, statement: Statement, options: &WriteOptions) -> Result<StatementResult> {
        self.transactions
            .execute(statement, options.transaction.as_ref())
            .await
    }

    async fn insert(&self, attributes: Fields, options: &WriteOptions) -> Result<Record> {
        let values = self.prepare_create(attributes)?;
        let statement = Statement::Insert {
            table: self.model.name().to_string(),
            values,
        };
        self.run(statement, options)
            .await?
            .into_rows()
            .into_iter()
            .next()
            .map(Record::new)
            .ok_or_else(|| DbError::Execution("INSERT returned no row".into()))
    }

    async fn insert_all(&self, rows: Vec<Fields>, options: &WriteOptions) -> Result<Vec<Record>> {
        let mut created = Vec::with_capacity(rows.len());
        for (index, row) in rows.into_iter().enumerate() {
            let record = self.insert(row, options).await.inspect_err(|err| {
                warn!(entity = self.model.name(), row = index, error = %err, "bulk insert row failed")
            })?;
            created.push(record);
        }
        Ok(created)
    }

    async fn update(&self, id: &Value, attributes: Fields, options: &WriteOptions) -> Result<Record> {
        let mut values = self.check_attributes(attributes)?;
        if let Some(new_key) = values.get(self.model.primary_key())
            && !new_key.sql_eq(id)
        {
            return Err(DbError::Validation(format!(
                "Primary key '{}' of '{}' cannot be changed",
                self.model.primary_key(),
                self.model.name()
            )));
        }
        if self.model.has_timestamps() {
            values.insert(UPDATED_AT.to_string(), Value::Timestamp(Utc::now()));
        }

        let statement = Statement::Update {
            table: self.model.name().to_string(),
            id: id.clone(),
            values,
        };
        self.run(statement, options)
            .await?
            .into_rows()
            .into_iter()
            .next()
            .map(Record::new)
            .ok_or_else(|| DbError::not_found(self.model.name(), id))
    }

    /// Unknown attributes and type mismatches are rejected.
    fn check_attributes(&self, attributes: Fields) -> Result<Fields> {
        for (field, value) in &attributes {
            let spec = self.model.find_attribute(field).ok_or_else(|| {
                DbError::Validation(format!(
                    "Unknown attribute '{}' for '{}'",
                    field,
                    self.model.name()
                ))
            })?;
            spec.validate(value)?;
        }
        Ok(attributes)
    }

    fn prepare_create(&self, attributes: Fields) -> Result<Fields> {
        let mut values = self.check_attributes(attributes)?;

        if self.model.has_timestamps() {
            let now = Value::Timestamp(Utc::now());
            for field in [CREATED_AT, UPDATED_AT] {
                values.entry(field.to_string()).or_insert_with(|| now.clone());
            }
        }

        for attr in self.model.attributes() {
            let missing = values.get(&attr.name).is_none_or(Value::is_null);
            if missing && !attr.nullable && attr.default.is_none() {
                return Err(DbError::Validation(format!(
                    "Attribute '{}' is required for '{}'",
                    attr.name,
                    self.model.name()
                )));
            }
        }
        Ok(values)
    }

    fn predicates(&self, filter: &Filter, query: Option<&QueryDescriptor>) -> Result<Vec<Predicate>> {
        let mut predicates: Vec<Predicate> = Vec::new();
        for (field, value) in filter {
            if query.is_some_and(|q| q.predicate_for(field).is_some()) {
                continue;
            }
            predicates.push(Predicate::Eq {
                field: field.clone(),
                value: value.clone(),
            });
        }
        if let Some(query) = query {
            predicates.extend(query.predicates().iter().cloned());
        }

        for predicate in &predicates {
            self.model.ensure_known(predicate.field())?;
        }
        Ok(predicates)
    }

    fn ordering(&self, query: Option<&QueryDescriptor>) -> Result<Vec<OrderBy>> {
        let order = match query {
            Some(query) if !query.order().is_empty() => query.order().to_vec(),
            _ => vec![OrderBy::new(self.model.primary_key(), Direction::Asc)],
        };
        for entry in &order {
            self.model.ensure_known(&entry.field)?;
        }
        Ok(order)
    }

    async fn load_association(&self, records: &mut [Record], association: &Association) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let target = association.target();

        // (parent attribute, target attribute) joined on equality
        let (local, remote) = match association.kind() {
            AssociationKind::BelongsTo => {
                self.model.ensure_known(association.foreign_key())?;
                (association.foreign_key(), target.primary_key())
            }
            AssociationKind::HasMany => {
                target.ensure_known(association.foreign_key())?;
                (self.model.primary_key(), association.foreign_key())
            }
        };

        let mut keys: Vec<Value> = Vec::new();
        for record in records.iter() {
            if let Some(value) = record.get(local)
                && !value.is_null()
                && !keys.contains(value)
            {
                keys.push(value.clone());
            }
        }

        let mut grouped: HashMap<Value, Vec<Record>> = HashMap::new();
        if !keys.is_empty() {
            let mut select = SelectStatement::new(target.name());
            select.predicates.push(Predicate::In {
                field: remote.to_string(),
                values: keys,
            });
            select.order.push(OrderBy::new(target.primary_key(), Direction::Asc));

            let rows = self
                .run(Statement::Select(select), &WriteOptions::default())
                .await?
                .into_rows();
            for row in rows {
                if let Some(key) = row.get(remote).cloned() {
                    grouped.entry(key).or_default().push(Record::new(row));
                }
            }
        }

        for record in records.iter_mut() {
            let related = record
                .get(local)
                .and_then(|key| grouped.get(key))
                .cloned()
                .unwrap_or_default();
            record.attach(association.name(), related);
        }
        Ok(())
    }

    fn transaction_label(&self, options: &WriteOptions) -> Option<String> {
        options
            .transaction
            .clone()
            .or_else(|| self.transactions.ambient())
            .map(|ctx| ctx.to_string())
    }

    fn log_write<T>(
        &self,
        operation: &str,
        attributes: &Fields,
        started: Instant,
        options: &WriteOptions,
        result: &Result<T>,
    ) {
        let sanitized = self.redactor.sanitize(attributes);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let transaction = self.transaction_label(options);

        match result {
            Ok(_) => info!(
                operation,
                entity = self.model.name(),
                attributes = ?sanitized,
                elapsed_ms,
                transaction = ?transaction,
                "write"
            ),
            Err(err) => warn!(
                operation,
                entity = self.model.name(),
                attributes = ?sanitized,
                elapsed_ms,
                transaction = ?transaction,
                code = err.code().unwrap_or("-"),
                error = %err,
                "write failed"
            ),
        }
    }
}

impl std::fmt::Debug for BaseAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseAccessor")
            .field("entity", &self.model.name())
            .field("max_page_size", &self.max_page_size)
            .finish()
    }
}
