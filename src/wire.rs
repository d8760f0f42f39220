use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SharedPasswordSource;
use crate::engine::{Engine, EngineError, LedgerFilter};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct QuartermasterHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<QuartermasterQueryParser>,
}

impl QuartermasterHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(QuartermasterQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Parse and run one statement, recording query metrics.
    async fn run(&self, engine: &Engine, query: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(|e| {
            metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                .increment(1);
            tracing::debug!("rejected statement: {e}");
            sql_err(e)
        })?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd, format).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertCategory {
                id,
                name,
                asset_type,
            } => {
                engine
                    .create_category(id, name, asset_type)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertAsset {
                id,
                category_id,
                code,
                asset_type,
            } => {
                engine
                    .create_asset(id, category_id, code, asset_type)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::SetAssetStatus { asset_id, status } => {
                engine
                    .set_asset_status(asset_id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertRequest(new) => {
                engine.submit_request(new).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateRequestStatus {
                request_id,
                status,
                actor_id,
                reason,
            } => {
                engine
                    .update_request_status(request_id, status, actor_id, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::AcceptBooking { request_id, user_id } => {
                let outcome = engine
                    .accept_booking(request_id, user_id)
                    .await
                    .map_err(engine_err)?;
                allocation_result_rows(&outcome, format)
            }
            Command::CancelRequest { id } => {
                engine.cancel_request(id, None).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::Allocate { request_id, lines } => {
                let outcome = engine
                    .allocate(request_id, lines)
                    .await
                    .map_err(engine_err)?;
                allocation_result_rows(&outcome, format)
            }
            Command::MarkReturned {
                borrowed_id,
                returned_at,
            } => {
                engine
                    .mark_returned(borrowed_id, returned_at)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::ReturnRequest {
                request_id,
                returned_at,
            } => {
                let units = engine
                    .return_request(request_id, returned_at)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(units.len()))
            }
            Command::SelectAvailability { request_id } => {
                let result = engine
                    .check_availability(request_id)
                    .await
                    .map_err(engine_err)?;
                availability_rows(Some(request_id), &result.categories, format)
            }
            Command::SelectCategoryAvailability {
                category_id,
                start,
                end,
                quantity,
            } => {
                let (cat, _) = engine
                    .check_category_window(category_id, start, end, quantity)
                    .await
                    .map_err(engine_err)?;
                availability_rows(None, std::slice::from_ref(&cat), format)
            }
            Command::SelectBorrowedAssets(filter) => {
                let rows = engine.borrowed_assets(filter).await.map_err(engine_err)?;
                borrowed_rows(&rows, format)
            }
            Command::SelectCategories => categories_rows(&engine.list_categories(), format),
            Command::SelectAssets { category_id } => {
                let assets = engine.list_assets(category_id).await.map_err(engine_err)?;
                assets_rows(&assets, format)
            }
            Command::SelectRequests(filter) => {
                let requests = engine.list_requests(filter).await;
                requests_rows(&requests, format)
            }
            Command::SelectAllocations { request_id } => {
                let allocation = engine.allocation_for(request_id).await.map_err(engine_err)?;
                let statuses: HashMap<_, _> = engine
                    .borrowed_assets(LedgerFilter::Request(request_id))
                    .await
                    .map_err(engine_err)?
                    .into_iter()
                    .map(|row| (row.id, row.status))
                    .collect();
                allocations_rows(allocation.as_ref(), &statuses, format)
            }
        }
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text("request_id", Type::VARCHAR),
        text("category_id", Type::VARCHAR),
        text("category_name", Type::VARCHAR),
        text("requested", Type::INT4),
        text("available_now", Type::INT4),
        text("shortage", Type::INT4),
        text("available", Type::BOOL),
        text("next_available_at", Type::VARCHAR),
        text("selected_asset_ids", Type::VARCHAR),
    ]
}

fn allocation_result_schema() -> Vec<FieldInfo> {
    vec![
        text("allocation_id", Type::VARCHAR),
        text("request_id", Type::VARCHAR),
        text("category_id", Type::VARCHAR),
        text("outcome", Type::VARCHAR),
        text("required", Type::INT4),
        text("allocated", Type::INT4),
        text("request_status", Type::VARCHAR),
    ]
}

fn borrowed_schema() -> Vec<FieldInfo> {
    vec![
        text("id", Type::VARCHAR),
        text("asset_id", Type::VARCHAR),
        text("request_id", Type::VARCHAR),
        text("staff_id", Type::VARCHAR),
        text("start", Type::VARCHAR),
        text("end", Type::VARCHAR),
        text("status", Type::VARCHAR),
        text("returned_at", Type::VARCHAR),
    ]
}

fn categories_schema() -> Vec<FieldInfo> {
    vec![
        text("id", Type::VARCHAR),
        text("name", Type::VARCHAR),
        text("asset_type", Type::VARCHAR),
        text("unit_count", Type::INT8),
    ]
}

fn assets_schema() -> Vec<FieldInfo> {
    vec![
        text("id", Type::VARCHAR),
        text("category_id", Type::VARCHAR),
        text("code", Type::VARCHAR),
        text("asset_type", Type::VARCHAR),
        text("status", Type::VARCHAR),
    ]
}

fn requests_schema() -> Vec<FieldInfo> {
    vec![
        text("id", Type::VARCHAR),
        text("requester_id", Type::VARCHAR),
        text("project_id", Type::VARCHAR),
        text("department_id", Type::VARCHAR),
        text("asset_id", Type::VARCHAR),
        text("categories", Type::VARCHAR),
        text("start", Type::VARCHAR),
        text("end", Type::VARCHAR),
        text("status", Type::VARCHAR),
        text("approver_id", Type::VARCHAR),
        text("rejection_reason", Type::VARCHAR),
        text("description", Type::VARCHAR),
    ]
}

fn allocations_schema() -> Vec<FieldInfo> {
    vec![
        text("allocation_id", Type::VARCHAR),
        text("request_id", Type::VARCHAR),
        text("category_id", Type::VARCHAR),
        text("asset_id", Type::VARCHAR),
        text("borrowed_id", Type::VARCHAR),
        text("status", Type::VARCHAR),
    ]
}

/// Apply the client's requested result format column by column.
fn with_format(schema: Vec<FieldInfo>, format: &Format) -> Vec<FieldInfo> {
    schema
        .into_iter()
        .enumerate()
        .map(|(i, f)| {
            let (name, ty) = (f.name().to_string(), f.datatype().clone());
            FieldInfo::new(name, None, None, ty, format.format_for(i))
        })
        .collect()
}

/// Row schema for statements that return rows, keyed by their virtual table.
fn schema_for_table(table: &str) -> Vec<FieldInfo> {
    match table {
        "availability" | "category_availability" => availability_schema(),
        "borrowed_assets" => borrowed_schema(),
        "categories" => categories_schema(),
        "assets" => assets_schema(),
        "requests" => requests_schema(),
        _ => Vec::new(),
    }
}

/// Describe-time schema: INSERTs into `allocations` and `booking_acceptances`
/// report per-category results, SELECTs report their table.
fn describe_schema(stmt: &str, format: &Format) -> Vec<FieldInfo> {
    with_format(statement_schema(stmt), format)
}

fn statement_schema(stmt: &str) -> Vec<FieldInfo> {
    let Some(table) = sql::result_table(stmt) else {
        return Vec::new();
    };
    let is_insert = stmt.trim_start().to_ascii_uppercase().starts_with("INSERT");
    match table.as_str() {
        "allocations" | "booking_acceptances" if is_insert => allocation_result_schema(),
        "allocations" => allocations_schema(),
        other => schema_for_table(other),
    }
}

// ── Row encoding ─────────────────────────────────────────────────

/// RFC 3339, UTC, millisecond precision. Falls back to the raw number for
/// values chrono cannot represent.
pub fn format_ms(ms: Ms) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}

fn opt_id(id: Option<ulid::Ulid>) -> Option<String> {
    id.map(|id| id.to_string())
}

fn availability_rows(
    request_id: Option<ulid::Ulid>,
    categories: &[CategoryAvailability],
    format: &Format,
) -> PgWireResult<Response> {
    let schema = Arc::new(with_format(availability_schema(), format));
    let rows: Vec<PgWireResult<_>> = categories
        .iter()
        .map(|c| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&opt_id(request_id))?;
            encoder.encode_field(&c.category_id.to_string())?;
            encoder.encode_field(&c.category_name)?;
            encoder.encode_field(&(c.requested as i32))?;
            encoder.encode_field(&(c.available_now as i32))?;
            encoder.encode_field(&(c.shortage as i32))?;
            encoder.encode_field(&(c.shortage == 0))?;
            encoder.encode_field(&c.next_available_at.map(format_ms))?;
            let selected: Vec<String> = c.selected.iter().map(|id| id.to_string()).collect();
            encoder.encode_field(&selected.join(","))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn allocation_result_rows(
    outcome: &AllocationOutcome,
    format: &Format,
) -> PgWireResult<Response> {
    let schema = Arc::new(with_format(allocation_result_schema(), format));
    let allocation_id = outcome.allocation_id.to_string();
    let request_id = outcome.request_id.to_string();
    let status = outcome.status.as_str();

    let allocated = outcome.allocated.iter().map(|line| {
        let n = line.units.len() as i32;
        (line.category_id, "ALLOCATED", n, n)
    });
    let skipped = outcome
        .skipped
        .iter()
        .map(|s| (s.category_id, "SKIPPED", s.required as i32, s.selected as i32));
    let rows: Vec<PgWireResult<_>> = allocated
        .chain(skipped)
        .map(|(category_id, kind, required, bound)| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&allocation_id)?;
            encoder.encode_field(&request_id)?;
            encoder.encode_field(&category_id.to_string())?;
            encoder.encode_field(&kind)?;
            encoder.encode_field(&required)?;
            encoder.encode_field(&bound)?;
            encoder.encode_field(&status)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn borrowed_rows(rows: &[BorrowInterval], format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(with_format(borrowed_schema(), format));
    let rows: Vec<PgWireResult<_>> = rows
        .iter()
        .map(|row| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&row.id.to_string())?;
            encoder.encode_field(&row.asset_id.to_string())?;
            encoder.encode_field(&row.request_id.to_string())?;
            encoder.encode_field(&row.requester_id.to_string())?;
            encoder.encode_field(&format_ms(row.span.start))?;
            encoder.encode_field(&format_ms(row.span.end))?;
            encoder.encode_field(&row.status.as_str())?;
            encoder.encode_field(&row.returned_at.map(format_ms))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn categories_rows(categories: &[CategoryInfo], format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(with_format(categories_schema(), format));
    let rows: Vec<PgWireResult<_>> = categories
        .iter()
        .map(|c| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&c.id.to_string())?;
            encoder.encode_field(&c.name)?;
            encoder.encode_field(&c.asset_type)?;
            encoder.encode_field(&(c.unit_count as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn assets_rows(assets: &[AssetInfo], format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(with_format(assets_schema(), format));
    let rows: Vec<PgWireResult<_>> = assets
        .iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&a.id.to_string())?;
            encoder.encode_field(&a.category_id.to_string())?;
            encoder.encode_field(&a.code)?;
            encoder.encode_field(&a.asset_type)?;
            encoder.encode_field(&a.status.as_str())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn requests_rows(requests: &[RequestState], format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(with_format(requests_schema(), format));
    let rows: Vec<PgWireResult<_>> = requests
        .iter()
        .map(|r| {
            let (asset_id, categories) = match &r.kind {
                RequestKind::Specific { asset_id } => (Some(asset_id.to_string()), None),
                RequestKind::Categories(demands) => (
                    None,
                    Some(serde_json::to_string(demands).map_err(|e| {
                        PgWireError::ApiError(Box::new(e))
                    })?),
                ),
            };
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.requester_id.to_string())?;
            encoder.encode_field(&opt_id(r.project_id))?;
            encoder.encode_field(&opt_id(r.department_id))?;
            encoder.encode_field(&asset_id)?;
            encoder.encode_field(&categories)?;
            encoder.encode_field(&format_ms(r.span.start))?;
            encoder.encode_field(&format_ms(r.span.end))?;
            encoder.encode_field(&r.status.as_str())?;
            encoder.encode_field(&opt_id(r.approver_id))?;
            encoder.encode_field(&r.rejection_reason)?;
            encoder.encode_field(&r.description)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn allocations_rows(
    allocation: Option<&Allocation>,
    statuses: &HashMap<ulid::Ulid, BorrowStatus>,
    format: &Format,
) -> PgWireResult<Response> {
    let schema = Arc::new(with_format(allocations_schema(), format));
    let rows: Vec<PgWireResult<_>> = allocation
        .into_iter()
        .flat_map(|a| {
            a.lines
                .iter()
                .flat_map(move |line| line.units.iter().map(move |u| (a, line.category_id, u)))
        })
        .map(|(a, category_id, unit)| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&a.id.to_string())?;
            encoder.encode_field(&a.request_id.to_string())?;
            encoder.encode_field(&category_id.to_string())?;
            encoder.encode_field(&unit.asset_id.to_string())?;
            encoder.encode_field(&unit.borrowed_id.to_string())?;
            encoder.encode_field(&statuses.get(&unit.borrowed_id).map(|s| s.as_str()))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for QuartermasterHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct QuartermasterQueryParser;

#[async_trait]
impl QueryParser for QuartermasterQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for QuartermasterHandler {
    type Statement = String;
    type QueryParser = QuartermasterQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &sql, &portal.result_column_format).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            describe_schema(&target.statement, &Format::UnifiedText),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(describe_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    substitute(&portal.statement.statement, &portal.parameters)
}

fn substitute<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct QuartermasterFactory {
    handler: Arc<QuartermasterHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SharedPasswordSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl QuartermasterFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SharedPasswordSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(QuartermasterHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for QuartermasterFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = QuartermasterFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::InvalidWindow { .. } | EngineError::Validation(_) => "22023",
        EngineError::Conflict(_) | EngineError::AssetUnavailable(_) => "40001",
        EngineError::QuantityNotMet { .. } => "23514",
        EngineError::IllegalTransition { .. } => "55000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if matches!(e, EngineError::WalError(_)) {
        tracing::error!("{e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}
