use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::{Sink, SinkExt, stream};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use ulid::Ulid;

use crate::auth::VenueBookAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::notify::{channel_name, event_payload, parse_channel};
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

/// Backend process ids reported on notifications; unique per connection.
static NEXT_PID: AtomicI32 = AtomicI32::new(1);

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = VenueBookFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// Query handler for a single connection. Owns that connection's LISTEN registrations.
pub struct VenueBookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<VenueBookQueryParser>,
    pid: i32,
    listeners: Mutex<HashMap<Ulid, broadcast::Receiver<Event>>>,
}

impl VenueBookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(VenueBookQueryParser),
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Deliver every event queued on this connection's channels, in channel order.
    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let pending = {
            let mut listeners = self.listeners.lock().map_err(|_| poisoned())?;
            let mut pending = Vec::new();
            let mut closed = Vec::new();
            for (resource_id, rx) in listeners.iter_mut() {
                loop {
                    match rx.try_recv() {
                        Ok(event) => pending.push((channel_name(*resource_id), event_payload(&event))),
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Lagged(missed)) => {
                            tracing::warn!(%resource_id, missed, "listener lagged, notifications dropped");
                        }
                        Err(TryRecvError::Closed) => {
                            closed.push(*resource_id);
                            break;
                        }
                    }
                }
            }
            for resource_id in closed {
                listeners.remove(&resource_id);
            }
            pending
        };

        for (channel, payload) in pending {
            client
                .send(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    self.pid, channel, payload,
                )))
                .await?;
        }
        Ok(())
    }

    /// Parse, execute and record metrics for one statement.
    async fn run<C: ClientInfo>(&self, client: &C, query: &str, format: &Format) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let started = Instant::now();
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "parse_error").increment(1);
                tracing::debug!(error = %e, "rejected statement");
                return Err(sql_err(e));
            }
        };
        let label = command_label(&cmd);
        let result = self.execute_command(&engine, cmd, format).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(_) => "error",
        };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command, format: &Format) -> PgWireResult<Response> {
        match cmd {
            Command::InsertResource { config } => {
                engine.create_resource(config).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateResource { id, patch } => {
                engine.update_resource(id, patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteResource { id } => {
                engine.delete_resource(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectResources { id } => {
                let configs = match id {
                    Some(id) => vec![engine.get_resource_config(id).await.map_err(engine_err)?],
                    None => engine.list_resources().await,
                };
                let schema = Arc::new(with_format(resources_schema(), format));
                Ok(query_response(schema, configs, encode_resource))
            }
            Command::InsertBooking { request } => {
                engine.create_booking(request).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::BatchInsertBookings { requests } => {
                let created = engine.create_bookings(requests).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(created.len())))
            }
            Command::UpdateBookingStatus { id, status } => {
                engine.transition_status(id, status).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::UpdatePaymentStatus { id, payment_status } => {
                engine
                    .transition_payment(id, payment_status)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBookings { id, filter } => {
                let bookings = match id {
                    Some(id) => vec![engine.get_booking(id).await.map_err(engine_err)?],
                    None => engine.list_bookings(&filter).await.map_err(engine_err)?,
                };
                let schema = Arc::new(with_format(bookings_schema(), format));
                Ok(query_response(schema, bookings, encode_booking))
            }
            Command::SelectAvailability {
                resource_id,
                date,
                start,
                duration,
            } => {
                let snap = engine
                    .availability(resource_id, date, start, duration)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(with_format(availability_schema(), format));
                let rid = resource_id.to_string();
                let rows: Vec<_> = snap
                    .units
                    .iter()
                    .map(|unit| (rid.clone(), unit.clone(), snap.occupied.contains(unit), snap.max_duration))
                    .collect();
                Ok(query_response(schema, rows, |enc, (rid, unit, occupied, max)| {
                    enc.encode_field(&rid)?;
                    enc.encode_field(&unit)?;
                    enc.encode_field(&occupied)?;
                    enc.encode_field(&(max as i64))
                }))
            }
            Command::SelectSlots {
                resource_id,
                date,
                duration,
            } => {
                let slots = engine
                    .slots(resource_id, date, duration)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(with_format(slots_schema(), format));
                let rid = resource_id.to_string();
                Ok(query_response(schema, slots, move |enc, slot| {
                    enc.encode_field(&rid)?;
                    enc.encode_field(&format_clock(slot.start))?;
                    enc.encode_field(&(slot.max_duration as i64))?;
                    enc.encode_field(&(slot.free_units as i64))
                }))
            }
            Command::Listen { channel } => {
                let resource_id = parse_listen_channel(&channel)?;
                if engine.get_resource(&resource_id).is_none() {
                    return Err(engine_err(EngineError::NotFound(resource_id)));
                }
                let mut listeners = self.listeners.lock().map_err(|_| poisoned())?;
                listeners
                    .entry(resource_id)
                    .or_insert_with(|| engine.notify.subscribe(resource_id));
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                let resource_id = parse_listen_channel(&channel)?;
                self.listeners.lock().map_err(|_| poisoned())?.remove(&resource_id);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.listeners.lock().map_err(|_| poisoned())?.clear();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }
}

fn parse_listen_channel(channel: &str) -> PgWireResult<Ulid> {
    parse_channel(channel).ok_or_else(|| {
        user_error(
            "42000",
            format!("invalid channel: {channel} (expected resource_{{id}})"),
        )
    })
}

fn query_response<T>(
    schema: Arc<Vec<FieldInfo>>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn join_or_null(items: &[String]) -> Option<String> {
    (!items.is_empty()).then(|| items.join(","))
}

fn encode_resource(enc: &mut DataRowEncoder, c: ResourceConfig) -> PgWireResult<()> {
    enc.encode_field(&c.id.to_string())?;
    enc.encode_field(&c.name)?;
    enc.encode_field(&c.room)?;
    enc.encode_field(&format_clock(c.open))?;
    enc.encode_field(&format_clock(c.close))?;
    enc.encode_field(&(c.granularity as i64))?;
    enc.encode_field(&(c.max_duration as i64))?;
    enc.encode_field(&c.price_per_unit_hour.to_string())?;
    enc.encode_field(&join_or_null(&c.sub_units))?;
    let slots: Option<String> = c
        .slots
        .map(|s| s.into_iter().map(format_clock).collect::<Vec<_>>().join(","));
    enc.encode_field(&slots)
}

fn encode_booking(enc: &mut DataRowEncoder, b: Booking) -> PgWireResult<()> {
    enc.encode_field(&b.id.to_string())?;
    enc.encode_field(&b.resource_id.to_string())?;
    enc.encode_field(&join_or_null(&b.sub_unit_ids))?;
    enc.encode_field(&b.date.to_string())?;
    enc.encode_field(&format_clock(b.start))?;
    enc.encode_field(&format_clock(b.end()))?;
    enc.encode_field(&(b.duration as i64))?;
    enc.encode_field(&b.total_price.to_string())?;
    enc.encode_field(&b.customer.name)?;
    enc.encode_field(&b.customer.email)?;
    enc.encode_field(&b.customer.phone)?;
    enc.encode_field(&b.status.as_str())?;
    enc.encode_field(&b.payment_status.as_str())?;
    enc.encode_field(&b.created_at)
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

/// Apply the client's requested result format column by column.
fn with_format(fields: Vec<FieldInfo>, format: &Format) -> Vec<FieldInfo> {
    fields
        .into_iter()
        .enumerate()
        .map(|(i, f)| FieldInfo::new(f.name().into(), None, None, f.datatype().clone(), format.format_for(i)))
        .collect()
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("sub_unit_id", Type::VARCHAR),
        field("occupied", Type::BOOL),
        field("max_duration", Type::INT8),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("max_duration", Type::INT8),
        field("free_units", Type::INT8),
    ]
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("room", Type::VARCHAR),
        field("open", Type::VARCHAR),
        field("close", Type::VARCHAR),
        field("granularity", Type::INT8),
        field("max_duration", Type::INT8),
        field("price", Type::VARCHAR),
        field("sub_units", Type::VARCHAR),
        field("slots", Type::VARCHAR),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("sub_unit_ids", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("duration", Type::INT8),
        field("total_price", Type::VARCHAR),
        field("customer_name", Type::VARCHAR),
        field("customer_email", Type::VARCHAR),
        field("customer_phone", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("payment_status", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

/// Columns a statement will return, judged from its text before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.trim_start().to_lowercase();
    if !lower.starts_with("select") {
        return vec![];
    }
    let table = lower
        .split(" from ")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap_or_default();
    match table.trim_end_matches(';') {
        "availability" => availability_schema(),
        "slots" => slots_schema(),
        "resources" => resources_schema(),
        "bookings" => bookings_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for VenueBookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let response = self.run(client, query, &Format::UnifiedText).await;
        self.flush_notifications(client).await?;
        Ok(vec![response?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct VenueBookQueryParser;

#[async_trait]
impl QueryParser for VenueBookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        let schema = result_schema(stmt);
        Ok(match column_format {
            Some(format) => with_format(schema, format),
            None => schema,
        })
    }
}

#[async_trait]
impl ExtendedQueryHandler for VenueBookHandler {
    type Statement = String;
    type QueryParser = VenueBookQueryParser;

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
        let sql = substitute_params(portal);
        let response = self.run(client, &sql, &portal.result_column_format).await;
        self.flush_notifications(client).await?;
        response
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        let schema = result_schema(&target.statement.statement);
        Ok(DescribePortalResponse::new(with_format(schema, &target.result_column_format)))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals. Highest index first so `$1` never eats `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

/// Handlers for one connection.
pub struct VenueBookFactory {
    handler: Arc<VenueBookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<VenueBookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl VenueBookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = VenueBookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(VenueBookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for VenueBookFactory {
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

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn poisoned() -> PgWireError {
    user_error("XX000", "listener registry poisoned".into())
}

/// SQLSTATE per engine error kind.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::Validation(_) => "22023",
        EngineError::Conflict { .. } => "23P01",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::Storage(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::Storage(msg) = &e {
        tracing::error!(error = %msg, "storage failure");
    }
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
