use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
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
use tracing::{debug, error};
use ulid::Ulid;

use crate::calendar;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(BookdFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct BookdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<BookdQueryParser>,
}

impl BookdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(BookdQueryParser),
        }
    }

    /// The database name picks the organization.
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
                format!("organization error: {e}"),
            )))
        })
    }

    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        debug!(command = label, "executing");

        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertUser { id, name, role } => {
                engine
                    .register_user(id, &name, role)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertFacility {
                id,
                name,
                capacity,
                is_active,
            } => {
                engine
                    .create_facility(id, &name, capacity, is_active)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateFacility { id, patch } => {
                engine
                    .update_facility(id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteFacility { id } => {
                engine.delete_facility(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectFacilities {
                id,
                window,
                min_capacity,
            } => {
                let facilities = if let Some(id) = id {
                    vec![engine.get_facility(id).await.map_err(engine_err)?]
                } else if let Some((date, start, end)) = window {
                    engine
                        .available_facilities(&date, &start, &end, min_capacity)
                        .await
                        .map_err(engine_err)?
                } else {
                    engine
                        .list_facilities()
                        .await
                        .into_iter()
                        .filter(|f| match (min_capacity, f.capacity) {
                            (Some(min), Some(cap)) => cap >= min,
                            _ => true,
                        })
                        .collect()
                };
                facility_rows(&facilities)
            }
            Command::InsertReservation {
                requester_id,
                input,
            } => {
                engine
                    .create_reservation(requester_id, input)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateReservation {
                id,
                requester_id,
                patch,
            } => {
                engine
                    .update_reservation(id, requester_id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SetReservationStatus {
                id,
                status,
                acted_by,
                note,
            } => {
                engine
                    .set_reservation_status(id, &status, Some(acted_by), note)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::CancelReservation { id, requester_id } => {
                engine
                    .cancel_reservation(id, requester_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectReservations { id, requester_id } => {
                let rows = match (id, requester_id) {
                    (Some(id), viewer) => vec![
                        engine
                            .get_reservation(id, viewer)
                            .await
                            .map_err(engine_err)?
                            .into(),
                    ],
                    (None, Some(user)) => engine.list_reservations_for_user(user).await,
                    (None, None) => engine.list_all_reservations().await,
                };
                reservation_rows(&rows)
            }
            Command::SelectAvailability {
                facility_id,
                date,
                start_time,
                end_time,
            } => {
                let available = engine
                    .check_facility_availability(facility_id, &date, &start_time, &end_time)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&facility_id.to_string())?;
                encoder.encode_field(&date)?;
                encoder.encode_field(&start_time)?;
                encoder.encode_field(&end_time)?;
                encoder.encode_field(&available)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectBusySlots { facility_id, date } => {
                let slots = engine
                    .busy_slots(facility_id, &date)
                    .await
                    .map_err(engine_err)?;
                slot_rows(facility_id, &slots)
            }
            Command::SelectFreeSlots { facility_id, date } => {
                let slots = engine
                    .free_slots(facility_id, &date)
                    .await
                    .map_err(engine_err)?;
                slot_rows(facility_id, &slots)
            }
            Command::SelectApprovalLog {
                reservation_id,
                requester_id,
            } => {
                let entries = engine
                    .approval_log(reservation_id, requester_id)
                    .map_err(engine_err)?;
                approval_log_rows(&entries)
            }
        }
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn bool_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("requester_id"),
        text_field("requester_name"),
        text_field("facility_id"),
        text_field("facility_name"),
        text_field("status"),
        text_field("purpose"),
        int_field("attendees"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
        text_field("proposal_ref"),
        text_field("created_at"),
    ]
}

fn facility_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        int_field("capacity"),
        bool_field("is_active"),
        bool_field("under_maintenance"),
        text_field("maintenance_until"),
        text_field("maintenance_reason"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("facility_id"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
        bool_field("available"),
    ]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        text_field("facility_id"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
    ]
}

fn approval_log_schema() -> Vec<FieldInfo> {
    vec![
        text_field("reservation_id"),
        text_field("at"),
        text_field("actor_id"),
        text_field("action"),
        text_field("note"),
    ]
}

fn reservation_rows(reservations: &[ReservationSummary]) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.requester_id.to_string())?;
            encoder.encode_field(&r.requester_name)?;
            encoder.encode_field(&r.facility_id.map(|id| id.to_string()))?;
            encoder.encode_field(&r.facility_name)?;
            encoder.encode_field(&r.status.as_str().to_string())?;
            encoder.encode_field(&r.purpose)?;
            encoder.encode_field(&i64::from(r.attendees))?;
            encoder.encode_field(&r.date)?;
            encoder.encode_field(&r.start_time)?;
            encoder.encode_field(&r.end_time)?;
            encoder.encode_field(&r.proposal_ref)?;
            encoder.encode_field(&calendar::format_timestamp(r.created_at))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn facility_rows(facilities: &[FacilityInfo]) -> PgWireResult<Response> {
    let schema = Arc::new(facility_schema());
    let rows: Vec<PgWireResult<_>> = facilities
        .iter()
        .map(|f| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&f.id.to_string())?;
            encoder.encode_field(&f.name)?;
            encoder.encode_field(&f.capacity.map(i64::from))?;
            encoder.encode_field(&f.is_active)?;
            encoder.encode_field(&f.under_maintenance)?;
            encoder.encode_field(&f.maintenance_until.map(calendar::format_timestamp))?;
            encoder.encode_field(&f.maintenance_reason)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn slot_rows(facility_id: Ulid, slots: &[Span]) -> PgWireResult<Response> {
    let schema = Arc::new(slot_schema());
    let fid = facility_id.to_string();
    let rows: Vec<PgWireResult<_>> = slots
        .iter()
        .map(|slot| {
            let (date, start, end) = calendar::split_window(slot);
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&fid)?;
            encoder.encode_field(&date)?;
            encoder.encode_field(&start)?;
            encoder.encode_field(&end)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn approval_log_rows(entries: &[LogInfo]) -> PgWireResult<Response> {
    let schema = Arc::new(approval_log_schema());
    let rows: Vec<PgWireResult<_>> = entries
        .iter()
        .map(|e| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&e.reservation_id.to_string())?;
            encoder.encode_field(&calendar::format_timestamp(e.at))?;
            encoder.encode_field(&e.actor.map(|a| a.to_string()))?;
            encoder.encode_field(&e.action.as_str().to_string())?;
            encoder.encode_field(&e.note)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Result columns for a statement, known before it runs.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_ascii_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    let table = lower
        .split_once(" from ")
        .and_then(|(_, rest)| {
            rest.trim_start()
                .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .next()
        })
        .unwrap_or("");
    match table {
        "reservations" => reservation_schema(),
        "facilities" => facility_schema(),
        "availability" => availability_schema(),
        "busy_slots" | "free_slots" => slot_schema(),
        "approval_logs" => approval_log_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for BookdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let commands = sql::parse_batch(query).map_err(sql_err)?;
        // Statements run in order; an error stops the batch but keeps what already ran.
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            responses.push(self.run(&engine, cmd).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BookdQueryParser;

#[async_trait]
impl QueryParser for BookdQueryParser {
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
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BookdHandler {
    type Statement = String;
    type QueryParser = BookdQueryParser;

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
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(&engine, cmd).await
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
/// Byte ranges and indices of `$N` placeholders outside quoted literals and
/// quoted identifiers.
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let digits = i + 1;
                let mut j = digits;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                if j > digits
                    && let Ok(n) = sql[digits..j].parse::<usize>()
                {
                    found.push((i, j, n));
                    i = j;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    found
}

fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|&(_, _, n)| n).max().unwrap_or(0)
}

/// Inline bound text parameters as quoted literals in one pass over the
/// statement. Inserted text is never scanned again.
fn inline_params(sql: &str, params: &[Option<String>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (start, end, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|idx| params.get(idx)) else {
            continue;
        };
        out.push_str(&sql[copied..start]);
        match param {
            Some(text) => {
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = end;
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|b| String::from_utf8_lossy(b).into_owned()))
        .collect();
    inline_params(&portal.statement.statement, &params)
}

// ── Factory ──────────────────────────────────────────────────────

/// Every organization shares the server password. The login user is not an
/// identity here: requesters are named explicitly in each statement.
#[derive(Debug)]
pub struct SharedPasswordSource {
    password: Vec<u8>,
}

#[async_trait]
impl AuthSource for SharedPasswordSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.clone()))
    }
}

pub struct BookdFactory {
    handler: Arc<BookdHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SharedPasswordSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl BookdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SharedPasswordSource {
            password: password.into_bytes(),
        };
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(BookdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BookdFactory {
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

fn engine_err(e: EngineError) -> PgWireError {
    if e.is_internal() {
        error!("engine failure: {e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.public_message(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}
