use std::collections::HashMap;
use std::fmt::Debug;
use std::ops::Range;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, warn};

use crate::auth::{actor_from_login, MedislotAuthSource};
use crate::engine::{CancelOutcome, Engine, EngineError};
use crate::model::*;
use crate::notify::{Channel, Notification};
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

static NEXT_BACKEND_PID: AtomicI32 = AtomicI32::new(1);

/// Per-connection handler. Owns the connection's LISTEN subscriptions;
/// anything published on them is flushed to the client as
/// `NotificationResponse` at its next statement.
pub struct MedislotHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<MedislotQueryParser>,
    subscriptions: Mutex<HashMap<Channel, broadcast::Receiver<Notification>>>,
    pid: i32,
}

impl MedislotHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(MedislotQueryParser),
            subscriptions: Mutex::new(HashMap::new()),
            pid: NEXT_BACKEND_PID.fetch_add(1, Ordering::Relaxed),
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

    /// Parse, execute and flush pending notifications for one statement.
    async fn run<C>(&self, client: &mut C, query: &str) -> PgWireResult<Response>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let actor = actor_from_login(client.metadata().get("user").map(String::as_str))?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, &actor, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);

        self.flush_notifications(client).await?;
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        actor: &Actor,
        cmd: Command,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertDoctor { id, name } => {
                require_doctor_admin(actor, id)?;
                engine.register_doctor(id, name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectDoctors => {
                let doctors = engine.list_doctors().await;
                Ok(rows_response(doctors_schema(), doctors, |enc, d| {
                    enc.encode_field(&d.id.to_string())?;
                    enc.encode_field(&d.name)?;
                    enc.encode_field(&(d.open_days as i64))?;
                    enc.encode_field(&(d.active_appointments as i64))
                }))
            }
            Command::SetAvailability {
                doctor_id,
                weekday,
                start,
                end,
                is_available,
            } => {
                require_doctor_admin(actor, doctor_id)?;
                engine
                    .set_window(doctor_id, weekday, start, end, is_available)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectAvailability { doctor_id, weekday } => {
                let days = match weekday {
                    Some(day) => vec![(day, engine.get_window(doctor_id, day).await.map_err(engine_err)?)],
                    None => engine.weekly_schedule(doctor_id).await.map_err(engine_err)?,
                };
                let doctor = doctor_id.to_string();
                Ok(rows_response(availability_schema(), days, |enc, (day, w)| {
                    enc.encode_field(&doctor)?;
                    enc.encode_field(&weekday_name(day).to_string())?;
                    enc.encode_field(&w.start.to_string())?;
                    enc.encode_field(&w.end.to_string())?;
                    enc.encode_field(&w.is_available)
                }))
            }
            Command::SelectSlots {
                doctor_id,
                date,
                granularity,
            } => {
                let slots = engine
                    .list_slots(doctor_id, date, granularity)
                    .await
                    .map_err(engine_err)?;
                let (doctor, day) = (doctor_id.to_string(), date.to_string());
                Ok(rows_response(slots_schema(), slots, |enc, time| {
                    enc.encode_field(&doctor)?;
                    enc.encode_field(&day)?;
                    enc.encode_field(&time.to_string())
                }))
            }
            Command::SelectRecommendedSlots { doctor_id, date } => {
                let today = chrono::Utc::now().date_naive();
                let ranked = engine
                    .list_recommended_slots(doctor_id, date, today)
                    .await
                    .map_err(engine_err)?;
                let (doctor, day) = (doctor_id.to_string(), date.to_string());
                Ok(rows_response(recommended_schema(), ranked, |enc, slot| {
                    enc.encode_field(&doctor)?;
                    enc.encode_field(&day)?;
                    enc.encode_field(&slot.time.to_string())?;
                    enc.encode_field(&slot.score)
                }))
            }
            Command::InsertAppointment(req) => {
                if !may_book_for(actor, req.doctor_id, req.patient_id) {
                    return Err(engine_err(EngineError::Forbidden(
                        "patients may only book for themselves",
                    )));
                }
                match engine.book(req).await {
                    Ok(_) => {
                        metrics::counter!(observability::BOOKINGS_TOTAL).increment(1);
                        Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                    }
                    Err(e) => {
                        if matches!(e, EngineError::Conflict(_)) {
                            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                        }
                        Err(engine_err(e))
                    }
                }
            }
            Command::CancelAppointment { id } => {
                let rows = match engine.cancel(id, actor).await.map_err(engine_err)? {
                    CancelOutcome::Cancelled => {
                        metrics::counter!(observability::CANCELLATIONS_TOTAL).increment(1);
                        1
                    }
                    CancelOutcome::AlreadyCancelled => {
                        debug!("appointment {id} already cancelled");
                        0
                    }
                };
                Ok(Response::Execution(Tag::new("DELETE").with_rows(rows)))
            }
            Command::SetAppointmentStatus { id, status } => {
                let changed = engine
                    .update_status(id, status, actor)
                    .await
                    .map_err(engine_err)?;
                if changed && status == AppointmentStatus::Cancelled {
                    metrics::counter!(observability::CANCELLATIONS_TOTAL).increment(1);
                }
                Ok(Response::Execution(Tag::new("INSERT").with_rows(changed as usize)))
            }
            Command::InsertRating {
                appointment_id,
                rating,
                review,
            } => {
                engine
                    .rate(appointment_id, actor, rating, review)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectAppointments(filter) => {
                let appointments = match filter.id {
                    Some(id) => {
                        let a = engine.get_appointment(id, actor).await.map_err(engine_err)?;
                        if filter.matches(&a) { vec![a] } else { vec![] }
                    }
                    None => {
                        let mut all = engine.list_appointments(&filter).await;
                        all.retain(|a| actor.is_party_to(a));
                        all
                    }
                };
                Ok(rows_response(appointments_schema(), appointments, |enc, a| {
                    enc.encode_field(&a.id.to_string())?;
                    enc.encode_field(&a.doctor_id.to_string())?;
                    enc.encode_field(&a.patient_id.to_string())?;
                    enc.encode_field(&a.date.to_string())?;
                    enc.encode_field(&a.time.to_string())?;
                    enc.encode_field(&(a.duration_minutes as i64))?;
                    enc.encode_field(&a.status.to_string())?;
                    enc.encode_field(&a.notes)?;
                    enc.encode_field(&a.rating.map(i64::from))?;
                    enc.encode_field(&a.review)?;
                    enc.encode_field(&a.reminder_sent)
                }))
            }
            Command::Listen { channel } => {
                let channel: Channel = channel.parse().map_err(|e| user_error("42000", e))?;
                if !may_listen(actor, channel) {
                    return Err(engine_err(EngineError::Forbidden(
                        "may only listen on your own channel",
                    )));
                }
                let mut subs = self.subscriptions.lock().await;
                subs.entry(channel)
                    .or_insert_with(|| engine.notify.subscribe(channel));
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                let channel: Channel = channel.parse().map_err(|e| user_error("42000", e))?;
                self.subscriptions.lock().await.remove(&channel);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.subscriptions.lock().await.clear();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }

    /// Everything received on subscribed channels since the last call.
    async fn drain_pending(&self) -> Vec<(Channel, Notification)> {
        let mut subs = self.subscriptions.lock().await;
        let mut pending = Vec::new();
        subs.retain(|channel, rx| loop {
            match rx.try_recv() {
                Ok(n) => pending.push((*channel, n)),
                Err(TryRecvError::Empty) => break true,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("listener on {channel} lagged, {skipped} notifications dropped")
                }
                Err(TryRecvError::Closed) => break false,
            }
        });
        pending
    }

    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        for (channel, notification) in self.drain_pending().await {
            let message = NotificationResponse::new(self.pid, channel.to_string(), notification.to_json());
            client
                .send(PgWireBackendMessage::NotificationResponse(message))
                .await?;
        }
        Ok(())
    }
}

/// Registering a doctor or editing hours: admins, service connections, or
/// the doctor themself.
fn require_doctor_admin(actor: &Actor, doctor_id: ulid::Ulid) -> PgWireResult<()> {
    let allowed = match actor.role {
        Role::Admin | Role::Service => true,
        Role::Doctor => actor.id == Some(doctor_id),
        Role::Patient => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(engine_err(EngineError::Forbidden(
            "only the doctor or an admin may change a doctor's calendar",
        )))
    }
}

fn may_book_for(actor: &Actor, doctor_id: ulid::Ulid, patient_id: ulid::Ulid) -> bool {
    match actor.role {
        Role::Admin | Role::Service => true,
        Role::Doctor => actor.id == Some(doctor_id),
        Role::Patient => actor.id == Some(patient_id),
    }
}

fn may_listen(actor: &Actor, channel: Channel) -> bool {
    match (actor.role, channel) {
        (Role::Admin | Role::Service, _) => true,
        (Role::Doctor, Channel::Doctor(id)) | (Role::Patient, Channel::Patient(id)) => {
            actor.id == Some(id)
        }
        _ => false,
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn doctors_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("open_days", Type::INT8),
        field("active_appointments", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("doctor_id", Type::VARCHAR),
        field("weekday", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("is_available", Type::BOOL),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        field("doctor_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("time", Type::VARCHAR),
    ]
}

fn recommended_schema() -> Vec<FieldInfo> {
    let mut schema = slots_schema();
    schema.push(field("score", Type::FLOAT8));
    schema
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("doctor_id", Type::VARCHAR),
        field("patient_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("time", Type::VARCHAR),
        field("duration", Type::INT8),
        field("status", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("rating", Type::INT8),
        field("review", Type::VARCHAR),
        field("reminder_sent", Type::BOOL),
    ]
}

/// Row description for a statement, judged from its text. Used when the
/// statement still holds `$n` placeholders and cannot be parsed for real.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if !upper.starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("RECOMMENDED_SLOTS") {
        recommended_schema()
    } else if upper.contains("SLOTS") {
        slots_schema()
    } else if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("APPOINTMENTS") {
        appointments_schema()
    } else if upper.contains("DOCTORS") {
        doctors_schema()
    } else {
        vec![]
    }
}

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
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

#[async_trait]
impl SimpleQueryHandler for MedislotHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct MedislotQueryParser;

#[async_trait]
impl QueryParser for MedislotQueryParser {
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
impl ExtendedQueryHandler for MedislotHandler {
    type Statement = String;
    type QueryParser = MedislotQueryParser;

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
        self.run(client, &sql).await
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

/// Byte range and index of every `$N` placeholder outside quoted literals
/// and quoted identifiers.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote is an escaped quote and stays inside.
            Some(q) if b == q => {
                if bytes.get(i + 1) == Some(&q) {
                    i += 2;
                    continue;
                }
                quote = None;
            }
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let digits = bytes[i + 1..]
                    .iter()
                    .take_while(|d| d.is_ascii_digit())
                    .count();
                if let Ok(n) = sql[i + 1..i + 1 + digits].parse::<usize>() {
                    found.push((i..i + 1 + digits, n));
                    i += 1 + digits;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Inline bound text parameters as quoted literals in a single pass over the
/// statement, so text inside a bound value is never rescanned.
fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct MedislotFactory {
    handler: Arc<MedislotHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<MedislotAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl MedislotFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(MedislotHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                MedislotAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for MedislotFactory {
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

/// Serve one client socket until it disconnects. Each connection gets its
/// own handler, and with it its own LISTEN set.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(MedislotFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for an engine error.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) | EngineError::Conflict(_) => "23505",
        EngineError::InvalidTimeRange { .. }
        | EngineError::InvalidWindow { .. }
        | EngineError::InvalidInput(_) => "22023",
        EngineError::Forbidden(_) => "42501",
        EngineError::InvalidTransition { .. } | EngineError::InvalidState(_) => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    match &e {
        EngineError::WalError(_) => error!("{e}"),
        EngineError::LimitExceeded(_) => warn!("{e}"),
        _ => debug!("{e}"),
    }
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
