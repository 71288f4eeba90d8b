use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
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
use tokio::net::TcpStream;

use crate::auth::{caller_for, SlotguardAuthSource};
use crate::engine::{Engine, EngineError, ReserveRequest};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError, StatusRequest};

pub struct SlotguardHandler {
    engine: Arc<Engine>,
    admins: Arc<HashSet<String>>,
    query_parser: Arc<SlotguardQueryParser>,
}

impl SlotguardHandler {
    pub fn new(engine: Arc<Engine>, admins: Arc<HashSet<String>>) -> Self {
        Self {
            engine,
            admins,
            query_parser: Arc::new(SlotguardQueryParser),
        }
    }

    /// The startup `user` parameter is the caller identity.
    fn resolve_caller<C: ClientInfo>(&self, client: &C) -> PgWireResult<Caller> {
        match client.metadata().get("user") {
            Some(user) if !user.is_empty() => Ok(caller_for(user, &self.admins)),
            _ => {
                metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                Err(user_error("28000", "connection has no user".into()))
            }
        }
    }

    async fn run(&self, caller: &Caller, sql_text: &str) -> PgWireResult<Response> {
        let cmd = match sql::parse_sql(sql_text) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(
                    observability::QUERIES_TOTAL,
                    "command" => "unparsed",
                    "status" => "error"
                )
                .increment(1);
                return Err(sql_err(e));
            }
        };
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(caller, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        metrics::counter!(
            observability::QUERIES_TOTAL,
            "command" => label,
            "status" => if result.is_ok() { "ok" } else { "error" }
        )
        .increment(1);
        result
    }

    async fn execute_command(&self, caller: &Caller, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertTutor {
                id,
                name,
                utc_offset_minutes,
            } => {
                engine
                    .register_tutor(
                        caller,
                        Tutor {
                            id,
                            name,
                            utc_offset_minutes,
                        },
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertBooking {
                id,
                tutor_id,
                start,
                end,
                lesson_type,
                price_cents,
                user_id,
            } => {
                let payload = ReservationPayload::Booking {
                    user_id,
                    lesson_type,
                    price_cents,
                };
                self.reserve(caller, id, tutor_id, start, end, payload).await
            }
            Command::InsertGroupSession {
                id,
                tutor_id,
                start,
                end,
                title,
                max_students,
            } => {
                let payload = ReservationPayload::GroupSession {
                    title,
                    max_students,
                };
                self.reserve(caller, id, tutor_id, start, end, payload).await
            }
            Command::InsertTimeOff {
                id,
                tutor_id,
                start,
                end,
                reason,
            } => {
                let payload = ReservationPayload::TimeOff { reason };
                self.reserve(caller, id, tutor_id, start, end, payload).await
            }
            Command::Reschedule { id, start, end } => {
                engine
                    .reschedule(caller, id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::Cancel { id, reason } => {
                let outcome = engine.cancel(caller, id, reason).await.map_err(engine_err)?;
                // A request is an update: the booking stays until an admin resolves it.
                Ok(match outcome {
                    CancelOutcome::CancellationRequested => {
                        Response::Execution(Tag::new("UPDATE").with_rows(1))
                    }
                    CancelOutcome::Cancelled | CancelOutcome::Removed => {
                        Response::Execution(Tag::new("DELETE").with_rows(1))
                    }
                })
            }
            Command::SetStatus { id, status, reason } => {
                match status {
                    StatusRequest::PaymentPending => {
                        engine.mark_payment_pending(caller, id).await.map(|_| ())
                    }
                    StatusRequest::Resolve(outcome) => engine
                        .resolve_cancellation(caller, id, outcome, reason)
                        .await
                        .map(|_| ()),
                    StatusRequest::CompleteSession => {
                        engine.complete_session(caller, id).await.map(|_| ())
                    }
                }
                .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::RegisterParticipant {
                session_id,
                user_id,
            } => {
                engine
                    .register_participant(caller, session_id, user_id)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UnregisterParticipant {
                session_id,
                user_id,
            } => {
                engine
                    .unregister_participant(caller, session_id, user_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::ApplyPayment { notice } => {
                let outcome = engine
                    .apply_payment(caller, notice)
                    .await
                    .map_err(engine_err)?;
                Ok(match outcome {
                    PaymentOutcome::Applied => inserted(1),
                    PaymentOutcome::Duplicate => inserted(0),
                })
            }
            Command::SelectAvailability {
                tutor_id,
                day,
                min_duration,
            } => {
                let view = engine
                    .availability_view(tutor_id, day, min_duration)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let tid = view.tutor_id.to_string();
                let mut spans: Vec<(String, Span)> = view
                    .busy
                    .iter()
                    .map(|s| ("busy".to_string(), *s))
                    .chain(view.free.iter().map(|s| ("free".to_string(), *s)))
                    .collect();
                spans.sort_by_key(|(_, s)| s.start);
                let rows = spans
                    .into_iter()
                    .map(|(state, span)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&tid)?;
                        encoder.encode_field(&state)?;
                        encoder.encode_field(&span.start)?;
                        encoder.encode_field(&span.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectTutors => {
                let schema = Arc::new(tutors_schema());
                let rows = engine
                    .list_tutors()
                    .await
                    .into_iter()
                    .map(|t| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&t.id.to_string())?;
                        encoder.encode_field(&t.name)?;
                        encoder.encode_field(&i64::from(t.utc_offset_minutes))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectBookings {
                id,
                tutor_id,
                user_id,
            } => {
                let mut bookings = if let Some(id) = id {
                    vec![engine.get_booking(caller, id).await.map_err(engine_err)?]
                } else if let Some(tutor_id) = tutor_id {
                    engine
                        .bookings_for_tutor(caller, tutor_id)
                        .await
                        .map_err(engine_err)?
                } else {
                    let user = user_id.unwrap_or_else(|| caller.user_id.clone());
                    engine
                        .bookings_for_user(caller, &user)
                        .await
                        .map_err(engine_err)?
                };
                // Extra filters narrow the primary lookup.
                if let Some(t) = tutor_id {
                    bookings.retain(|b| b.tutor_id == t);
                }
                let schema = Arc::new(bookings_schema());
                let rows = bookings
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.tutor_id.to_string())?;
                        encoder.encode_field(&b.user_id)?;
                        encoder.encode_field(&b.lesson_type)?;
                        encoder.encode_field(&(b.price_cents as i64))?;
                        encoder.encode_field(&b.span.start)?;
                        encoder.encode_field(&b.span.end)?;
                        encoder.encode_field(&b.status.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectGroupSessions { tutor_id } => {
                let sessions = engine
                    .sessions_for_tutor(tutor_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(sessions_schema());
                let rows = sessions
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.tutor_id.to_string())?;
                        encoder.encode_field(&s.title)?;
                        encoder.encode_field(&s.span.start)?;
                        encoder.encode_field(&s.span.end)?;
                        encoder.encode_field(&i64::from(s.max_students))?;
                        encoder.encode_field(&i64::from(s.participant_count()))?;
                        encoder.encode_field(&s.status.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectTimeOff { tutor_id } => {
                let entries = engine
                    .time_off_for_tutor(tutor_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(time_off_schema());
                let rows = entries
                    .into_iter()
                    .map(|t| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&t.id.to_string())?;
                        encoder.encode_field(&t.tutor_id.to_string())?;
                        encoder.encode_field(&t.span.start)?;
                        encoder.encode_field(&t.span.end)?;
                        encoder.encode_field(&t.reason)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectCredits { user_id } => {
                let user = user_id.unwrap_or_else(|| caller.user_id.clone());
                let balances: BTreeMap<String, u32> =
                    engine.credits(caller, &user).await.map_err(engine_err)?;
                let schema = Arc::new(credits_schema());
                let rows = balances
                    .into_iter()
                    .map(|(credit_type, amount)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&user)?;
                        encoder.encode_field(&credit_type)?;
                        encoder.encode_field(&i64::from(amount))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
        }
    }

    async fn reserve(
        &self,
        caller: &Caller,
        id: ulid::Ulid,
        tutor_id: ulid::Ulid,
        start: Ms,
        end: Ms,
        payload: ReservationPayload,
    ) -> PgWireResult<Response> {
        self.engine
            .reserve(
                caller,
                ReserveRequest {
                    id: Some(id),
                    tutor_id,
                    start,
                    end,
                    payload,
                },
            )
            .await
            .map_err(engine_err)?;
        Ok(inserted(1))
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn query_response(
    schema: Arc<Vec<FieldInfo>>,
    rows: Vec<PgWireResult<pgwire::messages::data::DataRow>>,
) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text("tutor_id"), text("state"), int8("start"), int8("end")]
}

fn tutors_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("name"), int8("utc_offset_minutes")]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("tutor_id"),
        text("user_id"),
        text("lesson_type"),
        int8("price_cents"),
        int8("start"),
        int8("end"),
        text("status"),
    ]
}

fn sessions_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("tutor_id"),
        text("title"),
        int8("start"),
        int8("end"),
        int8("max_students"),
        int8("participants"),
        text("status"),
    ]
}

fn time_off_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("tutor_id"),
        int8("start"),
        int8("end"),
        text("reason"),
    ]
}

fn credits_schema() -> Vec<FieldInfo> {
    vec![text("user_id"), text("credit_type"), int8("amount")]
}

/// Table name following `FROM` in a SELECT, lowercased.
fn select_table(sql_text: &str) -> Option<String> {
    let lower = sql_text.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return None;
    }
    let rest = &lower[lower.find(" from ")? + " from ".len()..];
    rest.split(|c: char| c.is_whitespace() || c == ';')
        .find(|s| !s.is_empty())
        .map(|s| s.trim_matches('"').to_string())
}

/// Row description for a statement, before it runs.
fn result_schema(sql_text: &str) -> Vec<FieldInfo> {
    match select_table(sql_text).as_deref() {
        Some("availability") => availability_schema(),
        Some("tutors") => tutors_schema(),
        Some("bookings") => bookings_schema(),
        Some("group_sessions") => sessions_schema(),
        Some("time_off") => time_off_schema(),
        Some("credits") => credits_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotguardHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let caller = self.resolve_caller(client)?;
        Ok(vec![self.run(&caller, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotguardQueryParser;

#[async_trait]
impl QueryParser for SlotguardQueryParser {
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
impl ExtendedQueryHandler for SlotguardHandler {
    type Statement = String;
    type QueryParser = SlotguardQueryParser;

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
        let caller = self.resolve_caller(client)?;
        let sql_text = substitute_params(portal);
        self.run(&caller, &sql_text).await
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
            if let Ok(n) = sql[start..i].parse::<usize>() {
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

/// Inline bound values in one left-to-right pass, so text inside a value is
/// never mistaken for a placeholder. Unknown `$n` stay as written.
fn substitute(sql: &str, params: &[Option<Bytes>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let param = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        match param {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes);
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            Some(None) => result.push_str("NULL"),
            None => result.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    result.push_str(rest);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotguardFactory {
    handler: Arc<SlotguardHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotguardAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotguardFactory {
    pub fn new(engine: Arc<Engine>, password: String, admins: Arc<HashSet<String>>) -> Self {
        let auth_source = SlotguardAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotguardHandler::new(engine, admins)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotguardFactory {
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
    engine: Arc<Engine>,
    password: String,
    admins: Arc<HashSet<String>>,
) -> std::io::Result<()> {
    let factory = SlotguardFactory::new(engine, password, admins);
    pgwire::tokio::process_socket(socket, None, factory).await
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
        EngineError::SlotAlreadyBooked(_) | EngineError::TutorUnavailable(_) => "23P01",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Unauthorized(_) => "42501",
        EngineError::NotFound(_) => "P0002",
        EngineError::InvalidInterval(_) | EngineError::LimitExceeded(_) => "22023",
        EngineError::TransactionConflict => "40001",
        EngineError::WalError(_) => "58030",
        _ => "P0001",
    }
}

fn engine_message(e: &EngineError) -> String {
    format!("{}: {}", e.code(), e.user_message())
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), engine_message(&e))
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
