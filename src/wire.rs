use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
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

use crate::auth::ParkdAuthSource;
use crate::context::Context;
use crate::engine::{Actor, EngineError};
use crate::error::ConfigError;
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::schedule::ScheduleUpdate;
use crate::sql::{self, Command, ReservationFilter};
use crate::timezone::TIMEZONE_KEY;

pub struct ParkdHandler {
    ctx: Arc<Context>,
    admins: Arc<Vec<String>>,
    query_parser: Arc<ParkdQueryParser>,
}

impl ParkdHandler {
    pub fn new(ctx: Arc<Context>, admins: Vec<String>) -> Self {
        Self {
            ctx,
            admins: Arc::new(admins),
            query_parser: Arc::new(ParkdQueryParser),
        }
    }

    /// The session user is the actor; admin iff listed in the admin set.
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let user = client
            .metadata()
            .get("user")
            .cloned()
            .ok_or_else(|| user_error("28000", "no session user".into()))?;
        if self.admins.iter().any(|a| *a == user) {
            Ok(Actor::admin(user))
        } else {
            Ok(Actor::user(user))
        }
    }

    async fn run(&self, actor: &Actor, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, actor: &Actor, cmd: Command) -> PgWireResult<Vec<Response>> {
        let ctx = &self.ctx;
        match cmd {
            Command::InsertResource { id, lot_id, name } => {
                require_admin(actor)?;
                ctx.engine
                    .create_resource(id, lot_id, name)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectResources => {
                let resources = ctx.engine.list_resources().await;
                let schema = Arc::new(resources_schema());
                let rows: Vec<PgWireResult<_>> = resources
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.lot_id.to_string())?;
                        encoder.encode_field(&r.name)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertReservation {
                id,
                resource_id,
                start,
                end,
                label,
            } => {
                ctx.engine
                    .create_reservation(id, resource_id, actor, start, end, label)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteReservation { id } => {
                ctx.engine
                    .cancel_reservation(id, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectReservations { filter } => {
                let reservations = match filter {
                    ReservationFilter::Mine => ctx.engine.reservations_for_owner(&actor.id).await,
                    ReservationFilter::Owner(owner) => {
                        if owner != actor.id && !actor.admin {
                            return Err(user_error(
                                "42501",
                                "only administrators may list other owners' reservations".into(),
                            ));
                        }
                        ctx.engine.reservations_for_owner(&owner).await
                    }
                    ReservationFilter::Resource(rid) => ctx
                        .engine
                        .reservations_for_resource(rid)
                        .await
                        .map_err(engine_err)?,
                    ReservationFilter::Id(id) => match ctx.engine.get_reservation(id).await {
                        Ok(r) => vec![r],
                        Err(EngineError::NotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                };

                let schema = Arc::new(reservations_schema());
                let rows: Vec<PgWireResult<_>> = reservations
                    .into_iter()
                    .map(|r| {
                        let owner = visible_owner(actor, &r);
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.resource_id.to_string())?;
                        encoder.encode_field(&owner)?;
                        encoder.encode_field(&r.span.start)?;
                        encoder.encode_field(&r.span.end)?;
                        encoder.encode_field(&r.status.as_str().to_string())?;
                        encoder.encode_field(&r.label)?;
                        encoder.encode_field(&r.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectAvailability { lot_id, start, end } => {
                let slots = ctx
                    .engine
                    .availability(lot_id, start, end)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.resource_id.to_string())?;
                        encoder.encode_field(&slot.is_booked())?;
                        encoder.encode_field(&slot.booking.flatten())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::UpsertSchedule {
                kind,
                enabled,
                frequency,
                hour,
                timezone,
                recipients,
                template,
            } => {
                require_admin(actor)?;
                let kind = JobKind::parse(&kind).ok_or(ConfigError::UnknownJobKind(kind)).map_err(config_err)?;
                let frequency = Frequency::parse(&frequency)
                    .ok_or(ConfigError::UnknownFrequency(frequency))
                    .map_err(config_err)?;
                let update = ScheduleUpdate {
                    enabled,
                    timezone,
                    recipients,
                    template,
                    ..ScheduleUpdate::new(kind, frequency, hour)
                };
                ctx.schedules.configure(update).await.map_err(config_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectSchedules => {
                require_admin(actor)?;
                let schedules = ctx.schedules.list().await;
                let schema = Arc::new(schedules_schema());
                let rows: Vec<PgWireResult<_>> = schedules
                    .into_iter()
                    .map(|s| {
                        let last_result = s.last_result.as_ref().map(|o| match o {
                            JobOutcome::Success => "success".to_string(),
                            JobOutcome::Failure(reason) => format!("failure: {reason}"),
                        });
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.kind.as_str().to_string())?;
                        encoder.encode_field(&s.enabled)?;
                        encoder.encode_field(&s.frequency.as_str().to_string())?;
                        encoder.encode_field(&(s.target_hour as i32))?;
                        encoder.encode_field(&s.timezone)?;
                        encoder.encode_field(&s.recipients.join(","))?;
                        encoder.encode_field(&s.template)?;
                        encoder.encode_field(&s.last_fired)?;
                        encoder.encode_field(&last_result)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SetSetting { key, value } => {
                require_admin(actor)?;
                if key != TIMEZONE_KEY {
                    return Err(user_error("22023", format!("unknown setting: {key}")));
                }
                ctx.timezone
                    .set_timezone(value.as_deref())
                    .await
                    .map_err(config_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectSettings => {
                require_admin(actor)?;
                let schema = Arc::new(settings_schema());
                let rows: Vec<PgWireResult<_>> = ctx
                    .settings
                    .list()
                    .into_iter()
                    .map(|(key, value)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&key)?;
                        encoder.encode_field(&value)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::DeleteOwner { id } => {
                require_admin(actor)?;
                let count = ctx.engine.forget_owner(&id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(count))])
            }
        }
    }
}

/// Owners are visible to themselves and administrators only.
fn visible_owner(actor: &Actor, r: &Reservation) -> Option<String> {
    match &r.owner {
        Some(owner) if actor.admin || *owner == actor.id => Some(owner.clone()),
        _ => None,
    }
}

fn require_admin(actor: &Actor) -> PgWireResult<()> {
    if actor.admin {
        Ok(())
    } else {
        Err(user_error(
            "42501",
            format!("permission denied: {} is not an administrator", actor.id),
        ))
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text("resource_id", Type::VARCHAR),
        text("booked", Type::BOOL),
        text("label", Type::VARCHAR),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        text("id", Type::VARCHAR),
        text("resource_id", Type::VARCHAR),
        text("owner", Type::VARCHAR),
        text("start", Type::INT8),
        text("end", Type::INT8),
        text("status", Type::VARCHAR),
        text("label", Type::VARCHAR),
        text("created_at", Type::INT8),
    ]
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![
        text("id", Type::VARCHAR),
        text("lot_id", Type::VARCHAR),
        text("name", Type::VARCHAR),
    ]
}

fn schedules_schema() -> Vec<FieldInfo> {
    vec![
        text("kind", Type::VARCHAR),
        text("enabled", Type::BOOL),
        text("frequency", Type::VARCHAR),
        text("hour", Type::INT4),
        text("timezone", Type::VARCHAR),
        text("recipients", Type::VARCHAR),
        text("template", Type::VARCHAR),
        text("last_fired", Type::INT8),
        text("last_result", Type::VARCHAR),
    ]
}

fn settings_schema() -> Vec<FieldInfo> {
    vec![text("key", Type::VARCHAR), text("value", Type::VARCHAR)]
}

/// Result columns for a statement, keyed on the table after `FROM`.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    let table = upper
        .split_once(" FROM ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|t| t.trim_matches(|c| c == '"' || c == ';').to_string())
        .unwrap_or_default();
    match table.as_str() {
        "AVAILABILITY" => availability_schema(),
        "RESERVATIONS" => reservations_schema(),
        "RESOURCES" => resources_schema(),
        "SCHEDULES" => schedules_schema(),
        "SETTINGS" => settings_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ParkdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.resolve_actor(client)?;
        self.run(&actor, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ParkdQueryParser;

#[async_trait]
impl QueryParser for ParkdQueryParser {
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
impl ExtendedQueryHandler for ParkdHandler {
    type Statement = String;
    type QueryParser = ParkdQueryParser;

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
        let actor = self.resolve_actor(client)?;
        let sql = substitute_params(portal);
        let mut responses = self.run(&actor, &sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
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
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>() {
                    max = max.max(n);
                }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ParkdFactory {
    handler: Arc<ParkdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ParkdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ParkdFactory {
    pub fn new(ctx: Arc<Context>, password: String, admins: Vec<String>) -> Self {
        let auth_source = ParkdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ParkdHandler::new(ctx, admins)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ParkdFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<ParkdFactory>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_code(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict(_) => "23P01",
        EngineError::InvalidRange { .. } => "22007",
        EngineError::NotFound(_) => "02000",
        EngineError::Forbidden(_) => "42501",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Journal(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if !e.is_user_error() {
        tracing::error!("engine failure: {e}");
    }
    user_error(engine_code(&e), e.to_string())
}

fn config_code(e: &ConfigError) -> &'static str {
    match e {
        ConfigError::Journal(_) => "XX000",
        _ => "22023",
    }
}

fn config_err(e: ConfigError) -> PgWireError {
    if matches!(e, ConfigError::Journal(_)) {
        tracing::error!("configuration write failed: {e}");
    }
    user_error(config_code(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
