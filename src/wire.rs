use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use futures::{Sink, SinkExt, stream};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, warn};

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::notify::{channel_name, parse_channel};
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SlotlineFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

type Listens = HashMap<String, broadcast::Receiver<Notification>>;

/// Per-connection handler. `listens` holds this connection's LISTEN
/// subscriptions, keyed by channel name.
pub struct SlotlineHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotlineQueryParser>,
    listens: Mutex<Listens>,
}

impl SlotlineHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotlineQueryParser),
            listens: Mutex::new(HashMap::new()),
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

    fn listens(&self) -> MutexGuard<'_, Listens> {
        self.listens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Parse, execute and record one statement.
    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertResource { id, capacity, name } => {
                engine
                    .create_resource(id, name, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeactivateResource { id } => {
                engine
                    .set_resource_active(id, false)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::Join {
                resource_id,
                actor_id,
            } => {
                let outcome = engine.join(resource_id, &actor_id).await.map_err(engine_err)?;
                let row = match outcome {
                    JoinOutcome::Joined => ("joined", None),
                    JoinOutcome::Waitlisted { position } => ("waitlisted", Some(position)),
                };
                outcome_response(row)
            }
            Command::Leave {
                resource_id,
                actor_id,
            } => {
                engine
                    .leave(resource_id, &actor_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::JoinWaitlist {
                resource_id,
                actor_id,
            } => {
                let position = engine
                    .join_waitlist(resource_id, &actor_id)
                    .await
                    .map_err(engine_err)?;
                outcome_response(("waitlisted", Some(position)))
            }
            Command::LeaveWaitlist {
                resource_id,
                actor_id,
            } => {
                engine
                    .leave_waitlist(resource_id, &actor_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::Confirm {
                resource_id,
                actor_id,
            } => {
                let outcome = engine
                    .confirm_from_waitlist(resource_id, &actor_id)
                    .await
                    .map_err(engine_err)?;
                let row = match outcome {
                    ConfirmOutcome::Confirmed => ("confirmed", None),
                    ConfirmOutcome::Requeued { position } => ("requeued", Some(position)),
                };
                outcome_response(row)
            }
            Command::SelectResources => {
                let schema = Arc::new(resources_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_resources()
                    .await
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.name)?;
                        encoder.encode_field(&r.active)?;
                        encoder.encode_field(&i64::from(r.ledger.capacity))?;
                        encoder.encode_field(&i64::from(r.ledger.confirmed))?;
                        encoder.encode_field(&i64::from(r.ledger.available()))?;
                        encoder.encode_field(&i64::from(r.ledger.notified))?;
                        encoder.encode_field(&i64::from(r.ledger.waiting))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectReservations { resource_id } => {
                let records = engine
                    .reservations(resource_id, true)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(reservations_schema());
                let rows: Vec<PgWireResult<_>> = records
                    .into_iter()
                    .map(|r| {
                        let state = match r.state {
                            ReservationState::Confirmed => "confirmed",
                            ReservationState::Released => "released",
                        };
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.resource_id.to_string())?;
                        encoder.encode_field(&r.actor_id)?;
                        encoder.encode_field(&state)?;
                        encoder.encode_field(&r.confirmed_at)?;
                        encoder.encode_field(&r.released_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectWaitlist { resource_id } => {
                let entries = engine
                    .waitlist(resource_id, true)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(waitlist_schema());
                let rows: Vec<PgWireResult<_>> = entries
                    .into_iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&e.id.to_string())?;
                        encoder.encode_field(&e.resource_id.to_string())?;
                        encoder.encode_field(&e.actor_id)?;
                        encoder.encode_field(&i64::from(e.position))?;
                        encoder.encode_field(&e.state.as_str())?;
                        encoder.encode_field(&e.joined_at)?;
                        encoder.encode_field(&e.notified_at)?;
                        encoder.encode_field(&e.expires_at)?;
                        encoder.encode_field(&e.closed_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::Listen { channel } => {
                let resource_id = parse_channel(&channel).ok_or_else(|| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("invalid channel: {channel} (expected resource_{{id}})"),
                    )))
                })?;
                let receiver = engine.notify.subscribe(resource_id);
                self.listens().insert(channel, receiver);
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                let removed = self.listens().remove(&channel);
                if let (Some(receiver), Some(resource_id)) = (removed, parse_channel(&channel)) {
                    drop(receiver);
                    engine.notify.remove_if_idle(&resource_id);
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                let channels: Vec<String> = self.listens().drain().map(|(c, _)| c).collect();
                for resource_id in channels.iter().filter_map(|c| parse_channel(c)) {
                    engine.notify.remove_if_idle(&resource_id);
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }

    /// Everything received on this connection's subscriptions since the
    /// last command, as NotificationResponse messages.
    fn pending_notifications(&self) -> Vec<PgWireBackendMessage> {
        let mut out = Vec::new();
        for (channel, receiver) in self.listens().iter_mut() {
            loop {
                match receiver.try_recv() {
                    Ok(n) => match serde_json::to_string(&n) {
                        Ok(payload) => out.push(PgWireBackendMessage::NotificationResponse(
                            NotificationResponse::new(0, channel_name(n.resource_id), payload),
                        )),
                        Err(e) => warn!("dropping notification on {channel}: {e}"),
                    },
                    Err(TryRecvError::Lagged(missed)) => {
                        warn!("listener on {channel} lagged, {missed} notifications lost");
                    }
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }
        }
        out
    }

    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let pending = self.pending_notifications();
        if !pending.is_empty() {
            debug!("delivering {} notifications", pending.len());
        }
        for message in pending {
            client.send(message).await?;
        }
        Ok(())
    }
}

fn outcome_response((outcome, position): (&str, Option<u32>)) -> PgWireResult<Vec<Response>> {
    let schema = Arc::new(outcome_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&outcome)?;
    encoder.encode_field(&position.map(i64::from))?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(vec![Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    ))])
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn outcome_schema() -> Vec<FieldInfo> {
    vec![field("outcome", Type::VARCHAR), field("position", Type::INT8)]
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("active", Type::BOOL),
        field("capacity", Type::INT8),
        field("confirmed", Type::INT8),
        field("available", Type::INT8),
        field("notified", Type::INT8),
        field("waiting", Type::INT8),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("actor_id", Type::VARCHAR),
        field("state", Type::VARCHAR),
        field("confirmed_at", Type::INT8),
        field("released_at", Type::INT8),
    ]
}

fn waitlist_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("actor_id", Type::VARCHAR),
        field("position", Type::INT8),
        field("state", Type::VARCHAR),
        field("joined_at", Type::INT8),
        field("notified_at", Type::INT8),
        field("expires_at", Type::INT8),
        field("closed_at", Type::INT8),
    ]
}

/// Row shape of a statement, judged from its text so unbound `$n`
/// placeholders don't matter.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mentions = |table: &str| lower.contains(table);
    if lower.trim_start().starts_with("select") {
        if mentions("reservations") {
            reservations_schema()
        } else if mentions("waitlist") {
            waitlist_schema()
        } else if mentions("resources") {
            resources_schema()
        } else {
            vec![]
        }
    } else if lower.trim_start().starts_with("insert")
        && (mentions("reservations") || mentions("waitlist") || mentions("confirmations"))
    {
        outcome_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotlineHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let result = self.run(&engine, query).await;
        self.deliver_notifications(client).await?;
        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotlineQueryParser;

#[async_trait]
impl QueryParser for SlotlineQueryParser {
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
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotlineHandler {
    type Statement = String;
    type QueryParser = SlotlineQueryParser;

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
        let result = self.run(&engine, &sql).await;
        self.deliver_notifications(client).await?;
        let mut responses = result?;
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
            schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for(
            &target.statement.statement,
        )))
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

/// Inline bound text-format parameters as quoted literals. Walks backwards
/// so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.clone();
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

// ── Auth ─────────────────────────────────────────────────────────

/// One shared cleartext password for every user and tenant.
#[derive(Debug)]
pub struct SlotlineAuthSource {
    password: String,
}

impl SlotlineAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SlotlineAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotlineFactory {
    handler: Arc<SlotlineHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotlineAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotlineFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(SlotlineHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SlotlineAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotlineFactory {
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

/// Contention is `serialization_failure` so clients retry; the rest are raised exceptions.
fn sqlstate(e: &EngineError) -> &'static str {
    if e.is_retryable() { "40001" } else { "P0001" }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
