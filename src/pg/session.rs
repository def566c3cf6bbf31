//! Protocol state machine for one PostgreSQL connection.
//!
//! [`Session`] owns no socket. The driver feeds it backend frames through
//! [`Session::handle_message`] and forwards whatever it produces:
//!
//! - output bytes ([`Session::take_output`]) to write to the socket
//! - completed requests ([`Session::take_completions`]) to hand back to callers
//! - events ([`Session::drain_events`]) for the connection observer
//!
//! Requests are encoded as soon as they are enqueued (pipelining) and matched
//! to responses in FIFO order: one request is current, the rest wait in the
//! queue. A request ends on the ReadyForQuery that follows its Sync (or its
//! simple Query).
//!
//! Any `Err` returned by `handle_message` is fatal: the driver destroys the
//! session, which resolves every outstanding request as connection-closed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::codec::MessageWriter;
use super::error::{PgError, PgResult, ServerError};
use super::protocol::*;
use super::scram::{self, ScramClient};
use super::statement::{PreparedStatement, SharedColumns, StatementCache};
use super::types::ColumnDecoder;
use crate::notify::Notification;
use crate::query::Query;
use crate::result::{Data, Meta, QueryResult, Row};
use crate::schema::SchemaRegistry;

// ============================================================================
// Requests
// ============================================================================

/// Result shape a caller expects from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Rows if the statement returns any, otherwise no data.
    Any,
    /// The statement must not return a row set.
    NoRows,
    /// The statement must return a row set.
    Rows,
    /// The statement must return a row set; only the first row is kept.
    Row,
}

/// Channel a request's result is delivered on.
pub type Reply = oneshot::Sender<QueryResult>;

/// One unit of work in flight on a connection.
pub struct Request {
    query: Query,
    expect: Expect,
    reply: Option<Reply>,
    /// Prepared statement used by this request
    statement: Option<Arc<PreparedStatement>>,
    /// This request carried the Parse for `statement`
    parsed: bool,
    /// This request sent a statement Describe
    describing: bool,
    columns: Option<SharedColumns>,
    decoders: Vec<ColumnDecoder>,
    rows: Vec<Row>,
    rows_affected: u64,
    command: Option<String>,
    error: Option<ServerError>,
}

impl Request {
    pub fn new(query: Query, expect: Expect, reply: Reply) -> Self {
        Self::build(query, expect, Some(reply))
    }

    /// A request nobody waits for.
    pub fn detached(query: Query, expect: Expect) -> Self {
        Self::build(query, expect, None)
    }

    fn build(query: Query, expect: Expect, reply: Option<Reply>) -> Self {
        Self {
            query,
            expect,
            reply,
            statement: None,
            parsed: false,
            describing: false,
            columns: None,
            decoders: Vec::new(),
            rows: Vec::new(),
            rows_affected: 0,
            command: None,
            error: None,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    fn set_columns(&mut self, columns: SharedColumns) {
        self.decoders = columns
            .iter()
            .map(|field| match self.query.decoder_for(&field.name) {
                Some(f) => ColumnDecoder::Custom(Arc::clone(f)),
                None => ColumnDecoder::for_oid(field.type_oid),
            })
            .collect();
        self.columns = Some(columns);
    }

    /// Columns of the result, from this request's describe or the statement's.
    fn resolve_columns(&mut self) -> Option<&SharedColumns> {
        if self.columns.is_none() {
            if let Some(cols) = self.statement.as_ref().and_then(|s| s.columns()).cloned() {
                self.set_columns(cols);
            }
        }
        self.columns.as_ref()
    }

    fn has_row_set(&mut self) -> bool {
        self.resolve_columns().is_some_and(|c| !c.is_empty())
    }

    fn closed(self) -> Completion {
        Completion {
            reply: self.reply,
            result: QueryResult::connection_closed(),
        }
    }
}

/// A finished request, ready to be delivered to its caller.
pub struct Completion {
    reply: Option<Reply>,
    pub result: QueryResult,
}

impl Completion {
    /// Send the result to the caller. A caller that went away is ignored.
    pub fn deliver(self) {
        if let Some(reply) = self.reply {
            let _ = reply.send(self.result);
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Startup and authentication parameters.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    pub application_name: Option<String>,
    pub statement_cache_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Socket not yet open; requests are buffered.
    Connecting,
    /// Startup sent; authentication in progress.
    Authenticating,
    /// First ReadyForQuery received.
    Ready,
    /// Terminal.
    Destroyed,
}

/// Something the connection observer should hear about.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The first ReadyForQuery arrived.
    Connected,
    /// The last outstanding request completed.
    Idle,
    Notification(Notification),
}

pub struct Session {
    id: u64,
    options: SessionOptions,
    schema: Arc<SchemaRegistry>,
    phase: Phase,
    /// Bytes to write to the socket
    out: MessageWriter,
    /// Requests encoded before the connection was ready
    pending: MessageWriter,
    current: Option<Request>,
    queue: VecDeque<Request>,
    tx_status: TransactionStatus,
    statements: StatementCache,
    scram: Option<ScramClient>,
    parameters: HashMap<String, String>,
    backend_key: Option<(i32, i32)>,
    completions: Vec<Completion>,
    events: Vec<SessionEvent>,
}

impl Session {
    pub fn new(id: u64, options: SessionOptions, schema: Arc<SchemaRegistry>) -> Self {
        let statements = StatementCache::new(options.statement_cache_capacity);
        Self {
            id,
            options,
            schema,
            phase: Phase::Connecting,
            out: MessageWriter::new(),
            pending: MessageWriter::new(),
            current: None,
            queue: VecDeque::new(),
            tx_status: TransactionStatus::Idle,
            statements,
            scram: None,
            parameters: HashMap::new(),
            backend_key: None,
            completions: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_destroyed(&self) -> bool {
        self.phase == Phase::Destroyed
    }

    pub fn tx_status(&self) -> TransactionStatus {
        self.tx_status
    }

    /// A server parameter reported with ParameterStatus.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Backend process id and secret key.
    pub fn backend_key(&self) -> Option<(i32, i32)> {
        self.backend_key
    }

    /// Number of requests not yet completed.
    pub fn outstanding(&self) -> usize {
        self.current.iter().count() + self.queue.len()
    }

    pub fn statements(&self) -> &StatementCache {
        &self.statements
    }

    /// Socket is open: write the startup message.
    pub fn start(&mut self) {
        if self.phase != Phase::Connecting {
            return;
        }

        let mut options = vec![("client_encoding".to_string(), "UTF8".to_string())];
        if let Some(name) = &self.options.application_name {
            options.push(("application_name".to_string(), name.clone()));
        }

        StartupMessage {
            user: self.options.user.clone(),
            database: Some(self.options.database.clone()),
            options,
        }
        .write(&mut self.out);

        self.phase = Phase::Authenticating;
    }

    /// Queue a request and encode its messages.
    pub fn enqueue(&mut self, mut req: Request) {
        match self.phase {
            Phase::Destroyed => {
                self.completions.push(req.closed());
                return;
            }
            Phase::Ready => {
                write_request(&mut self.statements, &mut self.out, &mut req);
                if self.current.is_none() {
                    self.current = Some(req);
                    return;
                }
            }
            Phase::Connecting | Phase::Authenticating => {
                write_request(&mut self.statements, &mut self.pending, &mut req);
            }
        }
        self.queue.push_back(req);
    }

    /// Process one backend message.
    pub fn handle_message(&mut self, tag: u8, payload: Bytes) -> PgResult<()> {
        if self.phase == Phase::Destroyed {
            return Ok(());
        }

        let msg = BackendMessage::parse(tag, payload)?;
        trace!(conn = self.id, tag = %(tag as char), "backend message");

        match msg {
            BackendMessage::ParameterStatus { name, value } => {
                self.parameters.insert(name, value);
                Ok(())
            }
            BackendMessage::NoticeResponse { fields } => {
                debug!(
                    conn = self.id,
                    notice = %ServerError::from_fields(&fields),
                    "server notice"
                );
                Ok(())
            }
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => self.handle_notification(process_id, channel, payload),
            msg if self.phase == Phase::Ready => self.handle_ready(msg),
            msg => self.handle_startup(msg),
        }
    }

    /// Bytes waiting to be written to the socket.
    pub fn take_output(&mut self) -> Bytes {
        self.out.take()
    }

    pub fn has_output(&self) -> bool {
        !self.out.is_empty()
    }

    pub fn take_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completions)
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Enter the terminal state.
    ///
    /// The current request and then every queued request complete as
    /// connection-closed, in order. A ready session writes Terminate as its
    /// last output.
    pub fn destroy(&mut self) {
        if self.phase == Phase::Destroyed {
            return;
        }
        let was_ready = self.phase == Phase::Ready;
        self.phase = Phase::Destroyed;

        let outstanding = self.current.take().into_iter().chain(self.queue.drain(..));
        self.completions.extend(outstanding.map(Request::closed));

        self.out.clear();
        self.pending.clear();
        self.scram = None;

        if was_ready {
            TerminateMessage.write(&mut self.out);
        }
        debug!(conn = self.id, "session destroyed");
    }

    // ------------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------------

    fn password(&self) -> PgResult<&str> {
        self.options
            .password
            .as_deref()
            .ok_or_else(|| PgError::Auth("Password required".to_string()))
    }

    fn handle_startup(&mut self, msg: BackendMessage) -> PgResult<()> {
        if self.phase != Phase::Authenticating {
            return Err(PgError::Protocol(format!(
                "Message before startup: {:?}",
                msg
            )));
        }

        match msg {
            BackendMessage::AuthenticationOk => {
                debug!(conn = self.id, "authenticated");
            }
            BackendMessage::AuthenticationCleartextPassword => {
                let password = self.password()?.to_string();
                PasswordMessage { password }.write(&mut self.out);
            }
            BackendMessage::AuthenticationMD5Password { salt } => {
                let hash = md5_password(&self.options.user, self.password()?, &salt);
                PasswordMessage { password: hash }.write(&mut self.out);
            }
            BackendMessage::AuthenticationSASL { mechanisms } => {
                if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
                    return Err(PgError::Auth(format!(
                        "Server requires unsupported SASL mechanisms: {:?}",
                        mechanisms
                    )));
                }

                let mut client = ScramClient::new(self.password()?);
                SaslInitialResponseMessage {
                    mechanism: scram::MECHANISM.to_string(),
                    data: client.client_first(),
                }
                .write(&mut self.out);
                self.scram = Some(client);
            }
            BackendMessage::AuthenticationSASLContinue { data } => {
                let client = self.scram.as_mut().ok_or_else(|| {
                    PgError::Protocol("SASL continue without SASL start".to_string())
                })?;
                let data = client
                    .client_final(&data)
                    .map_err(|e| PgError::Auth(e.to_string()))?;
                SaslResponseMessage { data }.write(&mut self.out);
            }
            BackendMessage::AuthenticationSASLFinal { data } => {
                let mut client = self.scram.take().ok_or_else(|| {
                    PgError::Protocol("SASL final without SASL start".to_string())
                })?;
                client
                    .verify_server_final(&data)
                    .map_err(|e| PgError::Auth(e.to_string()))?;
            }
            BackendMessage::AuthenticationUnsupported { code } => {
                return Err(PgError::Auth(format!(
                    "Unsupported authentication method: {}",
                    code
                )));
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                self.backend_key = Some((process_id, secret_key));
            }
            BackendMessage::ReadyForQuery { status } => {
                self.tx_status = status;
                self.phase = Phase::Ready;
                self.out.append(&mut self.pending);
                self.current = self.queue.pop_front();
                self.events.push(SessionEvent::Connected);
                debug!(conn = self.id, queued = self.outstanding(), "connected");
            }
            BackendMessage::ErrorResponse { fields } => {
                return Err(PgError::Server(ServerError::from_fields(&fields)));
            }
            other => {
                return Err(PgError::Protocol(format!(
                    "Unexpected message during startup: {:?}",
                    other
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Steady state
    // ------------------------------------------------------------------------

    fn current(&mut self, what: &str) -> PgResult<&mut Request> {
        self.current
            .as_mut()
            .ok_or_else(|| PgError::Protocol(format!("{} without a pending request", what)))
    }

    fn handle_ready(&mut self, msg: BackendMessage) -> PgResult<()> {
        match msg {
            BackendMessage::RowDescription { fields } => {
                let req = self.current("RowDescription")?;
                let columns: SharedColumns = Arc::new(fields);
                if req.describing {
                    if let Some(stmt) = &req.statement {
                        stmt.set_columns(Arc::clone(&columns));
                    }
                }
                req.rows.clear();
                req.set_columns(columns);
            }
            BackendMessage::NoData => {
                let req = self.current("NoData")?;
                let columns: SharedColumns = Arc::new(Vec::new());
                if req.describing {
                    if let Some(stmt) = &req.statement {
                        stmt.set_columns(Arc::clone(&columns));
                    }
                }
                req.set_columns(columns);
            }
            BackendMessage::DataRow { values } => {
                let req = self.current("DataRow")?;
                let columns = req
                    .resolve_columns()
                    .cloned()
                    .ok_or_else(|| PgError::Protocol("DataRow before RowDescription".to_string()))?;
                if columns.len() != values.len() {
                    return Err(PgError::Protocol(format!(
                        "DataRow has {} values for {} columns",
                        values.len(),
                        columns.len()
                    )));
                }

                let mut row = Row::new();
                for ((field, decoder), value) in
                    columns.iter().zip(&req.decoders).zip(values.iter())
                {
                    let value = match value {
                        None => Value::Null,
                        Some(v) if v.is_empty() => Value::String(String::new()),
                        Some(v) => decoder.decode(v),
                    };
                    row.insert(field.name.clone(), value);
                }
                req.rows.push(row);
            }
            BackendMessage::CommandComplete { tag } => {
                let req = self.current("CommandComplete")?;
                req.rows_affected = parse_rows_affected(&tag);
                req.command = Some(tag);
            }
            BackendMessage::PortalSuspended => {
                let req = self.current("PortalSuspended")?;
                req.rows_affected = req.rows.len() as u64;
            }
            BackendMessage::ErrorResponse { fields } => {
                let err = ServerError::from_fields(&fields);
                let id = self.id;
                match self.current.as_mut() {
                    Some(req) => {
                        debug!(conn = id, code = %err.code, "query failed: {}", err.message);
                        req.error.get_or_insert(err);
                    }
                    None => return Err(PgError::Server(err)),
                }
            }
            BackendMessage::ReadyForQuery { status } => {
                self.tx_status = status;
                let req = self.current.take().ok_or_else(|| {
                    PgError::Protocol("ReadyForQuery without a pending request".to_string())
                })?;
                let completion = self.finish(req);
                self.completions.push(completion);

                self.current = self.queue.pop_front();
                if self.current.is_none() {
                    self.events.push(SessionEvent::Idle);
                }
            }
            BackendMessage::EmptyQueryResponse
            | BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::ParameterDescription { .. } => {}
            BackendMessage::BackendKeyData { .. } => {
                return Err(PgError::Protocol("BackendKeyData after startup".to_string()));
            }
            other => {
                return Err(PgError::Protocol(format!(
                    "Unexpected message: {:?}",
                    other
                )));
            }
        }
        Ok(())
    }

    fn finish(&mut self, mut req: Request) -> Completion {
        if let Some(err) = req.error.take() {
            if req.parsed {
                if let (Some(id), Some(stmt)) = (req.query.prepared_id(), &req.statement) {
                    self.statements.discard(id, stmt);
                }
            }
            return Completion {
                reply: req.reply,
                result: QueryResult::from_server_error(err),
            };
        }

        let has_row_set = req.has_row_set();
        let meta = Meta {
            rows: req.rows_affected,
            command: req.command.take(),
            ..Default::default()
        };

        let result = match req.expect {
            Expect::Any if has_row_set => {
                QueryResult::ok(Data::Rows(std::mem::take(&mut req.rows)), meta)
            }
            Expect::Any => QueryResult::ok(Data::None, meta),
            Expect::NoRows if has_row_set => {
                QueryResult::usage_error("Statement returned rows; use select instead")
            }
            Expect::NoRows => QueryResult::ok(Data::None, meta),
            Expect::Rows | Expect::Row if !has_row_set => {
                QueryResult::usage_error("Statement returned no rows; use run instead")
            }
            Expect::Rows => QueryResult::ok(Data::Rows(std::mem::take(&mut req.rows)), meta),
            Expect::Row => {
                let data = match req.rows.drain(..).next() {
                    Some(row) => Data::Row(row),
                    None => Data::None,
                };
                QueryResult::ok(data, meta)
            }
        };

        Completion {
            reply: req.reply,
            result,
        }
    }

    fn handle_notification(
        &mut self,
        process_id: i32,
        channel: String,
        payload: String,
    ) -> PgResult<()> {
        if !self.schema.is_known(&channel) {
            return Err(PgError::Protocol(format!(
                "Notification on unknown channel '{}'",
                channel
            )));
        }

        let payload = if payload.is_empty() {
            Value::Null
        } else {
            match serde_json::from_str(&payload) {
                Ok(v) => v,
                Err(e) => {
                    warn!(conn = self.id, %channel, "dropping notification with invalid payload: {}", e);
                    return Ok(());
                }
            }
        };

        self.events.push(SessionEvent::Notification(Notification {
            process_id,
            channel,
            payload,
        }));
        Ok(())
    }
}

/// Encode the messages for one request.
fn write_request(statements: &mut StatementCache, w: &mut MessageWriter, req: &mut Request) {
    let query = req.query.clone();

    if query.is_simple() {
        QueryMessage { query: query.sql() }.write(w);
        return;
    }

    let statement_name = match query.prepared_id() {
        Some(id) => {
            let stmt = match statements.get(id) {
                Some(stmt) => stmt,
                None => {
                    let (stmt, evicted) = statements.prepare(id);
                    if let Some(old) = evicted {
                        CloseMessage { kind: b'S', name: &old }.write(w);
                    }
                    ParseMessage {
                        name: &stmt.name,
                        query: query.sql(),
                        param_types: &[],
                    }
                    .write(w);
                    req.parsed = true;
                    stmt
                }
            };
            req.describing = !stmt.is_described();
            let name = stmt.name.clone();
            req.statement = Some(stmt);
            name
        }
        None => {
            ParseMessage {
                name: "",
                query: query.sql(),
                param_types: &[],
            }
            .write(w);
            String::new()
        }
    };

    let params: Vec<Option<String>> = query.param_list().iter().map(|p| p.to_text()).collect();
    BindMessage {
        portal: "",
        statement: &statement_name,
        params: &params,
    }
    .write(w);

    if req.statement.is_none() {
        DescribeMessage { kind: b'P', name: "" }.write(w);
    } else if req.describing {
        DescribeMessage {
            kind: b'S',
            name: &statement_name,
        }
        .write(w);
    }

    let max_rows = query.row_limit().map(|n| n.min(i32::MAX as u32) as i32);
    ExecuteMessage {
        portal: "",
        max_rows: max_rows.unwrap_or(0),
    }
    .write(w);
    if max_rows.is_some() {
        CloseMessage { kind: b'P', name: "" }.write(w);
    }
    FlushMessage.write(w);
    SyncMessage.write(w);
}

/// Compute MD5 password hash: `"md5" + md5(md5(password + user) + salt)`.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user));
    let inner_hex = format!("{:x}", inner);

    let mut outer_input = inner_hex.into_bytes();
    outer_input.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer_input))
}
