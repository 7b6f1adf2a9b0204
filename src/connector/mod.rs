//! The protocol engine: one socket, one buffer pair, one state machine.
//!
//! A connector serves one caller at a time. Request bytes are fully
//! enqueued (and flushed) before response reading begins; the backend
//! answers a pipeline strictly in request order and ReadyForQuery is the
//! only synchronization fence. `sync_pending` counts Syncs whose fence has
//! not been consumed yet, so an interrupted pipeline drains lazily on the
//! next use instead of poisoning the connection.
use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    num::NonZeroUsize,
    sync::Arc,
    task::{Context, Poll, ready},
};

use bytes::{Bytes, BytesMut};
use lru::LruCache;

use crate::{
    Error, Result,
    column::FieldDescription,
    common::ByteStr,
    config::Config,
    io::{DEFAULT_BUF_SIZE, ReadBuffer, WriteBuffer},
    net::Socket,
    postgres::{
        BackendProtocol, FrontendProtocol, Notice, PgFormat, ProtocolError, ServerError,
        TransactionStatus,
        backend::{self, ReadyForQuery},
        frontend,
    },
    reader::DataReader,
    statement::{ParamDirection, Prepared, Statement, StatementName},
};

mod startup;

/// How many prepared statements a connector keeps alive server-side.
const PREPARED_STMT_CACHE: NonZeroUsize = NonZeroUsize::new(24).unwrap();

/// Lifecycle of a [`Connector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// No socket.
    Closed,
    /// TCP connect and startup handshake in progress.
    Connecting,
    /// Idle between commands; the only state commands start from.
    Ready,
    /// Writing a request pipeline.
    Executing,
    /// Reading pipeline responses.
    Fetching,
    /// A framing or I/O error made the connection unusable.
    Broken,
}

/// Callback receiving server notices.
pub type NoticeHandler = Box<dyn FnMut(Notice) + Send + Sync>;

/// One postgres session: socket, buffers and protocol state.
///
/// Created by the pool on demand (or directly via [`Connector::open`]),
/// reset on release, closed when evicted or broken.
pub struct Connector {
    socket: Socket,
    rbuf: ReadBuffer,
    wbuf: WriteBuffer,
    config: Config,

    state: ConnectorState,
    txn_status: TransactionStatus,
    process_id: i32,
    secret_key: i32,
    parameters: HashMap<ByteStr, ByteStr>,

    stmts: LruCache<u64, CachedStatement>,
    /// Syncs sent whose ReadyForQuery has not been consumed yet.
    sync_pending: usize,
    /// Header of a message whose body is still being buffered.
    pending_body: Option<(u8, usize)>,

    notice_handler: Option<NoticeHandler>,
}

#[derive(Clone)]
struct CachedStatement {
    name: ByteStr,
    columns: Option<Arc<[FieldDescription]>>,
}

impl Connector {
    /// Establish a connection and run the startup handshake.
    pub async fn open(config: Config) -> Result<Connector> {
        let socket = match config.host().starts_with('/') {
            true => {
                let path = format!("{}/.s.PGSQL.{}", config.host(), config.port());
                Socket::connect_unix(&path).await?
            }
            false => Socket::connect_tcp(config.host(), config.port()).await?,
        };

        let mut conn = Self {
            socket,
            rbuf: ReadBuffer::new(DEFAULT_BUF_SIZE),
            wbuf: WriteBuffer::new(DEFAULT_BUF_SIZE),
            config,
            state: ConnectorState::Connecting,
            txn_status: TransactionStatus::Idle,
            process_id: 0,
            secret_key: 0,
            parameters: HashMap::new(),
            stmts: LruCache::new(PREPARED_STMT_CACHE),
            sync_pending: 0,
            pending_body: None,
            notice_handler: None,
        };

        match startup::startup(&mut conn).await {
            Ok(()) => {
                conn.state = ConnectorState::Ready;
                Ok(conn)
            }
            Err(err) => {
                conn.state = ConnectorState::Broken;
                Err(err)
            }
        }
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    pub fn is_broken(&self) -> bool {
        self.state == ConnectorState::Broken
    }

    /// Transaction status reported by the last ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.txn_status
    }

    /// Process ID of the backend serving this connection.
    pub fn backend_process_id(&self) -> i32 {
        self.process_id
    }

    /// Current value of a reported run-time parameter, e.g.
    /// `server_version`.
    pub fn parameter_status(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(ByteStr::as_str)
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    /// Register the listener receiving NoticeResponse messages.
    ///
    /// Without one, notices are logged and dropped.
    pub fn set_notice_handler(&mut self, handler: NoticeHandler) {
        self.notice_handler = Some(handler);
    }

    /// Mark broken on errors the connection cannot recover from.
    fn fail(&mut self, err: Error) -> Error {
        if err.is_fatal() {
            self.state = ConnectorState::Broken;
        }
        err
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            ConnectorState::Ready => Ok(()),
            ConnectorState::Executing | ConnectorState::Fetching => {
                Err(Error::invalid_op("connector is busy"))
            }
            ConnectorState::Broken => Err(Error::invalid_op("connector is broken")),
            ConnectorState::Closed => Err(Error::invalid_op("connector is closed")),
            ConnectorState::Connecting => Err(Error::invalid_op("connector is connecting")),
        }
    }
}

/// Receiving.
impl Connector {
    /// Read one raw frame: message type byte plus detached body.
    ///
    /// The header is consumed before the body is complete, so the
    /// in-progress body is carried in `pending_body` across polls.
    fn poll_recv_raw(&mut self, cx: &mut Context<'_>) -> Poll<Result<(u8, Bytes)>> {
        loop {
            if let Some((msgtype, body_len)) = self.pending_body {
                let body = match self.rbuf.poll_ensure_or_alloc(&mut self.socket, body_len, cx) {
                    Poll::Ready(Ok(body)) => body,
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(self.fail(err))),
                    Poll::Pending => return Poll::Pending,
                };
                self.pending_body = None;

                #[cfg(feature = "log-verbose")]
                log::trace!(
                    "(B) {} [{}B]",
                    backend::BackendMessage::message_name(msgtype),
                    body.len(),
                );

                return Poll::Ready(Ok((msgtype, body)));
            }

            match ready!(self.rbuf.poll_ensure(&mut self.socket, 5, cx)) {
                Ok(()) => {}
                Err(err) => return Poll::Ready(Err(self.fail(err))),
            }
            let msgtype = self.rbuf.peek_u8();
            let len = self.rbuf.peek_i32(1);
            if len < 4 {
                let err = ProtocolError::unknown(msgtype);
                return Poll::Ready(Err(self.fail(err.into())));
            }
            use bytes::Buf;
            self.rbuf.advance(5);
            self.pending_body = Some((msgtype, len as usize - 4));
        }
    }

    /// Receive one backend message of the expected type.
    ///
    /// Notices, parameter status reports and orphaned pipeline fences are
    /// handled transparently. An ErrorResponse surfaces as a database
    /// error after recording that the server will skip to the pipeline's
    /// Sync fence.
    pub(crate) fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context<'_>) -> Poll<Result<B>> {
        ready!(self.poll_ready(cx))?;

        loop {
            let (msgtype, body) = ready!(self.poll_recv_raw(cx))?;
            match msgtype {
                backend::ErrorResponse::MSGTYPE => {
                    let err = backend::ErrorResponse::decode(msgtype, body)
                        .map_err(|e| self.fail(e.into()))?;
                    if self.state != ConnectorState::Connecting {
                        // the server discards until the pipeline's Sync and
                        // answers it; drain on next use
                        self.sync_pending += 1;
                    }
                    return Poll::Ready(Err(ServerError(err.fields).into()));
                }
                backend::NoticeResponse::MSGTYPE => {
                    let notice = backend::NoticeResponse::decode(msgtype, body)
                        .map_err(|e| self.fail(e.into()))?;
                    self.dispatch_notice(Notice(notice.fields));
                }
                backend::ParameterStatus::MSGTYPE => {
                    let status = backend::ParameterStatus::decode(msgtype, body)
                        .map_err(|e| self.fail(e.into()))?;
                    self.parameters.insert(status.name, status.value);
                }
                _ => {
                    let msg = B::decode(msgtype, body).map_err(|e| self.fail(e.into()))?;
                    return Poll::Ready(Ok(msg));
                }
            }
        }
    }

    pub(crate) async fn recv<B: BackendProtocol>(&mut self) -> Result<B> {
        std::future::poll_fn(|cx| self.poll_recv(cx)).await
    }

    /// Flush buffered writes and consume every outstanding Sync fence.
    ///
    /// All messages up to each ReadyForQuery are discarded, which is what
    /// leaves the connection Ready after an interrupted or failed pipeline.
    pub(crate) fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if !self.wbuf.is_empty() {
            ready!(self.poll_flush(cx))?;
        }

        while self.sync_pending != 0 {
            let (msgtype, body) = ready!(self.poll_recv_raw(cx))?;
            match msgtype {
                ReadyForQuery::MSGTYPE => {
                    let rfq =
                        ReadyForQuery::decode(msgtype, body).map_err(|e| self.fail(e.into()))?;
                    self.txn_status = rfq.status;
                    self.sync_pending -= 1;
                }
                backend::ErrorResponse::MSGTYPE => {
                    #[cfg(feature = "log")]
                    if let Ok(err) = backend::ErrorResponse::decode(msgtype, body) {
                        log::error!("discarded server error: {}", ServerError(err.fields));
                    }
                    #[cfg(not(feature = "log"))]
                    let _ = body;
                }
                backend::NoticeResponse::MSGTYPE => {
                    if let Ok(notice) = backend::NoticeResponse::decode(msgtype, body) {
                        self.dispatch_notice(Notice(notice.fields));
                    }
                }
                backend::ParameterStatus::MSGTYPE => {
                    if let Ok(status) = backend::ParameterStatus::decode(msgtype, body) {
                        self.parameters.insert(status.name, status.value);
                    }
                }
                // everything else is a discarded pipeline response
                _ => {}
            }
        }

        if matches!(self.state, ConnectorState::Executing | ConnectorState::Fetching) {
            self.state = ConnectorState::Ready;
        }

        Poll::Ready(Ok(()))
    }

    /// Drain to a Ready connection, see [`Connector::poll_ready`].
    pub(crate) async fn ready(&mut self) -> Result<()> {
        std::future::poll_fn(|cx| self.poll_ready(cx)).await
    }

    fn dispatch_notice(&mut self, notice: Notice) {
        match &mut self.notice_handler {
            Some(handler) => handler(notice),
            None => {
                #[cfg(feature = "log")]
                log::warn!("{notice}");
                #[cfg(not(feature = "log"))]
                let _ = notice;
            }
        }
    }

    pub(crate) fn note_sync_pending(&mut self) {
        self.sync_pending += 1;
    }

    pub(crate) fn set_state(&mut self, state: ConnectorState) {
        self.state = state;
    }
}

/// Sending.
impl Connector {
    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        match ready!(self.wbuf.poll_send(&mut self.socket, cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(err) => Poll::Ready(Err(self.fail(err.into()))),
        }
    }

    pub(crate) async fn flush(&mut self) -> Result<()> {
        std::future::poll_fn(|cx| self.poll_flush(cx)).await
    }

    /// Enqueue one frontend message, flushing mid-pipeline when the write
    /// buffer runs out of room.
    ///
    /// A message larger than the whole buffer bypasses it, the write-side
    /// analog of the read side's oversized-body allocation.
    pub(crate) async fn put<F: FrontendProtocol>(&mut self, msg: F) -> Result<()> {
        #[cfg(feature = "log-verbose")]
        log::trace!("(F) {:?}", F::MSGTYPE as char);

        let need = frontend::frame_len(&msg);
        if need > self.wbuf.space_left() {
            self.flush().await?;
        }
        if need > self.wbuf.usable_size() {
            let mut tmp = BytesMut::with_capacity(need);
            frontend::write(msg, &mut tmp);
            return self.write_direct(tmp.freeze()).await;
        }
        frontend::write(msg, &mut self.wbuf);
        Ok(())
    }

    async fn write_direct(&mut self, buf: Bytes) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        match self.socket.write_all(&buf).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err.into())),
        }
    }

    pub(crate) async fn send_startup(&mut self, msg: frontend::Startup<'_>) -> Result<()> {
        let need = msg.size() as usize;
        if need > self.wbuf.space_left() {
            self.flush().await?;
        }
        if need > self.wbuf.usable_size() {
            let mut tmp = BytesMut::with_capacity(need);
            msg.write(&mut tmp);
            return self.write_direct(tmp.freeze()).await;
        }
        msg.write(&mut self.wbuf);
        Ok(())
    }
}

/// Command execution.
impl Connector {
    /// Run a pipeline of statements and return the cursor over its results.
    ///
    /// For each statement not yet prepared on this connection the pipeline
    /// emits Parse + Describe + Bind + Execute, for prepared ones Bind +
    /// Execute only, then one Sync for the whole flight. No byte is sent if
    /// any statement carries a non-input parameter.
    pub async fn execute<'c, 'q>(
        &'c mut self,
        statements: &'c mut [Statement<'q>],
    ) -> Result<DataReader<'c, 'q>> {
        self.ready().await?;
        self.ensure_ready()?;

        if statements.is_empty() {
            return Err(Error::invalid_op("command contains no statements"));
        }
        for stmt in statements.iter() {
            if stmt.params().iter().any(|p| p.direction != ParamDirection::Input) {
                return Err(Error::invalid_op(
                    "only input parameters can be sent to the backend",
                ));
            }
        }

        self.state = ConnectorState::Executing;
        match self.pipeline(statements).await {
            Ok(()) => {
                self.state = ConnectorState::Fetching;
                let deadline = self
                    .config
                    .command_timeout
                    .map(|t| tokio::time::Instant::now() + t);
                Ok(DataReader::new(self, statements, deadline))
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn pipeline(&mut self, statements: &mut [Statement<'_>]) -> Result<()> {
        for stmt in statements.iter_mut() {
            let sqlid = sql_hash(stmt.sql());

            let cached = match &stmt.prepared {
                Some(prepared) => Some(CachedStatement {
                    name: prepared.name.clone(),
                    columns: prepared.columns.clone(),
                }),
                None => self.stmts.get(&sqlid).cloned(),
            };

            stmt.outcome = None;
            let statement_name = match &cached {
                Some(cached) => {
                    // the description was captured at prepare time; no
                    // RowDescription will arrive for this statement
                    stmt.columns = cached.columns.clone();
                    cached.name.clone()
                }
                None => {
                    stmt.columns = None;
                    self.put(frontend::Parse {
                        statement_name: "",
                        sql: stmt.sql(),
                        oids_len: stmt.params().len() as i16,
                        oids: stmt.params().iter().map(|p| p.value.oid()),
                    })
                    .await?;
                    self.put(frontend::Describe { kind: b'S', name: "" }).await?;
                    ByteStr::default()
                }
            };

            // Each parameter declares its own format. Result formats come
            // from the negotiated description; a statement not described
            // yet is requested in text, the format every type has.
            let param_formats: Vec<PgFormat> =
                stmt.params().iter().map(|p| p.value.format()).collect();
            let result_formats: Vec<PgFormat> = match &stmt.columns {
                Some(cols) => cols
                    .iter()
                    .map(|c| PgFormat::from_code(c.format_code))
                    .collect(),
                None => Vec::new(),
            };

            self.put(frontend::Bind {
                portal_name: "",
                statement_name: statement_name.as_str(),
                param_formats: &param_formats,
                params: stmt.params(),
                result_formats: &result_formats,
            })
            .await?;
            self.put(frontend::Execute {
                portal_name: "",
                max_rows: stmt.max_rows_hint(),
            })
            .await?;
        }

        self.put(frontend::Sync).await?;
        self.flush().await
    }

    /// Parse and describe a statement under a server-side name, so later
    /// executions skip the parse step.
    ///
    /// The name is auto-generated unless the caller supplies one to pin.
    pub async fn prepare(&mut self, stmt: &mut Statement<'_>, name: Option<&str>) -> Result<()> {
        if stmt.is_prepared() {
            return Ok(());
        }
        self.ready().await?;
        self.ensure_ready()?;

        let name: ByteStr = match name {
            Some(name) => ByteStr::copy_from_str(name),
            None => StatementName::next().as_str().into(),
        };

        self.state = ConnectorState::Executing;
        match self.prepare_inner(stmt, &name).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn prepare_inner(&mut self, stmt: &mut Statement<'_>, name: &str) -> Result<()> {
        self.put(frontend::Parse {
            statement_name: name,
            sql: stmt.sql(),
            oids_len: stmt.params().len() as i16,
            oids: stmt.params().iter().map(|p| p.value.oid()),
        })
        .await?;
        self.put(frontend::Describe { kind: b'S', name }).await?;
        self.put(frontend::Sync).await?;
        self.flush().await?;

        self.recv::<backend::ParseComplete>().await?;
        let described = self.recv::<backend::ParameterDescription>().await?;
        let columns = match self.recv::<backend::BackendMessage>().await? {
            backend::BackendMessage::RowDescription(rd) => {
                // negotiate the format each column will be fetched in;
                // the description itself always reports text
                let mut cols = FieldDescription::decode_vec(&rd)?;
                for col in cols.iter_mut() {
                    col.format_code = crate::types::lookup(col.type_oid).format().format_code();
                }
                Some(Arc::<[FieldDescription]>::from(cols))
            }
            backend::BackendMessage::NoData(_) => None,
            other => {
                return Err(ProtocolError::unexpected_phase(other.msgtype(), "prepare").into());
            }
        };

        // the only message left in this cycle is the Sync fence
        self.sync_pending += 1;
        self.ready().await?;

        let name = ByteStr::copy_from_str(name);
        stmt.columns = columns.clone();
        stmt.prepared = Some(Prepared {
            name: name.clone(),
            param_oids: described.oids().collect(),
            columns: columns.clone(),
        });

        self.cache_statement(sql_hash(stmt.sql()), name, columns).await
    }

    async fn cache_statement(
        &mut self,
        sqlid: u64,
        name: ByteStr,
        columns: Option<Arc<[FieldDescription]>>,
    ) -> Result<()> {
        let cached = CachedStatement { name, columns };
        if let Some((_, evicted)) = self.stmts.push(sqlid, cached) {
            #[cfg(feature = "log-verbose")]
            log::trace!("closing evicted prepared statement {}", evicted.name);

            self.put(frontend::Close { kind: b'S', name: evicted.name.as_str() }).await?;
            self.put(frontend::Sync).await?;
            self.sync_pending += 1;
            self.flush().await?;
            self.ready().await?;
        }
        Ok(())
    }

    /// Close a prepared statement server-side.
    pub async fn unprepare(&mut self, stmt: &mut Statement<'_>) -> Result<()> {
        let Some(prepared) = stmt.prepared.take() else {
            return Ok(());
        };
        stmt.columns = None;
        self.ready().await?;
        self.ensure_ready()?;

        self.stmts.pop(&sql_hash(stmt.sql()));

        self.put(frontend::Close { kind: b'S', name: prepared.name.as_str() }).await?;
        self.put(frontend::Sync).await?;
        self.sync_pending += 1;
        self.flush().await?;
        self.ready().await
    }

    /// Return the session to its default state before pool reuse.
    ///
    /// `DISCARD ALL` resets GUCs such as `search_path` so nothing leaks to
    /// the next borrower; it also deallocates server-side statements, so
    /// the local statement cache is dropped with it. Skipped when the
    /// configuration opted out via `NoResetOnClose`.
    pub async fn reset(&mut self) -> Result<()> {
        self.ready().await?;
        self.ensure_ready()?;

        if self.config.no_reset_on_close {
            return Ok(());
        }

        self.put(frontend::Query { sql: "DISCARD ALL" }).await?;
        self.sync_pending += 1;
        self.flush().await?;
        self.ready().await?;
        self.stmts.clear();
        Ok(())
    }

    /// Ask the server to abandon the query this connection is running.
    ///
    /// Opens a second short-lived connection carrying the CancelRequest;
    /// nothing is ever sent on the main socket, so this is safe while a
    /// pipeline is in flight. Delivery is best-effort by design.
    pub async fn cancel(&self) -> Result<()> {
        cancel_raw(&self.config, self.process_id, self.secret_key).await
    }

    /// Orderly shutdown with a Terminate message.
    pub async fn close(mut self) -> Result<()> {
        self.put(frontend::Terminate).await?;
        self.flush().await?;
        self.socket.shutdown().await.map_err(Error::from)?;
        self.state = ConnectorState::Closed;
        Ok(())
    }
}

/// Send a CancelRequest for the given backend on a dedicated connection.
pub(crate) async fn cancel_raw(config: &Config, process_id: i32, secret_key: i32) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut socket = match config.host().starts_with('/') {
        true => {
            let path = format!("{}/.s.PGSQL.{}", config.host(), config.port());
            Socket::connect_unix(&path).await?
        }
        false => Socket::connect_tcp(config.host(), config.port()).await?,
    };

    let mut buf = BytesMut::with_capacity(frontend::CancelRequest::SIZE as usize);
    frontend::CancelRequest { process_id, secret_key }.write(&mut buf);
    socket.write_all(&buf).await?;
    socket.shutdown().await?;
    Ok(())
}

fn sql_hash(sql: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    sql.hash(&mut hasher);
    hasher.finish()
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("state", &self.state)
            .field("process_id", &self.process_id)
            .field("txn_status", &self.txn_status)
            .field("sync_pending", &self.sync_pending)
            .finish()
    }
}
