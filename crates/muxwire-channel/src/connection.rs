//! Async connection driver.
//!
//! Each connection runs as one driver task that owns the sans-IO
//! [`Connection`], reads the socket into a [`FrameBuffer`], executes the
//! actions the state machine returns and sleeps until its next deadline. A
//! second task owns the write half and is the only writer.
//!
//! ```text
//!  ConnectionHandle ──commands──> driver task ──frames──> writer task ──> socket
//!         ^                          │    ^                                  │
//!         └──── oneshot / mpsc ──────┘    └────────── read half ─────────────┘
//! ```
//!
//! Completions from response frames, timers, cancellation and close are all
//! produced inside the driver task, so each call slot resolves exactly once.

use std::{collections::HashMap, io, sync::Arc, time::Duration};

use bytes::Bytes;
use muxwire_core::{
    BoxedStream, CallError, CallResponse, Connection, ConnectionAction, ConnectionConfig,
    ConnectionError, ConnectionState, Environment, InboundCall, OutboundCall, OutboundResponse,
    RemoteInfo, Role,
};
use muxwire_proto::{ErrorCode, FrameBuffer, MessageId};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{mpsc, oneshot, watch},
    task::{AbortHandle, JoinHandle},
};
use tracing::{Instrument, debug, debug_span, info, trace, warn};

use crate::handler::{CallSink, HandlerError};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Longest sleep between ticks when nothing is pending.
const IDLE_WAKEUP: Duration = Duration::from_secs(60);

/// Time allowed for queued frames to drain on close.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

type LostCallback = Box<dyn FnOnce(String) + Send>;

/// Snapshot of a connection published by its driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Remote identity, once the handshake has completed.
    pub remote: Option<RemoteInfo>,
    /// Why the connection closed.
    pub close_reason: Option<String>,
}

enum Command {
    Call {
        call: OutboundCall,
        slot: CallSlot,
        assigned: oneshot::Sender<Result<MessageId, CallError>>,
    },
    Cancel {
        id: MessageId,
    },
    Ping {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Respond {
        id: MessageId,
        response: OutboundResponse,
    },
    Reject {
        id: MessageId,
        error: HandlerError,
    },
    Close,
}

struct CallSlot {
    completion: oneshot::Sender<Result<CallResponse, CallError>>,
    arguments: mpsc::UnboundedSender<(usize, Bytes)>,
}

/// Configures and spawns connection drivers.
pub struct ConnectionBuilder<E> {
    config: ConnectionConfig,
    env: E,
    sink: Option<Arc<dyn CallSink>>,
    on_lost: Option<LostCallback>,
}

impl<E: Environment> ConnectionBuilder<E> {
    /// Builder for connections using `config` and `env`.
    pub fn new(config: ConnectionConfig, env: E) -> Self {
        Self { config, env, sink: None, on_lost: None }
    }

    /// Deliver inbound calls to `sink`. Without one they are declined.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn CallSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Run `f` with the reason if the connection closes involuntarily.
    #[must_use]
    pub fn on_lost(mut self, f: impl FnOnce(String) + Send + 'static) -> Self {
        self.on_lost = Some(Box::new(f));
        self
    }

    /// Start the driver on `stream`.
    ///
    /// Must be called inside a tokio runtime. The handshake starts
    /// immediately; use [`ConnectionHandle::established`] to wait for it.
    pub fn spawn(self, stream: BoxedStream, role: Role) -> ConnectionHandle {
        let (reader, writer) = tokio::io::split(stream);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus {
            state: ConnectionState::Connecting,
            remote: None,
            close_reason: None,
        });

        let span = debug_span!("connection", ?role, local = %self.config.host_port);
        let writer = tokio::spawn(write_loop(writer, frames_rx).instrument(span.clone()));
        let driver = Driver {
            conn: Connection::new(self.config, role),
            env: self.env,
            frames: frames_tx,
            commands: commands_rx,
            handler_commands: commands_tx.downgrade(),
            calls: HashMap::new(),
            pings: HashMap::new(),
            inbound: HashMap::new(),
            sink: self.sink,
            status: status_tx,
            on_lost: self.on_lost,
            voluntary: false,
            close_reason: None,
        };
        tokio::spawn(driver.run(reader, writer).instrument(span));

        ConnectionHandle { commands: commands_tx, status: status_rx }
    }
}

/// Cloneable front end of a running connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle").field("status", &*self.status.borrow()).finish()
    }
}

impl ConnectionHandle {
    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Remote identity, once the handshake has completed.
    pub fn remote(&self) -> Option<RemoteInfo> {
        self.status.borrow().remote.clone()
    }

    /// Full status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Whether new calls can be sent.
    pub fn is_usable(&self) -> bool {
        self.state() == ConnectionState::Established
    }

    /// Wait for the handshake.
    ///
    /// # Errors
    ///
    /// `HandshakeFailed` if the connection closed before establishing,
    /// `ConnectionClosed` if it established and has since closed.
    pub async fn established(&self) -> Result<RemoteInfo, CallError> {
        let mut status = self.status.clone();
        let snapshot = status
            .wait_for(|s| s.state != ConnectionState::Connecting && s.state != ConnectionState::Handshaking)
            .await
            .map_err(|_| CallError::ConnectionClosed)?
            .clone();

        match (snapshot.state, snapshot.remote) {
            (ConnectionState::Established, Some(remote)) => Ok(remote),
            (_, Some(_)) => Err(CallError::ConnectionClosed),
            (_, None) => Err(CallError::HandshakeFailed(
                snapshot.close_reason.unwrap_or_else(|| "connection closed".to_string()),
            )),
        }
    }

    /// Send a call and return a handle to its outcome.
    ///
    /// # Errors
    ///
    /// Rejections from [`Connection::send_call`], or `ConnectionClosed` if the
    /// driver has stopped.
    pub async fn send_call(&self, call: OutboundCall) -> Result<PendingCallHandle, CallError> {
        let (completion_tx, completion_rx) = oneshot::channel();
        let (arguments_tx, arguments_rx) = mpsc::unbounded_channel();
        let (assigned_tx, assigned_rx) = oneshot::channel();

        let slot = CallSlot { completion: completion_tx, arguments: arguments_tx };
        self.commands
            .send(Command::Call { call, slot, assigned: assigned_tx })
            .map_err(|_| CallError::ConnectionClosed)?;
        let id = assigned_rx.await.map_err(|_| CallError::ConnectionClosed)??;

        Ok(PendingCallHandle {
            id,
            completion: Some(completion_rx),
            arguments: arguments_rx,
            commands: self.commands.clone(),
        })
    }

    /// Send a call and wait for its response.
    ///
    /// # Errors
    ///
    /// Any [`CallError`].
    pub async fn call(&self, call: OutboundCall) -> Result<CallResponse, CallError> {
        self.send_call(call).await?.response().await
    }

    /// Round-trip a ping.
    ///
    /// # Errors
    ///
    /// `Timeout` if no ping-response arrives in time, `ConnectionClosed` if
    /// the connection goes away.
    pub async fn ping(&self) -> Result<(), CallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands.send(Command::Ping { reply: reply_tx }).map_err(|_| CallError::ConnectionClosed)?;
        reply_rx.await.map_err(|_| CallError::ConnectionClosed)?
    }

    /// Ask the driver to close. Returns immediately.
    pub fn close(&self) {
        if self.commands.send(Command::Close).is_err() {
            trace!("close requested on stopped connection");
        }
    }

    /// Wait until the socket has been released.
    pub async fn closed(&self) {
        let mut status = self.status.clone();
        // An error means the driver is gone, which also means closed.
        let _ = status.wait_for(|s| s.state == ConnectionState::Closed).await;
    }
}

/// Outcome of one outbound call.
///
/// Dropping the handle before the call completes cancels it.
pub struct PendingCallHandle {
    id: MessageId,
    completion: Option<oneshot::Receiver<Result<CallResponse, CallError>>>,
    arguments: mpsc::UnboundedReceiver<(usize, Bytes)>,
    commands: mpsc::UnboundedSender<Command>,
}

impl PendingCallHandle {
    /// Message id assigned to the call.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Next response argument as soon as it has fully arrived.
    ///
    /// Returns `None` once every argument has been reported or the call has
    /// failed.
    pub async fn next_argument(&mut self) -> Option<(usize, Bytes)> {
        self.arguments.recv().await
    }

    /// Abandon the call. Its outcome becomes `Cancelled`.
    pub fn cancel(&self) {
        if self.commands.send(Command::Cancel { id: self.id }).is_err() {
            trace!(id = self.id, "cancel on stopped connection");
        }
    }

    /// Wait for the complete response.
    ///
    /// # Errors
    ///
    /// The [`CallError`] the call failed with.
    pub async fn response(mut self) -> Result<CallResponse, CallError> {
        let result = match self.completion.as_mut() {
            Some(completion) => completion.await.unwrap_or(Err(CallError::ConnectionClosed)),
            None => Err(CallError::ConnectionClosed),
        };
        self.completion = None;
        result
    }
}

impl Drop for PendingCallHandle {
    fn drop(&mut self) {
        if self.completion.is_some() {
            self.cancel();
        }
    }
}

struct Driver<E> {
    conn: Connection,
    env: E,
    frames: mpsc::UnboundedSender<Bytes>,
    commands: mpsc::UnboundedReceiver<Command>,
    handler_commands: mpsc::WeakUnboundedSender<Command>,
    calls: HashMap<MessageId, CallSlot>,
    pings: HashMap<MessageId, oneshot::Sender<Result<(), CallError>>>,
    inbound: HashMap<MessageId, AbortHandle>,
    sink: Option<Arc<dyn CallSink>>,
    status: watch::Sender<ConnectionStatus>,
    on_lost: Option<LostCallback>,
    voluntary: bool,
    close_reason: Option<String>,
}

impl<E: Environment> Driver<E> {
    async fn run(mut self, mut reader: ReadHalf<BoxedStream>, mut writer: JoinHandle<io::Result<()>>) {
        match self.conn.start(self.env.now()) {
            Ok(actions) => self.execute(actions),
            Err(e) => self.fail(&e),
        }

        let mut buffer = FrameBuffer::new();
        let mut chunk = vec![0u8; READ_BUFFER_SIZE];
        let mut writer_done = false;

        while self.is_running() {
            let wait = self
                .conn
                .next_deadline()
                .map_or(IDLE_WAKEUP, |deadline| deadline.saturating_duration_since(self.env.now()));

            tokio::select! {
                read = reader.read(&mut chunk) => match read {
                    Ok(0) => self.fail(&ConnectionError::Transport("connection closed by remote".to_string())),
                    Ok(n) => self.on_bytes(&mut buffer, &chunk[..n]),
                    Err(e) => self.fail(&ConnectionError::Transport(e.to_string())),
                },
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("all handles dropped");
                        self.voluntary = true;
                        let actions = self.conn.close();
                        self.execute(actions);
                    },
                },
                written = &mut writer, if !writer_done => {
                    writer_done = true;
                    let reason = match written {
                        Ok(Ok(())) => "writer stopped".to_string(),
                        Ok(Err(e)) => e.to_string(),
                        Err(e) => e.to_string(),
                    };
                    self.fail(&ConnectionError::Transport(reason));
                },
                () = self.env.sleep(wait) => {
                    let actions = self.conn.tick(self.env.now());
                    self.execute(actions);
                },
            }
        }

        drop(reader);
        self.shutdown(writer, writer_done).await;
    }

    fn is_running(&self) -> bool {
        matches!(
            self.conn.state(),
            ConnectionState::Connecting | ConnectionState::Handshaking | ConnectionState::Established
        )
    }

    fn on_bytes(&mut self, buffer: &mut FrameBuffer, bytes: &[u8]) {
        let frames = match buffer.push(bytes) {
            Ok(frames) => frames,
            Err(e) => return self.fail(&ConnectionError::Protocol(e)),
        };
        for frame in frames {
            match self.conn.handle_frame(&frame, self.env.now()) {
                Ok(actions) => self.execute(actions),
                Err(e) => return self.fail(&e),
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        let now = self.env.now();
        match command {
            Command::Call { call, slot, assigned } => match self.conn.send_call(call, now) {
                Ok((id, actions)) => {
                    self.calls.insert(id, slot);
                    let _ = assigned.send(Ok(id));
                    self.execute(actions);
                },
                Err(e) => {
                    let _ = assigned.send(Err(e));
                },
            },
            Command::Cancel { id } => {
                let actions = self.conn.cancel(id, now);
                self.execute(actions);
            },
            Command::Ping { reply } => match self.conn.send_ping(now) {
                Ok((id, actions)) => {
                    self.pings.insert(id, reply);
                    self.execute(actions);
                },
                Err(e) => {
                    let _ = reply.send(Err(e));
                },
            },
            Command::Respond { id, response } => {
                self.inbound.remove(&id);
                let actions = self.conn.send_response(id, response);
                self.execute(actions);
            },
            Command::Reject { id, error } => {
                self.inbound.remove(&id);
                let actions = self.conn.send_error(id, error.code, &error.message);
                self.execute(actions);
            },
            Command::Close => {
                self.voluntary = true;
                let actions = self.conn.close();
                self.execute(actions);
            },
        }
    }

    fn fail(&mut self, error: &ConnectionError) {
        let actions = self.conn.fail(error);
        self.execute(actions);
    }

    fn execute(&mut self, actions: Vec<ConnectionAction>) {
        for action in actions {
            match action {
                ConnectionAction::SendFrame(frame) => {
                    if self.frames.send(frame.to_bytes()).is_err() {
                        trace!(id = frame.id(), "writer gone, dropping frame");
                    }
                },
                ConnectionAction::CallCompleted { id, result } => {
                    if let Some(slot) = self.calls.remove(&id) {
                        let _ = slot.completion.send(result);
                    }
                },
                ConnectionAction::ArgumentReady { id, index, bytes } => {
                    if let Some(slot) = self.calls.get(&id) {
                        let _ = slot.arguments.send((index, bytes));
                    }
                },
                ConnectionAction::DeliverCall(call) => self.dispatch(call),
                ConnectionAction::InboundCancelled { id } => {
                    if let Some(task) = self.inbound.remove(&id) {
                        debug!(id, "aborting handler");
                        task.abort();
                    }
                },
                ConnectionAction::Pong { id } => {
                    if let Some(reply) = self.pings.remove(&id) {
                        let _ = reply.send(Ok(()));
                    }
                },
                ConnectionAction::PingTimedOut { id } => {
                    if let Some(reply) = self.pings.remove(&id) {
                        let _ = reply.send(Err(CallError::Timeout));
                    }
                },
                ConnectionAction::HandshakeCompleted { remote } => {
                    info!(remote = %remote.host_port, process = %remote.process_name, "connection established");
                    self.status.send_modify(|status| status.remote = Some(remote));
                },
                ConnectionAction::Close { reason } => {
                    self.status.send_modify(|status| {
                        status.close_reason.get_or_insert_with(|| reason.clone());
                    });
                    self.close_reason.get_or_insert(reason);
                },
            }
        }

        let state = self.conn.state();
        self.status.send_if_modified(|status| {
            let changed = status.state != state;
            status.state = state;
            changed
        });
    }

    fn dispatch(&mut self, call: InboundCall) {
        let id = call.id;
        let (Some(sink), Some(commands)) = (self.sink.clone(), self.handler_commands.upgrade()) else {
            let actions = self.conn.send_error(id, ErrorCode::Declined, "connection does not accept calls");
            return self.execute(actions);
        };

        let span = debug_span!("handler", id, service = %call.service);
        let task = tokio::spawn(
            async move {
                let command = match sink.handle(call).await {
                    Ok(response) => Command::Respond { id, response },
                    Err(error) => Command::Reject { id, error },
                };
                if commands.send(command).is_err() {
                    trace!("connection gone before handler finished");
                }
            }
            .instrument(span),
        );
        self.inbound.insert(id, task.abort_handle());
    }

    async fn shutdown(mut self, mut writer: JoinHandle<io::Result<()>>, writer_done: bool) {
        for (_, task) in self.inbound.drain() {
            task.abort();
        }
        for (_, slot) in self.calls.drain() {
            let _ = slot.completion.send(Err(CallError::ConnectionClosed));
        }
        for (_, reply) in self.pings.drain() {
            let _ = reply.send(Err(CallError::ConnectionClosed));
        }

        // Closing the frame queue lets the writer drain and shut down.
        drop(self.frames);
        if !writer_done {
            tokio::select! {
                _ = &mut writer => {},
                () = self.env.sleep(FLUSH_TIMEOUT) => {
                    warn!("writer did not drain in time");
                    writer.abort();
                    let _ = writer.await;
                },
            }
        }

        self.conn.closed();
        let reason = self.close_reason.take().unwrap_or_else(|| "closed".to_string());
        debug!(%reason, voluntary = self.voluntary, "connection closed");
        self.status.send_modify(|status| {
            status.state = ConnectionState::Closed;
            status.close_reason = Some(reason.clone());
        });

        if !self.voluntary
            && let Some(on_lost) = self.on_lost.take()
        {
            on_lost(reason);
        }
    }
}

async fn write_loop(
    mut writer: WriteHalf<BoxedStream>,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
) -> io::Result<()> {
    while let Some(bytes) = frames.recv().await {
        writer.write_all(&bytes).await?;
    }
    writer.shutdown().await
}
