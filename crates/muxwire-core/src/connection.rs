//! Connection state machine for the muxwire protocol.
//!
//! This module implements everything that happens on one socket: the init
//! handshake, message id allocation, multiplexing of concurrent calls in both
//! directions, fragmentation and reassembly of call arguments, deadlines,
//! cancellation, pings and close.
//!
//! # Architecture: Action-Based State Machine
//!
//! - Methods accept time as a parameter (no stored Environment)
//! - Methods return `Vec<ConnectionAction>`, fallible ones wrap it in `Result`
//! - Driver code executes actions (write frames, resolve call slots, run
//!   handlers, close the socket)
//!
//! The driver owns the only instance, so every completion (response, error
//! frame, timeout, cancellation, close) is serialized through one place and a
//! call resolves exactly once.
//!
//! # State Machine
//!
//! ```text
//! ┌────────────┐ start ┌─────────────┐ init ok ┌─────────────┐
//! │ Connecting │──────>│ Handshaking │────────>│ Established │
//! └────────────┘       └─────────────┘         └─────────────┘
//!                            │ timeout/error          │ close/fail
//!                            ↓                        ↓
//!                       ┌─────────┐  closed()   ┌────────┐
//!                       │ Closing │────────────>│ Closed │
//!                       └─────────┘             └────────┘
//! ```
//!
//! # Message routing
//!
//! Each side allocates ids for the exchanges it initiates. The frame type
//! says which side initiated: call requests, request continuations and
//! cancels belong to the remote's calls; responses, response continuations
//! and errors belong to ours. Frames for unknown ids are logged and dropped.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use bytes::Bytes;
use muxwire_proto::{
    ARG_COUNT, CallBody, CallRequestHead, CallResponseHead, Cancel, ChecksumType, ErrorCode,
    ErrorMessage, Fragmenter, Frame, FrameHeader, Headers, Init, MessageId, PROTOCOL_VERSION,
    Payload, RESERVED_ID, Reassembler, ReassemblyError, ResponseCode, TraceContext,
};
use tracing::{debug, trace, warn};

use crate::{
    error::{CallError, ConnectionError},
    ids::IdAllocator,
};

/// Actions returned by the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Write this frame to the socket.
    SendFrame(Frame),

    /// An outbound call finished. Emitted exactly once per call.
    CallCompleted {
        /// Call id.
        id: MessageId,
        /// Response or failure.
        result: Result<CallResponse, CallError>,
    },

    /// A response argument finished arriving, ahead of call completion.
    ArgumentReady {
        /// Call id.
        id: MessageId,
        /// Argument position.
        index: usize,
        /// Argument bytes.
        bytes: Bytes,
    },

    /// A fully reassembled inbound call is ready for its handler.
    DeliverCall(InboundCall),

    /// An inbound call was cancelled or timed out; its handler should stop.
    InboundCancelled {
        /// Call id.
        id: MessageId,
    },

    /// A ping we sent was answered.
    Pong {
        /// Ping id.
        id: MessageId,
    },

    /// A ping we sent went unanswered.
    PingTimedOut {
        /// Ping id.
        id: MessageId,
    },

    /// Init exchange finished.
    HandshakeCompleted {
        /// Identity the remote advertised.
        remote: RemoteInfo,
    },

    /// Release the socket with this reason.
    Close {
        /// Reason for closing the connection.
        reason: String,
    },
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket opening, nothing sent.
    Connecting,
    /// Init exchange in progress.
    Handshaking,
    /// Calls may flow in both directions.
    Established,
    /// Going away; no new calls.
    Closing,
    /// Socket released.
    Closed,
}

/// Which side opened the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialled out; sends the init request.
    Initiator,
    /// Accepted; answers the init request.
    Responder,
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Time allowed for the init exchange.
    pub handshake_timeout: Duration,
    /// Time allowed for a ping response.
    pub ping_timeout: Duration,
    /// Largest frame written, header included.
    pub max_frame_size: usize,
    /// Checksum for outbound calls that do not pick one.
    pub checksum_type: ChecksumType,
    /// `host:port` advertised in the handshake.
    pub host_port: String,
    /// Process name advertised in the handshake.
    pub process_name: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(5),
            max_frame_size: FrameHeader::MAX_FRAME_SIZE,
            checksum_type: ChecksumType::Crc32C,
            host_port: "0.0.0.0:0".to_string(),
            process_name: "muxwire".to_string(),
        }
    }
}

impl ConnectionConfig {
    /// Set the advertised identity.
    #[must_use]
    pub fn with_identity(mut self, host_port: impl Into<String>, process_name: impl Into<String>) -> Self {
        self.host_port = host_port.into();
        self.process_name = process_name.into();
        self
    }

    /// Set the handshake timeout.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the maximum frame size.
    #[must_use]
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the default checksum.
    #[must_use]
    pub fn with_checksum_type(mut self, kind: ChecksumType) -> Self {
        self.checksum_type = kind;
        self
    }
}

/// Identity the remote advertised during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInfo {
    /// Remote's `host:port`.
    pub host_port: String,
    /// Remote's process name.
    pub process_name: String,
}

/// A call to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCall {
    /// Target service.
    pub service: String,
    /// Transport headers.
    pub headers: Headers,
    /// Method name, application headers, body.
    pub args: [Bytes; ARG_COUNT],
    /// Time budget; must be positive.
    pub ttl: Duration,
    /// Tracing context.
    pub tracing: TraceContext,
    /// Checksum override; `None` uses the connection default.
    pub checksum_type: Option<ChecksumType>,
}

impl OutboundCall {
    /// Call with no headers and a zero tracing context.
    pub fn new(
        service: impl Into<String>,
        method: impl Into<Bytes>,
        arg2: impl Into<Bytes>,
        arg3: impl Into<Bytes>,
        ttl: Duration,
    ) -> Self {
        Self {
            service: service.into(),
            headers: Headers::new(),
            args: [method.into(), arg2.into(), arg3.into()],
            ttl,
            tracing: TraceContext::default(),
            checksum_type: None,
        }
    }

    /// Attach transport headers.
    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Attach a tracing context.
    #[must_use]
    pub fn with_tracing(mut self, tracing: TraceContext) -> Self {
        self.tracing = tracing;
        self
    }

    /// Override the checksum.
    #[must_use]
    pub fn with_checksum(mut self, kind: ChecksumType) -> Self {
        self.checksum_type = Some(kind);
        self
    }
}

/// A completed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResponse {
    /// Outcome code.
    pub code: ResponseCode,
    /// Transport headers.
    pub headers: Headers,
    /// Response arguments.
    pub args: [Bytes; ARG_COUNT],
}

impl CallResponse {
    /// True for a success response.
    pub fn is_ok(&self) -> bool {
        self.code == ResponseCode::Ok
    }

    /// Application headers argument.
    pub fn arg2(&self) -> &Bytes {
        &self.args[1]
    }

    /// Body argument.
    pub fn arg3(&self) -> &Bytes {
        &self.args[2]
    }
}

/// A response to send for an inbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundResponse {
    /// Outcome code.
    pub code: ResponseCode,
    /// Transport headers.
    pub headers: Headers,
    /// Arguments; the first is conventionally empty.
    pub args: [Bytes; ARG_COUNT],
}

impl OutboundResponse {
    /// Success response.
    pub fn ok(arg2: impl Into<Bytes>, arg3: impl Into<Bytes>) -> Self {
        Self {
            code: ResponseCode::Ok,
            headers: Headers::new(),
            args: [Bytes::new(), arg2.into(), arg3.into()],
        }
    }

    /// Application-level failure response.
    pub fn application_error(arg2: impl Into<Bytes>, arg3: impl Into<Bytes>) -> Self {
        Self { code: ResponseCode::Error, ..Self::ok(arg2, arg3) }
    }
}

/// A call received from the remote, fully reassembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCall {
    /// Call id, needed to respond.
    pub id: MessageId,
    /// Target service.
    pub service: String,
    /// Transport headers.
    pub headers: Headers,
    /// Method name, application headers, body.
    pub args: [Bytes; ARG_COUNT],
    /// Tracing context.
    pub tracing: TraceContext,
    /// When the caller gives up.
    pub deadline: Instant,
}

impl InboundCall {
    /// Method name argument.
    pub fn method(&self) -> &Bytes {
        &self.args[0]
    }

    /// Application headers argument.
    pub fn arg2(&self) -> &Bytes {
        &self.args[1]
    }

    /// Body argument.
    pub fn arg3(&self) -> &Bytes {
        &self.args[2]
    }
}

#[derive(Debug)]
struct PendingCall {
    deadline: Instant,
    tracing: TraceContext,
    /// The response must use the same kind.
    checksum_type: ChecksumType,
    response: Option<(CallResponseHead, Reassembler)>,
    args: [Bytes; ARG_COUNT],
}

#[derive(Debug)]
struct InboundState {
    deadline: Instant,
    head: CallRequestHead,
    checksum_type: ChecksumType,
    reassembler: Reassembler,
    args: [Bytes; ARG_COUNT],
    dispatched: bool,
}

/// Connection state machine.
///
/// One per socket. Pure state: no I/O, no Environment storage.
#[derive(Debug)]
pub struct Connection {
    state: ConnectionState,
    role: Role,
    config: ConnectionConfig,
    handshake_deadline: Option<Instant>,
    remote: Option<RemoteInfo>,
    ids: IdAllocator,
    outbound: HashMap<MessageId, PendingCall>,
    inbound: HashMap<MessageId, InboundState>,
    pings: HashMap<MessageId, Instant>,
}

impl Connection {
    /// Create a connection in the `Connecting` state.
    pub fn new(config: ConnectionConfig, role: Role) -> Self {
        Self {
            state: ConnectionState::Connecting,
            role,
            config,
            handshake_deadline: None,
            remote: None,
            ids: IdAllocator::default(),
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            pings: HashMap::new(),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Which side opened the socket.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Remote identity, once the handshake has completed.
    #[must_use]
    pub fn remote(&self) -> Option<&RemoteInfo> {
        self.remote.as_ref()
    }

    /// Number of outbound calls awaiting completion.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.outbound.len()
    }

    /// Number of inbound calls not yet answered.
    #[must_use]
    pub fn inbound_calls(&self) -> usize {
        self.inbound.len()
    }

    /// Socket is up: begin the handshake.
    ///
    /// The initiator emits its init request; the responder waits for one.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless in `Connecting`.
    pub fn start(&mut self, now: Instant) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if self.state != ConnectionState::Connecting {
            return Err(self.invalid_state("start"));
        }
        self.state = ConnectionState::Handshaking;
        self.handshake_deadline = Some(now + self.config.handshake_timeout);

        match self.role {
            Role::Initiator => {
                let init = Init::new(&self.config.host_port, &self.config.process_name);
                let frame = Payload::InitRequest(init).into_frame(RESERVED_ID)?;
                Ok(vec![ConnectionAction::SendFrame(frame)])
            },
            Role::Responder => Ok(Vec::new()),
        }
    }

    /// Start an outbound call.
    ///
    /// Returns the assigned id and the frames to write.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for a zero or oversized ttl, or arguments that
    ///   cannot be framed; nothing is sent
    /// - `ConnectionClosed` once closing or closed
    /// - `NotEstablished` before the handshake completes
    pub fn send_call(
        &mut self,
        call: OutboundCall,
        now: Instant,
    ) -> Result<(MessageId, Vec<ConnectionAction>), CallError> {
        self.ensure_established()?;

        if call.ttl.is_zero() {
            return Err(CallError::InvalidArgument("ttl must be positive".to_string()));
        }
        let ttl_ms = u32::try_from(call.ttl.as_millis())
            .map_err(|_| CallError::InvalidArgument(format!("ttl {:?} too large", call.ttl)))?
            .max(1);

        let id = self.allocate_id()?;
        let head = CallRequestHead {
            ttl_ms,
            tracing: call.tracing,
            service: call.service,
            headers: call.headers,
        };
        let checksum_type = call.checksum_type.unwrap_or(self.config.checksum_type);
        let payloads = Fragmenter::new(checksum_type)
            .with_max_frame_size(self.config.max_frame_size)
            .request(head, &call.args)
            .map_err(|e| CallError::InvalidArgument(e.to_string()))?;

        let actions = payloads
            .into_iter()
            .map(|payload| payload.into_frame(id).map(ConnectionAction::SendFrame))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CallError::InvalidArgument(e.to_string()))?;

        debug!(id, frames = actions.len(), "sending call");
        self.outbound.insert(id, PendingCall {
            deadline: now + call.ttl,
            tracing: call.tracing,
            checksum_type,
            response: None,
            args: Default::default(),
        });
        Ok((id, actions))
    }

    /// Abandon an outbound call.
    ///
    /// Completes it with `Cancelled` and tells the remote. Frames that arrive
    /// for the id afterwards are dropped. No-op for unknown ids.
    pub fn cancel(&mut self, id: MessageId, now: Instant) -> Vec<ConnectionAction> {
        let Some(call) = self.outbound.remove(&id) else {
            return Vec::new();
        };
        debug!(id, "cancelling call");

        let mut actions = vec![ConnectionAction::CallCompleted { id, result: Err(CallError::Cancelled) }];
        let cancel = Cancel {
            ttl_ms: remaining_ms(call.deadline, now),
            tracing: call.tracing,
            why: "cancelled by caller".to_string(),
        };
        if let Ok(frame) = Payload::Cancel(cancel).into_frame(id) {
            actions.push(ConnectionAction::SendFrame(frame));
        }
        actions
    }

    /// Send a ping-request and start its timer.
    ///
    /// # Errors
    ///
    /// As for [`Self::send_call`] when the connection is not established.
    pub fn send_ping(&mut self, now: Instant) -> Result<(MessageId, Vec<ConnectionAction>), CallError> {
        self.ensure_established()?;
        let id = self.allocate_id()?;
        let frame =
            Payload::PingRequest.into_frame(id).map_err(|e| CallError::Protocol(e.to_string()))?;
        self.pings.insert(id, now + self.config.ping_timeout);
        Ok((id, vec![ConnectionAction::SendFrame(frame)]))
    }

    /// Answer an inbound call.
    ///
    /// The response uses the request's checksum type. A response for a call
    /// that has already been cancelled or timed out is dropped.
    pub fn send_response(&mut self, id: MessageId, response: OutboundResponse) -> Vec<ConnectionAction> {
        let Some(call) = self.take_inbound(id) else {
            return Vec::new();
        };

        let head = CallResponseHead {
            code: response.code,
            tracing: call.head.tracing,
            headers: response.headers,
        };
        let framed = Fragmenter::new(call.checksum_type)
            .with_max_frame_size(self.config.max_frame_size)
            .response(head, &response.args)
            .and_then(|payloads| {
                payloads.into_iter().map(|p| p.into_frame(id)).collect::<Result<Vec<_>, _>>()
            });

        match framed {
            Ok(frames) => frames.into_iter().map(ConnectionAction::SendFrame).collect(),
            Err(e) => {
                warn!(id, error = %e, "response could not be framed");
                self.error_frame(id, call.head.tracing, ErrorCode::UnexpectedError, &e.to_string())
            },
        }
    }

    /// Answer an inbound call with an error frame.
    pub fn send_error(&mut self, id: MessageId, code: ErrorCode, message: &str) -> Vec<ConnectionAction> {
        match self.take_inbound(id) {
            Some(call) => self.error_frame(id, call.head.tracing, code, message),
            None => Vec::new(),
        }
    }

    /// Process a frame read from the socket.
    ///
    /// # Errors
    ///
    /// Connection-fatal conditions. The caller must then pass the error to
    /// [`Self::fail`].
    pub fn handle_frame(
        &mut self,
        frame: &Frame,
        now: Instant,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        trace!(id = frame.id(), opcode = ?frame.opcode(), state = ?self.state, "frame received");

        match self.state {
            ConnectionState::Closing | ConnectionState::Closed => Ok(Vec::new()),
            ConnectionState::Connecting => Err(ConnectionError::UnexpectedFrame {
                state: self.state,
                opcode: frame.opcode(),
            }),
            ConnectionState::Handshaking => self.handle_handshake(frame),
            ConnectionState::Established => self.handle_established(frame, now),
        }
    }

    /// Expire deadlines.
    ///
    /// Outbound calls past their deadline complete with `Timeout`, inbound
    /// calls past theirs are answered with a timeout error, unanswered pings
    /// are reported, and an unfinished handshake fails the connection.
    pub fn tick(&mut self, now: Instant) -> Vec<ConnectionAction> {
        if self.state == ConnectionState::Handshaking
            && self.handshake_deadline.is_some_and(|deadline| now >= deadline)
        {
            let timeout = self.config.handshake_timeout;
            return self.fail(&ConnectionError::HandshakeFailed(format!("timed out after {timeout:?}")));
        }

        let mut actions = Vec::new();

        for id in expired(&self.outbound, now, |call| call.deadline) {
            self.outbound.remove(&id);
            debug!(id, "call timed out");
            actions.push(ConnectionAction::CallCompleted { id, result: Err(CallError::Timeout) });
        }

        for id in expired(&self.inbound, now, |call| call.deadline) {
            if let Some(call) = self.inbound.remove(&id) {
                debug!(id, service = %call.head.service, "inbound call timed out");
                if call.dispatched {
                    actions.push(ConnectionAction::InboundCancelled { id });
                }
                actions.extend(self.error_frame(id, call.head.tracing, ErrorCode::Timeout, "call timed out"));
            }
        }

        for id in expired(&self.pings, now, |deadline| *deadline) {
            self.pings.remove(&id);
            actions.push(ConnectionAction::PingTimedOut { id });
        }

        actions
    }

    /// Earliest instant at which [`Self::tick`] has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let handshake = match self.state {
            ConnectionState::Handshaking => self.handshake_deadline,
            _ => None,
        };
        handshake
            .into_iter()
            .chain(self.outbound.values().map(|call| call.deadline))
            .chain(self.inbound.values().map(|call| call.deadline))
            .chain(self.pings.values().copied())
            .min()
    }

    /// Deliberate close.
    ///
    /// Fails every outstanding call with `ConnectionClosed` and asks the
    /// driver to release the socket. Idempotent.
    pub fn close(&mut self) -> Vec<ConnectionAction> {
        self.shutdown("closed locally".to_string())
    }

    /// Involuntary close after a connection-fatal error.
    ///
    /// Tells the remote why when the fault is on its side, then behaves like
    /// [`Self::close`].
    pub fn fail(&mut self, error: &ConnectionError) -> Vec<ConnectionAction> {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return Vec::new();
        }
        warn!(state = ?self.state, %error, "connection failed");

        let mut actions = Vec::new();
        if error.notifies_remote() {
            let code = match error {
                ConnectionError::HandshakeFailed(_) => ErrorCode::BadRequest,
                _ => ErrorCode::FatalProtocol,
            };
            let message = ErrorMessage::new(code, error.to_string());
            if let Ok(frame) = Payload::Error(message).into_frame(RESERVED_ID) {
                actions.push(ConnectionAction::SendFrame(frame));
            }
        }
        actions.extend(self.shutdown(error.to_string()));
        actions
    }

    /// The driver released the socket.
    pub fn closed(&mut self) {
        self.state = ConnectionState::Closed;
    }

    fn shutdown(&mut self, reason: String) -> Vec<ConnectionAction> {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return Vec::new();
        }
        self.state = ConnectionState::Closing;

        let mut ids: Vec<_> = self.outbound.drain().map(|(id, _)| id).collect();
        ids.sort_unstable();
        let mut actions: Vec<_> = ids
            .into_iter()
            .map(|id| ConnectionAction::CallCompleted { id, result: Err(CallError::ConnectionClosed) })
            .collect();

        let mut dispatched: Vec<_> =
            self.inbound.drain().filter(|(_, call)| call.dispatched).map(|(id, _)| id).collect();
        dispatched.sort_unstable();
        actions.extend(dispatched.into_iter().map(|id| ConnectionAction::InboundCancelled { id }));

        let mut pings: Vec<_> = self.pings.drain().map(|(id, _)| id).collect();
        pings.sort_unstable();
        actions.extend(pings.into_iter().map(|id| ConnectionAction::PingTimedOut { id }));

        actions.push(ConnectionAction::Close { reason });
        actions
    }

    fn handle_handshake(&mut self, frame: &Frame) -> Result<Vec<ConnectionAction>, ConnectionError> {
        let payload = Payload::from_frame(frame)?;
        match (self.role, payload) {
            (Role::Initiator, Payload::InitResponse(init)) => {
                let remote = validate_init(&init)?;
                Ok(self.establish(remote, Vec::new()))
            },
            (Role::Responder, Payload::InitRequest(init)) => {
                let remote = validate_init(&init)?;
                let reply = Init::new(&self.config.host_port, &self.config.process_name);
                let frame = Payload::InitResponse(reply).into_frame(RESERVED_ID)?;
                Ok(self.establish(remote, vec![ConnectionAction::SendFrame(frame)]))
            },
            (_, Payload::Error(error)) => Err(ConnectionError::HandshakeFailed(format!(
                "remote rejected handshake with {:?}: {}",
                error.code, error.message
            ))),
            (_, payload) => Err(ConnectionError::UnexpectedFrame {
                state: self.state,
                opcode: payload.opcode(),
            }),
        }
    }

    fn establish(&mut self, remote: RemoteInfo, mut actions: Vec<ConnectionAction>) -> Vec<ConnectionAction> {
        debug!(host_port = %remote.host_port, process = %remote.process_name, "handshake complete");
        self.state = ConnectionState::Established;
        self.handshake_deadline = None;
        self.remote = Some(remote.clone());
        actions.push(ConnectionAction::HandshakeCompleted { remote });
        actions
    }

    fn handle_established(
        &mut self,
        frame: &Frame,
        now: Instant,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        let id = frame.id();
        let payload = match Payload::from_frame(frame) {
            Ok(payload) => payload,
            Err(e) => return Ok(self.malformed(frame, &e.to_string())),
        };

        match payload {
            Payload::InitRequest(_) | Payload::InitResponse(_) => Err(ConnectionError::UnexpectedFrame {
                state: self.state,
                opcode: frame.opcode(),
            }),
            Payload::CallRequest { head, body } => Ok(self.on_call_request(id, head, &body, now)),
            Payload::CallRequestContinue(body) => Ok(self.on_request_continue(id, &body)),
            Payload::CallResponse { head, body } => Ok(self.on_response(id, Some(head), &body)),
            Payload::CallResponseContinue(body) => Ok(self.on_response(id, None, &body)),
            Payload::Cancel(cancel) => {
                if self.inbound.remove(&id).is_some() {
                    debug!(id, why = %cancel.why, "inbound call cancelled by caller");
                    Ok(vec![ConnectionAction::InboundCancelled { id }])
                } else {
                    debug!(id, "cancel for unknown call");
                    Ok(Vec::new())
                }
            },
            Payload::Claim(_) => {
                trace!(id, "ignoring claim");
                Ok(Vec::new())
            },
            Payload::PingRequest => {
                let pong = Payload::PingResponse.into_frame(id)?;
                Ok(vec![ConnectionAction::SendFrame(pong)])
            },
            Payload::PingResponse => {
                if self.pings.remove(&id).is_some() {
                    Ok(vec![ConnectionAction::Pong { id }])
                } else {
                    warn!(id, "ping response for unknown id");
                    Ok(Vec::new())
                }
            },
            Payload::Error(error) => self.on_error(id, error),
        }
    }

    fn on_call_request(
        &mut self,
        id: MessageId,
        head: CallRequestHead,
        body: &CallBody,
        now: Instant,
    ) -> Vec<ConnectionAction> {
        if self.inbound.contains_key(&id) {
            warn!(id, "duplicate call request id");
            return Vec::new();
        }
        debug!(id, service = %head.service, ttl_ms = head.ttl_ms, "inbound call");
        self.inbound.insert(id, InboundState {
            deadline: now + Duration::from_millis(u64::from(head.ttl_ms)),
            checksum_type: body.checksum_type,
            reassembler: Reassembler::new(body.checksum_type),
            head,
            args: Default::default(),
            dispatched: false,
        });
        self.on_request_continue(id, body)
    }

    fn on_request_continue(&mut self, id: MessageId, body: &CallBody) -> Vec<ConnectionAction> {
        let Some(call) = self.inbound.get_mut(&id) else {
            warn!(id, "request fragment for unknown call");
            return Vec::new();
        };

        match call.reassembler.push(body) {
            Ok(done) => {
                for arg in done {
                    call.args[arg.index] = arg.bytes;
                }
                if !call.reassembler.is_complete() {
                    return Vec::new();
                }
                call.dispatched = true;
                vec![ConnectionAction::DeliverCall(InboundCall {
                    id,
                    service: call.head.service.clone(),
                    headers: call.head.headers.clone(),
                    args: std::mem::take(&mut call.args),
                    tracing: call.head.tracing,
                    deadline: call.deadline,
                })]
            },
            Err(e) => {
                warn!(id, error = %e, "rejecting inbound call");
                let was_dispatched = call.dispatched;
                let mut actions = self.send_error(id, ErrorCode::BadRequest, &e.to_string());
                if was_dispatched {
                    actions.insert(0, ConnectionAction::InboundCancelled { id });
                }
                actions
            },
        }
    }

    fn on_response(
        &mut self,
        id: MessageId,
        head: Option<CallResponseHead>,
        body: &CallBody,
    ) -> Vec<ConnectionAction> {
        let Some(call) = self.outbound.get_mut(&id) else {
            warn!(id, "response fragment for unknown call");
            return Vec::new();
        };

        let progress = if let Some(head) = head {
            if call.response.is_some() {
                Err(CallError::Protocol("duplicate call response".to_string()))
            } else if body.checksum_type != call.checksum_type {
                Err(CallError::Protocol(format!(
                    "checksum type not echoed: sent {:?}, got {:?}",
                    call.checksum_type, body.checksum_type
                )))
            } else {
                let (_, reassembler) =
                    call.response.insert((head, Reassembler::new(call.checksum_type)));
                reassembler.push(body).map_err(reassembly_failure)
            }
        } else if let Some((_, reassembler)) = call.response.as_mut() {
            reassembler.push(body).map_err(reassembly_failure)
        } else {
            Err(CallError::Protocol("continuation before call response".to_string()))
        };

        let done = match progress {
            Ok(done) => done,
            Err(error) => {
                warn!(id, %error, "call failed");
                self.outbound.remove(&id);
                return vec![ConnectionAction::CallCompleted { id, result: Err(error) }];
            },
        };

        let mut actions = Vec::with_capacity(done.len() + 1);
        for arg in done {
            call.args[arg.index] = arg.bytes.clone();
            actions.push(ConnectionAction::ArgumentReady { id, index: arg.index, bytes: arg.bytes });
        }

        let complete = call.response.as_ref().is_some_and(|(_, r)| r.is_complete());
        if complete && let Some(call) = self.outbound.remove(&id) {
            let head = call.response.map(|(head, _)| head).unwrap_or_default();
            let response = CallResponse { code: head.code, headers: head.headers, args: call.args };
            actions.push(ConnectionAction::CallCompleted { id, result: Ok(response) });
        }
        actions
    }

    fn on_error(&mut self, id: MessageId, error: ErrorMessage) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if id == RESERVED_ID {
            if error.code.is_fatal() {
                return Err(ConnectionError::Remote { code: error.code, message: error.message });
            }
            warn!(code = ?error.code, message = %error.message, "connection-level error from remote");
            return Ok(Vec::new());
        }

        if self.outbound.remove(&id).is_some() {
            debug!(id, code = ?error.code, "call failed remotely");
            let result = Err(CallError::Remote { code: error.code, message: error.message });
            return Ok(vec![ConnectionAction::CallCompleted { id, result }]);
        }
        warn!(id, code = ?error.code, "error for unknown call");
        Ok(Vec::new())
    }

    /// A frame whose boundary is known but whose payload would not decode.
    fn malformed(&mut self, frame: &Frame, reason: &str) -> Vec<ConnectionAction> {
        let id = frame.id();
        match frame.opcode() {
            muxwire_proto::Opcode::CallResponse | muxwire_proto::Opcode::CallResponseContinue
                if self.outbound.remove(&id).is_some() =>
            {
                warn!(id, reason, "malformed response");
                let result = Err(CallError::Protocol(reason.to_string()));
                vec![ConnectionAction::CallCompleted { id, result }]
            },
            muxwire_proto::Opcode::CallRequest | muxwire_proto::Opcode::CallRequestContinue => {
                warn!(id, reason, "malformed request");
                let dispatched = self.inbound.get(&id).is_some_and(|call| call.dispatched);
                let tracing = self.inbound.remove(&id).map(|call| call.head.tracing).unwrap_or_default();
                let mut actions = self.error_frame(id, tracing, ErrorCode::BadRequest, reason);
                if dispatched {
                    actions.insert(0, ConnectionAction::InboundCancelled { id });
                }
                actions
            },
            opcode => {
                warn!(id, ?opcode, reason, "dropping malformed frame");
                Vec::new()
            },
        }
    }

    fn take_inbound(&mut self, id: MessageId) -> Option<InboundState> {
        let call = self.inbound.remove(&id);
        if call.is_none() {
            debug!(id, "no inbound call to answer; cancelled or expired");
        }
        call
    }

    fn error_frame(
        &self,
        id: MessageId,
        tracing: TraceContext,
        code: ErrorCode,
        message: &str,
    ) -> Vec<ConnectionAction> {
        let error = ErrorMessage { code, tracing, message: truncate(message).to_string() };
        match Payload::Error(error).into_frame(id) {
            Ok(frame) => vec![ConnectionAction::SendFrame(frame)],
            Err(e) => {
                warn!(id, error = %e, "error frame could not be encoded");
                Vec::new()
            },
        }
    }

    fn ensure_established(&self) -> Result<(), CallError> {
        match self.state {
            ConnectionState::Established => Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => Err(CallError::ConnectionClosed),
            ConnectionState::Connecting | ConnectionState::Handshaking => Err(CallError::NotEstablished),
        }
    }

    fn allocate_id(&mut self) -> Result<MessageId, CallError> {
        let (outbound, pings) = (&self.outbound, &self.pings);
        self.ids
            .allocate(|id| outbound.contains_key(&id) || pings.contains_key(&id))
            .ok_or(CallError::IdsExhausted)
    }

    fn invalid_state(&self, operation: &str) -> ConnectionError {
        ConnectionError::InvalidState { state: self.state, operation: operation.to_string() }
    }
}

fn validate_init(init: &Init) -> Result<RemoteInfo, ConnectionError> {
    if init.version != PROTOCOL_VERSION {
        return Err(ConnectionError::HandshakeFailed(format!(
            "unsupported protocol version {} (expected {PROTOCOL_VERSION})",
            init.version
        )));
    }
    if let Some(missing) = init.missing_required_header() {
        return Err(ConnectionError::HandshakeFailed(format!("missing init header '{missing}'")));
    }
    Ok(RemoteInfo {
        host_port: init.host_port().unwrap_or_default().to_string(),
        process_name: init.process_name().unwrap_or_default().to_string(),
    })
}

fn reassembly_failure(error: ReassemblyError) -> CallError {
    match error {
        ReassemblyError::ChecksumMismatch { .. } => CallError::ChecksumMismatch,
        other => CallError::Protocol(other.to_string()),
    }
}

fn expired<V>(map: &HashMap<MessageId, V>, now: Instant, deadline: impl Fn(&V) -> Instant) -> Vec<MessageId> {
    let mut ids: Vec<_> = map.iter().filter(|(_, v)| deadline(v) <= now).map(|(id, _)| *id).collect();
    ids.sort_unstable();
    ids
}

fn remaining_ms(deadline: Instant, now: Instant) -> u32 {
    u32::try_from(deadline.saturating_duration_since(now).as_millis()).unwrap_or(u32::MAX)
}

/// Error messages are capped well inside one frame.
fn truncate(message: &str) -> &str {
    const MAX: usize = 4096;
    if message.len() <= MAX {
        return message;
    }
    let mut end = MAX;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> ConnectionConfig {
        ConnectionConfig::default().with_identity(format!("{name}:4040"), name)
    }

    fn frames(actions: &[ConnectionAction]) -> Vec<Frame> {
        actions
            .iter()
            .filter_map(|a| match a {
                ConnectionAction::SendFrame(frame) => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    /// Feed every frame in `actions` to `to`, returning what it produced.
    fn deliver(to: &mut Connection, actions: &[ConnectionAction], now: Instant) -> Vec<ConnectionAction> {
        let mut out = Vec::new();
        for frame in frames(actions) {
            out.extend(to.handle_frame(&frame, now).unwrap());
        }
        out
    }

    fn established_pair(t0: Instant) -> (Connection, Connection) {
        let mut client = Connection::new(config("client"), Role::Initiator);
        let mut server = Connection::new(config("server"), Role::Responder);
        let hello = client.start(t0).unwrap();
        server.start(t0).unwrap();
        let reply = deliver(&mut server, &hello, t0);
        let done = deliver(&mut client, &reply, t0);
        assert!(matches!(done.as_slice(), [ConnectionAction::HandshakeCompleted { .. }]));
        (client, server)
    }

    fn completion(actions: &[ConnectionAction], id: MessageId) -> Option<Result<CallResponse, CallError>> {
        actions.iter().find_map(|a| match a {
            ConnectionAction::CallCompleted { id: done, result } if *done == id => Some(result.clone()),
            _ => None,
        })
    }

    fn delivered(actions: &[ConnectionAction]) -> Option<InboundCall> {
        actions.iter().find_map(|a| match a {
            ConnectionAction::DeliverCall(call) => Some(call.clone()),
            _ => None,
        })
    }

    fn call(body: impl Into<Bytes>, ttl: Duration) -> OutboundCall {
        OutboundCall::new("kv", "get", "", body, ttl)
    }

    #[test]
    fn handshake_exchanges_identities() {
        let t0 = Instant::now();
        let (client, server) = established_pair(t0);

        assert_eq!(client.state(), ConnectionState::Established);
        assert_eq!(server.state(), ConnectionState::Established);
        assert_eq!(client.remote().map(|r| r.host_port.as_str()), Some("server:4040"));
        assert_eq!(server.remote().map(|r| r.process_name.as_str()), Some("client"));
    }

    #[test]
    fn initiator_sends_init_on_reserved_id() {
        let mut client = Connection::new(config("client"), Role::Initiator);
        let actions = client.start(Instant::now()).unwrap();
        let sent = frames(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), RESERVED_ID);
        assert_eq!(sent[0].opcode(), muxwire_proto::Opcode::InitRequest);
    }

    #[test]
    fn start_twice_is_invalid() {
        let mut client = Connection::new(config("client"), Role::Initiator);
        client.start(Instant::now()).unwrap();
        assert!(matches!(client.start(Instant::now()), Err(ConnectionError::InvalidState { .. })));
    }

    #[test]
    fn wrong_version_rejected_with_error_frame() {
        let t0 = Instant::now();
        let mut server = Connection::new(config("server"), Role::Responder);
        server.start(t0).unwrap();

        let init = Init { version: 1, ..Init::new("c:1", "c") };
        let frame = Payload::InitRequest(init).into_frame(RESERVED_ID).unwrap();
        let err = server.handle_frame(&frame, t0).unwrap_err();
        assert!(matches!(err, ConnectionError::HandshakeFailed(_)));

        let actions = server.fail(&err);
        let sent = frames(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].opcode(), muxwire_proto::Opcode::Error);
        assert!(matches!(actions.last(), Some(ConnectionAction::Close { .. })));
        assert_eq!(server.state(), ConnectionState::Closing);
    }

    #[test]
    fn missing_required_header_rejected() {
        let t0 = Instant::now();
        let mut server = Connection::new(config("server"), Role::Responder);
        server.start(t0).unwrap();

        let init = Init { version: PROTOCOL_VERSION, headers: vec![("host_port".into(), "c:1".into())] };
        let frame = Payload::InitRequest(init).into_frame(RESERVED_ID).unwrap();
        let err = server.handle_frame(&frame, t0).unwrap_err();
        assert_eq!(err, ConnectionError::HandshakeFailed("missing init header 'process_name'".into()));
    }

    #[test]
    fn handshake_timeout_fails_connection() {
        let t0 = Instant::now();
        let mut client = Connection::new(config("client"), Role::Initiator);
        client.start(t0).unwrap();

        assert!(client.tick(t0 + Duration::from_secs(1)).is_empty());
        let actions = client.tick(t0 + Duration::from_secs(5));
        assert!(matches!(actions.last(), Some(ConnectionAction::Close { .. })));
        assert_eq!(client.state(), ConnectionState::Closing);
    }

    #[test]
    fn call_before_handshake_not_established() {
        let t0 = Instant::now();
        let mut client = Connection::new(config("client"), Role::Initiator);
        client.start(t0).unwrap();
        let err = client.send_call(call("x", Duration::from_secs(1)), t0).unwrap_err();
        assert_eq!(err, CallError::NotEstablished);
    }

    #[test]
    fn request_response_round_trip() {
        let t0 = Instant::now();
        let (mut client, mut server) = established_pair(t0);

        let (id, sent) = client.send_call(call("hello", Duration::from_secs(1)), t0).unwrap();
        let inbound = delivered(&deliver(&mut server, &sent, t0)).unwrap();
        assert_eq!(inbound.id, id);
        assert_eq!(inbound.service, "kv");
        assert_eq!(inbound.method().as_ref(), b"get");
        assert_eq!(inbound.arg3().as_ref(), b"hello");

        let reply = server.send_response(id, OutboundResponse::ok("", "world"));
        let done = deliver(&mut client, &reply, t0);
        let response = completion(&done, id).unwrap().unwrap();
        assert!(response.is_ok());
        assert_eq!(response.arg3().as_ref(), b"world");
        assert_eq!(client.pending_calls(), 0);
        assert_eq!(server.inbound_calls(), 0);
    }

    #[test]
    fn large_arguments_fragment_and_stream() {
        let t0 = Instant::now();
        let (mut client, mut server) = established_pair(t0);

        let body = Bytes::from(vec![7u8; 150_000]);
        let (id, sent) = client.send_call(call(body.clone(), Duration::from_secs(5)), t0).unwrap();
        assert!(frames(&sent).len() >= 3);

        let inbound = delivered(&deliver(&mut server, &sent, t0)).unwrap();
        assert_eq!(inbound.arg3(), &body);

        let reply = server.send_response(id, OutboundResponse::ok("meta", body.clone()));
        let done = deliver(&mut client, &reply, t0);
        let ready: Vec<usize> = done
            .iter()
            .filter_map(|a| match a {
                ConnectionAction::ArgumentReady { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(ready, vec![0, 1, 2]);
        assert_eq!(completion(&done, id).unwrap().unwrap().arg3(), &body);
    }

    #[test]
    fn zero_ttl_rejected_without_frames() {
        let t0 = Instant::now();
        let (mut client, _) = established_pair(t0);
        let err = client.send_call(call("x", Duration::ZERO), t0).unwrap_err();
        assert!(matches!(err, CallError::InvalidArgument(_)));
        assert_eq!(client.pending_calls(), 0);
    }

    #[test]
    fn timeout_completes_once_and_late_response_dropped() {
        let t0 = Instant::now();
        let (mut client, mut server) = established_pair(t0);

        let (id, sent) = client.send_call(call("x", Duration::from_millis(100)), t0).unwrap();
        deliver(&mut server, &sent, t0);
        assert_eq!(client.next_deadline(), Some(t0 + Duration::from_millis(100)));

        let actions = client.tick(t0 + Duration::from_millis(100));
        assert_eq!(completion(&actions, id), Some(Err(CallError::Timeout)));
        assert!(client.tick(t0 + Duration::from_millis(200)).is_empty());

        let late = server.send_response(id, OutboundResponse::ok("", "late"));
        let after = deliver(&mut client, &late, t0 + Duration::from_millis(300));
        assert!(after.is_empty());
    }

    #[test]
    fn responder_times_out_inbound_calls() {
        let t0 = Instant::now();
        let (mut client, mut server) = established_pair(t0);

        let (id, sent) = client.send_call(call("x", Duration::from_millis(50)), t0).unwrap();
        deliver(&mut server, &sent, t0);

        let actions = server.tick(t0 + Duration::from_millis(50));
        assert!(actions.contains(&ConnectionAction::InboundCancelled { id }));
        let error = frames(&actions).pop().unwrap();
        assert_eq!(error.opcode(), muxwire_proto::Opcode::Error);
        assert!(server.send_response(id, OutboundResponse::ok("", "")).is_empty());
    }

    #[test]
    fn cancel_completes_and_notifies_remote() {
        let t0 = Instant::now();
        let (mut client, mut server) = established_pair(t0);

        let (id, sent) = client.send_call(call("x", Duration::from_secs(1)), t0).unwrap();
        deliver(&mut server, &sent, t0);

        let actions = client.cancel(id, t0 + Duration::from_millis(10));
        assert_eq!(completion(&actions, id), Some(Err(CallError::Cancelled)));
        assert!(client.cancel(id, t0).is_empty());

        let remote = deliver(&mut server, &actions, t0);
        assert_eq!(remote, vec![ConnectionAction::InboundCancelled { id }]);
    }

    #[test]
    fn remote_error_fails_call() {
        let t0 = Instant::now();
        let (mut client, mut server) = established_pair(t0);

        let (id, sent) = client.send_call(call("x", Duration::from_secs(1)), t0).unwrap();
        deliver(&mut server, &sent, t0);
        let reply = server.send_error(id, ErrorCode::BadRequest, "Endpoint 'get' is not defined");
        let done = deliver(&mut client, &reply, t0);

        assert_eq!(
            completion(&done, id),
            Some(Err(CallError::Remote {
                code: ErrorCode::BadRequest,
                message: "Endpoint 'get' is not defined".into()
            }))
        );
    }

    #[test]
    fn corrupted_response_checksum_fails_only_that_call() {
        let t0 = Instant::now();
        let (mut client, mut server) = established_pair(t0);

        let (bad, sent_bad) = client.send_call(call("a", Duration::from_secs(1)), t0).unwrap();
        let (good, sent_good) = client.send_call(call("b", Duration::from_secs(1)), t0).unwrap();
        deliver(&mut server, &sent_bad, t0);
        deliver(&mut server, &sent_good, t0);

        let mut reply = frames(&server.send_response(bad, OutboundResponse::ok("", "payload")));
        let frame = reply.remove(0);
        let mut bytes = frame.payload().to_vec();
        let last = bytes.len() - 5;
        bytes[last] ^= 0xff;
        let tampered = Frame::new(frame.opcode(), frame.id(), bytes).unwrap();

        let done = client.handle_frame(&tampered, t0).unwrap();
        assert_eq!(completion(&done, bad), Some(Err(CallError::ChecksumMismatch)));
        assert_eq!(client.state(), ConnectionState::Established);

        let ok = deliver(&mut client, &server.send_response(good, OutboundResponse::ok("", "b")), t0);
        assert!(completion(&ok, good).unwrap().is_ok());
    }

    #[test]
    fn response_must_echo_request_checksum_type() {
        let t0 = Instant::now();
        let (mut client, _) = established_pair(t0);
        let (id, _) = client.send_call(call("a", Duration::from_secs(1)), t0).unwrap();

        let args = [Bytes::new(), Bytes::new(), Bytes::from_static(b"tampered")];
        let forged = Fragmenter::new(ChecksumType::None)
            .response(CallResponseHead::default(), &args)
            .unwrap()
            .remove(0)
            .into_frame(id)
            .unwrap();

        let done = client.handle_frame(&forged, t0).unwrap();
        assert!(matches!(completion(&done, id), Some(Err(CallError::Protocol(_)))));
        assert_eq!(client.state(), ConnectionState::Established);
    }

    #[test]
    fn bad_request_checksum_answered_with_bad_request() {
        let t0 = Instant::now();
        let (mut client, mut server) = established_pair(t0);

        let (id, sent) = client.send_call(call("abc", Duration::from_secs(1)), t0).unwrap();
        let frame = frames(&sent).remove(0);
        let mut bytes = frame.payload().to_vec();
        let last = bytes.len() - 5;
        bytes[last] ^= 0x01;
        let tampered = Frame::new(frame.opcode(), id, bytes).unwrap();

        let actions = server.handle_frame(&tampered, t0).unwrap();
        assert!(delivered(&actions).is_none());
        let done = deliver(&mut client, &actions, t0);
        assert!(matches!(
            completion(&done, id),
            Some(Err(CallError::Remote { code: ErrorCode::BadRequest, .. }))
        ));
    }

    #[test]
    fn malformed_chunk_length_fails_call() {
        let t0 = Instant::now();
        let (mut client, _) = established_pair(t0);
        let (id, _) = client.send_call(call("x", Duration::from_secs(1)), t0).unwrap();

        // flags, code, tracing, nh=0, csumtype none, chunk claims 0x10 bytes
        let mut payload = vec![0x00, 0x00];
        payload.extend_from_slice(&[0u8; TraceContext::SIZE]);
        payload.extend_from_slice(&[0x00, 0x00, 0x00, 0x10, 0xaa]);
        let frame = Frame::new(muxwire_proto::Opcode::CallResponse, id, payload).unwrap();

        let done = client.handle_frame(&frame, t0).unwrap();
        assert!(matches!(completion(&done, id), Some(Err(CallError::Protocol(_)))));
        assert_eq!(client.state(), ConnectionState::Established);
    }

    #[test]
    fn unknown_ids_dropped() {
        let t0 = Instant::now();
        let (mut client, _) = established_pair(t0);
        let stray = Payload::Error(ErrorMessage::new(ErrorCode::Busy, "who?")).into_frame(999).unwrap();
        assert!(client.handle_frame(&stray, t0).unwrap().is_empty());
    }

    #[test]
    fn fatal_connection_error_from_remote() {
        let t0 = Instant::now();
        let (mut client, _) = established_pair(t0);
        let fatal = Payload::Error(ErrorMessage::new(ErrorCode::FatalProtocol, "bye"))
            .into_frame(RESERVED_ID)
            .unwrap();
        let err = client.handle_frame(&fatal, t0).unwrap_err();
        assert!(matches!(err, ConnectionError::Remote { code: ErrorCode::FatalProtocol, .. }));

        let actions = client.fail(&err);
        assert!(frames(&actions).is_empty());
    }

    #[test]
    fn close_fails_every_pending_call_once() {
        let t0 = Instant::now();
        let (mut client, _) = established_pair(t0);
        let (a, _) = client.send_call(call("a", Duration::from_secs(1)), t0).unwrap();
        let (b, _) = client.send_call(call("b", Duration::from_secs(1)), t0).unwrap();

        let actions = client.close();
        assert_eq!(completion(&actions, a), Some(Err(CallError::ConnectionClosed)));
        assert_eq!(completion(&actions, b), Some(Err(CallError::ConnectionClosed)));
        let closes = actions.iter().filter(|a| matches!(a, ConnectionAction::Close { .. })).count();
        assert_eq!(closes, 1);

        assert!(client.close().is_empty());
        client.closed();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(
            client.send_call(call("c", Duration::from_secs(1)), t0).unwrap_err(),
            CallError::ConnectionClosed
        );
    }

    #[test]
    fn ping_round_trip_and_timeout() {
        let t0 = Instant::now();
        let (mut client, mut server) = established_pair(t0);

        let (id, sent) = client.send_ping(t0).unwrap();
        let pong = deliver(&mut server, &sent, t0);
        assert_eq!(deliver(&mut client, &pong, t0), vec![ConnectionAction::Pong { id }]);

        let (lost, _) = client.send_ping(t0).unwrap();
        let actions = client.tick(t0 + Duration::from_secs(5));
        assert_eq!(actions, vec![ConnectionAction::PingTimedOut { id: lost }]);
    }

    #[test]
    fn ids_unique_while_outstanding() {
        let t0 = Instant::now();
        let (mut client, _) = established_pair(t0);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let (id, _) = client.send_call(call("x", Duration::from_secs(1)), t0).unwrap();
            assert!(seen.insert(id));
            assert_ne!(id, RESERVED_ID);
        }
    }

    #[test]
    fn init_after_established_is_fatal() {
        let t0 = Instant::now();
        let (mut client, _) = established_pair(t0);
        let frame = Payload::InitResponse(Init::new("x:1", "x")).into_frame(RESERVED_ID).unwrap();
        assert!(matches!(
            client.handle_frame(&frame, t0),
            Err(ConnectionError::UnexpectedFrame { .. })
        ));
    }
}
