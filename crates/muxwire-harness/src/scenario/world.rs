//! World state for scenario execution.
//!
//! The World owns the connection state machines of every actor, moves frames
//! between them as encoded bytes, answers inbound calls with each server's
//! responder, and records everything an oracle might want to check.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use muxwire_core::{
    CallError, CallResponse, Connection, ConnectionAction, ConnectionState, InboundCall,
    OutboundCall, OutboundResponse,
};
use muxwire_proto::{ErrorCode, Frame, FrameBuffer, MessageId};
use tracing::{debug, trace};

/// What a server does with a delivered call.
///
/// `None` leaves the call unanswered, which lets a scenario exercise
/// timeouts and cancellation.
pub type ResponderFn = Box<dyn Fn(&InboundCall) -> Option<Result<OutboundResponse, (ErrorCode, String)>>>;

/// Responder that echoes the request's second and third arguments.
pub fn echo_responder() -> ResponderFn {
    Box::new(|call| Some(Ok(OutboundResponse::ok(call.arg2().clone(), call.arg3().clone()))))
}

/// Network events that occurred during scenario execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// Frames between two actors are dropped.
    Partition {
        /// One side.
        from: String,
        /// Other side.
        to: String,
    },
    /// Frames flow again.
    PartitionHealed {
        /// One side.
        from: String,
        /// Other side.
        to: String,
    },
    /// Virtual time moved forward.
    Advanced {
        /// Amount.
        by: Duration,
    },
}

struct Actor {
    connection: Connection,
    peer: Option<String>,
    decoder: FrameBuffer,
    responder: Option<ResponderFn>,
}

/// World state containing all actors and metrics.
pub struct World {
    now: Instant,
    actors: HashMap<String, Actor>,
    order: Vec<String>,
    wire: VecDeque<(String, Vec<u8>)>,
    partitioned: Vec<(String, String)>,
    frames_sent: HashMap<String, usize>,
    frames_received: HashMap<String, usize>,
    started: HashMap<String, Vec<MessageId>>,
    rejected: HashMap<String, Vec<CallError>>,
    completions: HashMap<String, Vec<(MessageId, Result<CallResponse, CallError>)>>,
    delivered: HashMap<String, Vec<InboundCall>>,
    cancelled: HashMap<String, Vec<MessageId>>,
    pongs: HashMap<String, usize>,
    closes: HashMap<String, usize>,
    network_events: Vec<NetworkEvent>,
}

impl World {
    /// Empty world at `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            now,
            actors: HashMap::new(),
            order: Vec::new(),
            wire: VecDeque::new(),
            partitioned: Vec::new(),
            frames_sent: HashMap::new(),
            frames_received: HashMap::new(),
            started: HashMap::new(),
            rejected: HashMap::new(),
            completions: HashMap::new(),
            delivered: HashMap::new(),
            cancelled: HashMap::new(),
            pongs: HashMap::new(),
            closes: HashMap::new(),
            network_events: Vec::new(),
        }
    }

    /// Add an actor. Servers pass a responder; clients pass `None`.
    pub fn add_actor(&mut self, name: impl Into<String>, connection: Connection, responder: Option<ResponderFn>) {
        let name = name.into();
        self.order.push(name.clone());
        self.actors.insert(name, Actor { connection, peer: None, decoder: FrameBuffer::new(), responder });
    }

    /// Wire two actors together and start both connections.
    pub fn connect(&mut self, a: &str, b: &str) -> Result<(), String> {
        for (from, to) in [(a, b), (b, a)] {
            let actor = self.actors.get_mut(from).ok_or_else(|| format!("unknown actor {from}"))?;
            actor.peer = Some(to.to_string());
        }
        for name in [a, b] {
            let now = self.now;
            let actor = self.actor_mut(name)?;
            let actions = actor.connection.start(now).map_err(|e| format!("{name}: start failed: {e}"))?;
            self.execute(name, actions);
        }
        self.deliver_all();
        Ok(())
    }

    /// Connection of `name`.
    pub fn connection(&self, name: &str) -> Option<&Connection> {
        self.actors.get(name).map(|actor| &actor.connection)
    }

    /// Current virtual time.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Start a call from `from`, returning its id.
    ///
    /// Calls the connection refuses are recorded in [`Self::rejected`].
    pub fn send_call(&mut self, from: &str, call: OutboundCall) -> Result<MessageId, CallError> {
        let now = self.now;
        let actor = self.actors.get_mut(from).ok_or(CallError::NotEstablished)?;
        match actor.connection.send_call(call, now) {
            Ok((id, actions)) => {
                self.started.entry(from.to_string()).or_default().push(id);
                self.execute(from, actions);
                Ok(id)
            },
            Err(e) => {
                self.rejected.entry(from.to_string()).or_default().push(e.clone());
                Err(e)
            },
        }
    }

    /// Cancel a call started by `from`.
    pub fn cancel(&mut self, from: &str, id: MessageId) -> Result<(), String> {
        let now = self.now;
        let actions = self.actor_mut(from)?.connection.cancel(id, now);
        self.execute(from, actions);
        Ok(())
    }

    /// Send a ping from `from`.
    pub fn ping(&mut self, from: &str) -> Result<MessageId, String> {
        let now = self.now;
        let (id, actions) = self.actor_mut(from)?.connection.send_ping(now).map_err(|e| e.to_string())?;
        self.execute(from, actions);
        Ok(id)
    }

    /// Close `name`'s connection deliberately.
    ///
    /// The peer learns about it the way it would from a socket reaching end
    /// of file.
    pub fn close(&mut self, name: &str) -> Result<(), String> {
        let actions = self.actor_mut(name)?.connection.close();
        self.execute(name, actions);
        self.release(name);
        Ok(())
    }

    /// Drop frames between `a` and `b` until healed.
    pub fn partition(&mut self, a: &str, b: &str) {
        debug!(a, b, "partition");
        self.partitioned.push((a.to_string(), b.to_string()));
        self.network_events.push(NetworkEvent::Partition { from: a.to_string(), to: b.to_string() });
    }

    /// Undo [`Self::partition`].
    pub fn heal(&mut self, a: &str, b: &str) {
        self.partitioned.retain(|(x, y)| !((x == a && y == b) || (x == b && y == a)));
        self.network_events.push(NetworkEvent::PartitionHealed { from: a.to_string(), to: b.to_string() });
    }

    /// Move time forward, run every timer, then deliver resulting frames.
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        self.network_events.push(NetworkEvent::Advanced { by });
        let now = self.now;
        for name in self.order.clone() {
            if let Some(actor) = self.actors.get_mut(&name) {
                let actions = actor.connection.tick(now);
                self.execute(&name, actions);
            }
        }
        self.deliver_all();
    }

    /// Deliver queued frames until the wire is quiet.
    pub fn deliver_all(&mut self) {
        while let Some((to, bytes)) = self.wire.pop_front() {
            let now = self.now;
            let Some(actor) = self.actors.get_mut(&to) else { continue };
            let result = actor.decoder.push(&bytes);
            let frames = match result {
                Ok(frames) => frames,
                Err(e) => {
                    let actions = actor.connection.fail(&e.into());
                    self.execute(&to, actions);
                    continue;
                },
            };
            for frame in frames {
                *self.frames_received.entry(to.clone()).or_insert(0) += 1;
                let Some(actor) = self.actors.get_mut(&to) else { break };
                let actions = match actor.connection.handle_frame(&frame, now) {
                    Ok(actions) => actions,
                    Err(e) => actor.connection.fail(&e),
                };
                self.execute(&to, actions);
            }
        }
    }

    /// Ids of calls `name` started, in order.
    pub fn started(&self, name: &str) -> &[MessageId] {
        self.started.get(name).map_or(&[], Vec::as_slice)
    }

    /// Calls `name` tried to start but its connection refused.
    pub fn rejected(&self, name: &str) -> &[CallError] {
        self.rejected.get(name).map_or(&[], Vec::as_slice)
    }

    /// Completed calls started by `name`, in completion order.
    pub fn completions(&self, name: &str) -> &[(MessageId, Result<CallResponse, CallError>)] {
        self.completions.get(name).map_or(&[], Vec::as_slice)
    }

    /// Outcome of call `id` started by `name`, if it has completed.
    pub fn completion(&self, name: &str, id: MessageId) -> Option<&Result<CallResponse, CallError>> {
        self.completions(name).iter().find(|(done, _)| *done == id).map(|(_, result)| result)
    }

    /// Calls delivered to `name`'s responder.
    pub fn delivered(&self, name: &str) -> &[InboundCall] {
        self.delivered.get(name).map_or(&[], Vec::as_slice)
    }

    /// Inbound calls of `name` that were cancelled or timed out.
    pub fn cancelled(&self, name: &str) -> &[MessageId] {
        self.cancelled.get(name).map_or(&[], Vec::as_slice)
    }

    /// Pongs received by `name`.
    pub fn pongs(&self, name: &str) -> usize {
        self.pongs.get(name).copied().unwrap_or(0)
    }

    /// How many times `name` released its socket.
    pub fn closes(&self, name: &str) -> usize {
        self.closes.get(name).copied().unwrap_or(0)
    }

    /// Frames written by `name`.
    pub fn frames_sent(&self, name: &str) -> usize {
        self.frames_sent.get(name).copied().unwrap_or(0)
    }

    /// Frames read by `name`.
    pub fn frames_received(&self, name: &str) -> usize {
        self.frames_received.get(name).copied().unwrap_or(0)
    }

    /// Network events in order.
    pub fn network_events(&self) -> &[NetworkEvent] {
        &self.network_events
    }

    /// Whether every actor is established.
    pub fn all_established(&self) -> bool {
        self.actors.values().all(|actor| actor.connection.state() == ConnectionState::Established)
    }

    /// Actor names in insertion order.
    pub fn actor_names(&self) -> &[String] {
        &self.order
    }

    fn actor_mut(&mut self, name: &str) -> Result<&mut Actor, String> {
        self.actors.get_mut(name).ok_or_else(|| format!("unknown actor {name}"))
    }

    fn is_partitioned(&self, a: &str, b: &str) -> bool {
        self.partitioned.iter().any(|(x, y)| (x == a && y == b) || (x == b && y == a))
    }

    fn execute(&mut self, name: &str, actions: Vec<ConnectionAction>) {
        let mut queue: VecDeque<ConnectionAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                ConnectionAction::SendFrame(frame) => self.transmit(name, &frame),
                ConnectionAction::CallCompleted { id, result } => {
                    self.completions.entry(name.to_string()).or_default().push((id, result));
                },
                ConnectionAction::ArgumentReady { .. } | ConnectionAction::HandshakeCompleted { .. } => {},
                ConnectionAction::DeliverCall(call) => {
                    self.delivered.entry(name.to_string()).or_default().push(call.clone());
                    queue.extend(self.respond(name, &call));
                },
                ConnectionAction::InboundCancelled { id } => {
                    self.cancelled.entry(name.to_string()).or_default().push(id);
                },
                ConnectionAction::Pong { .. } => *self.pongs.entry(name.to_string()).or_insert(0) += 1,
                ConnectionAction::PingTimedOut { .. } => {},
                ConnectionAction::Close { .. } => self.release(name),
            }
        }
    }

    fn respond(&mut self, name: &str, call: &InboundCall) -> Vec<ConnectionAction> {
        let Some(actor) = self.actors.get_mut(name) else { return Vec::new() };
        let answer = actor.responder.as_ref().and_then(|responder| responder(call));
        match answer {
            Some(Ok(response)) => actor.connection.send_response(call.id, response),
            Some(Err((code, message))) => actor.connection.send_error(call.id, code, &message),
            None => Vec::new(),
        }
    }

    fn transmit(&mut self, from: &str, frame: &Frame) {
        *self.frames_sent.entry(from.to_string()).or_insert(0) += 1;
        let Some(to) = self.actors.get(from).and_then(|actor| actor.peer.clone()) else { return };
        if self.is_partitioned(from, &to) {
            trace!(from, %to, opcode = ?frame.opcode(), "dropping frame across partition");
            return;
        }
        self.wire.push_back((to, frame.to_bytes().to_vec()));
    }

    /// Socket released: mark closed and let the peer see end of file.
    fn release(&mut self, name: &str) {
        let Some(actor) = self.actors.get_mut(name) else { return };
        if actor.connection.state() == ConnectionState::Closed {
            return;
        }
        actor.connection.closed();
        debug!(actor = name, "socket released");
        *self.closes.entry(name.to_string()).or_insert(0) += 1;

        let Some(peer) = actor.peer.clone() else { return };
        if let Some(remote) = self.actors.get_mut(&peer) {
            let error = muxwire_core::ConnectionError::Transport("end of file".to_string());
            let actions = remote.connection.fail(&error);
            self.execute(&peer, actions);
        }
    }
}
