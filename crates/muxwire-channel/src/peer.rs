//! One remote endpoint.
//!
//! A peer holds zero or one live connection. [`Peer::get_connection`] reuses
//! it while it is established and otherwise dials through the transport.
//! Concurrent callers queue on an async mutex behind a single connect
//! attempt and share its outcome: a caller that waited on an attempt which
//! failed gets that failure instead of dialing again. Load and failure
//! accounting lives in the owning selector's heap, reached through a weak
//! reference so a removed peer simply stops scoring.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicU64, Ordering},
};

use muxwire_core::{
    CallError, CallOutcome, ConnectionConfig, Environment, PeerHeap, Role, Score, Transport,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::PeerConfig,
    connection::{ConnectionBuilder, ConnectionHandle},
    handler::CallSink,
};

/// Shared by every peer a channel creates.
pub(crate) struct PeerContext<E> {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) env: E,
    pub(crate) connection: ConnectionConfig,
    pub(crate) peer: PeerConfig,
    pub(crate) sink: Option<Arc<dyn CallSink>>,
}

pub(crate) type SharedHeap = Arc<Mutex<PeerHeap<String>>>;

/// Cached connection plus the outcome of the last connect attempt.
#[derive(Default)]
struct Slot {
    handle: Option<ConnectionHandle>,
    last_failure: Option<CallError>,
}

/// A remote `host:port` and its connection.
pub struct Peer<E> {
    host_port: String,
    context: Arc<PeerContext<E>>,
    heap: Weak<Mutex<PeerHeap<String>>>,
    slot: tokio::sync::Mutex<Slot>,
    /// Finished connect attempts. Bumped while `slot` is held.
    attempts: AtomicU64,
}

impl<E> std::fmt::Debug for Peer<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer").field("host_port", &self.host_port).finish_non_exhaustive()
    }
}

impl<E: Environment> Peer<E> {
    pub(crate) fn new(host_port: String, context: Arc<PeerContext<E>>, heap: &SharedHeap) -> Arc<Self> {
        Arc::new(Self {
            host_port,
            context,
            heap: Arc::downgrade(heap),
            slot: tokio::sync::Mutex::new(Slot::default()),
            attempts: AtomicU64::new(0),
        })
    }

    /// Address of this peer.
    pub fn host_port(&self) -> &str {
        &self.host_port
    }

    /// Current load and health, while the peer is still in its selector.
    pub fn score(&self) -> Option<Score> {
        self.heap.upgrade()?.lock().score(&self.host_port)
    }

    /// Established connection to this peer, connecting if needed.
    ///
    /// # Errors
    ///
    /// `ConnectFailed` if the transport fails or times out, `HandshakeFailed`
    /// if the remote rejects the handshake. Both count as a failure against
    /// the peer.
    pub async fn get_connection(self: &Arc<Self>) -> Result<ConnectionHandle, CallError> {
        let joined = self.attempts.load(Ordering::Acquire);
        let mut slot = self.slot.lock().await;
        if let Some(handle) = slot.handle.as_ref() {
            if handle.is_usable() {
                return Ok(handle.clone());
            }
            debug!(peer = %self.host_port, state = ?handle.state(), "discarding stale connection");
            slot.handle = None;
        }

        // An attempt finished while we queued for the slot.
        if self.attempts.load(Ordering::Acquire) != joined
            && let Some(error) = slot.last_failure.clone()
        {
            debug!(peer = %self.host_port, error = %error, "sharing failed connect attempt");
            return Err(error);
        }

        let result = self.connect().await;
        match &result {
            Ok(handle) => {
                slot.handle = Some(handle.clone());
                slot.last_failure = None;
            },
            Err(e) => {
                warn!(peer = %self.host_port, error = %e, "connect failed");
                self.with_heap(|heap, key| heap.record_connection_failure(key));
                slot.last_failure = Some(e.clone());
            },
        }
        self.attempts.fetch_add(1, Ordering::AcqRel);
        result
    }

    /// A call was bound to this peer.
    pub fn record_call_start(&self) {
        self.with_heap(|heap, key| heap.record_start(key));
    }

    /// A call bound to this peer ended.
    pub fn record_call_end(&self, outcome: CallOutcome) {
        self.with_heap(|heap, key| heap.record_end(key, outcome));
    }

    /// The driver reported an involuntary close.
    ///
    /// Drops the cached handle so the next [`Self::get_connection`]
    /// reconnects. If a connect is in progress the stale handle is discarded
    /// there instead.
    pub fn mark_connection_lost(&self, reason: &str) {
        warn!(peer = %self.host_port, reason, "connection lost");
        if let Ok(mut slot) = self.slot.try_lock()
            && slot.handle.as_ref().is_some_and(|handle| !handle.is_usable())
        {
            slot.handle = None;
        }
    }

    /// Close the current connection, if any, and wait for it to finish.
    pub async fn close(&self) {
        let handle = self.slot.lock().await.handle.take();
        if let Some(handle) = handle {
            handle.close();
            handle.closed().await;
        }
    }

    async fn connect(self: &Arc<Self>) -> Result<ConnectionHandle, CallError> {
        let timeout = self.context.peer.connect_timeout;
        debug!(peer = %self.host_port, "connecting");

        let stream = tokio::select! {
            stream = self.context.transport.connect(&self.host_port) => {
                stream.map_err(|e| CallError::ConnectFailed(e.to_string()))?
            },
            () = self.context.env.sleep(timeout) => {
                return Err(CallError::ConnectFailed(format!("timed out after {timeout:?}")));
            },
        };

        let peer = Arc::downgrade(self);
        let mut builder = ConnectionBuilder::new(self.context.connection.clone(), self.context.env.clone())
            .on_lost(move |reason| {
                if let Some(peer) = peer.upgrade() {
                    peer.mark_connection_lost(&reason);
                }
            });
        if let Some(sink) = &self.context.sink {
            builder = builder.sink(Arc::clone(sink));
        }

        let handle = builder.spawn(stream, Role::Initiator);
        match handle.established().await {
            Ok(remote) => {
                info!(peer = %self.host_port, process = %remote.process_name, "connected");
                Ok(handle)
            },
            Err(e) => {
                handle.close();
                Err(e)
            },
        }
    }

    fn with_heap(&self, f: impl FnOnce(&mut PeerHeap<String>, &String)) {
        if let Some(heap) = self.heap.upgrade() {
            f(&mut heap.lock(), &self.host_port);
        }
    }
}
