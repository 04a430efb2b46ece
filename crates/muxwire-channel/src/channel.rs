//! The channel: entry point for making and serving calls.
//!
//! A [`Channel`] is an explicitly constructed context object. It owns the
//! configuration, the transport, the handler registry and one
//! [`PeerSelector`] per service. Cloning is cheap and every clone refers to
//! the same channel.
//!
//! # Outbound call flow
//!
//! 1. The service's selector picks a peer and records the call start
//! 2. The peer returns its established connection, dialling if needed
//! 3. The connection driver fragments, sends and awaits the response
//! 4. The outcome updates the peer's score

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use muxwire_core::{
    BoxedStream, CallError, CallOutcome, CallResponse, Environment, Listener, OutboundCall, Role,
    Transport,
};
use muxwire_proto::{Headers, TraceContext};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    config::ChannelConfig,
    connection::{ConnectionBuilder, ConnectionHandle},
    env::SystemEnv,
    handler::{CallSink, Handler, HandlerRegistry},
    peer::{Peer, PeerContext},
    selector::PeerSelector,
    tcp::{TcpAcceptor, TcpTransport},
};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Makes calls to, and serves calls from, other processes.
pub struct Channel<E: Environment = SystemEnv> {
    inner: Arc<Inner<E>>,
}

impl<E: Environment> Clone for Channel<E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct Inner<E> {
    config: ChannelConfig,
    context: Arc<PeerContext<E>>,
    registry: Arc<HandlerRegistry>,
    selectors: Mutex<HashMap<String, Arc<PeerSelector<E>>>>,
    accepted: Mutex<HashMap<u64, ConnectionHandle>>,
    next_accepted: AtomicU64,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Channel<SystemEnv> {
    /// Channel using tokio time and TCP.
    pub fn new(config: ChannelConfig) -> Self {
        Self::with_env(config, SystemEnv, Arc::new(TcpTransport))
    }
}

impl<E: Environment> Channel<E> {
    /// Channel using `env` for time and randomness and `transport` to dial
    /// peers.
    pub fn with_env(config: ChannelConfig, env: E, transport: Arc<dyn Transport>) -> Self {
        let registry = Arc::new(HandlerRegistry::new());
        let sink: Arc<dyn CallSink> = registry.clone();
        let context = Arc::new(PeerContext {
            transport,
            env,
            connection: config.connection_config(),
            peer: config.peer.clone(),
            sink: Some(sink),
        });
        Self {
            inner: Arc::new(Inner {
                config,
                context,
                registry,
                selectors: Mutex::new(HashMap::new()),
                accepted: Mutex::new(HashMap::new()),
                next_accepted: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Channel configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Whether [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Selector for `service`, created empty on first use.
    pub fn peers(&self, service: &str) -> Arc<PeerSelector<E>> {
        let mut selectors = self.inner.selectors.lock();
        let selector = selectors.entry(service.to_string()).or_insert_with(|| {
            Arc::new(PeerSelector::new(service.to_string(), Arc::clone(&self.inner.context)))
        });
        Arc::clone(selector)
    }

    /// Add `host_port` to the peers of `service`.
    pub fn add_peer(&self, service: &str, host_port: impl Into<String>) -> Arc<Peer<E>> {
        self.peers(service).add(host_port)
    }

    /// Remove `host_port` from the peers of `service`.
    pub fn remove_peer(&self, service: &str, host_port: &str) -> Option<Arc<Peer<E>>> {
        self.peers(service).remove(host_port)
    }

    /// Serve `method` of `service` on every connection of this channel.
    pub fn register_handler(&self, service: impl Into<String>, method: impl Into<String>, handler: impl Handler) {
        self.inner.registry.register(service, method, handler);
    }

    /// Call `method` on some peer of `service`.
    ///
    /// # Errors
    ///
    /// Any [`CallError`]. Nothing is retried.
    pub async fn open_call(
        &self,
        service: &str,
        method: impl Into<Bytes>,
        headers: Headers,
        arg2: impl Into<Bytes>,
        arg3: impl Into<Bytes>,
        ttl: Duration,
    ) -> Result<CallResponse, CallError> {
        let call = OutboundCall::new(service, method, arg2, arg3, ttl).with_headers(headers);
        self.call(call).await
    }

    /// Send a fully specified call to some peer of its service.
    ///
    /// A call without a tracing context gets fresh trace and span ids. A zero
    /// ttl is replaced by [`ChannelConfig::default_ttl`].
    ///
    /// # Errors
    ///
    /// Any [`CallError`]. Nothing is retried.
    pub async fn call(&self, mut call: OutboundCall) -> Result<CallResponse, CallError> {
        if self.is_closed() {
            return Err(CallError::ConnectionClosed);
        }
        if call.tracing == TraceContext::default() {
            call.tracing = self.new_trace();
        }
        if call.ttl.is_zero() {
            call.ttl = self.inner.config.default_ttl;
        }

        let selector = self.inner.selectors.lock().get(&call.service).cloned();
        let selector = selector.ok_or_else(|| CallError::NoPeersAvailable(call.service.clone()))?;
        let peer = selector.acquire()?;
        let in_flight = InFlight { peer: Arc::clone(&peer), finished: false };

        let connection = match peer.get_connection().await {
            Ok(connection) => connection,
            Err(e) => {
                in_flight.finish(CallOutcome::Abandoned);
                return Err(e);
            },
        };

        let result = connection.call(call).await;
        in_flight.finish(match &result {
            Ok(_) => CallOutcome::Success,
            Err(e) => e.outcome(),
        });
        result
    }

    /// Run the responder side of an accepted stream.
    pub fn accept(&self, stream: BoxedStream) -> ConnectionHandle {
        let sink: Arc<dyn CallSink> = self.inner.registry.clone();
        let handle = ConnectionBuilder::new(self.inner.context.connection.clone(), self.inner.context.env.clone())
            .sink(sink)
            .spawn(stream, Role::Responder);

        if self.is_closed() {
            handle.close();
            return handle;
        }

        let key = self.inner.next_accepted.fetch_add(1, Ordering::Relaxed);
        self.inner.accepted.lock().insert(key, handle.clone());

        // Forget the handle once its driver has released the socket.
        let weak = Arc::downgrade(&self.inner);
        let watched = handle.clone();
        tokio::spawn(async move {
            watched.closed().await;
            if let Some(inner) = weak.upgrade() {
                inner.accepted.lock().remove(&key);
            }
        });
        handle
    }

    /// Accepted connections whose drivers are still running.
    pub fn accepted_count(&self) -> usize {
        self.inner.accepted.lock().len()
    }

    /// Accept streams from `listener` until the channel closes.
    pub fn serve(&self, listener: impl Listener) {
        let weak = Arc::downgrade(&self.inner);
        let env = self.inner.context.env.clone();
        let task = tokio::spawn(async move {
            loop {
                let accepted = listener.accept().await;
                let Some(channel) = upgrade(&weak) else { break };
                match accepted {
                    Ok((stream, remote)) => {
                        debug!(%remote, "accepted connection");
                        channel.accept(stream);
                    },
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        drop(channel);
                        env.sleep(ACCEPT_BACKOFF).await;
                    },
                }
            }
        });
        self.inner.listeners.lock().push(task);
    }

    /// Bind a TCP listener on `addr` and serve it.
    ///
    /// Returns the bound address, useful when `addr` asks for port 0.
    ///
    /// # Errors
    ///
    /// Bind failures.
    pub async fn listen(&self, addr: &str) -> io::Result<String> {
        let acceptor = TcpAcceptor::bind(addr).await?;
        let local = acceptor.local_addr()?;
        info!(%local, "listening");
        self.serve(acceptor);
        Ok(local)
    }

    /// Stop listening and close every connection.
    ///
    /// Outstanding calls fail with `ConnectionClosed`. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing channel");

        for task in self.inner.listeners.lock().drain(..) {
            task.abort();
        }
        let accepted: Vec<_> = self.inner.accepted.lock().drain().map(|(_, handle)| handle).collect();
        let selectors: Vec<_> = self.inner.selectors.lock().values().cloned().collect();

        for handle in &accepted {
            handle.close();
        }
        for selector in selectors {
            selector.close().await;
        }
        for handle in accepted {
            handle.closed().await;
        }
    }

    fn new_trace(&self) -> TraceContext {
        let env = &self.inner.context.env;
        TraceContext { trace_id: env.random_u64(), span_id: env.random_u64(), parent_id: 0, flags: 0 }
    }
}

fn upgrade<E: Environment>(weak: &Weak<Inner<E>>) -> Option<Channel<E>> {
    weak.upgrade().map(|inner| Channel { inner })
}

/// Keeps a peer's outstanding count honest if the call future is dropped.
struct InFlight<E: Environment> {
    peer: Arc<Peer<E>>,
    finished: bool,
}

impl<E: Environment> InFlight<E> {
    fn finish(mut self, outcome: CallOutcome) {
        self.finished = true;
        self.peer.record_call_end(outcome);
    }
}

impl<E: Environment> Drop for InFlight<E> {
    fn drop(&mut self) {
        if !self.finished {
            self.peer.record_call_end(CallOutcome::Abandoned);
        }
    }
}
