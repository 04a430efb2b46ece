//! Channel end-to-end tests over in-memory streams and loopback TCP.

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use muxwire_channel::{Channel, ChannelConfig, HandlerError, SystemEnv, handler_fn};
use muxwire_core::{BoxedStream, CallError, InboundCall, OutboundResponse, Transport};
use muxwire_proto::{ErrorCode, ResponseCode};
use parking_lot::Mutex;

/// Routes `connect(host_port)` to the channel registered under that address.
#[derive(Default)]
struct MemoryNetwork {
    servers: Mutex<HashMap<String, Channel>>,
    connects: AtomicUsize,
}

impl MemoryNetwork {
    fn register(&self, host_port: &str, channel: Channel) {
        self.servers.lock().insert(host_port.to_string(), channel);
    }

    fn unplug(&self, host_port: &str) {
        self.servers.lock().remove(host_port);
    }
}

struct MemoryTransport(Arc<MemoryNetwork>);

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, host_port: &str) -> io::Result<BoxedStream> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        let server = self.0.servers.lock().get(host_port).cloned();
        let Some(server) = server else {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, host_port.to_string()));
        };
        let (client, accepted) = tokio::io::duplex(256 * 1024);
        server.accept(Box::new(accepted));
        Ok(Box::new(client))
    }
}

fn server(network: &MemoryNetwork, host_port: &str) -> Channel {
    let channel = Channel::new(ChannelConfig::new("kv-server", host_port));
    let name = host_port.to_string();
    channel.register_handler(
        "kv",
        "whoami",
        handler_fn(move |_call: InboundCall| {
            let name = name.clone();
            async move { Ok(OutboundResponse::ok("", name)) }
        }),
    );
    channel.register_handler(
        "kv",
        "echo",
        handler_fn(|call: InboundCall| async move { Ok(OutboundResponse::ok(call.arg2().clone(), call.arg3().clone())) }),
    );
    channel.register_handler(
        "kv",
        "fail",
        handler_fn(|_call: InboundCall| async move {
            Err::<OutboundResponse, _>(HandlerError::new(ErrorCode::Busy, "try later"))
        }),
    );
    channel.register_handler(
        "kv",
        "app-error",
        handler_fn(|_call: InboundCall| async move { Ok(OutboundResponse::application_error("", "no such key")) }),
    );
    network.register(host_port, channel.clone());
    channel
}

fn client(network: &Arc<MemoryNetwork>) -> Channel {
    Channel::with_env(
        ChannelConfig::new("kv-client", "client:1"),
        SystemEnv,
        Arc::new(MemoryTransport(Arc::clone(network))),
    )
}

async fn whoami(client: &Channel) -> Result<String, CallError> {
    let response = client.open_call("kv", "whoami", Vec::new(), "", "", Duration::from_secs(1)).await?;
    Ok(String::from_utf8_lossy(response.arg3()).into_owned())
}

#[tokio::test]
async fn open_call_round_trip() {
    let network = Arc::new(MemoryNetwork::default());
    let _server = server(&network, "a:1");
    let client = client(&network);
    client.add_peer("kv", "a:1");

    let response = client
        .open_call("kv", "echo", vec![("as".into(), "raw".into())], "headers", "body", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(response.code, ResponseCode::Ok);
    assert_eq!(response.arg2().as_ref(), b"headers");
    assert_eq!(response.arg3().as_ref(), b"body");
}

#[tokio::test]
async fn connection_reused_across_calls() {
    let network = Arc::new(MemoryNetwork::default());
    let _server = server(&network, "a:1");
    let client = client(&network);
    client.add_peer("kv", "a:1");

    for _ in 0..5 {
        assert_eq!(whoami(&client).await.unwrap(), "a:1");
    }
    assert_eq!(network.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_first_calls_share_one_connect() {
    let network = Arc::new(MemoryNetwork::default());
    let _server = server(&network, "a:1");
    let client = client(&network);
    client.add_peer("kv", "a:1");

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { whoami(&client).await })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), "a:1");
    }
    assert_eq!(network.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn calls_rotate_across_equal_peers() {
    let network = Arc::new(MemoryNetwork::default());
    let _a = server(&network, "a:1");
    let _b = server(&network, "b:1");
    let client = client(&network);
    client.add_peer("kv", "a:1");
    client.add_peer("kv", "b:1");

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(whoami(&client).await.unwrap());
    }
    assert_eq!(seen, vec!["a:1", "b:1", "a:1", "b:1"]);
}

#[tokio::test]
async fn unreachable_peer_is_demoted() {
    let network = Arc::new(MemoryNetwork::default());
    let _b = server(&network, "b:1");
    let client = client(&network);
    let dead = client.add_peer("kv", "a:1");
    client.add_peer("kv", "b:1");

    let first = whoami(&client).await;
    assert!(matches!(first, Err(CallError::ConnectFailed(_))));
    assert_eq!(dead.score().map(|s| (s.outstanding, s.consecutive_failures)), Some((0, 1)));

    for _ in 0..3 {
        assert_eq!(whoami(&client).await.unwrap(), "b:1");
    }
}

#[tokio::test]
async fn reconnects_after_remote_closes() {
    let network = Arc::new(MemoryNetwork::default());
    let server_a = server(&network, "a:1");
    let client = client(&network);
    client.add_peer("kv", "a:1");

    assert_eq!(whoami(&client).await.unwrap(), "a:1");
    server_a.close().await;

    let replacement = server(&network, "a:1");
    // The old connection may still be observed closing on the first try.
    let mut result = whoami(&client).await;
    if result.is_err() {
        result = whoami(&client).await;
    }
    assert_eq!(result.unwrap(), "a:1");
    assert_eq!(network.connects.load(Ordering::SeqCst), 2);
    replacement.close().await;
}

#[tokio::test]
async fn errors_surface_with_codes() {
    let network = Arc::new(MemoryNetwork::default());
    let _server = server(&network, "a:1");
    let client = client(&network);
    client.add_peer("kv", "a:1");

    let err = client.open_call("kv", "fail", Vec::new(), "", "", Duration::from_secs(1)).await.unwrap_err();
    assert_eq!(err, CallError::Remote { code: ErrorCode::Busy, message: "try later".into() });

    let err = client.open_call("kv", "missing", Vec::new(), "", "", Duration::from_secs(1)).await.unwrap_err();
    assert_eq!(
        err,
        CallError::Remote { code: ErrorCode::BadRequest, message: "Endpoint 'missing' is not defined".into() }
    );

    let response = client.open_call("kv", "app-error", Vec::new(), "", "", Duration::from_secs(1)).await.unwrap();
    assert_eq!(response.code, ResponseCode::Error);
}

#[tokio::test]
async fn unknown_service_has_no_peers() {
    let network = Arc::new(MemoryNetwork::default());
    let client = client(&network);
    let err = client.open_call("nobody", "x", Vec::new(), "", "", Duration::from_secs(1)).await.unwrap_err();
    assert_eq!(err, CallError::NoPeersAvailable("nobody".into()));
}

#[tokio::test]
async fn closed_channel_rejects_calls() {
    let network = Arc::new(MemoryNetwork::default());
    let _server = server(&network, "a:1");
    let client = client(&network);
    client.add_peer("kv", "a:1");
    assert!(whoami(&client).await.is_ok());

    client.close().await;
    client.close().await;
    assert_eq!(whoami(&client).await.unwrap_err(), CallError::ConnectionClosed);
}

#[tokio::test]
async fn removed_peer_stops_receiving_calls() {
    let network = Arc::new(MemoryNetwork::default());
    let _a = server(&network, "a:1");
    let _b = server(&network, "b:1");
    let client = client(&network);
    client.add_peer("kv", "a:1");
    client.add_peer("kv", "b:1");

    assert!(client.remove_peer("kv", "a:1").is_some());
    network.unplug("a:1");
    for _ in 0..3 {
        assert_eq!(whoami(&client).await.unwrap(), "b:1");
    }
}

#[tokio::test]
async fn tcp_loopback_round_trip() {
    let server = Channel::new(ChannelConfig::new("kv-server", "127.0.0.1:0"));
    server.register_handler(
        "kv",
        "echo",
        handler_fn(|call: InboundCall| async move { Ok(OutboundResponse::ok("", call.arg3().clone())) }),
    );
    let addr = server.listen("127.0.0.1:0").await.unwrap();

    let client = Channel::new(ChannelConfig::new("kv-client", "127.0.0.1:0"));
    client.add_peer("kv", addr.clone());
    let body = vec![b'x'; 100_000];
    let response = client
        .open_call("kv", "echo", Vec::new(), "", body.clone(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(response.arg3().as_ref(), body.as_slice());

    client.close().await;
    server.close().await;
}
