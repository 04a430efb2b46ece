//! Peer selection over the simulated network.
//!
//! Several servers offer one service; the client's selector spreads calls
//! across them and steers away from a server that stops answering.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use muxwire_channel::{Channel, ChannelConfig, handler_fn};
use muxwire_core::{CallError, InboundCall, OutboundResponse};
use muxwire_harness::{SimEnv, SimListener, SimTransport};

const PORT: u16 = 4040;

async fn serve(name: &'static str) -> turmoil::Result {
    let channel = Channel::with_env(
        ChannelConfig::new(name, format!("{name}:{PORT}")),
        SimEnv::with_seed(1),
        Arc::new(SimTransport),
    );
    channel.register_handler(
        "kv",
        "whoami",
        handler_fn(move |_call: InboundCall| async move { Ok(OutboundResponse::ok("", name)) }),
    );
    channel.serve(SimListener::bind(&format!("0.0.0.0:{PORT}")).await?);
    std::future::pending::<()>().await;
    Ok(())
}

fn client(servers: &[&str]) -> Channel<SimEnv> {
    let channel = Channel::with_env(
        ChannelConfig::new("kv-client", "client:1").with_connect_timeout(Duration::from_millis(500)),
        SimEnv::with_seed(2),
        Arc::new(SimTransport),
    );
    for server in servers {
        channel.add_peer("kv", format!("{server}:{PORT}"));
    }
    channel
}

async fn whoami(client: &Channel<SimEnv>) -> Result<String, CallError> {
    let response = client.open_call("kv", "whoami", Vec::new(), "", "", Duration::from_millis(300)).await?;
    Ok(String::from_utf8_lossy(response.arg3()).into_owned())
}

#[test]
fn sequential_calls_spread_evenly() -> turmoil::Result {
    let mut sim = turmoil::Builder::new().simulation_duration(Duration::from_secs(30)).build();

    for name in ["a", "b", "c"] {
        sim.host(name, move || serve(name));
    }

    sim.client("client", async {
        let client = client(&["a", "b", "c"]);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..9 {
            *counts.entry(whoami(&client).await?).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 3, "every server should be used: {counts:?}");
        assert!(counts.values().all(|&n| n == 3), "uneven spread: {counts:?}");

        for peer in client.peers("kv").peers() {
            let score = peer.score().ok_or("peer should be scored")?;
            assert_eq!((score.outstanding, score.consecutive_failures), (0, 0));
        }
        Ok(())
    });

    sim.run()
}

#[test]
fn crashed_server_is_avoided() -> turmoil::Result {
    let mut sim = turmoil::Builder::new().simulation_duration(Duration::from_secs(60)).build();
    let crash = Arc::new(AtomicBool::new(false));

    for name in ["a", "b"] {
        sim.host(name, move || serve(name));
    }

    let signal = Arc::clone(&crash);
    sim.client("client", async move {
        let client = client(&["a", "b"]);
        assert_eq!(whoami(&client).await?, "a");
        assert_eq!(whoami(&client).await?, "b");

        signal.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut results = Vec::new();
        for _ in 0..6 {
            results.push(whoami(&client).await);
        }
        // The first call after the crash goes to the dead server and fails;
        // from then on the healthy server wins every choice.
        assert!(results[0].is_err(), "first call should hit the crashed server: {results:?}");
        for result in &results[1..] {
            assert_eq!(result.as_deref(), Ok("b"), "results: {results:?}");
        }

        let dead = client.peers("kv").get(&format!("a:{PORT}")).ok_or("peer missing")?;
        assert!(dead.score().is_some_and(|s| s.consecutive_failures >= 1));
        Ok(())
    });

    let mut crashed = false;
    while !sim.step()? {
        if !crashed && crash.load(Ordering::SeqCst) {
            sim.crash("a");
            crashed = true;
        }
    }
    Ok(())
}
