//! Scenario builder API.
//!
//! Provides a declarative API for constructing scenario tests that enforce
//! the Oracle Pattern.

use std::time::{Duration, Instant};

use muxwire_core::{Connection, ConnectionConfig, OutboundCall, Role};

use crate::scenario::{
    OracleFn, World,
    world::{ResponderFn, echo_responder},
};

/// One scripted operation, run in order after the handshake.
pub enum Step {
    /// Start a call from a client.
    Call {
        /// Calling actor.
        from: String,
        /// The call.
        call: OutboundCall,
    },
    /// Cancel the `nth` call (zero-based) started by `from`.
    Cancel {
        /// Calling actor.
        from: String,
        /// Index into the calls `from` started.
        nth: usize,
    },
    /// Send a ping.
    Ping {
        /// Pinging actor.
        from: String,
    },
    /// Move virtual time forward.
    Advance(Duration),
    /// Drop frames between two actors.
    Partition(String, String),
    /// Stop dropping frames between two actors.
    Heal(String, String),
    /// Close an actor's connection.
    Close(String),
}

/// Scenario builder.
///
/// Construct a scenario by adding a client, a server and the steps to run.
/// Must call `.oracle()` to get a [`RunnableScenario`].
pub struct Scenario {
    name: String,
    clients: Vec<(String, ConnectionConfig)>,
    servers: Vec<(String, ConnectionConfig, ResponderFn)>,
    steps: Vec<Step>,
}

impl Scenario {
    /// Create a new scenario with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), clients: Vec::new(), servers: Vec::new(), steps: Vec::new() }
    }

    /// Add a client actor with default configuration.
    #[must_use]
    pub fn client(self, name: impl Into<String>) -> Self {
        let name = name.into();
        let config = ConnectionConfig::default().with_identity(format!("{name}:1"), name.clone());
        self.client_with_config(name, config)
    }

    /// Add a client actor with custom configuration.
    #[must_use]
    pub fn client_with_config(mut self, name: impl Into<String>, config: ConnectionConfig) -> Self {
        self.clients.push((name.into(), config));
        self
    }

    /// Add a server actor that echoes every call.
    #[must_use]
    pub fn server(self, name: impl Into<String>) -> Self {
        self.server_with_responder(name, echo_responder())
    }

    /// Add a server actor answering calls with `responder`.
    #[must_use]
    pub fn server_with_responder(self, name: impl Into<String>, responder: ResponderFn) -> Self {
        let name = name.into();
        let config = ConnectionConfig::default().with_identity(format!("{name}:1"), name.clone());
        self.server_with_config(name, config, responder)
    }

    /// Add a server actor with custom configuration.
    #[must_use]
    pub fn server_with_config(
        mut self,
        name: impl Into<String>,
        config: ConnectionConfig,
        responder: ResponderFn,
    ) -> Self {
        self.servers.push((name.into(), config, responder));
        self
    }

    /// Append a step.
    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Start `call` from `from`.
    #[must_use]
    pub fn call(self, from: impl Into<String>, call: OutboundCall) -> Self {
        self.step(Step::Call { from: from.into(), call })
    }

    /// Advance virtual time.
    #[must_use]
    pub fn advance(self, by: Duration) -> Self {
        self.step(Step::Advance(by))
    }

    /// Set the oracle function and return a runnable scenario.
    ///
    /// The oracle is mandatory - you cannot run a scenario without
    /// verification.
    pub fn oracle(self, oracle: OracleFn) -> RunnableScenario {
        RunnableScenario { scenario: self, oracle }
    }
}

/// A scenario with an oracle function that can be executed.
pub struct RunnableScenario {
    scenario: Scenario,
    oracle: OracleFn,
}

impl RunnableScenario {
    /// Execute the scenario.
    ///
    /// Connects the client to the server, runs the handshake, executes every
    /// step in order and finally hands the world to the oracle.
    ///
    /// A call the connection refuses does not stop the run; it is recorded
    /// for the oracle to inspect.
    ///
    /// # Errors
    ///
    /// Setup failures, steps naming unknown actors and oracle verdicts.
    pub fn run(self) -> Result<(), String> {
        let Scenario { name, clients, servers, steps } = self.scenario;

        // Each actor owns exactly one connection, so only 1:1 topologies can
        // be modelled here. Multi-peer scenarios run over turmoil instead.
        if clients.len() != 1 || servers.len() != 1 {
            return Err(format!(
                "Scenario '{name}': only 1 client and 1 server are supported (got {} clients, {} servers)",
                clients.len(),
                servers.len()
            ));
        }

        let mut world = World::new(Instant::now());
        let mut pair = Vec::new();
        for (actor, config) in clients {
            world.add_actor(actor.clone(), Connection::new(config, Role::Initiator), None);
            pair.push(actor);
        }
        for (actor, config, responder) in servers {
            world.add_actor(actor.clone(), Connection::new(config, Role::Responder), Some(responder));
            pair.push(actor);
        }
        world.connect(&pair[0], &pair[1]).map_err(|e| format!("Scenario '{name}': {e}"))?;

        for step in steps {
            match step {
                Step::Call { from, call } => {
                    // Refusals are recorded by the world.
                    let _ = world.send_call(&from, call);
                },
                Step::Cancel { from, nth } => {
                    let id = world
                        .started(&from)
                        .get(nth)
                        .copied()
                        .ok_or_else(|| format!("Scenario '{name}': {from} has no call #{nth}"))?;
                    world.cancel(&from, id).map_err(|e| format!("Scenario '{name}': {e}"))?;
                },
                Step::Ping { from } => {
                    world.ping(&from).map_err(|e| format!("Scenario '{name}': ping from {from}: {e}"))?;
                },
                Step::Advance(by) => world.advance(by),
                Step::Partition(a, b) => world.partition(&a, &b),
                Step::Heal(a, b) => world.heal(&a, &b),
                Step::Close(actor) => world.close(&actor).map_err(|e| format!("Scenario '{name}': {e}"))?,
            }
            world.deliver_all();
        }

        (self.oracle)(&world).map_err(|e| format!("Scenario '{name}': {e}"))
    }
}
