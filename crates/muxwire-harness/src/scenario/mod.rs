//! Sans-IO scenario framework.
//!
//! A [`Scenario`] wires a client and a server connection state machine
//! together in a [`World`], runs scripted steps against virtual time, and
//! hands the result to a mandatory oracle.

mod builder;
mod world;

pub use builder::{RunnableScenario, Scenario, Step};
pub use world::{NetworkEvent, ResponderFn, World, echo_responder};

/// Verifies the final world state.
pub type OracleFn = Box<dyn Fn(&World) -> Result<(), String>>;

/// Reusable oracle building blocks.
pub mod oracle {
    use std::collections::HashMap;

    use muxwire_proto::MessageId;

    use super::{OracleFn, World};

    /// Every actor finished the handshake.
    pub fn all_established() -> OracleFn {
        Box::new(|world| {
            if world.all_established() {
                Ok(())
            } else {
                Err("not every actor is established".to_string())
            }
        })
    }

    /// Every call `actor` started completed exactly once.
    pub fn exactly_once(actor: impl Into<String>) -> OracleFn {
        let actor = actor.into();
        Box::new(move |world| check_exactly_once(world, &actor))
    }

    /// Run several oracles, failing on the first complaint.
    pub fn all(oracles: Vec<OracleFn>) -> OracleFn {
        Box::new(move |world| oracles.iter().try_for_each(|oracle| oracle(world)))
    }

    fn check_exactly_once(world: &World, actor: &str) -> Result<(), String> {
        let mut seen: HashMap<MessageId, usize> = HashMap::new();
        for (id, _) in world.completions(actor) {
            *seen.entry(*id).or_insert(0) += 1;
        }
        for id in world.started(actor) {
            match seen.remove(id) {
                Some(1) => {},
                Some(n) => return Err(format!("{actor}: call {id} completed {n} times")),
                None => return Err(format!("{actor}: call {id} never completed")),
            }
        }
        if let Some(id) = seen.keys().next() {
            return Err(format!("{actor}: completion for unknown call {id}"));
        }
        Ok(())
    }
}
