//! Shared plumbing for the protocol state machines.
//!
//! Each machine is a value: `handle` takes the current state plus one
//! inbound event (a message or a timeout) and returns the messages to
//! send, never suspending. The surrounding scheduler owns deadlines and
//! delivery, which keeps the machines runnable against a deterministic
//! simulator in tests.

use crate::messages::ConsensusMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Actor,
    Participant,
}

/// One inbound event. Every receive is a suspension point of the
/// enclosing protocol run; cancellation from outside is delivered as a
/// synthetic `Timeout`.
#[derive(Debug, Clone)]
pub enum Input {
    Message {
        from: String,
        message: ConsensusMessage,
    },
    Timeout,
}

/// A message the machine wants delivered. Sends are atomic and
/// non-suspending from the machine's point of view.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub to: String,
    pub message: ConsensusMessage,
}

pub(crate) fn multicast(
    recipients: impl IntoIterator<Item = String>,
    message: ConsensusMessage,
) -> Vec<Outbound> {
    recipients
        .into_iter()
        .map(|to| Outbound {
            to,
            message: message.clone(),
        })
        .collect()
}

/// Driver-facing surface shared by all four machines.
pub trait ProtocolMachine: Send {
    fn handle(&mut self, input: Input) -> Vec<Outbound>;

    /// Terminal means done, aborted or timed out; the instance is
    /// destroyed afterwards.
    fn is_terminal(&self) -> bool;

    /// Current phase label, used for tracing and for resetting the
    /// receive deadline between stages.
    fn phase(&self) -> &'static str;
}
