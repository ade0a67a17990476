use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// How far a call attempt got before it ended.
///
/// `Connecting` means the request never reached the agent, so it cannot have
/// had a remote side effect. `InFlight` means the agent may have acted on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CallStage {
    Connecting,
    InFlight,
}

impl fmt::Display for CallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallStage::Connecting => f.write_str("connecting"),
            CallStage::InFlight => f.write_str("in flight"),
        }
    }
}

const CONNECTING: u8 = 0;
const IN_FLIGHT: u8 = 1;
const WITHDRAWN: u8 = 2;

/// Shared, race-free record of one attempt's stage.
///
/// A transport calls [`hand_off`](Self::hand_off) right before the request
/// leaves the client; the invoker calls [`withdraw`](Self::withdraw) when it
/// wants to give up on a request that has not left yet. Exactly one of the
/// two wins.
#[derive(Debug, Clone, Default)]
pub struct StageTracker(Arc<AtomicU8>);

impl StageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> CallStage {
        match self.0.load(Ordering::Acquire) {
            IN_FLIGHT => CallStage::InFlight,
            _ => CallStage::Connecting,
        }
    }

    /// Mark the request as handed to the agent. Returns false if it was
    /// withdrawn first, in which case it must not be sent.
    pub fn hand_off(&self) -> bool {
        match self
            .0
            .compare_exchange(CONNECTING, IN_FLIGHT, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == IN_FLIGHT,
        }
    }

    /// Stop the request from ever being handed off. Returns false if it is
    /// already in flight.
    pub fn withdraw(&self) -> bool {
        match self
            .0
            .compare_exchange(CONNECTING, WITHDRAWN, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == WITHDRAWN,
        }
    }

    pub fn is_withdrawn(&self) -> bool {
        self.0.load(Ordering::Acquire) == WITHDRAWN
    }
}
