//! Flow identity and per-flow sequence assignment.

use std::{collections::HashMap, fmt};

use weft_proto::{Frame, MessageId};

/// Identity of a flow: the request id plus the optional routing id.
///
/// XID presence matters: `(A, None)` and `(A, Some(5))` are distinct
/// flows with independent sequence spaces. A flow is the unit of
/// ordering: sequence assignment on the way out, reorder buffering on
/// the way in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Request identifier.
    pub rid: MessageId,
    /// Routing identifier, when the frame carries one.
    pub xid: Option<MessageId>,
}

impl FlowKey {
    /// Derive the flow key of a frame.
    ///
    /// Returns `None` for non-flow frames (HELLO, HEARTBEAT,
    /// RELAY_NOTIFY, RELAY_STATE), which bypass sequencing entirely.
    #[must_use]
    pub fn of(frame: &Frame) -> Option<Self> {
        frame.is_flow().then(|| Self { rid: frame.id, xid: frame.routing_id })
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.xid {
            Some(xid) => write!(f, "{}/{}", self.rid, xid),
            None => write!(f, "{}/-", self.rid),
        }
    }
}

/// Assigns monotonically increasing per-flow sequence numbers at an
/// output stage.
///
/// This is a plain state machine; owners that share one output stage
/// across tasks wrap it in an async mutex (the switch does this per
/// master) so two frames produced concurrently on the same flow receive
/// consecutive values. Dropping a flow's counter is not required for
/// correctness, only for memory reclamation: the switch's outbound
/// stage calls [`SeqAssigner::cleanup`] on terminal frames, standalone
/// users decide for themselves.
#[derive(Debug, Default)]
pub struct SeqAssigner {
    counters: HashMap<FlowKey, u64>,
}

impl SeqAssigner {
    /// Create an assigner with no tracked flows.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp the frame with its flow's next sequence number.
    ///
    /// Non-flow frames pass through untouched (`seq` stays 0).
    pub fn assign(&mut self, frame: &mut Frame) {
        let Some(key) = FlowKey::of(frame) else {
            return;
        };

        let counter = self.counters.entry(key).or_insert(0);
        frame.seq = *counter;
        *counter += 1;
    }

    /// Drop a flow's counter. Returns whether the flow was tracked.
    pub fn cleanup(&mut self, key: &FlowKey) -> bool {
        self.counters.remove(key).is_some()
    }

    /// Number of flows currently holding a counter.
    #[must_use]
    pub fn tracked_flows(&self) -> usize {
        self.counters.len()
    }
}
