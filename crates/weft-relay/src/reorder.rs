//! Per-flow reorder buffering at an input stage.

use std::collections::{BTreeMap, HashMap};

use weft_proto::Frame;

use crate::{error::RelayError, flow::FlowKey};

/// Per-flow reorder state.
#[derive(Debug, Default)]
struct FlowState {
    /// Next sequence number to deliver.
    expected: u64,
    /// Out-of-order frames held back, keyed by seq.
    buffered: BTreeMap<u64, Frame>,
}

/// Buffers frames arriving out of order and releases them in sequence.
///
/// One instance per input side, owned exclusively by whatever drains
/// that side (a reader task, a forwarding pump). Each flow starts
/// expecting seq 0 and is delivered strictly in order with no gaps;
/// duplicates and overflows are protocol errors that the owner treats
/// as a dead connection.
///
/// Non-flow frames bypass the buffer entirely.
#[derive(Debug)]
pub struct ReorderBuffer {
    /// Most frames held back per flow before overflow.
    max_buffered: usize,
    flows: HashMap<FlowKey, FlowState>,
}

impl ReorderBuffer {
    /// Create a buffer holding at most `max_buffered` out-of-order frames
    /// per flow.
    #[must_use]
    pub fn new(max_buffered: usize) -> Self {
        Self { max_buffered, flows: HashMap::new() }
    }

    /// Accept one frame and return every frame now ready, in order.
    ///
    /// - In-sequence frames are delivered immediately, followed by any
    ///   buffered successors they unblock.
    /// - Ahead-of-sequence frames are held back; the result is empty.
    /// - Non-flow frames are returned untouched.
    ///
    /// # Errors
    ///
    /// - [`RelayError::StaleFrame`] when the seq was already delivered or
    ///   is already buffered
    /// - [`RelayError::ReorderOverflow`] when the flow's buffer is full
    pub fn accept(&mut self, frame: Frame) -> Result<Vec<Frame>, RelayError> {
        let Some(key) = FlowKey::of(&frame) else {
            return Ok(vec![frame]);
        };

        let state = self.flows.entry(key).or_default();

        if frame.seq == state.expected {
            state.expected += 1;
            let mut ready = vec![frame];
            while let Some(next) = state.buffered.remove(&state.expected) {
                state.expected += 1;
                ready.push(next);
            }
            return Ok(ready);
        }

        if frame.seq > state.expected {
            if state.buffered.contains_key(&frame.seq) {
                return Err(RelayError::StaleFrame {
                    flow: key,
                    seq: frame.seq,
                    expected: state.expected,
                });
            }
            if state.buffered.len() >= self.max_buffered {
                return Err(RelayError::ReorderOverflow {
                    flow: key,
                    buffered: state.buffered.len(),
                    expected: state.expected,
                    seq: frame.seq,
                });
            }
            state.buffered.insert(frame.seq, frame);
            return Ok(Vec::new());
        }

        Err(RelayError::StaleFrame { flow: key, seq: frame.seq, expected: state.expected })
    }

    /// Drop a flow's state after its terminal frame has been delivered.
    ///
    /// Returns whether the flow was tracked.
    pub fn cleanup(&mut self, key: &FlowKey) -> bool {
        self.flows.remove(key).is_some()
    }

    /// Number of flows currently holding state.
    #[must_use]
    pub fn tracked_flows(&self) -> usize {
        self.flows.len()
    }
}
