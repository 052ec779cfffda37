use rustc_hash::FxHashMap;
use tracing::warn;

use crate::envelope::{Payload, StepPair};

/// Payloads that were received but not claimed yet, keyed by their step pair. Claiming is
///  destructive: an entry can be taken exactly once.
///
/// There is no eviction. Entries are expected to be few and short-lived, so growing past
///  [MessageBuffer::SIZE_WARNING_THRESHOLD] is logged as a likely sign of a consumer asking for the
///  wrong step ids.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    entries: FxHashMap<StepPair, Payload>,
}

impl MessageBuffer {
    pub const SIZE_WARNING_THRESHOLD: usize = 1024;

    /// Stores a payload, replacing (and logging) any unclaimed payload for the same pair.
    pub fn put(&mut self, pair: StepPair, payload: Payload) {
        if self.entries.insert(pair.clone(), payload).is_some() {
            warn!("duplicate message for {:?} - replacing the unclaimed one", pair);
        }

        if self.entries.len() == Self::SIZE_WARNING_THRESHOLD {
            warn!("{} unclaimed messages are buffered - consumers may be waiting for the wrong step ids", self.entries.len());
        }
    }

    pub fn take_if_present(&mut self, pair: &StepPair) -> Option<Payload> {
        self.entries.remove(pair)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
