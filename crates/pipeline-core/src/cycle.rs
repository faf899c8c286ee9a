//! Seen-stage tracking for cycle detection.

use parking_lot::Mutex;

use crate::state_machine::StageId;

/// Free list of scratch buffers, shared process-wide so steady-state
/// processing allocates nothing per request.
static FREE_LIST: Mutex<Vec<SeenStages>> = Mutex::new(Vec::new());

/// The stages a single request has visited.
///
/// A plain list, not a set: stage counts are small, so the linear scan is
/// faster than hashing and the buffer is trivially reusable.
#[derive(Debug, Default)]
pub(crate) struct SeenStages(Vec<StageId>);

impl SeenStages {
    /// Takes a scratch buffer from the free list, or allocates one.
    pub(crate) fn acquire() -> Self {
        FREE_LIST.lock().pop().unwrap_or_default()
    }

    /// Returns the buffer to the free list.
    pub(crate) fn release(mut self) {
        self.0.clear();
        FREE_LIST.lock().push(self);
    }

    /// True when `stage` was already visited; otherwise records the visit.
    pub(crate) fn seen(&mut self, stage: StageId) -> bool {
        if self.0.contains(&stage) {
            return true;
        }
        self.0.push(stage);
        false
    }

    /// The visited stages as an arrow-joined trace for error messages.
    pub(crate) fn call_trace(&self) -> String {
        let mut out = String::new();
        for (i, stage) in self.0.iter().enumerate() {
            if i != 0 {
                out.push_str(" -> ");
            }
            out.push_str(stage.name());
        }
        out
    }
}
