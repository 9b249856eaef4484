//! Generators: functions suspended across yields.
//!
//! Calling a function whose code carries the generator flag does not run
//! the body; it wraps a bound, unstarted frame in a `Generator`. Each
//! iteration resumes the frame until the next `YIELD_VALUE` or until the
//! body returns. On resume the value sent back is None (there is no send
//! API).

use crate::{frame::Frame, pool::PoolId};

/// Generator execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GenState {
    /// Created but never iterated; the frame has not run yet.
    New,
    /// Currently executing; guards against reentrant iteration.
    Running,
    /// Suspended at a yield.
    Suspended,
    /// Returned or raised; further iteration signals end.
    Finished,
}

#[derive(Debug)]
pub(crate) struct Generator {
    /// The suspended execution frame. Taken out while running, absent
    /// once finished or cleared.
    pub frame: Option<Frame>,
    pub state: GenState,
    /// Name of the generator function, for diagnostics.
    pub name: String,
}

impl Generator {
    pub fn new(frame: Frame, name: String) -> Self {
        Self {
            frame: Some(frame),
            state: GenState::New,
            name,
        }
    }

    pub fn collect_refs(&self, out: &mut Vec<PoolId>) {
        if let Some(frame) = &self.frame {
            frame.collect_refs(out);
        }
    }

    pub fn clear_refs(&mut self, dec: &mut Vec<PoolId>) {
        if let Some(mut frame) = self.frame.take() {
            frame.drop_refs(dec);
        }
        self.state = GenState::Finished;
    }
}
