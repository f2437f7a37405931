use std::sync::Mutex;

/// Bookkeeping for the single pending wake-up a session actor may hold.
///
/// `propose` implements earlier-wins scheduling: a new deadline only becomes
/// active when no alarm is set or the new deadline is sooner. Each accepted
/// proposal bumps a generation counter; the sleeper that owns an outdated
/// generation finds `claim` failing when it wakes and simply exits, so a
/// replaced alarm can never fire.
#[derive(Default)]
pub struct AlarmSlot {
    state: Mutex<AlarmState>,
}

#[derive(Default)]
struct AlarmState {
    deadline_ms: Option<i64>,
    generation: u64,
}

impl AlarmSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to make `at_ms` the active deadline. Returns the generation to
    /// sleep on, or `None` when an earlier alarm is already pending.
    pub fn propose(&self, at_ms: i64) -> Option<u64> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.deadline_ms {
            Some(current) if current <= at_ms => None,
            _ => {
                state.deadline_ms = Some(at_ms);
                state.generation += 1;
                Some(state.generation)
            }
        }
    }

    /// Called by a woken sleeper. Succeeds only when its generation is still
    /// the active one; success clears the slot so the handler can schedule
    /// follow-ups.
    pub fn claim(&self, generation: u64) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.generation == generation {
            state.deadline_ms = None;
            true
        } else {
            false
        }
    }

    pub fn current_deadline(&self) -> Option<i64> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .deadline_ms
    }
}
