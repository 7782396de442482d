//! Resettable wall-clock gate for read/write deadlines.

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct State {
    /// None means "never fires".
    at: Option<Instant>,
    /// Cancellation fires the gate immediately and latches.
    cancelled: bool,
    /// Bumped on every `set`/`cancel` so in-flight waiters pick up the
    /// change instead of firing on a stale instant.
    epoch: u64,
}

/// A cancellable, resettable time gate.
///
/// `wait()` resolves once the configured instant passes (a deadline already
/// in the past resolves immediately) or `cancel()` latches the gate. An
/// unarmed gate never resolves. Re-arming with [`Deadline::set`] invalidates
/// pending waiters, which immediately observe the new instant.
#[derive(Default)]
pub struct Deadline {
    state: Mutex<State>,
    notify: Notify,
}

impl Deadline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the gate at `at`, or disarm it with `None`.
    pub fn set(&self, at: Option<std::time::Instant>) {
        let mut state = self.state.lock();
        state.at = at.map(Instant::from_std);
        state.epoch += 1;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Fire the gate now and forever after.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        state.epoch += 1;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Resolve when the gate fires.
    pub async fn wait(&self) {
        loop {
            // Register for change notifications before reading the state so
            // a concurrent `set`/`cancel` cannot slip between the two.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (at, cancelled, epoch) = {
                let state = self.state.lock();
                (state.at, state.cancelled, state.epoch)
            };
            if cancelled {
                return;
            }

            match at {
                None => notified.await,
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {
                            let state = self.state.lock();
                            if state.cancelled || state.epoch == epoch {
                                return;
                            }
                            // Re-armed while sleeping; go around.
                        }
                        _ = &mut notified => {}
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Deadline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Deadline")
            .field("at", &state.at)
            .field("cancelled", &state.cancelled)
            .finish()
    }
}
