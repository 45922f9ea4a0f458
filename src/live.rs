//! Push-updated views handed out by the store.
//!
//! A [`Live`] holds the present value from the moment it is created and is
//! updated by the store whenever the underlying read model changes. Dropping
//! it, or calling [`Live::cancel`], detaches it; the store prunes detached
//! views on its next write.

use tokio::sync::watch;

enum State<T> {
    Active(watch::Receiver<T>),
    Cancelled(T),
}

/// Cancellable subscription to a value maintained by the store.
pub struct Live<T> {
    state: State<T>,
}

impl<T: Clone> Live<T> {
    pub(crate) fn new(rx: watch::Receiver<T>) -> Self {
        Self {
            state: State::Active(rx),
        }
    }

    /// Present value. After cancellation this is the last value seen.
    pub fn get(&self) -> T {
        match &self.state {
            State::Active(rx) => rx.borrow().clone(),
            State::Cancelled(v) => v.clone(),
        }
    }

    /// Whether an update arrived that has not been observed via [`Live::changed`].
    pub fn has_changed(&self) -> bool {
        match &self.state {
            State::Active(rx) => rx.has_changed().unwrap_or(false),
            State::Cancelled(_) => false,
        }
    }

    /// Wait for the next update. Returns `None` once cancelled or when the
    /// store has been dropped.
    pub async fn changed(&mut self) -> Option<T> {
        match &mut self.state {
            State::Active(rx) => {
                rx.changed().await.ok()?;
                Some(rx.borrow_and_update().clone())
            }
            State::Cancelled(_) => None,
        }
    }

    /// Stop receiving updates. Safe to call more than once.
    pub fn cancel(&mut self) {
        if let State::Active(rx) = &self.state {
            let last = rx.borrow().clone();
            self.state = State::Cancelled(last);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.state, State::Cancelled(_))
    }
}
