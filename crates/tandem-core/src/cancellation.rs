//! Linked cancellation primitives. A token derived from a source observes the
//! source's cancellation; a source can additionally be linked beneath one or
//! more tokens so that cancelling any ancestor cascades down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Arc<CancelState>>>,
}

impl CancelState {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();
        let children = std::mem::take(&mut *self.children.lock().expect("cancel children lock"));
        for child in children {
            child.cancel();
        }
    }

    fn attach_child(&self, child: Arc<CancelState>) {
        if self.cancelled.load(Ordering::SeqCst) {
            child.cancel();
            return;
        }
        self.children
            .lock()
            .expect("cancel children lock")
            .push(child.clone());
        // Cancellation may have raced the push; settle it.
        if self.cancelled.load(Ordering::SeqCst) {
            child.cancel();
        }
    }
}

/// Owning side of a cancellation pair.
#[derive(Debug, Clone, Default)]
pub struct CancellationSource {
    state: Arc<CancelState>,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            state: self.state.clone(),
        }
    }

    pub fn cancel(&self) {
        self.state.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }
}

/// Observing side. Cheap to clone; all clones share the same state.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    state: Arc<CancelState>,
}

impl CancellationToken {
    /// A token that can never be cancelled.
    pub fn none() -> Self {
        Self {
            state: Arc::new(CancelState::default()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Registers `source` so that cancelling this token also cancels it. A
    /// source may be linked beneath several tokens; the first ancestor to
    /// cancel wins.
    pub fn link_child(&self, source: &CancellationSource) {
        self.state.attach_child(source.state.clone());
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::none()
    }
}
