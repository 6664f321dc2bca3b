//! Hierarchical cancellation scopes.
//!
//! A [`Scope`] is a single-shot stop/done signal with a set of attached
//! children. Requesting stop on a scope cascades to every child that is
//! attached at that moment, exactly once. "Asked to stop" and "finished
//! stopping" are tracked separately so owners can wait for cleanup.
//!
//! Scopes are replaced rather than reset: when a connection generation ends,
//! its scope is stopped, marked done and detached, and a fresh scope is
//! attached in its place.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use uuid::Uuid;

/// Observable lifecycle of a [`Scope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Active,
    StopRequested,
    Done,
}

/// Cheaply cloneable handle to a shared cancellation scope.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    id: Uuid,
    stop_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
    /// Guards the stop transition as well as the child set, so an attach
    /// racing a cascade either lands before it or observes it.
    children: Mutex<HashMap<Uuid, Scope>>,
}

impl Scope {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ScopeInner {
                id: Uuid::new_v4(),
                stop_tx,
                done_tx,
                children: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a new scope already attached as a child of `self`.
    pub fn child(&self) -> Self {
        let child = Self::new();
        self.add_child(&child);
        child
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Request stop and cascade it to all attached children.
    ///
    /// Returns `true` only for the call that performed the transition;
    /// repeated or concurrent calls are no-ops.
    pub fn request_stop(&self) -> bool {
        let children: Vec<Self> = {
            let mut children = self.lock_children();
            let first = self.inner.stop_tx.send_if_modified(|stopped| {
                if *stopped {
                    false
                } else {
                    *stopped = true;
                    true
                }
            });
            if !first {
                return false;
            }
            children.drain().map(|(_, child)| child).collect()
        };

        for child in children {
            child.request_stop();
        }
        true
    }

    /// Mark cleanup complete. Implies [`Scope::request_stop`].
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn mark_done(&self) -> bool {
        self.request_stop();
        self.inner.done_tx.send_if_modified(|done| {
            if *done {
                false
            } else {
                *done = true;
                true
            }
        })
    }

    /// Attach `child` so it receives this scope's stop cascade.
    ///
    /// Attaching to a scope that has already been asked to stop stops the
    /// child immediately.
    pub fn add_child(&self, child: &Self) {
        if child.id() == self.id() {
            return;
        }
        let already_stopped = {
            let mut children = self.lock_children();
            if *self.inner.stop_tx.borrow() {
                true
            } else {
                children.insert(child.id(), child.clone());
                false
            }
        };
        if already_stopped {
            child.request_stop();
        }
    }

    /// Detach `child`. A detached child never sees a later cascade.
    pub fn remove_child(&self, child: &Self) -> bool {
        self.lock_children().remove(&child.id()).is_some()
    }

    pub fn child_count(&self) -> usize {
        self.lock_children().len()
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.inner.stop_tx.borrow()
    }

    pub fn is_done(&self) -> bool {
        *self.inner.done_tx.borrow()
    }

    pub fn state(&self) -> ScopeState {
        if self.is_done() {
            ScopeState::Done
        } else if self.is_stop_requested() {
            ScopeState::StopRequested
        } else {
            ScopeState::Active
        }
    }

    /// Resolves once stop has been requested. Cancel-safe, so it can sit in
    /// a `tokio::select!` next to other work.
    pub async fn stopped(&self) {
        let mut rx = self.inner.stop_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Resolves once the scope has been marked done.
    pub async fn done(&self) {
        let mut rx = self.inner.done_tx.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    fn lock_children(&self) -> MutexGuard<'_, HashMap<Uuid, Self>> {
        self.inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("children", &self.child_count())
            .finish()
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Scope {}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn stop_cascades_to_children() {
        let parent = Scope::new();
        let a = parent.child();
        let b = parent.child();
        let grandchild = a.child();

        assert!(parent.request_stop());
        assert!(a.is_stop_requested());
        assert!(b.is_stop_requested());
        assert!(grandchild.is_stop_requested());
        assert!(!a.is_done());
    }

    #[test]
    fn stop_is_idempotent() {
        let scope = Scope::new();
        assert!(scope.request_stop());
        assert!(!scope.request_stop());
        assert!(scope.mark_done());
        assert!(!scope.mark_done());
        assert_eq!(scope.state(), ScopeState::Done);
    }

    #[test]
    fn removed_child_never_receives_cascade() {
        let parent = Scope::new();
        let child = parent.child();
        assert!(parent.remove_child(&child));
        assert!(!parent.remove_child(&child));

        parent.request_stop();
        assert_eq!(child.state(), ScopeState::Active);
    }

    #[test]
    fn mark_done_implies_stop() {
        let scope = Scope::new();
        let child = scope.child();
        scope.mark_done();
        assert!(scope.is_stop_requested());
        assert!(child.is_stop_requested());
    }

    #[test]
    fn attach_after_stop_stops_child() {
        let parent = Scope::new();
        parent.request_stop();
        let late = Scope::new();
        parent.add_child(&late);
        assert!(late.is_stop_requested());
        assert_eq!(parent.child_count(), 0);
    }

    #[test]
    fn generation_replacement_keeps_one_child() {
        let parent = Scope::new();
        let mut generation = parent.child();
        for _ in 0..3 {
            generation.request_stop();
            generation.mark_done();
            parent.remove_child(&generation);
            generation = Scope::new();
            parent.add_child(&generation);
            assert_eq!(parent.child_count(), 1);
        }
        parent.request_stop();
        assert!(generation.is_stop_requested());
    }

    #[test]
    fn concurrent_stops_transition_once() {
        let scope = Scope::new();
        let child = scope.child();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let scope = scope.clone();
                std::thread::spawn(move || scope.request_stop())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(child.is_stop_requested());
    }

    #[tokio::test]
    async fn stopped_future_resolves_on_stop() {
        let scope = Scope::new();
        let waiter = {
            let scope = scope.clone();
            tokio::spawn(async move { scope.stopped().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        scope.request_stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn done_future_waits_for_mark_done() {
        let scope = Scope::new();
        scope.request_stop();
        let pending =
            tokio::time::timeout(Duration::from_millis(20), scope.done()).await;
        assert!(pending.is_err());

        scope.mark_done();
        tokio::time::timeout(Duration::from_secs(1), scope.done())
            .await
            .unwrap();
    }
}
