//! Per-requester single-flight admission.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Identity on whose behalf a pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequesterId(String);

impl RequesterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequesterId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for RequesterId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for RequesterId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// The set of requesters that currently have a pipeline in flight.
///
/// A second request from a requester that is already active is refused outright; nothing is
/// queued.
#[derive(Debug, Default)]
pub struct RequestGuard {
    active: Mutex<HashSet<RequesterId>>,
}

impl RequestGuard {
    pub fn new() -> Self {
        Self::default()
    }

    // The set is never left half-updated, so a poisoned lock is still usable.
    fn active(&self) -> MutexGuard<'_, HashSet<RequesterId>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `requester` as active. Returns `false` if it already was.
    pub fn enter(&self, requester: &RequesterId) -> bool {
        let admitted = self.active().insert(requester.clone());
        if !admitted {
            tracing::debug!(%requester, "requester already has a pipeline in flight");
        }
        admitted
    }

    /// Marks `requester` as no longer active.
    pub fn exit(&self, requester: &RequesterId) {
        self.active().remove(requester);
    }

    pub fn is_active(&self, requester: &RequesterId) -> bool {
        self.active().contains(requester)
    }

    pub fn active_count(&self) -> usize {
        self.active().len()
    }

    /// Scoped form of [`Self::enter`]: the returned permit calls [`Self::exit`] when it is
    /// released or dropped, whichever comes first.
    pub fn acquire(self: &Arc<Self>, requester: RequesterId) -> Option<RequesterPermit> {
        self.enter(&requester).then(|| RequesterPermit {
            guard: Arc::clone(self),
            requester,
            released: false,
        })
    }
}

/// Proof that a requester has been admitted by a [`RequestGuard`].
#[derive(Debug)]
#[must_use = "the requester is released as soon as the permit is dropped"]
pub struct RequesterPermit {
    guard: Arc<RequestGuard>,
    requester: RequesterId,
    released: bool,
}

impl RequesterPermit {
    pub fn requester(&self) -> &RequesterId {
        &self.requester
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !std::mem::replace(&mut self.released, true) {
            self.guard.exit(&self.requester);
        }
    }
}

impl Drop for RequesterPermit {
    fn drop(&mut self) {
        self.release_once();
    }
}
