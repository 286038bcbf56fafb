//! Once-per-parent bracket placement markers, and a bounded memory of
//! closed brackets for late redeliveries.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::domain::{BracketState, OrderId, PermId};

/// Processing markers keyed by parent permanent id.
///
/// Check and mark happen in one critical section, so of any number of
/// concurrent handlers for the same parent exactly one wins.
#[derive(Debug, Default)]
pub struct FillDedup {
    markers: Mutex<HashMap<PermId, DateTime<Utc>>>,
}

impl FillDedup {
    /// Create an empty marker set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `perm_id` as in progress. Returns `false` if already marked.
    pub fn try_mark(&self, perm_id: PermId) -> bool {
        let mut markers = self.markers.lock();
        if markers.contains_key(&perm_id) {
            return false;
        }
        markers.insert(perm_id, Utc::now());
        true
    }

    /// Clear the marker so a later notification can retry.
    pub fn release(&self, perm_id: PermId) -> bool {
        self.markers.lock().remove(&perm_id).is_some()
    }

    /// Whether a marker is held.
    #[must_use]
    pub fn is_marked(&self, perm_id: PermId) -> bool {
        self.markers.lock().contains_key(&perm_id)
    }

    /// When the marker was taken.
    #[must_use]
    pub fn marked_at(&self, perm_id: PermId) -> Option<DateTime<Utc>> {
        self.markers.lock().get(&perm_id).copied()
    }

    /// Number of markers held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.markers.lock().len()
    }

    /// No markers held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.markers.lock().is_empty()
    }
}

/// Final states of the most recently closed brackets, oldest evicted first.
#[derive(Debug)]
pub struct ClosedBrackets {
    capacity: usize,
    inner: Mutex<ClosedInner>,
}

#[derive(Debug, Default)]
struct ClosedInner {
    states: HashMap<OrderId, BracketState>,
    order: VecDeque<OrderId>,
}

impl ClosedBrackets {
    /// Remember up to `capacity` closed parents.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(ClosedInner::default()),
        }
    }

    /// Record the final state of a parent.
    pub fn remember(&self, parent_id: OrderId, state: BracketState) {
        let mut inner = self.inner.lock();
        if inner.states.insert(parent_id, state).is_none() {
            inner.order.push_back(parent_id);
        }
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.states.remove(&oldest);
            }
        }
    }

    /// Final state, if the parent closed recently.
    #[must_use]
    pub fn get(&self, parent_id: OrderId) -> Option<BracketState> {
        self.inner.lock().states.get(&parent_id).copied()
    }

    /// Number of parents remembered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    /// Nothing remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().order.is_empty()
    }
}
