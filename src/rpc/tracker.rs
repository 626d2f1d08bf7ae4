//! Correlate inbound traffic with outstanding lookups.

use crate::common::Id;

/// Identifies one tracked request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackerHandle(u64);

#[derive(Debug)]
struct TrackedRequest<T> {
    handle: TrackerHandle,
    target: Id,
    max_distance: u16,
    iterations: usize,
    owner: T,
}

/// A tracked lookup got closer to its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress<T> {
    pub target: Id,
    pub observed: Id,
    /// Distance between `observed` and `target`, 0 when the target itself was seen.
    pub distance: u16,
    pub owner: T,
}

/// Tracks lookups and reports progress as Ids are observed.
///
/// Every observed Id is checked against every tracked target. A request is dropped
/// once its target is seen, or after `k_depth` observations: callers treat the end
/// of progress events as a timeout.
#[derive(Debug)]
pub struct RequestTracker<T> {
    k_depth: usize,
    next_handle: u64,
    requests: Vec<TrackedRequest<T>>,
}

impl<T: Clone> RequestTracker<T> {
    pub fn new(k_depth: usize) -> Self {
        RequestTracker {
            k_depth,
            next_handle: 0,
            requests: Vec::new(),
        }
    }

    // === Public Methods ===

    /// Track `target`, reporting any observed Id closer than its maximum distance.
    pub fn track(&mut self, target: Id, owner: T) -> TrackerHandle {
        let max_distance = target.bits();

        self.track_within(target, max_distance, owner)
    }

    /// Track `target`, reporting only Ids closer than `max_distance`.
    pub fn track_within(&mut self, target: Id, max_distance: u16, owner: T) -> TrackerHandle {
        let handle = TrackerHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);

        self.requests.push(TrackedRequest {
            handle,
            target,
            max_distance,
            iterations: 0,
            owner,
        });

        handle
    }

    /// Stop tracking every request for `target`.
    pub fn untrack(&mut self, target: &Id) {
        self.requests.retain(|request| &request.target != target);
    }

    /// Stop tracking a single request.
    pub fn cancel(&mut self, handle: TrackerHandle) {
        self.requests.retain(|request| request.handle != handle);
    }

    /// Check an observed Id against all tracked requests.
    ///
    /// Returns the requests that got closer (or found) their target, in tracking order.
    pub fn notify(&mut self, observed: &Id) -> Vec<Progress<T>> {
        let mut progress = Vec::new();

        for request in self.requests.iter_mut() {
            request.iterations += 1;

            let distance = request.target.distance(observed);

            if &request.target == observed || distance < request.max_distance {
                request.max_distance = distance;

                progress.push(Progress {
                    target: request.target.clone(),
                    observed: observed.clone(),
                    distance,
                    owner: request.owner.clone(),
                });
            }
        }

        let k_depth = self.k_depth;
        self.requests
            .retain(|request| request.iterations < k_depth && request.max_distance > 0);

        progress
    }

    pub fn is_tracking(&self, target: &Id) -> bool {
        self.requests.iter().any(|request| &request.target == target)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
