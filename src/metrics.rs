//! Metrics describing the state of the client subsystem.

use std::sync::atomic::{AtomicUsize, Ordering};

//------------ ServerMetrics -------------------------------------------------

/// Counters maintained by a [`ClientManager`] and its clients.
///
/// These track what request handlers cannot know themselves; shutdown
/// gating reads them to decide when teardown is complete.
///
/// [`ClientManager`]: crate::manager::ClientManager
#[derive(Debug, Default)]
pub struct ServerMetrics {
    /// The number of live clients.
    num_clients: AtomicUsize,

    /// The total number of requests received.
    num_received_requests: AtomicUsize,

    /// The number of requests accepted but not yet finalized.
    num_inflight_requests: AtomicUsize,

    /// The number of responses scheduled but not yet written out.
    num_pending_writes: AtomicUsize,

    /// The total number of responses sent.
    num_sent_responses: AtomicUsize,
}

impl ServerMetrics {
    /// Creates a zeroed metrics collection.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// The number of live clients.
    #[must_use]
    pub fn num_clients(&self) -> usize {
        self.num_clients.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_num_clients(&self) {
        self.num_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_num_clients(&self) {
        self.num_clients.fetch_sub(1, Ordering::Relaxed);
    }

    /// The total number of requests received.
    #[must_use]
    pub fn num_received_requests(&self) -> usize {
        self.num_received_requests.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_num_received_requests(&self) {
        self.num_received_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// The number of requests accepted but not yet finalized.
    #[must_use]
    pub fn num_inflight_requests(&self) -> usize {
        self.num_inflight_requests.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_num_inflight_requests(&self) {
        self.num_inflight_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_num_inflight_requests(&self) {
        self.num_inflight_requests.fetch_sub(1, Ordering::Relaxed);
    }

    /// The number of responses scheduled but not yet written out.
    #[must_use]
    pub fn num_pending_writes(&self) -> usize {
        self.num_pending_writes.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_num_pending_writes(&self) {
        self.num_pending_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_num_pending_writes(&self) {
        self.num_pending_writes.fetch_sub(1, Ordering::Relaxed);
    }

    /// The total number of responses sent.
    #[must_use]
    pub fn num_sent_responses(&self) -> usize {
        self.num_sent_responses.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_num_sent_responses(&self) {
        self.num_sent_responses.fetch_add(1, Ordering::Relaxed);
    }
}
