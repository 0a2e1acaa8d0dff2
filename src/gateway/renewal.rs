//! Single-flight coordination of credential renewal.
//!
//! The first caller to hit an expired credential becomes the leader and runs
//! the renewal. Every caller arriving while it is in flight queues as a waiter
//! and receives the leader's outcome. The in-flight flag is cleared in the
//! same critical section that notifies the waiters, so the next expiry always
//! starts a fresh renewal.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::credentials::Credential;

/// What a renewal produced, as seen by every caller that waited on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    Renewed(Credential),
    Failed,
    /// The leader was dropped before the renewal settled.
    Abandoned,
}

#[derive(Default)]
struct RenewalState {
    in_flight: bool,
    waiters: Vec<oneshot::Sender<RenewalOutcome>>,
}

#[derive(Default)]
pub struct RenewalCoordinator {
    state: Mutex<RenewalState>,
    started: AtomicU64,
}

/// A caller's role in the current renewal.
pub enum Ticket<'a> {
    Leader(LeaderGuard<'a>),
    Waiter(oneshot::Receiver<RenewalOutcome>),
}

impl RenewalCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lead a new renewal, or queue behind the one in flight.
    pub fn join(&self) -> Ticket<'_> {
        let mut state = self.state.lock();
        if state.in_flight {
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            return Ticket::Waiter(rx);
        }
        state.in_flight = true;
        self.started.fetch_add(1, Ordering::SeqCst);
        Ticket::Leader(LeaderGuard {
            coordinator: self,
            settled: false,
        })
    }

    pub fn in_flight(&self) -> bool {
        self.state.lock().in_flight
    }

    /// Callers currently queued behind the in-flight renewal.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Renewals started over the coordinator's lifetime.
    pub fn renewals_started(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    fn finish(&self, outcome: Option<&RenewalOutcome>) {
        let mut state = self.state.lock();
        for waiter in state.waiters.drain(..) {
            // Dropping the sender reports an abandoned renewal.
            if let Some(outcome) = outcome {
                let _ = waiter.send(outcome.clone());
            }
        }
        state.in_flight = false;
    }
}

/// Held by the caller running the renewal. Dropping it unsettled releases the
/// waiters with [`RenewalOutcome::Abandoned`].
pub struct LeaderGuard<'a> {
    coordinator: &'a RenewalCoordinator,
    settled: bool,
}

impl LeaderGuard<'_> {
    /// Hand `outcome` to every queued waiter and clear the in-flight flag.
    pub fn settle(mut self, outcome: &RenewalOutcome) {
        self.coordinator.finish(Some(outcome));
        self.settled = true;
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.coordinator.finish(None);
        }
    }
}

/// Await a waiter's ticket.
pub async fn wait(rx: oneshot::Receiver<RenewalOutcome>) -> RenewalOutcome {
    rx.await.unwrap_or(RenewalOutcome::Abandoned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    fn leader(ticket: Ticket<'_>) -> LeaderGuard<'_> {
        match ticket {
            Ticket::Leader(guard) => guard,
            Ticket::Waiter(_) => panic!("expected to lead the renewal"),
        }
    }

    fn waiter(ticket: Ticket<'_>) -> oneshot::Receiver<RenewalOutcome> {
        match ticket {
            Ticket::Waiter(rx) => rx,
            Ticket::Leader(_) => panic!("expected to wait on the renewal"),
        }
    }

    #[test]
    fn second_caller_waits_for_the_first() {
        let coordinator = RenewalCoordinator::new();
        let guard = leader(coordinator.join());
        let mut first = task::spawn(wait(waiter(coordinator.join())));
        let mut second = task::spawn(wait(waiter(coordinator.join())));

        assert!(coordinator.in_flight());
        assert_eq!(coordinator.waiting(), 2);
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        let renewed = RenewalOutcome::Renewed(Credential::new("fresh"));
        guard.settle(&renewed);

        assert!(first.is_woken());
        assert_ready_eq!(first.poll(), renewed.clone());
        assert_ready_eq!(second.poll(), renewed);
        assert!(!coordinator.in_flight());
        assert_eq!(coordinator.renewals_started(), 1);
    }

    #[test]
    fn settled_renewal_lets_the_next_caller_lead() {
        let coordinator = RenewalCoordinator::new();
        leader(coordinator.join()).settle(&RenewalOutcome::Failed);

        let guard = leader(coordinator.join());
        assert_eq!(coordinator.renewals_started(), 2);
        drop(guard);
    }

    #[test]
    fn dropped_leader_abandons_waiters_and_clears_flag() {
        let coordinator = RenewalCoordinator::new();
        let guard = leader(coordinator.join());
        let mut queued = task::spawn(wait(waiter(coordinator.join())));
        assert_pending!(queued.poll());

        drop(guard);

        assert_ready_eq!(queued.poll(), RenewalOutcome::Abandoned);
        assert!(!coordinator.in_flight());
        assert_eq!(coordinator.waiting(), 0);
    }
}
