//! Read scheduling
//! Serializes characteristic reads on one link: exactly one read is in flight
//! from the moment the link is ready until it drops.

use log::{debug, warn};
use uuid::Uuid;

/// Working set of characteristics still to be read in the current cycle.
///
/// Stack discipline: a cycle is pushed in seed order and consumed from the
/// tail, so the most recently added characteristic is always read next.
#[derive(Debug, Default, Clone)]
pub struct ReadQueue {
    pending: Vec<Uuid>,
}

impl ReadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&mut self, cycle: &[Uuid]) {
        self.pending.extend_from_slice(cycle);
    }

    /// The characteristic to read next, without removing it
    pub fn peek(&self) -> Option<Uuid> {
        self.pending.last().copied()
    }

    /// Removes the characteristic at the tail once its read has completed
    pub fn pop(&mut self) -> Option<Uuid> {
        self.pending.pop()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Drives the never-ending polling loop over a fixed cycle of characteristics.
#[derive(Debug, Default)]
pub struct ReadScheduler {
    cycle: Vec<Uuid>,
    queue: ReadQueue,
    in_flight: Option<Uuid>,
    cycles_started: u64,
}

impl ReadScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the queue from `cycle` and returns the first read to issue.
    pub fn start(&mut self, cycle: Vec<Uuid>) -> Option<Uuid> {
        self.stop();
        self.cycle = cycle;
        self.issue_next()
    }

    /// Consumes the outstanding read and returns the next one to issue.
    ///
    /// Called for failed reads too; the failed characteristic comes round
    /// again when the cycle reseeds.
    pub fn on_read_completed(&mut self, characteristic: Uuid) -> Option<Uuid> {
        let Some(expected) = self.in_flight.take() else {
            debug!("Ignoring completion for {} with no read in flight", characteristic);
            return None;
        };
        if expected != characteristic {
            warn!(
                "Read completion for {} while {} was in flight",
                characteristic, expected
            );
        }
        self.queue.pop();
        self.issue_next()
    }

    fn issue_next(&mut self) -> Option<Uuid> {
        if self.queue.is_empty() {
            if self.cycle.is_empty() {
                return None;
            }
            self.queue.seed(&self.cycle);
            self.cycles_started += 1;
            debug!("Read cycle {} seeded with {} characteristics", self.cycles_started, self.cycle.len());
        }
        self.in_flight = self.queue.peek();
        self.in_flight
    }

    /// Drops all pending work; no read is considered outstanding afterwards
    pub fn stop(&mut self) {
        self.cycle.clear();
        self.queue.clear();
        self.in_flight = None;
    }

    pub fn in_flight(&self) -> Option<Uuid> {
        self.in_flight
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn cycles_started(&self) -> u64 {
        self.cycles_started
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.queue.is_empty()
    }
}
