//! Broadcast and timeout timers of a state handler.
//!
//! Timers are not tasks: the state machine sleeps until the earliest
//! deadline and then asks which timers fired. Dropping the handler drops its timers.
use std::collections::BTreeMap;
use zksync_concurrency::time;

/// Timers a handler may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum TimerId {
    /// (Re)broadcast of the INIT ballot.
    BroadcastInitBallot,
    /// Rebroadcast of the local proposal.
    BroadcastProposal,
    /// (Re)broadcast of the ACCEPT ballot.
    BroadcastAcceptBallot,
    /// No proposal (or no ACCEPT majority) in time: vote for the next round.
    MoveNextRound,
    /// Lookup of a proposal which arrived before the INIT voteproof.
    PollProposal,
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    next: time::Instant,
    interval: Option<time::Duration>,
}

/// Set of named timers, each firing once after a first delay and then
/// optionally every `interval`.
#[derive(Debug, Default)]
pub(crate) struct Timers {
    timers: BTreeMap<TimerId, Timer>,
}

impl Timers {
    /// Starts (or restarts) a timer.
    pub(crate) fn start(
        &mut self,
        id: TimerId,
        now: time::Instant,
        first: time::Duration,
        interval: Option<time::Duration>,
    ) {
        self.timers.insert(
            id,
            Timer {
                next: now + first,
                interval,
            },
        );
    }

    /// Stops a timer.
    pub(crate) fn stop(&mut self, id: TimerId) {
        self.timers.remove(&id);
    }

    /// Stops every timer.
    pub(crate) fn stop_all(&mut self) {
        self.timers.clear();
    }

    pub(crate) fn is_running(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    /// Earliest time a timer fires.
    pub(crate) fn deadline(&self) -> time::Deadline {
        self.timers
            .values()
            .map(|t| time::Deadline::Finite(t.next))
            .min()
            .unwrap_or(time::Deadline::Infinite)
    }

    /// Timers due at `now`, in id order. Periodic timers are rescheduled,
    /// one-shot timers are removed.
    pub(crate) fn fired(&mut self, now: time::Instant) -> Vec<TimerId> {
        let mut fired = vec![];
        self.timers.retain(|id, t| {
            if t.next > now {
                return true;
            }
            fired.push(*id);
            match t.interval {
                Some(interval) => {
                    t.next = now + interval;
                    true
                }
                None => false,
            }
        });
        fired
    }
}
