use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{Job, JobId, PipelineStat, Reservation, ReservationToken};

/// A job waiting for its visibility time
struct DelayedJob {
    visible_at: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for DelayedJob {
    fn eq(&self, other: &Self) -> bool {
        self.visible_at == other.visible_at && self.seq == other.seq
    }
}

impl Eq for DelayedJob {}

impl PartialOrd for DelayedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.visible_at
            .cmp(&other.visible_at)
            .then(self.seq.cmp(&other.seq))
    }
}

/// A job held by a consumer. The stored job already carries the
/// incremented delivery count.
struct ReservedJob {
    job: Job,
    visible_at: Instant,
}

/// In-memory state of one local pipeline
#[derive(Default)]
pub(crate) struct LocalState {
    /// Visible jobs in push order
    ready: VecDeque<Job>,
    /// Min-heap on visibility time, ties broken by push sequence
    delayed: BinaryHeap<Reverse<DelayedJob>>,
    reserved: HashMap<ReservationToken, ReservedJob>,
    seq: u64,
}

impl LocalState {
    pub(crate) fn len(&self) -> usize {
        self.ready.len() + self.delayed.len() + self.reserved.len()
    }

    pub(crate) fn enqueue(&mut self, job: Job, delay: Duration, now: Instant) {
        if delay.is_zero() {
            self.ready.push_back(job);
            return;
        }

        self.seq += 1;
        self.delayed.push(Reverse(DelayedJob {
            visible_at: now + delay,
            seq: self.seq,
            job,
        }));
    }

    /// Move delayed jobs whose time has come to the ready queue
    pub(crate) fn promote_due(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while let Some(Reverse(next)) = self.delayed.peek() {
            if next.visible_at > now {
                break;
            }
            if let Some(Reverse(due)) = self.delayed.pop() {
                self.ready.push_back(due.job);
                promoted += 1;
            }
        }
        promoted
    }

    /// Requeue reservations whose visibility timeout elapsed
    pub(crate) fn reclaim_expired(&mut self, now: Instant) -> Vec<JobId> {
        let expired: Vec<ReservationToken> = self
            .reserved
            .iter()
            .filter(|(_, reserved)| reserved.visible_at <= now)
            .map(|(token, _)| token.clone())
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for token in expired {
            if let Some(reserved) = self.reserved.remove(&token) {
                reclaimed.push(reserved.job.id.clone());
                self.ready.push_back(reserved.job);
            }
        }
        reclaimed
    }

    /// Reserve the oldest visible job
    pub(crate) fn take_next(&mut self, visibility: Duration, now: Instant) -> Option<Reservation> {
        let job = self.ready.pop_front()?;
        let token = ReservationToken::new();

        let mut held = job.clone();
        held.attempt = held.attempt.saturating_add(1);
        self.reserved.insert(
            token.clone(),
            ReservedJob {
                job: held,
                visible_at: now + visibility,
            },
        );

        Some(Reservation::new(job, token))
    }

    pub(crate) fn release(&mut self, token: &ReservationToken) -> Option<Job> {
        self.reserved.remove(token).map(|reserved| reserved.job)
    }

    pub(crate) fn extend(&mut self, token: &ReservationToken, by: Duration, now: Instant) -> bool {
        match self.reserved.get_mut(token) {
            Some(reserved) => {
                reserved.visible_at = reserved.visible_at.max(now + by);
                true
            }
            None => false,
        }
    }

    /// Make a reservation eligible for reclaiming right away
    pub(crate) fn expire(&mut self, token: &ReservationToken, now: Instant) -> bool {
        match self.reserved.get_mut(token) {
            Some(reserved) => {
                reserved.visible_at = now;
                true
            }
            None => false,
        }
    }

    /// Earliest time a delayed job becomes visible
    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse(next)| next.visible_at)
    }

    pub(crate) fn stat(&self) -> PipelineStat {
        PipelineStat {
            queued: self.ready.len() as u64,
            reserved: self.reserved.len() as u64,
            delayed: self.delayed.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobOptions;

    fn job(payload: &'static str) -> Job {
        Job::new("local", payload, JobOptions::default())
    }

    #[test]
    fn delayed_jobs_promote_in_time_order() {
        let mut state = LocalState::default();
        let now = Instant::now();

        state.enqueue(job("late"), Duration::from_secs(20), now);
        state.enqueue(job("early"), Duration::from_secs(10), now);
        assert_eq!(state.promote_due(now), 0);
        assert_eq!(state.next_due(), Some(now + Duration::from_secs(10)));

        assert_eq!(state.promote_due(now + Duration::from_secs(30)), 2);
        let first = state.take_next(Duration::from_secs(1), now).unwrap();
        assert_eq!(first.job.payload, "early");
    }

    #[test]
    fn reservation_increments_the_held_attempt() {
        let mut state = LocalState::default();
        let now = Instant::now();
        state.enqueue(job("a"), Duration::ZERO, now);

        let reservation = state.take_next(Duration::from_secs(5), now).unwrap();
        assert_eq!(reservation.job.attempt, 0);

        let reclaimed = state.reclaim_expired(now + Duration::from_secs(6));
        assert_eq!(reclaimed, vec![reservation.job.id.clone()]);

        let again = state.take_next(Duration::from_secs(5), now).unwrap();
        assert_eq!(again.job.attempt, 1);
        assert_ne!(again.token, reservation.token);
    }

    #[test]
    fn extend_postpones_reclaim() {
        let mut state = LocalState::default();
        let now = Instant::now();
        state.enqueue(job("a"), Duration::ZERO, now);
        let reservation = state.take_next(Duration::from_secs(5), now).unwrap();

        assert!(state.extend(&reservation.token, Duration::from_secs(60), now));
        assert!(state.reclaim_expired(now + Duration::from_secs(10)).is_empty());
        assert_eq!(state.stat().reserved, 1);
        assert!(!state.extend(&ReservationToken::new(), Duration::from_secs(1), now));
    }
}
