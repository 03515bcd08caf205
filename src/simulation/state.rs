//! Per-replicate simulation state

use crate::data::{Dataset, Record};
use crate::error::Result;

/// Why a replicate stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The continuation predicate selected no record
    Exhausted,
    /// The cycle cap was reached with records still active
    CycleCap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicateStatus {
    Active,
    Terminated(TerminationReason),
}

/// State of one replicate during simulation
#[derive(Debug, Clone)]
pub struct SimulationState {
    /// Replicate identifier (1-indexed)
    pub replicate: u32,

    /// Cycles simulated so far
    pub cycles_run: u32,

    /// Every row seen or generated so far
    pub history: Dataset,

    /// Latest row of every record still eligible to advance
    pub frontier: Dataset,

    pub status: ReplicateStatus,
}

impl SimulationState {
    /// Start a replicate from the caller's initial rows
    pub fn new(replicate: u32, initial: &Dataset) -> Self {
        let history = initial.clone().with_replicate(replicate);
        let frontier = history.latest_per_record();
        Self {
            replicate,
            cycles_run: 0,
            history,
            frontier,
            status: ReplicateStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ReplicateStatus::Active
    }

    /// Highest cycle on the frontier (or in the history once it is empty)
    pub fn current_cycle(&self) -> u32 {
        self.frontier
            .max_cycle()
            .or_else(|| self.history.max_cycle())
            .unwrap_or(0)
    }

    /// Records continuing to the next cycle
    ///
    /// Records the predicate rejects leave the frontier for good; their last
    /// row stays in the history unchanged.
    pub fn take_active<P>(&mut self, continuation: &P) -> Dataset
    where
        P: Fn(&Record) -> bool,
    {
        let frontier = std::mem::take(&mut self.frontier);
        let (active, _frozen) = frontier.partition(continuation);
        active
    }

    /// Record the rows generated for one cycle
    pub fn advance(&mut self, generated: Dataset) -> Result<()> {
        self.history = std::mem::take(&mut self.history).concat(generated.clone())?;
        self.frontier = generated;
        self.cycles_run += 1;
        Ok(())
    }

    pub fn terminate(&mut self, reason: TerminationReason) {
        self.status = ReplicateStatus::Terminated(reason);
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        match self.status {
            ReplicateStatus::Terminated(reason) => Some(reason),
            ReplicateStatus::Active => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initial() -> Dataset {
        Dataset::from_records(
            vec!["close".to_string()],
            vec![
                Record::new("A", 5).with("close", 0.0),
                Record::new("A", 6).with("close", 0.0),
                Record::new("B", 6).with("close", 1.0),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_new_state_tags_replicate_and_builds_frontier() {
        let state = SimulationState::new(4, &initial());
        assert!(state.is_active());
        assert_eq!(state.history.len(), 3);
        assert_eq!(state.frontier.len(), 2);
        assert!(state.history.rows().iter().all(|r| r.replicate == Some(4)));
        assert_eq!(state.current_cycle(), 6);
    }

    #[test]
    fn test_frozen_records_leave_frontier() {
        let mut state = SimulationState::new(1, &initial());
        let active = state.take_active(&|r: &Record| !r.flag("close"));
        assert_eq!(active.len(), 1);
        assert_eq!(active.rows()[0].id, "A");

        state.advance(active.next_cycle().unwrap()).unwrap();
        assert_eq!(state.cycles_run, 1);
        assert_eq!(state.history.len(), 4);
        assert_eq!(state.frontier.len(), 1);
        assert_eq!(state.current_cycle(), 7);

        state.terminate(TerminationReason::Exhausted);
        assert_eq!(state.termination(), Some(TerminationReason::Exhausted));
    }
}
