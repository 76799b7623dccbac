//! Multi-round phase barrier.
//!
//! A [`PhaseBarrier`] coordinates a fixed number of participants through an
//! unbounded sequence of phases. Each participant owns a [`Participant`]
//! handle and either [syncs](Participant::sync) at a phase boundary or
//! [exits](Participant::exit) permanently, optionally reporting an error. The
//! orchestrator, which owns the barrier itself, calls
//! [`wait`](PhaseBarrier::wait) once per boundary and receives the errors that
//! were reported during the phase that just completed.
//!
//! An exited participant counts as arrived for every later phase, so a
//! participant failing early never blocks the remaining phases. A participant
//! that neither syncs nor exits blocks the barrier forever; use
//! [`wait_timeout`](PhaseBarrier::wait_timeout) to detect this.
//!
//! ```
//! use rendezvous::barrier::PhaseBarrier;
//!
//! let mut barrier = PhaseBarrier::<String>::new(2).unwrap();
//! let participants = barrier.participants();
//!
//! std::thread::scope(|s| {
//!     for (i, mut participant) in participants.into_iter().enumerate() {
//!         s.spawn(move || {
//!             participant.sync().unwrap();
//!             participant.exit((i == 1).then(|| format!("participant {i} failed")));
//!         });
//!     }
//!
//!     assert!(barrier.wait().is_empty());
//!     assert_eq!(barrier.wait(), vec!["participant 1 failed".to_string()]);
//! });
//! ```

use std::{sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};

/// The default error type collected by a [`PhaseBarrier`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Indicates an error when creating a barrier.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CreateError {
    /// A barrier needs at least one participant.
    #[error("Barrier requires at least one participant")]
    NoParticipants,
}

/// Indicates a rejected [`Participant::sync`] call.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SyncError {
    /// The participant already arrived at the boundary of this phase and the
    /// orchestrator has not advanced past it yet.
    #[error("Participant already arrived in phase {phase}")]
    AlreadyArrived { phase: u64 },

    /// The orchestrator did not complete the phase in time. The arrival
    /// still counts.
    #[error("Phase {phase} was not completed in time")]
    TimedOut { phase: u64 },
}

/// Indicates that [`PhaseBarrier::wait_timeout`] gave up.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum WaitTimeoutError {
    /// Not every participant arrived before the deadline. The phase has not
    /// advanced and may still be completed by a later wait.
    #[error("Phase {phase} timed out waiting for participants {missing:?}")]
    TimedOut { phase: u64, missing: Vec<usize> },
}

/// The errors reported during a phase that did not complete cleanly.
#[derive(thiserror::Error, Debug)]
#[error("Phase {phase} failed with {} error(s)", .errors.len())]
pub struct PhaseFailed<E> {
    pub phase: u64,
    pub errors: Vec<E>,
}

impl<E: std::fmt::Display> PhaseFailed<E> {
    /// Renders every collected error, separated by `; `.
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Still taking part. `reached` is the last phase whose boundary was
    /// signaled via sync.
    Active { reached: Option<u64> },
    /// Exited. A participant exits either at the boundary it had not reached
    /// yet or after syncing it, so it has arrived at the current phase and
    /// every later one.
    Done,
}

impl Slot {
    fn has_arrived(&self, phase: u64) -> bool {
        match *self {
            Slot::Active { reached } => reached == Some(phase),
            Slot::Done => true,
        }
    }
}

struct State<E> {
    phase: u64,
    arrived: usize,
    finished: usize,
    issued: usize,
    slots: Vec<Slot>,
    errors: Vec<E>,
    /// Errors of participants that exited after already arriving in the
    /// current phase. They belong to the next phase.
    next_errors: Vec<E>,
}

impl<E> State<E> {
    fn missing(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.has_arrived(self.phase))
            .map(|(index, _)| index)
            .collect()
    }
}

struct Shared<E> {
    total: usize,
    state: Mutex<State<E>>,
    /// Signaled when the last participant of a phase arrives.
    all_arrived: Condvar,
    /// Signaled when the orchestrator advances to the next phase.
    advanced: Condvar,
}

impl<E> Shared<E> {
    fn notify_if_complete(&self, state: &State<E>) {
        debug_assert!(state.arrived <= self.total);
        if state.arrived == self.total {
            tracing::trace!(phase = state.phase, "all participants arrived");
            self.all_arrived.notify_all();
        }
    }
}

/// The orchestrator side of a phase barrier.
///
/// There is exactly one orchestrator per barrier, which is why waiting takes
/// `&mut self`. Participant handles are issued with [`Self::participant`] or
/// [`Self::participants`].
pub struct PhaseBarrier<E = BoxError> {
    shared: Arc<Shared<E>>,
}

impl<E> std::fmt::Debug for PhaseBarrier<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("PhaseBarrier")
            .field("total", &self.shared.total)
            .field("phase", &state.phase)
            .field("arrived", &state.arrived)
            .field("finished", &state.finished)
            .field("errors", &state.errors.len())
            .finish()
    }
}

impl<E> PhaseBarrier<E> {
    /// Creates a barrier for `participants` participants.
    pub fn new(participants: usize) -> Result<Self, CreateError> {
        if participants == 0 {
            return Err(CreateError::NoParticipants);
        }

        Ok(Self {
            shared: Arc::new(Shared {
                total: participants,
                state: Mutex::new(State {
                    phase: 0,
                    arrived: 0,
                    finished: 0,
                    issued: 0,
                    slots: vec![Slot::Active { reached: None }; participants],
                    errors: Vec::new(),
                    next_errors: Vec::new(),
                }),
                all_arrived: Condvar::new(),
                advanced: Condvar::new(),
            }),
        })
    }

    /// Issues the next participant handle, or `None` once all handles have
    /// been issued.
    pub fn participant(&self) -> Option<Participant<E>> {
        let mut state = self.shared.state.lock();
        if state.issued == self.shared.total {
            return None;
        }
        let index = state.issued;
        state.issued += 1;

        Some(Participant {
            shared: self.shared.clone(),
            index,
            exited: false,
        })
    }

    /// Issues all remaining participant handles.
    pub fn participants(&self) -> Vec<Participant<E>> {
        std::iter::from_fn(|| self.participant()).collect()
    }

    pub fn total(&self) -> usize {
        self.shared.total
    }

    /// The phase the barrier is currently collecting arrivals for.
    pub fn phase(&self) -> u64 {
        self.shared.state.lock().phase
    }

    pub fn arrived(&self) -> usize {
        self.shared.state.lock().arrived
    }

    pub fn finished(&self) -> usize {
        self.shared.state.lock().finished
    }

    /// Blocks until every participant arrived at the current phase boundary,
    /// advances to the next phase and returns the errors reported during the
    /// completed phase.
    #[tracing::instrument(skip(self))]
    pub fn wait(&mut self) -> Vec<E> {
        let mut state = self.shared.state.lock();
        while state.arrived < self.shared.total {
            self.shared.all_arrived.wait(&mut state);
        }
        self.advance(&mut state)
    }

    /// Like [`Self::wait`], but gives up after `timeout`.
    ///
    /// On timeout the barrier is left untouched and the error lists the
    /// participants that have not arrived yet.
    #[tracing::instrument(skip(self))]
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Vec<E>, WaitTimeoutError> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.arrived < self.shared.total {
            if self
                .shared
                .all_arrived
                .wait_until(&mut state, deadline)
                .timed_out()
                && state.arrived < self.shared.total
            {
                let missing = state.missing();
                tracing::debug!(phase = state.phase, ?missing, "timeout");
                return Err(WaitTimeoutError::TimedOut {
                    phase: state.phase,
                    missing,
                });
            }
        }
        Ok(self.advance(&mut state))
    }

    /// Like [`Self::wait`], but turns a non-empty error list into a
    /// [`PhaseFailed`] error.
    pub fn wait_ok(&mut self) -> Result<(), PhaseFailed<E>> {
        let phase = self.phase();
        let errors = self.wait();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PhaseFailed { phase, errors })
        }
    }

    fn advance(&self, state: &mut State<E>) -> Vec<E> {
        debug_assert_eq!(state.missing(), Vec::<usize>::new());

        let errors = std::mem::replace(&mut state.errors, std::mem::take(&mut state.next_errors));
        let completed = state.phase;
        state.phase += 1;
        // Exited participants stay arrived for every following phase.
        state.arrived = state.finished;

        tracing::debug!(
            phase = completed,
            errors = errors.len(),
            finished = state.finished,
            "phase completed",
        );

        self.shared.advanced.notify_all();
        errors
    }
}

/// A single participant of a [`PhaseBarrier`].
///
/// A participant is active until it calls [`Self::exit`], which consumes the
/// handle. Dropping a handle without exiting does not count as an arrival, so
/// the barrier stays blocked on it.
pub struct Participant<E = BoxError> {
    shared: Arc<Shared<E>>,
    index: usize,
    exited: bool,
}

impl<E> std::fmt::Debug for Participant<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("index", &self.index)
            .finish()
    }
}

impl<E> Participant<E> {
    /// The index of this participant, in issue order.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Signals that this participant reached the boundary of the current
    /// phase. Does not block.
    ///
    /// A participant arrives at most once per phase. Calling this again before
    /// the orchestrator advanced past the phase is rejected.
    #[tracing::instrument(skip(self), fields(participant = self.index))]
    pub fn sync(&mut self) -> Result<(), SyncError> {
        let mut state = self.shared.state.lock();
        let phase = state.phase;
        let slot = state.slots[self.index];
        match slot {
            Slot::Active { reached } if reached == Some(phase) => {
                tracing::warn!(phase, "participant synced twice in the same phase");
                Err(SyncError::AlreadyArrived { phase })
            }
            Slot::Active { .. } => {
                state.slots[self.index] = Slot::Active {
                    reached: Some(phase),
                };
                state.arrived += 1;
                tracing::trace!(phase, arrived = state.arrived, "arrived");
                self.shared.notify_if_complete(&state);
                Ok(())
            }
            Slot::Done => unreachable!("exited participants consume their handle"),
        }
    }

    /// Signals arrival like [`Self::sync`] and then blocks until the
    /// orchestrator has completed the phase.
    #[tracing::instrument(skip(self), fields(participant = self.index))]
    pub fn sync_wait(&mut self) -> Result<(), SyncError> {
        self.sync()?;

        let mut state = self.shared.state.lock();
        let reached = self.reached(&state);
        while state.phase <= reached {
            self.shared.advanced.wait(&mut state);
        }
        Ok(())
    }

    /// Like [`Self::sync_wait`], but stops waiting for the orchestrator after
    /// `timeout`.
    #[tracing::instrument(skip(self), fields(participant = self.index))]
    pub fn sync_wait_timeout(&mut self, timeout: Duration) -> Result<(), SyncError> {
        self.sync()?;

        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        let reached = self.reached(&state);
        while state.phase <= reached {
            if self
                .shared
                .advanced
                .wait_until(&mut state, deadline)
                .timed_out()
                && state.phase <= reached
            {
                return Err(SyncError::TimedOut { phase: reached });
            }
        }
        Ok(())
    }

    fn reached(&self, state: &State<E>) -> u64 {
        match state.slots[self.index] {
            Slot::Active {
                reached: Some(reached),
            } => reached,
            _ => unreachable!("participant arrived before waiting"),
        }
    }

    /// Permanently leaves the barrier, optionally reporting an error.
    ///
    /// The error is attributed to the phase this participant is working
    /// towards: the current phase, or the next one if it already arrived at
    /// the current boundary.
    #[tracing::instrument(skip(self, error), fields(participant = self.index, failed = error.is_some()))]
    pub fn exit(mut self, error: Option<E>) {
        self.exited = true;

        let mut state = self.shared.state.lock();
        let phase = state.phase;
        state.finished += 1;
        let slot = state.slots[self.index];
        match slot {
            Slot::Active { reached } if reached == Some(phase) => {
                state.slots[self.index] = Slot::Done;
                state.next_errors.extend(error);
            }
            Slot::Active { .. } => {
                state.slots[self.index] = Slot::Done;
                state.arrived += 1;
                state.errors.extend(error);
            }
            Slot::Done => unreachable!("exited participants consume their handle"),
        }
        tracing::trace!(
            phase,
            arrived = state.arrived,
            finished = state.finished,
            "exited",
        );
        self.shared.notify_if_complete(&state);
    }

    /// Exits with the outcome of the participant's work.
    pub fn finish(self, result: Result<(), E>) {
        self.exit(result.err())
    }
}

impl<E> Drop for Participant<E> {
    fn drop(&mut self) {
        if !self.exited {
            tracing::warn!(
                participant = self.index,
                "participant dropped without exiting, the barrier will not complete"
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::*;
    use rand::Rng;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn create_requires_participants() {
        init_logger();
        assert_eq!(
            PhaseBarrier::<BoxError>::new(0).unwrap_err(),
            CreateError::NoParticipants
        );
    }

    #[test]
    fn participants_are_issued_once() -> Result<()> {
        init_logger();
        let barrier = PhaseBarrier::<BoxError>::new(3)?;

        let first = barrier.participant().unwrap();
        assert_eq!(first.index(), 0);
        let rest = barrier.participants();
        assert_eq!(rest.iter().map(Participant::index).collect::<Vec<_>>(), [1, 2]);
        assert!(barrier.participant().is_none());
        assert!(barrier.participants().is_empty());

        first.exit(None);
        rest.into_iter().for_each(|p| p.exit(None));
        Ok(())
    }

    #[test]
    fn exit_without_errors() -> Result<()> {
        init_logger();
        for n in 1..=8 {
            let mut barrier = PhaseBarrier::<BoxError>::new(n)?;
            thread::scope(|s| {
                for participant in barrier.participants() {
                    s.spawn(move || participant.exit(None));
                }
            });
            assert_eq!(barrier.finished(), n);
            assert!(barrier.wait_timeout(TIMEOUT)?.is_empty());
        }
        Ok(())
    }

    #[test]
    fn collects_exactly_the_reported_errors() -> Result<()> {
        init_logger();
        let n = 10;
        let mut barrier = PhaseBarrier::<String>::new(n)?;

        let errors = thread::scope(|s| {
            for participant in barrier.participants() {
                s.spawn(move || {
                    let i = participant.index();
                    participant.exit((i % 3 == 0).then(|| format!("participant {i} failed")));
                });
            }
            barrier.wait_timeout(TIMEOUT)
        });

        let mut errors = errors?;
        errors.sort();
        assert_eq!(
            errors,
            [0, 3, 6, 9]
                .iter()
                .map(|i| format!("participant {i} failed"))
                .collect::<Vec<_>>()
        );
        Ok(())
    }

    #[test]
    fn multiple_phases() -> Result<()> {
        init_logger();
        let n = 5;
        let mut barrier = PhaseBarrier::<BoxError>::new(n)?;

        let (waits, synced) = thread::scope(|s| {
            let handles = barrier
                .participants()
                .into_iter()
                .map(|mut participant| {
                    s.spawn(move || {
                        let synced = participant.sync_wait_timeout(TIMEOUT);
                        participant.exit(None);
                        synced
                    })
                })
                .collect::<Vec<_>>();

            let waits = [barrier.wait_timeout(TIMEOUT), barrier.wait_timeout(TIMEOUT)];
            let synced = handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>();
            (waits, synced)
        });

        for wait in waits {
            assert!(wait?.is_empty());
        }
        for result in synced {
            result?;
        }
        assert_eq!(barrier.phase(), 2);
        assert_eq!(barrier.finished(), n);
        Ok(())
    }

    #[test]
    fn early_exit_counts_for_later_phases() -> Result<()> {
        init_logger();
        let mut barrier = PhaseBarrier::<String>::new(2)?;
        let mut participants = barrier.participants();
        let mut survivor = participants.pop().unwrap();
        let quitter = participants.pop().unwrap();

        quitter.exit(Some("connection failed".into()));
        survivor.sync()?;
        assert_eq!(barrier.wait_timeout(TIMEOUT)?, vec!["connection failed".to_string()]);

        survivor.sync()?;
        assert!(barrier.wait_timeout(TIMEOUT)?.is_empty());

        survivor.exit(None);
        assert!(barrier.wait_timeout(TIMEOUT)?.is_empty());
        // Everyone exited, so every further phase completes immediately.
        assert!(barrier.wait_timeout(TIMEOUT)?.is_empty());
        assert_eq!(barrier.phase(), 4);
        Ok(())
    }

    #[test]
    fn double_sync_is_rejected() -> Result<()> {
        init_logger();
        let mut barrier = PhaseBarrier::<BoxError>::new(2)?;
        let mut participants = barrier.participants();

        participants[0].sync()?;
        assert_eq!(
            participants[0].sync(),
            Err(SyncError::AlreadyArrived { phase: 0 })
        );
        assert_eq!(barrier.arrived(), 1);

        participants[1].sync()?;
        assert!(barrier.wait_timeout(TIMEOUT)?.is_empty());
        participants[0].sync()?;

        for participant in participants {
            participant.exit(None);
        }
        assert!(barrier.wait_timeout(TIMEOUT)?.is_empty());
        Ok(())
    }

    #[test]
    fn sync_then_exit_stays_arrived() -> Result<()> {
        init_logger();
        let mut barrier = PhaseBarrier::<String>::new(2)?;
        let mut participants = barrier.participants();
        let mut second = participants.pop().unwrap();
        let mut first = participants.pop().unwrap();

        first.sync()?;
        first.exit(Some("fail".into()));
        assert_eq!(
            barrier.wait_timeout(Duration::from_millis(20)).unwrap_err(),
            WaitTimeoutError::TimedOut {
                phase: 0,
                missing: vec![1]
            }
        );

        second.sync()?;
        assert!(barrier.wait_timeout(TIMEOUT)?.is_empty());
        second.exit(None);
        assert_eq!(barrier.wait_timeout(TIMEOUT)?, vec!["fail".to_string()]);
        Ok(())
    }

    #[test]
    fn exit_after_arrival_belongs_to_next_phase() -> Result<()> {
        init_logger();
        let mut barrier = PhaseBarrier::<String>::new(3)?;
        let mut participants = barrier.participants();
        let mut failing = participants.pop().unwrap();
        let mut second = participants.pop().unwrap();
        let mut first = participants.pop().unwrap();

        first.sync()?;
        second.sync()?;
        failing.sync()?;
        failing.exit(Some("fail".into()));
        assert!(barrier.wait_timeout(TIMEOUT)?.is_empty());

        first.sync()?;
        second.sync()?;
        first.exit(None);
        second.exit(None);
        assert_eq!(barrier.wait_timeout(TIMEOUT)?, vec!["fail".to_string()]);
        Ok(())
    }

    #[test]
    fn exit_after_arrival_from_threads() -> Result<()> {
        init_logger();
        for _ in 0..20 {
            let mut barrier = PhaseBarrier::<String>::new(3)?;

            let (waits, synced) = thread::scope(|s| {
                let handles = barrier
                    .participants()
                    .into_iter()
                    .map(|mut participant| {
                        s.spawn(move || -> std::result::Result<(), SyncError> {
                            if participant.index() < 2 {
                                let synced = participant
                                    .sync_wait_timeout(TIMEOUT)
                                    .and_then(|()| participant.sync());
                                participant.exit(None);
                                synced
                            } else {
                                let synced = participant.sync();
                                participant.exit(Some("fail".into()));
                                synced
                            }
                        })
                    })
                    .collect::<Vec<_>>();

                let waits = [barrier.wait_timeout(TIMEOUT), barrier.wait_timeout(TIMEOUT)];
                let synced = handles
                    .into_iter()
                    .map(|handle| handle.join().unwrap())
                    .collect::<Vec<_>>();
                (waits, synced)
            });

            let [startup, work] = waits;
            assert!(startup?.is_empty());
            assert_eq!(work?, vec!["fail".to_string()]);
            for result in synced {
                result?;
            }
        }
        Ok(())
    }

    #[test]
    fn missing_participant_blocks() -> Result<()> {
        init_logger();
        let mut barrier = PhaseBarrier::<BoxError>::new(3)?;
        let mut participants = barrier.participants();
        let stuck = participants.pop().unwrap();

        for participant in participants {
            participant.exit(None);
        }
        assert_eq!(
            barrier.wait_timeout(Duration::from_millis(50)).unwrap_err(),
            WaitTimeoutError::TimedOut {
                phase: 0,
                missing: vec![2]
            }
        );
        assert_eq!(barrier.phase(), 0);

        stuck.exit(Some("late".into()));
        assert_eq!(barrier.wait_timeout(TIMEOUT)?.len(), 1);
        Ok(())
    }

    #[test]
    fn sync_wait_times_out_without_orchestrator() -> Result<()> {
        init_logger();
        let mut barrier = PhaseBarrier::<BoxError>::new(1)?;
        let mut participant = barrier.participant().unwrap();

        assert_eq!(
            participant.sync_wait_timeout(Duration::from_millis(20)),
            Err(SyncError::TimedOut { phase: 0 })
        );
        // The arrival still counts.
        assert_eq!(barrier.arrived(), 1);
        participant.exit(None);
        assert!(barrier.wait_timeout(TIMEOUT)?.is_empty());
        Ok(())
    }

    #[test]
    fn dropped_participant_never_arrives() -> Result<()> {
        init_logger();
        let mut barrier = PhaseBarrier::<BoxError>::new(1)?;
        drop(barrier.participant());

        assert!(barrier.wait_timeout(Duration::from_millis(20)).is_err());
        Ok(())
    }

    #[test]
    fn wait_ok_reports_all_errors() -> Result<()> {
        init_logger();
        let mut barrier = PhaseBarrier::<String>::new(2)?;
        let mut participants = barrier.participants();
        participants[0].sync()?;
        participants[1].sync()?;
        barrier.wait_ok()?;

        for participant in participants {
            let i = participant.index();
            participant.finish(Err(format!("participant {i} failed")));
        }
        let failed = barrier.wait_ok().unwrap_err();
        assert_eq!(failed.phase, 1);
        assert_eq!(failed.errors.len(), 2);
        assert_eq!(failed.to_string(), "Phase 1 failed with 2 error(s)");
        assert!(failed.summary().contains("participant 0 failed"));
        assert!(failed.summary().contains("participant 1 failed"));
        Ok(())
    }

    #[test]
    fn random_exit_phases() -> Result<()> {
        init_logger();
        let mut rng = rand::thread_rng();

        for _ in 0..10 {
            let n = rng.gen_range(1..=16);
            let phases = rng.gen_range(1..=5u64);
            let plans: Vec<(u64, bool)> = (0..n)
                .map(|_| (rng.gen_range(0..phases), rng.gen_bool(0.5)))
                .collect();

            let mut barrier = PhaseBarrier::<usize>::new(n)?;
            let (waits, synced) = thread::scope(|s| {
                let handles = barrier
                    .participants()
                    .into_iter()
                    .map(|mut participant| {
                        let (exit_phase, fails) = plans[participant.index()];
                        s.spawn(move || -> std::result::Result<(), SyncError> {
                            let mut rng = rand::thread_rng();
                            let mut synced = Ok(());
                            for _ in 0..exit_phase {
                                thread::sleep(Duration::from_micros(rng.gen_range(0..500)));
                                synced = participant.sync_wait_timeout(TIMEOUT);
                                if synced.is_err() {
                                    break;
                                }
                            }
                            let index = participant.index();
                            participant.exit(fails.then_some(index));
                            synced
                        })
                    })
                    .collect::<Vec<_>>();

                let waits = (0..phases)
                    .map(|_| barrier.wait_timeout(TIMEOUT))
                    .collect::<Vec<_>>();
                let synced = handles
                    .into_iter()
                    .map(|handle| handle.join().unwrap())
                    .collect::<Vec<_>>();
                (waits, synced)
            });

            for result in synced {
                result?;
            }
            for (phase, wait) in (0..phases).zip(waits) {
                let mut errors = wait?;
                errors.sort();
                let expected: Vec<usize> = plans
                    .iter()
                    .enumerate()
                    .filter(|(_, (exit_phase, fails))| *exit_phase == phase && *fails)
                    .map(|(i, _)| i)
                    .collect();
                assert_eq!(errors, expected);
            }
            assert_eq!(barrier.finished(), n);
        }
        Ok(())
    }
}
