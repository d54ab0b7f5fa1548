use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use shared::{MatchId, RoomKey, Session, SessionConnector, SessionError, SessionId};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};

use super::events::{
    HandOffReason, HandOffRequested, MatchCompleted, MatchEvents, RoundCompleted, RoundStarted,
};
use super::plan::{MatchSpec, RoundPlan, RoundSpec};
use super::scoring::{MatchResults, RoundResult, RoundScore, ScoreBoard, weighted_score};
use super::{RoundError, RoundPresenter, ScoreSource};
use crate::LOG_ROUNDS;
use crate::config::RoundSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitOutcome {
    Initialized,
    /// Same match id as the running match; nothing changed.
    AlreadyInitialized,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CompletionOutcome {
    /// Another completion was in flight or the match is over.
    Ignored,
    /// Carries the number of the round that was started.
    NextRoundStarted(u32),
    MatchCompleted(MatchResults),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HandOffOutcome {
    /// No live round, or it was already handed off.
    Ignored,
    HandedOff(RoundScore),
}

/// Observable state of the running match.
#[derive(Clone, Debug, PartialEq)]
pub struct RoundSessionState {
    pub match_id: MatchId,
    pub current_round_index: usize,
    pub round_count: usize,
    pub accumulated_score: u32,
    /// A round completion is in flight.
    pub completion_guard: bool,
    pub is_completed: bool,
    pub network_session_id: Option<SessionId>,
}

#[derive(Debug)]
struct RoundTimer {
    token: u64,
    remaining: Duration,
    deadline: Option<Instant>,
    handle: Option<JoinHandle<()>>,
}

impl RoundTimer {
    /// Stops the countdown, keeping the remaining time. False if not running.
    fn pause(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return false;
        };
        handle.abort();
        if let Some(deadline) = self.deadline.take() {
            self.remaining = deadline.saturating_duration_since(Instant::now());
        }
        true
    }
}

struct MatchState {
    spec: MatchSpec,
    plan: Arc<RoundPlan>,
    events: Arc<MatchEvents>,
    current_round_index: usize,
    board: ScoreBoard,
    session: Option<Arc<dyn Session>>,
    /// Index of the round whose presentation is running.
    presenting: Option<usize>,
    timer: Option<RoundTimer>,
    next_timer_token: u64,
    completed: bool,
}

impl MatchState {
    fn stop_timer(&mut self) {
        if let Some(mut timer) = self.timer.take() {
            timer.pause();
        }
    }

    /// Presentation and session of the live round, taken out of the state.
    fn take_live(&mut self) -> (Option<RoundSpec>, Option<Arc<dyn Session>>) {
        self.stop_timer();
        let round = self
            .presenting
            .take()
            .and_then(|index| self.plan.round(index).cloned());
        (round, self.session.take())
    }
}

/// Resets the completion flag when the completing call returns.
struct CompletionGuard<'a>(&'a AtomicBool);

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    connector: Arc<dyn SessionConnector>,
    presenter: Arc<dyn RoundPresenter>,
    scores: Arc<dyn ScoreSource>,
    settings: RoundSettings,
    state: Mutex<Option<MatchState>>,
    completing: AtomicBool,
}

/// Drives one match at a time through its rounds.
///
/// Cheap to clone; all clones share the same match. The state lock is never
/// held across a join or leave.
#[derive(Clone)]
pub struct RoundOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RoundOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundOrchestrator")
            .field("state", &self.snapshot())
            .finish()
    }
}

impl RoundOrchestrator {
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        presenter: Arc<dyn RoundPresenter>,
        scores: Arc<dyn ScoreSource>,
        settings: RoundSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                presenter,
                scores,
                settings,
                state: Mutex::new(None),
                completing: AtomicBool::new(false),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, Option<MatchState>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> &RoundSettings {
        &self.inner.settings
    }

    /// Set up `spec` as the running match.
    ///
    /// A second call with the running match id is a no-op. A different id
    /// tears down the previous match, including its session.
    pub async fn initialize(&self, spec: MatchSpec) -> Result<InitOutcome, RoundError> {
        let (previous_round, previous_session) = {
            let mut state = self.state();
            if state.as_ref().is_some_and(|m| m.spec.match_id == spec.match_id) {
                debug!(target: LOG_ROUNDS, "match {} already initialized", spec.match_id);
                return Ok(InitOutcome::AlreadyInitialized);
            }

            let plan = RoundPlan::build(&spec)?;
            info!(
                target: LOG_ROUNDS,
                "match {} initialized: {} rounds, {} questions, seed {:#018x}",
                spec.match_id,
                plan.len(),
                plan.total_questions(),
                plan.seed
            );
            let events = Arc::new(MatchEvents::new(spec.match_id.clone()));
            let previous = state.replace(MatchState {
                spec,
                plan: Arc::new(plan),
                events,
                current_round_index: 0,
                board: ScoreBoard::default(),
                session: None,
                presenting: None,
                timer: None,
                next_timer_token: 0,
                completed: false,
            });
            match previous {
                Some(mut previous) => previous.take_live(),
                None => (None, None),
            }
        };

        if let Some(session) = previous_session {
            self.leave_quietly(session).await;
        }
        if let Some(round) = previous_round {
            self.inner.presenter.stop(&round);
        }
        Ok(InitOutcome::Initialized)
    }

    /// Join the session of round `index` and start its presentation.
    ///
    /// The previous round's session is left first, so a client never sits in
    /// two rooms at once.
    pub async fn start_round(&self, index: usize) -> Result<Arc<dyn Session>, RoundError> {
        let match_id = self
            .state()
            .as_ref()
            .map(|m| m.spec.match_id.clone())
            .ok_or(RoundError::NotInitialized)?;
        self.start_round_of(&match_id, index).await
    }

    async fn start_round_of(
        &self,
        match_id: &MatchId,
        index: usize,
    ) -> Result<Arc<dyn Session>, RoundError> {
        let (round, room, previous_round, previous_session) = {
            let mut guard = self.state();
            let state = match guard.as_mut() {
                Some(state) if &state.spec.match_id == match_id => state,
                Some(_) => return Err(RoundError::Superseded(match_id.clone())),
                None => return Err(RoundError::NotInitialized),
            };
            let round = state
                .plan
                .round(index)
                .cloned()
                .ok_or(RoundError::RoundOutOfRange {
                    index,
                    rounds: state.plan.len(),
                })?;
            let room = state.spec.room_key(round.number);
            let (previous_round, previous_session) = state.take_live();
            state.current_round_index = index;
            (round, room, previous_round, previous_session)
        };

        if let Some(session) = previous_session {
            self.leave_quietly(session).await;
        }
        if let Some(previous) = previous_round {
            self.inner.presenter.stop(&previous);
        }

        let session = match self.join(&room).await {
            Ok(session) => session,
            Err(err) => {
                error!(target: LOG_ROUNDS, "failed to join {}: {}", room, err);
                return Err(err.into());
            }
        };

        let events = {
            let mut guard = self.state();
            match guard.as_mut() {
                Some(state) if &state.spec.match_id == match_id => {
                    state.session = Some(Arc::clone(&session));
                    state.presenting = Some(index);
                    self.arm_timer(state, round.game_time_limit);
                    Some(Arc::clone(&state.events))
                }
                _ => None,
            }
        };
        let Some(events) = events else {
            warn!(target: LOG_ROUNDS, "match {} replaced during join of {}", match_id, room);
            self.leave_quietly(session).await;
            return Err(RoundError::Superseded(match_id.clone()));
        };

        self.inner.presenter.start(&round, Arc::clone(&session));
        info!(
            target: LOG_ROUNDS,
            "round {} of {} started in {} (scene {})",
            round.number, match_id, room, round.scene_key
        );
        events.emit_round_started(RoundStarted {
            match_id: match_id.clone(),
            round_number: round.number,
            scene_key: round.scene_key.clone(),
            session: session.id(),
        });
        Ok(session)
    }

    /// Apply `score` to the current round and move on.
    ///
    /// Only one completion runs at a time; overlapping calls return
    /// [`CompletionOutcome::Ignored`]. After the settle delay the next round
    /// is started, or the final results are published after the last one.
    pub async fn complete_round(&self, score: RoundScore) -> Result<CompletionOutcome, RoundError> {
        let index = self
            .state()
            .as_ref()
            .map(|state| state.current_round_index)
            .ok_or(RoundError::NotInitialized)?;
        self.complete_index(index, score).await
    }

    /// Apply `score` to round `round_number` if it is still the current round.
    ///
    /// A completion for a round the match has already moved past returns
    /// [`CompletionOutcome::Ignored`], so a late trigger never lands on the
    /// following round.
    pub async fn complete(
        &self,
        round_number: u32,
        score: RoundScore,
    ) -> Result<CompletionOutcome, RoundError> {
        let Some(index) = (round_number as usize).checked_sub(1) else {
            debug!(target: LOG_ROUNDS, "no round number {}, ignoring completion", round_number);
            return Ok(CompletionOutcome::Ignored);
        };
        self.complete_index(index, score).await
    }

    async fn complete_index(
        &self,
        expected: usize,
        score: RoundScore,
    ) -> Result<CompletionOutcome, RoundError> {
        if self
            .inner
            .completing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(target: LOG_ROUNDS, "round completion already in flight, ignoring");
            return Ok(CompletionOutcome::Ignored);
        }
        let _guard = CompletionGuard(&self.inner.completing);
        // callers racing in the same tick must see the flag, even when
        // nothing below suspends
        tokio::task::yield_now().await;

        let (match_id, events, results, live_round, session, next_index) = {
            let mut guard = self.state();
            let state = guard.as_mut().ok_or(RoundError::NotInitialized)?;
            if state.completed {
                debug!(target: LOG_ROUNDS, "match {} already completed", state.spec.match_id);
                return Ok(CompletionOutcome::Ignored);
            }
            let index = state.current_round_index;
            if index != expected {
                debug!(
                    target: LOG_ROUNDS,
                    "completion for round {} of {} while round {} is current, ignoring",
                    expected + 1,
                    state.spec.match_id,
                    index + 1
                );
                return Ok(CompletionOutcome::Ignored);
            }
            let round = state
                .plan
                .round(index)
                .cloned()
                .ok_or(RoundError::RoundOutOfRange {
                    index,
                    rounds: state.plan.len(),
                })?;
            let (live_round, session) = state.take_live();

            let result = RoundResult {
                round_number: round.number,
                correct: score.correct,
                total: score.total,
                weighted_score: weighted_score(&score, round.quiz_time_limit, &self.inner.settings),
                scene_key: round.scene_key.clone(),
            };
            state.board.record(result.clone());
            state.current_round_index = index + 1;
            state.completed = state.current_round_index >= state.plan.len();
            let results = state
                .completed
                .then(|| state.board.results(state.plan.total_questions() as u32));

            state.events.emit_round_completed(RoundCompleted {
                match_id: state.spec.match_id.clone(),
                result,
                accumulated_score: state.board.score(),
            });
            info!(
                target: LOG_ROUNDS,
                "round {} of {} completed: {}/{}, total {}",
                round.number,
                state.spec.match_id,
                score.correct,
                score.total,
                state.board.score()
            );
            (
                state.spec.match_id.clone(),
                Arc::clone(&state.events),
                results,
                live_round,
                session,
                state.current_round_index,
            )
        };

        if let Some(session) = session {
            self.leave_quietly(session).await;
        }
        if let Some(round) = live_round {
            self.inner.presenter.stop(&round);
        }

        if let Some(results) = results {
            info!(
                target: LOG_ROUNDS,
                "match {} completed: {}/{} ({:.1}%)",
                match_id, results.score, results.total_questions, results.percentage
            );
            events.emit_match_completed(MatchCompleted {
                match_id,
                results: results.clone(),
            });
            return Ok(CompletionOutcome::MatchCompleted(results));
        }

        tokio::time::sleep(self.inner.settings.settle_delay()).await;
        let session = self.start_round_of(&match_id, next_index).await?;
        debug!(target: LOG_ROUNDS, "next round running in session {}", session.id());
        Ok(CompletionOutcome::NextRoundStarted(next_index as u32 + 1))
    }

    /// Interrupt the live round for the external quiz phase.
    ///
    /// Pauses the round timer, leaves the session, stops the presentation and
    /// publishes the score at this moment. Happens at most once per round.
    pub async fn request_hand_off(&self, reason: HandOffReason) -> Result<HandOffOutcome, RoundError> {
        let (round, session, events, match_id) = {
            let mut guard = self.state();
            let state = guard.as_mut().ok_or(RoundError::NotInitialized)?;
            if state.completed || state.presenting.is_none() {
                debug!(target: LOG_ROUNDS, "no live round to hand off ({:?})", reason);
                return Ok(HandOffOutcome::Ignored);
            }
            let (round, session) = state.take_live();
            let Some(round) = round else {
                return Ok(HandOffOutcome::Ignored);
            };
            (
                round,
                session,
                Arc::clone(&state.events),
                state.spec.match_id.clone(),
            )
        };

        let score = self.inner.scores.current_score(&round);
        if let Some(session) = session {
            self.leave_quietly(session).await;
        }
        self.inner.presenter.stop(&round);

        info!(
            target: LOG_ROUNDS,
            "round {} of {} handed off ({:?}) at {}/{}",
            round.number, match_id, reason, score.correct, score.total
        );
        events.emit_hand_off_requested(HandOffRequested {
            match_id,
            round_number: round.number,
            score,
            reason,
        });
        Ok(HandOffOutcome::HandedOff(score))
    }

    /// Pause the round timer. False if no timer is running.
    pub fn pause(&self) -> bool {
        let mut guard = self.state();
        let paused = guard
            .as_mut()
            .and_then(|state| state.timer.as_mut())
            .is_some_and(RoundTimer::pause);
        if paused {
            debug!(target: LOG_ROUNDS, "round timer paused");
        }
        paused
    }

    /// Resume a paused round timer with its remaining time.
    pub fn resume(&self) -> bool {
        let mut guard = self.state();
        let Some(timer) = guard.as_mut().and_then(|state| state.timer.as_mut()) else {
            return false;
        };
        if timer.handle.is_some() {
            return false;
        }
        match self.spawn_timer(timer.token, timer.remaining) {
            Some((handle, deadline)) => {
                debug!(target: LOG_ROUNDS, "round timer resumed, {:?} left", timer.remaining);
                timer.handle = Some(handle);
                timer.deadline = Some(deadline);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Option<RoundSessionState> {
        self.state().as_ref().map(|state| RoundSessionState {
            match_id: state.spec.match_id.clone(),
            current_round_index: state.current_round_index,
            round_count: state.plan.len(),
            accumulated_score: state.board.score(),
            completion_guard: self.inner.completing.load(Ordering::Acquire),
            is_completed: state.completed,
            network_session_id: state.session.as_ref().map(|s| s.id()),
        })
    }

    /// Event channels of the running match.
    pub fn events(&self) -> Option<Arc<MatchEvents>> {
        self.state().as_ref().map(|state| Arc::clone(&state.events))
    }

    pub fn plan(&self) -> Option<Arc<RoundPlan>> {
        self.state().as_ref().map(|state| Arc::clone(&state.plan))
    }

    pub fn current_session(&self) -> Option<Arc<dyn Session>> {
        self.state().as_ref().and_then(|state| state.session.clone())
    }

    /// Time left on the round timer, if one is armed.
    pub fn remaining_time(&self) -> Option<Duration> {
        self.state()
            .as_ref()
            .and_then(|state| state.timer.as_ref())
            .map(|timer| match timer.deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timer.remaining,
            })
    }

    async fn join(&self, room: &RoomKey) -> Result<Arc<dyn Session>, SessionError> {
        timeout(self.inner.settings.session_timeout(), self.inner.connector.join(room))
            .await
            .map_err(|_| SessionError::Timeout)?
    }

    async fn leave_quietly(&self, session: Arc<dyn Session>) {
        let result = timeout(
            self.inner.settings.session_timeout(),
            self.inner.connector.leave(&session),
        )
        .await
        .map_err(|_| SessionError::Timeout)
        .and_then(|inner| inner);
        match result {
            Ok(()) => debug!(target: LOG_ROUNDS, "left {}", session.room()),
            Err(err) => warn!(target: LOG_ROUNDS, "leaving {} failed: {}", session.room(), err),
        }
    }

    fn arm_timer(&self, state: &mut MatchState, limit: Duration) {
        state.stop_timer();
        state.next_timer_token += 1;
        let token = state.next_timer_token;
        let (handle, deadline) = match self.spawn_timer(token, limit) {
            Some((handle, deadline)) => (Some(handle), Some(deadline)),
            None => (None, None),
        };
        state.timer = Some(RoundTimer {
            token,
            remaining: limit,
            deadline,
            handle,
        });
    }

    fn spawn_timer(&self, token: u64, duration: Duration) -> Option<(JoinHandle<()>, Instant)> {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!(target: LOG_ROUNDS, "round timer not armed: {}", err);
                return None;
            }
        };
        let deadline = Instant::now() + duration;
        let weak = Arc::downgrade(&self.inner);
        let handle = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                RoundOrchestrator { inner }.on_timer_expired(token).await;
            }
        });
        Some((handle, deadline))
    }

    async fn on_timer_expired(&self, token: u64) {
        let fired = {
            let mut guard = self.state();
            match guard.as_mut() {
                Some(state) if state.timer.as_ref().is_some_and(|t| t.token == token) => {
                    // Detach instead of aborting: this is the timer task itself.
                    if let Some(mut timer) = state.timer.take() {
                        timer.handle = None;
                    }
                    true
                }
                _ => false,
            }
        };
        if !fired {
            return;
        }
        info!(target: LOG_ROUNDS, "round timer expired");
        if let Err(err) = self.request_hand_off(HandOffReason::Timeout).await {
            warn!(target: LOG_ROUNDS, "timeout hand-off failed: {}", err);
        }
    }
}
