//! Multi-round match lifecycle.
//!
//! A match is split into rounds by [`RoundPlan`]. Each round plays in its own
//! session room; the [`RoundOrchestrator`] joins and leaves those rooms, runs
//! the round timer, hands off to the external quiz phase and aggregates the
//! scores it gets back.

mod events;
mod orchestrator;
mod plan;
mod scoring;

use std::sync::Arc;

use shared::{MatchId, Session, SessionError};
use thiserror::Error;

pub use events::{
    HandOffReason, HandOffRequested, MatchCompleted, MatchEvents, RoundCompleted, RoundStarted,
};
pub use orchestrator::{
    CompletionOutcome, HandOffOutcome, InitOutcome, RoundOrchestrator, RoundSessionState,
};
pub use plan::{
    MatchSpec, QuestionRef, RoundPlan, RoundSpec, partition_sizes, question_seed, scene_sequence,
};
pub use scoring::{MatchResults, RoundResult, RoundScore, ScoreBoard, weighted_score};

#[derive(Debug, Error)]
pub enum RoundError {
    #[error("invalid match spec: {0}")]
    InvalidMatchSpec(&'static str),
    #[error("no match initialized")]
    NotInitialized,
    #[error("round index {index} out of range ({rounds} rounds)")]
    RoundOutOfRange { index: usize, rounds: usize },
    #[error("match {0} was replaced while the round was starting")]
    Superseded(MatchId),
    #[error(transparent)]
    Network(#[from] SessionError),
}

/// The minigame's scoring surface.
pub trait ScoreSource: Send + Sync {
    /// Score of `round` as of right now.
    fn current_score(&self, round: &RoundSpec) -> RoundScore;
}

/// Starts and stops the playable part of a round (scene, input, sync).
pub trait RoundPresenter: Send + Sync {
    fn start(&self, round: &RoundSpec, session: Arc<dyn Session>);

    fn stop(&self, round: &RoundSpec);
}
