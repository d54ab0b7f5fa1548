//! Typed match notifications for presentation collaborators.
//!
//! Every match gets its own set of channels, so listeners of a finished match
//! never see events of the next one.

use serde::{Deserialize, Serialize};
use shared::{MatchId, SessionId};
use tokio::sync::broadcast;

use super::scoring::{MatchResults, RoundResult, RoundScore};

const CHANNEL_CAPACITY: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandOffReason {
    /// External pause/manual trigger.
    Manual,
    /// The round's game timer ran out.
    Timeout,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RoundStarted {
    pub match_id: MatchId,
    pub round_number: u32,
    pub scene_key: String,
    pub session: SessionId,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HandOffRequested {
    pub match_id: MatchId,
    pub round_number: u32,
    /// Score at the moment of interruption.
    pub score: RoundScore,
    pub reason: HandOffReason,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RoundCompleted {
    pub match_id: MatchId,
    pub result: RoundResult,
    pub accumulated_score: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MatchCompleted {
    pub match_id: MatchId,
    pub results: MatchResults,
}

#[derive(Debug)]
pub struct MatchEvents {
    match_id: MatchId,
    round_started: broadcast::Sender<RoundStarted>,
    hand_off_requested: broadcast::Sender<HandOffRequested>,
    round_completed: broadcast::Sender<RoundCompleted>,
    match_completed: broadcast::Sender<MatchCompleted>,
}

impl MatchEvents {
    pub fn new(match_id: MatchId) -> Self {
        Self {
            match_id,
            round_started: broadcast::channel(CHANNEL_CAPACITY).0,
            hand_off_requested: broadcast::channel(CHANNEL_CAPACITY).0,
            round_completed: broadcast::channel(CHANNEL_CAPACITY).0,
            match_completed: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn match_id(&self) -> &MatchId {
        &self.match_id
    }

    pub fn round_started(&self) -> broadcast::Receiver<RoundStarted> {
        self.round_started.subscribe()
    }

    pub fn hand_off_requested(&self) -> broadcast::Receiver<HandOffRequested> {
        self.hand_off_requested.subscribe()
    }

    pub fn round_completed(&self) -> broadcast::Receiver<RoundCompleted> {
        self.round_completed.subscribe()
    }

    pub fn match_completed(&self) -> broadcast::Receiver<MatchCompleted> {
        self.match_completed.subscribe()
    }

    // A send only fails without subscribers; nobody listening is fine.

    pub(crate) fn emit_round_started(&self, event: RoundStarted) {
        let _ = self.round_started.send(event);
    }

    pub(crate) fn emit_hand_off_requested(&self, event: HandOffRequested) {
        let _ = self.hand_off_requested.send(event);
    }

    pub(crate) fn emit_round_completed(&self, event: RoundCompleted) {
        let _ = self.round_completed.send(event);
    }

    pub(crate) fn emit_match_completed(&self, event: MatchCompleted) {
        let _ = self.match_completed.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribers_receive_typed_events() {
        let events = MatchEvents::new(MatchId::from("m"));
        let mut started = events.round_started();
        events.emit_round_started(RoundStarted {
            match_id: MatchId::from("m"),
            round_number: 1,
            scene_key: "arena".into(),
            session: SessionId::new(4),
        });
        let event = started.try_recv().unwrap();
        assert_eq!(event.round_number, 1);
        assert!(events.round_completed().try_recv().is_err());
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let events = MatchEvents::new(MatchId::from("m"));
        events.emit_match_completed(MatchCompleted {
            match_id: MatchId::from("m"),
            results: super::super::scoring::ScoreBoard::default().results(0),
        });
    }
}
