use std::sync::{Arc, Mutex};
use std::time::Duration;

use minigame::config::RoundSettings;
use minigame::rounds::{
    CompletionOutcome, HandOffOutcome, HandOffReason, InitOutcome, MatchSpec, QuestionRef,
    RoundError, RoundOrchestrator, RoundPresenter, RoundScore, RoundSpec, ScoreSource,
};
use shared::transport::{LoopbackConnector, LoopbackHub};
use shared::{MatchId, Session, SessionError};
use uuid::Uuid;

#[derive(Default)]
struct RecordingPresenter {
    calls: Mutex<Vec<String>>,
}

impl RecordingPresenter {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl RoundPresenter for RecordingPresenter {
    fn start(&self, round: &RoundSpec, session: Arc<dyn Session>) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("start {} {}", round.number, session.room()));
    }

    fn stop(&self, round: &RoundSpec) {
        self.calls.lock().unwrap().push(format!("stop {}", round.number));
    }
}

struct LiveScore(Mutex<RoundScore>);

impl ScoreSource for LiveScore {
    fn current_score(&self, _round: &RoundSpec) -> RoundScore {
        *self.0.lock().unwrap()
    }
}

struct Harness {
    hub: LoopbackHub,
    connector: Arc<LoopbackConnector>,
    presenter: Arc<RecordingPresenter>,
    orchestrator: RoundOrchestrator,
}

fn harness() -> Harness {
    harness_with(RoundSettings::default())
}

fn harness_with(settings: RoundSettings) -> Harness {
    let hub = LoopbackHub::new();
    let connector = Arc::new(hub.connector(Uuid::new_v4()));
    let presenter = Arc::new(RecordingPresenter::default());
    let orchestrator = RoundOrchestrator::new(
        connector.clone(),
        presenter.clone(),
        Arc::new(LiveScore(Mutex::new(RoundScore::new(1, 2)))),
        settings,
    );
    Harness {
        hub,
        connector,
        presenter,
        orchestrator,
    }
}

fn spec(id: &str, questions: usize, rounds: u32) -> MatchSpec {
    MatchSpec {
        match_id: MatchId::from(id),
        questions: (0..questions)
            .map(|i| QuestionRef::new(format!("{id}-q{i}")))
            .collect(),
        round_count: rounds,
        game_time_limit: Duration::from_secs(60),
        quiz_time_limit: Duration::from_secs(30),
        scene_pool: vec!["meadow".into(), "quarry".into(), "rooftops".into()],
        room_key_override: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_eight_questions_in_four_rounds() {
    let h = harness();
    h.orchestrator.initialize(spec("m", 8, 4)).await.unwrap();
    let plan = h.orchestrator.plan().unwrap();
    assert!(plan.rounds.iter().all(|r| r.questions.len() == 2));

    let events = h.orchestrator.events().unwrap();
    let mut completed = events.round_completed();
    let mut finished = events.match_completed();

    h.orchestrator.start_round(0).await.unwrap();
    assert_eq!(
        h.orchestrator.complete_round(RoundScore::new(2, 2)).await.unwrap(),
        CompletionOutcome::NextRoundStarted(2)
    );
    assert_eq!(
        h.orchestrator.complete_round(RoundScore::new(1, 2)).await.unwrap(),
        CompletionOutcome::NextRoundStarted(3)
    );

    let state = h.orchestrator.snapshot().unwrap();
    assert_eq!(state.accumulated_score, 3);
    assert_eq!(state.current_round_index, 2);
    assert!(!state.is_completed);
    assert!(state.network_session_id.is_some());
    assert_eq!(completed.try_recv().unwrap().accumulated_score, 2);
    assert_eq!(completed.try_recv().unwrap().accumulated_score, 3);

    h.orchestrator.complete_round(RoundScore::new(2, 2)).await.unwrap();
    let outcome = h.orchestrator.complete_round(RoundScore::new(0, 2)).await.unwrap();
    let results = match outcome {
        CompletionOutcome::MatchCompleted(results) => results,
        other => panic!("expected final results, got {other:?}"),
    };
    assert_eq!(results.score, 5);
    assert_eq!(results.total_questions, 8);
    assert_eq!(results.percentage, 62.5);
    assert_eq!(results.rounds.len(), 4);
    assert_eq!(finished.try_recv().unwrap().results, results);

    let state = h.orchestrator.snapshot().unwrap();
    assert!(state.is_completed);
    assert_eq!(state.network_session_id, None);
    assert_eq!(
        h.orchestrator.complete_round(RoundScore::new(2, 2)).await.unwrap(),
        CompletionOutcome::Ignored
    );
}

#[tokio::test(start_paused = true)]
async fn test_racing_completions_apply_once() {
    let h = harness();
    h.orchestrator.initialize(spec("m", 4, 2)).await.unwrap();
    h.orchestrator.start_round(0).await.unwrap();

    let (first, second) = tokio::join!(
        h.orchestrator.complete_round(RoundScore::new(2, 2)),
        h.orchestrator.complete_round(RoundScore::new(1, 2)),
    );
    assert_eq!(first.unwrap(), CompletionOutcome::NextRoundStarted(2));
    assert_eq!(second.unwrap(), CompletionOutcome::Ignored);

    let state = h.orchestrator.snapshot().unwrap();
    assert_eq!(state.accumulated_score, 2);
    assert_eq!(state.current_round_index, 1);
    assert!(!state.completion_guard);
}

fn no_settle_delay() -> RoundSettings {
    RoundSettings {
        settle_delay_ms: 0,
        ..RoundSettings::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_racing_completions_apply_once_without_settle_delay() {
    let h = harness_with(no_settle_delay());
    h.orchestrator.initialize(spec("m", 6, 3)).await.unwrap();
    h.orchestrator.start_round(0).await.unwrap();

    let (first, second) = tokio::join!(
        h.orchestrator.complete_round(RoundScore::new(2, 2)),
        h.orchestrator.complete_round(RoundScore::new(1, 2)),
    );
    assert_eq!(first.unwrap(), CompletionOutcome::NextRoundStarted(2));
    assert_eq!(second.unwrap(), CompletionOutcome::Ignored);

    let state = h.orchestrator.snapshot().unwrap();
    assert_eq!(state.accumulated_score, 2);
    assert_eq!(state.current_round_index, 1);
    assert!(!state.completion_guard);
}

#[tokio::test(start_paused = true)]
async fn test_completion_for_an_advanced_round_is_ignored() {
    let h = harness_with(no_settle_delay());
    h.orchestrator.initialize(spec("m", 6, 3)).await.unwrap();
    h.orchestrator.start_round(0).await.unwrap();

    assert_eq!(
        h.orchestrator.complete(1, RoundScore::new(2, 2)).await.unwrap(),
        CompletionOutcome::NextRoundStarted(2)
    );
    // a late trigger for round 1 must not land on round 2
    assert_eq!(
        h.orchestrator.complete(1, RoundScore::new(1, 2)).await.unwrap(),
        CompletionOutcome::Ignored
    );
    assert_eq!(
        h.orchestrator.complete(3, RoundScore::new(1, 2)).await.unwrap(),
        CompletionOutcome::Ignored
    );
    assert_eq!(
        h.orchestrator.complete(0, RoundScore::new(1, 2)).await.unwrap(),
        CompletionOutcome::Ignored
    );

    let state = h.orchestrator.snapshot().unwrap();
    assert_eq!(state.accumulated_score, 2);
    assert_eq!(state.current_round_index, 1);

    assert_eq!(
        h.orchestrator.complete(2, RoundScore::new(1, 2)).await.unwrap(),
        CompletionOutcome::NextRoundStarted(3)
    );
    assert_eq!(h.orchestrator.snapshot().unwrap().accumulated_score, 3);
}

#[tokio::test(start_paused = true)]
async fn test_racing_round_completions_without_settle_delay() {
    let h = harness_with(no_settle_delay());
    h.orchestrator.initialize(spec("m", 6, 3)).await.unwrap();
    h.orchestrator.start_round(0).await.unwrap();

    let (first, second) = tokio::join!(
        h.orchestrator.complete(1, RoundScore::new(2, 2)),
        h.orchestrator.complete(1, RoundScore::new(1, 2)),
    );
    let mut outcomes = vec![first.unwrap(), second.unwrap()];
    outcomes.retain(|outcome| *outcome != CompletionOutcome::Ignored);
    assert_eq!(outcomes, vec![CompletionOutcome::NextRoundStarted(2)]);
    assert_eq!(h.orchestrator.snapshot().unwrap().current_round_index, 1);
}

#[tokio::test(start_paused = true)]
async fn test_initialize_twice_keeps_state() {
    let h = harness();
    h.orchestrator.initialize(spec("m", 4, 2)).await.unwrap();
    h.orchestrator.start_round(0).await.unwrap();
    h.orchestrator.complete_round(RoundScore::new(2, 2)).await.unwrap();
    let before = h.orchestrator.snapshot();

    let outcome = h.orchestrator.initialize(spec("m", 4, 2)).await.unwrap();
    assert_eq!(outcome, InitOutcome::AlreadyInitialized);
    assert_eq!(h.orchestrator.snapshot(), before);
}

#[tokio::test(start_paused = true)]
async fn test_identical_questions_give_identical_scenes() {
    let a = harness();
    let b = harness();
    a.orchestrator.initialize(spec("m", 9, 6)).await.unwrap();
    b.orchestrator.initialize(spec("m", 9, 6)).await.unwrap();
    let scenes = |h: &Harness| -> Vec<String> {
        h.orchestrator
            .plan()
            .unwrap()
            .rounds
            .iter()
            .map(|r| r.scene_key.clone())
            .collect()
    };
    assert_eq!(scenes(&a), scenes(&b));
    assert_eq!(scenes(&a).len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_timer_expiry_hands_off() {
    let h = harness();
    h.orchestrator.initialize(spec("m", 4, 2)).await.unwrap();
    let mut hand_offs = h.orchestrator.events().unwrap().hand_off_requested();
    let session = h.orchestrator.start_round(0).await.unwrap();

    tokio::time::sleep(Duration::from_secs(61)).await;
    let event = hand_offs.try_recv().unwrap();
    assert_eq!(event.reason, HandOffReason::Timeout);
    assert_eq!(event.round_number, 1);
    assert_eq!(event.score, RoundScore::new(1, 2));
    assert!(!session.is_open());

    // the manual trigger arriving late finds nothing to hand off
    assert_eq!(
        h.orchestrator.request_hand_off(HandOffReason::Manual).await.unwrap(),
        HandOffOutcome::Ignored
    );
    assert_eq!(h.presenter.calls(), vec!["start 1 m:round-1", "stop 1"]);

    assert_eq!(
        h.orchestrator.complete_round(event.score).await.unwrap(),
        CompletionOutcome::NextRoundStarted(2)
    );
}

#[tokio::test(start_paused = true)]
async fn test_manual_hand_off_pauses_the_timer() {
    let h = harness();
    h.orchestrator.initialize(spec("m", 4, 2)).await.unwrap();
    let mut hand_offs = h.orchestrator.events().unwrap().hand_off_requested();
    h.orchestrator.start_round(0).await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    let outcome = h
        .orchestrator
        .request_hand_off(HandOffReason::Manual)
        .await
        .unwrap();
    assert_eq!(outcome, HandOffOutcome::HandedOff(RoundScore::new(1, 2)));
    assert_eq!(hand_offs.try_recv().unwrap().reason, HandOffReason::Manual);
    assert!(h.orchestrator.current_session().is_none());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(hand_offs.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_external_pause_holds_the_timer() {
    let h = harness();
    h.orchestrator.initialize(spec("m", 4, 2)).await.unwrap();
    let mut hand_offs = h.orchestrator.events().unwrap().hand_off_requested();
    h.orchestrator.start_round(0).await.unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.orchestrator.pause());
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(hand_offs.try_recv().is_err());

    assert!(h.orchestrator.resume());
    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(hand_offs.try_recv().is_err());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(hand_offs.try_recv().unwrap().reason, HandOffReason::Timeout);
}

#[tokio::test(start_paused = true)]
async fn test_each_round_gets_its_own_room() {
    let h = harness();
    let spec = spec("m", 4, 2);
    h.orchestrator.initialize(spec.clone()).await.unwrap();
    let first = h.orchestrator.start_round(0).await.unwrap();
    assert_eq!(first.room(), &spec.room_key(1));

    h.orchestrator.complete_round(RoundScore::new(1, 2)).await.unwrap();
    let second = h.orchestrator.current_session().unwrap();
    assert_eq!(second.room(), &spec.room_key(2));
    assert!(!first.is_open());

    let old_room = h.hub.existing_room(&spec.room_key(1)).unwrap();
    let new_room = h.hub.existing_room(&spec.room_key(2)).unwrap();
    assert!(old_room.participants().is_empty());
    assert_eq!(new_room.participants(), vec![h.connector.participant()]);
    assert_eq!(
        h.presenter.calls(),
        vec!["start 1 m:round-1", "stop 1", "start 2 m:round-2"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_room_key_override() {
    let h = harness();
    let mut spec = spec("m", 2, 1);
    spec.room_key_override = Some("lobby-9".into());
    h.orchestrator.initialize(spec).await.unwrap();
    let session = h.orchestrator.start_round(0).await.unwrap();
    assert_eq!(session.room().as_str(), "lobby-9:round-1");
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_network_is_reported_not_fatal() {
    let h = harness();
    h.orchestrator.initialize(spec("m", 4, 2)).await.unwrap();
    h.connector.set_available(false);
    let err = h.orchestrator.start_round(0).await.unwrap_err();
    assert!(matches!(
        err,
        RoundError::Network(SessionError::NetworkUnavailable(_))
    ));
    assert_eq!(h.orchestrator.snapshot().unwrap().network_session_id, None);

    h.connector.set_available(true);
    assert!(h.orchestrator.start_round(0).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_slow_join_times_out() {
    let h = harness();
    h.orchestrator.initialize(spec("m", 4, 2)).await.unwrap();
    h.connector.set_join_delay(Duration::from_secs(30));
    let err = h.orchestrator.start_round(0).await.unwrap_err();
    assert!(matches!(err, RoundError::Network(SessionError::Timeout)));
}

#[tokio::test(start_paused = true)]
async fn test_events_do_not_leak_across_matches() {
    let h = harness();
    h.orchestrator.initialize(spec("first", 2, 1)).await.unwrap();
    let mut old_started = h.orchestrator.events().unwrap().round_started();

    h.orchestrator.initialize(spec("second", 2, 1)).await.unwrap();
    let mut new_started = h.orchestrator.events().unwrap().round_started();
    h.orchestrator.start_round(0).await.unwrap();

    assert!(old_started.try_recv().is_err());
    let event = new_started.try_recv().unwrap();
    assert_eq!(event.match_id, MatchId::from("second"));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_match_spec() {
    let h = harness();
    let err = h.orchestrator.initialize(spec("m", 0, 1)).await.unwrap_err();
    assert!(matches!(err, RoundError::InvalidMatchSpec(_)));
    assert!(h.orchestrator.snapshot().is_none());
}
