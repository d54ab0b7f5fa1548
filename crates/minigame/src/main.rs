//! Headless demo: a two-round match over the loopback session layer.
//!
//! Round one ends on its game timer, round two through a manual hand-off.
//! A scripted remote participant walks around in every round room.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use app::{AppBuilder, Application, default_log_dir};
use bevy::prelude::{App, Time};
use minigame::input::{RawInput, ScriptedInput};
use minigame::plugin::{InputState, SessionSlot};
use minigame::rounds::{
    CompletionOutcome, HandOffReason, HandOffRequested, MatchSpec, QuestionRef, RoundOrchestrator,
    RoundPresenter, RoundScore, RoundSpec, ScoreSource,
};
use minigame::{LOG_ROUNDS, MinigamePlugin, config};
use shared::transport::{LoopbackHub, LoopbackRoom};
use shared::{Collection, EntityId, EntityState, MatchId, ParticipantId, Session};
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

const FRAME_MS: u64 = 16;
const MAX_FRAMES_PER_ROUND: usize = 2_000;

struct MinigameDemo;

impl Application for MinigameDemo {
    const APP_ID: &'static str = "minigame";
}

/// Forwards round sessions to the frame loop.
struct SlotPresenter {
    slot: SessionSlot,
}

impl RoundPresenter for SlotPresenter {
    fn start(&self, round: &RoundSpec, session: Arc<dyn Session>) {
        info!(target: LOG_ROUNDS, "presenting round {} in scene {}", round.number, round.scene_key);
        self.slot.offer(session);
    }

    fn stop(&self, _round: &RoundSpec) {
        self.slot.clear();
    }
}

/// Every round: all but one question right, scored halfway through the quiz.
struct ScriptedScores;

impl ScoreSource for ScriptedScores {
    fn current_score(&self, round: &RoundSpec) -> RoundScore {
        let total = round.questions.len() as u32;
        RoundScore::new(total.saturating_sub(1), total).with_elapsed(round.quiz_time_limit / 2)
    }
}

/// A second participant pacing back and forth in the round room.
struct RemoteWalker {
    room: LoopbackRoom,
    participant: ParticipantId,
    frame: u32,
}

impl RemoteWalker {
    fn enter(hub: &LoopbackHub, session: &Arc<dyn Session>) -> Self {
        let room = hub.room(session.room());
        let participant = Uuid::new_v4();
        let _remote = room.join(participant);
        room.spawn(Collection::PhysicsObjects, "crate", EntityState::at(240.0, 400.0));
        Self {
            room,
            participant,
            frame: 0,
        }
    }

    fn step(&mut self) {
        self.frame += 1;
        let phase = (self.frame % 120) as f32 / 120.0;
        let x = 100.0 + 200.0 * (phase * std::f32::consts::TAU).sin();
        let mut state = EntityState::at(x, 480.0).owned_by(self.participant);
        state.animation_state = "run".to_string();
        self.room.update(
            Collection::Players,
            EntityId::for_participant(self.participant),
            state,
        );
    }
}

fn main() -> anyhow::Result<()> {
    let log_dir = default_log_dir::<MinigameDemo>();
    let builder = AppBuilder::<MinigameDemo>::new(env!("CARGO_PKG_VERSION"), &log_dir)
        .map_err(|err| anyhow!(err))?;

    let settings_path = log_dir.with_file_name("settings.ron");
    let store = config::open_settings(&settings_path)
        .with_context(|| format!("loading {}", settings_path.display()))?;
    let rounds = store.get::<config::RoundSettings>()?;

    let slot = SessionSlot::default();
    let mut demo = builder.build_with_bevy(|mut app, _ctx| {
        app.insert_resource(slot.clone());
        app.add_plugins(MinigamePlugin::from_store(&store));
        app
    });
    demo.app_mut()
        .world_mut()
        .resource_mut::<InputState>()
        .set_source(
            ScriptedInput::default()
                .hold(RawInput::NONE, 60)
                .hold(RawInput::right(), 40)
                .hold(RawInput::right().with_jump(), 1)
                .hold(RawInput::left(), 40),
        );

    let hub = LoopbackHub::new();
    let orchestrator = RoundOrchestrator::new(
        Arc::new(hub.connector(Uuid::new_v4())),
        Arc::new(SlotPresenter { slot }),
        Arc::new(ScriptedScores),
        (*rounds).clone(),
    );
    let spec = MatchSpec {
        match_id: MatchId::from("demo-match"),
        questions: (1..=5).map(|i| QuestionRef::new(format!("question-{i}"))).collect(),
        round_count: 2,
        game_time_limit: Duration::from_secs(2),
        quiz_time_limit: Duration::from_secs(20),
        scene_pool: vec!["meadow".into(), "quarry".into(), "rooftops".into()],
        room_key_override: None,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    let results = runtime.block_on(async {
        orchestrator.initialize(spec).await?;
        let events = orchestrator.events().context("match not initialized")?;
        let mut hand_offs = events.hand_off_requested();

        let mut session = orchestrator.start_round(0).await?;
        let mut manual_after = None;
        loop {
            let mut walker = RemoteWalker::enter(&hub, &session);
            let hand_off = play_round(
                demo.app_mut(),
                &mut walker,
                &orchestrator,
                &mut hand_offs,
                manual_after,
            )
            .await?;
            info!(
                target: LOG_ROUNDS,
                "quiz for round {} after {:?}", hand_off.round_number, hand_off.reason
            );

            let outcome = orchestrator
                .complete(hand_off.round_number, hand_off.score)
                .await?;
            match outcome {
                CompletionOutcome::MatchCompleted(results) => break Ok::<_, anyhow::Error>(results),
                CompletionOutcome::NextRoundStarted(_) => {
                    session = orchestrator
                        .current_session()
                        .context("next round has no session")?;
                    manual_after = Some(90);
                }
                CompletionOutcome::Ignored => bail!("round completion ignored"),
            }
        }
    })?;

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

/// Run frames until the round is handed off, by its timer or after `manual_after` frames.
async fn play_round(
    app: &mut App,
    walker: &mut RemoteWalker,
    orchestrator: &RoundOrchestrator,
    hand_offs: &mut broadcast::Receiver<HandOffRequested>,
    manual_after: Option<usize>,
) -> anyhow::Result<HandOffRequested> {
    for frame in 0..MAX_FRAMES_PER_ROUND {
        walker.step();
        app.world_mut()
            .resource_mut::<Time>()
            .advance_by(Duration::from_millis(FRAME_MS));
        app.update();

        if manual_after == Some(frame) {
            orchestrator.request_hand_off(HandOffReason::Manual).await?;
        }
        // lets the round timer fire
        tokio::time::sleep(Duration::from_millis(FRAME_MS)).await;

        match hand_offs.try_recv() {
            Ok(hand_off) => return Ok(hand_off),
            Err(broadcast::error::TryRecvError::Empty) => {}
            Err(err) => bail!("hand-off channel: {err}"),
        }
    }
    bail!("round did not end within {MAX_FRAMES_PER_ROUND} frames")
}
