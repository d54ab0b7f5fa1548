//! Bevy wiring: components, resources and the per-frame system chain.
//!
//! Frame order is input, player state machine, session sync, integration.
//! The ECS world implements [`Scene`] for the sync handler and
//! [`PlayerBody`] for the state machine.

use std::sync::{Arc, Mutex, PoisonError};

use bevy::input::ButtonInput;
use bevy::math::EulerRot;
use bevy::prelude::*;
use settings::SettingsStore;
use shared::{EntityId, EntityState, Session};
use tracing::{debug, warn};

use crate::LOG_SYNC;
use crate::clock::{Clock, ManualClock};
use crate::config::{PlayerSettings, RoundSettings, SyncSettings};
use crate::input::{Command, CommandTranslator, InputSource, RawInput};
use crate::networking::{EntityKind, NetworkSyncHandler, Scene};
use crate::player::{PlayerBody, PlayerStateMachine};

/// The avatar driven by this client's input.
#[derive(Component, Debug, Clone)]
pub struct LocalPlayer {
    pub id: EntityId,
}

/// Visual of an entity owned elsewhere.
#[derive(Component, Debug, Clone)]
pub struct RemoteProxy {
    pub id: EntityId,
    pub kind: EntityKind,
}

#[derive(Component, Debug, Clone, Copy, Default)]
pub struct Velocity {
    pub linear: Vec2,
}

#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Grounded(pub bool);

#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Facing(pub shared::Facing);

#[derive(Component, Debug, Clone, Default, PartialEq, Eq)]
pub struct AnimationKey(pub String);

/// Gravity and floor collision apply while true.
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhysicsDriven(pub bool);

/// Millisecond view of Bevy's [`Time`] for the state machine, the
/// interpolators and the authority cooldowns. Set once per frame in
/// `PreUpdate`, so all of them read the same instant as the physics step.
#[derive(Resource, Debug, Clone)]
pub struct MinigameClock(pub Arc<ManualClock>);

impl MinigameClock {
    pub fn now_ms(&self) -> f64 {
        self.0.now_ms()
    }
}

#[derive(Resource, Default)]
pub struct InputState {
    pub translator: CommandTranslator,
    pub pending: Vec<Command>,
    pub source: Option<Box<dyn InputSource + Send + Sync>>,
}

impl InputState {
    pub fn set_source(&mut self, source: impl InputSource + Send + Sync + 'static) {
        self.source = Some(Box::new(source));
        self.translator = CommandTranslator::new();
    }
}

#[derive(Resource, Debug)]
pub struct PlayerController {
    pub machine: PlayerStateMachine,
}

impl PlayerController {
    fn reset(&mut self) {
        let settings = self.machine.settings().clone();
        self.machine = PlayerStateMachine::new(settings);
    }
}

#[derive(Resource)]
pub struct NetworkSync {
    pub handler: NetworkSyncHandler<Entity>,
}

impl NetworkSync {
    pub fn attach(&mut self, session: Arc<dyn Session>) -> bool {
        self.handler.initialize(session)
    }
}

#[derive(Debug)]
enum SlotChange {
    Attach(Arc<dyn Session>),
    Detach,
}

/// Hands sessions from the round lifecycle to the frame loop.
///
/// The latest offer wins; it is applied at the start of the next sync pass.
#[derive(Resource, Debug, Clone, Default)]
pub struct SessionSlot {
    change: Arc<Mutex<Option<SlotChange>>>,
}

impl SessionSlot {
    pub fn offer(&self, session: Arc<dyn Session>) {
        *self.lock() = Some(SlotChange::Attach(session));
    }

    pub fn clear(&self) {
        *self.lock() = Some(SlotChange::Detach);
    }

    fn take(&self) -> Option<SlotChange> {
        self.lock().take()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<SlotChange>> {
        self.change.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum MinigameSet {
    Input,
    Player,
    Sync,
    Physics,
}

pub struct MinigamePlugin {
    pub sync: SyncSettings,
    pub player: PlayerSettings,
    pub rounds: RoundSettings,
}

impl Default for MinigamePlugin {
    fn default() -> Self {
        Self {
            sync: SyncSettings::default(),
            player: PlayerSettings::default(),
            rounds: RoundSettings::default(),
        }
    }
}

impl MinigamePlugin {
    /// Sections from `store`, defaults for anything unregistered.
    pub fn from_store(store: &SettingsStore) -> Self {
        Self {
            sync: section(store),
            player: section(store),
            rounds: section(store),
        }
    }
}

fn section<T>(store: &SettingsStore) -> T
where
    T: settings::Settings + serde::de::DeserializeOwned + Clone + Default,
{
    match store.get::<T>() {
        Ok(value) => (*value).clone(),
        Err(err) => {
            warn!(target: LOG_SYNC, "section {} unavailable, using defaults: {}", T::SECTION, err);
            T::default()
        }
    }
}

impl Plugin for MinigamePlugin {
    fn build(&self, app: &mut App) {
        let clock = Arc::new(ManualClock::new(0.0));
        app.init_resource::<Time>()
            .insert_resource(self.sync.clone())
            .insert_resource(self.player.clone())
            .insert_resource(self.rounds.clone())
            .insert_resource(MinigameClock(Arc::clone(&clock)))
            .init_resource::<InputState>()
            .init_resource::<SessionSlot>()
            .insert_resource(PlayerController {
                machine: PlayerStateMachine::new(self.player.clone()),
            })
            .insert_resource(NetworkSync {
                handler: NetworkSyncHandler::new(self.sync.clone(), clock),
            })
            .configure_sets(
                Update,
                (
                    MinigameSet::Input,
                    MinigameSet::Player,
                    MinigameSet::Sync,
                    MinigameSet::Physics,
                )
                    .chain(),
            )
            .add_systems(PreUpdate, follow_time)
            .add_systems(Update, poll_input.in_set(MinigameSet::Input))
            .add_systems(Update, drive_player.in_set(MinigameSet::Player))
            .add_systems(Update, sync_session.in_set(MinigameSet::Sync))
            .add_systems(Update, integrate_velocity.in_set(MinigameSet::Physics));
    }
}

fn follow_time(time: Res<Time>, clock: Res<MinigameClock>) {
    clock.0.set(time.elapsed().as_nanos() as f64 / 1_000_000.0);
}

/// Arrow keys or A/D to run, Space to jump.
fn keyboard_levels(keys: &ButtonInput<KeyCode>) -> RawInput {
    RawInput {
        left: keys.any_pressed([KeyCode::ArrowLeft, KeyCode::KeyA]),
        right: keys.any_pressed([KeyCode::ArrowRight, KeyCode::KeyD]),
        jump: keys.pressed(KeyCode::Space),
    }
}

/// An installed source wins over the keyboard.
fn poll_input(mut input: ResMut<InputState>, keys: Option<Res<ButtonInput<KeyCode>>>) {
    let InputState {
        translator,
        pending,
        source,
    } = &mut *input;
    match (source, keys) {
        (Some(source), _) => translator.poll_from(source.as_mut(), pending),
        (None, Some(keys)) => translator.translate(keyboard_levels(&keys), pending),
        (None, None) => {}
    }
}

struct EcsBody<'a> {
    velocity: &'a mut Vec2,
    grounded: bool,
    facing: &'a mut shared::Facing,
    animation: &'a mut String,
}

impl PlayerBody for EcsBody<'_> {
    fn is_grounded(&self) -> bool {
        self.grounded
    }

    fn velocity(&self) -> Vec2 {
        *self.velocity
    }

    fn set_velocity_x(&mut self, vx: f32) {
        self.velocity.x = vx;
    }

    fn set_velocity_y(&mut self, vy: f32) {
        self.velocity.y = vy;
    }

    fn set_facing(&mut self, facing: shared::Facing) {
        *self.facing = facing;
    }

    fn set_animation(&mut self, key: &'static str) {
        if self.animation.as_str() != key {
            *self.animation = key.to_string();
        }
    }
}

fn drive_player(
    mut input: ResMut<InputState>,
    mut controller: ResMut<PlayerController>,
    clock: Res<MinigameClock>,
    mut players: Query<
        (&mut Velocity, &Grounded, &mut Facing, &mut AnimationKey),
        With<LocalPlayer>,
    >,
) {
    let Ok((mut velocity, grounded, mut facing, mut animation)) = players.single_mut() else {
        // no avatar to steer
        input.pending.clear();
        return;
    };
    let now = clock.now_ms();
    let mut body = EcsBody {
        velocity: &mut velocity.linear,
        grounded: grounded.0,
        facing: &mut facing.0,
        animation: &mut animation.0,
    };
    for command in input.pending.drain(..) {
        controller.machine.process_command(command, &mut body, now);
    }
    controller.machine.update(&mut body, now);
}

/// The ECS world as seen by the sync handler.
struct WorldScene<'w> {
    world: &'w mut World,
}

impl WorldScene<'_> {
    fn spawn_at(&mut self, state: &EntityState, physics: bool) -> EntityWorldMut<'_> {
        self.world.spawn((
            Transform::from_xyz(state.x, state.y, 0.0)
                .with_rotation(Quat::from_rotation_z(state.angle)),
            Velocity {
                linear: Vec2::new(state.velocity_x, state.velocity_y),
            },
            Facing(state.facing),
            AnimationKey(state.animation_state.clone()),
            PhysicsDriven(physics),
        ))
    }
}

impl Scene for WorldScene<'_> {
    type Visual = Entity;

    fn spawn_local_player(&mut self, id: &EntityId, state: &EntityState) -> Entity {
        let mut entity = self.spawn_at(state, true);
        entity.insert((LocalPlayer { id: id.clone() }, Grounded(false)));
        entity.id()
    }

    fn spawn_remote_proxy(&mut self, id: &EntityId, kind: EntityKind, state: &EntityState) -> Entity {
        let mut entity = self.spawn_at(state, false);
        entity.insert(RemoteProxy {
            id: id.clone(),
            kind,
        });
        if kind == EntityKind::PhysicsObject {
            entity.insert(Grounded(false));
        }
        entity.id()
    }

    fn position(&self, visual: Entity) -> Vec2 {
        self.world
            .get::<Transform>(visual)
            .map_or(Vec2::ZERO, |t| t.translation.truncate())
    }

    fn velocity(&self, visual: Entity) -> Vec2 {
        self.world
            .get::<Velocity>(visual)
            .map_or(Vec2::ZERO, |v| v.linear)
    }

    fn angle(&self, visual: Entity) -> f32 {
        self.world
            .get::<Transform>(visual)
            .map_or(0.0, |t| t.rotation.to_euler(EulerRot::ZYX).0)
    }

    fn set_position(&mut self, visual: Entity, position: Vec2) {
        if let Some(mut transform) = self.world.get_mut::<Transform>(visual) {
            transform.translation.x = position.x;
            transform.translation.y = position.y;
        }
    }

    fn set_velocity(&mut self, visual: Entity, velocity: Vec2) {
        if let Some(mut current) = self.world.get_mut::<Velocity>(visual) {
            current.linear = velocity;
        }
    }

    fn set_physics_enabled(&mut self, visual: Entity, enabled: bool) {
        if let Some(mut physics) = self.world.get_mut::<PhysicsDriven>(visual) {
            physics.0 = enabled;
        }
    }

    fn apply_presentation(&mut self, visual: Entity, facing: shared::Facing, animation: &str) {
        if let Some(mut current) = self.world.get_mut::<Facing>(visual) {
            current.0 = facing;
        }
        if let Some(mut current) = self.world.get_mut::<AnimationKey>(visual) {
            if current.0 != animation {
                current.0 = animation.to_string();
            }
        }
    }

    fn destroy(&mut self, visual: Entity) {
        if let Err(err) = self.world.try_despawn(visual) {
            debug!(target: LOG_SYNC, "visual {:?} already gone: {}", visual, err);
        }
    }
}

fn sync_session(world: &mut World) {
    let change = world.resource::<SessionSlot>().take();
    world.resource_scope(|world, mut sync: Mut<NetworkSync>| {
        match change {
            Some(SlotChange::Attach(session)) => {
                if sync.attach(session) {
                    world.resource_mut::<PlayerController>().reset();
                }
            }
            Some(SlotChange::Detach) => sync.handler.detach(),
            None => {}
        }
        let mut scene = WorldScene { world };
        sync.handler.pump(&mut scene);
        sync.handler.update(&mut scene);
    });
}

fn integrate_velocity(
    time: Res<Time>,
    settings: Res<PlayerSettings>,
    mut bodies: Query<(&mut Transform, &mut Velocity, &PhysicsDriven, Option<&mut Grounded>)>,
) {
    let dt = time.delta_secs();
    for (mut transform, mut velocity, physics, grounded) in &mut bodies {
        if physics.0 {
            velocity.linear.y += settings.gravity * dt;
        }
        transform.translation.x += velocity.linear.x * dt;
        transform.translation.y += velocity.linear.y * dt;
        if !physics.0 {
            continue;
        }
        let on_floor = transform.translation.y >= settings.floor_y;
        if on_floor {
            transform.translation.y = settings.floor_y;
            velocity.linear.y = velocity.linear.y.min(0.0);
        }
        if let Some(mut grounded) = grounded {
            if grounded.0 != on_floor {
                grounded.0 = on_floor;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{RawInput, ScriptedInput};
    use crate::player::PlayerState;
    use shared::transport::LoopbackRoom;
    use shared::{Collection, RoomKey};
    use std::time::Duration;
    use uuid::Uuid;

    fn app() -> App {
        let mut app = App::new();
        app.add_plugins(MinigamePlugin::default());
        app
    }

    fn step(app: &mut App, frames: usize) {
        for _ in 0..frames {
            app.world_mut()
                .resource_mut::<Time>()
                .advance_by(Duration::from_millis(16));
            app.update();
        }
    }

    fn local_player(app: &mut App) -> Option<Entity> {
        app.world_mut()
            .query_filtered::<Entity, With<LocalPlayer>>()
            .iter(app.world())
            .next()
    }

    #[test]
    fn test_keyboard_feeds_translator_without_source() {
        let mut app = app();
        let mut keys = ButtonInput::<KeyCode>::default();
        keys.press(KeyCode::KeyA);
        app.insert_resource(keys);

        step(&mut app, 1);

        let input = app.world().resource::<InputState>();
        assert_eq!(
            input.translator.direction(),
            Some(crate::input::Direction::Left)
        );
    }

    #[test]
    fn test_clock_follows_bevy_time() {
        let mut app = app();
        step(&mut app, 3);
        let now = app.world().resource::<MinigameClock>().now_ms();
        assert!((now - 48.0).abs() < 1e-9, "clock at {now}");
    }

    #[test]
    fn test_plugin_registers_resources() {
        let app = app();
        assert!(app.world().contains_resource::<SyncSettings>());
        assert!(app.world().contains_resource::<PlayerSettings>());
        assert!(app.world().contains_resource::<RoundSettings>());
        assert!(app.world().contains_resource::<NetworkSync>());
        assert!(app.world().contains_resource::<SessionSlot>());
    }

    #[test]
    fn test_offered_session_spawns_visuals() {
        let mut app = app();
        let room = LoopbackRoom::new(RoomKey::from("m:round-1"));
        room.spawn(Collection::PhysicsObjects, "crate", EntityState::at(50.0, 10.0));
        let session = room.join(Uuid::new_v4());

        app.world().resource::<SessionSlot>().offer(session);
        step(&mut app, 1);

        assert!(local_player(&mut app).is_some());
        let proxies = app
            .world_mut()
            .query::<&RemoteProxy>()
            .iter(app.world())
            .count();
        assert_eq!(proxies, 1);

        room.despawn(Collection::PhysicsObjects, "crate");
        step(&mut app, 1);
        let proxies = app
            .world_mut()
            .query::<&RemoteProxy>()
            .iter(app.world())
            .count();
        assert_eq!(proxies, 0);

        app.world().resource::<SessionSlot>().clear();
        step(&mut app, 1);
        assert!(local_player(&mut app).is_none());
    }

    #[test]
    fn test_scripted_input_moves_local_player() {
        let mut app = app();
        let room = LoopbackRoom::new(RoomKey::from("m:round-1"));
        app.world()
            .resource::<SessionSlot>()
            .offer(room.join(Uuid::new_v4()));

        // land on the floor first
        step(&mut app, 120);
        assert_eq!(
            app.world().resource::<PlayerController>().machine.state(),
            PlayerState::Idle
        );

        app.world_mut()
            .resource_mut::<InputState>()
            .set_source(ScriptedInput::default().hold(RawInput::right(), 10));
        step(&mut app, 5);

        let player = local_player(&mut app).unwrap();
        let velocity = app.world().get::<Velocity>(player).unwrap();
        assert_eq!(velocity.linear.x, PlayerSettings::default().run_speed);
        assert_eq!(
            app.world().get::<Facing>(player).unwrap().0,
            shared::Facing::Right
        );
        assert_eq!(app.world().get::<AnimationKey>(player).unwrap().0, "run");
    }

    #[test]
    fn test_gravity_stops_at_floor() {
        let mut app = app();
        let body = app
            .world_mut()
            .spawn((
                Transform::from_xyz(0.0, 0.0, 0.0),
                Velocity::default(),
                PhysicsDriven(true),
                Grounded(false),
            ))
            .id();
        step(&mut app, 200);

        let floor = PlayerSettings::default().floor_y;
        assert_eq!(app.world().get::<Transform>(body).unwrap().translation.y, floor);
        assert!(app.world().get::<Grounded>(body).unwrap().0);
    }
}
