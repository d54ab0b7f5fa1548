//! Routes session diffs into the scene, the interpolators and the arbiter.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use bevy::math::Vec2;
use shared::{
    ClientMessage, Collection, DisconnectReason, EntityId, EntityState, ParticipantId, Session,
    SessionEvent,
};
use tracing::{debug, info, warn};

use super::authority::{AuthorityArbiter, ContactDecision};
use super::interpolation::{Correction, SnapshotInterpolator, velocity_correction};
use super::scene::{EntityKind, Scene};
use crate::LOG_SYNC;
use crate::clock::Clock;
use crate::config::SyncSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnershipMode {
    /// Simulated here, pushed upstream.
    LocalAuthoritative,
    /// Follows received snapshots.
    InterpolatedRemote,
}

/// A session entity with a visual in the scene.
#[derive(Debug)]
pub struct TrackedEntity<V> {
    pub id: EntityId,
    pub collection: Collection,
    pub kind: EntityKind,
    pub mode: OwnershipMode,
    pub interpolator: SnapshotInterpolator,
    pub visual: V,
    /// Re-announced since the last reconnect.
    confirmed: bool,
}

/// Keeps the scene in step with one session at a time.
///
/// Events are pulled with [`Self::pump`] once per frame; [`Self::update`]
/// then moves remote entities and pushes locally held poses. Handlers bound
/// to a left session go inert: a closed session yields nothing.
pub struct NetworkSyncHandler<V> {
    settings: SyncSettings,
    clock: Arc<dyn Clock>,
    session: Option<Arc<dyn Session>>,
    attached: bool,
    frozen: bool,
    reconnecting: bool,
    tracked: HashMap<EntityId, TrackedEntity<V>>,
    /// Visuals of a replaced session, destroyed on the next pump.
    retired: Vec<V>,
    local_player: Option<EntityId>,
    arbiter: AuthorityArbiter,
    scratch: Vec<SessionEvent>,
}

impl<V: Copy + Debug> NetworkSyncHandler<V> {
    pub fn new(settings: SyncSettings, clock: Arc<dyn Clock>) -> Self {
        let arbiter = AuthorityArbiter::new(ParticipantId::nil(), &settings);
        Self {
            settings,
            clock,
            session: None,
            attached: false,
            frozen: false,
            reconnecting: false,
            tracked: HashMap::new(),
            retired: Vec::new(),
            local_player: None,
            arbiter,
            scratch: Vec::new(),
        }
    }

    /// Bind to `session`. Returns false if it is already the bound session.
    ///
    /// Everything tracked for a previous session is torn down on the next
    /// pump. Listening starts once the session reports its state as synced.
    pub fn initialize(&mut self, session: Arc<dyn Session>) -> bool {
        if let Some(current) = &self.session {
            if current.id() == session.id() {
                debug!(target: LOG_SYNC, "{} already attached, ignoring", session.id());
                return false;
            }
            info!(target: LOG_SYNC, "replacing {} with {}", current.id(), session.id());
        }
        self.retire_all();
        self.arbiter.reset(session.local_participant());
        self.session = Some(session);
        true
    }

    /// Drop the bound session and tear its entities down on the next pump.
    pub fn detach(&mut self) {
        if let Some(session) = self.session.take() {
            info!(target: LOG_SYNC, "detached from {}", session.id());
        }
        self.retire_all();
    }

    fn retire_all(&mut self) {
        self.retired
            .extend(self.tracked.drain().map(|(_, tracked)| tracked.visual));
        self.local_player = None;
        self.attached = false;
        self.frozen = false;
        self.reconnecting = false;
        self.scratch.clear();
    }

    pub fn session(&self) -> Option<&Arc<dyn Session>> {
        self.session.as_ref()
    }

    fn open_session(&self) -> Option<Arc<dyn Session>> {
        self.session.as_ref().filter(|s| s.is_open()).cloned()
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn arbiter(&self) -> &AuthorityArbiter {
        &self.arbiter
    }

    pub fn tracked(&self, id: &EntityId) -> Option<&TrackedEntity<V>> {
        self.tracked.get(id)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    pub fn local_player(&self) -> Option<&EntityId> {
        self.local_player.as_ref()
    }

    pub fn local_player_visual(&self) -> Option<V> {
        self.local_player
            .as_ref()
            .and_then(|id| self.tracked.get(id))
            .map(|t| t.visual)
    }

    /// Pull and apply everything the session delivered since the last call.
    pub fn pump<S: Scene<Visual = V>>(&mut self, scene: &mut S) {
        for visual in self.retired.drain(..) {
            scene.destroy(visual);
        }

        let Some(session) = self.open_session() else {
            return;
        };

        if !self.attached {
            if !session.is_synced() {
                return;
            }
            // the table covers a burst delivered before we listened; queued
            // duplicates are absorbed by the created-guard
            let entries = session.entities();
            info!(
                target: LOG_SYNC,
                "attached to {} in {} with {} entities", session.id(), session.room(), entries.len()
            );
            self.attached = true;
            for entry in entries {
                self.on_add(scene, entry.collection, entry.id, entry.state);
            }
        }

        let mut events = std::mem::take(&mut self.scratch);
        session.poll_events(&mut events);
        for event in events.drain(..) {
            self.dispatch(scene, event);
        }
        self.scratch = events;
    }

    fn dispatch<S: Scene<Visual = V>>(&mut self, scene: &mut S, event: SessionEvent) {
        match event {
            SessionEvent::Added {
                collection,
                id,
                state,
            } => self.on_add(scene, collection, id, state),
            SessionEvent::Changed { id, state, .. } => self.on_change(scene, &id, &state),
            SessionEvent::Removed { id, .. } => self.on_remove(scene, &id),
            SessionEvent::Synced => {
                if self.reconnecting {
                    self.finish_resync(scene);
                }
            }
            SessionEvent::Disconnected { reason } => self.freeze(scene, reason),
            SessionEvent::Reconnected => {
                info!(target: LOG_SYNC, "session reconnected, rebuilding tracking");
                self.reconnecting = true;
                for tracked in self.tracked.values_mut() {
                    tracked.confirmed = false;
                }
            }
        }
    }

    /// A new entity appeared in the session.
    pub fn on_add<S: Scene<Visual = V>>(
        &mut self,
        scene: &mut S,
        collection: Collection,
        id: EntityId,
        state: EntityState,
    ) {
        if let Some(tracked) = self.tracked.get_mut(&id) {
            if self.reconnecting {
                tracked.confirmed = true;
                self.on_change(scene, &id, &state);
            } else {
                debug!(target: LOG_SYNC, "{} already created", id);
            }
            return;
        }

        let kind = EntityKind::from(collection);
        let local = self.arbiter.local();
        let held_locally = state.owner_id == Some(local);
        let is_local_player = kind == EntityKind::Player && held_locally;

        let visual = if is_local_player {
            scene.spawn_local_player(&id, &state)
        } else {
            let visual = scene.spawn_remote_proxy(&id, kind, &state);
            scene.set_physics_enabled(visual, held_locally);
            visual
        };
        scene.apply_presentation(visual, state.facing, &state.animation_state);
        self.arbiter.on_holder_broadcast(&id, state.owner_id);

        let mut interpolator = SnapshotInterpolator::new(&self.settings, Arc::clone(&self.clock));
        interpolator.add_snapshot(state.x, state.y);

        let mode = if held_locally {
            OwnershipMode::LocalAuthoritative
        } else {
            OwnershipMode::InterpolatedRemote
        };
        debug!(target: LOG_SYNC, "created {:?} {} ({:?})", kind, id, mode);

        if is_local_player {
            self.local_player = Some(id.clone());
        }
        self.tracked.insert(
            id.clone(),
            TrackedEntity {
                id,
                collection,
                kind,
                mode,
                interpolator,
                visual,
                confirmed: true,
            },
        );
    }

    /// An entity's replicated state changed.
    pub fn on_change<S: Scene<Visual = V>>(&mut self, scene: &mut S, id: &EntityId, state: &EntityState) {
        if !self.tracked.contains_key(id) {
            debug!(target: LOG_SYNC, "change for untracked {}", id);
            return;
        }
        let local = self.arbiter.local();
        let holder_changed = self.arbiter.on_holder_broadcast(id, state.owner_id);
        let Some(tracked) = self.tracked.get_mut(id) else {
            return;
        };

        if holder_changed && tracked.kind != EntityKind::Player {
            let held_locally = state.owner_id == Some(local);
            tracked.mode = if held_locally {
                OwnershipMode::LocalAuthoritative
            } else {
                tracked.interpolator.reset();
                OwnershipMode::InterpolatedRemote
            };
            scene.set_physics_enabled(tracked.visual, held_locally);
        }

        if tracked.mode == OwnershipMode::InterpolatedRemote {
            tracked.interpolator.add_snapshot(state.x, state.y);
            scene.apply_presentation(tracked.visual, state.facing, &state.animation_state);
        }
    }

    /// An entity left the session. Unknown ids are ignored.
    pub fn on_remove<S: Scene<Visual = V>>(&mut self, scene: &mut S, id: &EntityId) {
        let Some(tracked) = self.tracked.remove(id) else {
            debug!(target: LOG_SYNC, "remove for untracked {}", id);
            return;
        };
        scene.destroy(tracked.visual);
        self.arbiter.forget(id);
        if self.local_player.as_ref() == Some(id) {
            self.local_player = None;
        }
        debug!(target: LOG_SYNC, "destroyed {}", id);
    }

    fn freeze<S: Scene<Visual = V>>(&mut self, scene: &mut S, reason: DisconnectReason) {
        warn!(target: LOG_SYNC, "session disconnected ({:?}), freezing {} entities", reason, self.tracked.len());
        self.frozen = true;
        for tracked in self.tracked.values() {
            if tracked.mode == OwnershipMode::InterpolatedRemote {
                scene.set_velocity(tracked.visual, Vec2::ZERO);
            }
        }
    }

    fn finish_resync<S: Scene<Visual = V>>(&mut self, scene: &mut S) {
        let stale: Vec<EntityId> = self
            .tracked
            .values()
            .filter(|t| !t.confirmed)
            .map(|t| t.id.clone())
            .collect();
        for id in &stale {
            self.on_remove(scene, id);
        }
        self.reconnecting = false;
        self.frozen = false;
        info!(target: LOG_SYNC, "resynced, dropped {} stale entities", stale.len());
    }

    /// Per-frame: move remote entities and push locally held poses.
    pub fn update<S: Scene<Visual = V>>(&mut self, scene: &mut S) {
        if !self.attached || self.frozen {
            return;
        }
        let Some(session) = self.open_session() else {
            return;
        };
        let now = self.clock.now_ms();

        for tracked in self.tracked.values() {
            match tracked.mode {
                OwnershipMode::InterpolatedRemote => {
                    let Some(target) = tracked.interpolator.render() else {
                        continue;
                    };
                    if tracked.kind != EntityKind::PhysicsObject {
                        scene.set_position(tracked.visual, target);
                        continue;
                    }
                    let current = scene.position(tracked.visual);
                    match velocity_correction(current, target, &self.settings) {
                        Correction::Snap(position) => {
                            debug!(target: LOG_SYNC, "{} desynced, snapping", tracked.id);
                            scene.set_position(tracked.visual, position);
                            scene.set_velocity(tracked.visual, Vec2::ZERO);
                        }
                        Correction::Velocity(velocity) => scene.set_velocity(tracked.visual, velocity),
                        Correction::Stop => scene.set_velocity(tracked.visual, Vec2::ZERO),
                    }
                }
                OwnershipMode::LocalAuthoritative => {
                    if !self.arbiter.should_push(&tracked.id, now) {
                        continue;
                    }
                    let position = scene.position(tracked.visual);
                    let velocity = scene.velocity(tracked.visual);
                    let message = ClientMessage::PoseUpdate {
                        entity: tracked.id.clone(),
                        x: position.x,
                        y: position.y,
                        angle: scene.angle(tracked.visual),
                        velocity_x: velocity.x,
                        velocity_y: velocity.y,
                    };
                    if let Err(err) = session.send(message) {
                        debug!(target: LOG_SYNC, "pose push for {} failed: {}", tracked.id, err);
                    }
                }
            }
        }
    }

    /// Local contact with a shared object. Returns true if ownership was requested.
    pub fn report_contact(&mut self, object: &EntityId) -> bool {
        let Some(session) = self.open_session() else {
            return false;
        };
        match self.tracked.get(object) {
            Some(tracked) if tracked.kind == EntityKind::PhysicsObject => {}
            _ => return false,
        }
        if self.arbiter.on_contact(object, self.clock.now_ms()) != ContactDecision::Request {
            return false;
        }
        if let Err(err) = session.send(ClientMessage::AuthorityRequest {
            object: object.clone(),
        }) {
            warn!(target: LOG_SYNC, "authority request for {} not sent: {}", object, err);
        }
        true
    }

    /// One-shot hit on a shared object. Returns whether the message was sent.
    pub fn report_hit(&mut self, object: &EntityId, impulse: Vec2) -> bool {
        let Some(session) = self.open_session() else {
            return false;
        };
        match session.send(ClientMessage::ObjectHit {
            object: object.clone(),
            impulse_x: impulse.x,
            impulse_y: impulse.y,
        }) {
            Ok(()) => true,
            Err(err) => {
                warn!(target: LOG_SYNC, "hit on {} not sent: {}", object, err);
                false
            }
        }
    }
}
