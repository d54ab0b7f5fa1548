//! Loopback session rooms for in-process multiplayer.
//!
//! A [`LoopbackRoom`] plays the authoritative side of a room without touching
//! the network stack: it owns the entity table, grants object authority and
//! fans state changes out to every joined [`LoopbackSession`]. This is used for
//! local play, the demo binary and tests.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::{
    ClientMessage, Collection, DisconnectReason, EntityEntry, EntityId, EntityState, IdGenerator,
    LOG_SESSION, ParticipantId, RoomKey, Session, SessionConnector, SessionError, SessionEvent,
    SessionId,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct SessionState {
    id: SessionId,
    room: RoomKey,
    participant: ParticipantId,
    synced: AtomicBool,
    open: AtomicBool,
    connected: AtomicBool,
    events: Mutex<VecDeque<SessionEvent>>,
}

impl SessionState {
    fn is_live(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connected.load(Ordering::SeqCst)
    }

    fn push_event(&self, event: SessionEvent) {
        if self.is_live() {
            lock(&self.events).push_back(event);
        }
    }
}

#[derive(Debug)]
struct RoomInner {
    entities: BTreeMap<(Collection, EntityId), EntityState>,
    members: Vec<Arc<SessionState>>,
    received: Vec<(ParticipantId, ClientMessage)>,
    deferred_sync: bool,
    drop_authority_requests: bool,
    spawn_players: bool,
}

impl Default for RoomInner {
    fn default() -> Self {
        Self {
            entities: BTreeMap::new(),
            members: Vec::new(),
            received: Vec::new(),
            deferred_sync: false,
            drop_authority_requests: false,
            spawn_players: true,
        }
    }
}

impl RoomInner {
    fn entries(&self) -> Vec<EntityEntry> {
        self.entities
            .iter()
            .map(|((collection, id), state)| EntityEntry {
                collection: *collection,
                id: id.clone(),
                state: state.clone(),
            })
            .collect()
    }

    /// Queue `event` on every synced member, optionally skipping one participant.
    fn broadcast(&self, event: &SessionEvent, exclude: Option<ParticipantId>) {
        for member in &self.members {
            if Some(member.participant) == exclude || !member.synced.load(Ordering::SeqCst) {
                continue;
            }
            member.push_event(event.clone());
        }
    }

    fn send_burst(&self, member: &SessionState) {
        for entry in self.entries() {
            member.push_event(SessionEvent::added(&entry));
        }
        member.push_event(SessionEvent::Synced);
        member.synced.store(true, Ordering::SeqCst);
    }

    fn member(&self, participant: ParticipantId) -> Option<&Arc<SessionState>> {
        self.members.iter().find(|m| m.participant == participant)
    }

    fn find_mut(&mut self, id: &EntityId) -> Option<(Collection, &mut EntityState)> {
        self.entities
            .iter_mut()
            .find(|((_, key), _)| key == id)
            .map(|((collection, _), state)| (*collection, state))
    }

    fn handle(&mut self, sender: ParticipantId, message: ClientMessage) {
        self.received.push((sender, message.clone()));

        match message {
            ClientMessage::PoseUpdate {
                entity,
                x,
                y,
                angle,
                velocity_x,
                velocity_y,
            } => {
                let Some((collection, state)) = self.find_mut(&entity) else {
                    debug!(target: LOG_SESSION, "pose update for unknown entity {}", entity);
                    return;
                };
                if state.owner_id != Some(sender) {
                    warn!(target: LOG_SESSION, "pose update for {} from non-holder {}", entity, sender);
                    return;
                }
                state.x = x;
                state.y = y;
                state.angle = angle;
                state.velocity_x = velocity_x;
                state.velocity_y = velocity_y;
                let event = SessionEvent::Changed {
                    collection,
                    id: entity,
                    state: state.clone(),
                };
                self.broadcast(&event, Some(sender));
            }
            ClientMessage::ObjectHit {
                object,
                impulse_x,
                impulse_y,
            } => {
                debug!(
                    target: LOG_SESSION,
                    "hit on {} by {} ({}, {})", object, sender, impulse_x, impulse_y
                );
            }
            ClientMessage::AuthorityRequest { object } => {
                if self.drop_authority_requests {
                    debug!(target: LOG_SESSION, "dropped authority request for {}", object);
                    return;
                }
                let Some((collection, state)) = self.find_mut(&object) else {
                    debug!(target: LOG_SESSION, "authority request for unknown object {}", object);
                    return;
                };
                if state.owner_id.is_some() {
                    debug!(target: LOG_SESSION, "authority request for {} denied: already held", object);
                    return;
                }
                state.owner_id = Some(sender);
                let event = SessionEvent::Changed {
                    collection,
                    id: object.clone(),
                    state: state.clone(),
                };
                info!(target: LOG_SESSION, "authority over {} granted to {}", object, sender);
                self.broadcast(&event, None);
            }
        }
    }

    /// Release every object held by `participant` and announce it.
    fn release_all(&mut self, participant: ParticipantId) {
        let mut released = Vec::new();
        for ((collection, id), state) in self.entities.iter_mut() {
            if *collection != Collection::Players && state.owner_id == Some(participant) {
                state.owner_id = None;
                released.push(SessionEvent::Changed {
                    collection: *collection,
                    id: id.clone(),
                    state: state.clone(),
                });
            }
        }
        for event in released {
            self.broadcast(&event, None);
        }
    }
}

#[derive(Debug)]
struct RoomState {
    key: RoomKey,
    ids: IdGenerator,
    inner: Mutex<RoomInner>,
}

/// Authoritative side of one loopback room.
///
/// Cloning yields another handle to the same room.
#[derive(Debug, Clone)]
pub struct LoopbackRoom {
    state: Arc<RoomState>,
}

impl LoopbackRoom {
    pub fn new(key: RoomKey) -> Self {
        Self::with_ids(key, IdGenerator::default())
    }

    fn with_ids(key: RoomKey, ids: IdGenerator) -> Self {
        Self {
            state: Arc::new(RoomState {
                key,
                ids,
                inner: Mutex::new(RoomInner::default()),
            }),
        }
    }

    pub fn key(&self) -> &RoomKey {
        &self.state.key
    }

    /// Hold back the initial state burst of new members until [`Self::complete_sync`].
    pub fn set_deferred_sync(&self, deferred: bool) {
        lock(&self.state.inner).deferred_sync = deferred;
    }

    /// Silently drop incoming authority requests (lossy link).
    pub fn set_drop_authority_requests(&self, drop: bool) {
        lock(&self.state.inner).drop_authority_requests = drop;
    }

    /// Whether joining spawns an avatar in the players collection.
    pub fn set_spawn_players(&self, spawn: bool) {
        lock(&self.state.inner).spawn_players = spawn;
    }

    /// Admit `participant` and hand out its session.
    pub fn join(&self, participant: ParticipantId) -> Arc<LoopbackSession> {
        let member = Arc::new(SessionState {
            id: SessionId::new(self.state.ids.next()),
            room: self.state.key.clone(),
            participant,
            synced: AtomicBool::new(false),
            open: AtomicBool::new(true),
            connected: AtomicBool::new(true),
            events: Mutex::new(VecDeque::new()),
        });

        let mut inner = lock(&self.state.inner);
        if inner.spawn_players {
            let id = EntityId::for_participant(participant);
            let mut state = EntityState::default().owned_by(participant);
            state.animation_state = "idle".to_string();
            inner
                .entities
                .insert((Collection::Players, id.clone()), state.clone());
            inner.broadcast(
                &SessionEvent::Added {
                    collection: Collection::Players,
                    id,
                    state,
                },
                None,
            );
        }
        inner.members.push(Arc::clone(&member));
        if !inner.deferred_sync {
            inner.send_burst(&member);
        }
        drop(inner);

        info!(
            target: LOG_SESSION,
            "{} joined room {} as {}", participant, self.state.key, member.id
        );
        Arc::new(LoopbackSession {
            member,
            room: Arc::clone(&self.state),
        })
    }

    /// Remove the member holding `session`. Unknown sessions are ignored.
    pub fn leave(&self, session: SessionId) {
        let mut inner = lock(&self.state.inner);
        let Some(index) = inner.members.iter().position(|m| m.id == session) else {
            debug!(target: LOG_SESSION, "leave for unknown {} in {}", session, self.state.key);
            return;
        };
        let member = inner.members.remove(index);
        member.open.store(false, Ordering::SeqCst);
        lock(&member.events).clear();

        let avatar = (Collection::Players, EntityId::for_participant(member.participant));
        if inner.entities.remove(&avatar).is_some() {
            inner.broadcast(
                &SessionEvent::Removed {
                    collection: avatar.0,
                    id: avatar.1,
                },
                None,
            );
        }
        inner.release_all(member.participant);
        info!(target: LOG_SESSION, "{} left room {}", member.participant, self.state.key);
    }

    /// Deliver the pending state burst to every member still waiting for it.
    pub fn complete_sync(&self) {
        let inner = lock(&self.state.inner);
        for member in &inner.members {
            if member.is_live() && !member.synced.load(Ordering::SeqCst) {
                inner.send_burst(member);
            }
        }
    }

    pub fn spawn(&self, collection: Collection, id: impl Into<EntityId>, state: EntityState) {
        let id = id.into();
        let mut inner = lock(&self.state.inner);
        inner
            .entities
            .insert((collection, id.clone()), state.clone());
        inner.broadcast(
            &SessionEvent::Added {
                collection,
                id,
                state,
            },
            None,
        );
    }

    /// Replace an entity's state. Returns false if the entity does not exist.
    pub fn update(&self, collection: Collection, id: impl Into<EntityId>, state: EntityState) -> bool {
        let id = id.into();
        let mut inner = lock(&self.state.inner);
        let Some(slot) = inner.entities.get_mut(&(collection, id.clone())) else {
            return false;
        };
        *slot = state.clone();
        inner.broadcast(
            &SessionEvent::Changed {
                collection,
                id,
                state,
            },
            None,
        );
        true
    }

    pub fn despawn(&self, collection: Collection, id: impl Into<EntityId>) -> bool {
        let id = id.into();
        let mut inner = lock(&self.state.inner);
        if inner.entities.remove(&(collection, id.clone())).is_none() {
            return false;
        }
        inner.broadcast(&SessionEvent::Removed { collection, id }, None);
        true
    }

    pub fn entity(&self, collection: Collection, id: &EntityId) -> Option<EntityState> {
        lock(&self.state.inner)
            .entities
            .get(&(collection, id.clone()))
            .cloned()
    }

    /// Clear the holder of `object` and announce it.
    pub fn release(&self, object: &EntityId) {
        let mut inner = lock(&self.state.inner);
        let Some((collection, state)) = inner.find_mut(object) else {
            return;
        };
        state.owner_id = None;
        let event = SessionEvent::Changed {
            collection,
            id: object.clone(),
            state: state.clone(),
        };
        inner.broadcast(&event, None);
    }

    /// Simulate a dropped connection of `participant`.
    pub fn disconnect(&self, participant: ParticipantId, reason: DisconnectReason) {
        let inner = lock(&self.state.inner);
        if let Some(member) = inner.member(participant) {
            member.push_event(SessionEvent::Disconnected { reason });
            member.connected.store(false, Ordering::SeqCst);
            member.synced.store(false, Ordering::SeqCst);
            warn!(target: LOG_SESSION, "{} disconnected from {}: {:?}", participant, self.state.key, reason);
        }
    }

    /// Restore a dropped connection and replay the current entity table.
    pub fn reconnect(&self, participant: ParticipantId) {
        let inner = lock(&self.state.inner);
        if let Some(member) = inner.member(participant) {
            if member.connected.swap(true, Ordering::SeqCst) {
                return;
            }
            member.push_event(SessionEvent::Reconnected);
            inner.send_burst(member);
            info!(target: LOG_SESSION, "{} reconnected to {}", participant, self.state.key);
        }
    }

    pub fn participants(&self) -> Vec<ParticipantId> {
        lock(&self.state.inner)
            .members
            .iter()
            .map(|m| m.participant)
            .collect()
    }

    /// Drains every message received from members so far.
    pub fn take_received(&self) -> Vec<(ParticipantId, ClientMessage)> {
        std::mem::take(&mut lock(&self.state.inner).received)
    }
}

/// Member side of a loopback room.
#[derive(Debug)]
pub struct LoopbackSession {
    member: Arc<SessionState>,
    room: Arc<RoomState>,
}

impl Session for LoopbackSession {
    fn id(&self) -> SessionId {
        self.member.id
    }

    fn room(&self) -> &RoomKey {
        &self.member.room
    }

    fn local_participant(&self) -> ParticipantId {
        self.member.participant
    }

    fn is_synced(&self) -> bool {
        self.member.synced.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.member.open.load(Ordering::SeqCst)
    }

    fn entities(&self) -> Vec<EntityEntry> {
        if !self.member.is_live() || !self.is_synced() {
            return Vec::new();
        }
        lock(&self.room.inner).entries()
    }

    fn poll_events(&self, output: &mut Vec<SessionEvent>) {
        output.extend(lock(&self.member.events).drain(..));
    }

    fn send(&self, message: ClientMessage) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::Closed);
        }
        if !self.member.connected.load(Ordering::SeqCst) {
            return Err(SessionError::NetworkUnavailable("connection lost".into()));
        }
        lock(&self.room.inner).handle(self.member.participant, message);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct HubState {
    ids: IdGenerator,
    rooms: Mutex<HashMap<RoomKey, LoopbackRoom>>,
}

/// Registry of loopback rooms shared by any number of connectors.
#[derive(Debug, Clone, Default)]
pub struct LoopbackHub {
    state: Arc<HubState>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the room for `key`, creating it on first use.
    pub fn room(&self, key: &RoomKey) -> LoopbackRoom {
        lock(&self.state.rooms)
            .entry(key.clone())
            .or_insert_with(|| LoopbackRoom::with_ids(key.clone(), self.state.ids.clone()))
            .clone()
    }

    pub fn existing_room(&self, key: &RoomKey) -> Option<LoopbackRoom> {
        lock(&self.state.rooms).get(key).cloned()
    }

    /// A connector joining rooms of this hub as `participant`.
    pub fn connector(&self, participant: ParticipantId) -> LoopbackConnector {
        LoopbackConnector {
            hub: self.clone(),
            participant,
            available: AtomicBool::new(true),
            join_delay: Mutex::new(Duration::ZERO),
        }
    }
}

/// [`SessionConnector`] over a [`LoopbackHub`].
#[derive(Debug)]
pub struct LoopbackConnector {
    hub: LoopbackHub,
    participant: ParticipantId,
    available: AtomicBool,
    join_delay: Mutex<Duration>,
}

impl LoopbackConnector {
    pub fn participant(&self) -> ParticipantId {
        self.participant
    }

    pub fn hub(&self) -> &LoopbackHub {
        &self.hub
    }

    /// While unavailable, join and leave fail with `NetworkUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Latency applied to every join.
    pub fn set_join_delay(&self, delay: Duration) {
        *lock(&self.join_delay) = delay;
    }

    fn ensure_available(&self, room: &RoomKey) -> Result<(), SessionError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SessionError::NetworkUnavailable(format!(
                "room {room} unreachable"
            )))
        }
    }
}

#[async_trait]
impl SessionConnector for LoopbackConnector {
    async fn join(&self, room: &RoomKey) -> Result<Arc<dyn Session>, SessionError> {
        let delay = *lock(&self.join_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.ensure_available(room)?;
        let session: Arc<dyn Session> = self.hub.room(room).join(self.participant);
        Ok(session)
    }

    async fn leave(&self, session: &Arc<dyn Session>) -> Result<(), SessionError> {
        self.ensure_available(session.room())?;
        let Some(room) = self.hub.existing_room(session.room()) else {
            return Err(SessionError::Rejected(format!(
                "unknown room {}",
                session.room()
            )));
        };
        room.leave(session.id());
        Ok(())
    }
}
