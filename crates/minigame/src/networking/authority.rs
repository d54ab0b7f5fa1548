//! Single-writer authority over shared physics objects.
//!
//! The session decides who holds an object; this side only records what the
//! session broadcast, asks for ownership on contact and rate-limits both the
//! requests and the holder's pose pushes.

use std::collections::HashMap;

use shared::{EntityId, ParticipantId};
use tracing::{debug, info};

use crate::LOG_SYNC;
use crate::config::SyncSettings;

/// Known authority state of one object.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthorityClaim {
    pub object_id: EntityId,
    /// Holder as last broadcast by the session.
    pub holder_id: Option<ParticipantId>,
    /// When the local client last asked for ownership.
    pub requested_at: Option<f64>,
    pub cooldown_until: f64,
}

impl AuthorityClaim {
    fn new(object_id: EntityId) -> Self {
        Self {
            object_id,
            holder_id: None,
            requested_at: None,
            cooldown_until: f64::NEG_INFINITY,
        }
    }
}

/// What a contact with an object leads to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContactDecision {
    /// Send an authority request now.
    Request,
    HeldLocally,
    HeldRemotely,
    CoolingDown,
}

#[derive(Debug, Clone)]
pub struct AuthorityArbiter {
    local: ParticipantId,
    claims: HashMap<EntityId, AuthorityClaim>,
    last_push: HashMap<EntityId, f64>,
    cooldown_ms: f64,
    push_interval_ms: f64,
}

impl AuthorityArbiter {
    pub fn new(local: ParticipantId, settings: &SyncSettings) -> Self {
        Self {
            local,
            claims: HashMap::new(),
            last_push: HashMap::new(),
            cooldown_ms: settings.authority_cooldown_ms,
            push_interval_ms: settings.push_interval_ms(),
        }
    }

    pub fn local(&self) -> ParticipantId {
        self.local
    }

    /// Forget everything and act for `local` from now on.
    pub fn reset(&mut self, local: ParticipantId) {
        self.local = local;
        self.claims.clear();
        self.last_push.clear();
    }

    pub fn claim(&self, object: &EntityId) -> Option<&AuthorityClaim> {
        self.claims.get(object)
    }

    pub fn holder(&self, object: &EntityId) -> Option<ParticipantId> {
        self.claims.get(object).and_then(|c| c.holder_id)
    }

    pub fn is_local_authority(&self, object: &EntityId) -> bool {
        self.holder(object) == Some(self.local)
    }

    /// Local contact with `object`; decides whether to ask for ownership.
    ///
    /// Requests are spaced by the cooldown whether or not the previous one
    /// was answered.
    pub fn on_contact(&mut self, object: &EntityId, now_ms: f64) -> ContactDecision {
        let local = self.local;
        let cooldown = self.cooldown_ms;
        let claim = self
            .claims
            .entry(object.clone())
            .or_insert_with(|| AuthorityClaim::new(object.clone()));

        match claim.holder_id {
            Some(holder) if holder == local => ContactDecision::HeldLocally,
            Some(_) => ContactDecision::HeldRemotely,
            None if now_ms < claim.cooldown_until => ContactDecision::CoolingDown,
            None => {
                claim.requested_at = Some(now_ms);
                claim.cooldown_until = now_ms + cooldown;
                debug!(target: LOG_SYNC, "requesting authority over {}", object);
                ContactDecision::Request
            }
        }
    }

    /// Record the holder the session broadcast. Returns true if it changed.
    pub fn on_holder_broadcast(&mut self, object: &EntityId, holder: Option<ParticipantId>) -> bool {
        let claim = self
            .claims
            .entry(object.clone())
            .or_insert_with(|| AuthorityClaim::new(object.clone()));
        if claim.holder_id == holder {
            return false;
        }
        let previous = std::mem::replace(&mut claim.holder_id, holder);
        if holder == Some(self.local) {
            info!(target: LOG_SYNC, "authority over {} granted locally", object);
        } else if previous == Some(self.local) {
            info!(target: LOG_SYNC, "authority over {} lost", object);
            self.last_push.remove(object);
        }
        true
    }

    /// True if the local client holds `object` and the push rate allows a
    /// pose update now. Records the push when it returns true.
    pub fn should_push(&mut self, object: &EntityId, now_ms: f64) -> bool {
        if !self.is_local_authority(object) {
            return false;
        }
        match self.last_push.get(object) {
            Some(last) if now_ms - last < self.push_interval_ms => false,
            _ => {
                self.last_push.insert(object.clone(), now_ms);
                true
            }
        }
    }

    pub fn forget(&mut self, object: &EntityId) {
        self.claims.remove(object);
        self.last_push.remove(object);
    }
}
