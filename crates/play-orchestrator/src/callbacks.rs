//! Agent callback handlers.
//!
//! Each entry point is idempotent. Callers may supply a monotonic
//! sequence number; duplicates are accepted without re-applying side
//! effects and out-of-order sequences are dropped after logging.

use crate::{Orchestrator, OrchestratorError};
use chrono::Utc;
use play_persist::Transition;
use play_proto::{EndedEvent, Host, HostState, IdleEvent, SaveEvent, StartedEvent};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    Apply,
    Duplicate,
    OutOfOrder,
}

/// Classify an incoming sequence number against the host's high-water
/// mark. Events without a sequence always apply.
pub fn check_seq(host: &Host, seq: Option<u64>) -> SeqCheck {
    match (seq, host.last_seq) {
        (Some(incoming), Some(last)) if incoming == last => SeqCheck::Duplicate,
        (Some(incoming), Some(last)) if incoming < last => SeqCheck::OutOfOrder,
        _ => SeqCheck::Apply,
    }
}

impl Orchestrator {
    fn host_or_not_found(&self, host_id: &str) -> Result<Host, OrchestratorError> {
        self.hosts
            .get(host_id)
            .ok_or_else(|| OrchestratorError::NotFound(host_id.to_string()))
    }

    /// Gate an event on its sequence number. Returns `None` (with the
    /// current record) when the event must not be re-applied.
    fn admit_seq(&self, host: &Host, seq: Option<u64>, what: &str) -> Option<()> {
        match check_seq(host, seq) {
            SeqCheck::Apply => Some(()),
            SeqCheck::Duplicate => {
                debug!(host_id = %host.host_id, ?seq, what, "duplicate callback ignored");
                None
            }
            SeqCheck::OutOfOrder => {
                warn!(host_id = %host.host_id, ?seq, last_seq = ?host.last_seq, what, "out-of-order callback dropped");
                None
            }
        }
    }

    /// Agent reports the emulator started: READY → RUNNING.
    pub async fn agent_started(
        &self,
        host_id: &str,
        ev: StartedEvent,
    ) -> Result<Host, OrchestratorError> {
        let host = self.host_or_not_found(host_id)?;
        if self.admit_seq(&host, ev.seq, "started").is_none() {
            return Ok(host);
        }

        if host.state == HostState::Running {
            return Ok(self.hosts.mutate(host_id, |h| {
                h.last_seq = ev.seq.or(h.last_seq);
                h.last_activity = Some(ev.started_at);
            })?);
        }

        match self.hosts.transition(host_id, HostState::Running, |h| {
            h.last_seq = ev.seq.or(h.last_seq);
            h.last_activity = Some(ev.started_at);
            h.session_started_at = Some(ev.started_at);
        }) {
            Ok(t) => {
                info!(host_id, "session running");
                Ok(t.host().clone())
            }
            Err(play_persist::StoreError::InvalidTransition { from, .. }) => {
                // Stale callback for a host that already moved on.
                warn!(host_id, state = %from, "started callback ignored in current state");
                Ok(host)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Save-slot bookkeeping with the replace-not-increment rule:
    /// `accumulated = base + (wall_clock − session_started_at)`.
    /// Replaying events in any order converges on the one with the
    /// largest wall clock. Accepted even for stopped sessions.
    pub async fn agent_save_event(
        &self,
        host_id: &str,
        ev: SaveEvent,
    ) -> Result<Host, OrchestratorError> {
        let host = self.host_or_not_found(host_id)?;
        if self.admit_seq(&host, ev.seq, "save_event").is_none() {
            return Ok(host);
        }

        let session_start = host.session_started_at.unwrap_or(host.created_at);
        let played = (ev.wall_clock - session_start).num_seconds().max(0) as u64;
        let accumulated = ev.base_accumulated_seconds + played;

        let updated = self.hosts.mutate(host_id, |h| {
            h.last_seq = ev.seq.or(h.last_seq);
            h.last_activity = Some(ev.wall_clock.max(h.last_activity.unwrap_or(ev.wall_clock)));

            let stale = h
                .save_slot
                .as_ref()
                .is_some_and(|slot| slot.wall_clock >= ev.wall_clock);
            if !stale {
                h.save_slot = Some(play_proto::SaveSlot {
                    save_slot_id: ev.save_slot_id.clone(),
                    accumulated_seconds: accumulated,
                    wall_clock: ev.wall_clock,
                });
            }
        })?;

        // A save is session activity: an idle host is active again.
        if updated.state == HostState::Idle {
            let _ = self.hosts.transition(host_id, HostState::Running, |_| {});
        }

        Ok(self.hosts.get(host_id).unwrap_or(updated))
    }

    /// Agent reports no connected clients: RUNNING → IDLE.
    pub async fn agent_idle(
        &self,
        host_id: &str,
        ev: IdleEvent,
    ) -> Result<Host, OrchestratorError> {
        let host = self.host_or_not_found(host_id)?;
        if self.admit_seq(&host, ev.seq, "idle").is_none() {
            return Ok(host);
        }

        match self.hosts.transition(host_id, HostState::Idle, |h| {
            h.last_seq = ev.seq.or(h.last_seq);
            h.last_client_disconnect = Some(ev.last_client_disconnect);
        }) {
            Ok(t) => Ok(t.host().clone()),
            Err(play_persist::StoreError::InvalidTransition { from, .. }) => {
                debug!(host_id, state = %from, "idle callback ignored in current state");
                Ok(host)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Agent reports the session ended: stop the host.
    pub async fn agent_ended(
        &self,
        host_id: &str,
        ev: EndedEvent,
    ) -> Result<Host, OrchestratorError> {
        let host = self.host_or_not_found(host_id)?;
        if self.admit_seq(&host, ev.seq, "ended").is_none() {
            return Ok(host);
        }

        match self.hosts.transition(host_id, HostState::Stopped, |h| {
            h.last_seq = ev.seq.or(h.last_seq);
            h.last_activity = Some(ev.ended_at);
        }) {
            Ok(Transition::Applied(updated)) => {
                info!(host_id, "session ended; stopping host");
                self.spawn_driver_stop(updated.clone());
                Ok(updated)
            }
            Ok(Transition::AlreadyInTarget(updated)) => Ok(updated),
            Err(play_persist::StoreError::InvalidTransition { from, .. }) => {
                debug!(host_id, state = %from, "ended callback ignored in current state");
                Ok(host)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record a callback timestamp as host activity without any state
    /// change. Used when agents ping auxiliary endpoints.
    pub fn touch_activity(&self, host_id: &str) {
        if let Err(e) = self.hosts.mutate(host_id, |h| h.last_activity = Some(Utc::now())) {
            debug!(host_id, error = %e, "activity touch skipped");
        }
    }
}
