//! Lab registry: availability, connectivity, and current occupant.
//!
//! The registry is the source of truth for each [`Lab`]. Mutations are
//! staged on a copy, written through to the store, then committed, so a
//! failed write leaves the live record untouched.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::core::events::{EventBus, LabEvent};
use crate::core::model::{AgentMetrics, Lab, LabStatus};
use crate::core::{LabError, LabStore};
use crate::util::{duration_ms, LabId, SharedClock, UserId};

/// Proof that a lab was acquired for a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabLease {
    /// Acquired lab.
    pub lab_id: LabId,
    /// Occupant.
    pub user_id: UserId,
    /// Acquisition time (ms since epoch).
    pub acquired_at_ms: u128,
}

/// Outcome of an offline check on one lab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineCheck {
    /// Checked lab.
    pub lab_id: LabId,
    /// The lab was online before this check.
    pub went_offline: bool,
    /// The lab was moved to `offline` status by this check.
    pub marked_offline: bool,
    /// Occupant at the time of the check.
    pub occupant: Option<UserId>,
}

/// Registry of labs.
pub struct LabRegistry {
    labs: RwLock<HashMap<LabId, Arc<Mutex<Lab>>>>,
    store: Arc<dyn LabStore>,
    clock: SharedClock,
    events: EventBus,
    offline_after: Duration,
    offline_status_after_sweeps: u32,
}

impl LabRegistry {
    /// Create an empty registry.
    pub fn new(
        store: Arc<dyn LabStore>,
        clock: SharedClock,
        events: EventBus,
        offline_after: Duration,
        offline_status_after_sweeps: u32,
    ) -> Self {
        Self {
            labs: RwLock::new(HashMap::new()),
            store,
            clock,
            events,
            offline_after,
            offline_status_after_sweeps: offline_status_after_sweeps.max(1),
        }
    }

    /// Add or replace a lab.
    ///
    /// An operator override (`maintenance` or `offline`) persisted by an
    /// earlier run survives re-registration; everything else comes from
    /// `lab`.
    ///
    /// # Errors
    /// Returns [`LabError::Storage`] if the store cannot be read or written.
    pub fn register(&self, mut lab: Lab) -> Result<(), LabError> {
        let persisted = self
            .store
            .load_labs()?
            .into_iter()
            .find(|stored| stored.id == lab.id);
        if let Some(stored) = persisted {
            if matches!(stored.status, LabStatus::Maintenance | LabStatus::Offline) {
                tracing::info!(lab_id = %lab.id, status = ?stored.status, "restored operator status");
                lab.status = stored.status;
            }
        }
        self.store.save_lab(&lab)?;
        tracing::info!(lab_id = %lab.id, "lab registered");
        self.labs
            .write()
            .insert(lab.id.clone(), Arc::new(Mutex::new(lab)));
        Ok(())
    }

    fn entry(&self, lab_id: &str) -> Result<Arc<Mutex<Lab>>, LabError> {
        self.labs
            .read()
            .get(lab_id)
            .cloned()
            .ok_or_else(|| LabError::LabNotFound(lab_id.to_string()))
    }

    /// Snapshot of one lab.
    ///
    /// # Errors
    /// Returns [`LabError::LabNotFound`] for unknown labs.
    pub fn get(&self, lab_id: &str) -> Result<Lab, LabError> {
        Ok(self.entry(lab_id)?.lock().clone())
    }

    /// Snapshot of all labs, ordered by identifier.
    #[must_use]
    pub fn list(&self) -> Vec<Lab> {
        let entries: Vec<_> = self.labs.read().values().cloned().collect();
        let mut labs: Vec<Lab> = entries.iter().map(|l| l.lock().clone()).collect();
        labs.sort_by(|a, b| a.id.cmp(&b.id));
        labs
    }

    /// Identifiers of all labs.
    #[must_use]
    pub fn ids(&self) -> Vec<LabId> {
        let mut ids: Vec<_> = self.labs.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn commit(&self, slot: &mut Lab, next: Lab) -> Result<(), LabError> {
        self.store.save_lab(&next)?;
        let changed = slot.status != next.status || slot.is_online != next.is_online;
        *slot = next;
        if changed {
            self.events.publish(LabEvent::LabStatusChanged {
                lab_id: slot.id.clone(),
                status: slot.status,
                is_online: slot.is_online,
            });
        }
        Ok(())
    }

    /// Atomically claim an available, online lab for `user_id`.
    ///
    /// # Errors
    /// [`LabError::ResourceBusy`] if the lab is occupied or in maintenance,
    /// [`LabError::HardwareOffline`] if the agent is silent or the lab is
    /// marked offline.
    pub fn acquire(&self, lab_id: &str, user_id: &str) -> Result<LabLease, LabError> {
        let entry = self.entry(lab_id)?;
        let mut lab = entry.lock();
        match lab.status {
            LabStatus::Busy | LabStatus::Maintenance => {
                return Err(LabError::ResourceBusy(lab_id.to_string()))
            }
            LabStatus::Offline => return Err(LabError::HardwareOffline(lab_id.to_string())),
            LabStatus::Available if !lab.is_online => {
                return Err(LabError::HardwareOffline(lab_id.to_string()))
            }
            LabStatus::Available => {}
        }

        let mut next = lab.clone();
        next.status = LabStatus::Busy;
        next.current_user_id = Some(user_id.to_string());
        self.commit(&mut lab, next)?;
        tracing::info!(lab_id, user_id, "lab acquired");

        Ok(LabLease {
            lab_id: lab_id.to_string(),
            user_id: user_id.to_string(),
            acquired_at_ms: self.clock.now_ms(),
        })
    }

    /// Clear the occupant. Idempotent; returns whether anyone was released.
    ///
    /// A lab forced into maintenance or offline keeps that status.
    ///
    /// # Errors
    /// [`LabError::LabNotFound`] or [`LabError::Storage`].
    pub fn release(&self, lab_id: &str) -> Result<bool, LabError> {
        let entry = self.entry(lab_id)?;
        let mut lab = entry.lock();
        if lab.current_user_id.is_none() && lab.status != LabStatus::Busy {
            tracing::debug!(lab_id, "release on idle lab ignored");
            return Ok(false);
        }
        let mut next = lab.clone();
        next.current_user_id = None;
        if next.status == LabStatus::Busy {
            next.status = LabStatus::Available;
        }
        self.commit(&mut lab, next)?;
        tracing::info!(lab_id, "lab released");
        Ok(true)
    }

    /// Record an agent heartbeat. Returns whether the lab came back online.
    ///
    /// An `offline` status set by repeated sweeps is left for an operator.
    ///
    /// # Errors
    /// [`LabError::LabNotFound`] or [`LabError::Storage`].
    pub fn record_heartbeat(
        &self,
        lab_id: &str,
        agent_id: &str,
        metrics: AgentMetrics,
    ) -> Result<bool, LabError> {
        let entry = self.entry(lab_id)?;
        let mut lab = entry.lock();
        let was_online = lab.is_online;
        let mut next = lab.clone();
        next.last_heartbeat_ms = Some(self.clock.now_ms());
        next.is_online = true;
        next.offline_sweeps = 0;
        next.agent_id = Some(agent_id.to_string());
        next.last_metrics = Some(metrics);
        self.commit(&mut lab, next)?;
        if !was_online {
            tracing::info!(lab_id, agent_id, "lab agent online");
        }
        Ok(!was_online)
    }

    /// Mirror the live queue depth onto the lab record.
    ///
    /// # Errors
    /// [`LabError::LabNotFound`] or [`LabError::Storage`].
    pub fn set_queue_count(&self, lab_id: &str, count: usize) -> Result<(), LabError> {
        let entry = self.entry(lab_id)?;
        let mut lab = entry.lock();
        if lab.queue_count == count {
            return Ok(());
        }
        let mut next = lab.clone();
        next.queue_count = count;
        self.commit(&mut lab, next)
    }

    /// Operator override of a lab's availability.
    ///
    /// # Errors
    /// [`LabError::InvalidTransition`] when asked to set `busy` (only
    /// [`acquire`](Self::acquire) may), [`LabError::ResourceBusy`] while the
    /// lab is occupied.
    pub fn set_status(&self, lab_id: &str, status: LabStatus) -> Result<Lab, LabError> {
        let entry = self.entry(lab_id)?;
        let mut lab = entry.lock();
        if status == LabStatus::Busy {
            return Err(LabError::transition(lab.status, status));
        }
        if lab.current_user_id.is_some() {
            return Err(LabError::ResourceBusy(lab_id.to_string()));
        }
        let mut next = lab.clone();
        next.status = status;
        if status == LabStatus::Available {
            next.offline_sweeps = 0;
        }
        self.commit(&mut lab, next)?;
        tracing::info!(lab_id, ?status, "lab status set by operator");
        Ok(lab.clone())
    }

    /// Check one lab's heartbeat age against the offline threshold.
    ///
    /// Returns `None` while the heartbeat is fresh or the agent never
    /// connected. A stale lab is marked `is_online = false`; once it has been
    /// found stale on enough consecutive sweeps while idle, its status
    /// becomes `offline`.
    ///
    /// # Errors
    /// [`LabError::LabNotFound`] or [`LabError::Storage`].
    pub fn check_offline(&self, lab_id: &str) -> Result<Option<OfflineCheck>, LabError> {
        let now = self.clock.now_ms();
        let threshold = duration_ms(self.offline_after);
        let entry = self.entry(lab_id)?;
        let mut lab = entry.lock();
        let stale = lab
            .last_heartbeat_ms
            .is_some_and(|seen| now.saturating_sub(seen) > threshold);
        if !stale {
            return Ok(None);
        }

        let went_offline = lab.is_online;
        let mut next = lab.clone();
        next.is_online = false;
        next.offline_sweeps = next.offline_sweeps.saturating_add(1);
        let marked_offline = next.offline_sweeps >= self.offline_status_after_sweeps
            && next.current_user_id.is_none()
            && next.status == LabStatus::Available;
        if marked_offline {
            next.status = LabStatus::Offline;
        }
        let occupant = next.current_user_id.clone();
        self.commit(&mut lab, next)?;

        if went_offline {
            tracing::warn!(lab_id, "lab agent missed heartbeats, marked offline");
        }
        if marked_offline {
            tracing::error!(lab_id, "lab agent did not reconnect, lab moved to offline status");
        }
        Ok(Some(OfflineCheck {
            lab_id: lab_id.to_string(),
            went_offline,
            marked_offline,
            occupant,
        }))
    }
}
