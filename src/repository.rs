//! Remote Service Repository.
//!
//! Thread-safe local store of the registrations this isolate exports and the
//! last known state of registrations imported from peers. Two writers exist:
//! local export/unexport calls from application code, and the broadcast
//! handler merging inbound events.
//!
//! Every read-modify-write sequence is serialized by one mutex scoped to the
//! repository. Mutating operations return the event to broadcast so the
//! caller can emit it after the lock is released; no lock is ever held across
//! network I/O. Reads hand out snapshot copies.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::error::Error;
use crate::model::{RemoteServiceEvent, RemoteServiceRegistration};

/// What a [`RemoteServiceRepository::merge`] call did to the store.
///
/// The broadcast handler maps outcomes to notifications: `Inserted` becomes
/// "service appeared" even when the event said UPDATED (self-healing against
/// out-of-order delivery), `AlreadyAbsent` produces no notification at all
/// (redundant UNREGISTERED is a valid no-op).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Removed,
    AlreadyAbsent,
}

#[derive(Default)]
struct RepositoryState {
    /// service id -> registration, for services this isolate exports.
    local: BTreeMap<String, RemoteServiceRegistration>,
    /// (sender isolate uid, service id) -> last known imported state.
    remote: BTreeMap<(String, String), RemoteServiceRegistration>,
}

/// The per-isolate registration store.
pub struct RemoteServiceRepository {
    local_uid: String,
    state: Mutex<RepositoryState>,
}

impl RemoteServiceRepository {
    /// Creates an empty repository owned by the given isolate.
    pub fn new(local_uid: impl Into<String>) -> Self {
        Self {
            local_uid: local_uid.into(),
            state: Mutex::new(RepositoryState::default()),
        }
    }

    /// UID of the isolate owning this repository.
    pub fn local_uid(&self) -> &str {
        &self.local_uid
    }

    /// Records a local export and returns the event to broadcast.
    ///
    /// Re-exporting an already known service id replaces the stored
    /// registration and yields an UPDATED event instead of a second
    /// REGISTERED.
    pub fn export(
        &self,
        mut registration: RemoteServiceRegistration,
    ) -> Result<RemoteServiceEvent, Error> {
        registration.sender = self.local_uid.clone();
        registration.validate()?;

        let previous = {
            let mut state = self.state.lock();
            state
                .local
                .insert(registration.service_id.clone(), registration.clone())
        };

        Ok(match previous {
            None => RemoteServiceEvent::Registered { registration },
            Some(_) => RemoteServiceEvent::Updated {
                registration,
                changed_properties: None,
            },
        })
    }

    /// Removes a local export. Returns the UNREGISTERED event to broadcast,
    /// or `None` when the service id was not exported.
    pub fn unexport(&self, service_id: &str) -> Option<RemoteServiceEvent> {
        let registration = self.state.lock().local.remove(service_id)?;
        Some(RemoteServiceEvent::Unregistered { registration })
    }

    /// Merges a property change into a local export and returns the UPDATED
    /// event carrying the changed subset, or `None` for an unknown service.
    pub fn update_properties(
        &self,
        service_id: &str,
        changes: BTreeMap<String, serde_json::Value>,
    ) -> Option<RemoteServiceEvent> {
        let registration = {
            let mut state = self.state.lock();
            let registration = state.local.get_mut(service_id)?;
            registration
                .service_properties
                .extend(changes.iter().map(|(k, v)| (k.clone(), v.clone())));
            registration.clone()
        };
        Some(RemoteServiceEvent::Updated {
            registration,
            changed_properties: Some(changes),
        })
    }

    /// Snapshot of the registrations this isolate exports.
    pub fn local_registrations(&self) -> Vec<RemoteServiceRegistration> {
        self.state.lock().local.values().cloned().collect()
    }

    /// Snapshot of the registrations imported from peers.
    pub fn remote_registrations(&self) -> Vec<RemoteServiceRegistration> {
        self.state.lock().remote.values().cloned().collect()
    }

    /// Last known state of one imported registration.
    pub fn remote_registration(
        &self,
        sender: &str,
        service_id: &str,
    ) -> Option<RemoteServiceRegistration> {
        self.state
            .lock()
            .remote
            .get(&(sender.to_string(), service_id.to_string()))
            .cloned()
    }

    /// Applies an inbound event to the imported map.
    ///
    /// - REGISTERED inserts; if the key is already present the call behaves
    ///   as an update (idempotent re-registration).
    /// - UPDATED falls back to an insert when the key is absent; otherwise
    ///   only the changed property subset is applied, and endpoints are
    ///   replaced only when the event explicitly carries a different,
    ///   non-empty list.
    /// - UNREGISTERED removes; removing an absent key is not an error.
    pub fn merge(&self, event: &RemoteServiceEvent) -> Result<MergeOutcome, Error> {
        match event {
            RemoteServiceEvent::Registered { registration } => {
                registration.validate()?;
                let key = (registration.sender.clone(), registration.service_id.clone());
                let previous = self.state.lock().remote.insert(key, registration.clone());
                Ok(match previous {
                    None => MergeOutcome::Inserted,
                    Some(_) => MergeOutcome::Updated,
                })
            }
            RemoteServiceEvent::Updated {
                registration,
                changed_properties,
            } => {
                let key = (registration.sender.clone(), registration.service_id.clone());
                let mut state = self.state.lock();
                match state.remote.entry(key) {
                    std::collections::btree_map::Entry::Vacant(slot) => {
                        registration.validate()?;
                        let mut inserted = registration.clone();
                        if let Some(changes) = changed_properties {
                            inserted.service_properties.extend(
                                changes.iter().map(|(k, v)| (k.clone(), v.clone())),
                            );
                        }
                        slot.insert(inserted);
                        Ok(MergeOutcome::Inserted)
                    }
                    std::collections::btree_map::Entry::Occupied(mut slot) => {
                        let existing = slot.get_mut();
                        match changed_properties {
                            Some(changes) => existing
                                .service_properties
                                .extend(changes.iter().map(|(k, v)| (k.clone(), v.clone()))),
                            None => {
                                existing.service_properties =
                                    registration.service_properties.clone()
                            }
                        }
                        if !registration.endpoints.is_empty()
                            && registration.endpoints != existing.endpoints
                        {
                            existing.endpoints = registration.endpoints.clone();
                        }
                        Ok(MergeOutcome::Updated)
                    }
                }
            }
            RemoteServiceEvent::Unregistered { registration } => {
                let key = (registration.sender.clone(), registration.service_id.clone());
                let removed = self.state.lock().remote.remove(&key);
                Ok(match removed {
                    Some(_) => MergeOutcome::Removed,
                    None => MergeOutcome::AlreadyAbsent,
                })
            }
        }
    }

    /// Drops every registration imported from the given isolate.
    ///
    /// Returns the removed registrations so the caller can synthesize
    /// UNREGISTERED notifications for them.
    pub fn purge_sender(&self, sender: &str) -> Vec<RemoteServiceRegistration> {
        let mut state = self.state.lock();
        let keys: Vec<(String, String)> = state
            .remote
            .keys()
            .filter(|(owner, _)| owner == sender)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| state.remote.remove(&key))
            .collect()
    }

    /// Empties both maps. Called at isolate shutdown.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.local.clear();
        state.remote.clear();
    }
}
