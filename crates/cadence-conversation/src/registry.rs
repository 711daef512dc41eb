//! The set of live sessions.

use crate::error::RegistryError;
use crate::session::Session;
use crate::settings::PipelineSettings;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Default upper bound on concurrently live sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 1024;

/// Owns every live [`Session`], keyed by id.
///
/// The map lock is only held for map operations; terminating a session
/// happens after its entry has been removed, outside the lock.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    settings: PipelineSettings,
    max_sessions: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(PipelineSettings::default(), DEFAULT_MAX_SESSIONS)
    }
}

impl SessionRegistry {
    pub fn new(settings: PipelineSettings, max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            settings,
            max_sessions,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.read().unwrap_or_else(|poisoned| {
            tracing::error!("session registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.write().unwrap_or_else(|poisoned| {
            tracing::error!("session registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Creates and registers an idle session.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateSession`] if `id` is taken (the
    /// existing session is left untouched) and
    /// [`RegistryError::CapacityExhausted`] when the registry is full.
    pub fn create(&self, id: impl Into<String>) -> Result<Arc<Session>, RegistryError> {
        let id = id.into();
        let mut sessions = self.write();
        if sessions.contains_key(&id) {
            return Err(RegistryError::DuplicateSession(id));
        }
        if sessions.len() >= self.max_sessions {
            return Err(RegistryError::CapacityExhausted(sessions.len()));
        }
        let session = Arc::new(Session::new(id.clone(), self.settings.clone()));
        sessions.insert(id.clone(), session.clone());
        tracing::info!(session_id = %id, live = sessions.len(), "session created");
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.read().get(id).cloned()
    }

    /// Unregisters and terminates a session. Removing an unknown id is a no-op.
    pub async fn remove(&self, id: &str) {
        let removed = self.write().remove(id);
        if let Some(session) = removed {
            session.terminate().await;
            tracing::info!(session_id = %id, "session removed");
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Removes and terminates every session, for graceful shutdown.
    pub async fn terminate_all(&self) {
        let drained: Vec<Arc<Session>> = self.write().drain().map(|(_, s)| s).collect();
        if drained.is_empty() {
            return;
        }
        tracing::info!(count = drained.len(), "terminating all sessions");
        let tasks: Vec<_> = drained
            .into_iter()
            .map(|session| tokio::spawn(async move { session.terminate().await }))
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("session shutdown task failed: {}", e);
            }
        }
    }
}
