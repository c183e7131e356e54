//! In-memory session store.

use std::sync::RwLock;

use async_trait::async_trait;

use super::{SavedSession, SessionStore, StoreError};

/// In-memory store.
///
/// Useful for tests and embedders that manage persistence themselves.
/// Data is lost on restart.
#[derive(Default)]
pub struct MemorySessionStore {
    saved: RwLock<Option<SavedSession>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, session: &SavedSession) -> Result<(), StoreError> {
        *self
            .saved
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))? = Some(session.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<SavedSession>, StoreError> {
        Ok(self
            .saved
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .clone())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.saved
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .take();
        Ok(())
    }
}
