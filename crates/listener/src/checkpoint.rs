//! In-process checkpoint store for stream consumers.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use binding::{CheckpointStore, ProviderError, StreamPosition};

/// Keeps committed positions in memory. Positions are lost on restart, so a
/// restarted consumer begins at the stream's configured starting point.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    positions: Mutex<HashMap<String, StreamPosition>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed position for `stream`, without going through the async port.
    pub fn position(&self, stream: &str) -> Option<StreamPosition> {
        self.positions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(stream)
            .cloned()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, stream: &str) -> Result<Option<StreamPosition>, ProviderError> {
        Ok(self.position(stream))
    }

    async fn commit(&self, stream: &str, position: &StreamPosition) -> Result<(), ProviderError> {
        self.positions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(stream.to_string(), position.clone());
        Ok(())
    }
}
