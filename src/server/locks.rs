use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use commsync_common::RoomId;
use tokio::sync::OwnedMutexGuard;

/// One async mutex per room.
///
/// Holding a room's guard serializes everything done under it for that room
/// only; other rooms proceed concurrently. Entries are created on first use
/// and live for the life of the process (rooms are never destroyed).
#[derive(Clone, Default)]
pub struct RoomLocks {
    inner: Arc<Mutex<HashMap<RoomId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl RoomLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, room: RoomId) -> OwnedMutexGuard<()> {
        let lock = {
            // A poisoned map still holds valid Arcs; recover rather than fail.
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(room).or_default())
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
