//! Quiesce primitive for controlled shutdowns.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Returned by [`ShutdownGuard::enter`] once shutdown has begun.
#[derive(Debug, Error)]
#[error("shutdown in progress")]
pub struct ShuttingDown;

/// Held by in-flight work; shutdown waits until every permit is dropped.
pub struct Permit {
    _guard: OwnedRwLockReadGuard<bool>,
}

/// Coordinates work against shutdown: no new work starts after shutdown
/// begins, and shutdown waits for in-flight work to drain.
pub struct ShutdownGuard {
    lock: Arc<RwLock<bool>>,
    write: Mutex<Option<OwnedRwLockWriteGuard<bool>>>,
}

impl Default for ShutdownGuard {
    fn default() -> Self {
        ShutdownGuard {
            lock: Arc::new(RwLock::new(false)),
            write: Mutex::new(None),
        }
    }
}

impl ShutdownGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a permit to do work. Fails once shutdown has begun.
    pub async fn enter(&self) -> Result<Permit, ShuttingDown> {
        let guard = self.lock.clone().read_owned().await;
        if *guard {
            return Err(ShuttingDown);
        }
        Ok(Permit { _guard: guard })
    }

    /// Begin shutting down: blocks until current permit holders finish, then
    /// bars new entries.
    pub async fn begin_shutdown(&self) {
        let mut guard = self.lock.clone().write_owned().await;
        *guard = true;
        *self.write.lock().await = Some(guard);
    }

    /// Release the exclusive hold taken by [`ShutdownGuard::begin_shutdown`].
    pub async fn complete_shutdown(&self) {
        self.write.lock().await.take();
    }
}
