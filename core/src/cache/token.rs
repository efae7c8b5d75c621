//! The single-flight build token (spec.md §4.6, §5, §7 IP4).

use std::sync::{Arc, OnceLock};

use tokio::sync::Notify;

use crate::error::Error;

use super::CacheEntry;

/// Transient, per-fingerprint. The first caller to create a token for
/// a given fingerprint becomes the builder; everyone else waits on
/// `notify` until the `OnceLock` is filled, then reads the shared
/// result — including the same `Arc<Error>` on failure, so concurrent
/// waiters never see duplicated or divergent error instances.
pub struct BuildToken {
    result: OnceLock<Result<CacheEntry, Arc<Error>>>,
    notify: Notify,
}

impl BuildToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            result: OnceLock::new(),
            notify: Notify::new(),
        })
    }

    /// Wait for the builder to finish, then return its (shared) result.
    pub async fn wait(&self) -> Result<CacheEntry, Arc<Error>> {
        loop {
            if let Some(result) = self.result.get() {
                return result.clone();
            }
            self.notify.notified().await;
        }
    }

    /// Called exactly once by the builder to publish the outcome and
    /// wake every waiter.
    pub fn complete(&self, result: Result<CacheEntry, Arc<Error>>) {
        let _ = self.result.set(result);
        self.notify.notify_waiters();
    }

    pub fn is_complete(&self) -> bool {
        self.result.get().is_some()
    }
}
