// Copyright (c) 2025, The Typebus Authors
// MIT License
// All rights reserved.

//! # Route Cache
//!
//! Sending a message first ensures its routing topology exists, which costs
//! several broker round-trips. Topology is effectively static, so the cache
//! remembers which keys were set up recently and skips the work inside a
//! fixed window. One lock covers both lookup and setup, so concurrent sends
//! for the same key perform the setup exactly once.

use crate::{connection::LongTermConnection, errors::MessagingError};
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::debug;

/// How long a completed setup stays valid before it is re-verified.
const CACHE_WINDOW: Duration = Duration::from_secs(60);

/// Remembers recently completed route setups.
pub struct RouteCache {
    long_term: Arc<LongTermConnection>,
    completed: tokio::sync::Mutex<HashMap<String, Instant>>,
}

impl RouteCache {
    /// Creates an empty cache tied to the long-term connection it should
    /// reset alongside.
    pub fn new(long_term: Arc<LongTermConnection>) -> RouteCache {
        RouteCache {
            long_term,
            completed: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Runs `action` unless it already completed for `key` inside the
    /// current window. The lock is held across the action, so a second
    /// caller for the same key waits and then skips.
    pub async fn ensure<F, Fut>(&self, key: &str, action: F) -> Result<(), MessagingError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), MessagingError>>,
    {
        let mut completed = self.completed.lock().await;
        if let Some(done_at) = completed.get(key) {
            if done_at.elapsed() < CACHE_WINDOW {
                return Ok(());
            }
        }

        debug!(key, "running route setup");
        action().await?;
        completed.insert(key.to_owned(), Instant::now());
        Ok(())
    }

    /// Forgets all completed setups and drops the long-term connection, so
    /// the next send re-verifies topology on a fresh channel.
    pub async fn reset(&self) {
        self.completed.lock().await.clear();
        self.long_term.reset().await;
    }
}

impl std::fmt::Debug for RouteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteCache").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> RouteCache {
        RouteCache::new(Arc::new(LongTermConnection::new(
            ConnectionConfig::default(),
            "test",
        )))
    }

    fn counting_setup(
        runs: &Arc<AtomicUsize>,
    ) -> impl Fn() -> std::future::Ready<Result<(), MessagingError>> + '_ {
        move || {
            runs.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn setup_runs_once_inside_the_window() {
        let cache = cache();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            cache
                .ensure("a.IThing", counting_setup(&runs))
                .await
                .unwrap();
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn setup_runs_again_after_the_window_elapses() {
        let cache = cache();
        let runs = Arc::new(AtomicUsize::new(0));

        cache
            .ensure("a.IThing", counting_setup(&runs))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        cache
            .ensure("a.IThing", counting_setup(&runs))
            .await
            .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_are_cached_independently() {
        let cache = cache();
        let runs = Arc::new(AtomicUsize::new(0));

        cache.ensure("a.IOne", counting_setup(&runs)).await.unwrap();
        cache.ensure("a.ITwo", counting_setup(&runs)).await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_setup_is_not_cached() {
        let cache = cache();
        let runs = Arc::new(AtomicUsize::new(0));

        let failing = {
            let runs = runs.clone();
            move || {
                runs.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Err(MessagingError::ConnectionError))
            }
        };
        assert!(cache.ensure("a.IThing", failing).await.is_err());

        cache
            .ensure("a.IThing", counting_setup(&runs))
            .await
            .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_forgets_completed_setups() {
        let cache = cache();
        let runs = Arc::new(AtomicUsize::new(0));

        cache
            .ensure("a.IThing", counting_setup(&runs))
            .await
            .unwrap();
        cache.reset().await;
        cache
            .ensure("a.IThing", counting_setup(&runs))
            .await
            .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
