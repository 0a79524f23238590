//! Idle-eviction watcher, one task per live engine.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tracing::Instrument;

use super::live::Engine;
use super::{CacheInner, Eviction};

/// Watch `engine`'s session count and evict it after `grace` without sessions.
///
/// The task ends once the engine is evicted or has left the cache some other
/// way. If the cache itself was dropped, the engine is sealed directly.
pub(crate) fn spawn(cache: Weak<CacheInner>, engine: Arc<Engine>, grace: Duration) {
    let span = tracing::debug_span!("idle_watcher", engine = engine.id(), path = %engine.path().display());
    tokio::spawn(
        async move {
            let mut active = engine.subscribe();
            loop {
                if idle(&mut active).await.is_err() {
                    return;
                }
                tracing::debug!(?grace, "Engine idle, grace period started");
                let expired = tokio::select! {
                    _ = tokio::time::sleep(grace) => true,
                    woke = busy(&mut active) => {
                        if woke.is_err() {
                            return;
                        }
                        false
                    }
                };
                if !expired {
                    tracing::debug!("Grace period cancelled by new session");
                    continue;
                }

                let Some(cache) = cache.upgrade() else {
                    // No cache left to report to; `seal` logs its own failure.
                    let _ = engine.seal().await;
                    return;
                };
                match CacheInner::evict_if_idle(&cache, &engine).await {
                    Ok(Eviction::Active) => continue,
                    Ok(Eviction::Evicted | Eviction::NotCached) | Err(_) => return,
                }
            }
        }
        .instrument(span),
    );
}

pub(crate) async fn idle(active: &mut watch::Receiver<usize>) -> Result<(), watch::error::RecvError> {
    active.wait_for(|n| *n == 0).await.map(|_| ())
}

/// Resolves on any change to the count, so a session that came and went
/// while the watcher slept still restarts the grace period.
async fn busy(active: &mut watch::Receiver<usize>) -> Result<(), watch::error::RecvError> {
    active.changed().await
}
