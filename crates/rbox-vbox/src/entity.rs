//! Per-entity state cache.
//!
//! Each entity (a VM or a server) owns one property map. Two locks guard
//! it:
//!
//! * `refresh_gate` serialises refreshes. `try_refresh` takes it without
//!   waiting and reports [`RefreshOutcome::Skipped`] when another refresh
//!   holds it; `refresh` waits for it.
//! * `properties` holds the last good map behind an `Arc`. The refresh
//!   command runs without touching it; the parsed result is then swapped
//!   in whole under the write lock. Queries never observe a map that is
//!   still being built: they answer from the last completed refresh until
//!   the swap, and from the new one after it.
//!
//! A failed refresh leaves the previous map in place.

use crate::error::{VboxError, VboxResult};
use crate::transport::CommandOutput;
use crate::types::{PropertyMap, RunState, Transcript};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, RwLock};

/// What a non-blocking refresh did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// Another refresh was in flight; nothing was done.
    Skipped,
}

pub struct EntityState {
    refresh_gate: AsyncMutex<()>,
    properties: RwLock<Option<Arc<PropertyMap>>>,
    transcripts: Mutex<VecDeque<Transcript>>,
    transcript_capacity: usize,
    last_refreshed: Mutex<Option<DateTime<Utc>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EntityState {
    pub fn new(transcript_capacity: usize) -> Self {
        Self {
            refresh_gate: AsyncMutex::new(()),
            properties: RwLock::new(None),
            transcripts: Mutex::new(VecDeque::with_capacity(transcript_capacity)),
            transcript_capacity,
            last_refreshed: Mutex::new(None),
        }
    }

    // ── Refresh ──────────────────────────────────────────────────────

    /// Refresh unless one is already running.
    pub async fn try_refresh<F, Fut>(&self, load: F) -> VboxResult<RefreshOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = VboxResult<PropertyMap>>,
    {
        let Ok(_gate) = self.refresh_gate.try_lock() else {
            return Ok(RefreshOutcome::Skipped);
        };
        let map = load().await?;
        self.replace(map).await;
        Ok(RefreshOutcome::Refreshed)
    }

    /// Refresh, waiting for any running refresh to finish first.
    pub async fn refresh<F, Fut>(&self, load: F) -> VboxResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = VboxResult<PropertyMap>>,
    {
        let _gate = self.refresh_gate.lock().await;
        let map = load().await?;
        self.replace(map).await;
        Ok(())
    }

    /// Fold extra keys into the current map without dropping the rest.
    pub async fn refresh_merge<F, Fut>(&self, load: F) -> VboxResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = VboxResult<PropertyMap>>,
    {
        let _gate = self.refresh_gate.lock().await;
        let extra = load().await?;
        let mut slot = self.properties.write().await;
        let mut merged = slot.as_deref().cloned().unwrap_or_default();
        merged.extend(extra);
        *slot = Some(Arc::new(merged));
        Ok(())
    }

    async fn replace(&self, map: PropertyMap) {
        *self.properties.write().await = Some(Arc::new(map));
        *lock(&self.last_refreshed) = Some(Utc::now());
    }

    /// Whether a refresh currently holds the gate.
    pub fn is_refreshing(&self) -> bool {
        self.refresh_gate.try_lock().is_err()
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// The last good map, or `None` if never populated.
    pub async fn snapshot(&self) -> Option<Arc<PropertyMap>> {
        self.properties.read().await.clone()
    }

    pub async fn property(&self, key: &str) -> Option<String> {
        self.properties
            .read()
            .await
            .as_ref()
            .and_then(|m| m.get(key).cloned())
    }

    pub async fn run_state(&self) -> RunState {
        self.property("VMState")
            .await
            .map(|v| RunState::from_vm_state(&v))
            .unwrap_or_default()
    }

    pub async fn is_populated(&self) -> bool {
        self.properties.read().await.is_some()
    }

    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_refreshed)
    }

    // ── Transcripts ──────────────────────────────────────────────────

    pub fn record(&self, transcript: Transcript) {
        if self.transcript_capacity == 0 {
            return;
        }
        let mut ring = lock(&self.transcripts);
        while ring.len() >= self.transcript_capacity {
            ring.pop_front();
        }
        ring.push_back(transcript);
    }

    pub fn record_output(&self, output: &CommandOutput) {
        self.record(Transcript {
            at: Utc::now(),
            command: output.command.clone(),
            exit_code: output.exit_code,
            lines: output.lines.clone(),
            ok: output.success(),
        });
    }

    /// Record a command that never produced output.
    pub fn record_failure(&self, command: &str, error: &VboxError) {
        self.record(Transcript {
            at: Utc::now(),
            command: command.to_string(),
            exit_code: error.exit_code,
            lines: std::iter::once(error.message.clone())
                .chain(error.details.iter().cloned())
                .collect(),
            ok: false,
        });
    }

    /// Recent transcripts, oldest first.
    pub fn transcripts(&self) -> Vec<Transcript> {
        lock(&self.transcripts).iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn map(pairs: &[(&str, &str)]) -> PropertyMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn never_populated_reads_none() {
        let state = EntityState::new(4);
        assert!(state.snapshot().await.is_none());
        assert_eq!(state.run_state().await, RunState::Unknown);
        assert!(state.last_refreshed().is_none());
    }

    #[tokio::test]
    async fn refresh_replaces_wholesale() {
        let state = EntityState::new(4);
        state
            .refresh(|| async { Ok(map(&[("VMState", "running"), ("cpus", "2")])) })
            .await
            .unwrap();
        state
            .refresh(|| async { Ok(map(&[("VMState", "poweroff")])) })
            .await
            .unwrap();
        let snap = state.snapshot().await.unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(state.run_state().await, RunState::Off);
        assert!(state.last_refreshed().is_some());
    }

    #[tokio::test]
    async fn merge_keeps_existing_keys() {
        let state = EntityState::new(4);
        state
            .refresh(|| async { Ok(map(&[("cpus", "2")])) })
            .await
            .unwrap();
        state
            .refresh_merge(|| async { Ok(map(&[("ext.audio", "enabled")])) })
            .await
            .unwrap();
        assert_eq!(state.property("cpus").await.as_deref(), Some("2"));
        assert_eq!(state.property("ext.audio").await.as_deref(), Some("enabled"));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_last_good_map() {
        let state = EntityState::new(4);
        state
            .refresh(|| async { Ok(map(&[("cpus", "2")])) })
            .await
            .unwrap();
        let err = state
            .refresh(|| async { Err(VboxError::session("gone")) })
            .await;
        assert!(err.is_err());
        assert_eq!(state.property("cpus").await.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn concurrent_try_refresh_skips() {
        let state = Arc::new(EntityState::new(4));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let first = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                state
                    .try_refresh(|| async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok(map(&[("VMState", "running")]))
                    })
                    .await
            })
        };
        started_rx.await.unwrap();
        assert!(state.is_refreshing());

        for _ in 0..3 {
            let outcome = state
                .try_refresh(|| async { Ok(map(&[("VMState", "paused")])) })
                .await
                .unwrap();
            assert_eq!(outcome, RefreshOutcome::Skipped);
        }

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), RefreshOutcome::Refreshed);
        assert_eq!(state.run_state().await, RunState::Running);

        let again = state
            .try_refresh(|| async { Ok(map(&[("VMState", "paused")])) })
            .await
            .unwrap();
        assert_eq!(again, RefreshOutcome::Refreshed);
        assert_eq!(state.run_state().await, RunState::Paused);
    }

    #[tokio::test]
    async fn queries_answer_from_last_completed_refresh() {
        let state = Arc::new(EntityState::new(4));
        state
            .refresh(|| async { Ok(map(&[("cpus", "1")])) })
            .await
            .unwrap();
        let slow = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                state
                    .refresh(|| async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(map(&[("cpus", "4")]))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(state.property("cpus").await.as_deref(), Some("1"));
        slow.await.unwrap().unwrap();
        assert_eq!(state.property("cpus").await.as_deref(), Some("4"));
    }

    #[test]
    fn transcript_ring_is_bounded() {
        let state = EntityState::new(2);
        for i in 0..5 {
            state.record_failure(&format!("cmd{}", i), &VboxError::session("x"));
        }
        let t = state.transcripts();
        assert_eq!(t.len(), 2);
        assert_eq!(t[0].command, "cmd3");
        assert_eq!(t[1].command, "cmd4");
    }
}
