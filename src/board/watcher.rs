//! Polling watcher for a task's plan document.
//!
//! The worker rewrites the file in place without locking, so a read may land
//! mid-write. Content is hashed and only a changed digest is parsed; a parse
//! or validation failure is treated as a torn read and skipped.

use std::path::PathBuf;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::plan::{PlanDocument, PlanSnapshot};

/// A validated snapshot for one task, sent to the board loop.
#[derive(Debug, Clone)]
pub struct PlanUpdate {
    pub task_id: String,
    pub snapshot: PlanSnapshot,
}

pub struct PlanWatcher {
    task_id: String,
    path: PathBuf,
    interval: Duration,
    tx: mpsc::Sender<PlanUpdate>,
    last_digest: Option<String>,
}

/// Running watcher; stops when [`WatcherHandle::stop`] is called or the
/// handle is dropped.
#[derive(Debug)]
pub struct WatcherHandle {
    pub path: PathBuf,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl PlanWatcher {
    pub fn new(
        task_id: impl Into<String>,
        path: PathBuf,
        interval: Duration,
        tx: mpsc::Sender<PlanUpdate>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            path,
            // `tokio::time::interval` panics on a zero period.
            interval: interval.max(Duration::from_millis(1)),
            tx,
            last_digest: None,
        }
    }

    pub fn spawn(self) -> WatcherHandle {
        let token = CancellationToken::new();
        let path = self.path.clone();
        let join = tokio::spawn(self.run(token.clone()));
        WatcherHandle { path, token, join }
    }

    async fn run(mut self, token: CancellationToken) {
        tracing::debug!(task_id = %self.task_id, path = %self.path.display(), "watching plan document");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(snapshot) = self.poll().await else {
                continue;
            };
            let update = PlanUpdate {
                task_id: self.task_id.clone(),
                snapshot,
            };
            if self.tx.send(update).await.is_err() {
                break;
            }
        }
        tracing::debug!(task_id = %self.task_id, "plan watcher stopped");
    }

    /// Read the file once. Returns a snapshot only when the content changed
    /// and validated.
    async fn poll(&mut self) -> Option<PlanSnapshot> {
        let bytes = tokio::fs::read(&self.path).await.ok()?;
        let digest = hex::encode(Sha256::digest(&bytes));
        if self.last_digest.as_deref() == Some(digest.as_str()) {
            return None;
        }
        self.last_digest = Some(digest);

        let content = String::from_utf8_lossy(&bytes);
        let document = match PlanDocument::parse(&content) {
            Ok(document) => document,
            Err(e) => {
                tracing::debug!(task_id = %self.task_id, error = %e, "plan document unreadable, probably mid-write");
                return None;
            }
        };
        match document.validate() {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::debug!(task_id = %self.task_id, error = %e, "discarding incomplete plan snapshot");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::models::SubtaskStatus;

    const PLAN: &str = r#"{"phases": [{"subtasks": [
        {"id": "1", "description": "Model", "status": "completed"},
        {"id": "2", "description": "Route", "status": "pending"}
    ]}]}"#;

    async fn recv(rx: &mut mpsc::Receiver<PlanUpdate>) -> Option<PlanUpdate> {
        tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_poll_emits_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("implementation_plan.json");
        let (tx, _rx) = mpsc::channel(8);
        let mut watcher = PlanWatcher::new("t1", path.clone(), Duration::from_millis(10), tx);

        assert!(watcher.poll().await.is_none(), "missing file yields nothing");

        std::fs::write(&path, PLAN).unwrap();
        let snapshot = watcher.poll().await.unwrap();
        assert_eq!(snapshot.subtasks.len(), 2);
        assert_eq!(snapshot.count(SubtaskStatus::Completed), 1);

        assert!(watcher.poll().await.is_none(), "unchanged content is not re-sent");
    }

    #[tokio::test]
    async fn test_poll_skips_torn_and_invalid_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("implementation_plan.json");
        let (tx, _rx) = mpsc::channel(8);
        let mut watcher = PlanWatcher::new("t1", path.clone(), Duration::from_millis(10), tx);

        std::fs::write(&path, &PLAN[..PLAN.len() / 2]).unwrap();
        assert!(watcher.poll().await.is_none());

        std::fs::write(&path, r#"{"phases": [{"name": "no subtasks yet"}]}"#).unwrap();
        assert!(watcher.poll().await.is_none());

        std::fs::write(&path, PLAN).unwrap();
        assert!(watcher.poll().await.is_some());
    }

    #[tokio::test]
    async fn test_zero_interval_still_polls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("implementation_plan.json");
        std::fs::write(&path, PLAN).unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        let handle = PlanWatcher::new("t1", path, Duration::ZERO, tx).spawn();
        assert!(recv(&mut rx).await.is_some());
        assert!(!handle.is_finished());
        handle.stop();
    }

    #[tokio::test]
    async fn test_spawned_watcher_sends_updates_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("implementation_plan.json");
        std::fs::write(&path, PLAN).unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        let handle = PlanWatcher::new("t1", path.clone(), Duration::from_millis(10), tx).spawn();
        let update = recv(&mut rx).await.expect("first snapshot");
        assert_eq!(update.task_id, "t1");

        handle.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_finished());
        std::fs::write(&path, PLAN.replace("pending", "completed")).unwrap();
        assert!(recv(&mut rx).await.is_none());
    }
}
