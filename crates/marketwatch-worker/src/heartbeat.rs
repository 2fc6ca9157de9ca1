//! Heartbeat (C9): extends the task-running lock's TTL while a job is in flight. Owned by the
//! worker — it has no lifecycle beyond a single job's.

use marketwatch_core::kv::KvStore;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};

pub struct Heartbeat {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Spawns a loop that, every `interval` (recommended 300s, far below the lock TTL), refreshes
    /// `lock_key`'s TTL provided the key still exists. If the key is found absent — meaning
    /// scheduler-side stuck-lock recovery (or TTL expiry) beat the job to it — the loop stops
    /// extending and lets the job's own cleanup run its course.
    pub fn spawn(kv: Arc<dyn KvStore>, lock_key: String, ttl: Duration, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            return;
                        }
                    }
                }
                if *stop_rx.borrow() {
                    return;
                }

                match kv.refresh_lock(&lock_key, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(
                            event = "marketwatch.heartbeat.lock_absent",
                            lock_key = %lock_key,
                            "task-running lock vanished under us, stopping heartbeat"
                        );
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(
                            event = "marketwatch.heartbeat.refresh_failed",
                            lock_key = %lock_key,
                            error = %err,
                            "failed to refresh task-running lock TTL"
                        );
                    }
                }
            }
        });

        Self {
            stop: stop_tx,
            handle,
        }
    }

    /// Stops the heartbeat and waits for its loop to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}
