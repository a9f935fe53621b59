//! Background liveness loop.

use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use crate::chunkserver::ChunkserverClient;
use crate::common::ChunkHandle;
use crate::master::chunk_manager::ChunkManager;
use crate::master::oplog::Oplog;

/// Handle to a running heartbeat task. Dropping it also ends the loop, without waiting.
pub struct Heartbeat {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// Signal the loop and wait for the current tick to finish.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "heartbeat task ended abnormally");
        }
    }
}

impl ChunkManager {
    /// Run `beat` every heartbeat interval. `after_purge` is called with the
    /// handles of every tick that purged chunks, once their purges are logged.
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        client: Arc<dyn ChunkserverClient>,
        oplog: Arc<Oplog>,
        after_purge: impl Fn(&[ChunkHandle]) + Send + 'static,
    ) -> Heartbeat {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let manager = Arc::clone(self);
        let period = manager.heartbeat_interval();

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(?period, "heartbeat started");
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let report = manager.beat(client.as_ref(), &oplog).await;
                        debug!(
                            responsive = report.responsive.len(),
                            dead = report.dead.len(),
                            replications = report.replications.len(),
                            purged = report.purged.len(),
                            "heartbeat tick"
                        );
                        if !report.purged.is_empty() {
                            after_purge(&report.purged);
                        }
                    }
                }
            }
            info!("heartbeat stopped");
        });

        Heartbeat { stop: Some(stop_tx), task }
    }
}
