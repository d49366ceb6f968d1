use std::sync::Arc;

use futures::{stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::common::parsers::Server;
use crate::services::xray::probe::{ProbeError, ProbeResult, Prober};

/// Bounded-concurrency dispatcher: fans probe jobs across at most
/// `max_concurrent` workers, one batch at a time. Always yields exactly one
/// result per input server; once cancelled it stops launching jobs and the
/// remaining inputs come back as `Cancelled`.
pub struct ProbeScheduler {
    prober: Arc<dyn Prober>,
    max_concurrent: usize,
    batch_size: usize,
    cancel: CancellationToken,
}

impl ProbeScheduler {
    pub fn new(
        prober: Arc<dyn Prober>,
        max_concurrent: usize,
        batch_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        ProbeScheduler {
            prober,
            max_concurrent: max_concurrent.max(1),
            batch_size: batch_size.max(1),
            cancel,
        }
    }

    pub async fn run(&self, servers: &[Arc<Server>], probe_url: &str) -> Vec<ProbeResult> {
        let mut results = Vec::with_capacity(servers.len());

        for (index, batch) in servers.chunks(self.batch_size).enumerate() {
            if !self.cancel.is_cancelled() && servers.len() > self.batch_size {
                info!(
                    batch = index + 1,
                    servers = batch.len(),
                    probe_url,
                    "testing batch"
                );
            }

            let batch_results: Vec<ProbeResult> = stream::iter(batch.iter().cloned())
                .map(|server| {
                    let prober = Arc::clone(&self.prober);
                    let cancel = self.cancel.clone();
                    async move {
                        if cancel.is_cancelled() {
                            return ProbeResult::failed(server, probe_url, ProbeError::Cancelled);
                        }
                        prober.probe(server, probe_url).await
                    }
                })
                .buffer_unordered(self.max_concurrent)
                .collect()
                .await;

            results.extend(batch_results);
        }

        results
    }
}
