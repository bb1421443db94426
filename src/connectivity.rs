use crate::error::FetchError;
use crate::solar_api::SolarApiClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Network reachability as seen by the synchronizer
pub trait Connectivity: Send + Sync {
    /// Point-in-time reachability
    fn is_reachable(&self) -> bool;

    /// Receiver notified whenever reachability flips. Drop it to unsubscribe.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Reachability flag fed either by the embedding application or by a health probe
pub struct ConnectivityMonitor {
    reachable: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initially_reachable: bool) -> Self {
        let (reachable, _) = watch::channel(initially_reachable);
        Self { reachable }
    }

    /// Records the current reachability. Subscribers only hear about flips.
    pub fn set_reachable(&self, reachable: bool) {
        let flipped = self.reachable.send_if_modified(|current| {
            if *current == reachable {
                false
            } else {
                *current = reachable;
                true
            }
        });
        if flipped {
            tracing::info!(
                "Network is now {}",
                if reachable { "reachable" } else { "unreachable" }
            );
        }
    }

    /// Polls the unauthenticated health endpoint every `period` and updates
    /// reachability from the result until `cancel` fires.
    pub fn spawn_probe(
        self: Arc<Self>,
        client: Arc<SolarApiClient>,
        period: Duration,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            tracing::debug!("Starting connectivity probe against {}", client.endpoint_url());
            let mut probe_interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = probe_interval.tick() => {}
                    _ = cancel.cancelled() => break,
                }
                // Any HTTP answer proves the network path works
                let reachable = match client.check_health().await {
                    Ok(_) => true,
                    Err(e) => !matches!(e, FetchError::Unreachable | FetchError::Timeout),
                };
                self.set_reachable(reachable);
            }
            tracing::debug!("Connectivity probe exiting");
        });
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity for ConnectivityMonitor {
    fn is_reachable(&self) -> bool {
        *self.reachable.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.reachable.subscribe()
    }
}
