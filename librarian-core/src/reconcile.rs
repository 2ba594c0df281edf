use crate::ledger::{CapacityLedger, Reservation, UsageCorrection};
use crate::registry::StoreRegistry;
use crate::transfer::UsageProbe;
use crate::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval: Duration,
    pub drift_tolerance_bytes: u64,
    pub reservation_ttl: Duration,
    pub resolved_retention: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            drift_tolerance_bytes: 0,
            reservation_ttl: Duration::from_secs(3600),
            resolved_retention: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct SweepReport {
    pub expired: Vec<Reservation>,
    pub corrections: Vec<UsageCorrection>,
    pub pruned: usize,
    pub probe_failures: Vec<(String, String)>,
}

/// Background correction of ledger usage against what stores report, plus
/// expiry of abandoned pending reservations. Store reports win, except for
/// bytes that pending reservations may already have put on the store.
pub struct ReconciliationSweep {
    registry: Arc<StoreRegistry>,
    ledger: Arc<CapacityLedger>,
    probe: Arc<dyn UsageProbe>,
    config: SweepConfig,
}

impl ReconciliationSweep {
    pub fn new(
        registry: Arc<StoreRegistry>,
        ledger: Arc<CapacityLedger>,
        probe: Arc<dyn UsageProbe>,
        config: SweepConfig,
    ) -> Self {
        Self {
            registry,
            ledger,
            probe,
            config,
        }
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Runs `sweep_once` every `interval` until `shutdown` flips to true or
    /// its sender is dropped.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(error) = self.sweep_once().await {
                            tracing::warn!("reconciliation sweep failed: {}", error);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("reconciliation sweep stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        self.ledger.refresh().await?;
        let mut report = SweepReport {
            expired: self.ledger.expire_pending(self.config.reservation_ttl).await?,
            ..SweepReport::default()
        };

        let listing = self.registry.list().await;
        for entry in listing.iter() {
            let observed = match self.probe.occupied_bytes(&entry.store).await {
                Ok(observed) => observed,
                Err(error) => {
                    tracing::warn!(
                        store = %entry.name(),
                        "usage probe failed, keeping ledger value: {}",
                        error
                    );
                    report
                        .probe_failures
                        .push((entry.name().to_string(), error.to_string()));
                    continue;
                }
            };

            match self
                .ledger
                .reconcile_used(entry.name(), observed, self.config.drift_tolerance_bytes)
                .await
            {
                Ok(Some(correction)) => report.corrections.push(correction),
                Ok(None) => {}
                Err(error) => {
                    tracing::debug!(store = %entry.name(), "skipping reconciliation: {}", error);
                }
            }
        }

        report.pruned = self
            .ledger
            .prune_resolved(self.config.resolved_retention)
            .await?;

        tracing::info!(
            stores = listing.len(),
            expired = report.expired.len(),
            corrected = report.corrections.len(),
            pruned = report.pruned,
            probe_failures = report.probe_failures.len(),
            "reconciliation sweep finished"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LibrarianError;
    use crate::events::EventBus;
    use crate::journal::NullJournal;
    use crate::store::{Store, StoreDescriptor};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct ReportedUsage {
        bytes: Mutex<HashMap<String, u64>>,
    }

    impl ReportedUsage {
        async fn set(&self, store: &str, bytes: u64) {
            self.bytes.lock().await.insert(store.to_string(), bytes);
        }
    }

    #[async_trait]
    impl UsageProbe for ReportedUsage {
        async fn occupied_bytes(&self, store: &Store) -> Result<u64> {
            self.bytes
                .lock()
                .await
                .get(&store.name)
                .copied()
                .ok_or_else(|| LibrarianError::Internal(format!("{} unreachable", store.name)))
        }
    }

    async fn fixture(
        config: SweepConfig,
    ) -> (Arc<CapacityLedger>, Arc<ReportedUsage>, ReconciliationSweep) {
        let registry = Arc::new(StoreRegistry::new());
        let ledger = Arc::new(CapacityLedger::new(Arc::new(NullJournal), EventBus::new()));
        for name in ["Store 0", "Store 1"] {
            let store = registry
                .register(&StoreDescriptor::new(name, 1_000))
                .await
                .unwrap();
            ledger.open_account(&store, 0).await.unwrap();
        }

        let probe = Arc::new(ReportedUsage::default());
        let sweep =
            ReconciliationSweep::new(registry, Arc::clone(&ledger), probe.clone(), config);
        (ledger, probe, sweep)
    }

    #[tokio::test]
    async fn external_usage_wins_beyond_tolerance() {
        let config = SweepConfig {
            drift_tolerance_bytes: 5,
            ..SweepConfig::default()
        };
        let (ledger, probe, sweep) = fixture(config).await;

        let r = ledger.reserve("Store 0", 200).await.unwrap();
        ledger.commit(r.id).await.unwrap();

        probe.set("Store 0", 350).await;
        probe.set("Store 1", 3).await;

        let report = sweep.sweep_once().await.unwrap();
        assert_eq!(report.corrections.len(), 1);
        assert_eq!(report.corrections[0].store, "Store 0");
        assert_eq!(ledger.usage("Store 0").await.unwrap().used, 350);
        assert_eq!(ledger.usage("Store 1").await.unwrap().used, 0);
    }

    #[tokio::test]
    async fn sweep_during_a_transfer_leaves_capacity_alone() {
        let (ledger, probe, sweep) = fixture(SweepConfig::default()).await;
        probe.set("Store 1", 0).await;

        let landing = ledger.reserve("Store 0", 600).await.unwrap();
        probe.set("Store 0", 600).await;

        let report = sweep.sweep_once().await.unwrap();
        assert!(report.corrections.is_empty());
        assert_eq!(ledger.free("Store 0").await.unwrap(), 400);

        let rest = ledger.reserve("Store 0", 400).await.unwrap();
        ledger.release(rest.id).await.unwrap();
        ledger.commit(landing.id).await.unwrap();

        let usage = ledger.usage("Store 0").await.unwrap();
        assert_eq!(usage.used, 600);
        assert!(usage.used <= usage.capacity);
    }

    #[tokio::test]
    async fn unreachable_store_keeps_ledger_value() {
        let (ledger, probe, sweep) = fixture(SweepConfig::default()).await;
        let r = ledger.reserve("Store 1", 10).await.unwrap();
        ledger.commit(r.id).await.unwrap();
        probe.set("Store 0", 0).await;

        let report = sweep.sweep_once().await.unwrap();
        assert_eq!(report.probe_failures.len(), 1);
        assert_eq!(report.probe_failures[0].0, "Store 1");
        assert_eq!(ledger.usage("Store 1").await.unwrap().used, 10);
    }

    #[tokio::test]
    async fn abandoned_reservations_expire() {
        let config = SweepConfig {
            reservation_ttl: Duration::ZERO,
            ..SweepConfig::default()
        };
        let (ledger, probe, sweep) = fixture(config).await;
        probe.set("Store 0", 0).await;
        probe.set("Store 1", 0).await;

        let abandoned = ledger.reserve("Store 0", 600).await.unwrap();
        assert_eq!(ledger.free("Store 0").await.unwrap(), 400);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = sweep.sweep_once().await.unwrap();
        assert_eq!(report.expired.len(), 1);
        assert_eq!(report.expired[0].id, abandoned.id);
        assert_eq!(ledger.free("Store 0").await.unwrap(), 1_000);
    }

    #[tokio::test]
    async fn started_sweep_stops_on_shutdown() {
        let config = SweepConfig {
            interval: Duration::from_millis(10),
            ..SweepConfig::default()
        };
        let (ledger, probe, sweep) = fixture(config).await;
        probe.set("Store 0", 123).await;
        probe.set("Store 1", 0).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = Arc::new(sweep).start(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ledger.usage("Store 0").await.unwrap().used, 123);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
