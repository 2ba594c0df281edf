//! Placement engine: picks a store for a file of known size and reserves the
//! bytes there.
//!
//! Ranking reads free-capacity snapshots without holding any lock across the
//! decision. Only the final reserve is atomic, so when another placement wins
//! the race for the chosen store we re-rank against fresh numbers and try
//! again, up to `max_reserve_attempts` times.

use crate::events::{EventBus, LibrarianEvent};
use crate::ledger::{CapacityLedger, Reservation, StoreUsage};
use crate::registry::StoreRegistry;
use crate::store::{SourcePipeline, Store};
use crate::{LibrarianError, Result};
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_MAX_RESERVE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementRequest {
    pub bytes: u64,
    pub pipeline: SourcePipeline,
    pub preferred_store: Option<String>,
}

impl PlacementRequest {
    pub fn new(bytes: u64, pipeline: impl Into<SourcePipeline>) -> Self {
        Self {
            bytes,
            pipeline: pipeline.into(),
            preferred_store: None,
        }
    }

    pub fn with_preferred_store(mut self, store: impl Into<String>) -> Self {
        self.preferred_store = Some(store.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Placement {
    pub store: Arc<Store>,
    pub reservation: Reservation,
    pub attempts: usize,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub store: Arc<Store>,
    pub usage: StoreUsage,
}

#[derive(Debug, Clone)]
pub struct PlacementPolicy {
    pub max_reserve_attempts: usize,
    /// Advisory pipeline -> store hints, used when a request names no store.
    pub pipeline_affinity: HashMap<String, String>,
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self {
            max_reserve_attempts: DEFAULT_MAX_RESERVE_ATTEMPTS,
            pipeline_affinity: HashMap::new(),
        }
    }
}

pub struct PlacementEngine {
    registry: Arc<StoreRegistry>,
    ledger: Arc<CapacityLedger>,
    policy: PlacementPolicy,
    events: EventBus,
}

impl PlacementEngine {
    pub fn new(
        registry: Arc<StoreRegistry>,
        ledger: Arc<CapacityLedger>,
        mut policy: PlacementPolicy,
        events: EventBus,
    ) -> Self {
        // Pipeline names match case-insensitively; config sources may fold keys.
        policy.pipeline_affinity = policy
            .pipeline_affinity
            .into_iter()
            .map(|(pipeline, store)| (pipeline.to_ascii_lowercase(), store))
            .collect();

        Self {
            registry,
            ledger,
            policy,
            events,
        }
    }

    pub fn policy(&self) -> &PlacementPolicy {
        &self.policy
    }

    /// Selects a store and reserves `request.bytes` on it.
    pub async fn choose(&self, request: &PlacementRequest) -> Result<Placement> {
        let ranking = self.rank(request).await;
        self.choose_from(request, ranking).await
    }

    /// Reserves on the head of `ranking`. A reservation lost to a concurrent
    /// placement re-ranks and tries again, up to the policy's attempt limit.
    async fn choose_from(
        &self,
        request: &PlacementRequest,
        mut ranking: Vec<Candidate>,
    ) -> Result<Placement> {
        let max_attempts = self.policy.max_reserve_attempts.max(1);

        for attempt in 1..=max_attempts {
            let candidates = if attempt == 1 {
                std::mem::take(&mut ranking)
            } else {
                self.rank(request).await
            };
            let Some(chosen) = candidates.into_iter().next() else {
                return Err(LibrarianError::NoEligibleStore {
                    requested: request.bytes,
                    attempts: attempt,
                });
            };

            match self.ledger.reserve(&chosen.store.name, request.bytes).await {
                Ok(reservation) => {
                    tracing::info!(
                        store = %chosen.store.name,
                        pipeline = %request.pipeline,
                        bytes = request.bytes,
                        attempt,
                        "placement decided"
                    );
                    self.events.publish(LibrarianEvent::PlacementDecided {
                        store: chosen.store.name.clone(),
                        pipeline: request.pipeline.to_string(),
                        bytes: request.bytes,
                        attempts: attempt,
                    });

                    return Ok(Placement {
                        store: chosen.store,
                        reservation,
                        attempts: attempt,
                    });
                }
                Err(error) if error.is_capacity_race() => {
                    tracing::debug!(
                        store = %chosen.store.name,
                        attempt,
                        "lost capacity race, re-ranking: {}",
                        error
                    );
                }
                Err(LibrarianError::StoreNotFound(name)) => {
                    tracing::debug!(store = %name, attempt, "store purged during placement");
                }
                Err(error) => return Err(error),
            }
        }

        Err(LibrarianError::NoEligibleStore {
            requested: request.bytes,
            attempts: max_attempts,
        })
    }

    /// The store `choose` would pick right now, without reserving anything.
    pub async fn recommend(&self, request: &PlacementRequest) -> Result<Candidate> {
        self.rank(request)
            .await
            .into_iter()
            .next()
            .ok_or(LibrarianError::NoEligibleStore {
                requested: request.bytes,
                attempts: 0,
            })
    }

    /// Eligible stores, best first: the affinity hint if it is eligible,
    /// then descending free fraction with registration order breaking ties.
    pub async fn rank(&self, request: &PlacementRequest) -> Vec<Candidate> {
        let listing = self.registry.list().await;
        let mut candidates = Vec::new();
        for entry in listing.available() {
            let usage = match self.ledger.usage(entry.name()).await {
                Ok(usage) => usage,
                Err(error) => {
                    tracing::debug!(store = %entry.name(), "skipping store without account: {}", error);
                    continue;
                }
            };

            if usage.free >= request.bytes {
                candidates.push(Candidate {
                    store: Arc::clone(&entry.store),
                    usage,
                });
            }
        }

        // Stable sort keeps registration order among equal fractions.
        candidates.sort_by(|a, b| b.usage.cmp_free_fraction(&a.usage));

        if let Some(preferred) = self.preferred_store(request) {
            if let Some(position) = candidates
                .iter()
                .position(|candidate| candidate.store.name == preferred)
            {
                let hinted = candidates.remove(position);
                candidates.insert(0, hinted);
            }
        }

        candidates
    }

    fn preferred_store<'a>(&'a self, request: &'a PlacementRequest) -> Option<&'a str> {
        request.preferred_store.as_deref().or_else(|| {
            self.policy
                .pipeline_affinity
                .get(&request.pipeline.as_str().to_ascii_lowercase())
                .map(String::as_str)
        })
    }
}
