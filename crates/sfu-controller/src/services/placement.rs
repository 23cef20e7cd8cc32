//! Placement Picker.
//!
//! Chooses the worker for a new router by geo-proximity: the request IP is
//! resolved to a coordinate (or the configured fallback), every active
//! worker within `tolerance_km` of the closest one is a candidate, and the
//! [`PlacementPolicy`] breaks the tie.
//!
//! # Security
//!
//! - The default policy uses a CSPRNG so placement is not predictable
//!   from the outside.

use crate::errors::SfuError;
use crate::geo::{Coordinate, GeoIpResolver};
use crate::observability::metrics;
use crate::repositories::Tables;
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;
use tracing::{debug, warn};

/// An active worker considered for placement.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub worker_id: String,
    /// Distance from the request coordinate. A worker whose IP does not
    /// resolve is measured from the fallback coordinate.
    pub distance_km: f64,
}

/// Tie-break among workers that are all close enough.
pub trait PlacementPolicy: Send + Sync {
    fn choose<'a>(&self, candidates: &'a [Candidate]) -> Option<&'a Candidate>;
}

/// Uniform CSPRNG pick. Spreads calls from one region over the nearby pool.
#[derive(Debug, Default)]
pub struct RandomWithinTolerance;

impl PlacementPolicy for RandomWithinTolerance {
    fn choose<'a>(&self, candidates: &'a [Candidate]) -> Option<&'a Candidate> {
        if candidates.len() <= 1 {
            return candidates.first();
        }

        let rng = SystemRandom::new();
        let mut random_bytes = [0u8; 8];
        if rng.fill(&mut random_bytes).is_err() {
            warn!(
                target: "sfu.service.placement",
                "CSPRNG failed, falling back to first candidate"
            );
            return candidates.first();
        }
        let index = u64::from_le_bytes(random_bytes) % candidates.len() as u64;
        candidates.get(usize::try_from(index).unwrap_or(0))
    }
}

/// Deterministic: smallest distance, then lowest worker id.
#[derive(Debug, Default)]
pub struct NearestFirst;

impl PlacementPolicy for NearestFirst {
    fn choose<'a>(&self, candidates: &'a [Candidate]) -> Option<&'a Candidate> {
        candidates.iter().min_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        })
    }
}

pub struct WorkerPicker {
    resolver: Arc<dyn GeoIpResolver>,
    policy: Arc<dyn PlacementPolicy>,
    fallback: Coordinate,
    tolerance_km: f64,
}

impl WorkerPicker {
    pub fn new(
        resolver: Arc<dyn GeoIpResolver>,
        policy: Arc<dyn PlacementPolicy>,
        fallback: Coordinate,
        tolerance_km: f64,
    ) -> Self {
        Self {
            resolver,
            policy,
            fallback,
            tolerance_km,
        }
    }

    /// Pick a worker for a router requested from `ip`.
    ///
    /// # Errors
    ///
    /// `SfuError::NoWorkersAvailable` if no worker is healthy and not deleted.
    pub fn pick_worker(&self, tables: &Tables, ip: Option<&str>) -> Result<String, SfuError> {
        let active = tables.active_workers();
        if active.is_empty() {
            warn!(target: "sfu.service.placement", "No active workers for placement");
            metrics::record_placement("no_workers");
            return Err(SfuError::NoWorkersAvailable);
        }

        let resolved = ip.and_then(|ip| self.resolver.resolve(ip));
        let origin = resolved.unwrap_or(self.fallback);

        let candidates: Vec<Candidate> = active
            .iter()
            .map(|worker| {
                let location = self
                    .resolver
                    .resolve(&worker.app_data.ip)
                    .unwrap_or(self.fallback);
                Candidate {
                    worker_id: worker.id.clone(),
                    distance_km: origin.distance_km(&location),
                }
            })
            .collect();
        let shortlist = within_tolerance(&candidates, self.tolerance_km);

        let chosen = self
            .policy
            .choose(&shortlist)
            .ok_or(SfuError::NoWorkersAvailable)?;

        debug!(
            target: "sfu.service.placement",
            worker_id = %chosen.worker_id,
            distance_km = chosen.distance_km,
            candidates = shortlist.len(),
            resolved = resolved.is_some(),
            "Picked worker"
        );
        metrics::record_placement(if resolved.is_some() {
            "nearest"
        } else {
            "fallback"
        });
        Ok(chosen.worker_id.clone())
    }
}

/// Candidates no further than `tolerance_km` beyond the closest one.
fn within_tolerance(candidates: &[Candidate], tolerance_km: f64) -> Vec<Candidate> {
    let Some(closest) = candidates
        .iter()
        .map(|c| c.distance_km)
        .min_by(f64::total_cmp)
    else {
        return Vec::new();
    };
    candidates
        .iter()
        .filter(|c| c.distance_km <= closest + tolerance_km)
        .cloned()
        .collect()
}
