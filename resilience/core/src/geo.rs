//! Geo Router
//!
//! Picks a provider region for a request given the client's location, data
//! residency constraints and measured latency.
//!
//! # Selection
//!
//! ```text
//! available regions of requested providers
//!         │
//!         ├─ residency filter (if required) ── empty ──> None
//!         ├─ latency filter (unmeasured regions pass)
//!         v
//! preferred_regions, in order ──match──> "Preferred region match"
//!         │ no match
//!         v
//! nearest to client (haversine) ───────> "Nearest region (Nkm away)"
//!         │ no client region / no coordinates
//!         v
//! fallback_to_any_region ──────────────> "Fallback to available region"
//!         │ disabled
//!         v
//!        None
//! ```
//!
//! Candidate order is the order of the requested providers, then the order
//! in which each provider's regions were registered.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::metrics::MetricsSink;

/// Mean Earth radius used for great-circle distance
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Coordinates (latitude, longitude) of well-known cloud regions
const REGION_COORDINATES: &[(&str, f64, f64)] = &[
    ("us-east-1", 39.0, -77.5),
    ("us-east-2", 40.0, -83.0),
    ("us-west-1", 37.4, -122.0),
    ("us-west-2", 45.9, -119.7),
    ("eu-west-1", 53.3, -6.3),
    ("eu-west-2", 51.5, -0.1),
    ("eu-central-1", 50.1, 8.7),
    ("ap-southeast-1", 1.35, 103.8),
    ("ap-southeast-2", -33.9, 151.2),
    ("ap-northeast-1", 35.7, 139.7),
    ("ap-south-1", 19.1, 72.9),
    ("ca-central-1", 45.5, -73.6),
    ("sa-east-1", -23.5, -46.6),
];

/// Latitude/longitude of a known region
pub fn region_coordinates(region: &str) -> Option<(f64, f64)> {
    REGION_COORDINATES
        .iter()
        .find(|(name, _, _)| *name == region)
        .map(|(_, lat, lon)| (*lat, *lon))
}

/// Great-circle distance between two (lat, lon) points in kilometres
pub fn haversine_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Distance between two named regions, if both are known
pub fn distance_km(from: &str, to: &str) -> Option<f64> {
    Some(haversine_km(region_coordinates(from)?, region_coordinates(to)?))
}

// ============================================================================
// Registry Types
// ============================================================================

/// Registry key
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RegionKey {
    pub provider: String,
    pub region: String,
}

impl RegionKey {
    pub fn new(provider: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            region: region.into(),
        }
    }
}

fn default_available() -> bool {
    true
}

/// A provider's deployment in one region
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderRegion {
    pub provider: String,
    pub region: String,
    pub endpoint: String,

    #[serde(default = "default_available")]
    pub available: bool,

    /// Last measured round-trip latency
    #[serde(default)]
    pub latency_ms: Option<u64>,

    /// Residency tags this deployment is certified for (e.g. "eu", "gdpr")
    #[serde(default)]
    pub data_residency: BTreeSet<String>,
}

impl ProviderRegion {
    pub fn new(
        provider: impl Into<String>,
        region: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            region: region.into(),
            endpoint: endpoint.into(),
            available: true,
            latency_ms: None,
            data_residency: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    #[must_use]
    pub fn with_residency<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.data_residency.extend(tags.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn key(&self) -> RegionKey {
        RegionKey::new(&self.provider, &self.region)
    }
}

/// Per-request routing constraints
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoRoutingConfig {
    /// Regions to use first, in priority order
    pub preferred_regions: Vec<String>,

    pub data_residency_required: bool,

    /// Residency tag a region must carry when residency is required
    pub data_residency_region: Option<String>,

    /// Regions with a measured latency above this are skipped
    pub max_latency_ms: Option<u64>,

    pub fallback_to_any_region: bool,
}

impl Default for GeoRoutingConfig {
    fn default() -> Self {
        Self {
            preferred_regions: Vec::new(),
            data_residency_required: false,
            data_residency_region: None,
            max_latency_ms: None,
            fallback_to_any_region: true,
        }
    }
}

impl GeoRoutingConfig {
    #[must_use]
    pub fn with_preferred_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preferred_regions = regions.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_data_residency(mut self, tag: impl Into<String>) -> Self {
        self.data_residency_required = true;
        self.data_residency_region = Some(tag.into());
        self
    }

    #[must_use]
    pub fn with_max_latency_ms(mut self, max: u64) -> Self {
        self.max_latency_ms = Some(max);
        self
    }

    #[must_use]
    pub fn with_fallback_to_any_region(mut self, enabled: bool) -> Self {
        self.fallback_to_any_region = enabled;
        self
    }
}

/// How a routing decision was reached
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStrategy {
    Preferred,
    Nearest,
    Fallback,
}

impl RouteStrategy {
    fn as_str(self) -> &'static str {
        match self {
            Self::Preferred => "preferred",
            Self::Nearest => "nearest",
            Self::Fallback => "fallback",
        }
    }
}

/// Selected region for a request
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GeoRouteDecision {
    pub provider: String,
    pub region: String,
    pub endpoint: String,
    pub strategy: RouteStrategy,
    pub reason: String,
    pub estimated_latency_ms: Option<u64>,
    pub distance_km: Option<f64>,
}

impl GeoRouteDecision {
    fn from_region(region: &ProviderRegion, strategy: RouteStrategy, reason: String) -> Self {
        Self {
            provider: region.provider.clone(),
            region: region.region.clone(),
            endpoint: region.endpoint.clone(),
            strategy,
            reason,
            estimated_latency_ms: region.latency_ms,
            distance_km: None,
        }
    }
}

// ============================================================================
// Geo Router
// ============================================================================

#[derive(Debug, Default)]
struct Registry {
    regions: HashMap<RegionKey, ProviderRegion>,
    /// Registration order
    order: Vec<RegionKey>,
}

/// Region registry plus selection logic
pub struct GeoRouter {
    registry: RwLock<Registry>,
    metrics: Arc<dyn MetricsSink>,
}

impl GeoRouter {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            metrics,
        }
    }

    pub fn with_regions<I>(regions: I, metrics: Arc<dyn MetricsSink>) -> Self
    where
        I: IntoIterator<Item = ProviderRegion>,
    {
        let router = Self::new(metrics);
        for region in regions {
            router.register_region(region);
        }
        router
    }

    /// Add a region, or replace an existing one in place
    pub fn register_region(&self, region: ProviderRegion) {
        let key = region.key();
        let mut registry = self.registry.write();
        if registry.regions.insert(key.clone(), region).is_none() {
            registry.order.push(key);
        }
    }

    /// Flip a region's availability; false if the region is unknown
    pub fn update_region_availability(&self, provider: &str, region: &str, available: bool) -> bool {
        let mut registry = self.registry.write();
        match registry.regions.get_mut(&RegionKey::new(provider, region)) {
            Some(entry) => {
                if entry.available != available {
                    tracing::info!(provider = %provider, region = %region, available, "Region availability changed");
                }
                entry.available = available;
                true
            }
            None => false,
        }
    }

    /// Store a fresh latency measurement; false if the region is unknown
    pub fn update_region_latency(&self, provider: &str, region: &str, latency_ms: u64) -> bool {
        let mut registry = self.registry.write();
        match registry.regions.get_mut(&RegionKey::new(provider, region)) {
            Some(entry) => {
                entry.latency_ms = Some(latency_ms);
                true
            }
            None => false,
        }
    }

    pub fn get_region(&self, provider: &str, region: &str) -> Option<ProviderRegion> {
        self.registry
            .read()
            .regions
            .get(&RegionKey::new(provider, region))
            .cloned()
    }

    /// Regions of one provider, in registration order
    pub fn regions_for_provider(&self, provider: &str) -> Vec<ProviderRegion> {
        let registry = self.registry.read();
        registry
            .order
            .iter()
            .filter(|key| key.provider == provider)
            .filter_map(|key| registry.regions.get(key).cloned())
            .collect()
    }

    /// Every registered region, in registration order
    pub fn all_regions(&self) -> Vec<ProviderRegion> {
        let registry = self.registry.read();
        registry
            .order
            .iter()
            .filter_map(|key| registry.regions.get(key).cloned())
            .collect()
    }

    /// Choose a region for a request, or `None` if nothing qualifies
    pub fn route(
        &self,
        providers: &[&str],
        config: &GeoRoutingConfig,
        client_region: Option<&str>,
    ) -> Option<GeoRouteDecision> {
        let decision = self
            .candidates(providers, config)
            .and_then(|candidates| Self::select(&candidates, config, client_region));
        match &decision {
            Some(d) => {
                tracing::debug!(
                    provider = %d.provider,
                    region = %d.region,
                    reason = %d.reason,
                    "Geo route selected"
                );
                self.metrics.increment_counter(
                    "geo_route_decisions_total",
                    &[("strategy", d.strategy.as_str())],
                    1,
                );
            }
            None => {
                tracing::debug!(?providers, "No region satisfies routing constraints");
                self.metrics
                    .increment_counter("geo_route_decisions_total", &[("strategy", "none")], 1);
            }
        }
        decision
    }

    /// Available regions after residency and latency filtering
    ///
    /// `None` when residency is required and no region qualifies.
    fn candidates(&self, providers: &[&str], config: &GeoRoutingConfig) -> Option<Vec<ProviderRegion>> {
        let registry = self.registry.read();

        let mut seen = HashSet::new();
        let mut candidates: Vec<ProviderRegion> = Vec::new();
        for provider in providers {
            if !seen.insert(*provider) {
                continue;
            }
            candidates.extend(
                registry
                    .order
                    .iter()
                    .filter(|key| key.provider == *provider)
                    .filter_map(|key| registry.regions.get(key))
                    .filter(|r| r.available)
                    .cloned(),
            );
        }
        drop(registry);

        if config.data_residency_required {
            let tag = config.data_residency_region.as_deref()?;
            candidates.retain(|r| r.data_residency.contains(tag));
            if candidates.is_empty() {
                return None;
            }
        }

        if let Some(max) = config.max_latency_ms {
            candidates.retain(|r| r.latency_ms.map_or(true, |l| l <= max));
        }

        Some(candidates)
    }

    fn select(
        candidates: &[ProviderRegion],
        config: &GeoRoutingConfig,
        client_region: Option<&str>,
    ) -> Option<GeoRouteDecision> {
        for preferred in &config.preferred_regions {
            if let Some(region) = candidates.iter().find(|r| &r.region == preferred) {
                return Some(GeoRouteDecision::from_region(
                    region,
                    RouteStrategy::Preferred,
                    "Preferred region match".to_string(),
                ));
            }
        }

        if let Some(client) = client_region.and_then(region_coordinates) {
            let nearest = candidates
                .iter()
                .filter_map(|r| region_coordinates(&r.region).map(|c| (r, haversine_km(client, c))))
                .min_by(|a, b| a.1.total_cmp(&b.1));

            if let Some((region, distance)) = nearest {
                let mut decision = GeoRouteDecision::from_region(
                    region,
                    RouteStrategy::Nearest,
                    format!("Nearest region ({distance:.0}km away)"),
                );
                decision.estimated_latency_ms = Some(
                    region
                        .latency_ms
                        .unwrap_or_else(|| (distance / 100.0 + 20.0).round() as u64),
                );
                decision.distance_km = Some(distance);
                return Some(decision);
            }
        }

        if config.fallback_to_any_region {
            return candidates.first().map(|region| {
                GeoRouteDecision::from_region(
                    region,
                    RouteStrategy::Fallback,
                    "Fallback to available region".to_string(),
                )
            });
        }

        None
    }
}

impl std::fmt::Debug for GeoRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoRouter")
            .field("regions", &self.registry.read().order.len())
            .finish()
    }
}
