//! Origin regions and their health.

use std::sync::RwLock;

use serde::Serialize;
use tracing::info;
use url::Url;

use crate::cache::config::RegionConfig;
use crate::cache::error::{CacheError, CacheResult};
use crate::cache::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::edge::region";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Region {
    pub id: String,
    pub origin_url: Url,
    /// Lower is preferred.
    pub priority: u32,
    pub healthy: bool,
}

impl Region {
    pub fn new(id: impl Into<String>, origin_url: Url, priority: u32) -> Self {
        Self {
            id: id.into(),
            origin_url,
            priority,
            healthy: true,
        }
    }
}

/// Regions ordered by priority. Health is written by an external health checker via
/// [`RegionSet::set_healthy`]; readers always see a consistent snapshot.
#[derive(Debug, Default)]
pub struct RegionSet {
    regions: RwLock<Vec<Region>>,
}

impl RegionSet {
    pub fn new(mut regions: Vec<Region>) -> Self {
        regions.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        Self {
            regions: RwLock::new(regions),
        }
    }

    pub fn from_config(configs: &[RegionConfig]) -> CacheResult<Self> {
        let mut regions = Vec::with_capacity(configs.len());
        for config in configs {
            if config.id.trim().is_empty() {
                return Err(CacheError::invalid_argument("region id must not be empty"));
            }
            if regions.iter().any(|region: &Region| region.id == config.id) {
                return Err(CacheError::invalid_argument(format!(
                    "duplicate region `{}`",
                    config.id
                )));
            }
            let origin_url = Url::parse(&config.origin_url).map_err(|err| {
                CacheError::invalid_argument(format!(
                    "region `{}` has an invalid origin url: {err}",
                    config.id
                ))
            })?;
            regions.push(Region {
                id: config.id.clone(),
                origin_url,
                priority: config.priority,
                healthy: config.healthy,
            });
        }
        Ok(Self::new(regions))
    }

    /// Record a health transition. Returns `false` for an unknown region.
    pub fn set_healthy(&self, id: &str, healthy: bool) -> bool {
        let mut regions = rw_write(&self.regions, SOURCE, "set_healthy");
        let Some(region) = regions.iter_mut().find(|region| region.id == id) else {
            return false;
        };
        if region.healthy != healthy {
            info!(region = id, healthy, "Region health changed");
            region.healthy = healthy;
        }
        true
    }

    /// Healthy regions, most preferred first.
    pub fn healthy(&self) -> Vec<Region> {
        rw_read(&self.regions, SOURCE, "healthy")
            .iter()
            .filter(|region| region.healthy)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Region> {
        rw_read(&self.regions, SOURCE, "all").clone()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.regions, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
