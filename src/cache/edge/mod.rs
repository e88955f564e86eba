//! Edge tier policy: request normalization, stale-while-revalidate and
//! regional origin failover.

mod coordinator;
mod origin;
mod region;
mod request;

pub use coordinator::{CacheStatus, EdgeCacheCoordinator, EdgePolicy, EdgeResponse};
pub use origin::{
    CACHE_TAG_HEADER, CacheDirectives, EDGE_TAG, HttpOriginClient, OriginClient, OriginResponse,
    is_retryable,
};
pub use region::{Region, RegionSet};
pub use request::{DeviceClass, EdgeRequest};
