//! Distributed repartitioning of point clouds and construction of ghost regions
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod balance;
pub mod constants;
pub mod distribute;
pub mod exchange;
pub mod geometry;
pub mod ghost;
pub mod group;
pub mod locator;
pub mod point_set;
pub mod tools;
pub mod types;

pub use balance::SpatialHistogramBalancer;
pub use distribute::DistributedPointCloud;
pub use exchange::RegionPointExchanger;
pub use geometry::{BoundingBox, Point};
pub use ghost::{GhostRadius, GhostRegion, GhostRegionBuilder};
pub use group::{InFlight, ProcessGroup};
pub use point_set::{AttributeArray, AttributeData, PointSet};
pub use types::{DistributeError, Result};

// rand_distr is only used by the integration tests.
#[cfg(test)]
use rand_distr as _;
