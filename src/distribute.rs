//! Redistribution of a point cloud into compact regions.

use crate::{
    balance::SpatialHistogramBalancer, exchange::RegionPointExchanger, group::ProcessGroup,
    point_set::PointSet, types::Result,
};

/// Distribute a point cloud with attributes over the ranks of a group.
///
/// The regions are found by balancing the coordinates alone. The full input,
/// with all attribute arrays, is then moved in a single region exchange. A point
/// that lies exactly on the boundary of two regions is delivered to both.
pub struct DistributedPointCloud<'g, G: ProcessGroup> {
    group: Option<&'g G>,
}

impl<'g, G: ProcessGroup> DistributedPointCloud<'g, G> {
    /// Create a distributor. Without a group points are passed through.
    pub fn new(group: Option<&'g G>) -> Self {
        Self { group }
    }

    /// Return the points of the region of this rank.
    pub fn distribute(&self, points: &PointSet) -> Result<PointSet> {
        points.validate()?;

        let group = match self.group {
            Some(group) if group.size() > 1 => group,
            _ => return Ok(points.clone()),
        };

        let mut coordinates = points.coordinates_only();
        let region = SpatialHistogramBalancer::new(group).balance(&mut coordinates)?;

        log::debug!(
            "rank {}: region {} with {} points after balancing",
            group.rank(),
            region,
            coordinates.len()
        );

        RegionPointExchanger::new(group).exchange(points, &region)
    }
}
