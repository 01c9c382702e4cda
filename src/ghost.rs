//! Ghost regions around the points of a rank.
//!
//! A ghost region extends the local points of a rank by copies of the points of
//! other ranks that lie within a given distance of the local bounding box. Local
//! computations like bond detection then see all neighbours of points near the
//! boundary of the local region.

use itertools::Itertools;

use crate::{
    constants::OWNER_RANK_ARRAY,
    exchange::RegionPointExchanger,
    geometry::BoundingBox,
    group::ProcessGroup,
    locator::{BucketLocator, PointLocator},
    point_set::{AttributeArray, AttributeData, PointSet},
    types::{DistributeError, ReduceOp, Result},
};

/// Width of the ghost layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GhostRadius {
    /// A fixed distance.
    Absolute(f64),
    /// A factor of the longest extent of the local bounding box.
    Relative(f64),
}

impl GhostRadius {
    /// The distance by which `region` is dilated.
    pub fn distance(&self, region: &BoundingBox) -> f64 {
        match *self {
            GhostRadius::Absolute(radius) => radius,
            GhostRadius::Relative(factor) => {
                if region.is_valid() {
                    factor * region.extent(region.longest_axis())
                } else {
                    0.0
                }
            }
        }
    }
}

/// Local points extended by ghost points.
#[derive(Debug, Clone)]
pub struct GhostRegion {
    points: PointSet,
    point_ghosts: Vec<u8>,
    region: BoundingBox,
    ghosts_created: bool,
}

impl GhostRegion {
    /// The local points, followed by the ghost points.
    ///
    /// The array [OWNER_RANK_ARRAY] holds the rank that owns each point.
    pub fn points(&self) -> &PointSet {
        &self.points
    }

    /// Consume the region and return its points.
    pub fn into_points(self) -> PointSet {
        self.points
    }

    /// Ghost mark of every point, 0 for local points and 1 for ghosts.
    pub fn point_ghosts(&self) -> &[u8] {
        &self.point_ghosts
    }

    /// Number of ghost points.
    pub fn number_of_ghosts(&self) -> usize {
        self.point_ghosts.iter().filter(|&&mark| mark == 1).count()
    }

    /// Return true if `index` is a ghost point.
    pub fn is_ghost(&self, index: usize) -> bool {
        self.point_ghosts[index] == 1
    }

    /// Bounding box of the local points before dilation.
    pub fn region(&self) -> &BoundingBox {
        &self.region
    }

    /// Return false if ghost points were not exchanged.
    ///
    /// This is the case in serial runs and if some rank could not search its
    /// points. The region then only holds the local points.
    pub fn ghosts_created(&self) -> bool {
        self.ghosts_created
    }

    /// Ghost marks for edges between points of the region.
    ///
    /// An edge is a ghost if one of its end points lies outside [GhostRegion::region].
    pub fn edge_ghosts(&self, edges: &[[usize; 2]]) -> Vec<u8> {
        let points = self.points.points();
        edges
            .iter()
            .map(|edge| {
                let outside = edge
                    .iter()
                    .any(|&index| !self.region.contains(&points[index]));
                u8::from(outside)
            })
            .collect_vec()
    }
}

/// Build ghost regions on all ranks of a group.
pub struct GhostRegionBuilder<'g, G: ProcessGroup> {
    group: Option<&'g G>,
    radius: GhostRadius,
}

impl<'g, G: ProcessGroup> GhostRegionBuilder<'g, G> {
    /// Create a builder. Without a group the builder passes points through.
    ///
    /// The points of every [GhostRegion] carry the array [OWNER_RANK_ARRAY],
    /// also when no ghosts were created. Local points are then marked with the
    /// rank of this process, or 0 without a group.
    pub fn new(group: Option<&'g G>, radius: GhostRadius) -> Self {
        Self { group, radius }
    }

    /// Extend `points` by the points of other ranks within the ghost radius.
    ///
    /// With a group of more than one rank this is a collective call. If the
    /// points of any rank cannot be searched, all ranks return their local
    /// points only and [GhostRegion::ghosts_created] is false.
    pub fn build(&self, points: &PointSet) -> Result<GhostRegion> {
        points.validate()?;

        let region = points.bounding_box();

        let group = match self.group {
            Some(group) if group.size() > 1 => group,
            _ => return local_only(points, 0, region),
        };
        let rank = group.rank();

        // All ranks agree whether the exchange can go ahead.

        let searchable = match BucketLocator::build(points.points()) {
            Ok(_) => 1,
            Err(err) => {
                log::warn!("rank {}: cannot search local points: {}", rank, err);
                0
            }
        };
        if group.all_reduce_u64(&[searchable], ReduceOp::Min)?[0] == 0 {
            log::warn!(
                "rank {}: ghost points not created, results near region boundaries may be incomplete",
                rank
            );
            return local_only(points, rank, region);
        }

        let dilated = region.dilate(self.radius.distance(&region));
        let owned = with_owner(points, rank)?;
        let exchanged = RegionPointExchanger::new(group).exchange(&owned, &dilated)?;

        let owners = match exchanged.array(OWNER_RANK_ARRAY).map(AttributeArray::data) {
            Some(AttributeData::Int64(owners)) => owners,
            _ => {
                return Err(DistributeError::AttributeMismatch(format!(
                    "array `{}` lost in the exchange",
                    OWNER_RANK_ARRAY
                )))
            }
        };
        let ghost_indices = owners
            .iter()
            .positions(|&owner| owner != rank as i64)
            .collect_vec();

        let mut expanded = owned;
        expanded.append(&exchanged.select(&ghost_indices))?;

        let mut point_ghosts = vec![0; points.len()];
        point_ghosts.resize(expanded.len(), 1);

        log::debug!(
            "rank {}: {} local and {} ghost points",
            rank,
            points.len(),
            ghost_indices.len()
        );

        Ok(GhostRegion {
            points: expanded,
            point_ghosts,
            region,
            ghosts_created: true,
        })
    }
}

fn with_owner(points: &PointSet, rank: usize) -> Result<PointSet> {
    let mut owned = points.clone();
    owned.set_array(AttributeArray::new(
        OWNER_RANK_ARRAY,
        1,
        AttributeData::Int64(vec![rank as i64; points.len()]),
    ))?;
    Ok(owned)
}

fn local_only(points: &PointSet, rank: usize, region: BoundingBox) -> Result<GhostRegion> {
    Ok(GhostRegion {
        points: with_owner(points, rank)?,
        point_ghosts: vec![0; points.len()],
        region,
        ghosts_created: false,
    })
}

#[cfg(test)]
mod test {
    use super::{GhostRadius, GhostRegionBuilder};
    use crate::{
        constants::OWNER_RANK_ARRAY,
        geometry::BoundingBox,
        group::{run_local, LocalGroup, ProcessGroup},
        point_set::{AttributeData, PointSet},
    };

    #[test]
    fn test_relative_radius() {
        let region = BoundingBox::new([0.0, 4.0, 0.0, 1.0, 0.0, 2.0]);
        assert_eq!(GhostRadius::Relative(0.5).distance(&region), 2.0);
        assert_eq!(GhostRadius::Absolute(0.3).distance(&region), 0.3);
        assert_eq!(GhostRadius::Relative(0.5).distance(&BoundingBox::empty()), 0.0);
    }

    #[test]
    fn test_serial_pass_through() {
        let points = PointSet::from_points(vec![[0.0, 0.0, 0.0], [1.0, 1.0, 1.0]]);
        let ghosts = GhostRegionBuilder::<LocalGroup>::new(None, GhostRadius::Absolute(1.0))
            .build(&points)
            .unwrap();

        assert!(!ghosts.ghosts_created());
        assert_eq!(ghosts.points().points(), points.points());
        assert_eq!(ghosts.point_ghosts(), &[0, 0]);
        assert_eq!(
            ghosts.points().array(OWNER_RANK_ARRAY).unwrap().data(),
            &AttributeData::Int64(vec![0, 0])
        );
        assert_eq!(ghosts.edge_ghosts(&[[0, 1]]), vec![0]);
    }

    #[test]
    fn test_ghosts_from_neighbour() {
        // Two slabs along x, separated by a gap of 0.5.
        let results = run_local(2, |group| {
            let x = 1.5 * group.rank() as f64;
            let points = PointSet::from_points(vec![
                [x, 0.0, 0.0],
                [x + 1.0, 0.0, 0.0],
                [x + 0.5, 1.0, 0.0],
            ]);
            GhostRegionBuilder::new(Some(&group), GhostRadius::Absolute(0.6))
                .build(&points)
                .unwrap()
        });

        // Rank 0 sees the first point of rank 1 and the other way round.
        let first = &results[0];
        assert!(first.ghosts_created());
        assert_eq!(first.points().len(), 4);
        assert_eq!(first.point_ghosts(), &[0, 0, 0, 1]);
        assert_eq!(first.points().points()[3], [1.5, 0.0, 0.0]);
        assert_eq!(
            first.points().array(OWNER_RANK_ARRAY).unwrap().data(),
            &AttributeData::Int64(vec![0, 0, 0, 1])
        );
        assert_eq!(first.edge_ghosts(&[[0, 1], [1, 3]]), vec![0, 1]);

        let second = &results[1];
        assert_eq!(second.point_ghosts(), &[0, 0, 0, 1]);
        assert_eq!(second.points().points()[3], [1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_unsearchable_points_skip_exchange() {
        let results = run_local(2, |group| {
            let coord = if group.rank() == 1 { f64::NAN } else { 0.0 };
            let points = PointSet::from_points(vec![[coord, 0.0, 0.0]]);
            let ghosts = GhostRegionBuilder::new(Some(&group), GhostRadius::Absolute(10.0))
                .build(&points)
                .unwrap();
            (ghosts.ghosts_created(), ghosts.points().len(), group.size())
        });

        assert_eq!(results, vec![(false, 1, 2), (false, 1, 2)]);
    }
}
