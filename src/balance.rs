//! Load balancing by recursive histogram bisection.
//!
//! Every round splits the combined points of a group of ranks along the longest
//! axis of their bounding box. The cut is placed at the bin of a global histogram
//! where the cumulative count reaches the share of the left half of the group.
//! Points on the wrong side of the cut are sent to a partner in the other half,
//! the group is split in two and each half continues on its own, until every
//! group has a single rank.

use itertools::Itertools;

use crate::{
    constants::{EXCHANGE_POINT_TAG, HISTOGRAM_SIZE},
    geometry::{global_bounding_box, BoundingBox},
    group::{InFlight, ProcessGroup},
    point_set::PointSet,
    tools::inclusive_cumsum,
    types::{ReduceOp, Result},
};

/// One level of the recursive bisection.
///
/// The node borrows the group of its level. Groups of deeper levels are owned by
/// the recursion frame that created them and released when it returns.
pub struct ProcessGroupNode<'g, G: ProcessGroup> {
    group: &'g G,
    size: usize,
    rank: usize,
    level: usize,
}

impl<'g, G: ProcessGroup> ProcessGroupNode<'g, G> {
    /// Create a node for `group` at recursion depth `level`.
    pub fn new(group: &'g G, level: usize) -> Self {
        Self {
            group,
            size: group.size(),
            rank: group.rank(),
            level,
        }
    }

    /// The group of this level.
    pub fn group(&self) -> &'g G {
        self.group
    }

    /// Number of ranks in the group.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Rank within the group.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Recursion depth, 0 for the full group.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Number of ranks in the left half.
    pub fn half(&self) -> usize {
        self.size / 2
    }

    /// Return true if this rank belongs to the left half.
    pub fn is_left(&self) -> bool {
        self.rank < self.half()
    }

    /// The rank in the other half that this rank exchanges points with.
    ///
    /// In groups of odd size the last rank has no mirror and sends to rank 0.
    pub fn partner(&self) -> usize {
        let half = self.half();
        if self.is_left() {
            self.rank + half
        } else if self.rank - half < half {
            self.rank - half
        } else {
            0
        }
    }

    /// Return true if this rank is the unmatched last rank of an odd group.
    pub fn is_unmatched(&self) -> bool {
        self.size % 2 == 1 && self.rank == self.size - 1
    }
}

/// Repartition points into compact regions with the same number of points.
pub struct SpatialHistogramBalancer<'g, G: ProcessGroup> {
    group: &'g G,
}

impl<'g, G: ProcessGroup> SpatialHistogramBalancer<'g, G> {
    /// Create a balancer working on `group`.
    pub fn new(group: &'g G) -> Self {
        Self { group }
    }

    /// Redistribute `points` across the ranks of the group.
    ///
    /// This is a collective call. On return every rank holds the points of one
    /// region and the bounding box of its new points is returned. Attribute
    /// arrays move together with their points. If an error occurs `points` is
    /// left unchanged.
    pub fn balance(&self, points: &mut PointSet) -> Result<BoundingBox> {
        points.validate()?;

        if self.group.size() == 1 {
            return Ok(points.bounding_box());
        }

        let balanced = balance_level(ProcessGroupNode::new(self.group, 0), points.clone())?;
        *points = balanced;

        Ok(points.bounding_box())
    }
}

fn balance_level<G: ProcessGroup>(
    node: ProcessGroupNode<'_, G>,
    points: PointSet,
) -> Result<PointSet> {
    if node.size() == 1 {
        return Ok(points);
    }

    let group = node.group();

    // The combined bounding box of the group determines the cut axis and the
    // range of the histogram.

    let group_box = global_bounding_box(&points.bounding_box(), group)?;
    let axis = group_box.longest_axis();

    let bins = points
        .points()
        .iter()
        .map(|point| histogram_bin(point[axis], &group_box, axis))
        .collect_vec();

    let mut histogram = vec![0_u64; HISTOGRAM_SIZE];
    for &bin in &bins {
        histogram[bin] += 1;
    }

    // Rank 0 finds the cut and tells the others.

    let global_histogram = group.reduce_u64(&histogram, ReduceOp::Sum, 0)?;
    let total = group.reduce_u64(&[points.len() as u64], ReduceOp::Sum, 0)?;

    let mut cut = [0_u64];
    if let (Some(global_histogram), Some(total)) = (global_histogram, total) {
        cut[0] = find_cut_bin(&global_histogram, total[0], node.size()) as u64;
    }
    group.broadcast_u64(&mut cut, 0)?;
    let cut_bin = cut[0] as usize;

    let (left, right): (Vec<usize>, Vec<usize>) =
        (0..points.len()).partition(|&index| bins[index] <= cut_bin);
    let (keep, send) = if node.is_left() {
        (left, right)
    } else {
        (right, left)
    };

    log::debug!(
        "level {} rank {}/{}: axis {} cut bin {} keeps {} sends {} to {}",
        node.level(),
        node.rank(),
        node.size(),
        axis,
        cut_bin,
        keep.len(),
        send.len(),
        node.partner()
    );

    let outgoing = points.select(&send);
    let mut retained = points.select(&keep);

    let received = exchange_with_partner(&node, &outgoing)?;
    for chunk in &received {
        retained.append(chunk)?;
    }

    // Split into the two halves and continue in the half of this rank. The
    // sub-group is released when this frame returns.

    let half = node.half();
    let (color, key) = if node.is_left() {
        (0, node.rank())
    } else {
        (1, node.rank() - half)
    };
    let sub_group = group.split(color, key)?;

    balance_level(ProcessGroupNode::new(&sub_group, node.level() + 1), retained)
}

/// Send `outgoing` to the partner and collect the points sent to this rank.
fn exchange_with_partner<G: ProcessGroup>(
    node: &ProcessGroupNode<'_, G>,
    outgoing: &PointSet,
) -> Result<Vec<PointSet>> {
    let group = node.group();
    let size = node.size();

    // Everyone learns how many points everyone sends, so that empty messages
    // can be skipped on both sides.

    let counts = group.all_gather_u64(&[outgoing.len() as u64])?;

    let partner = node.partner();
    let request = if outgoing.is_empty() {
        None
    } else {
        Some(group.immediate_send(partner, EXCHANGE_POINT_TAG, outgoing.marshal()?)?)
    };

    let mut received = Vec::new();

    if !node.is_unmatched() {
        let source = partner;
        if counts[source] > 0 {
            received.push(PointSet::unmarshal(
                &group.receive(source, EXCHANGE_POINT_TAG)?,
            )?);
        }
    }

    // Rank 0 additionally takes the points of the unmatched last rank.

    if size % 2 == 1 && node.rank() == 0 && counts[size - 1] > 0 {
        received.push(PointSet::unmarshal(
            &group.receive(size - 1, EXCHANGE_POINT_TAG)?,
        )?);
    }

    if let Some(request) = request {
        request.wait()?;
    }

    Ok(received)
}

/// Histogram bin of `value` along `axis` of `bbox`.
///
/// Values on the upper bound go into the last bin. A box without extent along
/// `axis` puts everything in bin 0.
fn histogram_bin(value: f64, bbox: &BoundingBox, axis: usize) -> usize {
    let extent = bbox.extent(axis);
    if extent.is_nan() || extent <= 0.0 {
        return 0;
    }

    let position = (value - bbox.lower()[axis]) / extent * HISTOGRAM_SIZE as f64;
    (position.max(0.0) as usize).min(HISTOGRAM_SIZE - 1)
}

/// Smallest bin at which the cumulative count reaches the share of the left half.
///
/// The left half has `size / 2` of `size` ranks, so it receives a fraction
/// `(size / 2) / size` of the points. If no bin reaches the target the cut is
/// at bin 0.
fn find_cut_bin(histogram: &[u64], total: u64, size: usize) -> usize {
    let ratio = size as f64 / (size / 2) as f64;
    let target = total as f64 / ratio;

    inclusive_cumsum(histogram)
        .iter()
        .position(|&count| count as f64 >= target)
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use itertools::Itertools;

    use super::{find_cut_bin, histogram_bin, ProcessGroupNode, SpatialHistogramBalancer};
    use crate::{
        constants::HISTOGRAM_SIZE,
        geometry::BoundingBox,
        group::{run_local, ProcessGroup},
        point_set::{AttributeArray, AttributeData, PointSet},
        tools::{gather_to_root, generate_random_points, seeded_rng},
    };

    #[test]
    fn test_histogram_bin_clamps_upper_bound() {
        let bbox = BoundingBox::new([0.0, 2.0, 0.0, 1.0, 0.0, 1.0]);
        assert_eq!(histogram_bin(0.0, &bbox, 0), 0);
        assert_eq!(histogram_bin(1.0, &bbox, 0), HISTOGRAM_SIZE / 2);
        assert_eq!(histogram_bin(2.0, &bbox, 0), HISTOGRAM_SIZE - 1);
    }

    #[test]
    fn test_histogram_bin_degenerate_axis() {
        let bbox = BoundingBox::new([1.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
        assert_eq!(histogram_bin(1.0, &bbox, 0), 0);
        assert_eq!(histogram_bin(1.0, &BoundingBox::empty(), 0), 0);
    }

    #[test]
    fn test_find_cut_bin() {
        let mut histogram = vec![0; HISTOGRAM_SIZE];
        histogram[10] = 3;
        histogram[20] = 3;
        histogram[30] = 3;

        // Two ranks split at half of the points.
        assert_eq!(find_cut_bin(&histogram, 9, 2), 20);
        // Three ranks give a third to the left half.
        assert_eq!(find_cut_bin(&histogram, 9, 3), 10);
        // Nothing to split.
        assert_eq!(find_cut_bin(&vec![0; HISTOGRAM_SIZE], 0, 4), 0);
    }

    #[test]
    fn test_partners() {
        let partners = |size: usize| {
            run_local(size, |group| {
                let node = ProcessGroupNode::new(&group, 0);
                (node.is_left(), node.partner(), node.is_unmatched())
            })
        };

        assert_eq!(
            partners(4),
            vec![(true, 2, false), (true, 3, false), (false, 0, false), (false, 1, false)]
        );
        assert_eq!(
            partners(3),
            vec![(true, 1, false), (false, 0, false), (false, 0, true)]
        );
    }

    #[test]
    fn test_balance_two_ranks() {
        let results = run_local(2, |group| {
            let mut rng = seeded_rng(group.rank());
            let mut points = generate_random_points(100, &mut rng, &group).unwrap();
            let region = SpatialHistogramBalancer::new(&group)
                .balance(&mut points)
                .unwrap();
            (region, gather_to_root(&points, &group).unwrap())
        });

        let gathered = results[0].1.as_ref().unwrap();
        assert_eq!(gathered.iter().map(PointSet::len).sum::<usize>(), 200);

        // The halves are separated along the cut axis.
        let (left, right) = (results[0].0, results[1].0);
        let axis = left.merge(&right).longest_axis();
        assert!(left.upper()[axis] <= right.lower()[axis]);

        for chunk in gathered {
            assert!(chunk.len().abs_diff(100) <= 10);
        }
    }

    #[test]
    fn test_balance_single_rank_is_identity() {
        let results = run_local(1, |group| {
            let mut rng = seeded_rng(0);
            let original = generate_random_points(20, &mut rng, &group).unwrap();
            let mut points = original.clone();
            let region = SpatialHistogramBalancer::new(&group)
                .balance(&mut points)
                .unwrap();
            (original, points, region)
        });

        let (original, points, region) = &results[0];
        assert_eq!(original, points);
        assert_eq!(*region, original.bounding_box());
    }

    #[test]
    fn test_balance_empty_input() {
        let results = run_local(4, |group| {
            let mut points = PointSet::new();
            let region = SpatialHistogramBalancer::new(&group)
                .balance(&mut points)
                .unwrap();
            (points.len(), region.is_valid(), group.size())
        });

        assert!(results.iter().all(|(len, valid, _)| *len == 0 && !valid));
    }

    #[test]
    fn test_balance_from_single_source() {
        // All points start on rank 2 and are spread over the group.
        let results = run_local(4, |group| {
            let mut points = if group.rank() == 2 {
                let coords = (0..64).map(|index| [index as f64, 0.0, 0.0]).collect_vec();
                PointSet::from_points(coords)
            } else {
                PointSet::new()
            };
            SpatialHistogramBalancer::new(&group)
                .balance(&mut points)
                .unwrap();
            points.len()
        });

        assert_eq!(results, vec![16, 16, 16, 16]);
    }

    #[test]
    fn test_failed_balance_leaves_points_unchanged() {
        // Both ranks send points to each other, but their arrays differ, so
        // both fail when merging what they receive.
        let results = run_local(2, |group| {
            let coords = if group.rank() == 0 {
                vec![[0.0, 0.0, 0.0], [3.0, 0.0, 0.0]]
            } else {
                vec![[1.0, 0.0, 0.0], [2.0, 0.0, 0.0]]
            };
            let name = if group.rank() == 0 { "Mass" } else { "Charge" };

            let mut original = PointSet::from_points(coords);
            original
                .add_array(AttributeArray::new(
                    name,
                    1,
                    AttributeData::Float64(vec![1.0, 2.0]),
                ))
                .unwrap();

            let mut points = original.clone();
            let result = SpatialHistogramBalancer::new(&group).balance(&mut points);
            (result.is_err(), original == points)
        });

        assert_eq!(results, vec![(true, true), (true, true)]);
    }
}
