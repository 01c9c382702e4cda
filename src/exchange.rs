//! Exchange of the points that fall into the regions of other ranks.

use itertools::Itertools;

use crate::{
    constants::REGION_EXCHANGE_TAG,
    geometry::BoundingBox,
    group::{wait_some, InFlight, ProcessGroup},
    locator::{BucketLocator, PointLocator},
    point_set::PointSet,
    types::{DistributeError, ReduceOp, Result},
};

/// Deliver to every rank the points of all ranks that lie inside its region.
pub struct RegionPointExchanger<'g, G: ProcessGroup> {
    group: &'g G,
}

impl<'g, G: ProcessGroup> RegionPointExchanger<'g, G> {
    /// Create an exchanger working on `group`.
    pub fn new(group: &'g G) -> Self {
        Self { group }
    }

    /// Collect the points inside `region` from all ranks.
    ///
    /// This is a collective call, each rank passes its own region. The result
    /// contains every point of every rank that lies inside `region`, boundary
    /// included, together with its attribute arrays. Regions of different ranks
    /// may overlap, in which case a point is delivered to all of them. The
    /// local points inside `region` come first, in their input order, followed
    /// by the points of other ranks in the order their messages arrive.
    ///
    /// With a single rank the input is returned unchanged.
    pub fn exchange(&self, points: &PointSet, region: &BoundingBox) -> Result<PointSet> {
        points.validate()?;

        let size = self.group.size();
        let rank = self.group.rank();

        if size == 1 {
            return Ok(points.clone());
        }

        // All ranks agree on whether every locator could be built, so that a
        // failure on one rank does not leave the others waiting in a collective.

        let locator = BucketLocator::build(points.points());
        let built = all_ranks_agree(self.group, locator.is_ok())?;
        let locator = match (locator, built) {
            (Ok(locator), true) => locator,
            (Err(err), _) => return Err(err),
            (Ok(_), false) => {
                return Err(DistributeError::Locator(
                    "the points of another rank cannot be searched".to_string(),
                ))
            }
        };

        // Every rank learns the regions of all other ranks.

        let regions = self
            .group
            .all_gather_f64(&region.bounds())?
            .chunks_exact(6)
            .map(|bounds| {
                BoundingBox::new([
                    bounds[0], bounds[1], bounds[2], bounds[3], bounds[4], bounds[5],
                ])
            })
            .collect_vec();

        let mut chunks = Vec::with_capacity(size);
        for target in &regions {
            let indices = if target.is_valid() {
                locator.find_points_in_box(&target.outward_f32())
            } else {
                Vec::new()
            };
            chunks.push(points.select(&indices));
        }

        let mut buffers = chunks
            .iter()
            .enumerate()
            .map(|(dest, chunk)| {
                if dest == rank || chunk.is_empty() {
                    Ok(Vec::new())
                } else {
                    chunk.marshal()
                }
            })
            .collect::<Result<Vec<_>>>()?;

        // Byte lengths and point counts for all destinations in one all-gather.
        // Row `source` of the result holds the lengths, then the counts, that
        // `source` sends to each rank.

        let mut sizes = buffers.iter().map(|buffer| buffer.len() as u64).collect_vec();
        sizes.extend(chunks.iter().map(|chunk| chunk.len() as u64));
        let all_sizes = self.group.all_gather_u64(&sizes)?;

        let incoming_bytes = |source: usize| all_sizes[source * 2 * size + rank];
        let incoming_points = |source: usize| all_sizes[source * 2 * size + size + rank] as usize;

        let total = (0..size)
            .map(|source| {
                if source == rank {
                    chunks[rank].len()
                } else {
                    incoming_points(source)
                }
            })
            .sum::<usize>();

        // Post the receives in round robin order starting after this rank.

        let mut pending = Vec::new();
        for offset in 1..size {
            let source = (rank + offset) % size;
            if incoming_bytes(source) > 0 {
                let request = self.group.immediate_receive(source, REGION_EXCHANGE_TAG)?;
                pending.push((source, request));
            }
        }

        let mut received = points.with_capacity_like(total);
        received.append(&chunks[rank])?;

        let mut sends = Vec::new();
        for offset in 1..size {
            let dest = (rank + offset) % size;
            if !buffers[dest].is_empty() {
                let buffer = std::mem::take(&mut buffers[dest]);
                sends.push(self.group.immediate_send(dest, REGION_EXCHANGE_TAG, buffer)?);
            }
        }

        while !pending.is_empty() {
            for (source, message) in wait_some(&mut pending)? {
                let chunk = PointSet::unmarshal(&message)?;
                if chunk.len() != incoming_points(source) {
                    return Err(DistributeError::Communication(format!(
                        "expected {} points from rank {}, received {}",
                        incoming_points(source),
                        source,
                        chunk.len()
                    )));
                }
                received.append(&chunk)?;
            }
        }

        for request in sends {
            request.wait()?;
        }

        log::debug!(
            "rank {}/{}: region exchange kept {} and received {} points",
            rank,
            size,
            chunks[rank].len(),
            received.len() - chunks[rank].len()
        );

        Ok(received)
    }
}

/// Return true on all ranks if `ok` is true on all ranks.
fn all_ranks_agree<G: ProcessGroup>(group: &G, ok: bool) -> Result<bool> {
    Ok(group.all_reduce_u64(&[u64::from(ok)], ReduceOp::Min)?[0] == 1)
}

#[cfg(test)]
mod test {
    use itertools::Itertools;

    use std::time::Duration;

    use super::RegionPointExchanger;
    use crate::{
        geometry::BoundingBox,
        group::{run_local, run_local_with_timeout, ProcessGroup},
        point_set::{AttributeArray, AttributeData, PointSet},
        types::DistributeError,
    };

    fn labelled(points: Vec<[f64; 3]>, label: i64) -> PointSet {
        let npoints = points.len();
        let mut point_set = PointSet::from_points(points);
        point_set
            .add_array(AttributeArray::new(
                "Label",
                1,
                AttributeData::Int64(vec![label; npoints]),
            ))
            .unwrap();
        point_set
    }

    #[test]
    fn test_exchange_single_rank_is_identity() {
        let results = run_local(1, |group| {
            let points = labelled(vec![[0.0, 0.0, 0.0], [5.0, 5.0, 5.0]], 3);
            let region = BoundingBox::new([0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
            let exchanged = RegionPointExchanger::new(&group)
                .exchange(&points, &region)
                .unwrap();
            (points, exchanged)
        });

        assert_eq!(results[0].0, results[0].1);
    }

    #[test]
    fn test_exchange_swaps_regions() {
        // Each rank holds the points of the other rank's region.
        let results = run_local(2, |group| {
            let rank = group.rank();
            let other = (1 - rank) as f64;
            let points = labelled(
                (0..5).map(|i| [other + 0.1 * i as f64, 0.5, 0.5]).collect_vec(),
                rank as i64,
            );
            let region = BoundingBox::new([rank as f64, rank as f64 + 0.9, 0.0, 1.0, 0.0, 1.0]);
            RegionPointExchanger::new(&group)
                .exchange(&points, &region)
                .unwrap()
        });

        for (rank, points) in results.iter().enumerate() {
            assert_eq!(points.len(), 5);
            assert!(points.points().iter().all(|p| p[0] >= rank as f64));
            assert_eq!(
                points.array("Label").unwrap().data(),
                &AttributeData::Int64(vec![1 - rank as i64; 5])
            );
        }
    }

    #[test]
    fn test_exchange_includes_upper_boundary() {
        let xmax = 0.1 + 0.2;
        let results = run_local(2, |group| {
            let points = if group.rank() == 1 {
                PointSet::from_points(vec![[xmax, 0.5, 0.5], [0.7, 0.5, 0.5]])
            } else {
                PointSet::new()
            };
            let region = if group.rank() == 0 {
                BoundingBox::new([0.0, xmax, 0.0, 1.0, 0.0, 1.0])
            } else {
                BoundingBox::empty()
            };
            RegionPointExchanger::new(&group)
                .exchange(&points, &region)
                .unwrap()
        });

        assert_eq!(results[0].points(), &[[xmax, 0.5, 0.5]]);
        assert!(results[1].is_empty());
    }

    #[test]
    fn test_exchange_rejects_inconsistent_arrays() {
        let results = run_local(2, |group| {
            let mut points = PointSet::from_points(vec![[0.5, 0.5, 0.5]]);
            let name = if group.rank() == 0 { "A" } else { "B" };
            points
                .add_array(AttributeArray::new(name, 1, AttributeData::UInt8(vec![1])))
                .unwrap();
            let region = BoundingBox::new([0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
            RegionPointExchanger::new(&group)
                .exchange(&points, &region)
                .is_err()
        });

        assert_eq!(results, vec![true, true]);
    }

    #[test]
    fn test_exchange_fails_on_all_ranks_for_non_finite_points() {
        let results = run_local_with_timeout(3, Duration::from_secs(10), |group| {
            let coord = if group.rank() == 1 { f64::NAN } else { 0.5 };
            let points = PointSet::from_points(vec![[coord, 0.5, 0.5]]);
            let region = BoundingBox::new([0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
            RegionPointExchanger::new(&group)
                .exchange(&points, &region)
                .err()
        });

        for error in results {
            assert!(matches!(error, Some(DistributeError::Locator(_))));
        }
    }
}
