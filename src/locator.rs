//! Point locators to find the points inside a box.

use itertools::Itertools;

use crate::{
    constants::{BUCKET_TARGET_POINTS, MAX_BUCKETS_PER_AXIS},
    geometry::{BoundingBox, Point},
    types::{DistributeError, Result},
};

/// A spatial search structure over a fixed set of points.
pub trait PointLocator: Sized {
    /// Build the locator. Empty point sets are allowed.
    fn build(points: &[Point]) -> Result<Self>;

    /// Return the indices of all points inside `bbox` in ascending order.
    fn find_points_in_box(&self, bbox: &BoundingBox) -> Vec<usize>;
}

/// A uniform grid of buckets.
///
/// Coordinates are stored and compared in single precision. Queries near a
/// box boundary should therefore use a box that was extended with
/// [BoundingBox::outward_f32].
pub struct BucketLocator {
    coords: Vec<[f32; 3]>,
    lower: [f64; 3],
    width: [f64; 3],
    nbuckets: [usize; 3],
    bucket_offsets: Vec<usize>,
    bucket_points: Vec<usize>,
}

impl BucketLocator {
    /// Number of points in the locator.
    pub fn len(&self) -> usize {
        self.coords.len()
    }

    /// Return true if the locator holds no points.
    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    fn axis_bucket(&self, axis: usize, coord: f64) -> usize {
        let position = ((coord - self.lower[axis]) / self.width[axis]).floor();
        position.max(0.0).min((self.nbuckets[axis] - 1) as f64) as usize
    }

    fn bucket_index(&self, index: [usize; 3]) -> usize {
        index[0] + self.nbuckets[0] * (index[1] + self.nbuckets[1] * index[2])
    }
}

impl PointLocator for BucketLocator {
    fn build(points: &[Point]) -> Result<Self> {
        if let Some(index) = points
            .iter()
            .position(|point| point.iter().any(|coord| !coord.is_finite()))
        {
            return Err(DistributeError::Locator(format!(
                "point {} has a non-finite coordinate",
                index
            )));
        }

        let coords = points
            .iter()
            .map(|point| [point[0] as f32, point[1] as f32, point[2] as f32])
            .collect_vec();

        let mut lower = [0.0; 3];
        let mut upper = [0.0; 3];
        if let Some(first) = coords.first() {
            for axis in 0..3 {
                lower[axis] = first[axis] as f64;
                upper[axis] = first[axis] as f64;
            }
        }
        for coord in &coords {
            for axis in 0..3 {
                lower[axis] = f64::min(lower[axis], coord[axis] as f64);
                upper[axis] = f64::max(upper[axis], coord[axis] as f64);
            }
        }

        // Aim for a fixed number of points per bucket, spread evenly across the
        // non-degenerate axes.

        let active_axes = (0..3).filter(|&axis| upper[axis] > lower[axis]).count();
        let target_buckets = (coords.len() / BUCKET_TARGET_POINTS).max(1) as f64;
        let per_axis = if active_axes == 0 {
            1
        } else {
            (target_buckets.powf(1.0 / active_axes as f64).ceil() as usize)
                .clamp(1, MAX_BUCKETS_PER_AXIS)
        };

        let mut nbuckets = [1; 3];
        let mut width = [1.0; 3];
        for axis in 0..3 {
            if upper[axis] > lower[axis] {
                nbuckets[axis] = per_axis;
                width[axis] = (upper[axis] - lower[axis]) / per_axis as f64;
            }
        }

        let mut locator = BucketLocator {
            coords,
            lower,
            width,
            nbuckets,
            bucket_offsets: Vec::new(),
            bucket_points: Vec::new(),
        };

        // Counting sort of the point indices into the buckets.

        let total_buckets = nbuckets.iter().product::<usize>();
        let buckets = locator
            .coords
            .iter()
            .map(|coord| {
                locator.bucket_index([
                    locator.axis_bucket(0, coord[0] as f64),
                    locator.axis_bucket(1, coord[1] as f64),
                    locator.axis_bucket(2, coord[2] as f64),
                ])
            })
            .collect_vec();

        let mut offsets = vec![0; total_buckets + 1];
        for &bucket in &buckets {
            offsets[bucket + 1] += 1;
        }
        for index in 0..total_buckets {
            offsets[index + 1] += offsets[index];
        }

        let mut fill = offsets.clone();
        let mut bucket_points = vec![0; buckets.len()];
        for (point_index, &bucket) in buckets.iter().enumerate() {
            bucket_points[fill[bucket]] = point_index;
            fill[bucket] += 1;
        }

        locator.bucket_offsets = offsets;
        locator.bucket_points = bucket_points;

        Ok(locator)
    }

    fn find_points_in_box(&self, bbox: &BoundingBox) -> Vec<usize> {
        if self.is_empty() || !bbox.is_valid() {
            return Vec::new();
        }

        let query_lower = bbox.lower().map(|value| value as f32);
        let query_upper = bbox.upper().map(|value| value as f32);

        let mut first = [0; 3];
        let mut last = [0; 3];
        for axis in 0..3 {
            first[axis] = self.axis_bucket(axis, query_lower[axis] as f64);
            last[axis] = self.axis_bucket(axis, query_upper[axis] as f64);
        }

        let mut found = Vec::new();
        for k in first[2]..=last[2] {
            for j in first[1]..=last[1] {
                for i in first[0]..=last[0] {
                    let bucket = self.bucket_index([i, j, k]);
                    for &point_index in
                        &self.bucket_points[self.bucket_offsets[bucket]..self.bucket_offsets[bucket + 1]]
                    {
                        let coord = &self.coords[point_index];
                        if (0..3).all(|axis| {
                            query_lower[axis] <= coord[axis] && coord[axis] <= query_upper[axis]
                        }) {
                            found.push(point_index);
                        }
                    }
                }
            }
        }

        found.sort_unstable();
        found
    }
}

#[cfg(test)]
mod test {
    use itertools::Itertools;
    use rand::Rng;

    use super::{BucketLocator, PointLocator};
    use crate::{geometry::BoundingBox, tools::seeded_rng};

    #[test]
    fn test_matches_brute_force() {
        let mut rng = seeded_rng(0);
        let points = (0..2000)
            .map(|_| [rng.gen::<f64>(), 2.0 * rng.gen::<f64>(), 0.5])
            .collect_vec();

        let locator = BucketLocator::build(&points).unwrap();

        for _ in 0..20 {
            let x: [f64; 2] = [rng.gen(), rng.gen()];
            let y: [f64; 2] = [2.0 * rng.gen::<f64>(), 2.0 * rng.gen::<f64>()];
            let bbox = BoundingBox::new([
                x[0].min(x[1]),
                x[0].max(x[1]),
                y[0].min(y[1]),
                y[0].max(y[1]),
                0.0,
                1.0,
            ]);

            let expected = points
                .iter()
                .positions(|point| bbox.contains(point))
                .collect_vec();

            // Single precision may add points that are within rounding distance of the box.
            let found = locator.find_points_in_box(&bbox.outward_f32());
            assert!(expected.iter().all(|index| found.contains(index)));
            assert!(found
                .iter()
                .all(|&index| bbox.dilate(1e-6).contains(&points[index])));
        }
    }

    #[test]
    fn test_empty_locator() {
        let locator = BucketLocator::build(&[]).unwrap();
        assert!(locator
            .find_points_in_box(&BoundingBox::new([0.0, 1.0, 0.0, 1.0, 0.0, 1.0]))
            .is_empty());
    }

    #[test]
    fn test_point_on_upper_face_is_found() {
        let points = vec![[0.1, 0.2, 0.3], [0.7, 0.2, 0.3], [0.3, 0.9, 0.3]];
        let locator = BucketLocator::build(&points).unwrap();

        let bbox = BoundingBox::new([0.0, 0.7, 0.0, 1.0, 0.0, 1.0]);
        assert_eq!(locator.find_points_in_box(&bbox.outward_f32()), vec![0, 1, 2]);
    }

    #[test]
    fn test_rejects_non_finite_points() {
        assert!(BucketLocator::build(&[[0.0, f64::NAN, 0.0]]).is_err());
    }
}
