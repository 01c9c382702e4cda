//! Geometry information

use crate::{
    group::ProcessGroup,
    types::{ReduceOp, Result},
};

/// A point in three dimensions.
pub type Point = [f64; 3];

/// An axis aligned bounding box.
///
/// The coordinates are stored as `[xmin, xmax, ymin, ymax, zmin, zmax]`.
/// A box without points uses the sentinels `+f64::MAX` for the lower and
/// `-f64::MAX` for the upper bounds, so that it is a neutral element for
/// min/max reductions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    bounds: [f64; 6],
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::empty()
    }
}

impl BoundingBox {
    /// Create a new bounding box from `[xmin, xmax, ymin, ymax, zmin, zmax]`.
    pub fn new(bounds: [f64; 6]) -> Self {
        Self { bounds }
    }

    /// Create a box from its lower and upper corner.
    pub fn from_corners(lower: [f64; 3], upper: [f64; 3]) -> Self {
        Self::new([lower[0], upper[0], lower[1], upper[1], lower[2], upper[2]])
    }

    /// The box of an empty point set.
    pub fn empty() -> Self {
        Self::from_corners([f64::MAX; 3], [-f64::MAX; 3])
    }

    /// Compute the bounding box of a slice of points.
    pub fn from_points(points: &[Point]) -> Self {
        let mut bbox = Self::empty();
        for point in points {
            bbox.include(point);
        }
        bbox
    }

    /// Grow the box so that it contains `point`.
    pub fn include(&mut self, point: &Point) {
        for (axis, &coord) in point.iter().enumerate() {
            self.bounds[2 * axis] = f64::min(self.bounds[2 * axis], coord);
            self.bounds[2 * axis + 1] = f64::max(self.bounds[2 * axis + 1], coord);
        }
    }

    /// Return the bounds `[xmin, xmax, ymin, ymax, zmin, zmax]`.
    pub fn bounds(&self) -> [f64; 6] {
        self.bounds
    }

    /// Lower corner of the box.
    pub fn lower(&self) -> [f64; 3] {
        [self.bounds[0], self.bounds[2], self.bounds[4]]
    }

    /// Upper corner of the box.
    pub fn upper(&self) -> [f64; 3] {
        [self.bounds[1], self.bounds[3], self.bounds[5]]
    }

    /// A box is valid if `min <= max` along every axis.
    pub fn is_valid(&self) -> bool {
        (0..3).all(|axis| self.bounds[2 * axis] <= self.bounds[2 * axis + 1])
    }

    /// Length of the box along `axis`. Negative for an empty box.
    pub fn extent(&self, axis: usize) -> f64 {
        self.bounds[2 * axis + 1] - self.bounds[2 * axis]
    }

    /// Index of the longest axis.
    ///
    /// Ties are resolved towards the first axis.
    pub fn longest_axis(&self) -> usize {
        let mut axis = 0;
        let mut length = self.extent(0);
        for candidate in 1..3 {
            if length < self.extent(candidate) {
                axis = candidate;
                length = self.extent(candidate);
            }
        }
        axis
    }

    /// Test if a point is inside the box. Points on the boundary are inside.
    pub fn contains(&self, point: &Point) -> bool {
        (0..3).all(|axis| {
            self.bounds[2 * axis] <= point[axis] && point[axis] <= self.bounds[2 * axis + 1]
        })
    }

    /// Test if two boxes overlap by more than a shared boundary plane.
    pub fn overlaps_interior(&self, other: &BoundingBox) -> bool {
        (0..3).all(|axis| {
            self.bounds[2 * axis] < other.bounds[2 * axis + 1]
                && other.bounds[2 * axis] < self.bounds[2 * axis + 1]
        })
    }

    /// The smallest box containing both boxes.
    pub fn merge(&self, other: &BoundingBox) -> BoundingBox {
        let mut bounds = self.bounds;
        for axis in 0..3 {
            bounds[2 * axis] = f64::min(bounds[2 * axis], other.bounds[2 * axis]);
            bounds[2 * axis + 1] = f64::max(bounds[2 * axis + 1], other.bounds[2 * axis + 1]);
        }
        BoundingBox::new(bounds)
    }

    /// Move all six faces outwards by `radius`.
    ///
    /// An invalid box stays unchanged.
    pub fn dilate(&self, radius: f64) -> BoundingBox {
        if !self.is_valid() {
            return *self;
        }
        let mut bounds = self.bounds;
        for axis in 0..3 {
            bounds[2 * axis] -= radius;
            bounds[2 * axis + 1] += radius;
        }
        BoundingBox::new(bounds)
    }

    /// Round the bounds to single precision and move them one representable step outwards.
    ///
    /// Point locators compare coordinates in single precision. A point that lies exactly on
    /// the boundary of the double precision box must still be found after the cast.
    pub fn outward_f32(&self) -> BoundingBox {
        if !self.is_valid() {
            return *self;
        }
        let mut bounds = self.bounds;
        for axis in 0..3 {
            bounds[2 * axis] = f32_step_down(bounds[2 * axis] as f32) as f64;
            bounds[2 * axis + 1] = f32_step_up(bounds[2 * axis + 1] as f32) as f64;
        }
        BoundingBox::new(bounds)
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [xmin, xmax, ymin, ymax, zmin, zmax] = self.bounds;

        write!(
            f,
            "(xmin: {}, xmax: {}, ymin: {}, ymax: {}, zmin: {}, zmax: {})",
            xmin, xmax, ymin, ymax, zmin, zmax
        )
    }
}

/// The next representable single precision value above `value`.
pub fn f32_step_up(value: f32) -> f32 {
    if value.is_nan() || value == f32::INFINITY {
        return value;
    }
    if value == 0.0 {
        return f32::from_bits(1);
    }
    let bits = value.to_bits();
    if value > 0.0 {
        f32::from_bits(bits + 1)
    } else {
        f32::from_bits(bits - 1)
    }
}

/// The next representable single precision value below `value`.
pub fn f32_step_down(value: f32) -> f32 {
    -f32_step_up(-value)
}

/// Compute the combined bounding box of the local boxes of all ranks in `group`.
///
/// Ranks without points contribute [BoundingBox::empty], which does not change
/// the result.
pub fn global_bounding_box<G: ProcessGroup>(local: &BoundingBox, group: &G) -> Result<BoundingBox> {
    let lower = group.all_reduce_f64(&local.lower(), ReduceOp::Min)?;
    let upper = group.all_reduce_f64(&local.upper(), ReduceOp::Max)?;

    Ok(BoundingBox::from_corners(
        [lower[0], lower[1], lower[2]],
        [upper[0], upper[1], upper[2]],
    ))
}

#[cfg(test)]
mod test {
    use super::{f32_step_down, f32_step_up, BoundingBox};

    #[test]
    fn test_longest_axis_prefers_first_on_ties() {
        let bbox = BoundingBox::new([0.0, 2.0, 0.0, 2.0, 0.0, 1.0]);
        assert_eq!(bbox.longest_axis(), 0);

        let bbox = BoundingBox::new([0.0, 1.0, 0.0, 2.0, 0.0, 2.0]);
        assert_eq!(bbox.longest_axis(), 1);

        let bbox = BoundingBox::new([0.0, 1.0, 0.0, 1.0, 0.0, 3.0]);
        assert_eq!(bbox.longest_axis(), 2);
    }

    #[test]
    fn test_empty_box_is_neutral() {
        let empty = BoundingBox::empty();
        assert!(!empty.is_valid());

        let bbox = BoundingBox::from_points(&[[1.0, 2.0, 3.0], [-1.0, 0.5, 4.0]]);
        assert_eq!(empty.merge(&bbox), bbox);
        assert_eq!(bbox.bounds(), [-1.0, 1.0, 0.5, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_dilate_and_contains() {
        let bbox = BoundingBox::new([0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
        assert!(bbox.contains(&[1.0, 0.0, 0.5]));
        assert!(!bbox.contains(&[1.1, 0.0, 0.5]));
        assert!(bbox.dilate(0.2).contains(&[1.1, -0.2, 0.5]));
        assert_eq!(BoundingBox::empty().dilate(1.0), BoundingBox::empty());
    }

    #[test]
    fn test_outward_f32_contains_original_bounds() {
        let bbox = BoundingBox::new([0.1, 0.7, -0.3, 1.0 / 3.0, 0.0, 1e-9]);
        let outer = bbox.outward_f32();
        for axis in 0..3 {
            assert!(outer.lower()[axis] < bbox.lower()[axis]);
            assert!(outer.upper()[axis] > bbox.upper()[axis]);
            assert!((outer.lower()[axis] as f32) < bbox.lower()[axis] as f32);
            assert!((outer.upper()[axis] as f32) > bbox.upper()[axis] as f32);
        }
    }

    #[test]
    fn test_f32_steps() {
        assert!(f32_step_up(1.0) > 1.0);
        assert!(f32_step_down(1.0) < 1.0);
        assert!(f32_step_up(-1.0) > -1.0);
        assert!(f32_step_down(0.0) < 0.0);
        assert_eq!(f32_step_down(f32_step_up(2.5)), 2.5);
    }
}
