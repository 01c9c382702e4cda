//! Utility routines.

use itertools::Itertools;
use num::traits::Zero;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{
    constants::GATHER_TAG,
    group::ProcessGroup,
    point_set::{AttributeArray, AttributeData, PointSet},
    types::{ReduceOp, Result},
};

/// Name of the array with global point ids created by [generate_random_points].
pub const GLOBAL_ID_ARRAY: &str = "GlobalId";

/// Compute an inclusive cumulative sum.
///
/// For the array `[1, 3, 5, 7]` the output will be `[1, 4, 9, 16]`.
pub fn inclusive_cumsum<T: Zero + Copy>(arr: &[T]) -> Vec<T> {
    arr.iter()
        .scan(T::zero(), |state, &x| {
            *state = *state + x;
            Some(*state)
        })
        .collect_vec()
}

/// Get the global number of points of a distributed point set.
pub fn global_size<G: ProcessGroup>(points: &PointSet, group: &G) -> Result<usize> {
    let total = group.all_reduce_u64(&[points.len() as u64], ReduceOp::Sum)?;
    Ok(total[0] as usize)
}

/// Get the number of points on every rank.
pub fn point_counts<G: ProcessGroup>(points: &PointSet, group: &G) -> Result<Vec<usize>> {
    Ok(group
        .all_gather_u64(&[points.len() as u64])?
        .into_iter()
        .map(|count| count as usize)
        .collect_vec())
}

/// Gather the point sets of all ranks on rank 0.
///
/// The result is the vector of all local point sets, ordered by rank, on root
/// and `None` on all other ranks.
pub fn gather_to_root<G: ProcessGroup>(
    points: &PointSet,
    group: &G,
) -> Result<Option<Vec<PointSet>>> {
    if group.rank() != 0 {
        group.send(0, GATHER_TAG, &points.marshal()?)?;
        return Ok(None);
    }

    let mut gathered = Vec::with_capacity(group.size());
    gathered.push(points.clone());
    for source in 1..group.size() {
        gathered.push(PointSet::unmarshal(&group.receive(source, GATHER_TAG)?)?);
    }

    Ok(Some(gathered))
}

/// Generate random points in the unit cube for testing.
///
/// Each point carries a globally unique id in the array [GLOBAL_ID_ARRAY].
pub fn generate_random_points<R: Rng, G: ProcessGroup>(
    npoints: usize,
    rng: &mut R,
    group: &G,
) -> Result<PointSet> {
    let rank = group.rank();

    let mut points = Vec::with_capacity(npoints);
    for _ in 0..npoints {
        points.push([rng.gen(), rng.gen(), rng.gen()]);
    }

    let ids = (0..npoints)
        .map(|index| (npoints * rank + index) as i64)
        .collect_vec();

    let mut point_set = PointSet::from_points(points);
    point_set.add_array(AttributeArray::new(
        GLOBAL_ID_ARRAY,
        1,
        AttributeData::Int64(ids),
    ))?;

    Ok(point_set)
}

/// Get a seeded rng
pub fn seeded_rng(seed: usize) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed as u64)
}
