//! Balance random points across MPI ranks and check the result on root.

use bempp_distribute::{
    group::MpiGroup,
    tools::{gather_to_root, generate_random_points, seeded_rng},
    ProcessGroup, SpatialHistogramBalancer,
};
use itertools::Itertools;

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();

    // Wrap the world communicator.
    let group = MpiGroup::new(universe.world());
    let rank = group.rank();

    // Initialise a seeded Rng.
    let mut rng = seeded_rng(rank);

    // Create `npoints` per rank.
    let npoints = 1000;

    let mut points = generate_random_points(npoints, &mut rng, &group).unwrap();

    // Balance the points.

    let region = SpatialHistogramBalancer::new(&group)
        .balance(&mut points)
        .unwrap();

    println!("Rank {} holds {} points in {}", rank, points.len(), region);

    // Gather everything on root and check that no point got lost.

    if let Some(gathered) = gather_to_root(&points, &group).unwrap() {
        let total = gathered.iter().map(|chunk| chunk.len()).sum::<usize>();
        assert_eq!(total, npoints * group.size());

        let regions = gathered
            .iter()
            .map(|chunk| chunk.bounding_box())
            .collect_vec();
        for (first, second) in regions.iter().tuple_combinations() {
            assert!(!first.overlaps_interior(second));
        }

        println!("Balancing of {} points successful.", total);
    }
}
