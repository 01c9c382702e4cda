//! Distribute random points and build ghost regions around the local regions.

use bempp_distribute::{
    group::MpiGroup,
    tools::{generate_random_points, seeded_rng},
    DistributedPointCloud, GhostRadius, GhostRegionBuilder, ProcessGroup,
};

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();

    let group = MpiGroup::new(universe.world());
    let rank = group.rank();

    let mut rng = seeded_rng(rank);

    let points = generate_random_points(1000, &mut rng, &group).unwrap();

    // Move the points into compact regions first.

    let distributed = DistributedPointCloud::new(Some(&group))
        .distribute(&points)
        .unwrap();

    // Add a layer of 5% of the region size around each region.

    let ghosts = GhostRegionBuilder::new(Some(&group), GhostRadius::Relative(0.05))
        .build(&distributed)
        .unwrap();

    if group.size() > 1 {
        assert!(ghosts.ghosts_created());
    }

    println!(
        "Rank {} owns {} points and holds {} ghost points.",
        rank,
        distributed.len(),
        ghosts.number_of_ghosts()
    );
}
