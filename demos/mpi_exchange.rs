//! Exchange points into a box that covers the whole domain.

use bempp_distribute::{
    geometry::global_bounding_box,
    group::MpiGroup,
    tools::{generate_random_points, global_size, seeded_rng},
    ProcessGroup, RegionPointExchanger,
};

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();

    let group = MpiGroup::new(universe.world());

    let mut rng = seeded_rng(group.rank());

    let npoints = 100;

    let points = generate_random_points(npoints, &mut rng, &group).unwrap();

    // Every rank asks for the global bounding box, so every rank receives all points.

    let everything = global_bounding_box(&points.bounding_box(), &group).unwrap();

    let exchanged = RegionPointExchanger::new(&group)
        .exchange(&points, &everything)
        .unwrap();

    let total = global_size(&points, &group).unwrap();
    assert_eq!(exchanged.len(), total);

    if group.rank() == 0 {
        println!("Every rank received all {} points.", total);
    }
}
