//! Definition of constants.

/// Number of bins of the histogram used to find a cut position.
pub const HISTOGRAM_SIZE: usize = 1024;

/// Tag of the point exchange between partners of a bisection round.
pub const EXCHANGE_POINT_TAG: i32 = 524821;

/// Tag of the messages of a region point exchange.
pub const REGION_EXCHANGE_TAG: i32 = 524822;

/// Target number of points per bucket of a [crate::locator::BucketLocator].
pub const BUCKET_TARGET_POINTS: usize = 16;

/// Largest number of buckets along one axis of a [crate::locator::BucketLocator].
pub const MAX_BUCKETS_PER_AXIS: usize = 128;

/// Name of the array storing the owning rank of each point of a ghost region.
pub const OWNER_RANK_ARRAY: &str = "OwnerRank";

/// Tag used to collect point sets on the root rank.
pub const GATHER_TAG: i32 = 524823;
