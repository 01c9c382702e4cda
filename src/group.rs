//! Process groups.
//!
//! The distribution algorithms only talk to other ranks through the
//! [ProcessGroup] trait. Two backends implement it:
//! - [LocalGroup], where every rank is a thread of the current process.
//! - `MpiGroup` (feature `mpi`), a wrapper around an MPI communicator.
mod local;
#[cfg(feature = "mpi")]
mod mpi_group;

pub use local::{run_local, run_local_with_timeout, LocalGroup};
#[cfg(feature = "mpi")]
pub use mpi_group::MpiGroup;

use crate::types::{ReduceOp, Result};

/// A non-blocking operation that is still in flight.
pub trait InFlight {
    /// Value produced on completion.
    type Output;

    /// Check for completion without blocking.
    ///
    /// Returns `Some` exactly once, when the operation has completed.
    fn test(&mut self) -> Result<Option<Self::Output>>;

    /// Block until the operation has completed.
    fn wait(self) -> Result<Self::Output>;
}

/// A group of ranks that communicate with each other.
///
/// Every collective method must be called by all ranks of the group in the
/// same order. A rank that skips a collective call deadlocks the group.
pub trait ProcessGroup: Sized {
    /// Handle of a non-blocking send.
    type SendRequest<'g>: InFlight<Output = ()>
    where
        Self: 'g;

    /// Handle of a non-blocking receive.
    type ReceiveRequest<'g>: InFlight<Output = Vec<u8>>
    where
        Self: 'g;

    /// Rank of the current process in the group.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Blocking send of a byte buffer.
    fn send(&self, dest: usize, tag: i32, buffer: &[u8]) -> Result<()>;

    /// Blocking receive of a message. The length is taken from the message.
    fn receive(&self, source: usize, tag: i32) -> Result<Vec<u8>>;

    /// Start a send. The request owns the buffer until the send has completed.
    fn immediate_send(&self, dest: usize, tag: i32, buffer: Vec<u8>)
        -> Result<Self::SendRequest<'_>>;

    /// Start a receive.
    fn immediate_receive(&self, source: usize, tag: i32) -> Result<Self::ReceiveRequest<'_>>;

    /// Elementwise reduction over all ranks. Every rank gets the result.
    fn all_reduce_f64(&self, local: &[f64], op: ReduceOp) -> Result<Vec<f64>>;

    /// Elementwise reduction over all ranks. Every rank gets the result.
    fn all_reduce_u64(&self, local: &[u64], op: ReduceOp) -> Result<Vec<u64>>;

    /// Elementwise reduction over all ranks. Only `root` gets the result.
    fn reduce_u64(&self, local: &[u64], op: ReduceOp, root: usize) -> Result<Option<Vec<u64>>>;

    /// Gather equally sized contributions of all ranks, ordered by rank.
    fn all_gather_f64(&self, local: &[f64]) -> Result<Vec<f64>>;

    /// Gather equally sized contributions of all ranks, ordered by rank.
    fn all_gather_u64(&self, local: &[u64]) -> Result<Vec<u64>>;

    /// Overwrite `buffer` on all ranks with its value on `root`.
    fn broadcast_u64(&self, buffer: &mut [u64], root: usize) -> Result<()>;

    /// Split the group.
    ///
    /// Ranks passing the same `color` end up in the same new group, ordered
    /// by `key` and then by their rank in `self`.
    fn split(&self, color: usize, key: usize) -> Result<Self>;

    /// Block until all ranks have arrived.
    fn barrier(&self) -> Result<()>;
}

/// Wait until at least one of the pending requests has completed.
///
/// The requests are tested in the order in which they are stored. All
/// requests that are found complete are removed from `pending` and returned
/// together with their key, which may be all of them. An empty `pending`
/// returns immediately.
pub fn wait_some<K, R: InFlight>(pending: &mut Vec<(K, R)>) -> Result<Vec<(K, R::Output)>> {
    let mut completed = Vec::new();

    while !pending.is_empty() {
        let mut still_pending = Vec::with_capacity(pending.len());
        for (key, mut request) in pending.drain(..) {
            match request.test()? {
                Some(output) => completed.push((key, output)),
                None => still_pending.push((key, request)),
            }
        }
        *pending = still_pending;

        if !completed.is_empty() {
            break;
        }
        std::thread::yield_now();
    }

    Ok(completed)
}

#[cfg(test)]
mod test {
    use itertools::Itertools;

    use super::{run_local, run_local_with_timeout, wait_some, InFlight, ProcessGroup};
    use crate::types::{DistributeError, ReduceOp};

    #[test]
    fn test_collectives() {
        let results = run_local(4, |group| {
            let rank = group.rank() as f64;
            let min = group.all_reduce_f64(&[rank, -rank], ReduceOp::Min).unwrap();
            let sum = group
                .all_reduce_u64(&[group.rank() as u64, 1], ReduceOp::Sum)
                .unwrap();
            let gathered = group.all_gather_u64(&[group.rank() as u64 * 10]).unwrap();
            let reduced = group
                .reduce_u64(&[group.rank() as u64], ReduceOp::Max, 0)
                .unwrap();

            let mut value = [group.rank() as u64 + 100];
            group.broadcast_u64(&mut value, 2).unwrap();
            group.barrier().unwrap();

            (min, sum, gathered, reduced, value[0])
        });

        for (rank, (min, sum, gathered, reduced, broadcast)) in results.into_iter().enumerate() {
            assert_eq!(min, vec![0.0, -3.0]);
            assert_eq!(sum, vec![6, 4]);
            assert_eq!(gathered, vec![0, 10, 20, 30]);
            if rank == 0 {
                assert_eq!(reduced, Some(vec![3]));
            } else {
                assert_eq!(reduced, None);
            }
            assert_eq!(broadcast, 102);
        }
    }

    #[test]
    fn test_split_orders_by_key() {
        let results = run_local(5, |group| {
            let color = group.rank() % 2;
            // Reverse the order inside each sub-group.
            let key = 10 - group.rank();
            let sub = group.split(color, key).unwrap();
            let members = sub.all_gather_u64(&[group.rank() as u64]).unwrap();
            (sub.rank(), sub.size(), members)
        });

        assert_eq!(results[0], (2, 3, vec![4, 2, 0]));
        assert_eq!(results[1], (1, 2, vec![3, 1]));
        assert_eq!(results[2], (1, 3, vec![4, 2, 0]));
        assert_eq!(results[3], (0, 2, vec![3, 1]));
        assert_eq!(results[4], (0, 3, vec![4, 2, 0]));
    }

    #[test]
    fn test_wait_some_returns_all_completed_requests() {
        let results = run_local(3, |group| {
            let rank = group.rank();
            if rank == 0 {
                group.barrier().unwrap();
                let mut pending = [1, 2]
                    .into_iter()
                    .map(|source| (source, group.immediate_receive(source, 7).unwrap()))
                    .collect_vec();
                // Both messages were sent before the barrier, so both complete at once.
                let completed = wait_some(&mut pending).unwrap();
                assert!(pending.is_empty());
                completed
                    .into_iter()
                    .map(|(source, message)| (source, message[0] as usize))
                    .sorted()
                    .collect_vec()
            } else {
                let request = group.immediate_send(0, 7, vec![rank as u8 * 3]).unwrap();
                request.wait().unwrap();
                group.barrier().unwrap();
                Vec::new()
            }
        });

        assert_eq!(results[0], vec![(1, 3), (2, 6)]);
    }

    #[test]
    fn test_receive_times_out() {
        let results = run_local_with_timeout(2, std::time::Duration::from_millis(50), |group| {
            if group.rank() == 0 {
                group.receive(1, 3).err()
            } else {
                None
            }
        });

        assert!(matches!(
            results[0],
            Some(DistributeError::Timeout {
                source_rank: 1,
                tag: 3
            })
        ));
    }
}
