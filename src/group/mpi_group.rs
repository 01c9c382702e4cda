//! Process groups on top of MPI communicators.

use mpi::{
    collective::SystemOperation,
    request::{Request, StaticScope},
    topology::{Color, SimpleCommunicator},
    traits::{Communicator, CommunicatorCollectives, Destination, Root, Source},
};

use super::{InFlight, ProcessGroup};
use crate::types::{DistributeError, ReduceOp, Result};

fn system_operation(op: ReduceOp) -> SystemOperation {
    match op {
        ReduceOp::Min => SystemOperation::min(),
        ReduceOp::Max => SystemOperation::max(),
        ReduceOp::Sum => SystemOperation::sum(),
    }
}

/// A process group backed by an MPI communicator.
///
/// The communicator is freed when the group is dropped.
pub struct MpiGroup {
    comm: SimpleCommunicator,
}

impl MpiGroup {
    /// Wrap a communicator.
    pub fn new(comm: SimpleCommunicator) -> Self {
        Self { comm }
    }

    /// The wrapped communicator.
    pub fn comm(&self) -> &SimpleCommunicator {
        &self.comm
    }

    fn check_peer(&self, peer: usize) -> Result<i32> {
        if peer < self.size() {
            Ok(peer as i32)
        } else {
            Err(DistributeError::Communication(format!(
                "rank {} is not in a communicator of size {}",
                peer,
                self.size()
            )))
        }
    }
}

/// A non-blocking MPI send.
///
/// The send buffer is owned by the request and released after the send has
/// completed. Dropping an unfinished request waits for it.
pub struct MpiSend {
    request: Option<Request<'static, [u8]>>,
    buffer: Option<*mut [u8]>,
}

impl MpiSend {
    fn release(&mut self) {
        if let Some(request) = self.request.take() {
            request.wait();
        }
        if let Some(buffer) = self.buffer.take() {
            // The request no longer references the buffer.
            unsafe { drop(Box::from_raw(buffer)) };
        }
    }
}

impl InFlight for MpiSend {
    type Output = ();

    fn test(&mut self) -> Result<Option<()>> {
        let request = self.request.take().ok_or_else(|| {
            DistributeError::Communication("send tested after completion".to_string())
        })?;
        match request.test() {
            Ok(_status) => {
                self.release();
                Ok(Some(()))
            }
            Err(request) => {
                self.request = Some(request);
                Ok(None)
            }
        }
    }

    fn wait(mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MpiSend {
    fn drop(&mut self) {
        self.release();
    }
}

/// A non-blocking MPI receive.
///
/// Receives are matched by probing, so the message length does not need to be known.
pub struct MpiReceive<'g> {
    comm: &'g SimpleCommunicator,
    source: i32,
    tag: i32,
    completed: bool,
}

impl InFlight for MpiReceive<'_> {
    type Output = Vec<u8>;

    fn test(&mut self) -> Result<Option<Vec<u8>>> {
        if self.completed {
            return Err(DistributeError::Communication(
                "receive tested after completion".to_string(),
            ));
        }
        let process = self.comm.process_at_rank(self.source);
        match process.immediate_matched_probe_with_tag(self.tag) {
            Some((message, _status)) => {
                let (buffer, _status) = message.matched_receive_vec::<u8>();
                self.completed = true;
                Ok(Some(buffer))
            }
            None => Ok(None),
        }
    }

    fn wait(self) -> Result<Vec<u8>> {
        if self.completed {
            return Err(DistributeError::Communication(
                "receive waited after completion".to_string(),
            ));
        }
        let (buffer, _status) = self
            .comm
            .process_at_rank(self.source)
            .receive_vec_with_tag::<u8>(self.tag);
        Ok(buffer)
    }
}

impl ProcessGroup for MpiGroup {
    type SendRequest<'g> = MpiSend;
    type ReceiveRequest<'g> = MpiReceive<'g>;

    fn rank(&self) -> usize {
        self.comm.rank() as usize
    }

    fn size(&self) -> usize {
        self.comm.size() as usize
    }

    fn send(&self, dest: usize, tag: i32, buffer: &[u8]) -> Result<()> {
        let dest = self.check_peer(dest)?;
        self.comm.process_at_rank(dest).send_with_tag(buffer, tag);
        Ok(())
    }

    fn receive(&self, source: usize, tag: i32) -> Result<Vec<u8>> {
        let source = self.check_peer(source)?;
        let (buffer, _status) = self
            .comm
            .process_at_rank(source)
            .receive_vec_with_tag::<u8>(tag);
        Ok(buffer)
    }

    fn immediate_send(&self, dest: usize, tag: i32, buffer: Vec<u8>) -> Result<MpiSend> {
        let dest = self.check_peer(dest)?;

        // The buffer is leaked for the lifetime of the request and reclaimed
        // by `MpiSend::release` once MPI is done with it.

        let pointer = Box::into_raw(buffer.into_boxed_slice());
        let buffer: &'static [u8] = unsafe { &*pointer };
        let request = self
            .comm
            .process_at_rank(dest)
            .immediate_send_with_tag(StaticScope, buffer, tag);

        Ok(MpiSend {
            request: Some(request),
            buffer: Some(pointer),
        })
    }

    fn immediate_receive(&self, source: usize, tag: i32) -> Result<MpiReceive<'_>> {
        let source = self.check_peer(source)?;
        Ok(MpiReceive {
            comm: &self.comm,
            source,
            tag,
            completed: false,
        })
    }

    fn all_reduce_f64(&self, local: &[f64], op: ReduceOp) -> Result<Vec<f64>> {
        let mut result = vec![0.0; local.len()];
        self.comm
            .all_reduce_into(local, &mut result[..], system_operation(op));
        Ok(result)
    }

    fn all_reduce_u64(&self, local: &[u64], op: ReduceOp) -> Result<Vec<u64>> {
        let mut result = vec![0; local.len()];
        self.comm
            .all_reduce_into(local, &mut result[..], system_operation(op));
        Ok(result)
    }

    fn reduce_u64(&self, local: &[u64], op: ReduceOp, root: usize) -> Result<Option<Vec<u64>>> {
        let root = self.check_peer(root)?;
        let root_process = self.comm.process_at_rank(root);

        if self.comm.rank() == root {
            let mut result = vec![0; local.len()];
            root_process.reduce_into_root(local, &mut result[..], system_operation(op));
            Ok(Some(result))
        } else {
            root_process.reduce_into(local, system_operation(op));
            Ok(None)
        }
    }

    fn all_gather_f64(&self, local: &[f64]) -> Result<Vec<f64>> {
        let mut result = vec![0.0; local.len() * self.size()];
        self.comm.all_gather_into(local, &mut result[..]);
        Ok(result)
    }

    fn all_gather_u64(&self, local: &[u64]) -> Result<Vec<u64>> {
        let mut result = vec![0; local.len() * self.size()];
        self.comm.all_gather_into(local, &mut result[..]);
        Ok(result)
    }

    fn broadcast_u64(&self, buffer: &mut [u64], root: usize) -> Result<()> {
        let root = self.check_peer(root)?;
        self.comm.process_at_rank(root).broadcast_into(buffer);
        Ok(())
    }

    fn split(&self, color: usize, key: usize) -> Result<MpiGroup> {
        self.comm
            .split_by_color_with_key(Color::with_value(color as i32), key as i32)
            .map(MpiGroup::new)
            .ok_or_else(|| {
                DistributeError::Communication(format!(
                    "splitting the communicator with color {} failed",
                    color
                ))
            })
    }

    fn barrier(&self) -> Result<()> {
        self.comm.barrier();
        Ok(())
    }
}
