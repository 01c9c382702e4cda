//! Process groups whose ranks are threads of the current process.

use std::{
    cell::Cell,
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use itertools::Itertools;
use parking_lot::{Condvar, Mutex};

use super::{InFlight, ProcessGroup};
use crate::types::{DistributeError, ReduceOp, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Channel {
    Point(i32),
    Collective(u64),
}

/// Address of a message. Ranks are indices into the fabric, not group ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Envelope {
    context: u64,
    source: usize,
    dest: usize,
    channel: Channel,
}

/// Shared mailboxes of all ranks.
struct Fabric {
    mailboxes: Mutex<HashMap<Envelope, VecDeque<Vec<u8>>>>,
    delivered: Condvar,
    next_context: AtomicU64,
}

impl Fabric {
    fn new() -> Self {
        Self {
            mailboxes: Mutex::new(HashMap::new()),
            delivered: Condvar::new(),
            // Context 0 is the group of all ranks.
            next_context: AtomicU64::new(1),
        }
    }

    fn post(&self, envelope: Envelope, message: Vec<u8>) {
        let mut mailboxes = self.mailboxes.lock();
        mailboxes.entry(envelope).or_default().push_back(message);
        self.delivered.notify_all();
    }

    fn pop(
        mailboxes: &mut HashMap<Envelope, VecDeque<Vec<u8>>>,
        envelope: &Envelope,
    ) -> Option<Vec<u8>> {
        let queue = mailboxes.get_mut(envelope)?;
        let message = queue.pop_front();
        if queue.is_empty() {
            mailboxes.remove(envelope);
        }
        message
    }

    fn try_take(&self, envelope: &Envelope) -> Option<Vec<u8>> {
        Self::pop(&mut self.mailboxes.lock(), envelope)
    }

    /// Wait for a message. Returns `None` if the timeout expires first.
    fn take(&self, envelope: &Envelope, timeout: Option<Duration>) -> Option<Vec<u8>> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut mailboxes = self.mailboxes.lock();
        loop {
            if let Some(message) = Self::pop(&mut mailboxes, envelope) {
                return Some(message);
            }
            match deadline {
                None => self.delivered.wait(&mut mailboxes),
                Some(deadline) => {
                    if self
                        .delivered
                        .wait_until(&mut mailboxes, deadline)
                        .timed_out()
                    {
                        return Self::pop(&mut mailboxes, envelope);
                    }
                }
            }
        }
    }
}

/// A process group whose ranks are threads sharing one message fabric.
///
/// Sends are buffered and complete immediately. Receives block until a
/// matching message arrives, or until the optional timeout expires.
pub struct LocalGroup {
    fabric: Arc<Fabric>,
    context: u64,
    members: Arc<Vec<usize>>,
    rank: usize,
    collective_sequence: Cell<u64>,
    timeout: Option<Duration>,
}

impl LocalGroup {
    /// Create the handles of all ranks of a new group with `size` ranks.
    pub fn create(size: usize) -> Vec<LocalGroup> {
        let fabric = Arc::new(Fabric::new());
        let members = Arc::new((0..size).collect_vec());
        (0..size)
            .map(|rank| LocalGroup {
                fabric: fabric.clone(),
                context: 0,
                members: members.clone(),
                rank,
                collective_sequence: Cell::new(0),
                timeout: None,
            })
            .collect()
    }

    /// Fail receives that take longer than `timeout` with [DistributeError::Timeout].
    ///
    /// Groups created by [ProcessGroup::split] inherit the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer < self.members.len() {
            Ok(())
        } else {
            Err(DistributeError::Communication(format!(
                "rank {} is not in a group of size {}",
                peer,
                self.members.len()
            )))
        }
    }

    fn outgoing(&self, dest: usize, channel: Channel) -> Envelope {
        Envelope {
            context: self.context,
            source: self.members[self.rank],
            dest: self.members[dest],
            channel,
        }
    }

    fn incoming(&self, source: usize, channel: Channel) -> Envelope {
        Envelope {
            context: self.context,
            source: self.members[source],
            dest: self.members[self.rank],
            channel,
        }
    }

    fn take(&self, source: usize, channel: Channel, tag: i32) -> Result<Vec<u8>> {
        self.fabric
            .take(&self.incoming(source, channel), self.timeout)
            .ok_or(DistributeError::Timeout {
                source_rank: source,
                tag,
            })
    }

    fn next_collective(&self) -> Channel {
        let sequence = self.collective_sequence.get();
        self.collective_sequence.set(sequence + 1);
        Channel::Collective(sequence)
    }

    /// Send `payload` to every rank and receive the payloads of all ranks in rank order.
    fn exchange_all(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>> {
        let channel = self.next_collective();
        let size = self.size();

        for dest in (0..size).filter(|&dest| dest != self.rank) {
            self.fabric
                .post(self.outgoing(dest, channel), payload.to_vec());
        }

        (0..size)
            .map(|source| {
                if source == self.rank {
                    Ok(payload.to_vec())
                } else {
                    self.take(source, channel, -1)
                }
            })
            .collect()
    }

    /// Collect the payloads of all ranks on `root`.
    fn gather_to(&self, payload: &[u8], root: usize) -> Result<Option<Vec<Vec<u8>>>> {
        self.check_peer(root)?;
        let channel = self.next_collective();

        if self.rank != root {
            self.fabric.post(self.outgoing(root, channel), payload.to_vec());
            return Ok(None);
        }

        let payloads = (0..self.size())
            .map(|source| {
                if source == root {
                    Ok(payload.to_vec())
                } else {
                    self.take(source, channel, -1)
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(payloads))
    }

    fn all_gather<T: bytemuck::Pod>(&self, local: &[T]) -> Result<Vec<T>> {
        let payloads = self.exchange_all(bytemuck::cast_slice(local))?;
        let mut gathered = Vec::with_capacity(local.len() * payloads.len());
        for payload in payloads {
            let values = decode::<T>(&payload);
            if values.len() != local.len() {
                return Err(DistributeError::Communication(format!(
                    "all-gather contributions of {} and {} values",
                    local.len(),
                    values.len()
                )));
            }
            gathered.extend(values);
        }
        Ok(gathered)
    }

    /// Fold the payloads of all ranks in rank order, so that every rank computes the same result.
    fn reduce_payloads<T: bytemuck::Pod>(
        len: usize,
        payloads: Vec<Vec<u8>>,
        fold: impl Fn(&mut [T], &[T]),
    ) -> Result<Vec<T>> {
        let mut result: Option<Vec<T>> = None;
        for payload in payloads {
            let values = decode::<T>(&payload);
            if values.len() != len {
                return Err(DistributeError::Communication(format!(
                    "reduction over {} and {} values",
                    len,
                    values.len()
                )));
            }
            match result.as_mut() {
                None => result = Some(values),
                Some(acc) => fold(acc.as_mut_slice(), values.as_slice()),
            }
        }
        Ok(result.unwrap_or_default())
    }
}

fn decode<T: bytemuck::Pod>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

/// A receive from a [LocalGroup].
pub struct LocalReceive<'g> {
    group: &'g LocalGroup,
    source: usize,
    tag: i32,
    completed: bool,
}

impl InFlight for LocalReceive<'_> {
    type Output = Vec<u8>;

    fn test(&mut self) -> Result<Option<Vec<u8>>> {
        if self.completed {
            return Err(DistributeError::Communication(
                "receive tested after completion".to_string(),
            ));
        }
        let message = self
            .group
            .fabric
            .try_take(&self.group.incoming(self.source, Channel::Point(self.tag)));
        self.completed = message.is_some();
        Ok(message)
    }

    fn wait(self) -> Result<Vec<u8>> {
        if self.completed {
            return Err(DistributeError::Communication(
                "receive waited after completion".to_string(),
            ));
        }
        self.group
            .take(self.source, Channel::Point(self.tag), self.tag)
    }
}

/// A send to a [LocalGroup]. Sends are buffered, so it is always complete.
pub struct LocalSend {
    completed: bool,
}

impl InFlight for LocalSend {
    type Output = ();

    fn test(&mut self) -> Result<Option<()>> {
        if self.completed {
            return Err(DistributeError::Communication(
                "send tested after completion".to_string(),
            ));
        }
        self.completed = true;
        Ok(Some(()))
    }

    fn wait(self) -> Result<()> {
        Ok(())
    }
}

impl ProcessGroup for LocalGroup {
    type SendRequest<'g> = LocalSend;
    type ReceiveRequest<'g> = LocalReceive<'g>;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn send(&self, dest: usize, tag: i32, buffer: &[u8]) -> Result<()> {
        self.check_peer(dest)?;
        self.fabric
            .post(self.outgoing(dest, Channel::Point(tag)), buffer.to_vec());
        Ok(())
    }

    fn receive(&self, source: usize, tag: i32) -> Result<Vec<u8>> {
        self.check_peer(source)?;
        self.take(source, Channel::Point(tag), tag)
    }

    fn immediate_send(&self, dest: usize, tag: i32, buffer: Vec<u8>) -> Result<LocalSend> {
        self.check_peer(dest)?;
        self.fabric
            .post(self.outgoing(dest, Channel::Point(tag)), buffer);
        Ok(LocalSend { completed: false })
    }

    fn immediate_receive(&self, source: usize, tag: i32) -> Result<LocalReceive<'_>> {
        self.check_peer(source)?;
        Ok(LocalReceive {
            group: self,
            source,
            tag,
            completed: false,
        })
    }

    fn all_reduce_f64(&self, local: &[f64], op: ReduceOp) -> Result<Vec<f64>> {
        let payloads = self.exchange_all(bytemuck::cast_slice(local))?;
        Self::reduce_payloads(local.len(), payloads, |acc, other| op.fold_f64(acc, other))
    }

    fn all_reduce_u64(&self, local: &[u64], op: ReduceOp) -> Result<Vec<u64>> {
        let payloads = self.exchange_all(bytemuck::cast_slice(local))?;
        Self::reduce_payloads(local.len(), payloads, |acc, other| op.fold_u64(acc, other))
    }

    fn reduce_u64(&self, local: &[u64], op: ReduceOp, root: usize) -> Result<Option<Vec<u64>>> {
        match self.gather_to(bytemuck::cast_slice(local), root)? {
            Some(payloads) => Ok(Some(Self::reduce_payloads(
                local.len(),
                payloads,
                |acc, other| op.fold_u64(acc, other),
            )?)),
            None => Ok(None),
        }
    }

    fn all_gather_f64(&self, local: &[f64]) -> Result<Vec<f64>> {
        self.all_gather(local)
    }

    fn all_gather_u64(&self, local: &[u64]) -> Result<Vec<u64>> {
        self.all_gather(local)
    }

    fn broadcast_u64(&self, buffer: &mut [u64], root: usize) -> Result<()> {
        self.check_peer(root)?;
        let channel = self.next_collective();

        if self.rank == root {
            for dest in (0..self.size()).filter(|&dest| dest != root) {
                self.fabric
                    .post(self.outgoing(dest, channel), bytemuck::cast_slice(buffer).to_vec());
            }
            return Ok(());
        }

        let values = decode::<u64>(&self.take(root, channel, -1)?);
        if values.len() != buffer.len() {
            return Err(DistributeError::Communication(format!(
                "broadcast of {} values into a buffer of {}",
                values.len(),
                buffer.len()
            )));
        }
        buffer.copy_from_slice(&values);
        Ok(())
    }

    fn split(&self, color: usize, key: usize) -> Result<LocalGroup> {
        let entries = self.all_gather_u64(&[color as u64, key as u64])?;

        // Rank 0 hands out one fresh context per color so that the new groups
        // cannot receive each other's messages.

        let colors = entries.iter().step_by(2).copied().sorted().dedup().collect_vec();
        let mut contexts = vec![0; colors.len()];
        if self.rank == 0 {
            for context in contexts.iter_mut() {
                *context = self.fabric.next_context.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.broadcast_u64(&mut contexts, 0)?;

        let color_index = colors.binary_search(&(color as u64)).map_err(|_| {
            DistributeError::Communication(format!("color {} missing after split", color))
        })?;

        let ordered = entries
            .chunks_exact(2)
            .enumerate()
            .filter(|(_, entry)| entry[0] == color as u64)
            .map(|(rank, entry)| (entry[1], rank))
            .sorted()
            .map(|(_, rank)| rank)
            .collect_vec();

        let new_rank = ordered
            .iter()
            .position(|&rank| rank == self.rank)
            .ok_or_else(|| {
                DistributeError::Communication("rank missing after split".to_string())
            })?;

        Ok(LocalGroup {
            fabric: self.fabric.clone(),
            context: contexts[color_index],
            members: Arc::new(ordered.iter().map(|&rank| self.members[rank]).collect()),
            rank: new_rank,
            collective_sequence: Cell::new(0),
            timeout: self.timeout,
        })
    }

    fn barrier(&self) -> Result<()> {
        self.exchange_all(&[])?;
        Ok(())
    }
}

/// Run `f` on `nranks` ranks, each in its own thread, and return the results in rank order.
///
/// A panic on any rank is propagated. A rank that waits for a message that never
/// arrives blocks forever; use [run_local_with_timeout] to turn this into an error.
pub fn run_local<R, F>(nranks: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(LocalGroup) -> R + Sync,
{
    run_groups(LocalGroup::create(nranks), f)
}

/// Like [run_local], with a receive timeout on every rank.
pub fn run_local_with_timeout<R, F>(nranks: usize, timeout: Duration, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(LocalGroup) -> R + Sync,
{
    run_groups(
        LocalGroup::create(nranks)
            .into_iter()
            .map(|group| group.with_timeout(timeout))
            .collect(),
        f,
    )
}

fn run_groups<R, F>(groups: Vec<LocalGroup>, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(LocalGroup) -> R + Sync,
{
    let f = &f;
    std::thread::scope(|scope| {
        let handles = groups
            .into_iter()
            .map(|group| scope.spawn(move || f(group)))
            .collect_vec();

        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(payload) => std::panic::resume_unwind(payload),
            })
            .collect()
    })
}
