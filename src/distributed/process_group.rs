//! The process-level communication primitive.
//!
//! A [`ProcessGroup`] connects the `P` processes of a run. The threaded
//! backend only needs a handful of blocking collectives from it, each called
//! by every process in the same order.
//!
//! [`ChannelProcessGroup`] simulates `P` processes inside one OS process: each
//! endpoint is meant to be driven from its own thread, and every ordered pair
//! of endpoints is connected by a dedicated `crossbeam` channel so messages
//! between two peers stay FIFO.

use crate::error::{Result, SyncError};
use crossbeam::channel::{unbounded, Receiver, Sender};

/// Blocking collectives across processes.
///
/// All reductions are sums. Every process must call the same sequence of
/// operations; the group does not detect mismatched call orders.
pub trait ProcessGroup: Send + Sync {
    fn my_rank(&self) -> usize;

    fn num_processes(&self) -> usize;

    /// Returns once every process has entered the barrier.
    fn barrier(&self) -> Result<()>;

    /// `send` holds `num_processes` blocks of `recv.len()` elements. Block `i`
    /// of every process is summed into `recv` of process `i`.
    fn reduce_scatter_block(&self, send: &[f32], recv: &mut [f32]) -> Result<()>;

    /// Concatenates every process's `send` in process order into `recv`.
    fn all_gather(&self, send: &[f32], recv: &mut [f32]) -> Result<()>;

    /// Replaces `buf` on every process with the contents of `buf` on `root`.
    fn broadcast(&self, buf: &mut Vec<f32>, root: usize) -> Result<()>;

    /// Byte-level variant of [`broadcast`](Self::broadcast), used for the
    /// collective-library rendezvous key.
    fn broadcast_bytes(&self, buf: &mut Vec<u8>, root: usize) -> Result<()>;
}

/// The trivial group of one process.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn my_rank(&self) -> usize {
        0
    }

    fn num_processes(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn reduce_scatter_block(&self, send: &[f32], recv: &mut [f32]) -> Result<()> {
        SyncError::check_len("reduce_scatter_block", recv.len(), send.len())?;
        recv.copy_from_slice(send);
        Ok(())
    }

    fn all_gather(&self, send: &[f32], recv: &mut [f32]) -> Result<()> {
        SyncError::check_len("all_gather", send.len(), recv.len())?;
        recv.copy_from_slice(send);
        Ok(())
    }

    fn broadcast(&self, _buf: &mut Vec<f32>, root: usize) -> Result<()> {
        check_root(root, 1)
    }

    fn broadcast_bytes(&self, _buf: &mut Vec<u8>, root: usize) -> Result<()> {
        check_root(root, 1)
    }
}

#[derive(Debug)]
enum Payload {
    F32(Vec<f32>),
    Bytes(Vec<u8>),
    Token,
}

impl Payload {
    fn kind(&self) -> &'static str {
        match self {
            Payload::F32(_) => "f32",
            Payload::Bytes(_) => "bytes",
            Payload::Token => "token",
        }
    }
}

/// One endpoint of an in-process mesh of simulated processes.
pub struct ChannelProcessGroup {
    rank: usize,
    size: usize,
    // Indexed by peer rank. The self entries exist but are never used.
    to_peer: Vec<Sender<Payload>>,
    from_peer: Vec<Receiver<Payload>>,
}

impl ChannelProcessGroup {
    /// Creates a fully connected mesh of `num_processes` endpoints, returned
    /// in rank order.
    pub fn create(num_processes: usize) -> Result<Vec<ChannelProcessGroup>> {
        if num_processes == 0 {
            return Err(SyncError::InvalidConfig(
                "process group needs at least one process".to_string(),
            ));
        }
        // links[src][dst]
        let mut senders: Vec<Vec<Sender<Payload>>> = (0..num_processes).map(|_| Vec::new()).collect();
        let mut receivers: Vec<Vec<Option<Receiver<Payload>>>> = (0..num_processes)
            .map(|_| (0..num_processes).map(|_| None).collect())
            .collect();
        for (src, row) in senders.iter_mut().enumerate() {
            for dst_receivers in receivers.iter_mut() {
                let (tx, rx) = unbounded();
                row.push(tx);
                dst_receivers[src] = Some(rx);
            }
        }

        let groups = senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (to_peer, from_peer))| ChannelProcessGroup {
                rank,
                size: num_processes,
                to_peer,
                from_peer: from_peer.into_iter().flatten().collect(),
            })
            .collect();
        Ok(groups)
    }

    fn send(&self, peer: usize, payload: Payload) -> Result<()> {
        self.to_peer[peer]
            .send(payload)
            .map_err(|_| SyncError::Comm(format!("process {} disconnected from {}", self.rank, peer)))
    }

    fn recv(&self, peer: usize) -> Result<Payload> {
        self.from_peer[peer]
            .recv()
            .map_err(|_| SyncError::Comm(format!("process {} lost peer {}", self.rank, peer)))
    }

    fn recv_f32(&self, peer: usize) -> Result<Vec<f32>> {
        match self.recv(peer)? {
            Payload::F32(v) => Ok(v),
            other => Err(unexpected(peer, "f32", &other)),
        }
    }

    fn peers(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.size).filter(move |&p| p != self.rank)
    }

    /// Concatenates variable-sized contributions: process `i` sends
    /// `counts[i]` elements.
    pub(crate) fn all_gather_v(&self, send: &[f32], recv: &mut [f32], counts: &[usize]) -> Result<()> {
        SyncError::check_len("all_gather counts", self.size, counts.len())?;
        SyncError::check_len("all_gather send", counts[self.rank], send.len())?;
        SyncError::check_len("all_gather recv", counts.iter().sum(), recv.len())?;

        for peer in self.peers() {
            self.send(peer, Payload::F32(send.to_vec()))?;
        }
        let mut offset = 0;
        for (src, &count) in counts.iter().enumerate() {
            let dst = &mut recv[offset..offset + count];
            if src == self.rank {
                dst.copy_from_slice(send);
            } else {
                let part = self.recv_f32(src)?;
                SyncError::check_len("all_gather peer block", count, part.len())?;
                dst.copy_from_slice(&part);
            }
            offset += count;
        }
        Ok(())
    }

    /// Sums `buf` across all processes, in process order, leaving the same
    /// result everywhere.
    pub(crate) fn all_reduce(&self, buf: &mut [f32]) -> Result<()> {
        for peer in self.peers() {
            self.send(peer, Payload::F32(buf.to_vec()))?;
        }
        let own = buf.to_vec();
        buf.iter_mut().for_each(|x| *x = 0.0);
        for src in 0..self.size {
            let part = if src == self.rank {
                own.clone()
            } else {
                self.recv_f32(src)?
            };
            SyncError::check_len("all_reduce peer buffer", buf.len(), part.len())?;
            buf.iter_mut().zip(&part).for_each(|(b, p)| *b += *p);
        }
        Ok(())
    }
}

fn unexpected(peer: usize, wanted: &str, got: &Payload) -> SyncError {
    SyncError::Comm(format!(
        "expected {wanted} message from process {peer}, got {}",
        got.kind()
    ))
}

fn check_root(root: usize, size: usize) -> Result<()> {
    if root >= size {
        return Err(SyncError::InvalidConfig(format!(
            "broadcast root {root} out of range for {size} processes"
        )));
    }
    Ok(())
}

impl ProcessGroup for ChannelProcessGroup {
    fn my_rank(&self) -> usize {
        self.rank
    }

    fn num_processes(&self) -> usize {
        self.size
    }

    fn barrier(&self) -> Result<()> {
        for peer in self.peers() {
            self.send(peer, Payload::Token)?;
        }
        for peer in self.peers() {
            match self.recv(peer)? {
                Payload::Token => {}
                other => return Err(unexpected(peer, "token", &other)),
            }
        }
        Ok(())
    }

    fn reduce_scatter_block(&self, send: &[f32], recv: &mut [f32]) -> Result<()> {
        let block = recv.len();
        SyncError::check_len("reduce_scatter_block", block * self.size, send.len())?;

        for peer in self.peers() {
            let part = send[peer * block..(peer + 1) * block].to_vec();
            self.send(peer, Payload::F32(part))?;
        }

        // Sum in process order so every process rounds identically.
        recv.iter_mut().for_each(|x| *x = 0.0);
        for src in 0..self.size {
            if src == self.rank {
                let own = &send[src * block..(src + 1) * block];
                recv.iter_mut().zip(own).for_each(|(r, s)| *r += *s);
            } else {
                let part = self.recv_f32(src)?;
                SyncError::check_len("reduce_scatter_block peer block", block, part.len())?;
                recv.iter_mut().zip(&part).for_each(|(r, s)| *r += *s);
            }
        }
        Ok(())
    }

    fn all_gather(&self, send: &[f32], recv: &mut [f32]) -> Result<()> {
        let counts = vec![send.len(); self.size];
        self.all_gather_v(send, recv, &counts)
    }

    fn broadcast(&self, buf: &mut Vec<f32>, root: usize) -> Result<()> {
        check_root(root, self.size)?;
        if self.rank == root {
            for peer in self.peers() {
                self.send(peer, Payload::F32(buf.clone()))?;
            }
        } else {
            *buf = self.recv_f32(root)?;
        }
        Ok(())
    }

    fn broadcast_bytes(&self, buf: &mut Vec<u8>, root: usize) -> Result<()> {
        check_root(root, self.size)?;
        if self.rank == root {
            for peer in self.peers() {
                self.send(peer, Payload::Bytes(buf.clone()))?;
            }
        } else {
            match self.recv(root)? {
                Payload::Bytes(bytes) => *buf = bytes,
                other => return Err(unexpected(root, "bytes", &other)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_mesh<T, F>(n: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(ChannelProcessGroup) -> T + Send + Sync + Copy + 'static,
    {
        let handles: Vec<_> = ChannelProcessGroup::create(n)
            .unwrap()
            .into_iter()
            .map(|pg| thread::spawn(move || f(pg)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_single_process_is_identity() {
        let pg = SingleProcess;
        let mut recv = vec![0.0; 3];
        pg.reduce_scatter_block(&[1.0, 2.0, 3.0], &mut recv).unwrap();
        assert_eq!(recv, vec![1.0, 2.0, 3.0]);
        assert!(pg.broadcast(&mut vec![1.0], 1).is_err());
    }

    #[test]
    fn test_reduce_scatter_block() {
        // Process p sends [p, p, p+10, p+10]; block size 2.
        let results = run_mesh(2, |pg| {
            let p = pg.my_rank() as f32;
            let send = vec![p, p, p + 10.0, p + 10.0];
            let mut recv = vec![0.0; 2];
            pg.reduce_scatter_block(&send, &mut recv).unwrap();
            recv
        });
        assert_eq!(results[0], vec![1.0, 1.0]);
        assert_eq!(results[1], vec![21.0, 21.0]);
    }

    #[test]
    fn test_all_gather_and_broadcast() {
        let results = run_mesh(3, |pg| {
            let mut gathered = vec![0.0; 3];
            pg.all_gather(&[pg.my_rank() as f32], &mut gathered).unwrap();

            let mut buf = if pg.my_rank() == 2 { vec![7.0, 8.0] } else { Vec::new() };
            pg.broadcast(&mut buf, 2).unwrap();

            let mut key = if pg.my_rank() == 0 { b"key".to_vec() } else { Vec::new() };
            pg.broadcast_bytes(&mut key, 0).unwrap();
            pg.barrier().unwrap();
            (gathered, buf, key)
        });
        for (gathered, buf, key) in results {
            assert_eq!(gathered, vec![0.0, 1.0, 2.0]);
            assert_eq!(buf, vec![7.0, 8.0]);
            assert_eq!(key, b"key".to_vec());
        }
    }

    #[test]
    fn test_disconnected_peer_is_an_error() {
        let mut groups = ChannelProcessGroup::create(2).unwrap();
        drop(groups.pop());
        let pg = groups.pop().unwrap();
        assert!(matches!(pg.barrier(), Err(SyncError::Comm(_))));
    }
}
