//! Distributed communicator abstraction.
//!
//! Ranks share no memory and coordinate only through `broadcast` and
//! `gather` over serialized byte buffers. The default implementation is
//! the single-rank [`SelfCommunicator`]; an MPI-backed implementation
//! satisfies the same trait without any engine changes. By convention the
//! highest-numbered rank does all input scanning and metadata cache work.

use std::ops::Range;
use std::sync::Arc;

use crate::error::Result;

pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Replaces `bytes` on every non-root rank with the root's buffer.
    fn broadcast(&self, root: usize, bytes: &mut Vec<u8>) -> Result<()>;

    /// Collects every rank's buffer on the root; non-root ranks get `None`.
    fn gather(&self, root: usize, bytes: &[u8]) -> Result<Option<Vec<Vec<u8>>>>;

    /// The rank that scans inputs and owns the metadata cache.
    fn scan_rank(&self) -> usize {
        self.size() - 1
    }

    fn is_scan_rank(&self) -> bool {
        self.rank() == self.scan_rank()
    }
}

pub type CommRef = Arc<dyn Communicator>;

/// Single-process communicator: one rank, collectives are identities.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfCommunicator;

impl Communicator for SelfCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn broadcast(&self, _root: usize, _bytes: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn gather(&self, _root: usize, bytes: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
        Ok(Some(vec![bytes.to_vec()]))
    }
}

/// Contiguous block partition: rank `r` of `p` owns `[r*n/p, (r+1)*n/p)`.
pub fn block_partition(n: u64, size: usize, rank: usize) -> Range<u64> {
    let p = size as u64;
    let r = rank as u64;
    (r * n / p)..((r + 1) * n / p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_covers_everything_contiguously() {
        for n in [0u64, 1, 7, 64, 1000] {
            for p in [1usize, 2, 3, 7, 16] {
                let mut next = 0u64;
                for r in 0..p {
                    let part = block_partition(n, p, r);
                    assert_eq!(part.start, next);
                    next = part.end;
                }
                assert_eq!(next, n);
            }
        }
    }

    #[test]
    fn partition_is_balanced() {
        let n = 100u64;
        let p = 8;
        for r in 0..p {
            let len = block_partition(n, p, r).count() as u64;
            assert!((12..=13).contains(&len));
        }
    }

    #[test]
    fn self_comm_identities() {
        let comm = SelfCommunicator;
        assert_eq!(comm.size(), 1);
        assert!(comm.is_scan_rank());
        let mut buf = vec![1, 2, 3];
        comm.broadcast(0, &mut buf).unwrap();
        assert_eq!(buf, vec![1, 2, 3]);
        let gathered = comm.gather(0, &buf).unwrap().unwrap();
        assert_eq!(gathered, vec![vec![1, 2, 3]]);
    }
}
