//! Process-group communication primitives.
//!
//! The redistribution engine only ever talks to a [`Communicator`]: blocking
//! point-to-point byte messages plus the collectives it needs (barrier,
//! broadcast, gather, all-gather, scatter, all-to-all), each parameterized by
//! a [`Group`] of world ranks. Every collective is a synchronization point;
//! a process that skips one while its peers enter it hangs the whole group.
//! That is a caller contract, not a detectable error.
//!
//! The collectives are provided methods composed from `send`/`recv`, rooted
//! at the first member of the group. A backend only has to supply buffered
//! point-to-point transport: a `send` must never block on the receiver.

mod local;

pub use self::local::{LocalCluster, LocalComm};

use crate::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Message stream identifier, separating concurrent logical exchanges
/// between the same pair of processes.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Tag(pub u32);

impl Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

pub(crate) const TAG_BARRIER: Tag = Tag(0);
pub(crate) const TAG_BCAST: Tag = Tag(1);
pub(crate) const TAG_GATHER: Tag = Tag(2);
pub(crate) const TAG_SCATTER: Tag = Tag(3);
pub(crate) const TAG_ALL_TO_ALL: Tag = Tag(4);
pub(crate) const TAG_REALIGN: Tag = Tag(5);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommError {
    #[error("rank {0} does not exist")]
    InvalidRank(usize),

    #[error("rank {0} is not a member of the group")]
    NotInGroup(usize),

    #[error("scatter requires one chunk per group member")]
    ChunkCountMismatch,

    #[error("connection was closed")]
    Disconnected,
}

/// Ordered set of world ranks participating in a collective.
///
/// The order is significant: gathered chunks are returned in group order, and
/// the first member acts as the root of the internal fan-in/fan-out trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    ranks: Vec<usize>,
}

impl Group {
    pub fn new(ranks: Vec<usize>) -> Self {
        debug_assert!(!ranks.is_empty());
        Self { ranks }
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    pub fn root(&self) -> usize {
        self.ranks[0]
    }

    pub fn contains(&self, rank: usize) -> bool {
        self.ranks.contains(&rank)
    }

    pub fn index_of(&self, rank: usize) -> Option<usize> {
        self.ranks.iter().position(|&r| r == rank)
    }
}

pub trait Communicator: Send + Sync {
    /// World rank of the calling process.
    fn rank(&self) -> usize;

    /// Total number of processes in the world group.
    fn size(&self) -> usize;

    /// Buffered send: enqueues the message and returns without waiting for a
    /// matching `recv`.
    fn send(&self, dst: usize, tag: Tag, payload: &[u8]) -> Result<(), CommError>;

    /// Blocks until a message with the given source and tag arrives. Messages
    /// between the same `(source, tag)` pair are delivered in send order.
    fn recv(&self, src: usize, tag: Tag) -> Result<Vec<u8>, CommError>;

    fn barrier(&self, group: &Group) -> Result<(), CommError> {
        let me = self.rank();
        let root = group.root();

        if me == root {
            for &m in group.ranks() {
                if m != root {
                    let _ = self.recv(m, TAG_BARRIER)?;
                }
            }
            for &m in group.ranks() {
                if m != root {
                    self.send(m, TAG_BARRIER, &[])?;
                }
            }
        } else {
            self.send(root, TAG_BARRIER, &[])?;
            let _ = self.recv(root, TAG_BARRIER)?;
        }

        Ok(())
    }

    /// Replaces `payload` on every member with the root's payload.
    fn broadcast(&self, group: &Group, root: usize, payload: &mut Vec<u8>) -> Result<(), CommError> {
        let me = self.rank();
        debug_assert!(group.contains(root));

        if me == root {
            for &m in group.ranks() {
                if m != root {
                    self.send(m, TAG_BCAST, payload)?;
                }
            }
        } else {
            *payload = self.recv(root, TAG_BCAST)?;
        }

        Ok(())
    }

    /// Collects every member's payload at the root, in group order. Returns
    /// `None` on non-root members.
    fn gather(
        &self,
        group: &Group,
        root: usize,
        payload: &[u8],
    ) -> Result<Option<Vec<Vec<u8>>>, CommError> {
        let me = self.rank();
        debug_assert!(group.contains(root));

        if me == root {
            let mut chunks = Vec::with_capacity(group.size());
            for &m in group.ranks() {
                if m == root {
                    chunks.push(payload.to_vec());
                } else {
                    chunks.push(self.recv(m, TAG_GATHER)?);
                }
            }
            Ok(Some(chunks))
        } else {
            self.send(root, TAG_GATHER, payload)?;
            Ok(None)
        }
    }

    /// Every member ends up with every member's payload, in group order.
    fn all_gather(&self, group: &Group, payload: &[u8]) -> Result<Vec<Vec<u8>>, CommError> {
        let root = group.root();

        let mut packed = match self.gather(group, root, payload)? {
            Some(chunks) => encode_chunks(&chunks),
            None => vec![],
        };
        self.broadcast(group, root, &mut packed)?;

        Ok(decode_chunks(&packed))
    }

    /// The root hands chunk `i` to group member `i`; every member returns its
    /// own chunk. Non-root callers pass `None`.
    fn scatter(
        &self,
        group: &Group,
        root: usize,
        chunks: Option<Vec<Vec<u8>>>,
    ) -> Result<Vec<u8>, CommError> {
        let me = self.rank();
        debug_assert!(group.contains(root));

        if me == root {
            let chunks = chunks.ok_or(CommError::ChunkCountMismatch)?;
            if chunks.len() != group.size() {
                return Err(CommError::ChunkCountMismatch);
            }

            let mut own = vec![];
            for (&m, chunk) in zip(group.ranks(), chunks) {
                if m == root {
                    own = chunk;
                } else {
                    self.send(m, TAG_SCATTER, &chunk)?;
                }
            }
            Ok(own)
        } else {
            self.recv(root, TAG_SCATTER)
        }
    }

    /// Member `i` sends chunk `j` to member `j` and receives one chunk from
    /// every member, in group order.
    fn all_to_all(&self, group: &Group, chunks: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, CommError> {
        let me = self.rank();
        if chunks.len() != group.size() {
            return Err(CommError::ChunkCountMismatch);
        }

        let my_index = group.index_of(me).ok_or(CommError::NotInGroup(me))?;

        for (&m, chunk) in zip(group.ranks(), &chunks) {
            if m != me {
                self.send(m, TAG_ALL_TO_ALL, chunk)?;
            }
        }

        let mut received = Vec::with_capacity(group.size());
        for (index, &m) in enumerate(group.ranks()) {
            if index == my_index {
                received.push(chunks[index].clone());
            } else {
                received.push(self.recv(m, TAG_ALL_TO_ALL)?);
            }
        }

        Ok(received)
    }
}

/// Frames a list of byte chunks into one message: chunk count, then a length
/// prefix per chunk, all little-endian u64.
pub(crate) fn encode_chunks(chunks: &[Vec<u8>]) -> Vec<u8> {
    let total = 8 + chunks.iter().map(|c| 8 + c.len()).sum::<usize>();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(chunks.len() as u64).to_le_bytes());

    for chunk in chunks {
        out.extend_from_slice(&(chunk.len() as u64).to_le_bytes());
        out.extend_from_slice(chunk);
    }

    out
}

pub(crate) fn decode_chunks(payload: &[u8]) -> Vec<Vec<u8>> {
    let mut offset = 0;
    let mut read_u64 = |offset: &mut usize| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&payload[*offset..*offset + 8]);
        *offset += 8;
        u64::from_le_bytes(buf)
    };

    let count = read_u64(&mut offset) as usize;
    let mut chunks = Vec::with_capacity(count);

    for _ in 0..count {
        let len = read_u64(&mut offset) as usize;
        chunks.push(payload[offset..offset + len].to_vec());
        offset += len;
    }

    chunks
}
