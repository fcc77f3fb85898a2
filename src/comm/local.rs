//! In-process communication backend.
//!
//! One thread per rank, one unbounded channel per mailbox. This backend
//! exists so that SPMD programs and their tests can run inside a single
//! process; a network transport would plug in behind the same
//! [`Communicator`] trait.

use crossbeam::channel::{unbounded, Receiver, Sender};
use std::collections::VecDeque;
use std::sync::Arc;

use super::{CommError, Communicator, Tag};
use crate::prelude::*;

struct Envelope {
    src: usize,
    tag: Tag,
    payload: Vec<u8>,
}

/// One rank's endpoint of an in-process cluster.
pub struct LocalComm {
    rank: usize,
    outboxes: Arc<[Sender<Envelope>]>,
    inbox: Mutex<Receiver<Envelope>>,
    // Messages that arrived before anyone asked for their (src, tag) stream.
    pending: Mutex<HashMap<(usize, Tag), VecDeque<Vec<u8>>>>,
}

pub struct LocalCluster;

impl LocalCluster {
    /// Creates the fully connected mailboxes of an `n`-rank cluster.
    pub fn connect(n: usize) -> Vec<LocalComm> {
        assert!(n > 0);

        let mut senders = Vec::with_capacity(n);
        let mut receivers = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = unbounded();
            senders.push(tx);
            receivers.push(rx);
        }

        let outboxes: Arc<[Sender<Envelope>]> = senders.into();

        enumerate(receivers)
            .map(|(rank, rx)| LocalComm {
                rank,
                outboxes: Arc::clone(&outboxes),
                inbox: Mutex::new(rx),
                pending: Mutex::new(default()),
            })
            .collect()
    }

    /// Runs the identical closure once per rank, each on its own thread, and
    /// returns the per-rank results in rank order. Panics in any rank
    /// propagate to the caller after all threads have been joined.
    pub fn run<F, R>(n: usize, body: F) -> Vec<R>
    where
        F: Fn(LocalComm) -> R + Send + Sync,
        R: Send,
    {
        let comms = Self::connect(n);
        let body = &body;

        crossbeam::thread::scope(|scope| {
            let handles = comms
                .into_iter()
                .map(|comm| scope.spawn(move |_| body(comm)))
                .collect::<Vec<_>>();

            handles
                .into_iter()
                .map(|h| h.join().expect("rank panicked"))
                .collect()
        })
        .expect("cluster thread panicked")
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.outboxes.len()
    }

    fn send(&self, dst: usize, tag: Tag, payload: &[u8]) -> Result<(), CommError> {
        let outbox = self.outboxes.get(dst).ok_or(CommError::InvalidRank(dst))?;

        outbox
            .send(Envelope {
                src: self.rank,
                tag,
                payload: payload.to_vec(),
            })
            .map_err(|_| CommError::Disconnected)
    }

    fn recv(&self, src: usize, tag: Tag) -> Result<Vec<u8>, CommError> {
        if src >= self.size() {
            return Err(CommError::InvalidRank(src));
        }

        if let Some(queue) = self.pending.lock().get_mut(&(src, tag)) {
            if let Some(payload) = queue.pop_front() {
                return Ok(payload);
            }
        }

        let inbox = self.inbox.lock();
        loop {
            let envelope = inbox.recv().map_err(|_| CommError::Disconnected)?;

            if envelope.src == src && envelope.tag == tag {
                return Ok(envelope.payload);
            }

            self.pending
                .lock()
                .entry((envelope.src, envelope.tag))
                .or_default()
                .push_back(envelope.payload);
        }
    }
}
