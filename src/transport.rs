//! Message passing between the processes of a distributed run.
//!
//! All cross-process coordination goes through a [`Communicator`]:
//! the broadcast of the swap order and the completion flag, and the
//! point-to-point messages of a tempering swap. Any transport failure
//! is fatal to the whole run; a partially applied swap would corrupt a
//! chain beyond detection, so nothing here retries or recovers.

use std::sync::mpsc::{channel, Receiver, Sender};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("peer {0} disconnected")]
    Disconnected(usize),
    #[error("unexpected message from peer {from}, expected {expected}")]
    Unexpected { from: usize, expected: &'static str },
    #[error("swap snapshot dimension mismatch: ours {ours}, theirs {theirs}")]
    DimensionMismatch { ours: usize, theirs: usize },
    #[error("point-to-point message attempted without peers")]
    NoPeers,
}

/// The physical state that moves between rungs when a swap is accepted.
/// Sent as one unit per direction, so a swap either fully happens on
/// both sides or not at all.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainSnapshot {
    pub log_likelihood: f64,
    pub log_prior: f64,
    pub varying: Box<[f64]>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Shuffled order of adjacent-pair swap attempts for one round.
    Order(Vec<usize>),
    /// Cold side of a pair announcing its temperature and likelihood.
    SwapProposal {
        temperature: f64,
        log_likelihood: f64,
    },
    /// Hot side's verdict on the proposed swap.
    SwapDecision { accepted: bool },
    /// Full state transfer after an accepted swap.
    Snapshot(ChainSnapshot),
    /// Coordinator's run-completion flag.
    Complete(bool),
}

impl Message {
    fn kind(&self) -> &'static str {
        match self {
            Message::Order(_) => "order",
            Message::SwapProposal { .. } => "swap proposal",
            Message::SwapDecision { .. } => "swap decision",
            Message::Snapshot(_) => "snapshot",
            Message::Complete(_) => "complete",
        }
    }
}

/// One process's endpoint of the run-wide message fabric.
///
/// Broadcasts are rooted at rank 0 and realized over the point-to-point
/// channel; both directions block, which makes every broadcast a
/// synchronization barrier between the coordinator and each rank.
pub trait Communicator: Send {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn send(&mut self, to: usize, message: Message) -> Result<(), TransportError>;
    fn recv(&mut self, from: usize) -> Result<Message, TransportError>;

    /// Distribute the coordinator's swap order to every rank. The value
    /// passed by non-coordinator ranks is replaced.
    fn broadcast_order(&mut self, order: &mut Vec<usize>) -> Result<(), TransportError> {
        if self.size() == 1 {
            return Ok(());
        }
        if self.rank() == 0 {
            for to in 1..self.size() {
                self.send(to, Message::Order(order.clone()))?;
            }
        } else {
            match self.recv(0)? {
                Message::Order(received) => *order = received,
                other => return Err(unexpected(0, "order", &other)),
            }
        }
        Ok(())
    }

    /// Distribute the coordinator's completion flag. Every rank leaves
    /// the iteration loop on the same step.
    fn broadcast_complete(&mut self, complete: bool) -> Result<bool, TransportError> {
        if self.size() == 1 {
            return Ok(complete);
        }
        if self.rank() == 0 {
            for to in 1..self.size() {
                self.send(to, Message::Complete(complete))?;
            }
            Ok(complete)
        } else {
            match self.recv(0)? {
                Message::Complete(received) => Ok(received),
                other => Err(unexpected(0, "complete", &other)),
            }
        }
    }
}

fn unexpected(from: usize, expected: &'static str, got: &Message) -> TransportError {
    log::error!("protocol violation: expected {expected}, got {}", got.kind());
    TransportError::Unexpected { from, expected }
}

/// Communicator for a run held entirely in one process. Broadcasts are
/// identities; point-to-point traffic is a protocol violation.
#[derive(Debug, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&mut self, _to: usize, _message: Message) -> Result<(), TransportError> {
        Err(TransportError::NoPeers)
    }

    fn recv(&mut self, _from: usize) -> Result<Message, TransportError> {
        Err(TransportError::NoPeers)
    }
}

/// Channel-backed communicator connecting rank threads within one OS
/// process: a full mesh with one queue per ordered rank pair.
#[derive(Debug)]
pub struct ChannelCommunicator {
    rank: usize,
    outgoing: Vec<Option<Sender<Message>>>,
    incoming: Vec<Option<Receiver<Message>>>,
}

impl ChannelCommunicator {
    /// Build endpoints for `size` ranks. Each endpoint is moved into
    /// the thread that drives that rank.
    pub fn mesh(size: usize) -> Vec<ChannelCommunicator> {
        assert!(size > 0);
        let mut endpoints: Vec<ChannelCommunicator> = (0..size)
            .map(|rank| ChannelCommunicator {
                rank,
                outgoing: (0..size).map(|_| None).collect(),
                incoming: (0..size).map(|_| None).collect(),
            })
            .collect();

        for from in 0..size {
            for to in 0..size {
                if from == to {
                    continue;
                }
                let (tx, rx) = channel();
                endpoints[from].outgoing[to] = Some(tx);
                endpoints[to].incoming[from] = Some(rx);
            }
        }
        endpoints
    }
}

impl Communicator for ChannelCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.outgoing.len()
    }

    fn send(&mut self, to: usize, message: Message) -> Result<(), TransportError> {
        let sender = self.outgoing[to].as_ref().ok_or(TransportError::NoPeers)?;
        sender
            .send(message)
            .map_err(|_| TransportError::Disconnected(to))
    }

    fn recv(&mut self, from: usize) -> Result<Message, TransportError> {
        let receiver = self.incoming[from].as_ref().ok_or(TransportError::NoPeers)?;
        receiver
            .recv()
            .map_err(|_| TransportError::Disconnected(from))
    }
}
