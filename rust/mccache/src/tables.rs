//! The coherence state the engine guards with its single lock: per-namespace
//! caches, outbound mutations awaiting acknowledgement, inbound messages
//! under reassembly, and the member table.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;

use mccache_cache::LocalCache;
use mccache_wire::{Checksum, OpCode, OutboundOp};

use crate::BACKOFF;

/// Identity of an outbound mutation awaiting acknowledgement: the
/// originator's version of one key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PendingKey {
    pub namespace: String,
    pub key: Vec<u8>,
    pub tsm: u64,
}

impl PendingKey {
    pub fn from_op(op: &OutboundOp) -> Self {
        PendingKey {
            namespace: op.namespace.clone().unwrap_or_default(),
            key: op.key.clone().unwrap_or_default(),
            tsm: op.tsm,
        }
    }
}

/// What one peer still owes us for one message.
#[derive(Clone, Debug)]
pub(crate) struct PeerAck {
    pub unacked: HashSet<u8>,
    pub backoff: VecDeque<u64>,
}

impl PeerAck {
    pub fn fresh(frag_count: usize) -> Self {
        PeerAck {
            unacked: (0..frag_count as u8).collect(),
            backoff: BACKOFF.into_iter().collect(),
        }
    }
}

/// One reliable outbound message: the fragments as sent (for retransmit) and
/// the acknowledgement state per peer.  Created when the sender first emits
/// the message; destroyed when every peer has acknowledged or been given up
/// on.
#[derive(Clone, Debug)]
pub(crate) struct PendingAck {
    pub tsm: u64,
    pub opcode: OpCode,
    pub crc: Option<Checksum>,
    pub fragments: Vec<Vec<u8>>,
    pub members: HashMap<Ipv4Addr, PeerAck>,
    pub retransmitted: bool,
}

impl PendingAck {
    pub fn new(
        tsm: u64,
        opcode: OpCode,
        crc: Option<Checksum>,
        fragments: Vec<Vec<u8>>,
        peers: impl Iterator<Item = Ipv4Addr>,
    ) -> Self {
        let frag_count = fragments.len();
        PendingAck {
            tsm,
            opcode,
            crc,
            fragments,
            members: peers.map(|ip| (ip, PeerAck::fresh(frag_count))).collect(),
            retransmitted: false,
        }
    }
}

/// Identity of an inbound message under reassembly.  Fragment count and key
/// length ride along so a peer restarting with the same timestamp cannot
/// alias a half-built message.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ArrivalKey {
    pub sender: Ipv4Addr,
    pub frag_count: u8,
    pub key_len: u16,
    pub tsm: u64,
}

/// Fragments collected so far for one inbound message, slotted by sequence.
#[derive(Clone, Debug)]
pub(crate) struct Arrival {
    /// The originating timestamp; the seasoning clock for gap requests runs
    /// against it.
    pub tsm: u64,
    pub slots: Vec<Option<Vec<u8>>>,
    pub backoff: VecDeque<u64>,
}

impl Arrival {
    pub fn new(frag_count: u8, tsm: u64) -> Self {
        Arrival {
            tsm,
            slots: vec![None; frag_count as usize],
            backoff: BACKOFF.into_iter().collect(),
        }
    }

    pub fn store(&mut self, seq: u8, datagram: Vec<u8>) {
        if let Some(slot) = self.slots.get_mut(seq as usize) {
            *slot = Some(datagram);
        }
    }

    pub fn complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    pub fn missing(&self) -> Vec<u8> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(seq, _)| seq as u8)
            .collect()
    }

    pub fn take_slots(self) -> Option<Vec<Vec<u8>>> {
        self.slots.into_iter().collect()
    }
}

/// Everything behind the engine lock.
#[derive(Default)]
pub(crate) struct Shared {
    pub caches: HashMap<String, LocalCache>,
    pub pending: HashMap<PendingKey, PendingAck>,
    pub arrived: HashMap<ArrivalKey, Arrival>,
    /// Peer address to last-observed activity timestamp.
    pub members: HashMap<Ipv4Addr, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_peer_state_owes_every_fragment() {
        let peer = PeerAck::fresh(6);
        assert_eq!(peer.unacked.len(), 6);
        assert_eq!(peer.backoff.front(), Some(&0));
        assert_eq!(peer.backoff.len(), BACKOFF.len());
    }

    #[test]
    fn arrival_tracks_missing_slots_until_complete() {
        let mut arrival = Arrival::new(3, 1);
        assert_eq!(arrival.missing(), vec![0, 1, 2]);
        arrival.store(1, vec![0xaa]);
        assert_eq!(arrival.missing(), vec![0, 2]);
        assert!(!arrival.complete());
        arrival.store(0, vec![0xbb]);
        arrival.store(2, vec![0xcc]);
        assert!(arrival.complete());
        assert_eq!(
            arrival.take_slots().unwrap(),
            vec![vec![0xbb], vec![0xaa], vec![0xcc]]
        );
    }

    #[test]
    fn out_of_range_sequence_is_dropped_not_panicked() {
        let mut arrival = Arrival::new(2, 1);
        arrival.store(9, vec![0xdd]);
        assert_eq!(arrival.missing(), vec![0, 1]);
    }
}
