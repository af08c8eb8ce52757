//! The housekeeper task: periodic sweeps that chase missing
//! acknowledgements, request missing fragments, abandon what will never
//! finish, and forget silent members.
//!
//! All sweeps snapshot table keys before walking them, so removal mid-sweep
//! is always safe.

use std::net::Ipv4Addr;
use std::sync::Arc;

use mccache_cache::clock;
use mccache_wire::{peek_key, OpCode, OutboundOp};

use crate::engine::EngineInner;
use crate::ops_log::{self, OpsLevel};
use crate::tables::{ArrivalKey, PendingKey};
use crate::{BACKOFF, MEMBER_SILENCE, SEASON};

pub(crate) async fn run(inner: Arc<EngineInner>) {
    tracing::debug!("McCache housekeeper is ready");
    let period = inner.config.housekeeping_period();
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
        let now = clock::tsm_now();
        retry_sweep(&inner, now);
        gap_sweep(&inner, now);
        member_sweep(&inner, now);
    }
}

/// The wait before a fragment counts as lost: at least one seasoning period
/// per hop, stretched by the head of the relevant back-off (half a season per
/// back-off unit).
fn seasoning_ns(inner: &EngineInner, backoff_head: u64) -> u64 {
    let season = SEASON.as_nanos() as u64;
    let hops = inner.config.multicast_hops.max(1) as u64;
    (season * hops).max(season + backoff_head * season / 2)
}

/// Chase acknowledgements for every pending outbound mutation.
pub(crate) fn retry_sweep(inner: &EngineInner, now: u64) {
    let mut shared = inner.shared.lock();
    let keys: Vec<PendingKey> = shared.pending.keys().cloned().collect();
    for pky in keys {
        let Some(record) = shared.pending.get_mut(&pky) else {
            continue;
        };
        let elapsed = now.saturating_sub(record.tsm);
        let frag_total = record.fragments.len();

        let mut timed_out: Vec<Ipv4Addr> = Vec::new();
        for (ip, peer) in record.members.iter_mut() {
            let Some(&head) = peer.backoff.front() else {
                timed_out.push(*ip);
                continue;
            };
            if elapsed <= seasoning_ns(inner, head) {
                continue;
            }
            if peer.unacked.len() == frag_total {
                // Nothing acknowledged; ask this peer about the whole message.
                inner.enqueue(OutboundOp {
                    opcode: OpCode::Rak,
                    tsm: pky.tsm,
                    namespace: Some(pky.namespace.clone()),
                    key: Some(pky.key.clone()),
                    crc: record.crc,
                    value: None,
                    target: Some(*ip),
                });
            } else {
                let mut missing: Vec<u8> = peer.unacked.iter().copied().collect();
                missing.sort_unstable();
                for slot in missing {
                    inner.enqueue(OutboundOp {
                        opcode: OpCode::Rak,
                        tsm: pky.tsm,
                        namespace: Some(pky.namespace.clone()),
                        key: Some(pky.key.clone()),
                        crc: record.crc,
                        value: bincode::serialize(&slot).ok(),
                        target: Some(*ip),
                    });
                }
            }
            peer.backoff.pop_front();
            if peer.backoff.is_empty() {
                timed_out.push(*ip);
            }
        }

        for ip in &timed_out {
            if record.members.remove(ip).is_some() {
                ops_log::emit(
                    OpsLevel::Error,
                    record.opcode,
                    Some(*ip),
                    Some(pky.tsm),
                    Some(pky.namespace.as_str()),
                    Some(pky.key.as_slice()),
                    record.crc,
                    "peer never acknowledged, giving up on it",
                );
            }
        }

        // If nobody has acknowledged anything once the first back-off is
        // spent, assume the original multicast was lost on our side and
        // re-send the whole message, once.
        let first_backoff_spent = record
            .members
            .values()
            .all(|peer| peer.backoff.len() < BACKOFF.len());
        let nothing_acked = !record.members.is_empty()
            && record
                .members
                .values()
                .all(|peer| peer.unacked.len() == frag_total);
        if !record.retransmitted && first_backoff_spent && nothing_acked {
            record.retransmitted = true;
            inner.enqueue(OutboundOp {
                opcode: OpCode::Req,
                tsm: pky.tsm,
                namespace: Some(pky.namespace.clone()),
                key: Some(pky.key.clone()),
                crc: record.crc,
                value: None,
                target: None,
            });
        }

        if record.members.is_empty() {
            shared.pending.remove(&pky);
        }
    }
}

/// Request the missing slots of every stalled inbound assembly; abandon the
/// exhausted ones and defensively evict whatever entry they would have
/// replaced.
pub(crate) fn gap_sweep(inner: &EngineInner, now: u64) {
    let mut shared = inner.shared.lock();
    let keys: Vec<ArrivalKey> = shared.arrived.keys().cloned().collect();
    for aky in keys {
        let Some(arrival) = shared.arrived.get_mut(&aky) else {
            continue;
        };
        let elapsed = now.saturating_sub(arrival.tsm);
        match arrival.backoff.front().copied() {
            Some(head) => {
                if elapsed <= seasoning_ns(inner, head) {
                    continue;
                }
                for slot in arrival.missing() {
                    inner.enqueue(OutboundOp {
                        opcode: OpCode::Req,
                        tsm: aky.tsm,
                        namespace: None,
                        key: None,
                        crc: None,
                        value: bincode::serialize(&slot).ok(),
                        target: Some(aky.sender),
                    });
                }
                arrival.backoff.pop_front();
            }
            None => {
                let Some(arrival) = shared.arrived.remove(&aky) else {
                    continue;
                };
                let missing = arrival.missing();
                // The local entry for this key may now be staler than what
                // the cluster holds; drop it so the next read re-fetches.
                if let Some(message_key) = peek_key(&arrival.slots) {
                    if let (Some(namespace), Some(key_b)) =
                        (message_key.namespace, message_key.key)
                    {
                        if let Some(cache) = shared.caches.get_mut(&namespace) {
                            cache.evict_incoherent(&key_b, aky.tsm, None);
                        }
                    }
                }
                tracing::error!(
                    "abandoning incomplete message from {} (tsm {}), missing fragments {:?}",
                    aky.sender,
                    aky.tsm,
                    missing
                );
            }
        }
    }
}

/// Drop members that have been silent past the horizon.  A BYE is the prompt
/// path; this catches peers that died without one.
pub(crate) fn member_sweep(inner: &EngineInner, now: u64) {
    let horizon = MEMBER_SILENCE.as_nanos() as u64;
    let mut shared = inner.shared.lock();
    let silent: Vec<Ipv4Addr> = shared
        .members
        .iter()
        .filter(|(_, &last)| now.saturating_sub(last) > horizon)
        .map(|(ip, _)| *ip)
        .collect();
    for ip in silent {
        shared.members.remove(&ip);
        tracing::warn!("member {} has been silent too long, dropping it", ip);
    }
}
