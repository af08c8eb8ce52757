//! The opcode handler: a single serialized dispatch applying decoded
//! messages to local state.
//!
//! Everything here runs under the engine lock and does bounded work; the only
//! side channel is the outbound queue.  Mutations applied on behalf of a peer
//! always use `Origin::Remote`, so nothing a peer sends us is ever multicast
//! back out.

use std::net::Ipv4Addr;

use mccache_cache::Origin;
use mccache_wire::{Checksum, MessageKey, MessagePayload, OpCode, OutboundOp};

use crate::engine::EngineInner;
use crate::ops_log::{self, OpsLevel};
use crate::tables::{PendingKey, Shared};

/// Apply one decoded message.  `sender` is `None` when the node dispatches an
/// operation to itself (reset, digest).
pub(crate) fn dispatch(
    inner: &EngineInner,
    shared: &mut Shared,
    key: MessageKey,
    payload: MessagePayload,
    sender: Option<Ipv4Addr>,
) {
    match payload.opcode {
        OpCode::Ack => handle_ack(shared, &key, sender),
        OpCode::Bye => handle_bye(shared, sender),
        OpCode::Del | OpCode::Evt => handle_delete(inner, shared, &key, &payload, sender),
        OpCode::Ins | OpCode::Upd => handle_upsert(inner, shared, &key, payload, sender),
        OpCode::Inq => handle_inquiry(shared, &key, sender),
        OpCode::Met => handle_metrics(shared, &key, sender),
        OpCode::New => {
            if let Some(sdr) = sender {
                if !inner.self_ips.contains(&sdr) {
                    shared.members.insert(sdr, key.tsm);
                }
            }
        }
        OpCode::Rak => handle_reack(inner, shared, &key, &payload, sender),
        OpCode::Req => handle_fragment_request(inner, shared, &key, &payload, sender),
        OpCode::Rst => handle_reset(shared, &key),
        OpCode::Err | OpCode::Fyi | OpCode::Nop | OpCode::Syc | OpCode::Wrn => {
            ops_log::emit(
                OpsLevel::Debug,
                payload.opcode,
                sender,
                Some(key.tsm),
                key.namespace.as_deref(),
                key.key.as_deref(),
                payload.crc,
                "informational",
            );
        }
    }
}

/// Cache counters for the `MET` log line.
pub(crate) fn metrics_snapshot(shared: &Shared, name: Option<&str>) -> serde_json::Value {
    let mut view = serde_json::Map::new();
    for (n, cache) in shared
        .caches
        .iter()
        .filter(|(n, _)| name.is_none() || name == Some(n.as_str()))
    {
        view.insert(
            n.clone(),
            serde_json::to_value(cache.metrics()).unwrap_or(serde_json::Value::Null),
        );
    }
    serde_json::Value::Object(view)
}

fn acknowledge(
    inner: &EngineInner,
    key: &MessageKey,
    crc: Option<Checksum>,
    sender: Option<Ipv4Addr>,
) {
    let Some(sdr) = sender else { return };
    inner.enqueue(OutboundOp {
        opcode: OpCode::Ack,
        tsm: key.tsm,
        namespace: key.namespace.clone(),
        key: key.key.clone(),
        crc,
        value: None,
        target: Some(sdr),
    });
}

fn handle_ack(shared: &mut Shared, key: &MessageKey, sender: Option<Ipv4Addr>) {
    let Some(sdr) = sender else { return };
    let pky = PendingKey {
        namespace: key.namespace.clone().unwrap_or_default(),
        key: key.key.clone().unwrap_or_default(),
        tsm: key.tsm,
    };
    match shared.pending.get_mut(&pky) {
        Some(record) => {
            if record.members.remove(&sdr).is_none() {
                // Usually a node that joined after we snapshotted the group.
                ops_log::emit(
                    OpsLevel::Debug,
                    OpCode::Ack,
                    sender,
                    Some(key.tsm),
                    key.namespace.as_deref(),
                    key.key.as_deref(),
                    None,
                    "ack from a peer this message was not tracking",
                );
            }
            if record.members.is_empty() {
                shared.pending.remove(&pky);
                ops_log::emit(
                    OpsLevel::Debug,
                    OpCode::Ack,
                    sender,
                    Some(key.tsm),
                    key.namespace.as_deref(),
                    key.key.as_deref(),
                    None,
                    "acknowledged by all members, tracking entry dropped",
                );
            }
        }
        None => {
            ops_log::emit(
                OpsLevel::Debug,
                OpCode::Ack,
                sender,
                Some(key.tsm),
                key.namespace.as_deref(),
                key.key.as_deref(),
                None,
                "no pending record for this ack",
            );
        }
    }
}

fn handle_bye(shared: &mut Shared, sender: Option<Ipv4Addr>) {
    let Some(sdr) = sender else { return };
    shared.members.remove(&sdr);
    // A departed peer will never acknowledge; stop waiting on it everywhere.
    shared.pending.retain(|_, record| {
        record.members.remove(&sdr);
        !record.members.is_empty()
    });
}

fn handle_delete(
    inner: &EngineInner,
    shared: &mut Shared,
    key: &MessageKey,
    payload: &MessagePayload,
    sender: Option<Ipv4Addr>,
) {
    if let (Some(namespace), Some(key_b)) = (&key.namespace, &key.key) {
        let cache = inner.ensure_cache(shared, namespace);
        let apply = cache
            .meta(key_b)
            .map(|meta| meta.tsm <= key.tsm)
            .unwrap_or(false);
        if apply {
            if cache.delete(key_b, Some(key.tsm), Origin::Remote).is_ok() {
                ops_log::emit(
                    OpsLevel::Debug,
                    payload.opcode,
                    sender,
                    Some(key.tsm),
                    Some(namespace.as_str()),
                    Some(key_b.as_slice()),
                    payload.crc,
                    "deleted from local",
                );
            }
        }
    }
    acknowledge(inner, key, payload.crc, sender);
}

fn handle_upsert(
    inner: &EngineInner,
    shared: &mut Shared,
    key: &MessageKey,
    payload: MessagePayload,
    sender: Option<Ipv4Addr>,
) {
    let (Some(namespace), Some(key_b)) = (&key.namespace, &key.key) else {
        tracing::warn!("mutation without a namespace or key, dropped");
        return;
    };
    let crc = payload.crc;
    let cache = inner.ensure_cache(shared, namespace);
    let local = cache.meta(key_b);
    let lts = local.map(|m| m.tsm).unwrap_or(0);
    let lcs = local.map(|m| m.crc);

    if lts < key.tsm {
        match payload.value {
            Some(value) => {
                if let Err(err) = cache.set(key_b.clone(), value, Some(key.tsm), Origin::Remote) {
                    ops_log::emit(
                        OpsLevel::Warn,
                        payload.opcode,
                        sender,
                        Some(key.tsm),
                        Some(namespace.as_str()),
                        Some(key_b.as_slice()),
                        crc,
                        &format!("inbound value not applied: {}", err),
                    );
                }
                // A newer version exists; stop chasing acknowledgements for
                // our older writes of this key.
                let before = shared.pending.len();
                shared.pending.retain(|pky, _| {
                    !(pky.namespace == *namespace && pky.key == *key_b && pky.tsm < key.tsm)
                });
                if shared.pending.len() != before {
                    ops_log::emit(
                        OpsLevel::Debug,
                        payload.opcode,
                        sender,
                        Some(key.tsm),
                        Some(namespace.as_str()),
                        Some(key_b.as_slice()),
                        crc,
                        "ack no longer needed, newer value arrived",
                    );
                }
            }
            None => {
                ops_log::emit(
                    OpsLevel::Warn,
                    payload.opcode,
                    sender,
                    Some(key.tsm),
                    Some(namespace.as_str()),
                    Some(key_b.as_slice()),
                    crc,
                    "mutation carried no value, dropped",
                );
            }
        }
    } else if lts > key.tsm && lcs != crc {
        // The local entry is newer than the inbound one and the contents
        // disagree: replicas have diverged.  Evict locally so the next read
        // reconciles against the backing store; broadcasting a delete from
        // the losing side would race the winner's update.
        ops_log::emit(
            OpsLevel::Warn,
            payload.opcode,
            sender,
            Some(key.tsm),
            Some(namespace.as_str()),
            Some(key_b.as_slice()),
            crc,
            "cache incoherent, evicting the local entry",
        );
        let cache = inner.ensure_cache(shared, namespace);
        cache.evict_incoherent(key_b, key.tsm, crc);
    }
    // lts == tsm with matching crc is a retransmitted duplicate: nothing to
    // apply, but the sender still wants its acknowledgement.
    acknowledge(inner, key, crc, sender);
}

fn handle_inquiry(shared: &mut Shared, key: &MessageKey, sender: Option<Ipv4Addr>) {
    let mut view = serde_json::Map::new();
    for (name, cache) in shared
        .caches
        .iter()
        .filter(|(n, _)| key.namespace.is_none() || key.namespace.as_deref() == Some(n.as_str()))
    {
        view.insert(name.clone(), cache.digest(key.key.as_deref()));
    }
    ops_log::emit(
        OpsLevel::Info,
        OpCode::Inq,
        sender,
        Some(key.tsm),
        key.namespace.as_deref(),
        key.key.as_deref(),
        None,
        &serde_json::Value::Object(view).to_string(),
    );
}

fn handle_metrics(shared: &mut Shared, key: &MessageKey, sender: Option<Ipv4Addr>) {
    let snapshot = metrics_snapshot(shared, key.namespace.as_deref());
    ops_log::emit(
        OpsLevel::Info,
        OpCode::Met,
        sender,
        Some(key.tsm),
        key.namespace.as_deref(),
        None,
        None,
        &snapshot.to_string(),
    );
}

// The peer never saw our ACK.  Re-send it if we can show we processed the
// message: either its assembly is still collecting in the arrival table, or
// the entry landed in (or has superseded) the cache.
fn handle_reack(
    inner: &EngineInner,
    shared: &mut Shared,
    key: &MessageKey,
    payload: &MessagePayload,
    sender: Option<Ipv4Addr>,
) {
    let Some(sdr) = sender else { return };
    let assembling = shared
        .arrived
        .keys()
        .any(|aky| aky.sender == sdr && aky.tsm == key.tsm);
    let applied = match (&key.namespace, &key.key) {
        (Some(namespace), Some(key_b)) => shared
            .caches
            .get(namespace)
            .and_then(|cache| cache.meta(key_b))
            .map(|meta| meta.tsm >= key.tsm || Some(meta.crc) == payload.crc)
            .unwrap_or(false),
        _ => false,
    };
    if assembling || applied {
        acknowledge(inner, key, payload.crc, sender);
        ops_log::emit(
            OpsLevel::Debug,
            OpCode::Rak,
            sender,
            Some(key.tsm),
            key.namespace.as_deref(),
            key.key.as_deref(),
            payload.crc,
            "re-acknowledged",
        );
    } else {
        // We genuinely never finished this message; the peer's housekeeper
        // will retransmit it.
        ops_log::emit(
            OpsLevel::Debug,
            OpCode::Rak,
            sender,
            Some(key.tsm),
            key.namespace.as_deref(),
            key.key.as_deref(),
            payload.crc,
            "nothing to re-acknowledge",
        );
    }
}

// A peer could not assemble one of our messages and names a missing slot.
// The request cannot carry namespace or key (the requester never decoded
// them), so the pending record is found by originator timestamp, which the
// strict clock keeps unique per node.
fn handle_fragment_request(
    inner: &EngineInner,
    shared: &mut Shared,
    key: &MessageKey,
    payload: &MessagePayload,
    sender: Option<Ipv4Addr>,
) {
    let Some(sdr) = sender else { return };
    let found = shared
        .pending
        .iter()
        .find(|(pky, _)| pky.tsm == key.tsm)
        .map(|(pky, record)| (pky.clone(), record.crc));
    match found {
        Some((pky, crc)) => {
            inner.enqueue(OutboundOp {
                opcode: OpCode::Req,
                tsm: pky.tsm,
                namespace: Some(pky.namespace),
                key: Some(pky.key),
                crc,
                value: payload.value.clone(),
                target: Some(sdr),
            });
        }
        None => {
            ops_log::emit(
                OpsLevel::Debug,
                OpCode::Req,
                sender,
                Some(key.tsm),
                None,
                None,
                None,
                "requested fragment is for a message no longer pending",
            );
        }
    }
}

fn handle_reset(shared: &mut Shared, key: &MessageKey) {
    for (_, cache) in shared
        .caches
        .iter_mut()
        .filter(|(n, _)| key.namespace.is_none() || key.namespace.as_deref() == Some(n.as_str()))
    {
        cache.clear();
    }
}
