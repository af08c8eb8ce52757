//! The sender task: dequeue outbound operations, frame them, and multicast
//! the fragments.
//!
//! Reliable mutations get a pending-ack record before their first datagram
//! leaves, so an acknowledgement can never race its own bookkeeping.  `REQ`
//! against one of our own pending records re-sends the stored fragments
//! byte-for-byte instead of re-framing, which keeps retransmits identical to
//! the originals.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;

use mccache_wire::{encode_message, FragmentHeader, OpCode, OutboundOp};

use crate::engine::{EngineError, EngineInner};
use crate::handler;
use crate::ops_log::{self, OpsLevel};
use crate::tables::{PendingAck, PendingKey};

pub(crate) async fn run(
    inner: Arc<EngineInner>,
    socket: UdpSocket,
    mut queue: UnboundedReceiver<OutboundOp>,
) {
    tracing::debug!("McCache multicaster is ready");
    loop {
        let op = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            op = queue.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };
        let leaving = op.opcode == OpCode::Bye;
        if let Err(err) = transmit(&inner, &socket, op).await {
            // The worker never dies over one bad operation.
            tracing::error!("outbound operation failed: {}", err);
        }
        if leaving {
            break;
        }
    }
}

async fn transmit(
    inner: &Arc<EngineInner>,
    socket: &UdpSocket,
    op: OutboundOp,
) -> Result<(), EngineError> {
    let group = SocketAddrV4::new(inner.config.group(), inner.config.multicast_port);
    let receiver_octet = op.target.map(|ip| ip.octets()[3] as u16).unwrap_or(0);

    let frames = if op.opcode == OpCode::Req {
        match stored_frames(inner, &op, receiver_octet) {
            Some(frames) => frames,
            // A gap request heading for the originator is an ordinary small
            // message; only REQs that name one of our own records re-send
            // stored bytes.
            None if op.namespace.is_none() && op.target.is_some() => {
                frame_message(inner, &op, receiver_octet)?
            }
            None => {
                ops_log::emit(
                    OpsLevel::Debug,
                    op.opcode,
                    None,
                    Some(op.tsm),
                    op.namespace.as_deref(),
                    op.key.as_deref(),
                    op.crc,
                    "message no longer pending, retransmit skipped",
                );
                return Ok(());
            }
        }
    } else {
        let frames = frame_message(inner, &op, receiver_octet)?;
        if op.opcode.needs_ack() {
            register_pending(inner, &op, &frames);
        }
        frames
    };

    for frame in &frames {
        send_fragment(inner, socket, group, frame).await?;
    }
    ops_log::emit(
        OpsLevel::Debug,
        op.opcode,
        None,
        Some(op.tsm),
        op.namespace.as_deref(),
        op.key.as_deref(),
        op.crc,
        &format!(
            "{} fragment(s) out going to {}",
            frames.len(),
            op.target
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "members".to_string())
        ),
    );

    if op.opcode == OpCode::Met {
        // A metrics inquiry reports the local node too.
        let snapshot = {
            let shared = inner.shared.lock();
            handler::metrics_snapshot(&shared, op.namespace.as_deref())
        };
        ops_log::emit(
            OpsLevel::Info,
            OpCode::Met,
            None,
            Some(op.tsm),
            op.namespace.as_deref(),
            None,
            None,
            &snapshot.to_string(),
        );
    }

    // Pace data traffic so a tight write loop cannot flood the segment.
    // Control traffic (acks, repairs) stays prompt.
    if op.opcode.needs_ack() || op.opcode == OpCode::Evt {
        tokio::time::sleep(inner.config.pace()).await;
    }
    Ok(())
}

fn frame_message(
    inner: &EngineInner,
    op: &OutboundOp,
    receiver_octet: u16,
) -> Result<Vec<Vec<u8>>, EngineError> {
    Ok(encode_message(
        &op.message_key(),
        &op.message_payload(),
        inner.cipher.as_ref(),
        inner.config.packet_mtu,
        receiver_octet,
    )?)
}

// REQ semantics against our own pending table: no value means the whole
// message, a value names one fragment slot for one requester.
fn stored_frames(
    inner: &EngineInner,
    op: &OutboundOp,
    receiver_octet: u16,
) -> Option<Vec<Vec<u8>>> {
    let pky = PendingKey::from_op(op);
    let shared = inner.shared.lock();
    let record = shared.pending.get(&pky)?;
    match op.value.as_deref() {
        None => Some(record.fragments.clone()),
        Some(bytes) => {
            let slot: u8 = bincode::deserialize(bytes).ok()?;
            let mut frame = record.fragments.get(slot as usize)?.clone();
            FragmentHeader::patch_receiver(&mut frame, receiver_octet);
            Some(vec![frame])
        }
    }
}

fn register_pending(inner: &EngineInner, op: &OutboundOp, frames: &[Vec<u8>]) {
    let mut shared = inner.shared.lock();
    if shared.members.is_empty() {
        // Nobody to wait for; the mutation is complete as soon as it leaves.
        return;
    }
    let members: Vec<Ipv4Addr> = shared.members.keys().copied().collect();
    shared
        .pending
        .entry(PendingKey::from_op(op))
        .or_insert_with(|| {
            PendingAck::new(op.tsm, op.opcode, op.crc, frames.to_vec(), members.into_iter())
        });
}

async fn send_fragment(
    inner: &EngineInner,
    socket: &UdpSocket,
    group: SocketAddrV4,
    frame: &[u8],
) -> Result<(), EngineError> {
    let tantrum = inner.config.monkey_tantrum as i32;
    if tantrum > 0 {
        // Drop band centered on 50 so the width tracks the configured
        // percentage; a crude stand-in for a lossy segment.
        let roll = rand::thread_rng().gen_range(1..=100);
        if roll >= 50 - tantrum / 2 && roll <= 50 + tantrum / 2 {
            ops_log::emit(
                OpsLevel::Warn,
                OpCode::Nop,
                None,
                None,
                None,
                None,
                None,
                "monkey is angry, dropping the outbound packet",
            );
            return Ok(());
        }
    }
    socket.send_to(frame, std::net::SocketAddr::V4(group)).await?;
    Ok(())
}
