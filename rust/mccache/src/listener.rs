//! The listener task: one UDP receiver feeding reassembly and dispatch.
//!
//! Corruption is loss, not error: a datagram that fails the magic check or a
//! message that fails decryption is logged and dropped, and the repair
//! machinery (RAK/REQ) treats it like any other missing packet.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use mccache_wire::{assemble, Fragment};

use crate::engine::EngineInner;
use crate::handler;
use crate::tables::{Arrival, ArrivalKey};

pub(crate) async fn run(inner: Arc<EngineInner>, socket: UdpSocket) {
    tracing::debug!("McCache listener is ready");
    let mut buf = vec![0u8; inner.config.packet_mtu.max(2048)];
    loop {
        let (len, addr) = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(err) => {
                    tracing::error!("receive failed: {}", err);
                    continue;
                }
            },
        };
        let IpAddr::V4(source) = addr.ip() else { continue };
        if inner.self_ips.contains(&source) {
            // Our own multicast looped back.
            continue;
        }

        let fragment = match Fragment::parse(&buf[..len]) {
            Ok(fragment) => fragment,
            Err(err) => {
                tracing::warn!("dropping datagram from {}: {}", source, err);
                continue;
            }
        };
        let header = fragment.header;
        if header.receiver != 0 && header.receiver != inner.self_octet() {
            // Addressed to one specific peer, and it is not us.
            continue;
        }

        let aky = ArrivalKey {
            sender: source,
            frag_count: header.frag_count,
            key_len: header.key_len,
            tsm: header.tsm,
        };
        let slots = {
            let mut shared = inner.shared.lock();
            // Lazy membership: traffic proves the peer exists.
            shared.members.entry(source).or_insert(header.tsm);
            let arrival = shared
                .arrived
                .entry(aky.clone())
                .or_insert_with(|| Arrival::new(header.frag_count, header.tsm));
            arrival.store(header.seq, buf[..len].to_vec());
            if arrival.complete() {
                shared.arrived.remove(&aky).and_then(Arrival::take_slots)
            } else {
                None
            }
        };
        let Some(slots) = slots else { continue };

        // Decode outside the lock, dispatch under it.
        match assemble(&slots, inner.cipher.as_ref()) {
            Ok((key, payload)) => {
                let mut shared = inner.shared.lock();
                handler::dispatch(&inner, &mut shared, key, payload, Some(source));
                shared.members.insert(source, header.tsm);
            }
            Err(err) => {
                tracing::warn!("message from {} discarded: {}", source, err);
            }
        }
    }
}
