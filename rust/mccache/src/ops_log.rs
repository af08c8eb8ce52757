//! The standardized operation log.
//!
//! Every fragment sent, acknowledgement processed, conflict detected, and
//! eviction announced is reported as one line of tab-delimited fields, so
//! tests and operators can parse the stream mechanically:
//!
//! ```text
//! Op:INS	Ts:2026-08-01T12:34:56.123456789Z	Fr:192.168.1.9	Nm:mccache	Ky:a2V5	Ck:1B2M2Y8AsgTpgAmY7PhCfg	Mg:out going to members
//! ```

use std::net::Ipv4Addr;
use std::time::{Duration, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;

use mccache_wire::{Checksum, OpCode};

#[derive(Clone, Copy, Debug)]
pub(crate) enum OpsLevel {
    Debug,
    Info,
    Warn,
    Error,
}

pub(crate) fn render_tsm(tsm: u64) -> String {
    humantime::format_rfc3339_nanos(UNIX_EPOCH + Duration::from_nanos(tsm)).to_string()
}

/// Compose the fixed field layout.  Absent fields keep their tag so the
/// column count never changes.
pub(crate) fn line(
    opcode: OpCode,
    sender: Option<Ipv4Addr>,
    tsm: Option<u64>,
    namespace: Option<&str>,
    key: Option<&[u8]>,
    crc: Option<Checksum>,
    msg: &str,
) -> String {
    let sender = sender.map(|ip| ip.to_string()).unwrap_or_default();
    let tsm = tsm.map(render_tsm).unwrap_or_default();
    let namespace = namespace.unwrap_or_default();
    let key = key.map(|k| STANDARD_NO_PAD.encode(k)).unwrap_or_default();
    let crc = crc.map(|c| c.to_string()).unwrap_or_default();
    format!("Op:{opcode}\tTs:{tsm}\tFr:{sender}\tNm:{namespace}\tKy:{key}\tCk:{crc}\tMg:{msg}")
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn emit(
    level: OpsLevel,
    opcode: OpCode,
    sender: Option<Ipv4Addr>,
    tsm: Option<u64>,
    namespace: Option<&str>,
    key: Option<&[u8]>,
    crc: Option<Checksum>,
    msg: &str,
) {
    let text = line(opcode, sender, tsm, namespace, key, crc, msg);
    match level {
        OpsLevel::Debug => tracing::debug!(target: "mccache::ops", "{}", text),
        OpsLevel::Info => tracing::info!(target: "mccache::ops", "{}", text),
        OpsLevel::Warn => tracing::warn!(target: "mccache::ops", "{}", text),
        OpsLevel::Error => tracing::error!(target: "mccache::ops", "{}", text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_always_has_seven_tab_delimited_fields() {
        let full = line(
            OpCode::Ins,
            Some(Ipv4Addr::new(192, 168, 1, 9)),
            Some(1_700_000_000_000_000_000),
            Some("mccache"),
            Some(b"key"),
            Some(Checksum::of(b"value")),
            "out going to members",
        );
        assert_eq!(full.split('\t').count(), 7);

        let sparse = line(OpCode::Met, None, None, None, None, None, "");
        assert_eq!(sparse.split('\t').count(), 7);
        assert!(sparse.starts_with("Op:MET\tTs:\tFr:\t"));
    }

    #[test]
    fn timestamps_render_with_nanosecond_precision() {
        let rendered = render_tsm(1_700_000_000_000_000_042);
        assert!(rendered.ends_with("Z"));
        assert!(rendered.contains(".000000042"));
    }
}
