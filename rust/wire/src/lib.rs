//! Wire vocabulary for the multicast coherence protocol: operation codes, the
//! fixed fragment header, message fragmentation and reassembly, and the
//! optional authenticated payload cipher.
//!
//! A message is a pair of bincode-serialized tuples, `MessageKey` followed by
//! `MessagePayload`, cut into fragments of at most the usable MTU.  Every
//! fragment is one UDP datagram: an 18-byte header and a slice of the
//! (optionally enciphered) blob.

use std::fmt;
use std::net::Ipv4Addr;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use mccache_error::{ErrorCodes, McCacheError};

mod codec;
mod crypt;
mod header;

pub use codec::{assemble, encode_message, peek_key, Fragment};
pub use crypt::PayloadCipher;
pub use header::FragmentHeader;

/// 5-bit protocol pattern with a 3-bit version in the low bits.  Peers reject
/// any other value rather than attempt forward compatibility: a later version
/// may reorder the header fields.
pub const MAGIC_BYTE: u8 = 0b1111_1001;

/// Fixed length of the per-fragment header.
pub const HEADER_SIZE: usize = 18;

/// Serialized keys and values each carry a two-byte length on the wire.
pub const MAX_SEGMENT_LEN: usize = u16::MAX as usize;

/// The fragment sequence and count ride in one byte each.
pub const MAX_FRAGMENTS: usize = u8::MAX as usize;

/////////////////////////////////////////////// Error //////////////////////////////////////////////

#[derive(Debug, Error)]
pub enum WireError {
    #[error("datagram does not start with the magic byte (got {0:#04x})")]
    BadMagic(u8),
    #[error("malformed datagram: {0}")]
    MalformedDatagram(String),
    #[error("serialized {segment} is {len} bytes, over the wire limit")]
    MessageTooLarge { segment: &'static str, len: usize },
    #[error("payload failed authenticated decryption")]
    BadDecrypt,
    #[error("payload encryption failed")]
    CipherFailure,
    #[error("crypto key must decode to exactly {expected} bytes of base64")]
    BadCryptoKey { expected: usize },
}

impl McCacheError for WireError {
    fn code(&self) -> ErrorCodes {
        match self {
            WireError::BadMagic(_) => ErrorCodes::DataLoss,
            WireError::MalformedDatagram(_) => ErrorCodes::DataLoss,
            WireError::MessageTooLarge { .. } => ErrorCodes::ResourceExhausted,
            WireError::BadDecrypt => ErrorCodes::DataLoss,
            WireError::CipherFailure => ErrorCodes::Internal,
            WireError::BadCryptoKey { .. } => ErrorCodes::InvalidArgument,
        }
    }
}

////////////////////////////////////////////// OpCode //////////////////////////////////////////////

/// Cache operation codes.  Every on-wire message carries exactly one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    /// Acknowledgement of a received message.
    Ack,
    /// Member announcing it is leaving the group.
    Bye,
    /// Member requesting the group to delete a cache entry.
    Del,
    /// Member announcing an error to the group.
    Err,
    /// Member announcing an eviction to the group.
    Evt,
    /// Member communicating information.
    Fyi,
    /// Member inquiring about cache content digests from the group.
    Inq,
    /// Insert a new cache entry.
    Ins,
    /// Member inquiring about cache metrics from the group.
    Met,
    /// New member announcement to join the group.
    New,
    /// No operation.
    Nop,
    /// Request acknowledgement for a message.
    Rak,
    /// Request resend of a message fragment.
    Req,
    /// Member requesting reset of the cache.
    Rst,
    /// Synchronization notice.
    Syc,
    /// Update an existing cache entry.
    Upd,
    /// Member announcing a warning to the group.
    Wrn,
}

impl OpCode {
    /// True for the mutations peers must acknowledge; only these get a
    /// pending-ack record.
    pub fn needs_ack(&self) -> bool {
        matches!(self, OpCode::Ins | OpCode::Upd | OpCode::Del)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpCode::Ack => "ACK",
            OpCode::Bye => "BYE",
            OpCode::Del => "DEL",
            OpCode::Err => "ERR",
            OpCode::Evt => "EVT",
            OpCode::Fyi => "FYI",
            OpCode::Inq => "INQ",
            OpCode::Ins => "INS",
            OpCode::Met => "MET",
            OpCode::New => "NEW",
            OpCode::Nop => "NOP",
            OpCode::Rak => "RAK",
            OpCode::Req => "REQ",
            OpCode::Rst => "RST",
            OpCode::Syc => "SYC",
            OpCode::Upd => "UPD",
            OpCode::Wrn => "WRN",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

///////////////////////////////////////////// Checksum /////////////////////////////////////////////

/// MD5 digest of a serialized cache value, displayed as unpadded base64 the
/// way it appears in the ops log.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum([u8; 16]);

impl Checksum {
    pub fn of(bytes: &[u8]) -> Self {
        Checksum(md5::compute(bytes).0)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self)
    }
}

///////////////////////////////////////////// Message //////////////////////////////////////////////

/// The key half of a message: which entry, in which namespace, at which
/// version.  `namespace` and `key` are `None` for cluster-scoped operations
/// such as `MET` or a reset of every cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageKey {
    pub namespace: Option<String>,
    pub key: Option<Vec<u8>>,
    pub tsm: u64,
}

/// The value half of a message: the operation, the value checksum, and the
/// serialized value when the operation carries one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub opcode: OpCode,
    pub crc: Option<Checksum>,
    pub value: Option<Vec<u8>>,
}

/// One element of the outbound queue: a decomposed message plus an optional
/// unicast target.  Application mutations, acknowledgements, and housekeeping
/// repairs all travel through this type to the sender task.
#[derive(Clone, Debug)]
pub struct OutboundOp {
    pub opcode: OpCode,
    pub tsm: u64,
    pub namespace: Option<String>,
    pub key: Option<Vec<u8>>,
    pub crc: Option<Checksum>,
    pub value: Option<Vec<u8>>,
    pub target: Option<Ipv4Addr>,
}

impl OutboundOp {
    pub fn message_key(&self) -> MessageKey {
        MessageKey {
            namespace: self.namespace.clone(),
            key: self.key.clone(),
            tsm: self.tsm,
        }
    }

    pub fn message_payload(&self) -> MessagePayload {
        MessagePayload {
            opcode: self.opcode,
            crc: self.crc,
            value: self.value.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_display_is_three_letters() {
        for opc in [OpCode::Ack, OpCode::Ins, OpCode::Upd, OpCode::Del, OpCode::Syc] {
            assert_eq!(opc.to_string().len(), 3);
        }
    }

    #[test]
    fn only_mutations_need_acks() {
        assert!(OpCode::Ins.needs_ack());
        assert!(OpCode::Upd.needs_ack());
        assert!(OpCode::Del.needs_ack());
        assert!(!OpCode::Ack.needs_ack());
        assert!(!OpCode::Evt.needs_ack());
        assert!(!OpCode::Rak.needs_ack());
        assert!(!OpCode::Met.needs_ack());
    }

    #[test]
    fn checksum_is_stable_and_value_sensitive() {
        let a = Checksum::of(b"the quick brown fox");
        let b = Checksum::of(b"the quick brown fox");
        let c = Checksum::of(b"the quick brown fax");
        assert_eq!(a, b);
        assert_ne!(a, c);
        // Unpadded base64 of 16 bytes.
        assert_eq!(a.to_string().len(), 22);
    }
}
