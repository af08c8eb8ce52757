use crate::{WireError, HEADER_SIZE, MAGIC_BYTE};

/// The fixed header preceding every fragment payload, in network byte order:
///
/// | field          | bytes |
/// |----------------|-------|
/// | magic+version  | 1     |
/// | reserved       | 1     |
/// | sequence       | 1     |
/// | fragment count | 1     |
/// | key length     | 2     |
/// | value length   | 2     |
/// | timestamp (ns) | 8     |
/// | receiver octet | 2     |
///
/// All fragments of one message repeat the same values except `seq`.  A
/// receiver octet of zero means the datagram is for every member; any other
/// value is the last octet of the one peer it is addressed to, so everyone
/// else can drop it without parsing the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentHeader {
    pub seq: u8,
    pub frag_count: u8,
    pub key_len: u16,
    pub val_len: u16,
    pub tsm: u64,
    pub receiver: u16,
}

impl FragmentHeader {
    pub fn pack(&self) -> [u8; HEADER_SIZE] {
        let mut b = [0u8; HEADER_SIZE];
        b[0] = MAGIC_BYTE;
        b[1] = 0; // reserved
        b[2] = self.seq;
        b[3] = self.frag_count;
        b[4..6].copy_from_slice(&self.key_len.to_be_bytes());
        b[6..8].copy_from_slice(&self.val_len.to_be_bytes());
        b[8..16].copy_from_slice(&self.tsm.to_be_bytes());
        b[16..18].copy_from_slice(&self.receiver.to_be_bytes());
        b
    }

    pub fn unpack(datagram: &[u8]) -> Result<Self, WireError> {
        if datagram.len() < HEADER_SIZE {
            return Err(WireError::MalformedDatagram(format!(
                "{} byte datagram is shorter than the {} byte header",
                datagram.len(),
                HEADER_SIZE
            )));
        }
        if datagram[0] != MAGIC_BYTE {
            return Err(WireError::BadMagic(datagram[0]));
        }
        let mut tsm = [0u8; 8];
        tsm.copy_from_slice(&datagram[8..16]);
        Ok(FragmentHeader {
            seq: datagram[2],
            frag_count: datagram[3],
            key_len: u16::from_be_bytes([datagram[4], datagram[5]]),
            val_len: u16::from_be_bytes([datagram[6], datagram[7]]),
            tsm: u64::from_be_bytes(tsm),
            receiver: u16::from_be_bytes([datagram[16], datagram[17]]),
        })
    }

    /// Overwrite the receiver octet of an already packed fragment.  Used when
    /// re-sending a stored fragment to the one peer that asked for it.
    pub fn patch_receiver(datagram: &mut [u8], receiver: u16) {
        if datagram.len() >= HEADER_SIZE {
            datagram[16..18].copy_from_slice(&receiver.to_be_bytes());
        }
    }
}
