use crate::crypt::PayloadCipher;
use crate::header::FragmentHeader;
use crate::{MessageKey, MessagePayload, WireError, HEADER_SIZE, MAX_FRAGMENTS, MAX_SEGMENT_LEN};

/// A parsed datagram: the fixed header plus this fragment's slice of the
/// message blob.
#[derive(Clone, Debug)]
pub struct Fragment {
    pub header: FragmentHeader,
    pub payload: Vec<u8>,
}

impl Fragment {
    pub fn parse(datagram: &[u8]) -> Result<Self, WireError> {
        let header = FragmentHeader::unpack(datagram)?;
        if header.frag_count == 0 || header.seq >= header.frag_count {
            return Err(WireError::MalformedDatagram(format!(
                "fragment {}/{} out of range",
                header.seq, header.frag_count
            )));
        }
        Ok(Fragment {
            header,
            payload: datagram[HEADER_SIZE..].to_vec(),
        })
    }
}

/// Serialize and frame one message into ready-to-send datagrams.
///
/// The key and payload tuples are bincode-encoded, the concatenated blob is
/// optionally sealed by the cipher, and the result is cut at the usable MTU.
/// Each datagram is the 18-byte header followed by at most `mtu - 18` payload
/// bytes.  The header always carries the plaintext segment lengths; assembly
/// deciphers first, then splits.
pub fn encode_message(
    key: &MessageKey,
    payload: &MessagePayload,
    cipher: Option<&PayloadCipher>,
    mtu: usize,
    receiver: u16,
) -> Result<Vec<Vec<u8>>, WireError> {
    let key_b =
        bincode::serialize(key).map_err(|e| WireError::MalformedDatagram(e.to_string()))?;
    if key_b.len() > MAX_SEGMENT_LEN {
        return Err(WireError::MessageTooLarge {
            segment: "key",
            len: key_b.len(),
        });
    }
    let val_b =
        bincode::serialize(payload).map_err(|e| WireError::MalformedDatagram(e.to_string()))?;
    if val_b.len() > MAX_SEGMENT_LEN {
        return Err(WireError::MessageTooLarge {
            segment: "value",
            len: val_b.len(),
        });
    }

    let mut blob = Vec::with_capacity(key_b.len() + val_b.len());
    blob.extend_from_slice(&key_b);
    blob.extend_from_slice(&val_b);
    let blob = match cipher {
        Some(cipher) => cipher.seal(&blob)?,
        None => blob,
    };

    let room = mtu.saturating_sub(HEADER_SIZE);
    if room == 0 {
        return Err(WireError::MalformedDatagram(format!(
            "mtu {} leaves no room for payload",
            mtu
        )));
    }
    let frag_count = blob.len().div_ceil(room).max(1);
    if frag_count > MAX_FRAGMENTS {
        return Err(WireError::MessageTooLarge {
            segment: "message",
            len: blob.len(),
        });
    }

    let mut frames = Vec::with_capacity(frag_count);
    for seq in 0..frag_count {
        let bgn = seq * room;
        let end = (bgn + room).min(blob.len());
        let header = FragmentHeader {
            seq: seq as u8,
            frag_count: frag_count as u8,
            key_len: key_b.len() as u16,
            val_len: val_b.len() as u16,
            tsm: key.tsm,
            receiver,
        };
        let mut frame = Vec::with_capacity(HEADER_SIZE + end - bgn);
        frame.extend_from_slice(&header.pack());
        frame.extend_from_slice(&blob[bgn..end]);
        frames.push(frame);
    }
    Ok(frames)
}

/// Reassemble a complete slot list of datagrams back into the message tuples.
/// Slots are indexed by fragment sequence, so the caller hands them over in
/// order no matter how the datagrams arrived.
pub fn assemble(
    slots: &[Vec<u8>],
    cipher: Option<&PayloadCipher>,
) -> Result<(MessageKey, MessagePayload), WireError> {
    let first = slots
        .first()
        .ok_or_else(|| WireError::MalformedDatagram("no fragments to assemble".to_string()))?;
    let header = FragmentHeader::unpack(first)?;

    let mut blob = Vec::new();
    for slot in slots {
        let fragment = Fragment::parse(slot)?;
        blob.extend_from_slice(&fragment.payload);
    }
    let blob = match cipher {
        Some(cipher) => cipher.open(&blob)?,
        None => blob,
    };

    let key_len = header.key_len as usize;
    let val_len = header.val_len as usize;
    if blob.len() < key_len + val_len {
        return Err(WireError::MalformedDatagram(format!(
            "assembled {} bytes, header promised {}",
            blob.len(),
            key_len + val_len
        )));
    }
    let key: MessageKey = bincode::deserialize(&blob[..key_len])
        .map_err(|e| WireError::MalformedDatagram(e.to_string()))?;
    let payload: MessagePayload = bincode::deserialize(&blob[key_len..key_len + val_len])
        .map_err(|e| WireError::MalformedDatagram(e.to_string()))?;
    Ok((key, payload))
}

/// Best-effort recovery of the message key from a partial arrival.  Works
/// when the leading fragments carrying the serialized key are all present and
/// the payload is not enciphered.  Used to evict a possibly stale local entry
/// when an assembly is abandoned.
pub fn peek_key(slots: &[Option<Vec<u8>>]) -> Option<MessageKey> {
    let first = slots.first()?.as_ref()?;
    let header = FragmentHeader::unpack(first).ok()?;
    let key_len = header.key_len as usize;

    let mut prefix: Vec<u8> = Vec::with_capacity(key_len);
    for slot in slots {
        let fragment = Fragment::parse(slot.as_ref()?).ok()?;
        prefix.extend_from_slice(&fragment.payload);
        if prefix.len() >= key_len {
            break;
        }
    }
    if prefix.len() < key_len {
        return None;
    }
    bincode::deserialize(&prefix[..key_len]).ok()
}
