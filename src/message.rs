use crate::error::{Error, Result};

/// Number of independently owned fields in every message.
pub const NUM_FIELDS: usize = 8;

/// Width of the length prefix on the wire.
pub const LEN_PREFIX: usize = 8;

/// Fixed-arity message: 8 fields of uniform length, each separately owned so
/// the copying baseline pays the full gather cost when serializing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    fields: Vec<Vec<u8>>,
    field_size: usize,
}

/// Wire size of one frame for a given field length.
pub fn frame_size(field_size: usize) -> usize {
    LEN_PREFIX + NUM_FIELDS * field_size
}

/// `frame_size` for untrusted prefixes: `None` when the declared field
/// length cannot be a real frame on this platform.
pub fn frame_size_checked(field_size: usize) -> Option<usize> {
    NUM_FIELDS
        .checked_mul(field_size)
        .and_then(|n| n.checked_add(LEN_PREFIX))
}

impl Message {
    /// Build a message with deterministic pattern data in every field.
    pub fn new(field_size: usize) -> Self {
        let fields = (0..NUM_FIELDS)
            .map(|i| {
                let mut field = vec![0u8; field_size];
                let pattern = format!("Field{}_Data_{}", i, field_size);
                let n = pattern.len().min(field_size);
                field[..n].copy_from_slice(&pattern.as_bytes()[..n]);
                field
            })
            .collect();
        Self { fields, field_size }
    }

    pub fn field_size(&self) -> usize {
        self.field_size
    }

    pub fn fields(&self) -> &[Vec<u8>] {
        &self.fields
    }

    /// Serialize into `buf` as `[field_size: u64 LE][field_0]..[field_7]`.
    /// Returns the frame size. Writes nothing if the buffer is too small.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize> {
        let total = frame_size(self.field_size);
        if buf.len() < total {
            return Err(Error::BufferTooSmall {
                needed: total,
                capacity: buf.len(),
            });
        }

        buf[..LEN_PREFIX].copy_from_slice(&(self.field_size as u64).to_le_bytes());
        let mut offset = LEN_PREFIX;
        for field in &self.fields {
            buf[offset..offset + self.field_size].copy_from_slice(field);
            offset += self.field_size;
        }
        Ok(total)
    }

    /// Parse one frame, copying each field into fresh storage. The declared
    /// field size must be fully covered by `buf`; shortfalls are rejected,
    /// never zero-padded.
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < LEN_PREFIX {
            return Err(Error::Truncated {
                needed: LEN_PREFIX,
                got: buf.len(),
            });
        }
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&buf[..LEN_PREFIX]);
        let field_size = u64::from_le_bytes(prefix) as usize;
        let total = frame_size_checked(field_size).ok_or_else(|| {
            Error::ProtocolViolation(format!("absurd declared field size {}", field_size))
        })?;
        if buf.len() < total {
            return Err(Error::Truncated {
                needed: total,
                got: buf.len(),
            });
        }

        let fields = (0..NUM_FIELDS)
            .map(|i| {
                let start = LEN_PREFIX + i * field_size;
                buf[start..start + field_size].to_vec()
            })
            .collect();
        Ok(Self { fields, field_size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for field_size in [1, 16, 128, 1024] {
            let msg = Message::new(field_size);
            let mut buf = vec![0u8; frame_size(field_size)];
            let written = msg.serialize(&mut buf).unwrap();
            assert_eq!(written, frame_size(field_size));

            let parsed = Message::deserialize(&buf).unwrap();
            assert_eq!(parsed.field_size(), field_size);
            for (a, b) in msg.fields().iter().zip(parsed.fields()) {
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn test_serialize_rejects_small_buffer() {
        let msg = Message::new(128);
        let mut buf = vec![0u8; frame_size(128) - 1];
        match msg.serialize(&mut buf) {
            Err(Error::BufferTooSmall { needed, capacity }) => {
                assert_eq!(needed, frame_size(128));
                assert_eq!(capacity, frame_size(128) - 1);
            }
            other => panic!("expected BufferTooSmall, got {:?}", other),
        }
        // Nothing written on failure.
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_deserialize_rejects_short_prefix() {
        let buf = [0u8; LEN_PREFIX - 1];
        assert!(matches!(
            Message::deserialize(&buf),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn test_deserialize_rejects_short_body() {
        let msg = Message::new(64);
        let mut buf = vec![0u8; frame_size(64)];
        msg.serialize(&mut buf).unwrap();
        let short = &buf[..frame_size(64) - 3];
        match Message::deserialize(short) {
            Err(Error::Truncated { needed, got }) => {
                assert_eq!(needed, frame_size(64));
                assert_eq!(got, frame_size(64) - 3);
            }
            other => panic!("expected Truncated, got {:?}", other),
        }
    }

    #[test]
    fn test_field_pattern() {
        let msg = Message::new(32);
        assert!(msg.fields()[3].starts_with(b"Field3_Data_32"));
    }
}
