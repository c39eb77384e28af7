use bytes::Bytes;

use crate::{error::CodecError, transport::Multipart};

/// Single-frame token a subscriber sends to ask for a state snapshot.
pub const SNAPSHOT_REQUEST: &[u8] = b"ICANHAZ?";

/// One state slot as it travels on the wire: key, sequence, body.
///
/// The empty key is reserved for the end-of-snapshot sentinel, whose
/// sequence carries the low-water mark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub sequence: u64,
    pub body: Bytes,
}

impl KvEntry {
    /// A proposed mutation. The publisher overwrites the sequence.
    pub fn new(key: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            sequence: 0,
            body: body.into(),
        }
    }

    pub fn sentinel(sequence: u64) -> Self {
        Self {
            key: String::new(),
            sequence,
            body: Bytes::new(),
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn is_sentinel(&self) -> bool {
        self.key.is_empty()
    }

    /// Whether a store may hold this entry at all.
    pub fn is_storable(&self) -> bool {
        !self.key.is_empty() && !self.body.is_empty()
    }

    pub fn into_frames(self) -> Multipart {
        vec![
            Bytes::from(self.key.into_bytes()),
            Bytes::copy_from_slice(&self.sequence.to_le_bytes()),
            self.body,
        ]
    }

    pub fn from_frames(frames: Multipart) -> Result<Self, CodecError> {
        let [key, sequence_frame, body]: [Bytes; 3] = frames
            .try_into()
            .map_err(|frames: Multipart| CodecError::FrameCount(frames.len()))?;

        let sequence: [u8; 8] = sequence_frame
            .as_ref()
            .try_into()
            .map_err(|_| CodecError::SequenceWidth(sequence_frame.len()))?;

        Ok(Self {
            key: String::from_utf8(key.to_vec())?,
            sequence: u64::from_le_bytes(sequence),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_frame_is_little_endian() {
        let frames = KvEntry::new("a", "1").with_sequence(0x0102).into_frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].as_ref(), b"a");
        assert_eq!(frames[1].as_ref(), &[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(frames[2].as_ref(), b"1");
    }

    #[test]
    fn sentinel_has_empty_key_and_body() {
        let frames = KvEntry::sentinel(2).into_frames();
        assert!(frames[0].is_empty());
        assert!(frames[2].is_empty());

        let parsed = KvEntry::from_frames(frames).expect("sentinel parses");
        assert!(parsed.is_sentinel());
        assert!(!parsed.is_storable());
        assert_eq!(parsed.sequence, 2);
    }

    #[test]
    fn wrong_frame_count_is_rejected() {
        let frames = vec![Bytes::from_static(b"a"), Bytes::from_static(b"1")];
        assert!(matches!(
            KvEntry::from_frames(frames),
            Err(CodecError::FrameCount(2))
        ));
    }

    #[test]
    fn short_sequence_frame_is_rejected() {
        let frames = vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(&[1, 0, 0, 0]),
            Bytes::from_static(b"1"),
        ];
        assert!(matches!(
            KvEntry::from_frames(frames),
            Err(CodecError::SequenceWidth(4))
        ));
    }
}
