//! Prefix-buffer writer — spec.md §4.7 / §6 "Wire framing".
//!
//! Reserves `prefix_size` bytes of header space up front, accepts payload
//! writes into the trailing buffer (or an overflow segment list once the
//! hint is exceeded), then commits the caller-supplied prefix bytes and the
//! whole payload as one contiguous byte sequence.

use bytes::BytesMut;

pub struct PrefixBufferWriter {
    prefix_size: usize,
    primary: BytesMut,
    overflow: Vec<Vec<u8>>,
    body_len: usize,
}

impl PrefixBufferWriter {
    /// `hint` is the expected payload size; payloads at or under the hint
    /// share one allocation with the prefix (spec.md §4.7 "Payload ≤ hint:
    /// zero additional allocation").
    pub fn new(prefix_size: usize, hint: usize) -> Self {
        let mut primary = BytesMut::with_capacity(prefix_size + hint);
        primary.resize(prefix_size, 0);
        Self {
            prefix_size,
            primary,
            overflow: Vec::new(),
            body_len: 0,
        }
    }

    /// Append a chunk of payload bytes. Once the reserved capacity is
    /// exhausted, further writes spill to pooled overflow segments (spec.md
    /// §4.7 "Payload > hint: spill to ... segments").
    pub fn write(&mut self, bytes: &[u8]) {
        let would_fit = self.overflow.is_empty() && self.primary.len() + bytes.len() <= self.primary.capacity();
        if would_fit {
            self.primary.extend_from_slice(bytes);
        } else {
            self.overflow.push(bytes.to_vec());
        }
        self.body_len += bytes.len();
    }

    pub fn body_len(&self) -> usize {
        self.body_len
    }

    /// Fill the reserved prefix and produce `prefix ++ payload` as one
    /// contiguous buffer, committed sequentially with the primary buffer
    /// first and overflow segments appended in write order (spec.md §4.7,
    /// §8 scenario 6).
    pub fn complete(mut self, prefix: &[u8]) -> Vec<u8> {
        assert_eq!(prefix.len(), self.prefix_size, "prefix must match the configured prefix size");
        self.primary[..self.prefix_size].copy_from_slice(prefix);
        let mut out = self.primary.to_vec();
        for segment in self.overflow {
            out.extend_from_slice(&segment);
        }
        out
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Prefix writer round-trip (spec.md §8): for any payload P and
        /// prefix H of the configured size, the sink receives exactly
        /// `H ++ P`, regardless of hint size relative to the payload.
        #[test]
        fn round_trips_for_any_payload_and_hint(
            payload in prop::collection::vec(any::<u8>(), 0..500),
            hint in 0usize..64,
        ) {
            let mut writer = PrefixBufferWriter::new(4, hint);
            writer.write(&payload);
            let prefix = (payload.len() as u32).to_be_bytes();
            let out = writer.complete(&prefix);

            let mut expected = prefix.to_vec();
            expected.extend_from_slice(&payload);
            prop_assert_eq!(out, expected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_within_hint_shares_one_buffer() {
        let mut writer = PrefixBufferWriter::new(4, 16);
        writer.write(b"hello");
        let out = writer.complete(&[0, 0, 0, 5]);
        assert_eq!(out, b"\x00\x00\x00\x05hello");
    }

    #[test]
    fn payload_exceeding_hint_spills_to_overflow_and_commits_in_order() {
        let mut writer = PrefixBufferWriter::new(4, 16);
        let payload = vec![0xABu8; 100];
        writer.write(&payload);
        let prefix = (100u32).to_be_bytes();
        let out = writer.complete(&prefix);

        assert_eq!(out.len(), 104);
        assert_eq!(&out[0..4], &prefix);
        assert_eq!(&out[4..], payload.as_slice());
    }

    #[test]
    fn multiple_writes_are_committed_sequentially() {
        let mut writer = PrefixBufferWriter::new(2, 4);
        writer.write(b"ab");
        writer.write(b"cdefgh");
        let out = writer.complete(&[9, 9]);
        assert_eq!(out, b"\x09\x09abcdefgh");
    }
}
