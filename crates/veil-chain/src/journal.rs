//! The per-block rollback journal.
//!
//! Forward application appends length-prefixed records at the tail of one
//! contiguous byte buffer; reverse application pops them LIFO. Each record
//! is the payload followed by a 4-byte little-endian length marker, so the
//! consumer reads the marker at the tail, then the payload before it.

use crate::store::StoreError;

/// A rollback journal being written (forward apply) or consumed (revert).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Journal {
    buf: Vec<u8>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append a record.
    pub fn push(&mut self, payload: &[u8]) {
        self.buf.extend_from_slice(payload);
        self.buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    }

    /// Append a bincode-encoded record.
    pub fn push_encoded<T: bincode::Encode>(&mut self, value: &T) {
        let bytes = bincode::encode_to_vec(value, bincode::config::standard())
            .expect("in-memory encode");
        self.push(&bytes);
    }

    /// Pop the most recent record.
    pub fn pop(&mut self) -> Result<Vec<u8>, StoreError> {
        if self.buf.len() < 4 {
            return Err(StoreError::Corruption("rollback journal underflow"));
        }
        let marker_at = self.buf.len() - 4;
        let len = u32::from_le_bytes(self.buf[marker_at..].try_into().expect("4 bytes")) as usize;
        if len > marker_at {
            return Err(StoreError::Corruption("rollback record length"));
        }
        let payload = self.buf[marker_at - len..marker_at].to_vec();
        self.buf.truncate(marker_at - len);
        Ok(payload)
    }

    /// Pop and bincode-decode the most recent record.
    pub fn pop_decoded<T: bincode::Decode<()>>(&mut self) -> Result<T, StoreError> {
        let payload = self.pop()?;
        let (value, read) = bincode::decode_from_slice(&payload, bincode::config::standard())
            .map_err(|_| StoreError::Corruption("rollback record decode"))?;
        if read != payload.len() {
            return Err(StoreError::Corruption("rollback record trailing bytes"));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_lifo() {
        let mut j = Journal::new();
        j.push(b"first");
        j.push(b"second");
        assert_eq!(j.pop().unwrap(), b"second");
        assert_eq!(j.pop().unwrap(), b"first");
        assert!(j.is_empty());
    }

    #[test]
    fn pop_empty_is_corruption() {
        let mut j = Journal::new();
        assert!(j.pop().is_err());
    }

    #[test]
    fn empty_records_allowed() {
        let mut j = Journal::new();
        j.push(b"");
        j.push(b"x");
        assert_eq!(j.pop().unwrap(), b"x");
        assert_eq!(j.pop().unwrap(), b"");
        assert!(j.is_empty());
    }

    #[test]
    fn encoded_round_trip() {
        let mut j = Journal::new();
        j.push_encoded(&42u32);
        j.push_encoded(&(7u64, vec![1u8, 2, 3]));
        let (h, v): (u64, Vec<u8>) = j.pop_decoded().unwrap();
        assert_eq!((h, v), (7, vec![1, 2, 3]));
        let n: u32 = j.pop_decoded().unwrap();
        assert_eq!(n, 42);
    }

    #[test]
    fn truncated_marker_is_corruption() {
        let mut j = Journal::from_bytes(vec![0, 1]);
        assert!(j.pop().is_err());
    }

    #[test]
    fn oversized_length_is_corruption() {
        // Length marker claims more bytes than exist before it.
        let mut j = Journal::from_bytes(9u32.to_le_bytes().to_vec());
        assert!(j.pop().is_err());
    }

    #[test]
    fn bytes_round_trip_through_storage() {
        let mut j = Journal::new();
        j.push(b"abc");
        let stored = j.as_bytes().to_vec();
        let mut restored = Journal::from_bytes(stored);
        assert_eq!(restored.pop().unwrap(), b"abc");
    }
}
