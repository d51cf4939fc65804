//! Derived state: continuity data carried from one call to the next.
//!
//! The blob is opaque to the caller. It is sealed under a key derived from
//! the call key, so a blob handed to a session with a different key fails
//! to open and is reported as a key mismatch.
//!
//! ```text
//! blob = nonce(24) || XChaCha20-Poly1305(bincode(DerivedRecord))
//! ```

use crate::CryptoError;
use crate::constant_time::verify_8;
use crate::keys::KeySchedule;
use serde::{Deserialize, Serialize};

/// Current record format.
pub const DERIVED_FORMAT: u8 = 1;

/// Continuity record stored inside the blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedRecord {
    /// Record format version
    pub format: u8,
    /// Fingerprint of the call key that produced the record
    pub key_fingerprint: [u8; 8],
    /// Number of sessions that reached a connected state with this state chain
    pub generation: u32,
    /// Descriptor id of the last path that carried traffic
    pub last_path_id: Option<i64>,
    /// Reconnects observed across the chain
    pub reconnects: u32,
}

impl DerivedRecord {
    /// First record of a chain for the given schedule.
    #[must_use]
    pub fn first(schedule: &KeySchedule) -> Self {
        Self {
            format: DERIVED_FORMAT,
            key_fingerprint: schedule.fingerprint(),
            generation: 0,
            last_path_id: None,
            reconnects: 0,
        }
    }

    /// Successor record after a session that connected at least once.
    #[must_use]
    pub fn advance(&self, last_path_id: Option<i64>, reconnects: u32) -> Self {
        Self {
            format: DERIVED_FORMAT,
            key_fingerprint: self.key_fingerprint,
            generation: self.generation.saturating_add(1),
            last_path_id: last_path_id.or(self.last_path_id),
            reconnects: self.reconnects.saturating_add(reconnects),
        }
    }
}

/// Codec for the derived-state blob.
pub struct DerivedState;

impl DerivedState {
    /// Open a blob supplied by the caller.
    ///
    /// Returns `Ok(None)` for an empty blob (no previous session).
    ///
    /// # Errors
    ///
    /// - [`CryptoError::KeyMismatch`] if the blob was sealed under another
    ///   call key
    /// - [`CryptoError::UnsupportedFormat`] for an unknown record format
    /// - [`CryptoError::Truncated`] / [`CryptoError::InvalidMessage`] for
    ///   damaged blobs
    pub fn open(schedule: &KeySchedule, blob: &[u8]) -> Result<Option<DerivedRecord>, CryptoError> {
        if blob.is_empty() {
            return Ok(None);
        }

        let plaintext = schedule.derived_state().open(blob).map_err(|e| match e {
            CryptoError::DecryptionFailed => CryptoError::KeyMismatch,
            other => other,
        })?;
        let record: DerivedRecord = bincode::deserialize(&plaintext)?;

        if record.format != DERIVED_FORMAT {
            return Err(CryptoError::UnsupportedFormat(record.format));
        }
        if !verify_8(&record.key_fingerprint, &schedule.fingerprint()) {
            return Err(CryptoError::KeyMismatch);
        }

        Ok(Some(record))
    }

    /// Seal a record into a blob for the caller to persist.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or sealing fails.
    pub fn seal(schedule: &KeySchedule, record: &DerivedRecord) -> Result<Vec<u8>, CryptoError> {
        let plaintext = bincode::serialize(record)?;
        schedule.derived_state().seal(&plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{CALL_KEY_SIZE, CallKey, Direction};

    fn schedule(byte: u8) -> KeySchedule {
        KeySchedule::derive(&CallKey::new([byte; CALL_KEY_SIZE]), Direction::Outgoing)
    }

    #[test]
    fn test_empty_blob_is_fresh() {
        assert_eq!(DerivedState::open(&schedule(1), &[]).unwrap(), None);
    }

    #[test]
    fn test_seal_open() {
        let s = schedule(1);
        let record = DerivedRecord::first(&s).advance(Some(7), 2);
        let blob = DerivedState::seal(&s, &record).unwrap();
        assert!(!blob.is_empty());

        let opened = DerivedState::open(&s, &blob).unwrap().unwrap();
        assert_eq!(opened, record);
        assert_eq!(opened.generation, 1);
        assert_eq!(opened.last_path_id, Some(7));
    }

    #[test]
    fn test_other_key_is_mismatch() {
        let blob = DerivedState::seal(&schedule(1), &DerivedRecord::first(&schedule(1))).unwrap();
        assert_eq!(
            DerivedState::open(&schedule(2), &blob),
            Err(CryptoError::KeyMismatch)
        );
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(DerivedState::open(&schedule(1), &[0xFF; 12]).is_err());
        assert!(DerivedState::open(&schedule(1), &[0xFF; 80]).is_err());
    }

    #[test]
    fn test_advance_keeps_last_path() {
        let s = schedule(4);
        let first = DerivedRecord::first(&s).advance(Some(3), 0);
        let second = first.advance(None, 1);
        assert_eq!(second.generation, 2);
        assert_eq!(second.last_path_id, Some(3));
        assert_eq!(second.reconnects, 1);
    }
}
