//! Byte accounting for a single transfer.
//!
//! ```text
//! total_announced = meta_announced + extra_bytes
//!
//! |<------ meta ------>|<------------ extra (file bytes) ------------>|
//! |####################|##################...                        |
//!                                          ^ processed
//! ```
//!
//! `processed` never exceeds `total_announced`; attempts to go past it are
//! rejected with [`DndError::TooMuchData`] and leave the counters unchanged.

use super::meta::MetaDataBuffer;
use crate::error::{DndError, Result};

/// Announced vs. processed bytes plus the meta payload
#[derive(Debug, Clone, Default)]
pub struct TransferAccounting {
    meta: MetaDataBuffer,
    meta_announced: u64,
    extra_bytes: u64,
    processed: u64,
}

impl TransferAccounting {
    /// Create accounting with a meta buffer capped at `max_meta_size`
    pub fn new(max_meta_size: usize) -> Self {
        Self {
            meta: MetaDataBuffer::new(max_meta_size),
            ..Self::default()
        }
    }

    /// Announce sizes for the transfer.
    ///
    /// Fails if already processed bytes exceed the new total or the meta
    /// size exceeds the buffer cap.
    pub fn announce(&mut self, meta_bytes: u64, extra_bytes: u64) -> Result<()> {
        if meta_bytes > self.meta.max_size() as u64 {
            return Err(DndError::BufferOverflow {
                requested: usize::try_from(meta_bytes).unwrap_or(usize::MAX),
                limit: self.meta.max_size(),
            });
        }
        let total = meta_bytes.checked_add(extra_bytes).ok_or_else(|| {
            DndError::InvalidParameter("announced size overflows".to_string())
        })?;
        if self.processed > total {
            return Err(DndError::TooMuchData(format!(
                "{} bytes already processed, {total} announced",
                self.processed
            )));
        }
        self.meta_announced = meta_bytes;
        self.extra_bytes = extra_bytes;
        Ok(())
    }

    /// Append a meta chunk and count it as processed
    pub fn append_meta(&mut self, bytes: &[u8]) -> Result<()> {
        let len = bytes.len() as u64;
        if self.meta.len() as u64 + len > self.meta_announced {
            return Err(DndError::TooMuchData(format!(
                "meta chunk of {len} bytes exceeds announced {} (have {})",
                self.meta_announced,
                self.meta.len()
            )));
        }
        self.check_processed(len)?;
        self.meta.append(bytes)?;
        self.processed += len;
        Ok(())
    }

    /// Count `bytes` of extra (non-meta) data as processed
    pub fn add_processed(&mut self, bytes: u64) -> Result<()> {
        self.check_processed(bytes)?;
        self.processed += bytes;
        Ok(())
    }

    fn check_processed(&self, bytes: u64) -> Result<()> {
        match self.processed.checked_add(bytes) {
            Some(next) if next <= self.total_announced() => Ok(()),
            _ => Err(DndError::TooMuchData(format!(
                "{} + {bytes} bytes exceeds announced {}",
                self.processed,
                self.total_announced()
            ))),
        }
    }

    /// Meta plus extra bytes
    pub fn total_announced(&self) -> u64 {
        self.meta_announced + self.extra_bytes
    }

    /// Announced meta size
    pub fn meta_announced(&self) -> u64 {
        self.meta_announced
    }

    /// Announced extra size
    pub fn extra_bytes(&self) -> u64 {
        self.extra_bytes
    }

    /// Processed bytes
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// All announced meta bytes have arrived
    pub fn is_meta_complete(&self) -> bool {
        self.meta.len() as u64 >= self.meta_announced
    }

    /// All announced bytes have been processed
    pub fn is_complete(&self) -> bool {
        self.processed == self.total_announced()
    }

    /// Percentage processed, 0..=100
    pub fn percent_complete(&self) -> u8 {
        let pct = self.processed.saturating_mul(100) / self.total_announced().max(1);
        pct.min(100) as u8
    }

    /// Meta payload
    pub fn meta(&self) -> &MetaDataBuffer {
        &self.meta
    }

    /// Take the meta payload
    pub fn take_meta(&mut self) -> Vec<u8> {
        self.meta.take()
    }

    /// Reset all counters and release the meta buffer
    pub fn reset(&mut self) {
        self.meta.clear();
        self.meta_announced = 0;
        self.extra_bytes = 0;
        self.processed = 0;
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::config::MAX_META_SIZE;

    #[test]
    fn test_meta_then_extra() {
        let mut acc = TransferAccounting::new(MAX_META_SIZE);
        acc.announce(5, 10).unwrap();
        acc.append_meta(b"hello").unwrap();
        assert!(acc.is_meta_complete());
        assert!(!acc.is_complete());
        assert_eq!(acc.percent_complete(), 33);

        acc.add_processed(10).unwrap();
        assert!(acc.is_complete());
        assert_eq!(acc.percent_complete(), 100);
        assert_eq!(acc.meta().as_bytes(), b"hello");
    }

    #[test]
    fn test_overrun_rejected() {
        let mut acc = TransferAccounting::new(MAX_META_SIZE);
        acc.announce(2, 3).unwrap();
        assert!(matches!(acc.append_meta(b"abc"), Err(DndError::TooMuchData(_))));
        assert_eq!(acc.processed(), 0);

        acc.append_meta(b"ab").unwrap();
        assert!(matches!(acc.add_processed(4), Err(DndError::TooMuchData(_))));
        assert_eq!(acc.processed(), 2);
    }

    #[test]
    fn test_empty_transfer_is_complete() {
        let acc = TransferAccounting::new(MAX_META_SIZE);
        assert!(acc.is_complete());
        assert_eq!(acc.percent_complete(), 0);
    }

    #[test]
    fn test_meta_cap_enforced_on_announce() {
        let mut acc = TransferAccounting::new(16);
        assert!(matches!(
            acc.announce(17, 0),
            Err(DndError::BufferOverflow { .. })
        ));
    }

    proptest! {
        #[test]
        fn test_processed_never_exceeds_announced(
            meta in 0u64..4096,
            extra in 0u64..1_000_000,
            steps in prop::collection::vec(0u64..200_000, 0..32),
        ) {
            let mut acc = TransferAccounting::new(MAX_META_SIZE);
            acc.announce(meta, extra).unwrap();
            let mut last_pct = 0;
            for step in steps {
                let before = acc.processed();
                if acc.add_processed(step).is_err() {
                    prop_assert_eq!(acc.processed(), before);
                }
                prop_assert!(acc.processed() <= acc.total_announced());
                let pct = acc.percent_complete();
                prop_assert!(pct >= last_pct);
                last_pct = pct;
            }
        }
    }
}
