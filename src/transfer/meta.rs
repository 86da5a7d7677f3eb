//! Growable meta-data buffer with a hard size cap.

use crate::config::MAX_META_SIZE;
use crate::error::{DndError, Result};

const PAGE_SIZE: usize = 4096;

/// Meta payload of a transfer: raw bytes or a serialized root list.
#[derive(Debug, Clone)]
pub struct MetaDataBuffer {
    data: Vec<u8>,
    max_size: usize,
}

impl Default for MetaDataBuffer {
    fn default() -> Self {
        Self::new(MAX_META_SIZE)
    }
}

impl MetaDataBuffer {
    /// Create an empty buffer capped at `max_size` bytes
    pub fn new(max_size: usize) -> Self {
        Self {
            data: Vec::new(),
            max_size,
        }
    }

    /// Append `bytes`, growing in page-aligned steps.
    ///
    /// Fails with [`DndError::BufferOverflow`] without modifying the buffer
    /// if the result would exceed the cap.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let needed = self.data.len().saturating_add(bytes.len());
        if needed > self.max_size {
            return Err(DndError::BufferOverflow {
                requested: needed,
                limit: self.max_size,
            });
        }

        if needed > self.data.capacity() {
            let target = grow_to(needed, self.max_size);
            self.data.reserve_exact(target - self.data.len());
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Stored bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of stored bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes currently allocated
    pub fn allocated(&self) -> usize {
        self.data.capacity()
    }

    /// Size cap
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Drop contents and release memory
    pub fn clear(&mut self) {
        self.data = Vec::new();
    }

    /// Take the contents, leaving the buffer empty
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

/// Next page-aligned power of two at or above `needed`, capped at `max`.
fn grow_to(needed: usize, max: usize) -> usize {
    let aligned = needed.div_ceil(PAGE_SIZE) * PAGE_SIZE;
    aligned.checked_next_power_of_two().unwrap_or(max).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read() {
        let mut buf = MetaDataBuffer::default();
        buf.append(b"hello ").unwrap();
        buf.append(b"world").unwrap();
        assert_eq!(buf.as_bytes(), b"hello world");
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn test_growth_is_page_aligned() {
        let mut buf = MetaDataBuffer::default();
        buf.append(&[0u8; 10]).unwrap();
        assert!(buf.allocated() >= PAGE_SIZE);
        assert_eq!(grow_to(4097, MAX_META_SIZE), 8192);
        assert_eq!(grow_to(12289, MAX_META_SIZE), 16384);
        assert_eq!(grow_to(MAX_META_SIZE - 1, MAX_META_SIZE), MAX_META_SIZE);
    }

    #[test]
    fn test_overflow_leaves_buffer_untouched() {
        let mut buf = MetaDataBuffer::new(8);
        buf.append(b"12345").unwrap();
        let err = buf.append(b"6789").unwrap_err();
        assert!(matches!(
            err,
            DndError::BufferOverflow {
                requested: 9,
                limit: 8
            }
        ));
        assert_eq!(buf.as_bytes(), b"12345");
    }

    #[test]
    fn test_take_and_clear() {
        let mut buf = MetaDataBuffer::default();
        buf.append(b"abc").unwrap();
        assert_eq!(buf.take(), b"abc".to_vec());
        assert!(buf.is_empty());
        buf.append(b"x").unwrap();
        buf.clear();
        assert_eq!(buf.allocated(), 0);
    }
}
