//! Request id allocation.
//!
//! Ids live in the full 16-bit space and are tracked in a fixed bitmap. The
//! allocator hands out ids from a cursor that only moves forward, so a freed
//! id is not handed out again until the cursor has gone around the whole
//! space. Outstanding ids are skipped across the wrap.

use crate::error::{ClientError, Result};

/// Number of distinct request ids.
pub const ID_SPACE: usize = 1 << 16;

const WORDS: usize = ID_SPACE / 64;

/// Bitmap allocator for 16-bit request ids.
pub struct IdAllocator {
    bits: Box<[u64; WORDS]>,
    cursor: u16,
    in_use: usize,
}

impl IdAllocator {
    /// Create an allocator with every id free.
    pub fn new() -> Self {
        Self {
            bits: Box::new([0u64; WORDS]),
            cursor: 0,
            in_use: 0,
        }
    }

    /// Allocate the next free id at or after the cursor.
    pub fn allocate(&mut self) -> Result<u16> {
        if self.in_use == ID_SPACE {
            return Err(ClientError::IdsExhausted);
        }

        let start = self.cursor as usize;
        let mut pos = start;
        // One extra word covers the bits of the start word before the cursor.
        for _ in 0..=WORDS {
            let word = pos / 64;
            let bit = pos % 64;
            let free = !self.bits[word] & (u64::MAX << bit);
            if free != 0 {
                let id = (word * 64 + free.trailing_zeros() as usize) as u16;
                self.set(id);
                self.cursor = id.wrapping_add(1);
                return Ok(id);
            }
            pos = ((word + 1) % WORDS) * 64;
        }

        Err(ClientError::IdsExhausted)
    }

    /// Mark a specific id as outstanding.
    ///
    /// Returns `false` if it already was.
    pub fn claim(&mut self, id: u16) -> bool {
        if self.is_in_use(id) {
            return false;
        }
        self.set(id);
        true
    }

    /// Make an id available again.
    ///
    /// Returns `false` if it was not outstanding.
    pub fn release(&mut self, id: u16) -> bool {
        let (word, mask) = locate(id);
        if self.bits[word] & mask == 0 {
            return false;
        }
        self.bits[word] &= !mask;
        self.in_use -= 1;
        true
    }

    /// Whether `id` is currently outstanding.
    #[inline]
    pub fn is_in_use(&self, id: u16) -> bool {
        let (word, mask) = locate(id);
        self.bits[word] & mask != 0
    }

    /// Number of outstanding ids.
    #[inline]
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Release every id. The cursor keeps its position.
    pub fn clear(&mut self) {
        self.bits.fill(0);
        self.in_use = 0;
    }

    fn set(&mut self, id: u16) {
        let (word, mask) = locate(id);
        self.bits[word] |= mask;
        self.in_use += 1;
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IdAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdAllocator")
            .field("cursor", &self.cursor)
            .field("in_use", &self.in_use)
            .finish()
    }
}

#[inline]
fn locate(id: u16) -> (usize, u64) {
    let id = id as usize;
    (id / 64, 1u64 << (id % 64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_from_zero() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.allocate().unwrap(), 0);
        assert_eq!(ids.allocate().unwrap(), 1);
        assert_eq!(ids.allocate().unwrap(), 2);
        assert_eq!(ids.in_use(), 3);
    }

    #[test]
    fn test_released_id_not_reused_immediately() {
        let mut ids = IdAllocator::new();
        let a = ids.allocate().unwrap();
        assert!(ids.release(a));
        assert_ne!(ids.allocate().unwrap(), a);
        assert!(!ids.release(a));
    }

    #[test]
    fn test_wraparound_skips_outstanding() {
        let mut ids = IdAllocator::new();
        // Keep 0, 1 and 70 outstanding, free everything else.
        for _ in 0..ID_SPACE {
            ids.allocate().unwrap();
        }
        for id in 0..=u16::MAX {
            if id != 0 && id != 1 && id != 70 {
                ids.release(id);
            }
        }
        assert_eq!(ids.in_use(), 3);

        // Cursor wrapped to 0.
        assert_eq!(ids.allocate().unwrap(), 2);
        for expected in 3..70u16 {
            assert_eq!(ids.allocate().unwrap(), expected);
        }
        assert_eq!(ids.allocate().unwrap(), 71);
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let mut ids = IdAllocator::new();
        for _ in 0..ID_SPACE {
            ids.allocate().unwrap();
        }
        assert!(matches!(ids.allocate(), Err(ClientError::IdsExhausted)));

        ids.release(12345);
        assert_eq!(ids.allocate().unwrap(), 12345);
        assert!(matches!(ids.allocate(), Err(ClientError::IdsExhausted)));
    }

    #[test]
    fn test_single_free_id_before_cursor_in_same_word() {
        let mut ids = IdAllocator::new();
        for _ in 0..ID_SPACE {
            ids.allocate().unwrap();
        }
        // Cursor is back at 0. Free id 3 and move the cursor past it.
        ids.release(3);
        ids.release(5);
        assert_eq!(ids.allocate().unwrap(), 3);
        assert_eq!(ids.allocate().unwrap(), 5);
        ids.release(3);
        // Cursor at 6: id 3 is only reachable after a full wrap.
        assert_eq!(ids.allocate().unwrap(), 3);
    }

    #[test]
    fn test_claim() {
        let mut ids = IdAllocator::new();
        assert!(ids.claim(7));
        assert!(!ids.claim(7));
        assert!(ids.is_in_use(7));

        // allocate skips the claimed id
        for expected in 0..7u16 {
            assert_eq!(ids.allocate().unwrap(), expected);
        }
        assert_eq!(ids.allocate().unwrap(), 8);
    }

    #[test]
    fn test_clear() {
        let mut ids = IdAllocator::new();
        ids.allocate().unwrap();
        ids.allocate().unwrap();
        ids.clear();
        assert_eq!(ids.in_use(), 0);
        assert!(!ids.is_in_use(0));
        assert_eq!(ids.allocate().unwrap(), 2);
    }
}
