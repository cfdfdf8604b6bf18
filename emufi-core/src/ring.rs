//! Fixed-capacity circular log buffer.
//!
//! Keeps the most recent `capacity` bytes of a console stream. Writers
//! overwrite the oldest bytes once the buffer is full; readers render the
//! retained window oldest-first or search it without copying.
//!
//! # Invariants
//! - `len <= capacity`
//! - `head` is the next write position, always `< capacity`
//! - the logical content starts at `(head + capacity - len) % capacity`

use std::fmt;
use std::sync::Mutex;

/// Default console buffer capacity in bytes
pub const DEFAULT_CAPACITY: usize = 10 * 1024;

/// Thread-safe circular byte buffer holding the tail of a text stream.
#[derive(Debug)]
pub struct CircularBuffer {
    ring: Mutex<Ring>,
}

#[derive(Debug)]
struct Ring {
    buf: Box<[u8]>,
    head: usize,
    len: usize,
}

impl Ring {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn start(&self) -> usize {
        (self.head + self.capacity() - self.len) % self.capacity()
    }

    #[inline]
    fn byte_at(&self, offset: usize) -> u8 {
        self.buf[(self.start() + offset) % self.capacity()]
    }

    fn put(&mut self, data: &[u8]) {
        let cap = self.capacity();
        // Only the last `cap` bytes of an oversized write survive.
        let data = &data[data.len().saturating_sub(cap)..];

        let first = data.len().min(cap - self.head);
        self.buf[self.head..self.head + first].copy_from_slice(&data[..first]);
        let rest = &data[first..];
        self.buf[..rest.len()].copy_from_slice(rest);

        self.head = (self.head + data.len()) % cap;
        self.len = (self.len + data.len()).min(cap);
    }

    fn contains(&self, pattern: &[u8]) -> bool {
        if pattern.is_empty() {
            return true;
        }
        if pattern.len() > self.len {
            return false;
        }
        // Single forward pass over the logical window; indices wrap at capacity.
        (0..=self.len - pattern.len()).any(|offset| {
            pattern
                .iter()
                .enumerate()
                .all(|(i, &b)| self.byte_at(offset + i) == b)
        })
    }

    fn to_vec(&self) -> Vec<u8> {
        let start = self.start();
        let first = self.len.min(self.capacity() - start);
        let mut out = Vec::with_capacity(self.len);
        out.extend_from_slice(&self.buf[start..start + first]);
        out.extend_from_slice(&self.buf[..self.len - first]);
        out
    }
}

impl CircularBuffer {
    /// Create an empty buffer.
    ///
    /// # Panics
    /// Panics if `capacity == 0`.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "circular buffer capacity must be > 0");
        Self {
            ring: Mutex::new(Ring {
                buf: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
                len: 0,
            }),
        }
    }

    fn ring(&self) -> std::sync::MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.ring().capacity()
    }

    /// Number of retained bytes (`min(total written, capacity)`)
    pub fn len(&self) -> usize {
        self.ring().len
    }

    /// Whether nothing has been written since creation or the last clear
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append text, overwriting the oldest bytes when full.
    pub fn put(&self, text: &str) {
        self.put_bytes(text.as_bytes());
    }

    /// Append raw bytes, overwriting the oldest bytes when full.
    pub fn put_bytes(&self, data: &[u8]) {
        self.ring().put(data);
    }

    /// Whether `pattern` occurs in the retained window, including occurrences
    /// that straddle the physical wrap point.
    pub fn contains(&self, pattern: &str) -> bool {
        self.ring().contains(pattern.as_bytes())
    }

    /// Retained content, oldest byte first.
    pub fn snapshot(&self) -> String {
        String::from_utf8_lossy(&self.ring().to_vec()).into_owned()
    }

    /// Drop all content and zero the storage.
    pub fn clear(&self) {
        let mut ring = self.ring();
        ring.buf.fill(0);
        ring.head = 0;
        ring.len = 0;
    }
}

impl Default for CircularBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl fmt::Display for CircularBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overwrite_keeps_tail() {
        let buffer = CircularBuffer::with_capacity(10);
        buffer.put("ABCDEFGHIJ");
        buffer.put("KL");
        assert_eq!(buffer.snapshot(), "CDEFGHIJKL");
        assert_eq!(buffer.len(), 10);
    }

    #[test]
    fn test_partial_fill() {
        let buffer = CircularBuffer::with_capacity(10);
        assert!(buffer.is_empty());
        buffer.put("abc");
        assert_eq!(buffer.snapshot(), "abc");
        assert_eq!(buffer.to_string(), "abc");
        assert!(!buffer.contains("abcd"));
    }

    #[test]
    fn test_oversized_write() {
        let buffer = CircularBuffer::with_capacity(4);
        buffer.put("xy");
        buffer.put("0123456789");
        assert_eq!(buffer.snapshot(), "6789");
    }

    #[test]
    fn test_contains_across_wrap() {
        let buffer = CircularBuffer::with_capacity(10);
        buffer.put("ABCDEFGHIJ");
        buffer.put("KL");
        // "JK" straddles the physical end of storage
        assert!(buffer.contains("JK"));
        assert!(buffer.contains("IJKL"));
        assert!(buffer.contains("CDEFGHIJKL"));
        assert!(!buffer.contains("AB"));
        // Newest and oldest bytes are not adjacent in the logical window
        assert!(!buffer.contains("LC"));
    }

    #[test]
    fn test_contains_after_false_start() {
        let buffer = CircularBuffer::with_capacity(16);
        buffer.put("Kernel Kernel panic");
        assert!(buffer.contains("Kernel panic"));
        assert!(buffer.contains(""));

        let buffer = CircularBuffer::with_capacity(8);
        buffer.put("AAAB");
        assert!(buffer.contains("AAB"));
    }

    #[test]
    fn test_clear() {
        let buffer = CircularBuffer::with_capacity(8);
        buffer.put("Kernel panic");
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.snapshot(), "");
        assert!(!buffer.contains("panic"));
        buffer.put("ok");
        assert_eq!(buffer.snapshot(), "ok");
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn test_zero_capacity_panics() {
        let _ = CircularBuffer::with_capacity(0);
    }
}
