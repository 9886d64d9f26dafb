// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

/// Fixed-capacity circular byte buffer backing a PTY's scrollback.
///
/// Writes never fail and never block. When the buffer wraps, the oldest
/// bytes are silently discarded so that at most `capacity` bytes are
/// retained. A total-bytes-ever-written counter survives `reset` so
/// consumers can reason about stream offsets.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    capacity: usize,
    write_pos: usize,
    len: usize,
    total_written: u64,
}

/// Default scrollback capacity per session: 256 KiB.
pub const DEFAULT_CAPACITY: usize = 256 * 1024;

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: vec![0u8; capacity],
            capacity,
            write_pos: 0,
            len: 0,
            total_written: 0,
        }
    }

    /// Append data, retaining only the most recent `capacity` bytes.
    ///
    /// Returns the number of bytes accepted, which is always `data.len()`.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let original_len = data.len();
        self.total_written += data.len() as u64;

        // Only the tail of an oversized write can ever be read back.
        let data = if data.len() >= self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        let start = self.write_pos;
        let end = start + data.len();
        if end <= self.capacity {
            self.buf[start..end].copy_from_slice(data);
        } else {
            let first = self.capacity - start;
            self.buf[start..self.capacity].copy_from_slice(&data[..first]);
            self.buf[..data.len() - first].copy_from_slice(&data[first..]);
        }

        self.write_pos = end % self.capacity;
        self.len = (self.len + data.len()).min(self.capacity);
        original_len
    }

    /// Copy out the current contents in chronological order (oldest first).
    pub fn read_all(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        if self.len == 0 {
            return out;
        }
        // Content ends at `write_pos` (exclusive) and spans `len` bytes back.
        let start = (self.write_pos + self.capacity - self.len) % self.capacity;
        if start + self.len <= self.capacity {
            out.extend_from_slice(&self.buf[start..start + self.len]);
        } else {
            out.extend_from_slice(&self.buf[start..self.capacity]);
            out.extend_from_slice(&self.buf[..self.len - (self.capacity - start)]);
        }
        out
    }

    /// Current content length: `min(total written since reset, capacity)`.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Empty the buffer. The total-written counter is unaffected.
    pub fn reset(&mut self) {
        self.write_pos = 0;
        self.len = 0;
    }

    /// Total bytes ever written through this buffer.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
#[path = "ring_tests.rs"]
mod tests;
