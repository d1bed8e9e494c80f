// Copyright 2025 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Byte buffer backing a connection's receive side

use std::io::{ErrorKind, Read, Result};

/// A growable, contiguous byte buffer with separate read and write positions.
///
/// Bytes are appended at the tail and consumed from the head; consumed space
/// is reclaimed by compaction once the read offset passes half the stored
/// length.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    read_offset: usize,
}

impl Buffer {
    /// Creates a new Buffer with the given initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            read_offset: 0,
        }
    }

    /// Determines the number of bytes available to be read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_offset
    }

    /// Whether no bytes are currently readable.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The readable region.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.read_offset..]
    }

    /// Appends `bytes` at the write position.
    pub fn write(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Mark a certain amount of bytes read from the buffer, freeing them for
    /// removal. If this is not called after reading, the next read will
    /// receive the same data.
    pub fn mark_read(&mut self, amount: usize) {
        self.read_offset = self.data.len().min(self.read_offset + amount);
        self.compact();
    }

    /// Takes every readable byte out of the buffer, resetting both offsets so
    /// the allocation can be reused for the next chunk.
    pub fn take_all(&mut self) -> Vec<u8> {
        let out = self.data.split_off(self.read_offset);
        self.data.clear();
        self.read_offset = 0;
        out
    }

    /// Reads from `source` into the write position, at most `max` bytes.
    ///
    /// Mirrors the session fill loop: `Ok(0)` means the source reached EOF,
    /// `Err(WouldBlock)` means nothing was available, and any other `Ok(n)`
    /// is the number of bytes appended before the source drained.
    pub fn fill_from<R: Read>(&mut self, source: &mut R, max: usize) -> Result<usize> {
        let mut read = 0;

        while read < max {
            let want = (max - read).min(4096);
            let start = self.data.len();
            self.data.resize(start + want, 0);

            match source.read(&mut self.data[start..]) {
                Ok(0) => {
                    self.data.truncate(start);
                    return Ok(0);
                }
                Ok(n) => {
                    self.data.truncate(start + n);
                    read += n;
                }
                Err(e) => {
                    self.data.truncate(start);
                    return match e.kind() {
                        ErrorKind::WouldBlock => {
                            if read == 0 {
                                Err(e)
                            } else {
                                Ok(read)
                            }
                        }
                        ErrorKind::Interrupted => continue,
                        _ => Err(e),
                    };
                }
            }
        }

        Ok(read)
    }

    fn compact(&mut self) {
        if self.read_offset == self.data.len() {
            self.data.clear();
            self.read_offset = 0;
        } else if self.read_offset > self.data.len() / 2 {
            self.data.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Buffer;
    use std::io::{Cursor, ErrorKind, Read};

    #[test]
    fn write_then_consume() {
        let mut buf = Buffer::with_capacity(16);
        buf.write(b"hello world");
        assert_eq!(buf.remaining(), 11);
        assert_eq!(buf.as_slice(), b"hello world");

        buf.mark_read(6);
        assert_eq!(buf.as_slice(), b"world");

        buf.mark_read(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn take_all_resets_offsets() {
        let mut buf = Buffer::with_capacity(16);
        buf.write(b"abcdef");
        buf.mark_read(2);

        assert_eq!(buf.take_all(), b"cdef");
        assert!(buf.is_empty());

        buf.write(b"next");
        assert_eq!(buf.as_slice(), b"next");
    }

    #[test]
    fn fill_from_respects_max() {
        let mut buf = Buffer::with_capacity(4);
        let mut source = Cursor::new(vec![7u8; 100]);

        assert_eq!(buf.fill_from(&mut source, 32).unwrap(), 32);
        assert_eq!(buf.remaining(), 32);
    }

    #[test]
    fn fill_from_signals_eof() {
        let mut buf = Buffer::with_capacity(4);
        let mut source = Cursor::new(Vec::<u8>::new());

        assert_eq!(buf.fill_from(&mut source, 32).unwrap(), 0);
    }

    struct Blocking;

    impl Read for Blocking {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(ErrorKind::WouldBlock, "empty"))
        }
    }

    #[test]
    fn fill_from_propagates_would_block_when_empty() {
        let mut buf = Buffer::with_capacity(4);
        let err = buf.fill_from(&mut Blocking, 32).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
        assert!(buf.is_empty());
    }
}
