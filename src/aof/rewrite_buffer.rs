//! The rewrite buffer: commands fed while a rewrite child is running.
//!
//! Bytes are appended at the tail and consumed from the head as they are
//! streamed to the child. Storage is a queue of fixed-capacity blocks so a
//! long rewrite under heavy write load never reallocates one huge buffer.
//!
//! ```text
//!   head (partly sent)                     tail (partly filled)
//! ┌────────────────┐  ┌────────────────┐  ┌────────────────┐
//! │ ░░░░░░████████ │─>│ ██████████████ │─>│ ██████         │
//! └────────────────┘  └────────────────┘  └────────────────┘
//!   ░ sent  █ pending
//! ```

use bytes::{Buf, BytesMut};
use std::collections::VecDeque;
use std::io::{self, Write};
use tracing::{info, warn};

/// Ordered blocks of pending diff bytes.
#[derive(Debug)]
pub struct RewriteBuffer {
    blocks: VecDeque<BytesMut>,
    block_size: usize,
    /// Sum of pending bytes over all blocks.
    pending: usize,
}

impl RewriteBuffer {
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: VecDeque::new(),
            block_size: block_size.max(1),
            pending: 0,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Pending bytes.
    pub fn len(&self) -> usize {
        self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Drops everything.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.pending = 0;
    }

    /// Appends `data`, filling the tail block before allocating new ones.
    pub fn append(&mut self, mut data: &[u8]) {
        self.pending += data.len();
        while !data.is_empty() {
            let room = match self.blocks.back() {
                Some(tail) => self.block_size - tail.len(),
                None => 0,
            };
            if room == 0 {
                self.blocks.push_back(BytesMut::with_capacity(self.block_size));
                self.log_growth();
                continue;
            }
            let n = room.min(data.len());
            if let Some(tail) = self.blocks.back_mut() {
                tail.extend_from_slice(&data[..n]);
            }
            data = &data[n..];
        }
    }

    fn log_growth(&self) {
        let blocks = self.blocks.len();
        if blocks % 10 != 0 {
            return;
        }
        let mb = (blocks * self.block_size) / (1024 * 1024);
        if blocks % 100 == 0 {
            warn!(blocks, mb, "Background AOF buffer size keeps growing");
        } else {
            info!(blocks, mb, "Background AOF buffer size grew");
        }
    }

    /// Writes pending bytes to `out` until it would block or everything is
    /// written. Fully sent blocks are freed.
    ///
    /// # Returns
    ///
    /// Bytes written. `WouldBlock` is not an error; any other failure is.
    pub fn write_to<W: Write>(&mut self, out: &mut W) -> io::Result<usize> {
        let mut total = 0;
        while let Some(head) = self.blocks.front_mut() {
            if head.is_empty() {
                self.blocks.pop_front();
                continue;
            }
            match out.write(head) {
                Ok(0) => break,
                Ok(n) => {
                    head.advance(n);
                    self.pending -= n;
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if self.pending == 0 {
            self.blocks.clear();
        }
        Ok(total)
    }

    /// Writes all pending bytes to a blocking `out` and empties the buffer.
    pub fn drain_into<W: Write>(&mut self, out: &mut W) -> io::Result<usize> {
        let mut total = 0;
        while let Some(head) = self.blocks.pop_front() {
            out.write_all(&head)?;
            total += head.len();
            self.pending -= head.len();
        }
        Ok(total)
    }
}
