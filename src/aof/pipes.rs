//! The three channels between the parent and a rewrite child.
//!
//! ```text
//!            diff (non-blocking both ends)
//!   parent ─────────────────────────────────> child
//!   parent <───────────────────────────────── child   stop: "!"
//!   parent ─────────────────────────────────> child   ack:  "!"
//! ```
//!
//! All six descriptors exist before the fork. Each side keeps its own
//! three ends, typed so a side cannot write into a channel it should only
//! read from.

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::pipe;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Byte sent in both directions of the stop handshake.
pub const HANDSHAKE_BYTE: u8 = b'!';

/// Parent-side ends.
#[derive(Debug)]
pub struct ParentPipes {
    /// Write end of the diff channel.
    pub diff_tx: File,
    /// Read end of the stop channel.
    pub stop_rx: File,
    /// Write end of the ack channel.
    pub ack_tx: File,
}

/// Child-side ends.
#[derive(Debug)]
pub struct ChildPipes {
    /// Read end of the diff channel.
    pub diff_rx: File,
    /// Write end of the stop channel.
    pub stop_tx: File,
    /// Read end of the ack channel.
    pub ack_rx: File,
}

/// Creates the three channels.
pub fn open() -> nix::Result<(ParentPipes, ChildPipes)> {
    let (diff_rx, diff_tx) = pipe()?;
    let (stop_rx, stop_tx) = pipe()?;
    let (ack_rx, ack_tx) = pipe()?;

    set_nonblocking(&diff_rx)?;
    set_nonblocking(&diff_tx)?;
    set_nonblocking(&stop_rx)?;

    Ok((
        ParentPipes {
            diff_tx: File::from(diff_tx),
            stop_rx: File::from(stop_rx),
            ack_tx: File::from(ack_tx),
        },
        ChildPipes {
            diff_rx: File::from(diff_rx),
            stop_tx: File::from(stop_tx),
            ack_rx: File::from(ack_rx),
        },
    ))
}

fn set_nonblocking(fd: &OwnedFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

impl ParentPipes {
    pub fn stop_fd(&self) -> RawFd {
        self.stop_rx.as_raw_fd()
    }

    pub fn diff_fd(&self) -> RawFd {
        self.diff_tx.as_raw_fd()
    }

    /// Reads the child's stop request.
    ///
    /// # Returns
    ///
    /// `true` if the byte read was the handshake byte.
    pub fn read_stop(&mut self) -> io::Result<bool> {
        let mut byte = [0u8; 1];
        let n = self.stop_rx.read(&mut byte)?;
        Ok(n == 1 && byte[0] == HANDSHAKE_BYTE)
    }

    pub fn send_ack(&mut self) -> io::Result<()> {
        self.ack_tx.write_all(&[HANDSHAKE_BYTE])
    }
}

impl ChildPipes {
    pub fn send_stop(&mut self) -> io::Result<()> {
        self.stop_tx.write_all(&[HANDSHAKE_BYTE])
    }

    /// Reads everything currently available on the diff channel into
    /// `out`.
    ///
    /// # Returns
    ///
    /// Bytes read.
    pub fn read_diff(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        let mut chunk = [0u8; 65536];
        let mut total = 0;
        loop {
            match self.diff_rx.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    out.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_channel_is_nonblocking() {
        let (mut parent, mut child) = open().unwrap();
        let mut out = Vec::new();
        assert_eq!(child.read_diff(&mut out).unwrap(), 0);

        parent.diff_tx.write_all(b"*1\r\n$4\r\nPING\r\n").unwrap();
        assert_eq!(child.read_diff(&mut out).unwrap(), 14);
        assert_eq!(out, b"*1\r\n$4\r\nPING\r\n");
    }

    #[test]
    fn test_stop_handshake() {
        let (mut parent, mut child) = open().unwrap();
        assert_eq!(
            parent.read_stop().unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        child.send_stop().unwrap();
        assert!(parent.read_stop().unwrap());
        parent.send_ack().unwrap();

        let mut byte = [0u8; 1];
        child.ack_rx.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], HANDSHAKE_BYTE);
    }
}
