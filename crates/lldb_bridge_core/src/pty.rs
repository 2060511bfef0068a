//! Pseudo-terminal bridge.
//!
//! LLDB only prints its interactive prompt when stdin/stdout are a terminal,
//! so the debugger is started with the replica side of a pty as its standard
//! streams while the session reads and writes the primary side.

use std::os::fd::OwnedFd;
use std::process::Stdio;

use nix::pty::openpty;
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};

use crate::Result;

/// Primary/replica descriptor pair. Both descriptors are closed exactly once,
/// when the bridge is dropped. Once the debugger has been spawned the parent
/// must give up its replica with [`PtyBridge::into_primary`]; otherwise the
/// primary never reports end of stream when the debugger exits.
#[derive(Debug)]
pub struct PtyBridge {
    primary: OwnedFd,
    replica: OwnedFd,
}

impl PtyBridge {
    /// Allocates a pty pair with echo and canonical line editing disabled on
    /// the replica, so captured output never contains our own keystrokes.
    pub fn open() -> Result<Self> {
        let pair = openpty(None, None)?;

        let mut termios = tcgetattr(&pair.slave)?;
        termios
            .local_flags
            .remove(LocalFlags::ECHO | LocalFlags::ICANON);
        tcsetattr(&pair.slave, SetArg::TCSANOW, &termios)?;

        tracing::debug!("Allocated pseudo-terminal pair for debugger");

        Ok(Self {
            primary: pair.master,
            replica: pair.slave,
        })
    }

    /// A duplicate of the replica, suitable for a child's stdin or stdout.
    pub fn replica_stdio(&self) -> Result<Stdio> {
        Ok(Stdio::from(self.replica.try_clone()?))
    }

    /// Async handle on a duplicate of the primary descriptor.
    pub fn primary_file(&self) -> Result<tokio::fs::File> {
        let fd = self.primary.try_clone()?;
        Ok(tokio::fs::File::from_std(std::fs::File::from(fd)))
    }

    /// Closes the parent's replica and keeps only the primary. Call after
    /// the child holds its own copies of the replica.
    pub fn into_primary(self) -> OwnedFd {
        drop(self.replica);
        self.primary
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_open_disables_echo_and_canonical_mode() {
        let bridge = PtyBridge::open().expect("pty allocation should succeed");
        let termios = tcgetattr(&bridge.replica).expect("replica attributes should be readable");
        assert!(!termios.local_flags.contains(LocalFlags::ECHO));
        assert!(!termios.local_flags.contains(LocalFlags::ICANON));
    }

    #[test]
    fn test_child_output_arrives_on_primary() {
        let bridge = PtyBridge::open().expect("pty allocation should succeed");

        let mut child = std::process::Command::new("sh")
            .args(["-c", "printf bridged"])
            .stdin(bridge.replica_stdio().expect("replica dup"))
            .stdout(bridge.replica_stdio().expect("replica dup"))
            .spawn()
            .expect("should spawn test process");
        child.wait().expect("child should exit");

        let mut primary =
            std::fs::File::from(bridge.primary.try_clone().expect("primary dup"));
        let mut buf = [0_u8; 64];
        let n = primary.read(&mut buf).expect("primary should be readable");
        assert_eq!(&buf[..n], b"bridged");
    }

    #[test]
    fn test_primary_reports_end_of_stream_once_replica_is_released() {
        let bridge = PtyBridge::open().expect("pty allocation should succeed");

        let mut child = std::process::Command::new("sh")
            .args(["-c", "printf done"])
            .stdin(bridge.replica_stdio().expect("replica dup"))
            .stdout(bridge.replica_stdio().expect("replica dup"))
            .spawn()
            .expect("should spawn test process");
        let mut primary = std::fs::File::from(bridge.into_primary());
        child.wait().expect("child should exit");

        let mut output = Vec::new();
        let mut buf = [0_u8; 64];
        loop {
            match primary.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => output.extend_from_slice(&buf[..n]),
            }
        }
        assert_eq!(output, b"done");
    }
}
