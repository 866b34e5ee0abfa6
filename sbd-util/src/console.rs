//! Operator console over the process' stdin and stdout.

use orb_sbd::Transport;
use std::io::{self, Read as _, Write as _};
use std::thread;
use tracing::debug;

/// Stdin is read on a background thread so the session can poll it without
/// blocking. Typing `c` (then enter) cancels a pending wait.
pub struct StdioConsole {
    input: flume::Receiver<u8>,
}

impl StdioConsole {
    pub fn spawn() -> io::Result<Self> {
        let (tx, input) = flume::unbounded();
        thread::Builder::new()
            .name("sbd-console".to_owned())
            .spawn(move || {
                for byte in io::stdin().lock().bytes() {
                    let Ok(byte) = byte else { break };
                    if tx.send(byte).is_err() {
                        break;
                    }
                }
                debug!("console input closed");
            })?;

        Ok(Self { input })
    }
}

impl Transport for StdioConsole {
    fn available(&mut self) -> io::Result<usize> {
        Ok(self.input.len())
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        match self.input.try_recv() {
            Ok(byte) => Ok(Some(byte)),
            Err(flume::TryRecvError::Empty | flume::TryRecvError::Disconnected) => Ok(None),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(bytes)?;
        stdout.flush()
    }
}
