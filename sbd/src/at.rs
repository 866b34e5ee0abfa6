//! AT command/response exchange, the primitive every modem operation is
//! built on.

use crate::io::{Clock, Transport, elapsed_ms};
use crate::session::{Session, duration_ms};
use crate::Result;
use std::time::Duration;
use tracing::{debug, trace, warn};

pub(crate) const OK: &str = "OK\r\n";

/// How long to back off when the transport has nothing to read.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Everything the modem sent while waiting for a terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reply {
    pub matched: bool,
    pub text: String,
}

impl<M: Transport, C: Transport, K: Clock> Session<M, C, K> {
    /// Writes `command` as is, the caller provides the trailing `\r`.
    pub(crate) fn send(&mut self, command: &str) -> Result<()> {
        debug!(command = ?command, "to modem");
        self.print_console(format_args!("To modem: {}\n", command.escape_debug()));
        self.modem.write_all(command.as_bytes())?;

        Ok(())
    }

    pub(crate) fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        trace!(len = bytes.len(), "raw bytes to modem");
        self.modem.write_all(bytes)?;

        Ok(())
    }

    /// Accumulates modem output until it ends with `terminator` or `timeout`
    /// elapses. The accumulated text is returned either way so partial
    /// responses stay inspectable.
    pub(crate) fn await_response(
        &mut self,
        timeout: Duration,
        terminator: &str,
    ) -> Result<Reply> {
        let timeout_ms = duration_ms(timeout);
        let start_ms = self.clock.now_ms();
        let mut text = String::new();
        let matched = loop {
            if text.ends_with(terminator) {
                break true;
            }
            let received = self.modem.read_byte()?;
            if let Some(byte) = received {
                text.push(char::from(byte));
            }
            if elapsed_ms(&self.clock, start_ms) >= timeout_ms {
                break text.ends_with(terminator);
            }
            if received.is_none() {
                self.clock.delay(POLL_INTERVAL);
            }
        };

        if matched {
            debug!(response = ?text, "from modem");
        } else {
            warn!(
                response = ?text,
                terminator = ?terminator,
                timeout_ms,
                "modem response timed out"
            );
        }
        self.print_console(format_args!("From modem: {}\n", text.escape_debug()));

        Ok(Reply { matched, text })
    }

    /// Waits until at least `count` bytes are pending on the modem transport.
    pub(crate) fn await_bytes(&mut self, count: usize, timeout: Duration) -> Result<bool> {
        let timeout_ms = duration_ms(timeout);
        let start_ms = self.clock.now_ms();
        loop {
            if self.modem.available()? >= count {
                return Ok(true);
            }
            if elapsed_ms(&self.clock, start_ms) >= timeout_ms {
                warn!(count, timeout_ms, "timed out waiting for modem bytes");
                return Ok(false);
            }
            self.clock.delay(POLL_INTERVAL);
        }
    }
}

/// Strips the `\r\n<value>\r\nOK\r\n` envelope of an identification query.
pub(crate) fn strip_envelope(response: &str) -> &str {
    let value = response.trim_start_matches(['\r', '\n']);
    match value.find('\r') {
        Some(end) => &value[..end],
        None => value,
    }
}
