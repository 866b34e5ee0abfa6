//! Operator console: cancel polling and optional mirroring of the modem
//! exchange.

use crate::io::{Clock, Transport};
use crate::session::Session;
use crate::{CANCEL_BYTE, Result};
use std::fmt::Display;
use tracing::{info, warn};

const HEADER: &str = "ISBD";

pub(crate) struct Console<C> {
    transport: C,
}

impl<C: Transport> Console<C> {
    pub(crate) fn new(transport: C) -> Self {
        Self { transport }
    }

    /// Drains pending console input, reporting whether the cancel byte was in
    /// it. Never blocks.
    pub(crate) fn poll_cancel(&mut self) -> Result<bool> {
        while let Some(byte) = self.transport.read_byte()? {
            if byte == CANCEL_BYTE {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn write(&mut self, text: &str) {
        if let Err(err) = self.transport.write_all(text.as_bytes()) {
            warn!("failed to write to console: {err}");
        }
    }
}

impl<M: Transport, C: Transport, K: Clock> Session<M, C, K> {
    /// Mirrors `message` onto the console when console printing is on.
    pub(crate) fn print_console(&mut self, message: impl Display) {
        if !self.config.console_print {
            return;
        }
        #[allow(clippy::cast_precision_loss)]
        let secs = self.clock.now_ms() as f64 / 1000.0;
        self.console.write(&format!("[{HEADER} {secs:.2}] {message}"));
    }

    #[must_use]
    pub fn console_print(&self) -> bool {
        self.config.console_print
    }

    pub fn set_console_print(&mut self, enabled: bool) {
        info!(enabled, "console print");
        if !enabled {
            self.print_console("Console OFF\n");
        }
        self.config.console_print = enabled;
        if enabled {
            self.print_console("Console ON\n");
        }
    }

    /// Checks the console once for the cancel byte.
    pub(crate) fn cancel_requested(&mut self) -> Result<bool> {
        let cancelled = self.console.poll_cancel()?;
        if cancelled {
            info!("cancelled from console");
            self.print_console("Canceled\n");
        }

        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::Fixture;

    #[test]
    fn cancel_byte_is_found_among_other_input() {
        let mut fx = Fixture::builder().build();
        fx.console.type_in(b"xyc");
        assert!(fx.session.cancel_requested().unwrap());
        assert!(!fx.session.cancel_requested().unwrap());
    }

    #[test]
    fn other_input_does_not_cancel() {
        let mut fx = Fixture::builder().build();
        fx.console.type_in(b"hello");
        assert!(!fx.session.cancel_requested().unwrap());
    }

    #[test]
    fn mirrors_only_when_enabled() {
        let mut fx = Fixture::builder().build();
        fx.session.print_console("silent\n");
        assert!(fx.console.output().is_empty());

        fx.session.set_console_print(true);
        fx.session.print_console("loud\n");
        let output = fx.console.output();
        assert!(output.contains("[ISBD 0.00] Console ON\n"), "{output}");
        assert!(output.ends_with("] loud\n"), "{output}");
    }
}
