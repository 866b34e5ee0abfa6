//! The mailbox check: `+SBDI` sessions with the satellite network.

use crate::at::OK;
use crate::io::{Clock, Transport, elapsed_ms};
use crate::session::{Session, State, duration_ms};
use crate::status::{MoBuffer, SessionReport};
use crate::{Buffer, Error, Result};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Deadline for a single `+SBDI` cycle to be acknowledged.
const CYCLE_TIMEOUT: Duration = Duration::from_secs(60);
const CLEAR_TIMEOUT: Duration = Duration::from_secs(60);
const CLEAR_SETTLE: Duration = Duration::from_millis(100);

impl<M: Transport, C: Transport, K: Clock> Session<M, C, K> {
    /// Runs `+SBDI` cycles until the MO buffer settles.
    ///
    /// After each cycle the console is checked for a cancel, then the overall
    /// transmission timeout, then whether the MO outcome is still transient.
    /// Cancelling powers the modem down. A message reported as sent is cleared
    /// from the MO buffer so the next session does not send it again.
    pub(crate) fn check_mailbox(&mut self) -> Result<()> {
        self.transition(State::CheckingMailbox);
        info!("connecting to satellites");
        self.print_console("Connecting to satellites ... (Press 'c' to cancel)\n");

        let timeout_ms = duration_ms(self.config.transmission_timeout);
        let start_ms = self.clock.now_ms();
        let mut cycles = 0u32;
        loop {
            cycles += 1;
            self.send("AT+SBDI\r")?;
            let reply = self.await_response(CYCLE_TIMEOUT, OK)?;
            if !reply.matched {
                let elapsed_ms = elapsed_ms(&self.clock, start_ms);
                warn!(cycles, elapsed_ms, "mailbox check went unanswered");
                return Err(Error::SendReceiveTimeout { elapsed_ms });
            }
            let report = SessionReport::parse(&reply.text);
            self.mailbox.apply_session(&report);
            debug!(cycles, ?report, "mailbox check cycle");

            if self.cancel_requested()? {
                self.mailbox.reset_mt();
                if let Err(err) = self.disable() {
                    warn!("failed to power down after cancel: {err}");
                }
                return Err(Error::Cancelled);
            }
            let elapsed_ms = elapsed_ms(&self.clock, start_ms);
            if elapsed_ms > timeout_ms {
                warn!(cycles, elapsed_ms, "mailbox check timed out");
                self.print_console("Timeout\n");
                return Err(Error::SendReceiveTimeout { elapsed_ms });
            }
            if self.mailbox.mo != MoBuffer::Transient {
                break;
            }
        }

        info!(cycles, mailbox = ?self.mailbox, "mailbox check done");
        self.print_console("Success\n");
        if self.mailbox.mo == MoBuffer::Occupied {
            self.clear_mo_buffer()?;
            self.clock.delay(CLEAR_SETTLE);
        }

        Ok(())
    }

    pub(crate) fn clear_mo_buffer(&mut self) -> Result<()> {
        self.clear_buffer(Buffer::MobileOriginated)
    }

    pub(crate) fn clear_mt_buffer(&mut self) -> Result<()> {
        self.clear_buffer(Buffer::MobileTerminated)
    }

    fn clear_buffer(&mut self, buffer: Buffer) -> Result<()> {
        let command = match buffer {
            Buffer::MobileOriginated => "AT+SBDD0\r",
            Buffer::MobileTerminated => "AT+SBDD1\r",
        };
        self.send(command)?;
        if !self.await_response(CLEAR_TIMEOUT, OK)?.matched {
            warn!(%buffer, "buffer clear not acknowledged");
            return Err(Error::ClearModemBuffer(buffer));
        }
        debug!(%buffer, "buffer cleared");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::MtBuffer;
    use crate::test_utils::Fixture;
    use test_log::test;

    const TRANSIENT: &str = "\r\n+SBDI: 2, 10, 0, 0, 0, 0\r\n\r\nOK\r\n";
    const SENT: &str = "\r\n+SBDI: 1, 11, 0, 0, 0, 0\r\n\r\nOK\r\n";

    #[test]
    fn loops_while_mo_is_transient() {
        for transient in 0..4 {
            let mut fx = Fixture::builder().build();
            let mut replies = vec![TRANSIENT; transient];
            replies.push(SENT);
            fx.modem
                .reply_sequence("AT+SBDI", replies)
                .reply("AT+SBDD0", "\r\n0\r\n\r\nOK\r\n");

            fx.session.check_mailbox().unwrap();

            assert_eq!(fx.modem.count("AT+SBDI"), transient + 1);
            assert_eq!(fx.modem.count("AT+SBDD0"), 1);
        }
    }

    #[test]
    fn empty_mo_is_not_cleared() {
        let mut fx = Fixture::builder().build();
        fx.modem
            .reply("AT+SBDI", "\r\n+SBDI: 0, 11, 1, 5, 12, 0\r\n\r\nOK\r\n");

        fx.session.check_mailbox().unwrap();

        assert_eq!(fx.modem.count("AT+SBDD0"), 0);
        assert_eq!(fx.session.mailbox().mt, MtBuffer::Occupied);
        assert_eq!(fx.session.mailbox().mt_length, 12);
    }

    #[test]
    fn cancel_resets_inbound_state() {
        let mut fx = Fixture::builder().build();
        fx.modem
            .reply("AT+SBDI", "\r\n+SBDI: 2, 11, 1, 5, 12, 4\r\n\r\nOK\r\n");
        fx.console.type_in(b"c");

        let err = fx.session.check_mailbox().unwrap_err();

        assert!(matches!(err, Error::Cancelled), "{err}");
        assert_eq!(fx.modem.count("AT+SBDI"), 1);
        let mailbox = fx.session.mailbox();
        assert_eq!(mailbox.mt, MtBuffer::Empty);
        assert_eq!(mailbox.mt_length, 0);
        assert_eq!(mailbox.mt_queued, 0);
    }

    #[test]
    fn gives_up_after_transmission_timeout() {
        let mut fx = Fixture::builder().build();
        fx.session.set_transmission_timeout(Duration::from_secs(30));
        fx.modem.reply("AT+SBDI", TRANSIENT);
        fx.modem.reply_delay("AT+SBDI", Duration::from_secs(10));

        let err = fx.session.check_mailbox().unwrap_err();

        assert!(matches!(err, Error::SendReceiveTimeout { .. }), "{err}");
        assert_eq!(err.code(), 5);
        // Cycles finish at 10s, 20s, 30s and 40s; only the last is past 30s.
        assert_eq!(fx.modem.count("AT+SBDI"), 4);
    }

    #[test]
    fn unanswered_cycle_fails() {
        let mut fx = Fixture::builder().build();

        let err = fx.session.check_mailbox().unwrap_err();

        assert!(matches!(err, Error::SendReceiveTimeout { .. }), "{err}");
        assert_eq!(fx.modem.count("AT+SBDI"), 1);
    }

    #[test]
    fn unacknowledged_clear_is_reported() {
        let mut fx = Fixture::builder().build();
        fx.modem.reply("AT+SBDI", SENT);

        let err = fx.session.check_mailbox().unwrap_err();

        assert!(
            matches!(err, Error::ClearModemBuffer(Buffer::MobileOriginated)),
            "{err}"
        );
        assert_eq!(err.code(), 9);
    }
}
