//! Power sequencing over the power-enable and sleep lines.

use crate::at::OK;
use crate::io::{Clock, Transport, elapsed_ms};
use crate::session::{Session, State, duration_ms};
use crate::{Error, Result};
use std::time::Duration;
use tracing::{debug, info, warn};

const POWER_SETTLE: Duration = Duration::from_secs(1);
const WAKE_SETTLE: Duration = Duration::from_secs(1);
const ATTENTION_TIMEOUT: Duration = Duration::from_secs(10);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(20);
/// Lets the modem turn its serial port off before power is cut.
const SHUTDOWN_SETTLE: Duration = Duration::from_millis(100);
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

impl<M: Transport, C: Transport, K: Clock> Session<M, C, K> {
    /// Drives the power-enable line high. No-op without a power line.
    pub fn enable_power(&mut self) -> Result<()> {
        if let Some(line) = self.power_line.as_mut() {
            line.set(true)?;
        }

        Ok(())
    }

    /// Drives the power-enable line low. No-op without a power line.
    pub fn disable_power(&mut self) -> Result<()> {
        if let Some(line) = self.power_line.as_mut() {
            line.set(false)?;
        }

        Ok(())
    }

    /// The sleep line is active low: high keeps the modem awake.
    fn set_awake(&mut self, awake: bool) -> Result<()> {
        if let Some(line) = self.sleep_line.as_mut() {
            line.set(awake)?;
        }

        Ok(())
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Powers the modem up, retrying once after the configured retry wait.
    ///
    /// During the wait the console is polled for the cancel byte; cancelling
    /// cuts power again. Does nothing if the modem is already enabled.
    pub fn enable(&mut self) -> Result<()> {
        if self.enabled {
            return Ok(());
        }
        info!("enabling modem");
        self.print_console("Enable modem\n");

        if !self.power_up()? {
            let retry_wait = self.config.power_up_retry_wait;
            warn!(?retry_wait, "modem unavailable, retrying");
            self.print_console(format_args!(
                "Modem unavailable. Trying again in {}sec. (Press 'c' to cancel)\n",
                retry_wait.as_secs()
            ));

            let wait_ms = duration_ms(retry_wait);
            let start_ms = self.clock.now_ms();
            loop {
                if self.cancel_requested()? {
                    self.cut_power()?;
                    return Err(Error::Cancelled);
                }
                let waited_ms = elapsed_ms(&self.clock, start_ms);
                if waited_ms >= wait_ms {
                    break;
                }
                self.clock
                    .delay(CANCEL_POLL_INTERVAL.min(Duration::from_millis(wait_ms - waited_ms)));
            }

            if !self.power_up()? {
                self.cut_power()?;
                return Err(Error::NoModemDetected);
            }
        }

        self.enabled = true;
        self.transition(State::Enabled);
        info!("modem enabled");

        Ok(())
    }

    /// Powers the modem down. Does nothing if it is not enabled.
    pub fn disable(&mut self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        info!("disabling modem");
        self.print_console("Disable modem\n");
        self.power_down()?;
        self.enabled = false;

        Ok(())
    }

    /// Runs the power-up sequence, `Ok(false)` if the modem never acknowledged
    /// the attention command.
    pub(crate) fn power_up(&mut self) -> Result<bool> {
        self.transition(State::PoweringUp);
        self.print_console("Power up\n");
        self.enable_power()?;
        self.clock.delay(POWER_SETTLE);
        self.set_awake(true)?;
        self.clock.delay(WAKE_SETTLE);

        self.send("AT\r")?;
        if !self.await_response(ATTENTION_TIMEOUT, OK)?.matched {
            warn!("modem did not answer attention command");
            return Ok(false);
        }
        self.send("ATZ0\r")?;
        self.send("ATE0\r")?;
        // 3-wire mode, no RTS/CTS.
        self.send("AT&K0\r")?;
        if !self.await_response(ATTENTION_TIMEOUT, OK)?.matched {
            warn!("modem did not acknowledge initialization");
            return Ok(false);
        }
        debug!("modem powered up");

        Ok(true)
    }

    pub(crate) fn power_down(&mut self) -> Result<()> {
        self.transition(State::PoweringDown);
        self.print_console("Power down\n");
        // Flushes pending EEPROM writes; power goes down regardless.
        let flushed = self
            .send("AT*F\r")
            .and_then(|()| self.await_response(FLUSH_TIMEOUT, OK));
        match &flushed {
            Ok(reply) if !reply.matched => {
                warn!("modem did not acknowledge flush before power down");
            }
            Ok(_) => {}
            Err(err) => warn!("flush before power down failed: {err}"),
        }

        let cut = self.cut_power();
        flushed?;
        cut
    }

    /// Puts the modem to sleep and removes power, without talking to it.
    ///
    /// Both lines are driven even if the first one fails, the first error is
    /// returned.
    fn cut_power(&mut self) -> Result<()> {
        let asleep = self.set_awake(false);
        self.clock.delay(SHUTDOWN_SETTLE);
        let unpowered = self.disable_power();
        self.enabled = false;
        self.transition(State::Disabled);

        asleep.and(unpowered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::OutputLine;
    use crate::test_utils::Fixture;
    use mockall::{mock, predicate::eq};
    use test_log::test;

    mock! {
        pub Line {}
        impl OutputLine for Line {
            fn set(&mut self, high: bool) -> std::io::Result<()>;
        }
    }

    fn expect_single(line: &mut MockLine, high: bool) {
        line.expect_set()
            .with(eq(high))
            .times(1)
            .returning(|_| Ok(()));
    }

    #[test]
    fn enable_twice_powers_up_once() {
        let mut power = MockLine::new();
        let mut sleep = MockLine::new();
        // Once for enable, once for the power down on drop.
        expect_single(&mut power, true);
        expect_single(&mut power, false);
        expect_single(&mut sleep, true);
        expect_single(&mut sleep, false);

        let mut fx = Fixture::builder()
            .power_line(Box::new(power))
            .sleep_line(Box::new(sleep))
            .build();
        fx.session.enable().unwrap();
        fx.session.enable().unwrap();

        assert!(fx.session.is_enabled());
        assert_eq!(fx.modem.count("AT"), 1);
    }

    #[test]
    fn disable_when_never_enabled_is_a_no_op() {
        let mut power = MockLine::new();
        let mut sleep = MockLine::new();
        power.expect_set().never();
        sleep.expect_set().never();

        let mut fx = Fixture::builder()
            .power_line(Box::new(power))
            .sleep_line(Box::new(sleep))
            .build();
        fx.session.disable().unwrap();

        assert!(fx.modem.commands().is_empty());
        assert_eq!(fx.session.state(), State::Disabled);
    }

    #[test]
    fn power_up_sequence_orders_lines_and_commands() {
        let mut fx = Fixture::builder().build();
        fx.session.enable().unwrap();

        assert_eq!(
            fx.lines.transitions(),
            vec![("power", true), ("sleep", true)]
        );
        assert_eq!(fx.modem.commands(), vec!["AT", "ATZ0", "ATE0", "AT&K0"]);
        assert_eq!(fx.session.state(), State::Enabled);

        fx.session.disable().unwrap();
        assert_eq!(
            fx.lines.transitions(),
            vec![
                ("power", true),
                ("sleep", true),
                ("sleep", false),
                ("power", false)
            ]
        );
        assert_eq!(fx.modem.commands().last().map(String::as_str), Some("AT*F"));
        assert_eq!(fx.session.state(), State::Disabled);
    }

    #[test]
    fn power_down_cuts_lines_when_transport_fails() {
        let mut fx = Fixture::builder().build();
        fx.session.enable().unwrap();
        fx.modem.fail_writes();

        let err = fx.session.disable().unwrap_err();

        assert!(matches!(err, Error::Io(_)), "{err}");
        assert!(!fx.session.is_enabled());
        assert_eq!(fx.session.state(), State::Disabled);
        assert_eq!(
            fx.lines.transitions()[2..],
            [("sleep", false), ("power", false)]
        );
    }

    #[test]
    fn drop_cuts_lines_when_transport_fails() {
        let Fixture {
            mut session,
            modem,
            lines,
            ..
        } = Fixture::builder().build();
        session.enable().unwrap();
        modem.fail_writes();

        drop(session);

        assert_eq!(
            lines.transitions(),
            vec![
                ("power", true),
                ("sleep", true),
                ("sleep", false),
                ("power", false)
            ]
        );
    }

    #[test]
    fn retries_once_after_the_configured_wait() {
        let mut fx = Fixture::builder().responsive(false).build();
        fx.session.set_power_up_retry_wait(Duration::from_secs(5));
        // First attention goes unanswered, the retry is acknowledged.
        fx.modem.reply_sequence("AT", ["", "\r\nOK\r\n"]);
        fx.modem.reply("AT&K0", "\r\nOK\r\n");
        let start = fx.clock.now_ms();

        fx.session.enable().unwrap();

        assert_eq!(fx.modem.count("AT"), 2);
        let waited = fx.clock.now_ms() - start;
        assert!(waited >= 5_000 + 10_000, "waited {waited}ms");
    }

    #[test]
    fn gives_up_after_second_power_up_failure() {
        let mut fx = Fixture::builder().responsive(false).build();
        fx.session.set_power_up_retry_wait(Duration::from_secs(1));

        let err = fx.session.enable().unwrap_err();

        assert!(matches!(err, Error::NoModemDetected), "{err}");
        assert_eq!(err.code(), 3);
        assert!(!fx.session.is_enabled());
        assert_eq!(fx.lines.transitions().last(), Some(&("power", false)));
    }

    #[test]
    fn cancel_during_retry_wait_cuts_power() {
        let mut fx = Fixture::builder().responsive(false).build();
        fx.console.type_in(b"c");

        let err = fx.session.enable().unwrap_err();

        assert!(matches!(err, Error::Cancelled), "{err}");
        assert_eq!(fx.modem.count("AT"), 1);
        assert_eq!(
            fx.lines.transitions()[2..],
            [("sleep", false), ("power", false)]
        );
        assert_eq!(fx.session.state(), State::Disabled);
    }
}
