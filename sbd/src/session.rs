use crate::at::{OK, strip_envelope};
use crate::config::Config;
use crate::console::Console;
use crate::io::{Clock, OutputLine, Transport, elapsed_ms};
use crate::status::{MailboxState, MoBuffer, MtBuffer};
use crate::{Error, MAX_RX_BINARY_LEN, MAX_RX_TEXT_LEN, Result};
use bon::bon;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const NETWORK_EVENT_TIMEOUT: Duration = Duration::from_secs(10);
const NETWORK_QUERY_SETTLE: Duration = Duration::from_millis(200);
const NETWORK_SERVICE_EVENT: &str = "+CIEV:1,1\r\n";

/// Where the session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum State {
    Disabled,
    PoweringUp,
    Enabled,
    Sending,
    CheckingMailbox,
    Retrieving,
    PoweringDown,
}

/// Identification strings reported by the modem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModemInfo {
    pub imei: String,
    pub manufacturer: String,
    pub model: String,
}

/// A single SBD modem attachment.
///
/// The session owns both transports, the power lines and the mailbox state.
/// Every operation takes `&mut self`: there is exactly one command/response
/// exchange in flight at any time. Dropping the session powers the modem down.
pub struct Session<M: Transport, C: Transport, K: Clock> {
    pub(crate) modem: M,
    pub(crate) console: Console<C>,
    pub(crate) clock: K,
    pub(crate) power_line: Option<Box<dyn OutputLine>>,
    pub(crate) sleep_line: Option<Box<dyn OutputLine>>,
    pub(crate) config: Config,
    pub(crate) mailbox: MailboxState,
    pub(crate) enabled: bool,
    pub(crate) state: State,
}

#[bon]
impl<M: Transport, C: Transport, K: Clock> Session<M, C, K> {
    /// A missing `power_line` or `sleep_line` turns the matching power
    /// sequencing step into a no-op.
    #[builder]
    pub fn new(
        modem: M,
        console: C,
        clock: K,
        power_line: Option<Box<dyn OutputLine>>,
        sleep_line: Option<Box<dyn OutputLine>>,
        #[builder(default)] config: Config,
    ) -> Self {
        Self {
            modem,
            console: Console::new(console),
            clock,
            power_line,
            sleep_line,
            config,
            mailbox: MailboxState::default(),
            enabled: false,
            state: State::Disabled,
        }
    }
}

impl<M: Transport, C: Transport, K: Clock> Session<M, C, K> {
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    #[must_use]
    pub fn mailbox(&self) -> &MailboxState {
        &self.mailbox
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn set_power_up_retry_wait(&mut self, wait: Duration) {
        self.config.power_up_retry_wait = wait;
    }

    pub fn set_transmission_timeout(&mut self, timeout: Duration) {
        self.config.transmission_timeout = timeout;
    }

    pub fn set_network_check_timeout(&mut self, timeout: Duration) {
        self.config.network_check_timeout = timeout;
    }

    pub(crate) fn transition(&mut self, to: State) {
        if self.state != to {
            debug!(from = ?self.state, ?to, "session state");
            self.state = to;
        }
    }

    /// Sends a text message and checks the mailbox once.
    ///
    /// Text longer than [`MAX_TX_TEXT_LEN`](crate::MAX_TX_TEXT_LEN) bytes is
    /// truncated. Carriage returns are dropped from the message.
    pub fn send_text(&mut self, message: &str) -> Result<()> {
        info!(len = message.len(), "sending text message");
        self.print_console("SENDING TXT MSG\n");
        if message.is_empty() {
            return Err(Error::MessageSize);
        }
        let result = self.prepare_upload().and_then(|()| {
            if !self.frame_text(message)? {
                return Err(Error::UploadToModem);
            }
            self.check_mailbox()
        });
        self.settle_enabled();
        result
    }

    /// Sends a text message, then keeps checking the mailbox until the network
    /// reports no further queued inbound messages. Returns the most recent
    /// inbound message, if any.
    pub fn send_receive_text(&mut self, message: &str) -> Result<Option<String>> {
        info!(len = message.len(), "sending text message, receiving");
        self.print_console("SENDING/RECEIVING TXT MSG\n");
        if message.is_empty() {
            return Err(Error::MessageSize);
        }
        let inbound = self.exchange(
            |session| session.frame_text(message),
            MAX_RX_TEXT_LEN,
        )?;

        Ok(inbound.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Sends a binary message and checks the mailbox once.
    ///
    /// Payloads longer than [`MAX_TX_BINARY_LEN`](crate::MAX_TX_BINARY_LEN)
    /// bytes are truncated.
    pub fn send_binary(&mut self, payload: &[u8]) -> Result<()> {
        info!(len = payload.len(), "sending binary message");
        self.print_console("SENDING BINARY MSG\n");
        if payload.is_empty() {
            return Err(Error::MessageSize);
        }
        let result = self.prepare_upload().and_then(|()| {
            self.upload_binary(payload)?;
            self.check_mailbox()
        });
        self.settle_enabled();
        result
    }

    /// Binary counterpart of [`Session::send_receive_text`].
    pub fn send_receive_binary(&mut self, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        info!(len = payload.len(), "sending binary message, receiving");
        self.print_console("SENDING/RECEIVING BINARY MSG\n");
        if payload.is_empty() {
            return Err(Error::MessageSize);
        }
        self.exchange(
            |session| session.upload_binary(payload).map(|()| true),
            MAX_RX_BINARY_LEN,
        )
    }

    /// Waits for the modem to report network service, up to the configured
    /// network check timeout.
    pub fn network_status(&mut self) -> Result<bool> {
        info!("checking network service");
        self.print_console("CHECKING NETWORK SERVICE\n");
        self.enable()?;
        self.flush_input()?;

        let timeout_ms = duration_ms(self.config.network_check_timeout);
        let start_ms = self.clock.now_ms();
        loop {
            self.send("AT+CIER=1,0,1\r")?;
            self.clock.delay(NETWORK_QUERY_SETTLE);
            let reply =
                self.await_response(NETWORK_EVENT_TIMEOUT, NETWORK_SERVICE_EVENT)?;
            if reply.matched {
                info!("network service available");
                return Ok(true);
            }
            if elapsed_ms(&self.clock, start_ms) >= timeout_ms {
                warn!(timeout_ms, "no network service");
                self.print_console("Timeout\n");
                return Ok(false);
            }
        }
    }

    pub fn imei(&mut self) -> Result<String> {
        self.query("AT+CGSN\r")
    }

    pub fn manufacturer(&mut self) -> Result<String> {
        self.query("AT+CGMI\r")
    }

    pub fn model(&mut self) -> Result<String> {
        self.query("AT+CGMM\r")
    }

    pub fn info(&mut self) -> Result<ModemInfo> {
        Ok(ModemInfo {
            imei: self.imei()?,
            manufacturer: self.manufacturer()?,
            model: self.model()?,
        })
    }

    fn query(&mut self, command: &'static str) -> Result<String> {
        self.enable()?;
        self.flush_input()?;
        self.send(command)?;
        let reply = self.await_response(QUERY_TIMEOUT, OK)?;
        if !reply.matched {
            return Err(Error::NoResponse {
                command: command.trim_end(),
            });
        }

        Ok(strip_envelope(&reply.text).to_owned())
    }

    /// Powers the modem up if needed, drops stale input and makes sure no
    /// superseded outbound message is left in the MO buffer.
    fn prepare_upload(&mut self) -> Result<()> {
        self.enable()?;
        self.flush_input()?;
        self.transition(State::Sending);
        if !self.refresh_status()? {
            return Err(Error::GetStatus);
        }
        if self.mailbox.mo != MoBuffer::Empty {
            debug!(mo = ?self.mailbox.mo, "discarding superseded outbound message");
            self.clear_mo_buffer()?;
            if !self.refresh_status()? {
                return Err(Error::GetStatus);
            }
        }

        Ok(())
    }

    fn upload_binary(&mut self, payload: &[u8]) -> Result<()> {
        if !self.frame_binary(payload)? {
            return Err(Error::UploadToModem);
        }
        if self.mailbox.mo != MoBuffer::Occupied {
            warn!(mo = ?self.mailbox.mo, "binary upload did not reach the MO buffer");
            return Err(Error::UploadToModem);
        }

        Ok(())
    }

    fn exchange(
        &mut self,
        upload: impl FnOnce(&mut Self) -> Result<bool>,
        max_inbound_len: usize,
    ) -> Result<Option<Vec<u8>>> {
        self.mailbox.reset_mt();
        let result = self.prepare_upload().and_then(|()| {
            if !upload(self)? {
                return Err(Error::UploadToModem);
            }
            // Only the latest inbound message survives in the MT buffer.
            loop {
                self.check_mailbox()?;
                if self.mailbox.mt_queued == 0 {
                    break;
                }
                debug!(queued = self.mailbox.mt_queued, "more inbound messages queued");
            }
            if self.mailbox.mt != MtBuffer::Occupied {
                return Ok(None);
            }
            self.retrieve(max_inbound_len).map(Some)
        });
        self.settle_enabled();
        result
    }

    /// Drops whatever the modem sent that nobody waited for.
    pub(crate) fn flush_input(&mut self) -> Result<()> {
        let mut dropped = 0usize;
        while self.modem.read_byte()?.is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "flushed modem input");
        }

        Ok(())
    }

    fn settle_enabled(&mut self) {
        if self.enabled {
            self.transition(State::Enabled);
        }
    }
}

impl<M: Transport, C: Transport, K: Clock> Drop for Session<M, C, K> {
    fn drop(&mut self) {
        if let Err(err) = self.disable() {
            error!("failed to power down modem: {err}");
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
pub(crate) fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
