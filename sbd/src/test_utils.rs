//! Deterministic fakes for exercising a [`Session`] without hardware.
//!
//! [`FakeModem`] answers scripted replies to the AT commands it receives,
//! [`FakeClock`] only moves when the session delays, and [`RecordingLine`]
//! logs every power/sleep line transition.

use crate::config::Config;
use crate::io::{Clock, OutputLine, Transport};
use crate::session::Session;
use bon::bon;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::rc::Rc;
use std::time::Duration;

/// Clock that advances only through [`Clock::delay`] and [`FakeClock::advance`].
#[derive(Debug, Clone, Default)]
pub struct FakeClock {
    now_ms: Rc<Cell<u64>>,
}

impl FakeClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.delay(duration);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.get()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn delay(&self, duration: Duration) {
        self.now_ms.set(self.now_ms.get() + duration.as_millis() as u64);
    }
}

#[derive(Debug, Default)]
struct Script {
    replies: VecDeque<Vec<u8>>,
    delay: Duration,
}

#[derive(Debug, Default)]
struct ModemState {
    /// Bytes for the session to read, each with the time it shows up.
    rx: VecDeque<(u64, u8)>,
    line: Vec<u8>,
    commands: Vec<String>,
    scripts: HashMap<String, Script>,
    /// Raw bytes still expected after `AT+SBDWB=<n>`.
    upload_remaining: usize,
    upload: Vec<u8>,
    uploads: Vec<Vec<u8>>,
    unplugged: bool,
}

/// Scripted modem end of the serial link.
///
/// Commands are recognized when their `\r` arrives. A reply is looked up by the
/// full command line first, then by the part before `=`. Each script hands out
/// its replies in order and keeps repeating the last one. After
/// `AT+SBDWB=<n>` the next `n + 2` bytes are taken as the binary upload and the
/// `AT+SBDWB` reply is only sent once they are all in.
#[derive(Debug, Clone)]
pub struct FakeModem {
    state: Rc<RefCell<ModemState>>,
    clock: FakeClock,
}

impl FakeModem {
    #[must_use]
    pub fn new(clock: FakeClock) -> Self {
        Self {
            state: Rc::default(),
            clock,
        }
    }

    /// Appends `reply` to the replies for `command`.
    pub fn reply(&self, command: &str, reply: &str) -> &Self {
        self.reply_bytes(command, reply.as_bytes().to_vec())
    }

    pub fn reply_bytes(&self, command: &str, reply: Vec<u8>) -> &Self {
        self.state
            .borrow_mut()
            .scripts
            .entry(command.to_owned())
            .or_default()
            .replies
            .push_back(reply);
        self
    }

    pub fn reply_sequence<'a>(
        &self,
        command: &str,
        replies: impl IntoIterator<Item = &'a str>,
    ) -> &Self {
        for reply in replies {
            self.reply(command, reply);
        }
        self
    }

    /// Replies to `command` only show up after `delay` on the fake clock.
    pub fn reply_delay(&self, command: &str, delay: Duration) -> &Self {
        self.state
            .borrow_mut()
            .scripts
            .entry(command.to_owned())
            .or_default()
            .delay = delay;
        self
    }

    /// Makes `bytes` readable right away, unsolicited.
    pub fn push_rx(&self, bytes: &[u8]) {
        let now = self.clock.now_ms();
        self.state
            .borrow_mut()
            .rx
            .extend(bytes.iter().map(|&byte| (now, byte)));
    }

    /// Every following write fails, as if the serial link was unplugged.
    pub fn fail_writes(&self) {
        self.state.borrow_mut().unplugged = true;
    }

    /// Bytes queued for the session, including ones not due yet.
    #[must_use]
    pub fn pending_rx(&self) -> usize {
        self.state.borrow().rx.len()
    }

    /// Every command line received so far, without the trailing `\r`.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.state.borrow().commands.clone()
    }

    #[must_use]
    pub fn count(&self, command: &str) -> usize {
        self.state
            .borrow()
            .commands
            .iter()
            .filter(|received| *received == command)
            .count()
    }

    /// Binary uploads, payload and checksum bytes included.
    #[must_use]
    pub fn uploads(&self) -> Vec<Vec<u8>> {
        self.state.borrow().uploads.clone()
    }

    fn receive(&self, byte: u8) {
        let mut state = self.state.borrow_mut();
        if state.upload_remaining > 0 {
            state.upload.push(byte);
            state.upload_remaining -= 1;
            if state.upload_remaining == 0 {
                let upload = std::mem::take(&mut state.upload);
                state.uploads.push(upload);
                drop(state);
                self.answer("AT+SBDWB");
            }
            return;
        }
        if byte != b'\r' {
            state.line.push(byte);
            return;
        }
        let line = std::mem::take(&mut state.line);
        let command = String::from_utf8_lossy(&line).into_owned();
        state.commands.push(command.clone());
        drop(state);

        if let Some(len) = command.strip_prefix("AT+SBDWB=") {
            let len: usize = len.parse().unwrap_or(0);
            self.state.borrow_mut().upload_remaining = len + 2;
            return;
        }
        self.answer(&command);
    }

    fn answer(&self, command: &str) {
        let mut state = self.state.borrow_mut();
        let key = if state.scripts.contains_key(command) {
            command
        } else {
            command.split('=').next().unwrap_or(command)
        };
        let Some(script) = state.scripts.get_mut(key) else {
            return;
        };
        let reply = if script.replies.len() > 1 {
            script.replies.pop_front()
        } else {
            script.replies.front().cloned()
        };
        let Some(reply) = reply else {
            return;
        };
        let due = self.clock.now_ms() + crate::session::duration_ms(script.delay);
        state.rx.extend(reply.into_iter().map(|byte| (due, byte)));
    }
}

impl Transport for FakeModem {
    fn available(&mut self) -> io::Result<usize> {
        let now = self.clock.now_ms();
        Ok(self
            .state
            .borrow()
            .rx
            .iter()
            .take_while(|(due, _)| *due <= now)
            .count())
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let now = self.clock.now_ms();
        let mut state = self.state.borrow_mut();
        let due = matches!(state.rx.front(), Some((due, _)) if *due <= now);
        if !due {
            return Ok(None);
        }

        Ok(state.rx.pop_front().map(|(_, byte)| byte))
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.state.borrow().unplugged {
            return Err(io::Error::other("serial unplugged"));
        }
        for &byte in bytes {
            self.receive(byte);
        }

        Ok(())
    }
}

/// Console with keyboard input typed in by the test.
#[derive(Debug, Clone, Default)]
pub struct FakeConsole {
    input: Rc<RefCell<VecDeque<u8>>>,
    output: Rc<RefCell<Vec<u8>>>,
}

impl FakeConsole {
    pub fn type_in(&self, bytes: &[u8]) {
        self.input.borrow_mut().extend(bytes);
    }

    #[must_use]
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.output.borrow()).into_owned()
    }
}

impl Transport for FakeConsole {
    fn available(&mut self) -> io::Result<usize> {
        Ok(self.input.borrow().len())
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        Ok(self.input.borrow_mut().pop_front())
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.output.borrow_mut().extend_from_slice(bytes);
        Ok(())
    }
}

/// Shared log of line transitions, in the order they happened.
#[derive(Debug, Clone, Default)]
pub struct LineLog(Rc<RefCell<Vec<(&'static str, bool)>>>);

impl LineLog {
    #[must_use]
    pub fn transitions(&self) -> Vec<(&'static str, bool)> {
        self.0.borrow().clone()
    }

    #[must_use]
    pub fn line(&self, name: &'static str) -> RecordingLine {
        RecordingLine {
            name,
            log: self.clone(),
        }
    }
}

#[derive(Debug)]
pub struct RecordingLine {
    name: &'static str,
    log: LineLog,
}

impl OutputLine for RecordingLine {
    fn set(&mut self, high: bool) -> io::Result<()> {
        self.log.0.borrow_mut().push((self.name, high));
        Ok(())
    }
}

/// A `+SBDRB` response: length, payload, `checksum` and the final `OK`.
#[must_use]
pub fn sbdrb_frame(payload: &[u8], checksum: u16) -> Vec<u8> {
    let len = u16::try_from(payload.len()).unwrap_or(u16::MAX);
    let mut frame = len.to_be_bytes().to_vec();
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&checksum.to_be_bytes());
    frame.extend_from_slice(b"\r\nOK\r\n");
    frame
}

pub type FakeSession = Session<FakeModem, FakeConsole, FakeClock>;

/// A session wired to fakes. By default the modem acknowledges the power
/// sequencing commands and both lines are recorded in [`Fixture::lines`].
pub struct Fixture {
    pub session: FakeSession,
    pub modem: FakeModem,
    pub console: FakeConsole,
    pub clock: FakeClock,
    pub lines: LineLog,
}

#[bon]
impl Fixture {
    #[builder]
    pub fn new(
        #[builder(default)] config: Config,
        // Acknowledge `AT`, `AT&K0` and `AT*F`.
        #[builder(default = true)]
        responsive: bool,
        power_line: Option<Box<dyn OutputLine>>,
        sleep_line: Option<Box<dyn OutputLine>>,
    ) -> Self {
        let clock = FakeClock::new();
        let modem = FakeModem::new(clock.clone());
        let console = FakeConsole::default();
        let lines = LineLog::default();
        if responsive {
            modem
                .reply("AT", "\r\nOK\r\n")
                .reply("AT&K0", "\r\nOK\r\n")
                .reply("AT*F", "\r\nOK\r\n");
        }

        let power_line = power_line.unwrap_or_else(|| Box::new(lines.line("power")));
        let sleep_line = sleep_line.unwrap_or_else(|| Box::new(lines.line("sleep")));
        let session = Session::builder()
            .modem(modem.clone())
            .console(console.clone())
            .clock(clock.clone())
            .power_line(power_line)
            .sleep_line(sleep_line)
            .config(config)
            .build();

        Self {
            session,
            modem,
            console,
            clock,
            lines,
        }
    }

    /// Scripts a modem that accepts an upload and whose first mailbox check
    /// reports `sbdi` (the fields after `+SBDI:`).
    pub fn script_send(&self, sbdi: &str) {
        self.modem
            .reply_sequence(
                "AT+SBDS",
                [
                    "\r\n+SBDS: 0, 0, 0, -1\r\n\r\nOK\r\n",
                    "\r\n+SBDS: 1, 0, 0, -1\r\n\r\nOK\r\n",
                ],
            )
            .reply("AT+SBDWT", "\r\nOK\r\n")
            .reply("AT+SBDWB", "READY\r\n0\r\n\r\nOK\r\n")
            .reply("AT+SBDI", &format!("\r\n+SBDI: {sbdi}\r\n\r\nOK\r\n"))
            .reply("AT+SBDD0", "\r\n0\r\n\r\nOK\r\n")
            .reply("AT+SBDD1", "\r\n0\r\n\r\nOK\r\n");
    }
}
