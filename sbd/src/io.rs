//! Hardware seams: byte transports, output lines and the clock.

use serialport::SerialPort;
use std::io::{self, Read as _, Write as _};
use std::time::{Duration, Instant};

/// Byte oriented duplex stream, used for both the modem link and the console.
pub trait Transport {
    /// Number of bytes that can be read without blocking.
    fn available(&mut self) -> io::Result<usize>;

    /// Reads one byte, `None` if nothing is pending.
    fn read_byte(&mut self) -> io::Result<Option<u8>>;

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn available(&mut self) -> io::Result<usize> {
        (**self).available()
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        (**self).read_byte()
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write_all(bytes)
    }
}

impl Transport for Box<dyn SerialPort> {
    fn available(&mut self) -> io::Result<usize> {
        let pending = self.bytes_to_read()?;
        Ok(pending as usize)
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        if self.bytes_to_read()? == 0 {
            return Ok(None);
        }
        let mut buf = [0u8; 1];
        match self.read(&mut buf) {
            Ok(1) => Ok(Some(buf[0])),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        io::Write::write_all(self, bytes)?;
        self.flush()
    }
}

/// A single boolean output line, e.g. a GPIO.
pub trait OutputLine {
    fn set(&mut self, high: bool) -> io::Result<()>;
}

/// Monotonic time source.
pub trait Clock {
    /// Milliseconds since an arbitrary, fixed starting point.
    fn now_ms(&self) -> u64;

    fn delay(&self, duration: Duration);
}

/// [`Clock`] backed by [`Instant`] and [`std::thread::sleep`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn delay(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Milliseconds elapsed on `clock` since `start_ms`.
pub(crate) fn elapsed_ms(clock: &impl Clock, start_ms: u64) -> u64 {
    clock.now_ms().saturating_sub(start_ms)
}
