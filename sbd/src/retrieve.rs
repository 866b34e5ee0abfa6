//! Download of the inbound message sitting in the MT buffer (`+SBDRB`).
//!
//! Wire format: 2 length bytes, the payload, then the 2-byte additive
//! checksum of the payload. Both integers are big-endian.

use crate::at::POLL_INTERVAL;
use crate::framer::checksum;
use crate::io::{Clock, Transport, elapsed_ms};
use crate::session::{Session, State, duration_ms};
use crate::{Error, Result};
use std::time::Duration;
use tracing::{debug, info, warn};

const HEADER_TIMEOUT: Duration = Duration::from_secs(15);
const PAYLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const TRAILER_TIMEOUT: Duration = Duration::from_secs(15);
const TRAILER_SETTLE: Duration = Duration::from_millis(10);

impl<M: Transport, C: Transport, K: Clock> Session<M, C, K> {
    /// Downloads the latest inbound message, at most `max_len` bytes of it.
    ///
    /// The MT buffer is cleared afterwards whatever the outcome, so a broken
    /// download is never handed out twice.
    pub(crate) fn retrieve(&mut self, max_len: usize) -> Result<Vec<u8>> {
        self.transition(State::Retrieving);
        info!(announced_len = self.mailbox.mt_length, "downloading inbound message");
        self.print_console("Downloading incoming msg\n");

        let downloaded = self.send("AT+SBDRB\r").and_then(|()| self.download(max_len));
        self.clock.delay(TRAILER_SETTLE);
        // Whatever the modem sent after the trailer is not ours to keep.
        let cleared = self
            .flush_input()
            .and_then(|()| self.clear_mt_buffer());

        let payload = downloaded?;
        cleared?;
        info!(len = payload.len(), "inbound message downloaded");

        Ok(payload)
    }

    fn download(&mut self, max_len: usize) -> Result<Vec<u8>> {
        if !self.await_bytes(2, HEADER_TIMEOUT)? {
            return Err(Error::Download {
                expected: 2,
                received: self.modem.available()?,
            });
        }
        let declared = usize::from(self.read_be16()?);
        // An oversized message fails the checksum comparison below, the rest
        // of it is flushed with the trailer.
        let len = declared.min(max_len);
        if len < declared {
            warn!(declared, max_len, "inbound message longer than allowed");
        }

        let mut payload = Vec::with_capacity(len);
        let timeout_ms = duration_ms(PAYLOAD_TIMEOUT);
        let start_ms = self.clock.now_ms();
        while payload.len() < len {
            match self.modem.read_byte()? {
                Some(byte) => payload.push(byte),
                None if elapsed_ms(&self.clock, start_ms) >= timeout_ms => {
                    return Err(Error::Download {
                        expected: len,
                        received: payload.len(),
                    });
                }
                None => self.clock.delay(POLL_INTERVAL),
            }
        }
        let computed = checksum(&payload);

        if !self.await_bytes(2, TRAILER_TIMEOUT)? {
            return Err(Error::Download {
                expected: len + 2,
                received: len + self.modem.available()?,
            });
        }
        let received = self.read_be16()?;
        if received != computed {
            warn!(computed, received, "inbound checksum mismatch");
            return Err(Error::ChecksumMismatch { computed, received });
        }
        debug!(len, checksum = computed, "inbound checksum verified");

        Ok(payload)
    }

    /// Reads a big-endian `u16` off bytes already known to be pending.
    fn read_be16(&mut self) -> Result<u16> {
        let mut bytes = [0u8; 2];
        for (read, byte) in bytes.iter_mut().enumerate() {
            *byte = self.modem.read_byte()?.ok_or(Error::Download {
                expected: 2,
                received: read,
            })?;
        }

        Ok(u16::from_be_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Fixture, sbdrb_frame};
    use crate::{Buffer, MAX_RX_TEXT_LEN};
    use test_log::test;

    #[test]
    fn returns_payload_with_matching_checksum() {
        let mut fx = Fixture::builder().build();
        fx.modem
            .reply_bytes("AT+SBDRB", sbdrb_frame(b"hello", checksum(b"hello")))
            .reply("AT+SBDD1", "\r\n0\r\n\r\nOK\r\n");

        let payload = fx.session.retrieve(MAX_RX_TEXT_LEN).unwrap();

        assert_eq!(payload, b"hello");
        assert_eq!(fx.modem.commands(), vec!["AT+SBDRB", "AT+SBDD1"]);
    }

    #[test]
    fn single_bit_checksum_error_fails_and_still_clears() {
        let mut fx = Fixture::builder().build();
        fx.modem
            .reply_bytes("AT+SBDRB", sbdrb_frame(b"hello", checksum(b"hello") ^ 0x0100))
            .reply("AT+SBDD1", "\r\n0\r\n\r\nOK\r\n");

        let err = fx.session.retrieve(MAX_RX_TEXT_LEN).unwrap_err();

        assert!(
            matches!(
                err,
                Error::ChecksumMismatch {
                    computed: 0x0214,
                    received: 0x0314
                }
            ),
            "{err}"
        );
        assert_eq!(err.code(), 7);
        assert_eq!(fx.modem.count("AT+SBDD1"), 1);
    }

    #[test]
    fn silent_modem_fails_and_still_clears() {
        let mut fx = Fixture::builder().build();
        fx.modem.reply("AT+SBDD1", "\r\n0\r\n\r\nOK\r\n");

        let err = fx.session.retrieve(MAX_RX_TEXT_LEN).unwrap_err();

        assert!(matches!(err, Error::Download { expected: 2, received: 0 }), "{err}");
        assert_eq!(fx.modem.count("AT+SBDD1"), 1);
    }

    #[test]
    fn truncated_download_fails() {
        let mut fx = Fixture::builder().build();
        let mut frame = sbdrb_frame(b"hello world", checksum(b"hello world"));
        frame.truncate(6);
        fx.modem
            .reply_bytes("AT+SBDRB", frame)
            .reply("AT+SBDD1", "\r\n0\r\n\r\nOK\r\n");

        let err = fx.session.retrieve(MAX_RX_TEXT_LEN).unwrap_err();

        assert!(
            matches!(err, Error::Download { expected: 11, received: 4 }),
            "{err}"
        );
    }

    #[test]
    fn oversized_message_is_cut_at_the_cap_and_discarded() {
        let mut fx = Fixture::builder().build();
        let payload = [b'a'; 200];
        fx.modem
            .reply_bytes("AT+SBDRB", sbdrb_frame(&payload, checksum(&payload)))
            .reply("AT+SBDD1", "\r\n0\r\n\r\nOK\r\n");

        let err = fx.session.retrieve(MAX_RX_TEXT_LEN).unwrap_err();

        // The two bytes after the cap are payload, read as the checksum.
        assert!(
            matches!(
                err,
                Error::ChecksumMismatch {
                    computed: 0x3327,
                    received: 0x6161
                }
            ),
            "{err}"
        );
        assert_eq!(fx.modem.count("AT+SBDD1"), 1);
        assert_eq!(fx.modem.pending_rx(), 0);
    }

    #[test]
    fn clear_failure_is_reported_after_good_download() {
        let mut fx = Fixture::builder().build();
        fx.modem
            .reply_bytes("AT+SBDRB", sbdrb_frame(b"hi", checksum(b"hi")));

        let err = fx.session.retrieve(MAX_RX_TEXT_LEN).unwrap_err();

        assert!(
            matches!(err, Error::ClearModemBuffer(Buffer::MobileTerminated)),
            "{err}"
        );
    }
}
