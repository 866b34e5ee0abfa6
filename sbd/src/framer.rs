//! Outbound message framing: `+SBDWT` for text, `+SBDWB` for binary.

use crate::at::OK;
use crate::io::{Clock, Transport};
use crate::session::Session;
use crate::{MAX_TX_BINARY_LEN, MAX_TX_TEXT_LEN, Result};
use std::time::Duration;
use tracing::{debug, warn};

const TEXT_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const BINARY_ACK_TIMEOUT: Duration = Duration::from_secs(60);
const BINARY_SETTLE: Duration = Duration::from_millis(200);
const READY: &str = "READY\r\n";
/// `0` is the modem's "checksum and length fine" code for `+SBDWB`.
const BINARY_WRITTEN: &str = "0\r\n\r\nOK\r\n";

/// 16-bit additive checksum used by both binary upload and download: the sum
/// of all bytes, wrapping at 65536.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |sum, &byte| sum.wrapping_add(u16::from(byte)))
}

/// Longest prefix of `text` that fits in `max` bytes without splitting a
/// character. ASCII text is cut at exactly `max` bytes.
#[must_use]
pub fn truncate_text(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }

    &text[..end]
}

impl<M: Transport, C: Transport, K: Clock> Session<M, C, K> {
    /// Writes `message` into the MO buffer, `Ok(false)` if not acknowledged.
    pub(crate) fn frame_text(&mut self, message: &str) -> Result<bool> {
        self.print_console("Uploading txt msg\n");
        // A carriage return would end the command early.
        let cleaned: String = message.chars().filter(|&c| c != '\r').collect();
        let body = truncate_text(&cleaned, MAX_TX_TEXT_LEN);
        if body.len() < cleaned.len() {
            debug!(from = cleaned.len(), to = body.len(), "truncated text message");
        }
        self.send(&format!("AT+SBDWT={body}\r"))?;
        if !self.await_response(TEXT_ACK_TIMEOUT, OK)?.matched {
            warn!("text upload not acknowledged");
            return Ok(false);
        }

        Ok(true)
    }

    /// Writes `payload` into the MO buffer followed by its checksum, then
    /// refreshes the buffer status.
    ///
    /// `Ok(false)` if any acknowledgement is missing. Whether the MO buffer
    /// ended up occupied is for the caller to judge from the mailbox state.
    pub(crate) fn frame_binary(&mut self, payload: &[u8]) -> Result<bool> {
        self.print_console("Uploading bin msg\n");
        let payload = &payload[..payload.len().min(MAX_TX_BINARY_LEN)];
        let sum = checksum(payload);
        debug!(len = payload.len(), checksum = sum, "framing binary message");

        self.clock.delay(BINARY_SETTLE);
        self.send(&format!("AT+SBDWB={}\r", payload.len()))?;
        self.clock.delay(BINARY_SETTLE);
        self.send_bytes(payload)?;
        self.send_bytes(&sum.to_be_bytes())?;
        self.clock.delay(BINARY_SETTLE);

        if !self.await_response(BINARY_ACK_TIMEOUT, READY)?.matched {
            warn!("modem never became ready for binary upload");
            return Ok(false);
        }
        if !self.await_response(BINARY_ACK_TIMEOUT, BINARY_WRITTEN)?.matched {
            warn!("binary upload rejected");
            return Ok(false);
        }

        self.refresh_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::MoBuffer;
    use crate::test_utils::Fixture;
    use proptest::prelude::*;
    use test_log::test;

    #[test]
    fn checksum_wraps_at_16_bits() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(b"hello"), 0x0214);
        assert_eq!(checksum(&[0xFF; 300]), 0x2AD4);
        assert_eq!(checksum(&[0xFF; 257]), 0xFFFF);
        assert_eq!(checksum(&[0xFF; 258]), 0x00FE);
    }

    #[test]
    fn truncation_keeps_char_boundaries() {
        assert_eq!(truncate_text("ping", 120), "ping");
        assert_eq!(truncate_text("abcdef", 3), "abc");
        // 'é' is two bytes, cutting at 2 would split it.
        assert_eq!(truncate_text("aé", 2), "a");
    }

    #[test]
    fn long_text_is_truncated_on_the_wire() {
        let mut fx = Fixture::builder().build();
        fx.modem.reply("AT+SBDWT", "\r\nOK\r\n");
        let long = "x".repeat(200);

        assert!(fx.session.frame_text(&long).unwrap());

        let sent = fx.modem.commands().pop().unwrap();
        assert_eq!(sent, format!("AT+SBDWT={}", "x".repeat(MAX_TX_TEXT_LEN)));
    }

    #[test]
    fn carriage_returns_cannot_inject_commands() {
        let mut fx = Fixture::builder().build();
        fx.modem.reply("AT+SBDWT", "\r\nOK\r\n");

        assert!(fx.session.frame_text("hi\rAT+SBDD0").unwrap());

        assert_eq!(fx.modem.commands(), vec!["AT+SBDWT=hiAT+SBDD0"]);
        assert_eq!(fx.modem.count("AT+SBDD0"), 0);
    }

    #[test]
    fn binary_upload_carries_length_payload_and_checksum() {
        let mut fx = Fixture::builder().build();
        fx.modem
            .reply("AT+SBDWB", "READY\r\n0\r\n\r\nOK\r\n")
            .reply("AT+SBDS", "\r\n+SBDS: 1, 0, 0, -1\r\n\r\nOK\r\n");

        assert!(fx.session.frame_binary(b"hello").unwrap());

        assert_eq!(fx.modem.commands(), vec!["AT+SBDWB=5", "AT+SBDS"]);
        assert_eq!(fx.modem.uploads(), vec![b"hello\x02\x14".to_vec()]);
        assert_eq!(fx.session.mailbox().mo, MoBuffer::Occupied);
    }

    #[test]
    fn binary_upload_is_truncated() {
        let mut fx = Fixture::builder().build();
        fx.modem
            .reply("AT+SBDWB", "READY\r\n0\r\n\r\nOK\r\n")
            .reply("AT+SBDS", "\r\n+SBDS: 1, 0, 0, -1\r\n\r\nOK\r\n");
        let payload = vec![0xFF; 400];

        assert!(fx.session.frame_binary(&payload).unwrap());

        let upload = fx.modem.uploads().pop().unwrap();
        assert_eq!(upload.len(), MAX_TX_BINARY_LEN + 2);
        assert_eq!(upload[MAX_TX_BINARY_LEN..], 0x52ACu16.to_be_bytes());
    }

    #[test]
    fn missing_ready_fails_binary_upload() {
        let mut fx = Fixture::builder().build();

        assert!(!fx.session.frame_binary(b"abc").unwrap());

        assert_eq!(fx.modem.count("AT+SBDS"), 0);
    }

    proptest! {
        #[test]
        fn prop_checksum_is_sum_mod_65536(bytes in prop::collection::vec(any::<u8>(), 0..400)) {
            let expected = bytes.iter().map(|&b| u32::from(b)).sum::<u32>() % 65_536;
            prop_assert_eq!(u32::from(checksum(&bytes)), expected);
        }

        #[test]
        fn prop_truncated_text_never_exceeds_limit(text in ".{0,200}") {
            let body = truncate_text(&text, MAX_TX_TEXT_LEN);
            prop_assert!(body.len() <= MAX_TX_TEXT_LEN);
            prop_assert!(text.starts_with(body));
        }
    }
}
