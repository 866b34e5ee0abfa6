//! Mailbox state and the parsing of the modem's buffer status responses.
//!
//! Both `+SBDS` (buffer status) and `+SBDI` (session result) responses are a
//! prefix followed by comma separated decimal fields, e.g.
//! `+SBDI: 1, 2173, 1, 87, 429, 0`. Fields that are missing or not numeric
//! read as zero.

use crate::at::OK;
use crate::io::{Clock, Transport};
use crate::session::Session;
use crate::Result;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

const STATUS_TIMEOUT: Duration = Duration::from_secs(20);

/// Occupancy of the mobile originated (outbound) buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum MoBuffer {
    #[default]
    Empty,
    Occupied,
    /// The send outcome is not settled yet. Never a terminal state: it always
    /// calls for another mailbox check.
    Transient,
}

impl MoBuffer {
    /// `0` and `1` are settled, any other code is treated as transient.
    #[must_use]
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => MoBuffer::Empty,
            1 => MoBuffer::Occupied,
            _ => MoBuffer::Transient,
        }
    }
}

/// Occupancy of the mobile terminated (inbound) buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum MtBuffer {
    #[default]
    Empty,
    Occupied,
}

impl MtBuffer {
    #[must_use]
    pub fn from_code(code: i64) -> Self {
        if code == 1 {
            MtBuffer::Occupied
        } else {
            MtBuffer::Empty
        }
    }
}

/// What the session last learned about the modem's buffers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MailboxState {
    pub mo: MoBuffer,
    pub mt: MtBuffer,
    /// Length of the inbound message waiting in the MT buffer, in bytes.
    pub mt_length: usize,
    /// Inbound messages still queued at the gateway.
    pub mt_queued: u32,
}

impl MailboxState {
    pub(crate) fn reset_mt(&mut self) {
        self.mt = MtBuffer::Empty;
        self.mt_length = 0;
        self.mt_queued = 0;
    }

    fn apply_status(&mut self, status: &BufferStatus) {
        self.mo = MoBuffer::from_code(status.mo);
        self.mt = MtBuffer::from_code(status.mt);
    }

    pub(crate) fn apply_session(&mut self, report: &SessionReport) {
        self.mo = MoBuffer::from_code(report.mo);
        self.mt = MtBuffer::from_code(report.mt);
        self.mt_length = usize::try_from(report.mt_length).unwrap_or(0);
        self.mt_queued = u32::try_from(report.mt_queued).unwrap_or(0);
    }
}

/// Fields of a `+SBDS` response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStatus {
    pub mo: i64,
    pub momsn: i64,
    pub mt: i64,
    pub mtmsn: i64,
}

impl BufferStatus {
    #[must_use]
    pub fn parse(response: &str) -> Self {
        let [mo, momsn, mt, mtmsn] = fields(response, "+SBDS");
        Self {
            mo,
            momsn,
            mt,
            mtmsn,
        }
    }
}

/// Fields of a `+SBDI` response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub mo: i64,
    pub momsn: i64,
    pub mt: i64,
    pub mtmsn: i64,
    pub mt_length: i64,
    pub mt_queued: i64,
}

impl SessionReport {
    #[must_use]
    pub fn parse(response: &str) -> Self {
        let [mo, momsn, mt, mtmsn, mt_length, mt_queued] = fields(response, "+SBDI");
        Self {
            mo,
            momsn,
            mt,
            mtmsn,
            mt_length,
            mt_queued,
        }
    }
}

/// Extracts exactly `N` positional fields after `prefix:`.
///
/// Without the prefix the first `:` in the response is used instead. The
/// field list ends at the end of that line.
#[must_use]
pub fn fields<const N: usize>(response: &str, prefix: &str) -> [i64; N] {
    let mut out = [0; N];
    let start = match response.find(prefix) {
        Some(at) => response[at..].find(':').map(|colon| at + colon),
        None => response.find(':'),
    };
    let Some(colon) = start else {
        return out;
    };
    let line = response[colon + 1..]
        .split(['\r', '\n'])
        .next()
        .unwrap_or_default();
    for (slot, field) in out.iter_mut().zip(line.split(',')) {
        *slot = field.trim().parse().unwrap_or(0);
    }

    out
}

impl<M: Transport, C: Transport, K: Clock> Session<M, C, K> {
    /// Queries the buffer status and updates the MO/MT occupancy.
    ///
    /// `Ok(false)` if the modem never acknowledged the query, in which case the
    /// mailbox state is left untouched.
    pub(crate) fn refresh_status(&mut self) -> Result<bool> {
        self.send("AT+SBDS\r")?;
        let reply = self.await_response(STATUS_TIMEOUT, OK)?;
        if !reply.matched {
            warn!("buffer status query went unanswered");
            return Ok(false);
        }
        let status = BufferStatus::parse(&reply.text);
        self.mailbox.apply_status(&status);
        debug!(?status, mailbox = ?self.mailbox, "buffer status");

        Ok(true)
    }
}
