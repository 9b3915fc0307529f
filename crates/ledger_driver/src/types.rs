//! Core types shared between the driver and its communicator.

use ledger_codec::WireValue;
use std::fmt;
use std::ops::AddAssign;

/// Opaque token identifying a session on the service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    /// Creates a session token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Service-assigned transaction identifier.
///
/// Surfaced to transaction bodies, backoff functions, and terminal errors
/// for correlation. It has no meaning to the driver once the attempt ends.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(String);

impl TransactionId {
    /// Creates a transaction id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Continuation token for the next page of a statement's results.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageToken(String);

impl PageToken {
    /// Creates a page token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// I/O consumed by a statement, as reported by the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoUsage {
    /// Number of read I/Os.
    pub read_ios: u64,
    /// Number of write I/Os.
    pub write_ios: u64,
}

impl IoUsage {
    /// Creates an I/O usage record.
    pub fn new(read_ios: u64, write_ios: u64) -> Self {
        Self {
            read_ios,
            write_ios,
        }
    }
}

impl AddAssign for IoUsage {
    fn add_assign(&mut self, other: Self) {
        self.read_ios += other.read_ios;
        self.write_ios += other.write_ios;
    }
}

/// Server-side processing time for a statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingInformation {
    /// Processing time in milliseconds.
    pub processing_time_ms: u64,
}

impl TimingInformation {
    /// Creates a timing record.
    pub fn new(processing_time_ms: u64) -> Self {
        Self { processing_time_ms }
    }
}

impl AddAssign for TimingInformation {
    fn add_assign(&mut self, other: Self) {
        self.processing_time_ms += other.processing_time_ms;
    }
}

/// One page of a statement's result set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Rows on this page.
    pub values: Vec<WireValue>,
    /// Token for the next page, `None` on the last page.
    pub next_page_token: Option<PageToken>,
    /// I/O consumed to produce this page.
    pub consumed_ios: Option<IoUsage>,
    /// Server timing for this page.
    pub timing_information: Option<TimingInformation>,
}

impl Page {
    /// Creates a final page with the given rows.
    pub fn new(values: Vec<WireValue>) -> Self {
        Self {
            values,
            ..Self::default()
        }
    }

    /// Sets the continuation token.
    pub fn with_next_page(mut self, token: PageToken) -> Self {
        self.next_page_token = Some(token);
        self
    }

    /// Sets the consumed I/O.
    pub fn with_consumed_ios(mut self, ios: IoUsage) -> Self {
        self.consumed_ios = Some(ios);
        self
    }

    /// Sets the timing information.
    pub fn with_timing(mut self, timing: TimingInformation) -> Self {
        self.timing_information = Some(timing);
        self
    }

    /// Returns true if more pages follow.
    pub fn has_more(&self) -> bool {
        self.next_page_token.is_some()
    }
}
