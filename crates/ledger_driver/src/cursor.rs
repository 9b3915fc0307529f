//! Result cursors.

use crate::communicator::Communicator;
use crate::error::{DriverError, DriverResult};
use crate::session::Session;
use crate::types::{IoUsage, Page, PageToken, SessionToken, TimingInformation, TransactionId};
use ledger_codec::{Codec, WireValue};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::vec;

/// Statement statistics reported by the service.
pub trait StatementStats {
    /// I/O consumed so far, if the service reported any.
    fn consumed_ios(&self) -> Option<IoUsage>;

    /// Server processing time so far, if the service reported any.
    fn timing_information(&self) -> Option<TimingInformation>;
}

fn accumulate<T: Copy + std::ops::AddAssign>(total: &mut Option<T>, page: Option<T>) {
    if let Some(value) = page {
        match total {
            Some(sum) => *sum += value,
            None => *total = Some(value),
        }
    }
}

/// Background page fetcher of a read-ahead cursor.
///
/// The worker walks the page chain and queues up to `read_ahead - 1` pages
/// ahead of the reader. It stops after the last page, after the first
/// error (which is queued), or as soon as the receiver is gone. Dropping
/// the fetcher waits for the worker, so no request is in flight on the
/// session once the cursor is gone.
struct ReadAhead {
    pages: Option<Receiver<DriverResult<Page>>>,
    worker: Option<JoinHandle<()>>,
}

impl ReadAhead {
    fn spawn(
        communicator: Arc<dyn Communicator>,
        session: SessionToken,
        transaction_id: TransactionId,
        first: PageToken,
        read_ahead: usize,
    ) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(read_ahead.saturating_sub(1));
        let worker = thread::Builder::new()
            .name("ledger-read-ahead".into())
            .spawn(move || {
                fetch_pages(communicator.as_ref(), &session, &transaction_id, first, &sender)
            })?;
        Ok(Self {
            pages: Some(receiver),
            worker: Some(worker),
        })
    }

    /// Next prefetched page, in chain order.
    fn next_page(&self) -> DriverResult<Page> {
        match self.pages.as_ref().map(Receiver::recv) {
            Some(Ok(page)) => page,
            _ => Err(DriverError::transport_fatal(
                "read-ahead worker stopped before the last page",
            )),
        }
    }
}

impl Drop for ReadAhead {
    fn drop(&mut self) {
        // Unblocks a worker waiting on a full queue.
        drop(self.pages.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("read-ahead worker panicked");
            }
        }
    }
}

fn fetch_pages(
    communicator: &dyn Communicator,
    session: &SessionToken,
    transaction_id: &TransactionId,
    first: PageToken,
    pages: &SyncSender<DriverResult<Page>>,
) {
    let mut token = Some(first);
    while let Some(current) = token.take() {
        let page = communicator.fetch_page(session, transaction_id, &current);
        let failed = match &page {
            Ok(page) => {
                token = page.next_page_token.clone();
                false
            }
            Err(e) => {
                tracing::debug!(transaction_id = %transaction_id, error = %e, "queued read-ahead error");
                true
            }
        };
        if pages.send(page).is_err() {
            tracing::trace!(transaction_id = %transaction_id, "cursor dropped; read-ahead stopping");
            return;
        }
        if failed {
            return;
        }
    }
}

/// Single-pass cursor over a statement's results.
///
/// Pages are fetched on demand while iterating, or prefetched by a
/// background thread when the session has read-ahead enabled. The cursor
/// borrows the session of the attempt that produced it and cannot outlive
/// it. After yielding an error it yields nothing more.
pub struct StreamCursor<'s> {
    session: &'s Session,
    transaction_id: TransactionId,
    rows: vec::IntoIter<WireValue>,
    next_page_token: Option<PageToken>,
    read_ahead: Option<ReadAhead>,
    consumed_ios: Option<IoUsage>,
    timing_information: Option<TimingInformation>,
    pages_fetched: usize,
    done: bool,
}

impl<'s> StreamCursor<'s> {
    pub(crate) fn new(session: &'s Session, transaction_id: TransactionId, page: Page) -> Self {
        let mut cursor = Self {
            session,
            transaction_id,
            rows: Vec::new().into_iter(),
            next_page_token: None,
            read_ahead: None,
            consumed_ios: None,
            timing_information: None,
            pages_fetched: 0,
            done: false,
        };
        cursor.load(page);
        cursor
    }

    /// Creates a cursor that prefetches up to `read_ahead - 1` pages on a
    /// background thread. Values below 2 fetch on demand.
    pub(crate) fn with_read_ahead(
        session: &'s Session,
        transaction_id: TransactionId,
        page: Page,
        read_ahead: usize,
    ) -> Self {
        let mut cursor = Self::new(session, transaction_id, page);
        if read_ahead < 2 {
            return cursor;
        }
        if let Some(first) = cursor.next_page_token.clone() {
            match ReadAhead::spawn(
                session.shared_communicator(),
                session.token().clone(),
                cursor.transaction_id.clone(),
                first,
                read_ahead,
            ) {
                Ok(fetcher) => cursor.read_ahead = Some(fetcher),
                Err(e) => tracing::warn!(
                    error = %e,
                    "failed to start read-ahead thread; fetching pages on demand",
                ),
            }
        }
        cursor
    }

    fn load(&mut self, page: Page) {
        accumulate(&mut self.consumed_ios, page.consumed_ios);
        accumulate(&mut self.timing_information, page.timing_information);
        self.next_page_token = page.next_page_token;
        self.rows = page.values.into_iter();
        self.pages_fetched += 1;
    }

    fn fetch_next_page(&mut self, token: PageToken) -> DriverResult<()> {
        let page = match &self.read_ahead {
            Some(fetcher) => fetcher.next_page()?,
            None => self.session.communicator().fetch_page(
                self.session.token(),
                &self.transaction_id,
                &token,
            )?,
        };
        tracing::trace!(
            transaction_id = %self.transaction_id,
            rows = page.values.len(),
            has_more = page.has_more(),
            "fetched page",
        );
        self.load(page);
        Ok(())
    }

    /// Transaction the statement ran in.
    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    /// Number of pages received so far, including the first.
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Returns true if pages are prefetched on a background thread.
    pub fn is_read_ahead(&self) -> bool {
        self.read_ahead.is_some()
    }

    /// Drains the cursor into a [`BufferedCursor`].
    pub fn buffer(mut self) -> DriverResult<BufferedCursor> {
        let mut values = Vec::new();
        for value in self.by_ref() {
            values.push(value?);
        }
        Ok(BufferedCursor {
            values,
            consumed_ios: self.consumed_ios,
            timing_information: self.timing_information,
        })
    }
}

impl Iterator for StreamCursor<'_> {
    type Item = DriverResult<WireValue>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(value) = self.rows.next() {
                return Some(Ok(value));
            }
            match self.next_page_token.take() {
                None => {
                    self.done = true;
                    self.read_ahead = None;
                    return None;
                }
                Some(token) => {
                    if let Err(e) = self.fetch_next_page(token) {
                        self.done = true;
                        self.read_ahead = None;
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}

impl StatementStats for StreamCursor<'_> {
    fn consumed_ios(&self) -> Option<IoUsage> {
        self.consumed_ios
    }

    fn timing_information(&self) -> Option<TimingInformation> {
        self.timing_information
    }
}

impl fmt::Debug for StreamCursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCursor")
            .field("transaction_id", &self.transaction_id)
            .field("pages_fetched", &self.pages_fetched)
            .field("read_ahead", &self.read_ahead.is_some())
            .field("done", &self.done)
            .finish()
    }
}

/// Fully materialized results. Can be iterated any number of times and
/// outlives the transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferedCursor {
    values: Vec<WireValue>,
    consumed_ios: Option<IoUsage>,
    timing_information: Option<TimingInformation>,
}

impl BufferedCursor {
    /// Creates a buffered cursor from rows, without statistics.
    pub fn new(values: Vec<WireValue>) -> Self {
        Self {
            values,
            ..Self::default()
        }
    }

    /// Iterates over the rows from the start.
    pub fn iter(&self) -> std::slice::Iter<'_, WireValue> {
        self.values.iter()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The rows.
    pub fn values(&self) -> &[WireValue] {
        &self.values
    }

    /// Consumes the cursor, returning the rows.
    pub fn into_values(self) -> Vec<WireValue> {
        self.values
    }

    /// Decodes every row.
    pub fn decode_all<T, K>(&self, codec: &K) -> DriverResult<Vec<T>>
    where
        T: DeserializeOwned,
        K: Codec,
    {
        self.values
            .iter()
            .map(|value| codec.decode(value).map_err(DriverError::from))
            .collect()
    }
}

impl StatementStats for BufferedCursor {
    fn consumed_ios(&self) -> Option<IoUsage> {
        self.consumed_ios
    }

    fn timing_information(&self) -> Option<TimingInformation> {
        self.timing_information
    }
}

impl IntoIterator for BufferedCursor {
    type Item = WireValue;
    type IntoIter = vec::IntoIter<WireValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

impl<'a> IntoIterator for &'a BufferedCursor {
    type Item = &'a WireValue;
    type IntoIter = std::slice::Iter<'a, WireValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}
