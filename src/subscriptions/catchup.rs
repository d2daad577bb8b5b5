//! Scanning the log on behalf of a subscription.

use crate::error::Result;
use crate::log::{FactIndex, FactLog, IndexEntry};
use crate::spec;
use crate::types::Serial;
use std::sync::Arc;
use tracing::trace;

use super::subscription::SubscriptionShared;
use super::types::CatchupStrategy;

/// Reads committed facts past a subscription's cursor and delivers the
/// matching ones.
pub(crate) struct Scanner {
    log: Arc<FactLog>,
    index: Arc<FactIndex>,
    strategy: CatchupStrategy,
    page_size: usize,
}

impl Scanner {
    pub fn new(
        log: Arc<FactLog>,
        index: Arc<FactIndex>,
        strategy: CatchupStrategy,
        page_size: usize,
    ) -> Self {
        Self {
            log,
            index,
            strategy,
            page_size: page_size.max(1),
        }
    }

    pub fn head(&self) -> Serial {
        self.index.head()
    }

    /// Deliver every matching fact with `cursor < serial <= until`.
    ///
    /// Returns `Ok(false)` if the subscription finished while scanning.
    pub fn scan(&self, sub: &SubscriptionShared, until: Serial) -> Result<bool> {
        let mut cursor = sub.cursor.lock();
        let from = *cursor;
        let mut delivered = 0usize;

        loop {
            let entries = match self.strategy {
                CatchupStrategy::Paged => self.index.page(*cursor, until, self.page_size),
                CatchupStrategy::Fetching => self.index.range(*cursor, until),
            };
            let exhausted = match self.strategy {
                CatchupStrategy::Paged => entries.len() < self.page_size,
                CatchupStrategy::Fetching => true,
            };

            for entry in entries {
                if sub.is_done() {
                    return Ok(false);
                }
                if self.visit(sub, &entry)? {
                    delivered += 1;
                }
                *cursor = entry.serial;
            }

            if exhausted {
                break;
            }
        }

        sub.touch();
        if delivered > 0 {
            trace!(
                subscription = sub.id.0,
                from = %from,
                to = %*cursor,
                delivered,
                "scan delivered facts"
            );
        }
        Ok(!sub.is_done())
    }

    /// Filter one entry and deliver it if it matches. Marks bypass the
    /// specs and are dropped only on request.
    fn visit(&self, sub: &SubscriptionShared, entry: &IndexEntry) -> Result<bool> {
        let request = &sub.request;
        let header = &entry.header;

        if header.is_mark() {
            if request.skip_marks {
                return Ok(false);
            }
            let fact = self.log.read_at(entry.offset)?;
            return Ok(sub.deliver(fact));
        }

        if !spec::any_matches_header(&request.specs, header) {
            return Ok(false);
        }

        let fact = self.log.read_at(entry.offset)?;
        if !spec::any_matches(&request.specs, &fact.header, &fact.payload)? {
            return Ok(false);
        }
        Ok(sub.deliver(fact))
    }
}
