// Paged Log Reader
//
// Finite, restartable lazy read over one build's committed events.
// Every page is checked for contiguity before it is handed out.

use tracing::warn;

use super::{BuildEvent, BuildId, EventLogStore, LogError, Seq};

pub struct LogReader<'a, S: EventLogStore> {
    store: &'a S,
    build_id: BuildId,
    cursor: Seq,
    page_size: usize,
    exhausted: bool,
}

impl<'a, S: EventLogStore> LogReader<'a, S> {
    pub(super) fn new(store: &'a S, build_id: BuildId, after_seq: Seq, page_size: usize) -> Self {
        Self {
            store,
            build_id,
            cursor: after_seq,
            page_size: page_size.max(1),
            exhausted: false,
        }
    }

    /// Highest `seq` handed out so far (or the starting point).
    ///
    /// Restarting a read from here continues exactly where this one stopped.
    pub fn cursor(&self) -> Seq {
        self.cursor
    }

    /// Next contiguous page, or `None` once the committed tail is reached.
    ///
    /// Events committed while the read is in progress may or may not be
    /// included, but a page never skips or reorders a `seq`.
    pub async fn next_page(&mut self) -> Result<Option<Vec<BuildEvent>>, LogError> {
        if self.exhausted {
            return Ok(None);
        }

        let mut page = self
            .store
            .load_after(&self.build_id, self.cursor, self.page_size)
            .await?;
        let fetched = page.len();

        let contiguous = page
            .iter()
            .zip(self.cursor + 1..)
            .take_while(|(event, expected)| event.seq == *expected)
            .count();

        if contiguous < fetched {
            warn!(
                build_id = %self.build_id,
                after = self.cursor,
                returned = page[contiguous].seq,
                "store returned a non-contiguous page, truncating read"
            );
            page.truncate(contiguous);
            self.exhausted = true;
        } else if fetched < self.page_size {
            self.exhausted = true;
        }

        match page.last() {
            Some(last) => {
                self.cursor = last.seq;
                Ok(Some(page))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    /// Drain the remaining pages into one vector.
    pub async fn collect_all(mut self) -> Result<Vec<BuildEvent>, LogError> {
        let mut events = Vec::new();
        while let Some(page) = self.next_page().await? {
            events.extend(page);
        }
        Ok(events)
    }
}
