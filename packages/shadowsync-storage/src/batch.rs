//! Buffered bulk writes with row-level failure isolation.
//!
//! Every bulk insert, update and delete issued by the engine goes through a
//! [`BatchWriter`]. A batch is written in one transaction; when the backend
//! rejects it, the same rows are retried one at a time and only the rows that
//! still fail are dropped (and reported).

use serde::Serialize;
use tracing::{debug, warn};

use crate::Result;

/// How inserts treat rows whose key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriteMode {
    /// Plain insert; duplicates are errors
    Insert,
    /// Insert-or-ignore, safe to re-run
    SkipExisting,
}

impl WriteMode {
    pub fn insert_verb(&self) -> &'static str {
        match self {
            WriteMode::Insert => "INSERT",
            WriteMode::SkipExisting => "INSERT OR IGNORE",
        }
    }
}

/// Destination of a [`BatchWriter`].
pub trait BatchSink {
    type Item;

    /// Table name used in logs and failure reports
    fn target(&self) -> &str;

    /// Short key of one item for logs and failure reports
    fn describe(&self, item: &Self::Item) -> String;

    /// Write all items atomically. Returns the number of rows affected.
    fn write_batch(&self, items: &[Self::Item], mode: WriteMode) -> Result<usize>;
}

/// A row that could not be written even on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFailure {
    pub target: String,
    pub key: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteStats {
    /// Rows affected (ignored duplicates are not counted)
    pub written: usize,
    pub failed: usize,
    /// Number of bulk writes that fell back to row-by-row
    pub bulk_fallbacks: usize,
    pub failures: Vec<RowFailure>,
}

impl WriteStats {
    pub fn merge(&mut self, other: WriteStats) {
        self.written += other.written;
        self.failed += other.failed;
        self.bulk_fallbacks += other.bulk_fallbacks;
        self.failures.extend(other.failures);
    }
}

pub struct BatchWriter<S: BatchSink> {
    sink: S,
    mode: WriteMode,
    queue: Vec<S::Item>,
    stats: WriteStats,
}

impl<S: BatchSink> BatchWriter<S> {
    pub fn new(sink: S, mode: WriteMode) -> Self {
        Self {
            sink,
            mode,
            queue: Vec::new(),
            stats: WriteStats::default(),
        }
    }

    pub fn add(&mut self, item: S::Item) {
        self.queue.push(item);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> &WriteStats {
        &self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Write the queue once it holds at least `max_batch` items.
    ///
    /// Returns the number of rows written by this call (0 when below the
    /// threshold).
    pub fn flush(&mut self, max_batch: usize) -> Result<usize> {
        if self.queue.is_empty() || self.queue.len() < max_batch {
            return Ok(0);
        }
        self.write_queue()
    }

    /// Write whatever is queued, regardless of size.
    pub fn flush_all(&mut self) -> Result<usize> {
        if self.queue.is_empty() {
            return Ok(0);
        }
        self.write_queue()
    }

    /// Flush the remainder and hand back the accumulated statistics.
    pub fn finish(mut self) -> Result<WriteStats> {
        self.flush_all()?;
        Ok(self.stats)
    }

    fn write_queue(&mut self) -> Result<usize> {
        let items = std::mem::take(&mut self.queue);

        match self.sink.write_batch(&items, self.mode) {
            Ok(written) => {
                debug!(
                    target_table = self.sink.target(),
                    rows = items.len(),
                    written,
                    "Bulk write committed"
                );
                self.stats.written += written;
                Ok(written)
            }
            Err(e) if e.is_row_level() => {
                warn!(
                    target_table = self.sink.target(),
                    rows = items.len(),
                    error = %e,
                    "Bulk write rejected, retrying row by row"
                );
                self.stats.bulk_fallbacks += 1;
                Ok(self.write_each(items))
            }
            Err(e) => Err(e),
        }
    }

    fn write_each(&mut self, items: Vec<S::Item>) -> usize {
        let mut written = 0;
        for item in items {
            match self.sink.write_batch(std::slice::from_ref(&item), self.mode) {
                Ok(n) => written += n,
                Err(e) => {
                    let key = self.sink.describe(&item);
                    warn!(
                        target_table = self.sink.target(),
                        key = %key,
                        error = %e,
                        "Skipping row that failed to write"
                    );
                    self.stats.failed += 1;
                    self.stats.failures.push(RowFailure {
                        target: self.sink.target().to_string(),
                        key,
                        message: e.to_string(),
                    });
                }
            }
        }
        self.stats.written += written;
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageError;
    use std::cell::RefCell;

    /// Rejects any batch containing a negative number.
    struct VecSink {
        rows: RefCell<Vec<i32>>,
        calls: RefCell<usize>,
        fatal: bool,
    }

    impl VecSink {
        fn new() -> Self {
            Self {
                rows: RefCell::new(Vec::new()),
                calls: RefCell::new(0),
                fatal: false,
            }
        }
    }

    impl BatchSink for &VecSink {
        type Item = i32;

        fn target(&self) -> &str {
            "numbers"
        }

        fn describe(&self, item: &i32) -> String {
            item.to_string()
        }

        fn write_batch(&self, items: &[i32], mode: WriteMode) -> Result<usize> {
            *self.calls.borrow_mut() += 1;
            if self.fatal {
                return Err(StorageError::config("no such table"));
            }
            if items.iter().any(|i| *i < 0) {
                return Err(StorageError::constraint("negative"));
            }
            let mut rows = self.rows.borrow_mut();
            let mut written = 0;
            for item in items {
                if mode == WriteMode::SkipExisting && rows.contains(item) {
                    continue;
                }
                rows.push(*item);
                written += 1;
            }
            Ok(written)
        }
    }

    #[test]
    fn test_flush_waits_for_threshold() {
        let sink = VecSink::new();
        let mut writer = BatchWriter::new(&sink, WriteMode::Insert);
        writer.add(1);
        writer.add(2);
        assert_eq!(writer.flush(3).unwrap(), 0);
        assert_eq!(*sink.calls.borrow(), 0);

        writer.add(3);
        assert_eq!(writer.flush(3).unwrap(), 3);
        assert_eq!(writer.pending(), 0);
        assert_eq!(*sink.calls.borrow(), 1);
    }

    #[test]
    fn test_flush_all_forces_write() {
        let sink = VecSink::new();
        let mut writer = BatchWriter::new(&sink, WriteMode::Insert);
        writer.add(7);
        assert_eq!(writer.flush_all().unwrap(), 1);
        assert_eq!(writer.flush_all().unwrap(), 0);
        assert_eq!(*sink.rows.borrow(), vec![7]);
    }

    #[test]
    fn test_bad_row_isolated() {
        let sink = VecSink::new();
        let mut writer = BatchWriter::new(&sink, WriteMode::Insert);
        for i in [1, 2, -3, 4, 5] {
            writer.add(i);
        }
        let stats = writer.finish().unwrap();

        assert_eq!(stats.written, 4);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.bulk_fallbacks, 1);
        assert_eq!(stats.failures[0].key, "-3");
        assert_eq!(*sink.rows.borrow(), vec![1, 2, 4, 5]);
    }

    #[test]
    fn test_skip_existing_is_idempotent() {
        let sink = VecSink::new();
        for _ in 0..2 {
            let mut writer = BatchWriter::new(&sink, WriteMode::SkipExisting);
            writer.add(1);
            writer.add(2);
            writer.finish().unwrap();
        }
        assert_eq!(*sink.rows.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_fatal_error_propagates() {
        let mut sink = VecSink::new();
        sink.fatal = true;
        let mut writer = BatchWriter::new(&sink, WriteMode::Insert);
        writer.add(1);
        assert!(writer.flush_all().is_err());
        assert_eq!(*sink.calls.borrow(), 1);
    }
}
