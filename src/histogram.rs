use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::Result;
use crate::reader::LogReader;
use crate::record::{EntryID, Event, Timestamp};
use crate::timeline::TimeWindow;

/// Equal-width bins starting at `min_bin_size`, plus one overflow bin for
/// everything at or past `min_bin_size + num_bins * bin_size`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct BinSpec {
    pub num_bins: usize,
    pub bin_size: i64,
    pub min_bin_size: i64,
}

impl BinSpec {
    pub fn new(num_bins: usize, bin_size: i64, min_bin_size: i64) -> Self {
        BinSpec {
            num_bins,
            bin_size: bin_size.max(1),
            min_bin_size,
        }
    }

    /// 100 bins of 1ms.
    pub fn default_time() -> Self {
        BinSpec::new(100, 1000, 0)
    }

    /// 200 bins of 100 bytes.
    pub fn default_message() -> Self {
        BinSpec::new(200, 100, 0)
    }

    /// Total number of bins, overflow included.
    pub fn total_bins(&self) -> usize {
        self.num_bins + 1
    }

    /// `None` for values below the threshold.
    pub fn bin(&self, value: i64) -> Option<usize> {
        let adjusted = value.checked_sub(self.min_bin_size)?;
        if adjusted < 0 {
            return None;
        }
        let bin = usize::try_from(adjusted / self.bin_size).unwrap_or(usize::MAX);
        Some(bin.min(self.num_bins))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryHistogram {
    pub time_counts: Vec<u64>,
    pub message_counts: Vec<u64>,
    pub count: u64,
    pub total_time: Timestamp,
    pub max_time: Timestamp,
}

impl EntryHistogram {
    fn new(time_bins: &BinSpec, msg_bins: &BinSpec) -> Self {
        EntryHistogram {
            time_counts: vec![0; time_bins.total_bins()],
            message_counts: vec![0; msg_bins.total_bins()],
            count: 0,
            total_time: Timestamp(0),
            max_time: Timestamp(0),
        }
    }

    fn merge(&mut self, other: &EntryHistogram) {
        for (x, y) in self.time_counts.iter_mut().zip(&other.time_counts) {
            *x += y;
        }
        for (x, y) in self.message_counts.iter_mut().zip(&other.message_counts) {
            *x += y;
        }
        self.count += other.count;
        self.total_time = Timestamp(self.total_time.0.saturating_add(other.total_time.0));
        self.max_time = self.max_time.max(other.max_time);
    }
}

/// Per-entry execution time and message size distributions over a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Histogram {
    pub window: TimeWindow,
    pub time_bins: BinSpec,
    pub msg_bins: BinSpec,
    pub entries: BTreeMap<EntryID, EntryHistogram>,
}

impl Histogram {
    pub fn new(window: TimeWindow, time_bins: BinSpec, msg_bins: BinSpec) -> Self {
        Histogram {
            window,
            time_bins,
            msg_bins,
            entries: BTreeMap::new(),
        }
    }

    fn entry_mut(&mut self, entry: EntryID) -> &mut EntryHistogram {
        let (time_bins, msg_bins) = (&self.time_bins, &self.msg_bins);
        self.entries
            .entry(entry)
            .or_insert_with(|| EntryHistogram::new(time_bins, msg_bins))
    }

    pub fn record_execution(&mut self, entry: EntryID, duration: Timestamp) {
        let bin = self.time_bins.bin(duration.0);
        let stats = self.entry_mut(entry);
        // Executions below the threshold still count towards the totals.
        if let Some(bin) = bin {
            stats.time_counts[bin] += 1;
        }
        stats.count += 1;
        stats.total_time = Timestamp(stats.total_time.0.saturating_add(duration.0));
        stats.max_time = stats.max_time.max(duration);
    }

    pub fn record_message(&mut self, entry: EntryID, message_len: i32) {
        // Format 1.0 logs do not record sizes.
        if message_len < 0 {
            return;
        }
        if let Some(bin) = self.msg_bins.bin(message_len.into()) {
            self.entry_mut(entry).message_counts[bin] += 1;
        }
    }

    /// Adds the executions that begin inside the window, stopping at the
    /// first record past its end once no execution is open.
    pub fn add_log(&mut self, reader: &mut LogReader) -> Result<()> {
        let window = self.window;
        let mut open: Option<(EntryID, Timestamp)> = None;
        while let Some(record) = reader.next_record()? {
            if record.entry().is_some_and(EntryID::is_none) {
                continue;
            }
            if record.time > window.end && open.is_none() {
                break;
            }
            match &record.event {
                Event::BeginProcessing { msg, .. } if record.time >= window.begin => {
                    if record.time <= window.end {
                        open = Some((msg.entry, record.time));
                    }
                }
                Event::EndProcessing { msg } => {
                    if let Some((entry, start)) = open.take() {
                        if entry == msg.entry {
                            let duration = Timestamp(record.time.0.saturating_sub(start.0));
                            self.record_execution(entry, duration);
                        }
                    }
                }
                Event::Creation { msg, .. }
                | Event::CreationBroadcast { msg, .. }
                | Event::CreationMulticast { msg, .. }
                    if window.contains(record.time) =>
                {
                    self.record_message(msg.entry, msg.message_len);
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn merge(&mut self, other: Histogram) {
        for (entry, stats) in &other.entries {
            self.entry_mut(*entry).merge(stats);
        }
    }
}
