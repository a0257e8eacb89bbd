use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Serialize, Serializer};

use crate::config::RunConfig;
use crate::decode::FormatVersion;
use crate::end_time::EndTimeScanner;
use crate::error::{Error, Result};
use crate::histogram::{BinSpec, Histogram};
use crate::reader::{LogReader, UnknownKindPolicy};
use crate::record::{EntryID, PeID, Timestamp};
use crate::search::{self, ViewerEvent};
use crate::timeline::{self, TimeWindow, Timeline, TimelineLoadError};
use crate::valid_pe::{ValidPeRange, ValidPeRangeTracker};

/// Where a run's logs live and how they were written.
pub trait RunMetadata: Sync {
    fn log_path(&self, pe: PeID) -> PathBuf;
    fn format_version(&self) -> FormatVersion;
    fn num_pes(&self) -> u32;
}

/// Logs named `<base>.<pe>.log`, or `<base>.<pe>.log.gz` when compressed.
#[derive(Debug, Clone)]
pub struct LogDirectory {
    base: PathBuf,
    num_pes: u32,
    version: FormatVersion,
}

impl LogDirectory {
    pub fn new<P: Into<PathBuf>>(base: P, num_pes: u32, version: FormatVersion) -> Self {
        LogDirectory {
            base: base.into(),
            num_pes,
            version,
        }
    }

    /// Counts PEs from the highest-numbered log next to `base`.
    pub fn discover<P: Into<PathBuf>>(base: P, version: FormatVersion) -> Result<Self> {
        let base = base.into();
        let dir = match base.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_owned(),
            _ => PathBuf::from("."),
        };
        let stem = base
            .file_name()
            .map(|x| x.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut num_pes = 0;
        for entry in fs::read_dir(&dir).map_err(|err| Error::io(&dir, err))? {
            let entry = entry.map_err(|err| Error::io(&dir, err))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let pe = name
                .strip_prefix(stem.as_str())
                .and_then(|x| x.strip_prefix('.'))
                .and_then(|x| x.strip_suffix(".gz").or(Some(x)))
                .and_then(|x| x.strip_suffix(".log"))
                .and_then(|x| x.parse::<u32>().ok());
            match pe {
                // PE numbers past the range of a PeID are not logs of this run.
                Some(pe) if i32::try_from(pe).is_err() => {
                    warn!("ignoring {:?}: PE number out of range", name);
                }
                Some(pe) => num_pes = num_pes.max(pe + 1),
                None => {}
            }
        }
        debug!("found logs for {} PEs under {:?}", num_pes, base);
        Ok(LogDirectory::new(base, num_pes, version))
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name = self.base.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    pub fn config_path(&self) -> PathBuf {
        self.with_suffix(".projrc")
    }
}

impl RunMetadata for LogDirectory {
    fn log_path(&self, pe: PeID) -> PathBuf {
        let plain = self.with_suffix(&format!(".{}.log", pe));
        if plain.exists() {
            return plain;
        }
        let compressed = self.with_suffix(&format!(".{}.log.gz", pe));
        if compressed.exists() {
            return compressed;
        }
        plain
    }

    fn format_version(&self) -> FormatVersion {
        self.version
    }

    fn num_pes(&self) -> u32 {
        self.num_pes
    }
}

pub trait ProgressSink: Sync {
    fn progress(&self, done: usize, total: usize);
}

impl ProgressSink for () {
    fn progress(&self, _done: usize, _total: usize) {}
}

/// Shared flag for stopping a batch between PEs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

fn serialize_display<T: fmt::Display, S: Serializer>(
    value: &T,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

#[derive(Debug, Serialize)]
pub struct PeFailure {
    pub pe: PeID,
    #[serde(serialize_with = "serialize_display")]
    pub error: Error,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct RunBounds {
    pub begin: Timestamp,
    pub end: Timestamp,
}

impl RunBounds {
    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.begin, self.end)
    }
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub bounds: RunBounds,
    #[serde(serialize_with = "serialize_display")]
    pub valid_pes: ValidPeRange,
    pub failures: Vec<PeFailure>,
}

#[derive(Debug, Serialize)]
pub struct TimelineBatch {
    // Includes the partial timelines of failed PEs.
    pub timelines: Vec<Timeline>,
    pub failures: Vec<PeFailure>,
    pub skipped: Vec<PeID>,
}

#[derive(Debug, Serialize)]
pub struct HistogramBatch {
    pub histogram: Histogram,
    pub failures: Vec<PeFailure>,
    pub skipped: Vec<PeID>,
}

// Per-PE result of a batch step; `None` when cancelled first.
type Outcome<T> = (PeID, Option<T>);

pub struct LogLoader<M: RunMetadata> {
    metadata: M,
    config: RunConfig,
    scanner: EndTimeScanner,
}

impl<M: RunMetadata> LogLoader<M> {
    pub fn new(metadata: M, config: RunConfig) -> Self {
        let scanner = EndTimeScanner::new(metadata.format_version());
        LogLoader {
            metadata,
            config,
            scanner,
        }
    }

    pub fn with_scanner(mut self, scanner: EndTimeScanner) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn metadata(&self) -> &M {
        &self.metadata
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    fn for_each_pe<T, F>(
        &self,
        pes: &[PeID],
        cancel: &CancelToken,
        progress: &dyn ProgressSink,
        f: F,
    ) -> Vec<Outcome<T>>
    where
        T: Send,
        F: Fn(PeID) -> T + Sync,
    {
        let total = pes.len();
        let done = AtomicUsize::new(0);
        pes.par_iter()
            .map(|&pe| {
                if cancel.is_cancelled() {
                    return (pe, None);
                }
                let result = f(pe);
                progress.progress(done.fetch_add(1, Ordering::Relaxed) + 1, total);
                (pe, Some(result))
            })
            .collect()
    }

    /// Scans every PE's log for its end time. Any PE whose log exists is
    /// valid, even if the scan then fails.
    pub fn scan_bounds(&self, progress: &dyn ProgressSink) -> RunSummary {
        let pes: Vec<_> = (0..self.metadata.num_pes())
            .filter_map(|pe| i32::try_from(pe).ok())
            .map(PeID)
            .collect();
        let global_end_time = self.config.global_end_time;
        if let Some(end) = global_end_time {
            info!("using configured end time {}", end);
        }

        let outcomes = self.for_each_pe(&pes, &CancelToken::new(), progress, |pe| {
            let path = self.metadata.log_path(pe);
            if !path.exists() {
                warn!("{:?} does not exist, ignoring", path);
                return (false, Ok(None));
            }
            if global_end_time.is_some() {
                return (true, Ok(None));
            }
            (true, self.scanner.scan(&path, pe))
        });

        let mut tracker = ValidPeRangeTracker::new();
        let mut end: Option<Timestamp> = global_end_time;
        let mut failures = Vec::new();
        for (pe, outcome) in outcomes {
            let Some((exists, result)) = outcome else {
                continue;
            };
            tracker.observe(pe, exists);
            match result {
                Ok(Some(time)) => end = Some(end.map_or(time, |x| x.max(time))),
                Ok(None) => {}
                Err(error) => {
                    warn!("couldn't read log file for PE {}: {}", pe, error);
                    failures.push(PeFailure { pe, error });
                }
            }
        }

        let begin = Timestamp(0);
        let bounds = RunBounds {
            begin,
            end: end.unwrap_or(begin),
        };
        let valid_pes = tracker.finalize();
        info!(
            "run spans {} to {} on PEs {}",
            bounds.begin, bounds.end, valid_pes
        );
        RunSummary {
            bounds,
            valid_pes,
            failures,
        }
    }

    pub fn timeline(
        &self,
        pe: PeID,
        window: TimeWindow,
    ) -> std::result::Result<Timeline, Box<TimelineLoadError>> {
        let path = self.metadata.log_path(pe);
        timeline::create_timeline(path, pe, self.metadata.format_version(), window)
    }

    pub fn timelines(
        &self,
        pes: &ValidPeRange,
        window: TimeWindow,
        cancel: &CancelToken,
        progress: &dyn ProgressSink,
    ) -> TimelineBatch {
        let pes: Vec<_> = pes.iter().collect();
        let outcomes = self.for_each_pe(&pes, cancel, progress, |pe| self.timeline(pe, window));

        let mut batch = TimelineBatch {
            timelines: Vec::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
        };
        for (pe, outcome) in outcomes {
            match outcome {
                Some(Ok(timeline)) => batch.timelines.push(timeline),
                Some(Err(err)) => {
                    let TimelineLoadError { partial, error } = *err;
                    warn!("timeline for PE {} is incomplete: {}", pe, error);
                    batch.timelines.push(partial);
                    batch.failures.push(PeFailure { pe, error });
                }
                None => batch.skipped.push(pe),
            }
        }
        batch
    }

    pub fn find_nth_begin(&self, pe: PeID, entry: EntryID, n: u64) -> Result<Timestamp> {
        let path = self.metadata.log_path(pe);
        search::find_nth_begin(path, pe, self.metadata.format_version(), entry, n)
    }

    pub fn view(&self, pe: PeID) -> Result<Vec<ViewerEvent>> {
        let path = self.metadata.log_path(pe);
        search::view(path, pe, self.metadata.format_version())
    }

    fn pe_histogram(
        &self,
        pe: PeID,
        window: TimeWindow,
        time_bins: BinSpec,
        msg_bins: BinSpec,
    ) -> Result<Histogram> {
        let path = self.metadata.log_path(pe);
        let mut reader = LogReader::open(path, pe, self.metadata.format_version())?
            .with_policy(UnknownKindPolicy::Skip);
        let mut histogram = Histogram::new(window, time_bins, msg_bins);
        histogram.add_log(&mut reader)?;
        Ok(histogram)
    }

    pub fn histogram(
        &self,
        pes: &ValidPeRange,
        window: TimeWindow,
        time_bins: BinSpec,
        msg_bins: BinSpec,
        cancel: &CancelToken,
        progress: &dyn ProgressSink,
    ) -> HistogramBatch {
        let pes: Vec<_> = pes.iter().collect();
        let outcomes = self.for_each_pe(&pes, cancel, progress, |pe| {
            self.pe_histogram(pe, window, time_bins, msg_bins)
        });

        let mut batch = HistogramBatch {
            histogram: Histogram::new(window, time_bins, msg_bins),
            failures: Vec::new(),
            skipped: Vec::new(),
        };
        for (pe, outcome) in outcomes {
            match outcome {
                Some(Ok(histogram)) => batch.histogram.merge(histogram),
                Some(Err(error)) => {
                    warn!("histogram skips PE {}: {}", pe, error);
                    batch.failures.push(PeFailure { pe, error });
                }
                None => batch.skipped.push(pe),
            }
        }
        batch
    }
}

/// Loads a run from its log base name, reading `<base>.projrc` if present.
pub fn open_run<P: Into<PathBuf>>(
    base: P,
    version: FormatVersion,
) -> Result<LogLoader<LogDirectory>> {
    let directory = LogDirectory::discover(base, version)?;
    let config = RunConfig::load(directory.config_path())?;
    Ok(LogLoader::new(directory, config))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(logs: &[(u32, &str)]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            for (pe, contents) in logs {
                fs::write(dir.path().join(format!("run.{}.log", pe)), contents).unwrap();
            }
            Fixture { dir }
        }

        fn base(&self) -> PathBuf {
            self.dir.path().join("run")
        }

        fn directory(&self, num_pes: u32) -> LogDirectory {
            LogDirectory::new(self.base(), num_pes, FormatVersion(5.0))
        }
    }

    const PE0: &str = "\
PROJECTIONS-RECORD
6 0
2 0 1 10 1 0 8 9 0 0 0
1 0 2 12 2 0 100 12
3 0 1 20 1 0 8
7 100
";

    const PE1: &str = "\
PROJECTIONS-RECORD 1
6 0
2 0 1 10 1 1 8 9 0 0 0
3 0 1 30 1 1 8
7 250
";

    const PE3: &str = "PROJECTIONS-RECORD\n6 0\n14 5 3\n";

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(usize, usize)>>);

    impl ProgressSink for Recorder {
        fn progress(&self, done: usize, total: usize) {
            self.0.lock().unwrap().push((done, total));
        }
    }

    #[test]
    fn test_scan_bounds() {
        let fixture = Fixture::new(&[(0, PE0), (1, PE1), (3, PE3)]);
        let loader = LogLoader::new(fixture.directory(5), RunConfig::default());
        let recorder = Recorder::default();
        let summary = loader.scan_bounds(&recorder);
        assert_eq!(
            summary.bounds,
            RunBounds {
                begin: Timestamp(0),
                end: Timestamp(250)
            }
        );
        assert_eq!(summary.valid_pes.to_string(), "0-1,3");
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].pe, PeID(3));
        assert!(matches!(summary.failures[0].error, Error::TruncatedTrace(_)));

        let mut calls = recorder.0.into_inner().unwrap();
        calls.sort();
        assert_eq!(calls, vec![(1, 5), (2, 5), (3, 5), (4, 5), (5, 5)]);
    }

    #[test]
    fn test_configured_end_time() {
        let fixture = Fixture::new(&[(0, PE0), (1, PE3)]);
        let config = RunConfig {
            global_end_time: Some(Timestamp(999)),
            ..RunConfig::default()
        };
        let loader = LogLoader::new(fixture.directory(2), config);
        let summary = loader.scan_bounds(&());
        assert_eq!(summary.bounds.end, Timestamp(999));
        assert_eq!(summary.valid_pes.to_string(), "0-1");
        assert!(summary.failures.is_empty());
    }

    #[test]
    fn test_discover_and_gzip() {
        use std::io::Write;

        use flate2::Compression;
        use flate2::write::GzEncoder;

        let fixture = Fixture::new(&[(0, PE0)]);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(PE1.as_bytes()).unwrap();
        fs::write(
            fixture.dir.path().join("run.1.log.gz"),
            encoder.finish().unwrap(),
        )
        .unwrap();
        fs::write(fixture.dir.path().join("run.projrc"), "RC_OUTLIER_FILTERED true\n").unwrap();
        fs::write(fixture.dir.path().join("other.7.log"), PE0).unwrap();
        fs::write(fixture.dir.path().join("run.4294967295.log"), PE0).unwrap();
        fs::write(fixture.dir.path().join("run.2147483648.log"), PE0).unwrap();

        let loader = open_run(fixture.base(), FormatVersion(5.0)).unwrap();
        assert_eq!(loader.metadata().num_pes(), 2);
        assert!(loader.config().outlier_filtered);
        assert!(
            loader
                .metadata()
                .log_path(PeID(1))
                .to_string_lossy()
                .ends_with("run.1.log.gz")
        );

        let summary = loader.scan_bounds(&());
        assert_eq!(summary.bounds.end, Timestamp(250));
        assert_eq!(summary.valid_pes.to_string(), "0-1");
    }

    #[test]
    fn test_timelines() {
        let fixture = Fixture::new(&[(0, PE0), (1, PE1), (2, "PROJECTIONS-RECORD\n2 0 1 x\n")]);
        let loader = LogLoader::new(fixture.directory(3), RunConfig::default());
        let pes: ValidPeRange = "0-2".parse().unwrap();
        let window = TimeWindow::new(Timestamp(0), Timestamp(300));
        let batch = loader.timelines(&pes, window, &CancelToken::new(), &());

        assert_eq!(batch.timelines.len(), 3);
        assert_eq!(batch.timelines[0].spans.len(), 1);
        assert_eq!(batch.timelines[0].spans[0].messages.len(), 1);
        // PE 1 is delta encoded.
        assert_eq!(batch.timelines[1].spans[0].start, Timestamp(10));
        assert_eq!(batch.timelines[1].spans[0].end, Timestamp(40));
        assert!(batch.timelines[2].spans.is_empty());
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].pe, PeID(2));
        assert!(batch.skipped.is_empty());
    }

    #[test]
    fn test_cancelled_batch() {
        let fixture = Fixture::new(&[(0, PE0), (1, PE1)]);
        let loader = LogLoader::new(fixture.directory(2), RunConfig::default());
        let cancel = CancelToken::new();
        cancel.cancel();
        let pes: ValidPeRange = "0-1".parse().unwrap();
        let window = TimeWindow::new(Timestamp(0), Timestamp(300));

        let batch = loader.timelines(&pes, window, &cancel, &());
        assert!(batch.timelines.is_empty());
        assert_eq!(batch.skipped, vec![PeID(0), PeID(1)]);

        let batch = loader.histogram(
            &pes,
            window,
            BinSpec::default_time(),
            BinSpec::default_message(),
            &cancel,
            &(),
        );
        assert_eq!(batch.skipped.len(), 2);
        assert!(batch.histogram.entries.is_empty());
    }

    #[test]
    fn test_search_and_view() {
        let fixture = Fixture::new(&[(0, PE0)]);
        let loader = LogLoader::new(fixture.directory(1), RunConfig::default());
        assert_eq!(
            loader.find_nth_begin(PeID(0), EntryID(1), 0).unwrap(),
            Timestamp(10)
        );
        assert!(matches!(
            loader.find_nth_begin(PeID(0), EntryID(1), 1),
            Err(Error::EntryNotFound { .. })
        ));
        assert_eq!(loader.view(PeID(0)).unwrap().len(), 3);
        assert!(matches!(loader.view(PeID(4)), Err(Error::MissingFile(_))));
    }

    #[test]
    fn test_summary_json() {
        let fixture = Fixture::new(&[(0, PE0), (2, PE3)]);
        let loader = LogLoader::new(fixture.directory(3), RunConfig::default());
        let summary = loader.scan_bounds(&());
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["valid_pes"], "0,2");
        assert_eq!(json["bounds"]["end"], 100);
        assert_eq!(json["failures"][0]["pe"], 2);
        assert!(json["failures"][0]["error"].as_str().unwrap().contains("End Computation"));
    }
}
