use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::info;

use projections_log::decode::FormatVersion;
use projections_log::dump::{dump_lines, dump_pretty};
use projections_log::histogram::BinSpec;
use projections_log::loader::{CancelToken, LogDirectory, LogLoader, ProgressSink, open_run};
use projections_log::record::{EntryID, PeID, Timestamp};
use projections_log::timeline::TimeWindow;
use projections_log::valid_pe::ValidPeRange;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(
        required = true,
        help = "log base name: run/hello for run/hello.0.log, run/hello.1.log, ..."
    )]
    base: PathBuf,

    #[arg(
        long = "format-version",
        default_value_t = 5.0,
        help = "trace format version the run was written with"
    )]
    format_version: f64,

    #[arg(short, long, help = "print debug logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan every log for the run's time bounds and the readable PEs
    Bounds,

    /// Rebuild the timelines of a set of PEs
    Timeline {
        #[arg(long, help = "PEs to load, e.g. 0-3,7 (default: all readable PEs)")]
        pes: Option<ValidPeRange>,

        #[arg(long, help = "window start in microseconds (default: run start)")]
        begin: Option<i64>,

        #[arg(long, help = "window end in microseconds (default: run end)")]
        end: Option<i64>,
    },

    /// Find when an entry method begins for the nth time on a PE
    Search {
        pe: i32,

        entry: i32,

        #[arg(default_value_t = 0, help = "zero-based occurrence")]
        n: u64,
    },

    /// List the events of one PE, one JSON object per line
    View { pe: i32 },

    /// Bin entry method execution times and message sizes
    Histogram {
        #[arg(long, help = "PEs to load, e.g. 0-3,7 (default: all readable PEs)")]
        pes: Option<ValidPeRange>,

        #[arg(long, help = "window start in microseconds (default: run start)")]
        begin: Option<i64>,

        #[arg(long, help = "window end in microseconds (default: run end)")]
        end: Option<i64>,

        #[arg(long = "time-bins", default_value_t = 100)]
        time_bins: usize,

        #[arg(long = "time-bin-size", default_value_t = 1000, help = "in microseconds")]
        time_bin_size: i64,

        #[arg(long = "time-min", default_value_t = 0, help = "shortest execution counted")]
        time_min: i64,

        #[arg(long = "msg-bins", default_value_t = 200)]
        msg_bins: usize,

        #[arg(long = "msg-bin-size", default_value_t = 100, help = "in bytes")]
        msg_bin_size: i64,

        #[arg(long = "msg-min", default_value_t = 0, help = "smallest message counted")]
        msg_min: i64,
    },
}

struct LogProgress;

impl ProgressSink for LogProgress {
    fn progress(&self, done: usize, total: usize) {
        info!("{} of {} PEs done", done, total);
    }
}

fn select(
    loader: &LogLoader<LogDirectory>,
    pes: Option<ValidPeRange>,
    begin: Option<i64>,
    end: Option<i64>,
) -> (ValidPeRange, TimeWindow) {
    // Explicit PEs and window skip the tail scan entirely.
    if let (Some(pes), Some(begin), Some(end)) = (&pes, begin, end) {
        return (pes.clone(), TimeWindow::new(Timestamp(begin), Timestamp(end)));
    }
    let summary = loader.scan_bounds(&LogProgress);
    let window = TimeWindow::new(
        begin.map_or(summary.bounds.begin, Timestamp),
        end.map_or(summary.bounds.end, Timestamp),
    );
    (pes.unwrap_or(summary.valid_pes), window)
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let loader = open_run(&cli.base, FormatVersion(cli.format_version))?;

    match cli.command {
        Command::Bounds => {
            dump_pretty(&loader.scan_bounds(&LogProgress))?;
        }
        Command::Timeline { pes, begin, end } => {
            let (pes, window) = select(&loader, pes, begin, end);
            let batch = loader.timelines(&pes, window, &CancelToken::new(), &LogProgress);
            dump_pretty(&batch)?;
        }
        Command::Search { pe, entry, n } => {
            let time = loader.find_nth_begin(PeID(pe), EntryID(entry), n)?;
            println!("{}", time);
        }
        Command::View { pe } => {
            dump_lines(&loader.view(PeID(pe))?)?;
        }
        Command::Histogram {
            pes,
            begin,
            end,
            time_bins,
            time_bin_size,
            time_min,
            msg_bins,
            msg_bin_size,
            msg_min,
        } => {
            let (pes, window) = select(&loader, pes, begin, end);
            let batch = loader.histogram(
                &pes,
                window,
                BinSpec::new(time_bins, time_bin_size, time_min),
                BinSpec::new(msg_bins, msg_bin_size, msg_min),
                &CancelToken::new(),
                &LogProgress,
            );
            dump_pretty(&batch)?;
        }
    }

    Ok(())
}
