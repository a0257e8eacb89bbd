use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use log::{debug, warn};

use crate::decode::FormatVersion;
use crate::error::{Error, Result};
use crate::reader::{LogReader, UnknownKindPolicy, is_gzip, trim_line_ending};
use crate::record::{EventKind, PeID, Timestamp};
use crate::tokenizer::{RecordTokenizer, TokenError};

// Enough for a few records at the end of a typical log.
const DEFAULT_TAIL_BYTES: u64 = 80 * 3;

/// Finds the End Computation timestamp of a PE's log by reading from the
/// tail of the file. The tail window doubles until the record is found or
/// the window covers the whole file.
#[derive(Debug, Copy, Clone)]
pub struct EndTimeScanner {
    version: FormatVersion,
    tail_bytes: u64,
}

impl EndTimeScanner {
    pub fn new(version: FormatVersion) -> Self {
        EndTimeScanner {
            version,
            tail_bytes: DEFAULT_TAIL_BYTES,
        }
    }

    pub fn with_tail_bytes(mut self, tail_bytes: u64) -> Self {
        assert!(tail_bytes > 0);
        self.tail_bytes = tail_bytes;
        self
    }

    /// `Ok(None)` when the file does not exist, `TruncatedTrace` when it has
    /// no End Computation record.
    pub fn scan<P: AsRef<Path>>(&self, path: P, pe: PeID) -> Result<Option<Timestamp>> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!("{:?} does not exist, ignoring", path);
                return Ok(None);
            }
            Err(err) => return Err(Error::io(path, err)),
        };

        if is_gzip(path)? {
            return self.scan_stream(path, pe).map(Some);
        }

        let len = file.metadata().map_err(|err| Error::io(path, err))?.len();
        let mut input = BufReader::new(file);
        let mut back = self.tail_bytes;
        loop {
            let offset = len.saturating_sub(back);
            if let Some(time) = scan_from(&mut input, path, offset)? {
                debug!("PE {} ends at {} (tail of {} bytes)", pe, time, len - offset);
                return Ok(Some(time));
            }
            if offset == 0 {
                return Err(Error::TruncatedTrace(path.to_owned()));
            }
            back = back.saturating_mul(2);
        }
    }

    // Compressed logs cannot be entered from the end.
    fn scan_stream(&self, path: &Path, pe: PeID) -> Result<Timestamp> {
        let reader = LogReader::open(path, pe, self.version)?.with_policy(UnknownKindPolicy::Skip);
        for record in reader {
            let record = record?;
            if record.kind() == EventKind::EndComputation {
                return Ok(record.time);
            }
        }
        Err(Error::TruncatedTrace(path.to_owned()))
    }
}

fn scan_from<R: BufRead + Seek>(
    input: &mut R,
    path: &Path,
    offset: u64,
) -> Result<Option<Timestamp>> {
    let io_err = |err| Error::io(path, err);
    input.seek(SeekFrom::Start(offset)).map_err(io_err)?;

    // Skip ahead to the next record boundary. At the start of the file this
    // skips the header instead.
    let mut buf = Vec::new();
    input.read_until(b'\n', &mut buf).map_err(io_err)?;

    let mut position = offset + buf.len() as u64;
    loop {
        buf.clear();
        let n = input.read_until(b'\n', &mut buf).map_err(io_err)?;
        if n == 0 {
            return Ok(None);
        }
        let complete = buf.ends_with(b"\n");
        let text = String::from_utf8_lossy(&buf);
        let mut tokens = RecordTokenizer::new(trim_line_ending(&text));
        let malformed = |err: TokenError| Error::MalformedRecord {
            path: path.to_owned(),
            line: 0,
            reason: format!("near byte {}: {}", position, err),
        };
        if !tokens.is_empty() {
            let tag = tokens.next_i64().map_err(malformed)?;
            if tag == EventKind::EndComputation as i64 {
                match tokens.next_i64() {
                    Ok(time) => return Ok(Some(Timestamp(time))),
                    Err(TokenError::EndOfInput) if !complete => return Ok(None),
                    Err(err) => return Err(malformed(err)),
                }
            }
        }
        position += n as u64;
    }
}
