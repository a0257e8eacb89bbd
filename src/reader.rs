use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use log::{debug, warn};

use crate::decode::{DecodeError, DeltaCodingState, FormatVersion, LogHeader, decode};
use crate::error::{Error, Result};
use crate::record::{LogRecord, PeID};
use crate::tokenizer::{RecordTokenizer, TokenError};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// What to do with a record whose tag the decoder does not know.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnknownKindPolicy {
    /// Drop the rest of the line and keep going.
    Skip,
    Abort,
}

pub(crate) fn open_input(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(Error::MissingFile(path.to_owned()));
        }
        Err(err) => return Err(Error::io(path, err)),
    };
    let mut input = BufReader::new(file);
    let is_gzip = input
        .fill_buf()
        .map_err(|err| Error::io(path, err))?
        .starts_with(&GZIP_MAGIC);
    if is_gzip {
        Ok(Box::new(BufReader::new(GzDecoder::new(input))))
    } else {
        Ok(Box::new(input))
    }
}

pub(crate) fn is_gzip(path: &Path) -> Result<bool> {
    let file = File::open(path).map_err(|err| Error::io(path, err))?;
    let mut input = BufReader::new(file);
    let buf = input.fill_buf().map_err(|err| Error::io(path, err))?;
    Ok(buf.starts_with(&GZIP_MAGIC))
}

pub(crate) fn trim_line_ending(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

/// Sequential record stream over one PE's log file. The file is closed when
/// the reader is dropped.
pub struct LogReader {
    path: PathBuf,
    pe: PeID,
    version: FormatVersion,
    header: LogHeader,
    state: DeltaCodingState,
    policy: UnknownKindPolicy,
    input: Box<dyn BufRead + Send>,
    line: String,
    line_number: u64,
}

impl LogReader {
    pub fn open<P: AsRef<Path>>(path: P, pe: PeID, version: FormatVersion) -> Result<Self> {
        let path = path.as_ref();
        let input = open_input(path)?;
        LogReader::from_input(path, pe, version, input)
    }

    /// Wraps an already-open stream positioned at the header line.
    pub fn from_input<P: AsRef<Path>>(
        path: P,
        pe: PeID,
        version: FormatVersion,
        mut input: Box<dyn BufRead + Send>,
    ) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let mut line = String::new();
        input
            .read_line(&mut line)
            .map_err(|err| Error::io(&path, err))?;
        let header = LogHeader::parse(&line);
        let state = header.delta_state();
        debug!(
            "opened {:?} (PE {}, delta encoded: {})",
            path, pe, header.is_delta_encoded
        );
        Ok(LogReader {
            path,
            pe,
            version,
            header,
            state,
            policy: UnknownKindPolicy::Abort,
            input,
            line: String::new(),
            line_number: 1,
        })
    }

    pub fn with_policy(mut self, policy: UnknownKindPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pe(&self) -> PeID {
        self.pe
    }

    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    pub fn delta_state(&self) -> &DeltaCodingState {
        &self.state
    }

    /// Next decoded record, or `None` once the file is exhausted. A final
    /// line cut off mid-record also ends the stream.
    pub fn next_record(&mut self) -> Result<Option<LogRecord>> {
        loop {
            self.line.clear();
            let n = self
                .input
                .read_line(&mut self.line)
                .map_err(|err| Error::io(&self.path, err))?;
            if n == 0 {
                return Ok(None);
            }
            self.line_number += 1;
            let complete = self.line.ends_with('\n');

            let mut tokens = RecordTokenizer::new(trim_line_ending(&self.line));
            if tokens.is_empty() {
                continue;
            }
            let result = tokens
                .next_i64()
                .map_err(DecodeError::from)
                .and_then(|tag| {
                    decode(tag, &mut tokens, self.version, &mut self.state, self.pe)
                });
            match result {
                Ok(record) => return Ok(Some(record)),
                Err(DecodeError::Token(TokenError::EndOfInput)) if !complete => {
                    warn!(
                        "{:?} ends in a partial record at line {}",
                        self.path, self.line_number
                    );
                    return Ok(None);
                }
                Err(err @ (DecodeError::Token(_) | DecodeError::TimeOverflow { .. })) => {
                    return Err(Error::MalformedRecord {
                        path: self.path.clone(),
                        line: self.line_number,
                        reason: err.to_string(),
                    });
                }
                Err(DecodeError::UnsupportedEventKind(tag)) => match self.policy {
                    UnknownKindPolicy::Skip => {
                        debug!(
                            "skipping unsupported event kind {} at {:?}:{}",
                            tag, self.path, self.line_number
                        );
                    }
                    UnknownKindPolicy::Abort => {
                        return Err(Error::UnsupportedEventKind {
                            path: self.path.clone(),
                            line: self.line_number,
                            tag,
                        });
                    }
                },
            }
        }
    }
}

impl Iterator for LogReader {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}
