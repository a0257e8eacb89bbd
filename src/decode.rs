use std::fmt;

use serde::Serialize;

use crate::record::{
    EntryID, Event, EventID, EventKind, LogRecord, MessageInfo, NO_MESSAGE_LEN, ObjectID, PeID,
    Timestamp,
};
use crate::tokenizer::{RecordTokenizer, TokenError};

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    Token(TokenError),
    UnsupportedEventKind(i64),
    // A delta that pushes the running time past the range of a timestamp.
    TimeOverflow { previous: Timestamp, delta: i64 },
}

impl From<TokenError> for DecodeError {
    fn from(err: TokenError) -> Self {
        DecodeError::Token(err)
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Token(err) => write!(f, "{}", err),
            DecodeError::UnsupportedEventKind(tag) => write!(f, "unsupported event kind {}", tag),
            DecodeError::TimeOverflow { previous, delta } => {
                write!(f, "time delta {} overflows running time {}", delta, previous)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, DecodeError>;

/// Trace format version of a run, as declared in its run metadata.
#[derive(Debug, Copy, Clone, PartialEq, PartialOrd, Serialize)]
pub struct FormatVersion(pub f64);

impl FormatVersion {
    pub fn has_message_len(self) -> bool {
        self.0 > 1.0
    }
    pub fn has_recv_time(self) -> bool {
        self.0 >= 4.0
    }
    pub fn has_send_time(self) -> bool {
        self.0 >= 5.0
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        FormatVersion(5.0)
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}", self.0)
    }
}

/// Timestamp state of one open log file. Created from the file's header
/// every time the file is opened, never shared between files.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct DeltaCodingState {
    previous_time: Timestamp,
    is_delta_encoded: bool,
}

impl DeltaCodingState {
    pub fn new(is_delta_encoded: bool) -> Self {
        DeltaCodingState {
            previous_time: Timestamp(0),
            is_delta_encoded,
        }
    }

    pub fn is_delta_encoded(&self) -> bool {
        self.is_delta_encoded
    }

    pub fn previous_time(&self) -> Timestamp {
        self.previous_time
    }

    fn advance(&mut self, value: i64) -> Result<()> {
        if self.is_delta_encoded {
            let overflow = DecodeError::TimeOverflow {
                previous: self.previous_time,
                delta: value,
            };
            let time = self.previous_time.0.checked_add(value).ok_or(overflow)?;
            self.previous_time = Timestamp(time);
        } else {
            self.previous_time = Timestamp(value);
        }
        Ok(())
    }

    fn time(&mut self, value: i64) -> Result<Timestamp> {
        self.advance(value)?;
        Ok(self.previous_time)
    }

    // Computation records always hold absolute times. Begin Computation
    // still feeds the running time of a delta-encoded file; End Computation
    // does not touch it.
    fn begin_computation_time(&mut self, value: i64) -> Result<Timestamp> {
        self.advance(value)?;
        Ok(Timestamp(value))
    }
}

/// First line of every log file.
#[derive(Debug, Clone, PartialEq)]
pub struct LogHeader {
    pub raw: String,
    pub is_delta_encoded: bool,
}

impl LogHeader {
    pub fn parse(line: &str) -> Self {
        let tokens = RecordTokenizer::new(line);
        // Delta-encoded files carry an extra token after the format marker.
        let is_delta_encoded = tokens.count_remaining() > 1;
        LogHeader {
            raw: line.trim_end().to_owned(),
            is_delta_encoded,
        }
    }

    pub fn delta_state(&self) -> DeltaCodingState {
        DeltaCodingState::new(self.is_delta_encoded)
    }
}

fn parse_message_info(
    tokens: &mut RecordTokenizer,
    state: &mut DeltaCodingState,
    version: FormatVersion,
) -> Result<(MessageInfo, Timestamp, PeID)> {
    let message_type = tokens.next_i32()?;
    let entry = EntryID(tokens.next_i32()?);
    let time = state.time(tokens.next_i64()?)?;
    let event_id = EventID(tokens.next_i32()?);
    let pe = PeID(tokens.next_i32()?);
    let message_len = if version.has_message_len() {
        tokens.next_i32()?
    } else {
        NO_MESSAGE_LEN
    };
    let msg = MessageInfo {
        message_type,
        entry,
        event_id,
        message_len,
    };
    Ok((msg, time, pe))
}

// Multi-destination creations always log the message length and send time.
fn parse_multi_message_info(
    tokens: &mut RecordTokenizer,
    state: &mut DeltaCodingState,
) -> Result<(MessageInfo, Timestamp, PeID, Timestamp)> {
    let message_type = tokens.next_i32()?;
    let entry = EntryID(tokens.next_i32()?);
    let time = state.time(tokens.next_i64()?)?;
    let event_id = EventID(tokens.next_i32()?);
    let pe = PeID(tokens.next_i32()?);
    let message_len = tokens.next_i32()?;
    let send_time = Timestamp(tokens.next_i64()?);
    let msg = MessageInfo {
        message_type,
        entry,
        event_id,
        message_len,
    };
    Ok((msg, time, pe, send_time))
}

fn parse_typed_event(
    tokens: &mut RecordTokenizer,
    state: &mut DeltaCodingState,
) -> Result<(i32, Timestamp, EventID, PeID)> {
    let message_type = tokens.next_i32()?;
    let time = state.time(tokens.next_i64()?)?;
    let event_id = EventID(tokens.next_i32()?);
    let pe = PeID(tokens.next_i32()?);
    Ok((message_type, time, event_id, pe))
}

fn parse_marker(
    tokens: &mut RecordTokenizer,
    state: &mut DeltaCodingState,
) -> Result<(Timestamp, PeID)> {
    let time = state.time(tokens.next_i64()?)?;
    let pe = PeID(tokens.next_i32()?);
    Ok((time, pe))
}

fn parse_table_op(
    tokens: &mut RecordTokenizer,
    state: &mut DeltaCodingState,
) -> Result<(i32, Timestamp, PeID)> {
    let message_type = tokens.next_i32()?;
    // Lookup time; superseded by the time that follows it.
    tokens.next_i64()?;
    let time = state.time(tokens.next_i64()?)?;
    let pe = PeID(tokens.next_i32()?);
    Ok((message_type, time, pe))
}

/// Decodes the body of one record whose tag has already been consumed.
/// `file_pe` stands in for the PE of records that do not log one.
pub fn decode(
    tag: i64,
    tokens: &mut RecordTokenizer,
    version: FormatVersion,
    state: &mut DeltaCodingState,
    file_pe: PeID,
) -> Result<LogRecord> {
    let kind = i32::try_from(tag)
        .ok()
        .and_then(|x| EventKind::try_from(x).ok())
        .ok_or(DecodeError::UnsupportedEventKind(tag))?;

    let (time, pe, event) = match kind {
        EventKind::BeginComputation => {
            let time = state.begin_computation_time(tokens.next_i64()?)?;
            (time, file_pe, Event::BeginComputation)
        }
        EventKind::EndComputation => {
            let time = Timestamp(tokens.next_i64()?);
            (time, file_pe, Event::EndComputation)
        }
        EventKind::BeginProcessing => {
            let (msg, time, pe) = parse_message_info(tokens, state, version)?;
            let (recv_time, object_id) = if version.has_recv_time() {
                let recv_time = Timestamp(tokens.next_i64()?);
                let id = [tokens.next_i32()?, tokens.next_i32()?, tokens.next_i32()?];
                (Some(recv_time), Some(ObjectID(id)))
            } else {
                (None, None)
            };
            let event = Event::BeginProcessing {
                msg,
                recv_time,
                object_id,
            };
            (time, pe, event)
        }
        EventKind::EndProcessing => {
            let (msg, time, pe) = parse_message_info(tokens, state, version)?;
            (time, pe, Event::EndProcessing { msg })
        }
        EventKind::Creation => {
            let (msg, time, pe) = parse_message_info(tokens, state, version)?;
            let send_time = if version.has_send_time() {
                Some(Timestamp(tokens.next_i64()?))
            } else {
                None
            };
            (time, pe, Event::Creation { msg, send_time })
        }
        EventKind::CreationBroadcast => {
            let (msg, time, pe, send_time) = parse_multi_message_info(tokens, state)?;
            let num_pes = tokens.next_u32()?;
            let event = Event::CreationBroadcast {
                msg,
                send_time,
                num_pes,
            };
            (time, pe, event)
        }
        EventKind::CreationMulticast => {
            let (msg, time, pe, send_time) = parse_multi_message_info(tokens, state)?;
            let n = tokens.next_u32()?;
            let dest_pes = (0..n)
                .map(|_| tokens.next_i32().map(PeID))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let event = Event::CreationMulticast {
                msg,
                send_time,
                dest_pes,
            };
            (time, pe, event)
        }
        EventKind::Enqueue | EventKind::Dequeue => {
            let (message_type, time, event_id, pe) = parse_typed_event(tokens, state)?;
            let event = if kind == EventKind::Enqueue {
                Event::Enqueue {
                    message_type,
                    event_id,
                }
            } else {
                Event::Dequeue {
                    message_type,
                    event_id,
                }
            };
            (time, pe, event)
        }
        EventKind::UserEvent | EventKind::UserEventPair => {
            let (user_type, time, event_id, pe) = parse_typed_event(tokens, state)?;
            let event = if kind == EventKind::UserEvent {
                Event::UserEvent {
                    user_type,
                    event_id,
                }
            } else {
                Event::UserEventPair {
                    user_type,
                    event_id,
                }
            };
            (time, pe, event)
        }
        EventKind::BeginIdle
        | EventKind::EndIdle
        | EventKind::BeginPack
        | EventKind::EndPack
        | EventKind::BeginUnpack
        | EventKind::EndUnpack => {
            let (time, pe) = parse_marker(tokens, state)?;
            let event = match kind {
                EventKind::BeginIdle => Event::BeginIdle,
                EventKind::EndIdle => Event::EndIdle,
                EventKind::BeginPack => Event::BeginPack,
                EventKind::EndPack => Event::EndPack,
                EventKind::BeginUnpack => Event::BeginUnpack,
                _ => Event::EndUnpack,
            };
            (time, pe, event)
        }
        EventKind::BeginInterrupt | EventKind::EndInterrupt => {
            let time = state.time(tokens.next_i64()?)?;
            let event_id = EventID(tokens.next_i32()?);
            let pe = PeID(tokens.next_i32()?);
            let event = if kind == EventKind::BeginInterrupt {
                Event::BeginInterrupt { event_id }
            } else {
                Event::EndInterrupt { event_id }
            };
            (time, pe, event)
        }
        EventKind::Insert | EventKind::Find | EventKind::Delete => {
            let (message_type, time, pe) = parse_table_op(tokens, state)?;
            let event = match kind {
                EventKind::Insert => Event::Insert { message_type },
                EventKind::Find => Event::Find { message_type },
                _ => Event::Delete { message_type },
            };
            (time, pe, event)
        }
    };
    Ok(LogRecord { time, pe, event })
}

/// Decodes one complete line, tag included.
pub fn decode_line(
    line: &str,
    version: FormatVersion,
    state: &mut DeltaCodingState,
    file_pe: PeID,
) -> Result<LogRecord> {
    let mut tokens = RecordTokenizer::new(line);
    let tag = tokens.next_i64()?;
    decode(tag, &mut tokens, version, state, file_pe)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PE: PeID = PeID(0);

    fn absolute() -> DeltaCodingState {
        DeltaCodingState::new(false)
    }

    fn delta() -> DeltaCodingState {
        DeltaCodingState::new(true)
    }

    #[test]
    fn test_header() {
        assert!(!LogHeader::parse("PROJECTIONS-RECORD").is_delta_encoded);
        assert!(LogHeader::parse("PROJECTIONS-RECORD DELTA").is_delta_encoded);
        assert!(LogHeader::parse("5.0 1\n").is_delta_encoded);
        assert_eq!(LogHeader::parse("5.0 1\n").raw, "5.0 1");
    }

    #[test]
    fn test_begin_processing_versions() {
        let line = "2 1 3 100 9 0 64 90 4 5 6";
        let v1 = decode_line("2 1 3 100 9 0", FormatVersion(1.0), &mut absolute(), PE).unwrap();
        assert_eq!(v1.message().unwrap().message_len, NO_MESSAGE_LEN);
        assert_eq!(v1.time, Timestamp(100));

        let v2 = decode_line("2 1 3 100 9 0 64", FormatVersion(2.0), &mut absolute(), PE).unwrap();
        assert_eq!(v2.message().unwrap().message_len, 64);
        match v2.event {
            Event::BeginProcessing {
                recv_time,
                object_id,
                ..
            } => {
                assert_eq!(recv_time, None);
                assert_eq!(object_id, None);
            }
            _ => panic!("wrong event"),
        }

        let v4 = decode_line(line, FormatVersion(4.0), &mut absolute(), PE).unwrap();
        assert_eq!(
            v4.event,
            Event::BeginProcessing {
                msg: MessageInfo {
                    message_type: 1,
                    entry: EntryID(3),
                    event_id: EventID(9),
                    message_len: 64,
                },
                recv_time: Some(Timestamp(90)),
                object_id: Some(ObjectID([4, 5, 6])),
            }
        );
    }

    #[test]
    fn test_send_time_gating() {
        let line = "1 0 3 100 9 0 64 95";
        let v5 = decode_line(line, FormatVersion(5.0), &mut absolute(), PE).unwrap();
        match v5.event {
            Event::Creation { send_time, .. } => assert_eq!(send_time, Some(Timestamp(95))),
            _ => panic!("wrong event"),
        }
        let v49 = decode_line("1 0 3 100 9 0 64", FormatVersion(4.9), &mut absolute(), PE).unwrap();
        match v49.event {
            Event::Creation { send_time, .. } => assert_eq!(send_time, None),
            _ => panic!("wrong event"),
        }

        // End Processing shares the layout but never carries a send time.
        let end = decode_line("3 0 3 100 9 0 64", FormatVersion(5.0), &mut absolute(), PE).unwrap();
        assert_eq!(end.kind(), EventKind::EndProcessing);
    }

    // One line per delta-coded record kind, with the time as a placeholder.
    const DELTA_LINES: &[&str] = &[
        "1 0 3 {} 9 0 64 95",
        "2 0 3 {} 9 0 64 90 4 5 6",
        "3 0 3 {} 9 0 64",
        "4 2 {} 11 0",
        "5 2 {} 11 0",
        "8 {} 12 0",
        "9 {} 12 0",
        "13 7 {} 1 0",
        "14 {} 0",
        "15 {} 0",
        "16 {} 0",
        "17 {} 0",
        "18 {} 0",
        "19 {} 0",
        "20 0 4 {} 2 1 32 8 16",
        "21 0 4 {} 2 1 32 8 2 5 6",
        "30 2 999 {} 1",
        "31 2 999 {} 1",
        "32 2 999 {} 1",
        "100 7 {} 1 0",
    ];

    #[test]
    fn test_delta_round_trip() {
        let mut previous = 0;
        let mut state = delta();
        for (i, template) in DELTA_LINES.iter().enumerate() {
            // Repeat some times to cover zero deltas.
            let time = 5 + 17 * (i as i64 / 2) * (i as i64 % 3);
            let line = template.replace("{}", &(time - previous).to_string());
            previous = time;
            let record = decode_line(&line, FormatVersion(5.0), &mut state, PE).unwrap();
            assert_eq!(record.time, Timestamp(time), "{}", line);
        }
        assert_eq!(state.previous_time(), Timestamp(previous));

        // The same lines with absolute times decode to the same records.
        let mut previous = 0;
        let mut delta_state = delta();
        let mut absolute_state = absolute();
        for (i, template) in DELTA_LINES.iter().enumerate() {
            let time = 1000 - 40 * i as i64;
            let delta_line = template.replace("{}", &(time - previous).to_string());
            let absolute_line = template.replace("{}", &time.to_string());
            previous = time;
            assert_eq!(
                decode_line(&delta_line, FormatVersion(5.0), &mut delta_state, PE),
                decode_line(&absolute_line, FormatVersion(5.0), &mut absolute_state, PE),
            );
        }
    }

    #[test]
    fn test_delta_overflow() {
        let mut state = delta();
        let line = "14 9223372036854775000 0";
        decode_line(line, FormatVersion(5.0), &mut state, PE).unwrap();
        let result = decode_line(line, FormatVersion(5.0), &mut state, PE);
        assert_eq!(
            result,
            Err(DecodeError::TimeOverflow {
                previous: Timestamp(9223372036854775000),
                delta: 9223372036854775000,
            })
        );
        // The running time is left untouched.
        assert_eq!(state.previous_time(), Timestamp(9223372036854775000));

        let mut state = delta();
        decode_line("6 9223372036854775000", FormatVersion(5.0), &mut state, PE).unwrap();
        assert!(decode_line("6 9223372036854775000", FormatVersion(5.0), &mut state, PE).is_err());
    }

    #[test]
    fn test_computation_is_absolute() {
        let mut state = delta();
        let begin = decode_line("6 500", FormatVersion(5.0), &mut state, PeID(3)).unwrap();
        assert_eq!(begin.time, Timestamp(500));
        assert_eq!(begin.pe, PeID(3));
        assert_eq!(state.previous_time(), Timestamp(500));

        let idle = decode_line("14 20 3", FormatVersion(5.0), &mut state, PeID(3)).unwrap();
        assert_eq!(idle.time, Timestamp(520));

        let end = decode_line("7 9000", FormatVersion(5.0), &mut state, PeID(3)).unwrap();
        assert_eq!(end.time, Timestamp(9000));
        assert_eq!(state.previous_time(), Timestamp(520));

        let mut state = absolute();
        let end = decode_line("7 9000", FormatVersion(5.0), &mut state, PE).unwrap();
        assert_eq!(end.time, Timestamp(9000));
    }

    #[test]
    fn test_absolute_times_still_tracked() {
        let mut state = absolute();
        decode_line("14 120 0", FormatVersion(5.0), &mut state, PE).unwrap();
        assert_eq!(state.previous_time(), Timestamp(120));
        assert!(!state.is_delta_encoded());
    }

    #[test]
    fn test_multicast() {
        let record =
            decode_line("21 0 4 10 2 1 32 8 3 5 6 7", FormatVersion(5.0), &mut absolute(), PE)
                .unwrap();
        assert_eq!(
            record.event,
            Event::CreationMulticast {
                msg: MessageInfo {
                    message_type: 0,
                    entry: EntryID(4),
                    event_id: EventID(2),
                    message_len: 32,
                },
                send_time: Timestamp(8),
                dest_pes: vec![PeID(5), PeID(6), PeID(7)],
            }
        );
        assert_eq!(record.pe, PeID(1));

        let empty =
            decode_line("21 0 4 10 2 1 32 8 0", FormatVersion(5.0), &mut absolute(), PE).unwrap();
        match empty.event {
            Event::CreationMulticast { dest_pes, .. } => assert!(dest_pes.is_empty()),
            _ => panic!("wrong event"),
        }

        let truncated = decode_line("21 0 4 10 2 1 32 8 3 5", FormatVersion(5.0), &mut absolute(), PE);
        assert_eq!(truncated, Err(DecodeError::Token(TokenError::EndOfInput)));
    }

    #[test]
    fn test_broadcast() {
        let record =
            decode_line("20 0 4 10 2 1 32 8 16", FormatVersion(5.0), &mut absolute(), PE).unwrap();
        match record.event {
            Event::CreationBroadcast { num_pes, send_time, .. } => {
                assert_eq!(num_pes, 16);
                assert_eq!(send_time, Timestamp(8));
            }
            _ => panic!("wrong event"),
        }
    }

    #[test]
    fn test_table_ops() {
        let mut state = delta();
        let record = decode_line("30 2 999 40 1", FormatVersion(5.0), &mut state, PE).unwrap();
        assert_eq!(record.event, Event::Insert { message_type: 2 });
        assert_eq!(record.time, Timestamp(40));
    }

    #[test]
    fn test_unknown_kind() {
        let result = decode_line("10 1 2 3", FormatVersion(5.0), &mut absolute(), PE);
        assert_eq!(result, Err(DecodeError::UnsupportedEventKind(10)));
        let result = decode_line("99999999999 1", FormatVersion(5.0), &mut absolute(), PE);
        assert_eq!(result, Err(DecodeError::UnsupportedEventKind(99999999999)));
    }
}
