use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use derive_more::Display;
use log::{debug, warn};
use serde::Serialize;

use crate::decode::FormatVersion;
use crate::error::{Error, Result};
use crate::reader::{LogReader, UnknownKindPolicy};
use crate::record::{
    EntryID, Event, EventID, EventKind, LogRecord, MessageInfo, ObjectID, PeID, Timestamp,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub begin: Timestamp,
    pub end: Timestamp,
}

impl TimeWindow {
    pub fn new(begin: Timestamp, end: Timestamp) -> Self {
        TimeWindow { begin, end }
    }

    pub fn contains(&self, time: Timestamp) -> bool {
        self.begin <= time && time <= self.end
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum SpanKind {
    Processing,
    Idle,
    // Hosts messages or packing done outside of any entry method.
    Placeholder,
    // Stands in for a span that covers the whole window.
    Overlaid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Destination {
    Single,
    Multicast(Vec<PeID>),
    Broadcast { num_pes: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingMessage {
    pub send_time: Timestamp,
    pub entry: EntryID,
    pub message_len: i32,
    pub event_id: EventID,
    pub destination: Destination,
    pub recorded_send_time: Option<Timestamp>,
}

impl OutgoingMessage {
    fn new(
        time: Timestamp,
        msg: &MessageInfo,
        destination: Destination,
        recorded_send_time: Option<Timestamp>,
    ) -> Self {
        OutgoingMessage {
            send_time: time,
            entry: msg.entry,
            message_len: msg.message_len,
            event_id: msg.event_id,
            destination,
            recorded_send_time,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct PackInterval {
    pub start: Timestamp,
    pub end: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineEvent {
    pub start: Timestamp,
    pub end: Timestamp,
    pub kind: SpanKind,
    pub entry: EntryID,
    pub pe: PeID,
    pub message_len: Option<i32>,
    pub recv_time: Option<Timestamp>,
    pub object_id: Option<ObjectID>,
    pub event_id: Option<EventID>,
    // The closing record was never seen; `end` is the window end.
    pub truncated: bool,
    pub messages: Vec<OutgoingMessage>,
    pub packs: Vec<PackInterval>,
}

impl TimelineEvent {
    fn new(kind: SpanKind, start: Timestamp, entry: EntryID, pe: PeID) -> Self {
        TimelineEvent {
            start,
            end: start,
            kind,
            entry,
            pe,
            message_len: None,
            recv_time: None,
            object_id: None,
            event_id: None,
            truncated: false,
            messages: Vec::new(),
            packs: Vec::new(),
        }
    }

    fn from_begin(record: &LogRecord) -> Self {
        match &record.event {
            Event::BeginProcessing {
                msg,
                recv_time,
                object_id,
            } => {
                let mut span =
                    TimelineEvent::new(SpanKind::Processing, record.time, msg.entry, record.pe);
                span.message_len = Some(msg.message_len);
                span.recv_time = *recv_time;
                span.object_id = *object_id;
                span.event_id = Some(msg.event_id);
                span
            }
            _ => TimelineEvent::new(SpanKind::Idle, record.time, EntryID::NONE, record.pe),
        }
    }

    pub fn duration(&self) -> Timestamp {
        self.end - self.start
    }

    /// True when the span extends past either edge of `window`.
    pub fn crosses(&self, window: &TimeWindow) -> bool {
        self.start < window.begin || self.end > window.end
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum AnnotationKind {
    Single,
    // A pair whose closing record never arrived.
    PairOpen,
    PairClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserAnnotation {
    pub time: Timestamp,
    pub end: Option<Timestamp>,
    pub user_type: i32,
    pub correlation_id: EventID,
    pub kind: AnnotationKind,
}

impl UserAnnotation {
    pub fn duration(&self) -> Option<Timestamp> {
        self.end.map(|end| end - self.time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize)]
pub enum ConsistencyWarning {
    #[display("{kind} at {time} without a matching begin")]
    UnpairedClose { time: Timestamp, kind: EventKind },

    #[display("{kind} at {time} while the span begun at {start} was still open")]
    UnclosedSpan {
        start: Timestamp,
        time: Timestamp,
        kind: EventKind,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Timeline {
    pub pe: PeID,
    pub window: TimeWindow,
    pub spans: Vec<TimelineEvent>,
    pub annotations: Vec<UserAnnotation>,
    pub warnings: Vec<ConsistencyWarning>,
}

impl Timeline {
    fn empty(pe: PeID, window: TimeWindow) -> Self {
        Timeline {
            pe,
            window,
            spans: Vec::new(),
            annotations: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// A reconstruction that stopped early. `partial` holds everything built
/// before the failure.
#[derive(Debug)]
pub struct TimelineLoadError {
    pub partial: Timeline,
    pub error: Error,
}

impl fmt::Display for TimelineLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "timeline for PE {} incomplete after {} spans: {}",
            self.partial.pe,
            self.partial.spans.len(),
            self.error
        )
    }
}

impl std::error::Error for TimelineLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum OpenSpan {
    Real(usize),
    Idle(usize),
    Placeholder(usize),
}

impl OpenSpan {
    fn index(self) -> usize {
        match self {
            OpenSpan::Real(i) | OpenSpan::Idle(i) | OpenSpan::Placeholder(i) => i,
        }
    }
}

// Processing records the runtime did not attribute to an entry method are
// not part of the timeline.
fn is_unattributed(record: &LogRecord) -> bool {
    record.entry().is_some_and(EntryID::is_none)
}

fn closes(open: &LogRecord, close: &LogRecord) -> bool {
    matches!(
        (&open.event, &close.event),
        (Event::BeginProcessing { .. }, Event::EndProcessing { .. })
            | (Event::BeginIdle, Event::EndIdle)
    )
}

struct Reconstructor {
    timeline: Timeline,
    pending_pairs: BTreeMap<EventID, UserAnnotation>,
    current: Option<OpenSpan>,
    current_pack: Option<usize>,
}

impl Reconstructor {
    fn new(pe: PeID, window: TimeWindow) -> Self {
        Reconstructor {
            timeline: Timeline::empty(pe, window),
            pending_pairs: BTreeMap::new(),
            current: None,
            current_pack: None,
        }
    }

    fn window(&self) -> TimeWindow {
        self.timeline.window
    }

    fn warn(&mut self, warning: ConsistencyWarning) {
        warn!("PE {}: {}", self.timeline.pe, warning);
        self.timeline.warnings.push(warning);
    }

    fn run(&mut self, reader: &mut LogReader) -> Result<()> {
        let window = self.window();

        // Find the first record inside the window, remembering the span and
        // the pack that were open when the window started.
        let mut seek_open: Option<LogRecord> = None;
        let mut seek_pack: Option<LogRecord> = None;
        let first = loop {
            let Some(record) = reader.next_record()? else {
                debug!("PE {}: log ends before {}", self.timeline.pe, window.begin);
                return Ok(());
            };
            if is_unattributed(&record) {
                continue;
            }
            if record.time >= window.begin {
                break record;
            }
            match record.kind() {
                EventKind::BeginProcessing | EventKind::BeginIdle => {
                    seek_pack = None;
                    seek_open = Some(record);
                }
                EventKind::EndProcessing | EventKind::EndIdle => {
                    if seek_open.as_ref().is_some_and(|open| closes(open, &record)) {
                        seek_open = None;
                        seek_pack = None;
                    }
                }
                EventKind::BeginPack => seek_pack = Some(record),
                EventKind::EndPack => seek_pack = None,
                EventKind::UserEventPair => {
                    if let Event::UserEventPair {
                        user_type,
                        event_id,
                    } = record.event
                    {
                        self.user_event_pair(record.time, user_type, event_id, false);
                    }
                }
                _ => {}
            }
        };

        if first.time > window.end {
            self.overlaid(&first, seek_open.as_ref());
            return Ok(());
        }

        if let Some(open) = seek_open {
            self.begin_span(&open);
        }
        // A pack with no span around it reopens as a placeholder.
        if let Some(pack) = seek_pack {
            self.begin_pack(&pack);
        }

        let mut record = first;
        loop {
            if !is_unattributed(&record) {
                self.dispatch(&record);
            }
            match reader.next_record()? {
                Some(next) => record = next,
                None => return Ok(()),
            }
            if record.time > window.end {
                break;
            }
        }

        // Past the window: only look for whatever closes the open span.
        while self.current.is_some() {
            self.close_only(&record);
            if self.current.is_none() {
                break;
            }
            match reader.next_record()? {
                Some(next) => record = next,
                None => return Ok(()),
            }
        }
        Ok(())
    }

    fn overlaid(&mut self, record: &LogRecord, open: Option<&LogRecord>) {
        let entry = match (&record.event, open) {
            // Positioned on a fresh begin: nothing runs during the window.
            (Event::BeginProcessing { .. }, _) => return,
            (Event::EndProcessing { msg }, _) => msg.entry,
            (_, Some(open)) => open.entry().unwrap_or(EntryID::NONE),
            _ => EntryID::NONE,
        };
        let window = self.window();
        let mut span = TimelineEvent::new(SpanKind::Overlaid, window.begin, entry, record.pe);
        span.end = window.end;
        span.truncated = true;
        self.timeline.spans.push(span);
    }

    fn dispatch(&mut self, record: &LogRecord) {
        let time = record.time;
        match &record.event {
            Event::BeginProcessing { .. } | Event::BeginIdle => self.begin_span(record),
            Event::EndProcessing { .. } => match self.current {
                Some(OpenSpan::Real(_)) => self.end_span(time),
                _ => self.warn(ConsistencyWarning::UnpairedClose {
                    time,
                    kind: record.kind(),
                }),
            },
            Event::EndIdle => match self.current {
                Some(OpenSpan::Idle(_)) => self.end_span(time),
                _ => self.warn(ConsistencyWarning::UnpairedClose {
                    time,
                    kind: record.kind(),
                }),
            },
            Event::Creation { msg, send_time } => {
                let message = OutgoingMessage::new(time, msg, Destination::Single, *send_time);
                self.add_message(record, message);
            }
            Event::CreationBroadcast {
                msg,
                send_time,
                num_pes,
            } => {
                let destination = Destination::Broadcast { num_pes: *num_pes };
                let message = OutgoingMessage::new(time, msg, destination, Some(*send_time));
                self.add_message(record, message);
            }
            Event::CreationMulticast {
                msg,
                send_time,
                dest_pes,
            } => {
                let destination = Destination::Multicast(dest_pes.clone());
                let message = OutgoingMessage::new(time, msg, destination, Some(*send_time));
                self.add_message(record, message);
            }
            Event::UserEvent {
                user_type,
                event_id,
            } => {
                self.timeline.annotations.push(UserAnnotation {
                    time,
                    end: None,
                    user_type: *user_type,
                    correlation_id: *event_id,
                    kind: AnnotationKind::Single,
                });
            }
            Event::UserEventPair {
                user_type,
                event_id,
            } => self.user_event_pair(time, *user_type, *event_id, true),
            Event::BeginPack => self.begin_pack(record),
            Event::EndPack => {
                if self.current_pack.is_some() {
                    self.end_pack(time);
                } else {
                    self.warn(ConsistencyWarning::UnpairedClose {
                        time,
                        kind: record.kind(),
                    });
                }
            }
            Event::BeginComputation
            | Event::EndComputation
            | Event::Enqueue { .. }
            | Event::Dequeue { .. }
            | Event::BeginUnpack
            | Event::EndUnpack
            | Event::BeginInterrupt { .. }
            | Event::EndInterrupt { .. }
            | Event::Insert { .. }
            | Event::Find { .. }
            | Event::Delete { .. } => {}
        }
    }

    fn close_only(&mut self, record: &LogRecord) {
        match (&record.event, self.current) {
            (Event::EndPack, Some(_)) if self.current_pack.is_some() => self.end_pack(record.time),
            (Event::EndProcessing { .. }, Some(OpenSpan::Real(_)))
            | (Event::EndIdle, Some(OpenSpan::Idle(_))) => self.end_span(record.time),
            _ => {}
        }
    }

    fn push_span(&mut self, span: TimelineEvent) -> usize {
        self.timeline.spans.push(span);
        self.timeline.spans.len() - 1
    }

    fn begin_span(&mut self, record: &LogRecord) {
        match self.current {
            Some(OpenSpan::Placeholder(_)) => self.discard_placeholder(record.time),
            Some(open) => {
                let start = self.timeline.spans[open.index()].start;
                self.warn(ConsistencyWarning::UnclosedSpan {
                    start,
                    time: record.time,
                    kind: record.kind(),
                });
                self.end_span(record.time);
            }
            None => {}
        }
        let span = TimelineEvent::from_begin(record);
        let index = self.push_span(span);
        self.current = Some(match record.event {
            Event::BeginProcessing { .. } => OpenSpan::Real(index),
            _ => OpenSpan::Idle(index),
        });
    }

    fn end_span(&mut self, time: Timestamp) {
        if self.current_pack.is_some() {
            self.end_pack(time);
        }
        if let Some(open) = self.current.take() {
            let span = &mut self.timeline.spans[open.index()];
            span.end = time.max(span.start);
        }
    }

    fn open_placeholder(&mut self, record: &LogRecord) -> usize {
        let span = TimelineEvent::new(SpanKind::Placeholder, record.time, EntryID::NONE, record.pe);
        let index = self.push_span(span);
        self.current = Some(OpenSpan::Placeholder(index));
        index
    }

    // The placeholder stays in the timeline; it just stops receiving
    // messages and packs.
    fn discard_placeholder(&mut self, time: Timestamp) {
        if let Some(OpenSpan::Placeholder(index)) = self.current {
            if let Some(pack) = self.current_pack.take() {
                self.timeline.spans[index].packs[pack].end = time;
            }
            let span = &mut self.timeline.spans[index];
            span.end = time.max(span.start);
            self.current = None;
        }
    }

    fn add_message(&mut self, record: &LogRecord, message: OutgoingMessage) {
        match self.current {
            Some(open) => self.timeline.spans[open.index()].messages.push(message),
            None => {
                let index = self.open_placeholder(record);
                self.timeline.spans[index].messages.push(message);
                self.discard_placeholder(record.time);
            }
        }
    }

    fn begin_pack(&mut self, record: &LogRecord) {
        let index = match self.current {
            Some(open) => open.index(),
            None => self.open_placeholder(record),
        };
        if self.current_pack.is_some() {
            self.warn(ConsistencyWarning::UnclosedSpan {
                start: record.time,
                time: record.time,
                kind: record.kind(),
            });
            self.end_pack(record.time);
        }
        let packs = &mut self.timeline.spans[index].packs;
        packs.push(PackInterval {
            start: record.time,
            end: record.time,
        });
        self.current_pack = Some(packs.len() - 1);
    }

    fn end_pack(&mut self, time: Timestamp) {
        let (Some(open), Some(pack)) = (self.current, self.current_pack.take()) else {
            return;
        };
        let interval = &mut self.timeline.spans[open.index()].packs[pack];
        interval.end = time.max(interval.start);
        if let OpenSpan::Placeholder(_) = open {
            self.discard_placeholder(time);
        }
    }

    fn user_event_pair(&mut self, time: Timestamp, user_type: i32, id: EventID, emit: bool) {
        match self.pending_pairs.get(&id) {
            // A close of another user type does not match the pending open.
            Some(open) if open.user_type != user_type => {
                if emit {
                    self.warn(ConsistencyWarning::UnpairedClose {
                        time,
                        kind: EventKind::UserEventPair,
                    });
                }
            }
            Some(_) => {
                if let Some(mut open) = self.pending_pairs.remove(&id) {
                    // Pairs closed before the window are dropped.
                    if emit {
                        open.end = Some(time);
                        open.kind = AnnotationKind::PairClosed;
                        self.timeline.annotations.push(open);
                    }
                }
            }
            None => {
                self.pending_pairs.insert(
                    id,
                    UserAnnotation {
                        time,
                        end: None,
                        user_type,
                        correlation_id: id,
                        kind: AnnotationKind::PairOpen,
                    },
                );
            }
        }
    }

    fn finish(mut self) -> Timeline {
        if let Some(open) = self.current {
            let window = self.window();
            let index = open.index();
            let start = self.timeline.spans[index].start;
            let end = window.end.max(start);
            self.end_span(end);
            if let OpenSpan::Real(_) | OpenSpan::Idle(_) = open {
                self.timeline.spans[index].truncated = true;
            }
        }
        let pending = std::mem::take(&mut self.pending_pairs);
        self.timeline.annotations.extend(pending.into_values());
        self.timeline.annotations.sort_by_key(|x| x.time);
        self.timeline
    }
}

/// Rebuilds the timeline of one PE over `window` from an open log.
pub fn reconstruct(
    reader: &mut LogReader,
    window: TimeWindow,
) -> std::result::Result<Timeline, Box<TimelineLoadError>> {
    let mut reconstructor = Reconstructor::new(reader.pe(), window);
    if window.begin > window.end {
        return Ok(reconstructor.finish());
    }
    let result = reconstructor.run(reader);
    let timeline = reconstructor.finish();
    match result {
        Ok(()) => Ok(timeline),
        Err(error) => Err(Box::new(TimelineLoadError {
            partial: timeline,
            error,
        })),
    }
}

/// Opens the log at `path` and rebuilds its timeline over `window`.
/// Unknown record kinds abort the reconstruction.
pub fn create_timeline<P: AsRef<Path>>(
    path: P,
    pe: PeID,
    version: FormatVersion,
    window: TimeWindow,
) -> std::result::Result<Timeline, Box<TimelineLoadError>> {
    let mut reader = match LogReader::open(path, pe, version) {
        Ok(reader) => reader.with_policy(UnknownKindPolicy::Abort),
        Err(error) => {
            return Err(Box::new(TimelineLoadError {
                partial: Timeline::empty(pe, window),
                error,
            }));
        }
    };
    reconstruct(&mut reader, window)
}
