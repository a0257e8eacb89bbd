use std::path::Path;

use log::debug;
use serde::Serialize;

use crate::decode::FormatVersion;
use crate::error::{Error, Result};
use crate::reader::{LogReader, UnknownKindPolicy};
use crate::record::{EntryID, Event, EventKind, LogRecord, PeID, Timestamp};

/// Time at which the `n`th (zero-based) Begin Processing of `entry` occurs
/// in the stream.
pub fn find_nth_begin_in(reader: &mut LogReader, entry: EntryID, n: u64) -> Result<Timestamp> {
    let mut count = 0;
    while let Some(record) = reader.next_record()? {
        if let Event::BeginProcessing { msg, .. } = &record.event {
            if msg.entry == entry {
                count += 1;
                if count > n {
                    return Ok(record.time);
                }
            }
        }
    }
    debug!(
        "{:?}: only {} occurrences of entry {}",
        reader.path(),
        count,
        entry
    );
    Err(Error::EntryNotFound {
        pe: reader.pe(),
        entry,
        n,
    })
}

pub fn find_nth_begin<P: AsRef<Path>>(
    path: P,
    pe: PeID,
    version: FormatVersion,
    entry: EntryID,
    n: u64,
) -> Result<Timestamp> {
    let mut reader = LogReader::open(path, pe, version)?.with_policy(UnknownKindPolicy::Skip);
    find_nth_begin_in(&mut reader, entry, n)
}

/// One line of the flat event listing of a PE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewerEvent {
    pub time: Timestamp,
    pub kind: EventKind,
    pub entry: Option<EntryID>,
    pub src_pe: Option<PeID>,
}

impl ViewerEvent {
    fn from_record(record: &LogRecord) -> Option<Self> {
        let (entry, src_pe) = match &record.event {
            Event::BeginIdle
            | Event::EndIdle
            | Event::BeginPack
            | Event::EndPack
            | Event::BeginUnpack
            | Event::EndUnpack => (None, None),
            // The sending PE of a creation is the PE of the log itself.
            Event::Creation { msg, .. }
            | Event::CreationBroadcast { msg, .. }
            | Event::CreationMulticast { msg, .. } => (Some(msg.entry), None),
            Event::BeginProcessing { msg, .. } | Event::EndProcessing { msg } => {
                (Some(msg.entry), Some(record.pe))
            }
            Event::Enqueue { .. } => (None, Some(record.pe)),
            _ => return None,
        };
        if entry.is_some_and(EntryID::is_none) {
            return None;
        }
        Some(ViewerEvent {
            time: record.time,
            kind: record.kind(),
            entry,
            src_pe,
        })
    }
}

pub fn view_in(reader: &mut LogReader) -> Result<Vec<ViewerEvent>> {
    let mut events = Vec::new();
    while let Some(record) = reader.next_record()? {
        events.extend(ViewerEvent::from_record(&record));
    }
    Ok(events)
}

/// Idle, pack, unpack, creation, processing and enqueue records of one PE
/// in log order. Other kinds are left out.
pub fn view<P: AsRef<Path>>(path: P, pe: PeID, version: FormatVersion) -> Result<Vec<ViewerEvent>> {
    let mut reader = LogReader::open(path, pe, version)?.with_policy(UnknownKindPolicy::Skip);
    view_in(&mut reader)
}
