use std::fmt;

use derive_more::{Add, Display, From, Sub};
use num_enum::TryFromPrimitive;
use serde::Serialize;

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Add, Sub, From, Display, Serialize,
)]
pub struct Timestamp(pub i64 /* us */);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(i64::MIN);
    pub const MAX: Timestamp = Timestamp(i64::MAX);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, From, Display, Serialize)]
pub struct PeID(pub i32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, From, Display, Serialize)]
pub struct EntryID(pub i32);

impl EntryID {
    // Idle and synthetic spans, and records the runtime did not attribute
    // to an entry method.
    pub const NONE: EntryID = EntryID(-1);

    pub fn is_none(self) -> bool {
        self == EntryID::NONE
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, From, Display, Serialize)]
pub struct EventID(pub i32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ObjectID(pub [i32; 3]);

impl fmt::Display for ObjectID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.0;
        write!(f, "[{}.{}.{}]", a, b, c)
    }
}

// Message length of records written by format 1.0, which did not log it.
pub const NO_MESSAGE_LEN: i32 = -1;

// Make sure this is up to date with the runtime's trace definitions
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive, Serialize)]
#[repr(i32)]
pub enum EventKind {
    Creation = 1,
    BeginProcessing = 2,
    EndProcessing = 3,
    Enqueue = 4,
    Dequeue = 5,
    BeginComputation = 6,
    EndComputation = 7,
    BeginInterrupt = 8,
    EndInterrupt = 9,
    UserEvent = 13,
    BeginIdle = 14,
    EndIdle = 15,
    BeginPack = 16,
    EndPack = 17,
    BeginUnpack = 18,
    EndUnpack = 19,
    CreationBroadcast = 20,
    CreationMulticast = 21,
    Insert = 30,
    Find = 31,
    Delete = 32,
    UserEventPair = 100,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Creation => write!(f, "Creation"),
            EventKind::BeginProcessing => write!(f, "Begin Processing"),
            EventKind::EndProcessing => write!(f, "End Processing"),
            EventKind::BeginComputation => write!(f, "Begin Computation"),
            EventKind::EndComputation => write!(f, "End Computation"),
            EventKind::BeginInterrupt => write!(f, "Begin Interrupt"),
            EventKind::EndInterrupt => write!(f, "End Interrupt"),
            EventKind::UserEvent => write!(f, "User Event"),
            EventKind::BeginIdle => write!(f, "Begin Idle"),
            EventKind::EndIdle => write!(f, "End Idle"),
            EventKind::BeginPack => write!(f, "Begin Pack"),
            EventKind::EndPack => write!(f, "End Pack"),
            EventKind::BeginUnpack => write!(f, "Begin Unpack"),
            EventKind::EndUnpack => write!(f, "End Unpack"),
            EventKind::CreationBroadcast => write!(f, "Broadcast"),
            EventKind::CreationMulticast => write!(f, "Multicast"),
            EventKind::Enqueue => write!(f, "Enqueue"),
            EventKind::Dequeue => write!(f, "Dequeue"),
            EventKind::Insert => write!(f, "Insert"),
            EventKind::Find => write!(f, "Find"),
            EventKind::Delete => write!(f, "Delete"),
            EventKind::UserEventPair => write!(f, "User Event Pair"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct MessageInfo {
    pub message_type: i32,
    pub entry: EntryID,
    pub event_id: EventID,
    pub message_len: i32,
}

#[rustfmt::skip]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Event {
    BeginComputation,
    EndComputation,
    BeginProcessing { msg: MessageInfo, recv_time: Option<Timestamp>, object_id: Option<ObjectID> },
    EndProcessing { msg: MessageInfo },
    Creation { msg: MessageInfo, send_time: Option<Timestamp> },
    CreationBroadcast { msg: MessageInfo, send_time: Timestamp, num_pes: u32 },
    CreationMulticast { msg: MessageInfo, send_time: Timestamp, dest_pes: Vec<PeID> },
    Enqueue { message_type: i32, event_id: EventID },
    Dequeue { message_type: i32, event_id: EventID },
    BeginIdle,
    EndIdle,
    BeginPack,
    EndPack,
    BeginUnpack,
    EndUnpack,
    UserEvent { user_type: i32, event_id: EventID },
    UserEventPair { user_type: i32, event_id: EventID },
    BeginInterrupt { event_id: EventID },
    EndInterrupt { event_id: EventID },
    Insert { message_type: i32 },
    Find { message_type: i32 },
    Delete { message_type: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    pub time: Timestamp,
    pub pe: PeID,
    pub event: Event,
}

impl LogRecord {
    pub fn kind(&self) -> EventKind {
        match self.event {
            Event::BeginComputation => EventKind::BeginComputation,
            Event::EndComputation => EventKind::EndComputation,
            Event::BeginProcessing { .. } => EventKind::BeginProcessing,
            Event::EndProcessing { .. } => EventKind::EndProcessing,
            Event::Creation { .. } => EventKind::Creation,
            Event::CreationBroadcast { .. } => EventKind::CreationBroadcast,
            Event::CreationMulticast { .. } => EventKind::CreationMulticast,
            Event::Enqueue { .. } => EventKind::Enqueue,
            Event::Dequeue { .. } => EventKind::Dequeue,
            Event::BeginIdle => EventKind::BeginIdle,
            Event::EndIdle => EventKind::EndIdle,
            Event::BeginPack => EventKind::BeginPack,
            Event::EndPack => EventKind::EndPack,
            Event::BeginUnpack => EventKind::BeginUnpack,
            Event::EndUnpack => EventKind::EndUnpack,
            Event::UserEvent { .. } => EventKind::UserEvent,
            Event::UserEventPair { .. } => EventKind::UserEventPair,
            Event::BeginInterrupt { .. } => EventKind::BeginInterrupt,
            Event::EndInterrupt { .. } => EventKind::EndInterrupt,
            Event::Insert { .. } => EventKind::Insert,
            Event::Find { .. } => EventKind::Find,
            Event::Delete { .. } => EventKind::Delete,
        }
    }

    /// Message metadata of the processing-like kinds.
    pub fn message(&self) -> Option<&MessageInfo> {
        match &self.event {
            Event::BeginProcessing { msg, .. }
            | Event::EndProcessing { msg }
            | Event::Creation { msg, .. }
            | Event::CreationBroadcast { msg, .. }
            | Event::CreationMulticast { msg, .. } => Some(msg),
            _ => None,
        }
    }

    /// Entry point of the record, if its kind carries one.
    pub fn entry(&self) -> Option<EntryID> {
        self.message().map(|msg| msg.entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes() {
        assert_eq!(EventKind::try_from(2).unwrap(), EventKind::BeginProcessing);
        assert_eq!(EventKind::try_from(21).unwrap(), EventKind::CreationMulticast);
        assert_eq!(EventKind::try_from(100).unwrap(), EventKind::UserEventPair);
        assert!(EventKind::try_from(10).is_err());
    }

    #[test]
    fn test_record_entry() {
        let msg = MessageInfo {
            message_type: 0,
            entry: EntryID(3),
            event_id: EventID(9),
            message_len: 64,
        };
        let record = LogRecord {
            time: Timestamp(100),
            pe: PeID(0),
            event: Event::EndProcessing { msg },
        };
        assert_eq!(record.kind(), EventKind::EndProcessing);
        assert_eq!(record.entry(), Some(EntryID(3)));

        let idle = LogRecord {
            time: Timestamp(100),
            pe: PeID(0),
            event: Event::BeginIdle,
        };
        assert_eq!(idle.entry(), None);
    }

    #[test]
    fn test_timestamp_arith() {
        assert_eq!(Timestamp(150) - Timestamp(100), Timestamp(50));
        assert_eq!(Timestamp(100) + Timestamp(50), Timestamp(150));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(EventKind::BeginProcessing.to_string(), "Begin Processing");
        assert_eq!(EventKind::Enqueue.to_string(), "Enqueue");
        assert_eq!(EventKind::Delete.to_string(), "Delete");
        assert_eq!(EventKind::try_from(100).unwrap().to_string(), "User Event Pair");
    }
}
