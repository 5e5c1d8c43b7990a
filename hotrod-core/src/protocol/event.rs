//! Server-pushed cache and counter events.

use bytes::Bytes;

use super::constants::{EVENT_CUSTOM_MARSHALLED, EVENT_CUSTOM_RAW, EVENT_STRUCTURED};
use super::opcode::{
    CACHE_ENTRY_CREATED_EVENT, CACHE_ENTRY_EXPIRED_EVENT, CACHE_ENTRY_MODIFIED_EVENT,
    CACHE_ENTRY_REMOVED_EVENT, COUNTER_EVENT,
};
use super::version::{Feature, ProtocolVersion};
use super::wire::WireReader;
use crate::error::{HotRodError, Result};

/// Kind of cache entry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheEventType {
    /// An entry was created.
    Created,
    /// An entry was modified.
    Modified,
    /// An entry was removed.
    Removed,
    /// An entry expired.
    Expired,
}

impl CacheEventType {
    /// Maps an event opcode, honoring what `version` can deliver.
    pub fn from_opcode(opcode: u8, version: ProtocolVersion) -> Option<Self> {
        if !version.supports(Feature::Events) {
            return None;
        }
        match opcode {
            CACHE_ENTRY_CREATED_EVENT => Some(CacheEventType::Created),
            CACHE_ENTRY_MODIFIED_EVENT => Some(CacheEventType::Modified),
            CACHE_ENTRY_REMOVED_EVENT => Some(CacheEventType::Removed),
            CACHE_ENTRY_EXPIRED_EVENT if version.supports(Feature::ExpiredEvents) => {
                Some(CacheEventType::Expired)
            }
            _ => None,
        }
    }
}

/// Bound state of a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterState {
    /// Within bounds.
    Valid,
    /// At the lower bound.
    LowerBoundReached,
    /// At the upper bound.
    UpperBoundReached,
}

impl CounterState {
    fn decode(bits: u8) -> Result<Self> {
        match bits {
            0 => Ok(CounterState::Valid),
            1 => Ok(CounterState::LowerBoundReached),
            2 => Ok(CounterState::UpperBoundReached),
            other => Err(HotRodError::InvalidResponse(format!(
                "invalid counter state {}",
                other
            ))),
        }
    }
}

/// A counter value change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterEvent {
    /// Listener the event was delivered for.
    pub listener_id: Bytes,
    /// Counter name.
    pub counter_name: String,
    /// Value before the change.
    pub old_value: i64,
    /// State before the change.
    pub old_state: CounterState,
    /// Value after the change.
    pub new_value: i64,
    /// State after the change.
    pub new_state: CounterState,
}

/// A decoded push event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// An entry was created.
    Created {
        /// Listener the event was delivered for.
        listener_id: Bytes,
        /// Marshalled key.
        key: Bytes,
        /// Entry version after the write.
        version: i64,
        /// The write was retried after a topology change.
        retried: bool,
    },
    /// An entry was modified.
    Modified {
        /// Listener the event was delivered for.
        listener_id: Bytes,
        /// Marshalled key.
        key: Bytes,
        /// Entry version after the write.
        version: i64,
        /// The write was retried after a topology change.
        retried: bool,
    },
    /// An entry was removed.
    Removed {
        /// Listener the event was delivered for.
        listener_id: Bytes,
        /// Marshalled key.
        key: Bytes,
        /// The removal was retried after a topology change.
        retried: bool,
    },
    /// An entry expired.
    Expired {
        /// Listener the event was delivered for.
        listener_id: Bytes,
        /// Marshalled key.
        key: Bytes,
    },
    /// Converter output for any entry event.
    Custom {
        /// Listener the event was delivered for.
        listener_id: Bytes,
        /// The underlying entry event.
        event_type: CacheEventType,
        /// Converter output.
        payload: Bytes,
        /// True if `payload` is raw converter bytes rather than a
        /// marshalled object.
        raw: bool,
        /// The write was retried after a topology change.
        retried: bool,
    },
    /// A counter changed.
    Counter(CounterEvent),
}

impl ClientEvent {
    /// Returns the listener id the event was delivered for.
    pub fn listener_id(&self) -> &Bytes {
        match self {
            ClientEvent::Created { listener_id, .. }
            | ClientEvent::Modified { listener_id, .. }
            | ClientEvent::Removed { listener_id, .. }
            | ClientEvent::Expired { listener_id, .. }
            | ClientEvent::Custom { listener_id, .. } => listener_id,
            ClientEvent::Counter(event) => &event.listener_id,
        }
    }

    /// Returns true if the producing operation was retried.
    pub fn is_retried(&self) -> bool {
        match self {
            ClientEvent::Created { retried, .. }
            | ClientEvent::Modified { retried, .. }
            | ClientEvent::Removed { retried, .. }
            | ClientEvent::Custom { retried, .. } => *retried,
            _ => false,
        }
    }

    /// Reads an event body positioned after the event opcode.
    pub(crate) fn read(
        reader: &mut WireReader<'_>,
        opcode: u8,
        version: ProtocolVersion,
    ) -> Result<Self> {
        if opcode == COUNTER_EVENT {
            if !version.supports(Feature::CounterEvents) {
                return Err(HotRodError::UnknownEvent(opcode));
            }
            return read_counter_event(reader);
        }
        let event_type =
            CacheEventType::from_opcode(opcode, version).ok_or(HotRodError::UnknownEvent(opcode))?;

        let _status = reader.read_u8()?;
        let _topology = reader.read_u8()?;
        let listener_id = reader.read_bytes_owned()?;
        let kind = reader.read_u8()?;
        let retried = reader.read_bool()?;

        match kind {
            EVENT_CUSTOM_MARSHALLED => Ok(ClientEvent::Custom {
                listener_id,
                event_type,
                payload: reader.read_bytes_owned()?,
                raw: false,
                retried,
            }),
            EVENT_CUSTOM_RAW if version.supports(Feature::RawCustomEvents) => {
                Ok(ClientEvent::Custom {
                    listener_id,
                    event_type,
                    payload: reader.read_bytes_owned()?,
                    raw: true,
                    retried,
                })
            }
            EVENT_STRUCTURED => {
                let key = reader.read_bytes_owned()?;
                Ok(match event_type {
                    CacheEventType::Created => ClientEvent::Created {
                        listener_id,
                        key,
                        version: reader.read_i64()?,
                        retried,
                    },
                    CacheEventType::Modified => ClientEvent::Modified {
                        listener_id,
                        key,
                        version: reader.read_i64()?,
                        retried,
                    },
                    CacheEventType::Removed => ClientEvent::Removed {
                        listener_id,
                        key,
                        retried,
                    },
                    CacheEventType::Expired => ClientEvent::Expired { listener_id, key },
                })
            }
            other => Err(HotRodError::InvalidResponse(format!(
                "unknown event payload kind {}",
                other
            ))),
        }
    }
}

fn read_counter_event(reader: &mut WireReader<'_>) -> Result<ClientEvent> {
    let _status = reader.read_u8()?;
    let _topology = reader.read_u8()?;
    let counter_name = reader.read_string()?;
    let listener_id = reader.read_bytes_owned()?;
    let encoded_state = reader.read_u8()?;
    let old_value = reader.read_i64()?;
    let new_value = reader.read_i64()?;
    Ok(ClientEvent::Counter(CounterEvent {
        listener_id,
        counter_name,
        old_value,
        old_state: CounterState::decode(encoded_state & 0x03)?,
        new_value,
        new_state: CounterState::decode((encoded_state & 0x0C) >> 2)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::{write_array, write_string};
    use bytes::{BufMut, BytesMut};

    fn event_prefix(buf: &mut BytesMut, kind: u8, retried: bool) {
        buf.put_u8(0);
        buf.put_u8(0);
        write_array(buf, b"L1");
        buf.put_u8(kind);
        buf.put_u8(retried as u8);
    }

    #[test]
    fn test_created_event() {
        let mut buf = BytesMut::new();
        event_prefix(&mut buf, EVENT_STRUCTURED, true);
        write_array(&mut buf, b"k");
        buf.put_i64(9);
        let mut reader = WireReader::new(&buf);
        let event = ClientEvent::read(&mut reader, 0x60, ProtocolVersion::V2_0).unwrap();
        assert!(reader.is_empty());
        assert_eq!(
            event,
            ClientEvent::Created {
                listener_id: Bytes::from_static(b"L1"),
                key: Bytes::from_static(b"k"),
                version: 9,
                retried: true,
            }
        );
        assert!(event.is_retried());
    }

    #[test]
    fn test_removed_event_has_no_version() {
        let mut buf = BytesMut::new();
        event_prefix(&mut buf, EVENT_STRUCTURED, false);
        write_array(&mut buf, b"gone");
        let mut reader = WireReader::new(&buf);
        let event = ClientEvent::read(&mut reader, 0x62, ProtocolVersion::V2_5).unwrap();
        assert!(reader.is_empty());
        assert!(matches!(event, ClientEvent::Removed { retried: false, .. }));
    }

    #[test]
    fn test_expired_event_requires_2_1() {
        let mut buf = BytesMut::new();
        event_prefix(&mut buf, EVENT_STRUCTURED, false);
        write_array(&mut buf, b"k");
        let err = ClientEvent::read(&mut WireReader::new(&buf), 0x63, ProtocolVersion::V2_0)
            .unwrap_err();
        assert!(matches!(err, HotRodError::UnknownEvent(0x63)));
        let event = ClientEvent::read(&mut WireReader::new(&buf), 0x63, ProtocolVersion::V2_1)
            .unwrap();
        assert!(matches!(event, ClientEvent::Expired { .. }));
    }

    #[test]
    fn test_raw_custom_event() {
        let mut buf = BytesMut::new();
        event_prefix(&mut buf, EVENT_CUSTOM_RAW, false);
        write_array(&mut buf, b"raw");
        let event = ClientEvent::read(&mut WireReader::new(&buf), 0x61, ProtocolVersion::V2_1)
            .unwrap();
        assert!(matches!(
            event,
            ClientEvent::Custom { raw: true, event_type: CacheEventType::Modified, .. }
        ));

        let err = ClientEvent::read(&mut WireReader::new(&buf), 0x61, ProtocolVersion::V2_0)
            .unwrap_err();
        assert!(matches!(err, HotRodError::InvalidResponse(_)));
    }

    #[test]
    fn test_counter_event_states() {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u8(0);
        write_string(&mut buf, "hits");
        write_array(&mut buf, b"C1");
        buf.put_u8(0x01 | 0x08);
        buf.put_i64(-5);
        buf.put_i64(100);
        let event = ClientEvent::read(&mut WireReader::new(&buf), COUNTER_EVENT, ProtocolVersion::V2_7)
            .unwrap();
        let ClientEvent::Counter(counter) = event else {
            panic!("expected counter event");
        };
        assert_eq!(counter.counter_name, "hits");
        assert_eq!(counter.old_state, CounterState::LowerBoundReached);
        assert_eq!(counter.new_state, CounterState::UpperBoundReached);
        assert_eq!(counter.old_value, -5);
        assert_eq!(counter.new_value, 100);
    }

    #[test]
    fn test_counter_event_requires_2_7() {
        let err = ClientEvent::read(&mut WireReader::new(&[]), COUNTER_EVENT, ProtocolVersion::V2_6)
            .unwrap_err();
        assert!(matches!(err, HotRodError::UnknownEvent(COUNTER_EVENT)));
    }

    #[test]
    fn test_no_events_before_2_0() {
        assert_eq!(CacheEventType::from_opcode(0x60, ProtocolVersion::V1_3), None);
    }
}
