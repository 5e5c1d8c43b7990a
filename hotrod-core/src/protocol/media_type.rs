//! Media types carried in request headers and ping responses.

use std::fmt;

use bytes::BufMut;

use super::wire::{write_string, write_vint, WireReader};
use crate::error::{HotRodError, Result};

const MEDIA_TYPE_NONE: u8 = 0;
const MEDIA_TYPE_PREDEFINED: u8 = 1;
const MEDIA_TYPE_CUSTOM: u8 = 2;

/// Media types with a compact numeric id on the wire.
const PREDEFINED: &[(u32, &str)] = &[
    (1, "application/x-java-object"),
    (2, "application/json"),
    (3, "application/octet-stream"),
    (4, "application/pdf"),
    (5, "application/rtf"),
    (6, "application/x-java-serialized-object"),
    (7, "application/xml"),
    (8, "application/zip"),
    (9, "image/gif"),
    (10, "image/jpeg"),
    (11, "image/png"),
    (12, "text/css"),
    (13, "text/csv"),
    (14, "application/x-protostream"),
    (15, "text/plain"),
    (16, "text/html"),
    (17, "application/x-jboss-marshalling"),
    (18, "application/x-infinispan-marshalling"),
];

/// A media type such as `application/json; charset=UTF-8`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaType {
    name: String,
    params: Vec<(String, String)>,
}

impl MediaType {
    /// `application/octet-stream`.
    pub const OCTET_STREAM: &'static str = "application/octet-stream";
    /// `application/x-protostream`.
    pub const PROTOSTREAM: &'static str = "application/x-protostream";
    /// `application/json`.
    pub const JSON: &'static str = "application/json";
    /// `text/plain`.
    pub const TEXT_PLAIN: &'static str = "text/plain";

    /// Creates a media type without parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Adds a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Returns the type and subtype, without parameters.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the parameters in insertion order.
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    fn predefined_id(&self) -> Option<u32> {
        PREDEFINED
            .iter()
            .find(|(_, name)| *name == self.name)
            .map(|(id, _)| *id)
    }

    /// Writes an optional media type.
    pub fn write(buf: &mut impl BufMut, media_type: Option<&MediaType>) {
        let Some(media_type) = media_type else {
            buf.put_u8(MEDIA_TYPE_NONE);
            return;
        };
        match media_type.predefined_id() {
            Some(id) => {
                buf.put_u8(MEDIA_TYPE_PREDEFINED);
                write_vint(buf, id);
            }
            None => {
                buf.put_u8(MEDIA_TYPE_CUSTOM);
                write_string(buf, &media_type.name);
            }
        }
        write_vint(buf, media_type.params.len() as u32);
        for (key, value) in &media_type.params {
            write_string(buf, key);
            write_string(buf, value);
        }
    }

    /// Reads an optional media type.
    pub fn read(reader: &mut WireReader<'_>) -> Result<Option<MediaType>> {
        let name = match reader.read_u8()? {
            MEDIA_TYPE_NONE => return Ok(None),
            MEDIA_TYPE_PREDEFINED => {
                let id = reader.read_vint()?;
                PREDEFINED
                    .iter()
                    .find(|(known, _)| *known == id)
                    .map(|(_, name)| (*name).to_string())
                    .ok_or_else(|| {
                        HotRodError::InvalidResponse(format!("unknown media type id {}", id))
                    })?
            }
            MEDIA_TYPE_CUSTOM => reader.read_string()?,
            other => {
                return Err(HotRodError::InvalidResponse(format!(
                    "unknown media type tag {}",
                    other
                )))
            }
        };
        let count = reader.read_vint()?;
        let mut params = Vec::new();
        for _ in 0..count {
            let key = reader.read_string()?;
            let value = reader.read_string()?;
            params.push((key, value));
        }
        Ok(Some(MediaType { name, params }))
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for (key, value) in &self.params {
            write!(f, "; {}={}", key, value)?;
        }
        Ok(())
    }
}

/// Key and value media types requested for an operation or listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataFormat {
    /// Media type of keys, or `None` for the server default.
    pub key_type: Option<MediaType>,
    /// Media type of values, or `None` for the server default.
    pub value_type: Option<MediaType>,
}

impl DataFormat {
    /// Creates a data format with both media types.
    pub fn new(key_type: MediaType, value_type: MediaType) -> Self {
        Self {
            key_type: Some(key_type),
            value_type: Some(value_type),
        }
    }

    pub(crate) fn write(&self, buf: &mut impl BufMut) {
        MediaType::write(buf, self.key_type.as_ref());
        MediaType::write(buf, self.value_type.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_absent_media_type_is_single_zero() {
        let mut buf = BytesMut::new();
        MediaType::write(&mut buf, None);
        assert_eq!(&buf[..], &[0]);
        assert_eq!(MediaType::read(&mut WireReader::new(&buf)).unwrap(), None);
    }

    #[test]
    fn test_predefined_media_type_uses_id() {
        let mut buf = BytesMut::new();
        MediaType::write(&mut buf, Some(&MediaType::new(MediaType::PROTOSTREAM)));
        assert_eq!(&buf[..], &[1, 14, 0]);
    }

    #[test]
    fn test_custom_media_type_with_params() {
        let media = MediaType::new("application/x-custom").with_param("charset", "UTF-8");
        let mut buf = BytesMut::new();
        MediaType::write(&mut buf, Some(&media));
        assert_eq!(buf[0], 2);

        let decoded = MediaType::read(&mut WireReader::new(&buf)).unwrap().unwrap();
        assert_eq!(decoded, media);
        assert_eq!(decoded.to_string(), "application/x-custom; charset=UTF-8");
    }

    #[test]
    fn test_unknown_predefined_id_is_rejected() {
        let buf = [1u8, 0x7F, 0];
        let err = MediaType::read(&mut WireReader::new(&buf)).unwrap_err();
        assert!(matches!(err, HotRodError::InvalidResponse(_)));
    }

    #[test]
    fn test_data_format_writes_key_then_value() {
        let format = DataFormat {
            key_type: None,
            value_type: Some(MediaType::new(MediaType::JSON)),
        };
        let mut buf = BytesMut::new();
        format.write(&mut buf);
        assert_eq!(&buf[..], &[0, 1, 2, 0]);
    }
}
