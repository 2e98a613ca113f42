//! Document codecs and command inspection.
//!
//! The document format itself belongs to the `bson` crate. A connection only
//! needs a few capabilities on top of it:
//! - [`Encoder`] / [`Decoder`]: Turn caller values into command documents and
//!   reply documents into caller values
//! - [`is_command_ok`]: Inspect a raw reply's success marker without decoding it
//! - [`command_name`]: Read the command name from a command document
//! - [`is_security_sensitive`]: Commands that are never compressed or published

use std::marker::PhantomData;

use bson::{Document, RawBsonRef, RawDocument, RawDocumentBuf};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::ConnectionError;

/// Commands that carry credentials.
///
/// They are never compressed and their documents are replaced by an empty
/// document in command events.
pub const SECURITY_SENSITIVE_COMMANDS: [&str; 9] = [
    "authenticate",
    "saslStart",
    "saslContinue",
    "getnonce",
    "createUser",
    "updateUser",
    "copydbgetnonce",
    "copydbsaslstart",
    "copydb",
];

/// Returns true if `command_name` is in [`SECURITY_SENSITIVE_COMMANDS`].
pub fn is_security_sensitive(command_name: &str) -> bool {
    SECURITY_SENSITIVE_COMMANDS.contains(&command_name)
}

/// Read the command name from a command document.
///
/// The command name is the first key. A legacy `{$query: {...}}` wrapper is
/// unwrapped one level first. Returns `None` for an empty document.
pub fn command_name(command: &Document) -> Option<&str> {
    command_body(command).keys().next().map(String::as_str)
}

/// The command document with a legacy `$query` wrapper removed.
pub fn command_body(command: &Document) -> &Document {
    command.get_document("$query").unwrap_or(command)
}

/// Check a reply's `ok` field without materializing the document.
///
/// Numbers are ok when non-zero, booleans when true. A missing or
/// non-numeric `ok` is not ok.
///
/// # Errors
/// Returns `Decode` if the raw document is malformed.
pub fn is_command_ok(reply: &RawDocument) -> Result<bool, ConnectionError> {
    let ok = reply
        .get("ok")
        .map_err(|e| ConnectionError::Decode(format!("malformed reply document: {e}")))?;

    Ok(match ok {
        Some(RawBsonRef::Double(value)) => value != 0.0,
        Some(RawBsonRef::Int32(value)) => value != 0,
        Some(RawBsonRef::Int64(value)) => value != 0,
        Some(RawBsonRef::Boolean(value)) => value,
        _ => false,
    })
}

/// Materialize a raw document.
pub fn to_document(raw: &RawDocument) -> Result<Document, ConnectionError> {
    bson::from_slice(raw.as_bytes())
        .map_err(|e| ConnectionError::Decode(format!("document decoding failed: {e}")))
}

/// Decodes a reply document into a caller value.
pub trait Decoder<T>: Send + Sync {
    fn decode(&self, document: &RawDocument) -> Result<T, ConnectionError>;
}

/// Encodes a caller value into a command document.
pub trait Encoder<T: ?Sized>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Document, ConnectionError>;
}

/// Decodes into an owned [`Document`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentDecoder;

impl Decoder<Document> for DocumentDecoder {
    fn decode(&self, document: &RawDocument) -> Result<Document, ConnectionError> {
        to_document(document)
    }
}

/// Copies the raw bytes into a [`RawDocumentBuf`] without parsing fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDocumentDecoder;

impl Decoder<RawDocumentBuf> for RawDocumentDecoder {
    fn decode(&self, document: &RawDocument) -> Result<RawDocumentBuf, ConnectionError> {
        Ok(document.to_raw_document_buf())
    }
}

/// Decodes into any `serde` deserializable type.
pub struct SerdeDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeDecoder<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for SerdeDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for SerdeDecoder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerdeDecoder")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T: DeserializeOwned> Decoder<T> for SerdeDecoder<T> {
    fn decode(&self, document: &RawDocument) -> Result<T, ConnectionError> {
        bson::from_slice(document.as_bytes()).map_err(|e| {
            ConnectionError::Decode(format!(
                "decoding {} failed: {e}",
                std::any::type_name::<T>()
            ))
        })
    }
}

/// Encodes any `serde` serializable type.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerdeEncoder;

impl<T: Serialize + ?Sized> Encoder<T> for SerdeEncoder {
    fn encode(&self, value: &T) -> Result<Document, ConnectionError> {
        bson::to_document(value)
            .map_err(|e| ConnectionError::Encode(format!("document encoding failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use bson::{doc, rawdoc};
    use serde::Deserialize;

    #[test]
    fn test_command_name_first_key() {
        let command = doc! { "find": "users", "filter": {} };
        assert_eq!(command_name(&command), Some("find"));
    }

    #[test]
    fn test_command_name_unwraps_query() {
        let command = doc! { "$query": { "count": "users" }, "$readPreference": { "mode": "primary" } };
        assert_eq!(command_name(&command), Some("count"));
        assert_eq!(command_body(&command), &doc! { "count": "users" });
    }

    #[test]
    fn test_command_name_empty() {
        assert_eq!(command_name(&Document::new()), None);
    }

    #[test]
    fn test_security_sensitive() {
        assert!(is_security_sensitive("saslStart"));
        assert!(is_security_sensitive("copydb"));
        assert!(!is_security_sensitive("find"));
        assert!(!is_security_sensitive("saslstart"));
    }

    #[test]
    fn test_is_command_ok_variants() {
        assert!(is_command_ok(&rawdoc! { "ok": 1.0 }).unwrap());
        assert!(is_command_ok(&rawdoc! { "ok": 1 }).unwrap());
        assert!(is_command_ok(&rawdoc! { "ok": 1_i64 }).unwrap());
        assert!(is_command_ok(&rawdoc! { "ok": true }).unwrap());
        assert!(!is_command_ok(&rawdoc! { "ok": 0 }).unwrap());
        assert!(!is_command_ok(&rawdoc! { "ok": 0.0, "errmsg": "ns not found", "code": 5000 }).unwrap());
        assert!(!is_command_ok(&rawdoc! { "ok": false }).unwrap());
        assert!(!is_command_ok(&rawdoc! { "n": 1 }).unwrap());
        assert!(!is_command_ok(&rawdoc! { "ok": "yes" }).unwrap());
    }

    #[test]
    fn test_document_decoder() {
        let raw = rawdoc! { "ok": 1, "n": 3 };
        let decoded = DocumentDecoder.decode(&raw).unwrap();
        assert_eq!(decoded, doc! { "ok": 1, "n": 3 });
    }

    #[test]
    fn test_raw_document_decoder() {
        let raw = rawdoc! { "ok": 1 };
        let decoded = RawDocumentDecoder.decode(&raw).unwrap();
        assert_eq!(decoded.as_bytes(), raw.as_bytes());
    }

    #[derive(Debug, Deserialize, Serialize, PartialEq)]
    struct Count {
        ok: f64,
        n: i32,
    }

    #[test]
    fn test_serde_decoder() {
        let raw = rawdoc! { "ok": 1.0, "n": 42 };
        let decoded: Count = SerdeDecoder::new().decode(&raw).unwrap();
        assert_eq!(decoded, Count { ok: 1.0, n: 42 });
    }

    #[test]
    fn test_serde_decoder_type_mismatch() {
        let raw = rawdoc! { "ok": 1.0, "n": "many" };
        let err = SerdeDecoder::<Count>::new().decode(&raw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[test]
    fn test_serde_encoder() {
        let document = SerdeEncoder.encode(&Count { ok: 1.0, n: 2 }).unwrap();
        assert_eq!(document, doc! { "ok": 1.0, "n": 2 });
    }
}
