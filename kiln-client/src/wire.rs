//! JSON wire helpers.
//!
//! All cluster messages are UTF-8 JSON objects. Inbound documents are read
//! field by field: a type mismatch skips that field with a log while the
//! rest of the document still applies. A document that fails to parse at
//! all is dropped.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;

use kiln_core::Package;

/// Parse an inbound payload into a JSON object document.
///
/// Returns `None` (with a log) for malformed UTF-8/JSON and for payloads
/// whose top level is not an object.
pub(crate) fn parse_document(payload: &[u8]) -> Option<Value> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(doc) if doc.is_object() => Some(doc),
        Ok(_) => {
            tracing::debug!("dropping non-object message");
            None
        }
        Err(err) => {
            tracing::debug!(error = %err, "dropping unparsable message");
            None
        }
    }
}

/// Read a string field, tolerating absence and type mismatches.
pub(crate) fn str_field<'a>(doc: &'a Value, name: &str) -> Option<&'a str> {
    doc.get(name)?.as_str()
}

/// Read a bool field, tolerating absence and type mismatches.
pub(crate) fn bool_field(doc: &Value, name: &str) -> Option<bool> {
    doc.get(name)?.as_bool()
}

/// Read an array field of `[name, version]` string pairs.
///
/// Returns `None` when the field is absent or not an array. Ill-typed
/// elements are skipped with a log; the well-typed remainder still applies.
pub(crate) fn package_pairs(doc: &Value, name: &str) -> Option<Vec<Package>> {
    let items = doc.get(name)?.as_array()?;
    let mut pairs = Vec::with_capacity(items.len());
    for item in items {
        match item.as_array().map(Vec::as_slice) {
            Some([Value::String(pkg_name), Value::String(version)]) => {
                pairs.push(Package::new(pkg_name, version));
            }
            _ => tracing::debug!(field = name, "skipping ill-typed package entry"),
        }
    }
    Some(pairs)
}

/// Read an array field of strings, skipping ill-typed elements with a log.
pub(crate) fn string_items(doc: &Value, name: &str) -> Option<Vec<String>> {
    let items = doc.get(name)?.as_array()?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item.as_str() {
            Some(s) => out.push(s.to_string()),
            None => tracing::debug!(field = name, "skipping ill-typed string entry"),
        }
    }
    Some(out)
}

/// Encode bytes for a blob field.
pub(crate) fn encode_base64(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decode a blob field. Returns `None` with a log on invalid input.
pub(crate) fn decode_base64(data: &str) -> Option<Vec<u8>> {
    match BASE64.decode(data) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            tracing::debug!(error = %err, "dropping invalid base64 blob");
            None
        }
    }
}

/// Serialize an outbound document.
pub(crate) fn encode_document(doc: &Value) -> Vec<u8> {
    serde_json::to_vec(doc).expect("JSON documents always serialize")
}
