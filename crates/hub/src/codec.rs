// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Envelope codec: reads and rewrites the msgpack header at the front of
//! every routed frame without touching the opaque tail.
//!
//! The header is a self-describing map; unknown keys pass through verbatim.
//! Only `to`, `from`, `ws`, and `user` are read or written by the hub.

use std::io::Cursor;

use bytes::Bytes;
use rmpv::Value;

use crate::error::HubError;
use crate::model::UserInfo;

/// Decoded header entries in wire order.
pub type Header = Vec<(Value, Value)>;

/// Parse the leading header map; returns the entries and the byte offset at
/// which the opaque tail begins.
pub fn read_header(data: &[u8]) -> Result<(Header, usize), HubError> {
    let mut cursor = Cursor::new(data);
    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| HubError::invalid_argument(format!("invalid envelope header: {e}")))?;
    let offset = cursor.position() as usize;
    match value {
        Value::Map(entries) => Ok((entries, offset)),
        other => Err(HubError::invalid_argument(format!(
            "envelope header must be a map, got: {other}"
        ))),
    }
}

/// Look up a string value by key in a header.
pub fn header_str<'a>(header: &'a Header, key: &str) -> Option<&'a str> {
    header
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .and_then(|(_, v)| v.as_str())
}

/// Insert or replace a header entry, preserving the position of an existing
/// key.
fn set_entry(header: &mut Header, key: &str, value: Value) {
    match header.iter_mut().find(|(k, _)| k.as_str() == Some(key)) {
        Some((_, slot)) => *slot = value,
        None => header.push((Value::from(key), value)),
    }
}

/// Serialize a header map back to msgpack bytes.
pub fn encode_header(header: &Header) -> Result<Vec<u8>, HubError> {
    let value = Value::Map(header.clone());
    let mut out = Vec::new();
    rmpv::encode::write_value(&mut out, &value)
        .map_err(|e| HubError::internal(format!("failed to encode envelope header: {e}")))?;
    Ok(out)
}

/// Build a minimal control envelope (`ping`/`pong` probes).
pub fn control_frame(to: &str, kind: &str) -> Result<Bytes, HubError> {
    let header: Header = vec![
        (Value::from("type"), Value::from(kind)),
        (Value::from("to"), Value::from(to)),
    ];
    Ok(Bytes::from(encode_header(&header)?))
}

/// A frame after the hub's envelope rewrite.
#[derive(Debug)]
pub struct RewrittenFrame {
    /// The normalized target address (`{workspace}/{client}`).
    pub target: String,
    /// Bus channel the frame is published on. A `*/...` target resolves to
    /// the effective workspace's broadcast channel; receivers filter on the
    /// envelope's `to`.
    pub channel: String,
    /// Repacked header followed by the original tail, byte-for-byte.
    pub frame: Bytes,
}

/// Rewrite an inbound frame's envelope for routing.
///
/// The rewrite normalizes `to` against the source workspace, stamps `from`
/// and the effective `ws`, and embeds the source user snapshot. A bare
/// target naming a workspace manager is rejected: manager addresses must be
/// fully qualified (`*/workspace-manager-...`).
pub fn rewrite_frame(
    data: &[u8],
    workspace: &str,
    client_id: &str,
    user: &UserInfo,
) -> Result<RewrittenFrame, HubError> {
    let (mut header, offset) = read_header(data)?;

    let to = header_str(&header, "to")
        .ok_or_else(|| HubError::invalid_argument("envelope is missing a target"))?
        .to_owned();

    let target = if to.contains('/') {
        to
    } else {
        if to.contains("workspace-manager-") {
            return Err(HubError::invalid_argument(format!(
                "Invalid target ID: {to}, the target ID should be prefixed with */"
            )));
        }
        format!("{workspace}/{to}")
    };

    let effective_ws = if workspace == "*" {
        target.split('/').next().unwrap_or_default().to_owned()
    } else {
        workspace.to_owned()
    };

    let user_value = rmpv::ext::to_value(user)
        .map_err(|e| HubError::internal(format!("failed to encode user snapshot: {e}")))?;

    set_entry(&mut header, "ws", Value::from(effective_ws.as_str()));
    set_entry(&mut header, "to", Value::from(target.as_str()));
    set_entry(&mut header, "from", Value::from(format!("{workspace}/{client_id}")));
    set_entry(&mut header, "user", user_value);

    let channel = if target.starts_with("*/") {
        format!("{effective_ws}/*:msg")
    } else {
        format!("{target}:msg")
    };

    let mut out = encode_header(&header)?;
    out.extend_from_slice(&data[offset..]);

    Ok(RewrittenFrame { target, channel, frame: Bytes::from(out) })
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
