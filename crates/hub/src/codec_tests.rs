// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use rmpv::Value;

use super::{control_frame, encode_header, header_str, read_header, rewrite_frame, Header};
use crate::error::ErrorKind;
use crate::model::UserInfo;

fn user(id: &str) -> UserInfo {
    UserInfo {
        id: id.to_owned(),
        roles: Vec::new(),
        is_anonymous: false,
        email: None,
        parent: None,
        scopes: None,
        expires_at: None,
    }
}

fn frame(entries: &[(&str, Value)], tail: &[u8]) -> Vec<u8> {
    let header: Header =
        entries.iter().map(|(k, v)| (Value::from(*k), v.clone())).collect();
    let mut out = encode_header(&header).expect("encode header");
    out.extend_from_slice(tail);
    out
}

// ── parsing ───────────────────────────────────────────────────────────────

#[test]
fn read_header_returns_tail_offset() {
    let data = frame(&[("to", Value::from("b"))], &[0xff, 0xaa]);
    let (header, offset) = read_header(&data).expect("parse");
    assert_eq!(header_str(&header, "to"), Some("b"));
    assert_eq!(&data[offset..], &[0xff, 0xaa]);
}

#[test]
fn non_map_header_is_rejected() {
    let mut data = Vec::new();
    rmpv::encode::write_value(&mut data, &Value::from("just a string")).expect("encode");
    let err = read_header(&data).expect_err("must reject");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn truncated_header_is_rejected() {
    assert!(read_header(&[]).is_err());
}

// ── rewrite ───────────────────────────────────────────────────────────────

#[test]
fn directed_frame_is_fully_qualified() {
    let data = frame(&[("to", Value::from("b"))], &[0xff, 0xaa]);
    let out = rewrite_frame(&data, "w", "a", &user("alice")).expect("rewrite");

    assert_eq!(out.target, "w/b");
    assert_eq!(out.channel, "w/b:msg");

    let (header, offset) = read_header(&out.frame).expect("reparse");
    assert_eq!(header_str(&header, "to"), Some("w/b"));
    assert_eq!(header_str(&header, "from"), Some("w/a"));
    assert_eq!(header_str(&header, "ws"), Some("w"));
    let snapshot: UserInfo = header
        .iter()
        .find(|(k, _)| k.as_str() == Some("user"))
        .map(|(_, v)| rmpv::ext::from_value(v.clone()).expect("user snapshot"))
        .expect("user entry");
    assert_eq!(snapshot, user("alice"));
    assert_eq!(&out.frame[offset..], &[0xff, 0xaa]);
}

#[test]
fn qualified_target_is_left_unchanged() {
    let data = frame(&[("to", Value::from("other/b"))], b"");
    let out = rewrite_frame(&data, "w", "a", &user("alice")).expect("rewrite");
    assert_eq!(out.target, "other/b");
    assert_eq!(out.channel, "other/b:msg");
}

#[test]
fn rewrite_is_idempotent_once_normalized() {
    let data = frame(&[("to", Value::from("b"))], &[0x01, 0x02, 0x03]);
    let once = rewrite_frame(&data, "w", "a", &user("alice")).expect("first");
    let twice = rewrite_frame(&once.frame, "w", "a", &user("alice")).expect("second");
    assert_eq!(once.frame, twice.frame);
    assert_eq!(twice.target, "w/b");
}

#[test]
fn unknown_header_keys_pass_through() {
    let data = frame(
        &[("to", Value::from("b")), ("session", Value::from(42)), ("trace", Value::from("t-1"))],
        b"tail",
    );
    let out = rewrite_frame(&data, "w", "a", &user("alice")).expect("rewrite");
    let (header, _) = read_header(&out.frame).expect("reparse");
    let session = header
        .iter()
        .find(|(k, _)| k.as_str() == Some("session"))
        .map(|(_, v)| v.clone());
    assert_eq!(session, Some(Value::from(42)));
    assert_eq!(header_str(&header, "trace"), Some("t-1"));
}

#[test]
fn missing_target_is_rejected() {
    let data = frame(&[("type", Value::from("ping"))], b"");
    let err = rewrite_frame(&data, "w", "a", &user("alice")).expect_err("must reject");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn bare_manager_target_is_rejected() {
    let data = frame(&[("to", Value::from("workspace-manager-abc"))], b"");
    let err = rewrite_frame(&data, "w", "a", &user("alice")).expect_err("must reject");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(err.message().contains("Invalid target ID"));
}

#[test]
fn manager_broadcast_resolves_to_workspace_broadcast_channel() {
    let data = frame(&[("to", Value::from("*/workspace-manager-abc"))], b"");
    let out = rewrite_frame(&data, "w", "a", &user("alice")).expect("rewrite");
    assert_eq!(out.target, "*/workspace-manager-abc");
    assert_eq!(out.channel, "w/*:msg");
    let (header, _) = read_header(&out.frame).expect("reparse");
    assert_eq!(header_str(&header, "ws"), Some("w"));
}

#[test]
fn wildcard_source_takes_target_workspace() {
    let data = frame(&[("to", Value::from("w2/b"))], b"");
    let out = rewrite_frame(&data, "*", "workspace-manager-abc", &user("root-ish"))
        .expect("rewrite");
    let (header, _) = read_header(&out.frame).expect("reparse");
    assert_eq!(header_str(&header, "ws"), Some("w2"));
    assert_eq!(header_str(&header, "from"), Some("*/workspace-manager-abc"));
    assert_eq!(out.channel, "w2/b:msg");
}

// ── control frames ────────────────────────────────────────────────────────

#[test]
fn control_frames_round_trip() {
    let ping = control_frame("w/c", "ping").expect("build");
    let (header, offset) = read_header(&ping).expect("parse");
    assert_eq!(header_str(&header, "type"), Some("ping"));
    assert_eq!(header_str(&header, "to"), Some("w/c"));
    assert_eq!(offset, ping.len());
}
