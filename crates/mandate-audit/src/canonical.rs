//! Canonical event encoding.
//!
//! Stability of this byte form is a correctness requirement: integrity
//! tags are computed over it and stored records must verify forever. The
//! encoding is therefore explicit rather than derived - fixed field
//! order, big-endian fixed-width integers, length-prefixed strings and
//! bytes, tag-prefixed metadata values, and metadata keys in the
//! deterministic order their `BTreeMap` yields.

use mandate_bus_core::{Event, EventAction, EventStatus, EventType};
use mandate_types::MetaValue;

/// Encoding version stamped into every record.
const VERSION: u8 = 1;

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_bytes(out: &mut Vec<u8>, v: &[u8]) {
    put_u32(out, v.len() as u32);
    out.extend_from_slice(v);
}

fn put_str(out: &mut Vec<u8>, v: &str) {
    put_bytes(out, v.as_bytes());
}

fn type_tag(t: EventType) -> u8 {
    match t {
        EventType::Auth => 1,
        EventType::Token => 2,
        EventType::Transaction => 3,
        EventType::Audit => 4,
        EventType::Sentinel => 5,
    }
}

fn action_tag(a: EventAction) -> u8 {
    match a {
        EventAction::GrantIssued => 1,
        EventAction::TokenIssued => 2,
        EventAction::TokenRevoked => 3,
        EventAction::TransactionProcessed => 4,
        EventAction::EventsDropped => 5,
        EventAction::SubscriberFailed => 6,
        EventAction::SinkUnhealthy => 7,
    }
}

fn status_tag(s: EventStatus) -> u8 {
    match s {
        EventStatus::Success => 1,
        EventStatus::Failure => 2,
        EventStatus::Denied => 3,
    }
}

fn put_meta_value(out: &mut Vec<u8>, value: &MetaValue) {
    match value {
        MetaValue::Str(s) => {
            out.push(1);
            put_str(out, s);
        }
        MetaValue::I64(v) => {
            out.push(2);
            put_i64(out, *v);
        }
        MetaValue::F64(v) => {
            out.push(3);
            put_u64(out, v.to_bits());
        }
        MetaValue::Bool(v) => {
            out.push(4);
            out.push(u8::from(*v));
        }
        MetaValue::Time(t) => {
            out.push(5);
            put_i64(out, t.timestamp_micros());
        }
        MetaValue::Bytes(b) => {
            out.push(6);
            put_bytes(out, b);
        }
    }
}

/// Serialize `event` to its canonical byte form.
pub fn canonical_bytes(event: &Event) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    out.push(VERSION);
    out.extend_from_slice(event.id.as_bytes());
    put_u64(&mut out, event.timestamp.monotonic.as_nanos() as u64);
    put_i64(&mut out, event.timestamp.wall.timestamp_micros());
    out.push(type_tag(event.event_type));
    out.push(action_tag(event.action));
    out.push(status_tag(event.status));
    put_str(&mut out, &event.subject);
    put_str(&mut out, &event.resource);
    put_str(&mut out, &event.message);
    match &event.error {
        Some(code) => {
            out.push(1);
            put_str(&mut out, code);
        }
        None => out.push(0),
    }
    put_u32(&mut out, event.metadata.len() as u32);
    for (key, value) in &event.metadata {
        put_str(&mut out, key);
        put_meta_value(&mut out, value);
    }
    out
}
