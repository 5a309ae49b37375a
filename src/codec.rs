//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! Wire protocol codec: frame shapes, handshake messages, and the streaming
//! decoder that turns a byte buffer into whole top-level MessagePack values.

use crate::error::{FluentError, Result};
use crate::event_time::{EventTime, EVENT_TIME_EXT_TYPE};
use crate::record::Record;
use rmpv::Value;
use std::io::Cursor;

/// Static, per-client configuration of how entries are framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMode {
    Message,
    Forward,
    PackedForward,
    CompressedPackedForward,
}

impl std::str::FromStr for EventMode {
    type Err = FluentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Message" | "message" => Ok(EventMode::Message),
            "Forward" | "forward" => Ok(EventMode::Forward),
            "PackedForward" | "packed_forward" => Ok(EventMode::PackedForward),
            "CompressedPackedForward" | "compressed_packed_forward" => {
                Ok(EventMode::CompressedPackedForward)
            }
            other => Err(FluentError::config(format!("unknown event mode: {other}"))),
        }
    }
}

fn event_time_value(et: EventTime) -> Value {
    Value::Ext(EVENT_TIME_EXT_TYPE, et.encode().to_vec())
}

fn value_is_event_time_ext(v: &Value) -> Option<EventTime> {
    if let Value::Ext(EVENT_TIME_EXT_TYPE, bytes) = v {
        EventTime::decode(bytes).ok()
    } else {
        None
    }
}

/// Decode an EventTime from either the ext-type encoding or a plain integer
/// (seconds since epoch), matching what real Fluentd servers accept.
fn decode_event_time(v: &Value) -> Result<EventTime> {
    if let Some(et) = value_is_event_time_ext(v) {
        return Ok(et);
    }
    if let Some(secs) = v.as_u64() {
        return EventTime::from_epoch(secs, 0);
    }
    Err(FluentError::UnexpectedMessage(
        "expected EventTime ext or integer".into(),
    ))
}

fn entry_pair_value(time: EventTime, record: &Record) -> Value {
    Value::Array(vec![event_time_value(time), record.to_value()])
}

fn decode_entry_pair(v: &Value) -> Result<(EventTime, Record)> {
    let arr = v
        .as_array()
        .ok_or_else(|| FluentError::UnexpectedMessage("entry is not an array".into()))?;
    if arr.len() < 2 {
        return Err(FluentError::UnexpectedMessage(
            "entry array too short".into(),
        ));
    }
    let time = decode_event_time(&arr[0])?;
    let record = Record::from_value(arr[1].clone())?;
    Ok((time, record))
}

/// One decoded entry-bearing frame: `[tag, ...entries, option?]` in any of
/// the four wire shapes, normalized to a flat list of (time, record) pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryFrame {
    pub tag: String,
    pub entries: Vec<(EventTime, Record)>,
    pub chunk: Option<String>,
}

fn option_map(chunk: Option<&str>, size: Option<usize>, compressed: bool) -> Option<Value> {
    if chunk.is_none() && size.is_none() && !compressed {
        return None;
    }
    let mut map = Vec::new();
    if let Some(c) = chunk {
        map.push((Value::from("chunk"), Value::from(c)));
    }
    if let Some(s) = size {
        map.push((Value::from("size"), Value::from(s as u64)));
    }
    if compressed {
        map.push((Value::from("compressed"), Value::from("gzip")));
    }
    Some(Value::Map(map))
}

/// Encode a chunk of entries sharing one tag into the wire bytes for `mode`.
pub fn encode_entries(
    mode: EventMode,
    tag: &str,
    entries: &[(EventTime, Record)],
    chunk_id: Option<&str>,
) -> Result<Vec<u8>> {
    let value = match mode {
        EventMode::Message => {
            let (time, record) = entries
                .first()
                .ok_or_else(|| FluentError::config("Message mode requires exactly one entry"))?;
            let mut arr = vec![
                Value::from(tag),
                event_time_value(*time),
                record.to_value(),
            ];
            if let Some(opt) = option_map(chunk_id, None, false) {
                arr.push(opt);
            }
            Value::Array(arr)
        }
        EventMode::Forward => {
            let packed: Vec<Value> = entries
                .iter()
                .map(|(t, r)| entry_pair_value(*t, r))
                .collect();
            let mut arr = vec![Value::from(tag), Value::Array(packed)];
            if let Some(opt) = option_map(chunk_id, None, false) {
                arr.push(opt);
            }
            Value::Array(arr)
        }
        EventMode::PackedForward | EventMode::CompressedPackedForward => {
            let mut raw = Vec::new();
            for (t, r) in entries {
                rmpv::encode::write_value(&mut raw, &entry_pair_value(*t, r))
                    .map_err(|e| FluentError::UnexpectedMessage(e.to_string()))?;
            }
            let compressed = mode == EventMode::CompressedPackedForward;
            let raw = if compressed { gzip_compress(&raw)? } else { raw };
            let mut arr = vec![Value::from(tag), Value::Binary(raw)];
            if let Some(opt) = option_map(chunk_id, Some(entries.len()), compressed) {
                arr.push(opt);
            }
            Value::Array(arr)
        }
    };

    encode_value(&value)
}

fn gzip_compress(raw: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw)?;
    Ok(encoder.finish()?)
}

fn gzip_decompress(raw: &[u8]) -> Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;
    let mut decoder = GzDecoder::new(raw);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn find_option(map: &[(Value, Value)], key: &str) -> Option<Value> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v.clone())
}

/// Decode a top-level entry-bearing frame (any of the four event modes) into
/// a normalized `EntryFrame`. Unknown shapes fail with `UnexpectedMessage`.
pub fn decode_entry_frame(value: &Value) -> Result<EntryFrame> {
    let arr = value
        .as_array()
        .ok_or_else(|| FluentError::UnexpectedMessage("top-level frame is not an array".into()))?;
    if arr.len() < 2 {
        return Err(FluentError::UnexpectedMessage(
            "frame array too short".into(),
        ));
    }
    let tag = arr[0]
        .as_str()
        .ok_or_else(|| FluentError::UnexpectedMessage("tag is not a string".into()))?
        .to_string();

    let (entries, option) = match &arr[1] {
        // Forward mode: second element is an array of [time, record] pairs.
        Value::Array(pairs) => {
            let mut entries = Vec::with_capacity(pairs.len());
            for p in pairs {
                entries.push(decode_entry_pair(p)?);
            }
            (entries, arr.get(2))
        }
        // PackedForward / CompressedPackedForward: second element is raw bytes.
        Value::Binary(raw) => {
            let option = arr.get(2);
            let compressed = option
                .and_then(|o| o.as_map())
                .and_then(|m| find_option(m, "compressed"))
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .map(|s| s == "gzip")
                .unwrap_or(false);
            let raw = if compressed {
                gzip_decompress(raw)?
            } else {
                raw.clone()
            };
            (decode_packed_entries(&raw)?, option)
        }
        // Message mode: second element is the EventTime, third is the record.
        _ => {
            let time = decode_event_time(&arr[1])?;
            let record_value = arr
                .get(2)
                .ok_or_else(|| FluentError::UnexpectedMessage("missing record".into()))?;
            let record = Record::from_value(record_value.clone())?;
            let option = arr.get(3);
            (vec![(time, record)], option)
        }
    };

    let chunk = option
        .and_then(|o| o.as_map())
        .and_then(|m| find_option(m, "chunk"))
        .and_then(|v| v.as_str().map(|s| s.to_string()));

    Ok(EntryFrame {
        tag,
        entries,
        chunk,
    })
}

fn decode_packed_entries(raw: &[u8]) -> Result<Vec<(EventTime, Record)>> {
    let mut cursor = Cursor::new(raw);
    let mut out = Vec::new();
    while (cursor.position() as usize) < raw.len() {
        let value = rmpv::decode::read_value(&mut cursor)
            .map_err(|e| FluentError::UnexpectedMessage(e.to_string()))?;
        out.push(decode_entry_pair(&value)?);
    }
    Ok(out)
}

/// Server -> client HELO: advertises a nonce, optional shared-key auth salt,
/// and whether the connection should be kept alive across batches.
#[derive(Debug, Clone)]
pub struct Helo {
    pub nonce: Vec<u8>,
    pub auth_salt: Option<Vec<u8>>,
    pub keepalive: bool,
}

pub fn encode_helo(helo: &Helo) -> Result<Vec<u8>> {
    let mut opts = vec![
        (Value::from("nonce"), Value::Binary(helo.nonce.clone())),
        (
            Value::from("auth"),
            Value::Binary(helo.auth_salt.clone().unwrap_or_default()),
        ),
        (Value::from("keepalive"), Value::Boolean(helo.keepalive)),
    ];
    let value = Value::Array(vec![Value::from("HELO"), Value::Map(opts)]);
    encode_value(&value)
}

pub fn decode_helo(value: &Value) -> Result<Helo> {
    let arr = value
        .as_array()
        .ok_or_else(|| FluentError::UnexpectedMessage("HELO is not an array".into()))?;
    if arr.len() != 2 || arr[0].as_str() != Some("HELO") {
        return Err(FluentError::Handshake("expected HELO frame".into()));
    }
    let map = arr[1]
        .as_map()
        .ok_or_else(|| FluentError::Handshake("HELO options is not a map".into()))?;
    let nonce = find_option(map, "nonce")
        .and_then(|v| v.as_slice().map(|s| s.to_vec()))
        .ok_or_else(|| FluentError::Handshake("HELO missing nonce".into()))?;
    let auth = find_option(map, "auth").and_then(|v| v.as_slice().map(|s| s.to_vec()));
    let auth_salt = auth.filter(|a| !a.is_empty());
    let keepalive = find_option(map, "keepalive")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    Ok(Helo {
        nonce,
        auth_salt,
        keepalive,
    })
}

/// Client -> server PING. `client_hostname` is carried on the wire (rather
/// than inferred) because the server needs it to recompute
/// `shared_key_hexdigest` independently and compare.
#[derive(Debug, Clone)]
pub struct Ping {
    pub client_hostname: String,
    pub shared_key_salt: Vec<u8>,
    pub shared_key_hexdigest: String,
    pub username: String,
    pub password_hexdigest: String,
}

pub fn encode_ping(ping: &Ping) -> Result<Vec<u8>> {
    let value = Value::Array(vec![
        Value::from("PING"),
        Value::from(ping.client_hostname.as_str()),
        Value::Binary(ping.shared_key_salt.clone()),
        Value::from(ping.shared_key_hexdigest.as_str()),
        Value::from(ping.username.as_str()),
        Value::from(ping.password_hexdigest.as_str()),
    ]);
    encode_value(&value)
}

pub fn decode_ping(value: &Value) -> Result<Ping> {
    let arr = value
        .as_array()
        .ok_or_else(|| FluentError::UnexpectedMessage("PING is not an array".into()))?;
    if arr.len() != 6 || arr[0].as_str() != Some("PING") {
        return Err(FluentError::Handshake("expected PING frame".into()));
    }
    let client_hostname = arr[1].as_str().unwrap_or("").to_string();
    let shared_key_salt = arr[2]
        .as_slice()
        .ok_or_else(|| FluentError::Handshake("PING salt is not bytes".into()))?
        .to_vec();
    let shared_key_hexdigest = arr[3]
        .as_str()
        .ok_or_else(|| FluentError::Handshake("PING digest is not a string".into()))?
        .to_string();
    let username = arr[4].as_str().unwrap_or("").to_string();
    let password_hexdigest = arr[5].as_str().unwrap_or("").to_string();
    Ok(Ping {
        client_hostname,
        shared_key_salt,
        shared_key_hexdigest,
        username,
        password_hexdigest,
    })
}

/// Server -> client PONG.
#[derive(Debug, Clone)]
pub struct Pong {
    pub auth_ok: bool,
    pub reason: String,
    pub hostname: String,
    pub shared_key_hexdigest: String,
}

pub fn encode_pong(pong: &Pong) -> Result<Vec<u8>> {
    let value = Value::Array(vec![
        Value::from("PONG"),
        Value::Boolean(pong.auth_ok),
        Value::from(pong.reason.as_str()),
        Value::from(pong.hostname.as_str()),
        Value::from(pong.shared_key_hexdigest.as_str()),
    ]);
    encode_value(&value)
}

pub fn decode_pong(value: &Value) -> Result<Pong> {
    let arr = value
        .as_array()
        .ok_or_else(|| FluentError::UnexpectedMessage("PONG is not an array".into()))?;
    if arr.len() != 5 || arr[0].as_str() != Some("PONG") {
        return Err(FluentError::Handshake("expected PONG frame".into()));
    }
    let auth_ok = arr[1].as_bool().unwrap_or(false);
    let reason = arr[2].as_str().unwrap_or("").to_string();
    let hostname = arr[3].as_str().unwrap_or("").to_string();
    let shared_key_hexdigest = arr[4].as_str().unwrap_or("").to_string();
    Ok(Pong {
        auth_ok,
        reason,
        hostname,
        shared_key_hexdigest,
    })
}

pub fn encode_ack(chunk_id: &str) -> Result<Vec<u8>> {
    let value = Value::Map(vec![(Value::from("ack"), Value::from(chunk_id))]);
    encode_value(&value)
}

pub fn decode_ack(value: &Value) -> Result<String> {
    let map = value
        .as_map()
        .ok_or_else(|| FluentError::UnexpectedMessage("ack frame is not a map".into()))?;
    find_option(map, "ack")
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .ok_or_else(|| FluentError::UnexpectedMessage("ack frame missing chunk id".into()))
}

fn encode_value(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value)
        .map_err(|e| FluentError::UnexpectedMessage(e.to_string()))?;
    Ok(buf)
}

/// Accumulates inbound bytes and yields whole top-level MessagePack values,
/// leaving a partial trailing value buffered for the next call.
#[derive(Default)]
pub struct StreamDecoder {
    buf: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Drain as many complete top-level values as are currently buffered.
    pub fn drain(&mut self) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        loop {
            let mut cursor = Cursor::new(&self.buf[..]);
            match rmpv::decode::read_value(&mut cursor) {
                Ok(value) => {
                    let consumed = cursor.position() as usize;
                    self.buf.drain(0..consumed);
                    values.push(value);
                }
                Err(rmpv::decode::Error::InvalidMarkerRead(e))
                | Err(rmpv::decode::Error::InvalidDataRead(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(e) => return Err(FluentError::UnexpectedMessage(e.to_string())),
            }
        }
        Ok(values)
    }
}
