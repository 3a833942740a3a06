use crate::traits::error::{Result, SocketError};
use serde_json::{json, Value};

/// A single WebSocket payload, text or binary.
#[derive(Debug, Clone, PartialEq)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl WsMessage {
    /// Borrow the UTF-8 payload of a text frame; `None` for binary frames
    /// such as MessagePack output from [`MinBinCodec`].
    pub fn as_text(&self) -> Option<&str> {
        match self {
            WsMessage::Text(s) => Some(s),
            WsMessage::Binary(_) => None,
        }
    }

    /// Payload bytes regardless of frame type, as fed to
    /// [`CodecEngine::decode`].
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            WsMessage::Text(s) => s.as_bytes(),
            WsMessage::Binary(b) => b,
        }
    }

    /// True for frames that must go out as WebSocket binary (the
    /// MessagePack codec); text-codec output stays textual.
    pub fn is_binary(&self) -> bool {
        matches!(self, WsMessage::Binary(_))
    }
}

/// Trait for encoding and decoding wire packets.
///
/// A packet is a JSON object with any of `event`, `data`, `cid`, `rid`,
/// `error`. The codec decides the wire representation; the socket decides
/// frame type from [`CodecEngine::is_binary`].
pub trait CodecEngine: Send + Sync {
    /// Encode one packet (or an array batch of packets) for the wire.
    fn encode(&self, packet: &Value) -> Result<WsMessage>;

    /// Decode one complete inbound payload into a packet or array batch.
    fn decode(&self, payload: &[u8]) -> Result<Value>;

    /// Whether encoded output should be sent as binary frames.
    fn is_binary(&self) -> bool;
}

/// Identity codec over UTF-8 JSON text.
pub struct TextCodec;

impl CodecEngine for TextCodec {
    fn encode(&self, packet: &Value) -> Result<WsMessage> {
        serde_json::to_string(packet)
            .map(WsMessage::Text)
            .map_err(|e| SocketError::Parse(e.to_string()))
    }

    fn decode(&self, payload: &[u8]) -> Result<Value> {
        serde_json::from_slice(payload).map_err(|e| SocketError::Parse(e.to_string()))
    }

    fn is_binary(&self) -> bool {
        false
    }
}

/// MessagePack codec with min-bin field-alias compression.
///
/// Before MessagePack encoding, packets are structurally rewritten to the
/// compact array aliases the SocketCluster min-bin codec uses on the wire:
///
/// - `#publish` packets become `{"p": [channel, data, cid?]}`
/// - other emits become `{"e": [event, data, cid?]}`
/// - responses become `{"r": [rid, error, data]}`
///
/// Array batches are compressed element-wise. Packets matching none of the
/// shapes pass through unchanged, and decoding tolerates uncompressed
/// objects the same way.
pub struct MinBinCodec;

impl CodecEngine for MinBinCodec {
    fn encode(&self, packet: &Value) -> Result<WsMessage> {
        let compressed = match packet {
            Value::Array(items) => Value::Array(items.iter().map(compress_packet).collect()),
            obj if wants_compression(obj) => compress_packet(obj),
            other => other.clone(),
        };

        rmp_serde::to_vec(&compressed)
            .map(WsMessage::Binary)
            .map_err(|e| SocketError::Parse(e.to_string()))
    }

    fn decode(&self, payload: &[u8]) -> Result<Value> {
        let mut obj: Value =
            rmp_serde::from_slice(payload).map_err(|e| SocketError::Parse(e.to_string()))?;

        match &mut obj {
            Value::Array(items) => {
                for item in items.iter_mut() {
                    decompress_packet(item);
                }
            }
            item if item.is_object() => decompress_packet(item),
            _ => {}
        }

        Ok(obj)
    }

    fn is_binary(&self) -> bool {
        true
    }
}

/// A lone object is compressed only when it carries a non-empty `event`
/// or a non-zero `rid`.
fn wants_compression(obj: &Value) -> bool {
    let has_event = obj
        .get("event")
        .and_then(Value::as_str)
        .is_some_and(|e| !e.is_empty());
    let has_rid = obj.get("rid").and_then(Value::as_u64).is_some_and(|r| r != 0);
    has_event || has_rid
}

fn compress_packet(obj: &Value) -> Value {
    let mut out = obj.clone();
    compress_publish(&mut out);
    compress_emit(&mut out);
    compress_response(&mut out);
    out
}

fn decompress_packet(obj: &mut Value) {
    decompress_emit(obj);
    decompress_publish(obj);
    decompress_response(obj);
}

fn call_id(obj: &Value) -> u64 {
    obj.get("cid").and_then(Value::as_u64).unwrap_or(0)
}

/// `{event: "#publish", data: {channel, data}, cid?}` -> `{p: [channel, data, cid?]}`
fn compress_publish(obj: &mut Value) {
    let is_publish = obj.get("event").and_then(Value::as_str) == Some("#publish");
    if !is_publish {
        return;
    }

    let (channel, inner) = match obj.get("data") {
        Some(data) => match (data.get("channel"), data.get("data")) {
            (Some(c), Some(d)) => (c.clone(), d.clone()),
            _ => return,
        },
        None => return,
    };

    let mut alias = vec![channel, inner];
    let cid = call_id(obj);
    if cid != 0 {
        alias.push(json!(cid));
    }

    if let Some(map) = obj.as_object_mut() {
        map.remove("event");
        map.remove("data");
        map.remove("cid");
        map.insert("p".into(), Value::Array(alias));
    }
}

fn decompress_publish(obj: &mut Value) {
    let alias = match obj.get("p").and_then(Value::as_array) {
        Some(p) if p.len() >= 2 => p.clone(),
        _ => return,
    };

    if let Some(map) = obj.as_object_mut() {
        map.remove("p");
        map.insert("event".into(), json!("#publish"));
        map.insert(
            "data".into(),
            json!({ "channel": alias[0], "data": alias[1] }),
        );
        if let Some(cid) = alias.get(2) {
            map.insert("cid".into(), cid.clone());
        }
    }
}

/// `{event, data, cid?}` -> `{e: [event, data, cid?]}`
fn compress_emit(obj: &mut Value) {
    let (event, data) = match (obj.get("event"), obj.get("data")) {
        (Some(e), Some(d)) => (e.clone(), d.clone()),
        _ => return,
    };

    let mut alias = vec![event, data];
    let cid = call_id(obj);
    if cid != 0 {
        alias.push(json!(cid));
    }

    if let Some(map) = obj.as_object_mut() {
        map.remove("event");
        map.remove("data");
        map.remove("cid");
        map.insert("e".into(), Value::Array(alias));
    }
}

fn decompress_emit(obj: &mut Value) {
    let alias = match obj.get("e").and_then(Value::as_array) {
        Some(e) if e.len() >= 2 => e.clone(),
        _ => return,
    };

    if let Some(map) = obj.as_object_mut() {
        map.remove("e");
        map.insert("event".into(), alias[0].clone());
        map.insert("data".into(), alias[1].clone());
        if let Some(cid) = alias.get(2) {
            map.insert("cid".into(), cid.clone());
        }
    }
}

/// `{rid, error?, data?}` -> `{r: [rid, error, data]}` with nulls standing
/// in for absent fields.
fn compress_response(obj: &mut Value) {
    let rid = match obj.get("rid") {
        Some(r) => r.clone(),
        None => return,
    };

    let error = obj.get("error").cloned().unwrap_or(Value::Null);
    let data = obj.get("data").cloned().unwrap_or(Value::Null);

    if let Some(map) = obj.as_object_mut() {
        map.remove("rid");
        map.remove("error");
        map.remove("data");
        map.insert("r".into(), Value::Array(vec![rid, error, data]));
    }
}

fn decompress_response(obj: &mut Value) {
    let alias = match obj.get("r").and_then(Value::as_array) {
        Some(r) if r.len() >= 3 => r.clone(),
        _ => return,
    };

    if let Some(map) = obj.as_object_mut() {
        map.remove("r");
        map.insert("rid".into(), alias[0].clone());
        if !alias[1].is_null() {
            map.insert("error".into(), alias[1].clone());
        }
        if !alias[2].is_null() {
            map.insert("data".into(), alias[2].clone());
        }
    }
}
