//! Google Cast v2 receiver control.
//!
//! Frames are a 4-byte big-endian length followed by a `CastMessage`
//! protobuf carrying a JSON string payload. Only the handful of fields the
//! sender needs are encoded by hand.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use native_tls::{TlsConnector, TlsStream};
use serde_json::{Value, json};

use super::{DispatchError, MediaLoad, Receiver, ReceiverController};
use crate::config::CastConfig;

pub const DEFAULT_MEDIA_RECEIVER: &str = "CC1AD845";

const NS_CONNECTION: &str = "urn:x-cast:com.google.cast.tp.connection";
const NS_HEARTBEAT: &str = "urn:x-cast:com.google.cast.tp.heartbeat";
const NS_RECEIVER: &str = "urn:x-cast:com.google.cast.receiver";
const NS_MEDIA: &str = "urn:x-cast:com.google.cast.media";

const PLATFORM_ID: &str = "receiver-0";
const SENDER_ID: &str = "sender-tidecast";
const MAX_FRAME_LEN: usize = 64 * 1024;
const READ_POLL: Duration = Duration::from_millis(500);

/// One decoded cast message with a string payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastFrame {
    pub source_id: String,
    pub destination_id: String,
    pub namespace: String,
    pub payload: String,
}

impl CastFrame {
    fn new(destination_id: &str, namespace: &str, payload: &Value) -> Self {
        Self {
            source_id: SENDER_ID.to_string(),
            destination_id: destination_id.to_string(),
            namespace: namespace.to_string(),
            payload: payload.to_string(),
        }
    }

    /// Length-prefixed wire encoding.
    pub fn encode(&self) -> Result<BytesMut, DispatchError> {
        let mut body = BytesMut::new();
        put_varint_field(&mut body, 1, 0); // protocol_version CASTV2_1_0
        put_string_field(&mut body, 2, &self.source_id);
        put_string_field(&mut body, 3, &self.destination_id);
        put_string_field(&mut body, 4, &self.namespace);
        put_varint_field(&mut body, 5, 0); // payload_type STRING
        put_string_field(&mut body, 6, &self.payload);

        let len = u32::try_from(body.len()).map_err(|_| DispatchError::Protocol {
            reason: "frame too large".to_string(),
        })?;
        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.put_u32(len);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decodes a frame body, without its length prefix.
    pub fn decode(mut body: &[u8]) -> Result<Self, DispatchError> {
        let malformed = |what: &str| DispatchError::Protocol {
            reason: format!("malformed frame: {what}"),
        };
        let mut frame = Self {
            source_id: String::new(),
            destination_id: String::new(),
            namespace: String::new(),
            payload: String::new(),
        };

        while body.has_remaining() {
            let key = get_varint(&mut body).ok_or_else(|| malformed("key"))?;
            match (key >> 3, key & 0x07) {
                (_, 0) => {
                    get_varint(&mut body).ok_or_else(|| malformed("varint"))?;
                }
                (field, 2) => {
                    let len = get_varint(&mut body).ok_or_else(|| malformed("length"))? as usize;
                    if len > body.remaining() {
                        return Err(malformed("field exceeds frame"));
                    }
                    let value = String::from_utf8(body[..len].to_vec())
                        .map_err(|_| malformed("invalid utf-8"))?;
                    body.advance(len);
                    match field {
                        2 => frame.source_id = value,
                        3 => frame.destination_id = value,
                        4 => frame.namespace = value,
                        6 => frame.payload = value,
                        _ => {}
                    }
                }
                (_, wire) => return Err(malformed(&format!("wire type {wire}"))),
            }
        }
        Ok(frame)
    }

    fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.payload).ok()
    }
}

fn put_varint(out: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.put_u8(byte);
            return;
        }
        out.put_u8(byte | 0x80);
    }
}

fn put_varint_field(out: &mut BytesMut, field: u64, value: u64) {
    put_varint(out, field << 3);
    put_varint(out, value);
}

fn put_string_field(out: &mut BytesMut, field: u64, value: &str) {
    put_varint(out, (field << 3) | 2);
    put_varint(out, value.len() as u64);
    out.extend_from_slice(value.as_bytes());
}

fn get_varint(buf: &mut &[u8]) -> Option<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        if !buf.has_remaining() {
            return None;
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}

/// [`ReceiverController`] speaking Cast v2 to the default media receiver.
///
/// The TLS stream is blocking; each play runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct CastV2Controller {
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl CastV2Controller {
    pub fn new(config: &CastConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            command_timeout: config.command_timeout,
        }
    }
}

#[async_trait]
impl ReceiverController for CastV2Controller {
    async fn play(&self, receiver: &Receiver, media: &MediaLoad) -> Result<(), DispatchError> {
        let receiver = receiver.clone();
        let media = media.clone();
        let connect_timeout = self.connect_timeout;
        let command_timeout = self.command_timeout;

        tokio::task::spawn_blocking(move || {
            let mut connection = CastConnection::open(&receiver, connect_timeout)?;
            connection.load(&receiver, &media, command_timeout)
        })
        .await
        .map_err(|e| DispatchError::Protocol {
            reason: format!("cast task failed: {e}"),
        })?
    }
}

struct CastConnection {
    stream: TlsStream<TcpStream>,
    /// Bytes received but not yet forming a whole frame
    pending: BytesMut,
    next_request_id: u64,
}

impl CastConnection {
    fn open(receiver: &Receiver, connect_timeout: Duration) -> Result<Self, DispatchError> {
        let tcp = TcpStream::connect_timeout(&receiver.address, connect_timeout).map_err(
            |source| DispatchError::Connect {
                address: receiver.address,
                source,
            },
        )?;
        tcp.set_read_timeout(Some(READ_POLL))?;
        tcp.set_write_timeout(Some(connect_timeout))?;

        // Receivers present self-signed device certificates
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| DispatchError::Tls {
                reason: e.to_string(),
            })?;
        let stream = connector
            .connect(&receiver.host, tcp)
            .map_err(|e| DispatchError::Tls {
                reason: e.to_string(),
            })?;

        tracing::debug!("Connected to {} at {}", receiver.friendly_name, receiver.address);
        Ok(Self {
            stream,
            pending: BytesMut::new(),
            next_request_id: 1,
        })
    }

    fn load(
        &mut self,
        receiver: &Receiver,
        media: &MediaLoad,
        timeout: Duration,
    ) -> Result<(), DispatchError> {
        let rejected = |reason: String| DispatchError::Rejected {
            receiver: receiver.friendly_name.clone(),
            reason,
        };

        self.send(PLATFORM_ID, NS_CONNECTION, &json!({"type": "CONNECT", "origin": {}}))?;

        let launch_id = self.request_id();
        self.send(
            PLATFORM_ID,
            NS_RECEIVER,
            &json!({"type": "LAUNCH", "appId": DEFAULT_MEDIA_RECEIVER, "requestId": launch_id}),
        )?;
        let transport_id = self.await_reply(timeout, "LAUNCH", |frame, message| {
            launch_reply(frame, message, launch_id).map(|reply| reply.map_err(rejected))
        })?;
        tracing::debug!("Media receiver running with transport {}", transport_id);

        self.send(&transport_id, NS_CONNECTION, &json!({"type": "CONNECT", "origin": {}}))?;

        let load_id = self.request_id();
        self.send(
            &transport_id,
            NS_MEDIA,
            &json!({
                "type": "LOAD",
                "requestId": load_id,
                "autoplay": true,
                "currentTime": 0,
                "media": {
                    "contentId": media.url,
                    "streamType": "BUFFERED",
                    "contentType": media.content_type,
                    "metadata": {"metadataType": 0, "title": media.title},
                },
            }),
        )?;
        self.await_reply(timeout, "LOAD", |frame, message| {
            load_reply(frame, message, load_id).map(|reply| reply.map_err(rejected))
        })
    }

    fn request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    fn send(&mut self, destination: &str, namespace: &str, payload: &Value) -> Result<(), DispatchError> {
        let frame = CastFrame::new(destination, namespace, payload).encode()?;
        self.stream.write_all(&frame)?;
        Ok(())
    }

    /// Next frame, or `None` when no whole frame arrived within the read
    /// poll. Partial frames stay buffered for the next call.
    fn read_frame(&mut self) -> Result<Option<CastFrame>, DispatchError> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = split_frame(&mut self.pending)? {
                return Ok(Some(frame));
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(DispatchError::Protocol {
                        reason: "receiver closed the connection".to_string(),
                    });
                }
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reads frames until `handle` produces a result, answering heartbeats
    /// along the way.
    fn await_reply<T>(
        &mut self,
        timeout: Duration,
        stage: &'static str,
        mut handle: impl FnMut(&CastFrame, &Value) -> Option<Result<T, DispatchError>>,
    ) -> Result<T, DispatchError> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let Some(frame) = self.read_frame()? else {
                continue;
            };
            let Some(message) = frame.json() else {
                continue;
            };
            if frame.namespace == NS_HEARTBEAT {
                if message_type(&message) == Some("PING") {
                    self.send(&frame.source_id, NS_HEARTBEAT, &json!({"type": "PONG"}))?;
                }
                continue;
            }
            if let Some(result) = handle(&frame, &message) {
                return result;
            }
        }
        Err(DispatchError::Timeout { stage })
    }
}

/// Removes the first whole frame from `pending`, if there is one.
fn split_frame(pending: &mut BytesMut) -> Result<Option<CastFrame>, DispatchError> {
    if pending.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([pending[0], pending[1], pending[2], pending[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(DispatchError::Protocol {
            reason: format!("frame of {len} bytes exceeds limit"),
        });
    }
    if pending.len() < 4 + len {
        return Ok(None);
    }
    pending.advance(4);
    let body = pending.split_to(len);
    CastFrame::decode(&body).map(Some)
}

/// Outcome of the LAUNCH with `launch_id`: the media transport id, or the
/// rejection reason. Frames answering other requests are skipped.
fn launch_reply(
    frame: &CastFrame,
    message: &Value,
    launch_id: u64,
) -> Option<Result<String, String>> {
    if frame.namespace != NS_RECEIVER || request_id_of(message) != Some(launch_id) {
        return None;
    }
    match message_type(message) {
        Some("LAUNCH_ERROR") => Some(Err(reason_of(message, "launch failed"))),
        Some("RECEIVER_STATUS") => media_transport_id(message).map(Ok),
        _ => None,
    }
}

/// Outcome of the LOAD with `load_id`. Unsolicited `MEDIA_STATUS`
/// broadcasts carry request id 0 and are skipped.
fn load_reply(frame: &CastFrame, message: &Value, load_id: u64) -> Option<Result<(), String>> {
    if frame.namespace != NS_MEDIA || request_id_of(message) != Some(load_id) {
        return None;
    }
    match message_type(message) {
        Some(kind @ ("LOAD_FAILED" | "LOAD_CANCELLED" | "INVALID_REQUEST")) => {
            Some(Err(reason_of(message, kind)))
        }
        Some("MEDIA_STATUS") => Some(Ok(())),
        _ => None,
    }
}

fn request_id_of(message: &Value) -> Option<u64> {
    message.get("requestId").and_then(Value::as_u64)
}

fn message_type(message: &Value) -> Option<&str> {
    message.get("type").and_then(Value::as_str)
}

fn reason_of(message: &Value, fallback: &str) -> String {
    message
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string()
}

fn media_transport_id(status: &Value) -> Option<String> {
    status
        .pointer("/status/applications")?
        .as_array()?
        .iter()
        .find(|app| app.get("appId").and_then(Value::as_str) == Some(DEFAULT_MEDIA_RECEIVER))?
        .get("transportId")?
        .as_str()
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encoding_layout() {
        let frame = CastFrame::new(PLATFORM_ID, NS_HEARTBEAT, &json!({"type": "PING"}));
        let encoded = frame.encode().unwrap();

        let len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(len, encoded.len() - 4);
        // protocol_version field, then source_id as a length-delimited field
        assert_eq!(&encoded[4..7], &[0x08, 0x00, 0x12]);
        assert_eq!(CastFrame::decode(&encoded[4..]).unwrap(), frame);
    }

    #[test]
    fn test_decode_rejects_truncated_field() {
        let encoded = CastFrame::new(PLATFORM_ID, NS_MEDIA, &json!({})).encode().unwrap();
        let truncated = &encoded[4..encoded.len() - 1];
        assert!(matches!(
            CastFrame::decode(truncated),
            Err(DispatchError::Protocol { .. })
        ));
    }

    #[test]
    fn test_long_payload_uses_multibyte_length() {
        let title = "x".repeat(300);
        let frame = CastFrame::new("web-5", NS_MEDIA, &json!({ "title": title }));
        let encoded = frame.encode().unwrap();
        assert_eq!(CastFrame::decode(&encoded[4..]).unwrap().payload, frame.payload);
    }

    #[test]
    fn test_media_transport_id() {
        let status = json!({
            "type": "RECEIVER_STATUS",
            "status": {"applications": [
                {"appId": "E8C28D3C", "transportId": "backdrop"},
                {"appId": DEFAULT_MEDIA_RECEIVER, "transportId": "web-7", "sessionId": "abc"}
            ]}
        });
        assert_eq!(media_transport_id(&status).as_deref(), Some("web-7"));
        assert_eq!(media_transport_id(&json!({"status": {}})), None);
    }

    #[test]
    fn test_split_frame_waits_for_whole_frame() {
        let first = CastFrame::new(PLATFORM_ID, NS_HEARTBEAT, &json!({"type": "PING"}));
        let second = CastFrame::new("web-7", NS_MEDIA, &json!({"type": "MEDIA_STATUS"}));
        let mut wire = first.encode().unwrap();
        wire.extend_from_slice(&second.encode().unwrap());

        let mut pending = BytesMut::new();
        // Two bytes of the length prefix, then the rest of the first frame
        pending.extend_from_slice(&wire[..2]);
        assert_eq!(split_frame(&mut pending).unwrap(), None);
        pending.extend_from_slice(&wire[2..10]);
        assert_eq!(split_frame(&mut pending).unwrap(), None);
        pending.extend_from_slice(&wire[10..]);

        assert_eq!(split_frame(&mut pending).unwrap(), Some(first));
        assert_eq!(split_frame(&mut pending).unwrap(), Some(second));
        assert_eq!(split_frame(&mut pending).unwrap(), None);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_split_frame_rejects_oversized_length() {
        let mut pending = BytesMut::new();
        pending.put_u32(MAX_FRAME_LEN as u32 + 1);
        assert!(matches!(
            split_frame(&mut pending),
            Err(DispatchError::Protocol { .. })
        ));
    }

    #[test]
    fn test_load_reply_skips_unsolicited_status() {
        let frame = CastFrame::new(SENDER_ID, NS_MEDIA, &json!({}));
        let broadcast = json!({"type": "MEDIA_STATUS", "requestId": 0, "status": []});
        let failed = json!({"type": "LOAD_FAILED", "requestId": 2});

        assert_eq!(load_reply(&frame, &broadcast, 2), None);
        assert_eq!(
            load_reply(&frame, &failed, 2),
            Some(Err("LOAD_FAILED".to_string()))
        );
        assert_eq!(
            load_reply(&frame, &json!({"type": "MEDIA_STATUS", "requestId": 2}), 2),
            Some(Ok(()))
        );
    }

    #[test]
    fn test_launch_reply_matches_request_id() {
        let frame = CastFrame::new(SENDER_ID, NS_RECEIVER, &json!({}));
        let status = |request_id: u64| {
            json!({
                "type": "RECEIVER_STATUS",
                "requestId": request_id,
                "status": {"applications": [
                    {"appId": DEFAULT_MEDIA_RECEIVER, "transportId": "web-3"}
                ]}
            })
        };

        assert_eq!(launch_reply(&frame, &status(0), 1), None);
        assert_eq!(launch_reply(&frame, &status(1), 1), Some(Ok("web-3".to_string())));
        assert_eq!(
            launch_reply(
                &frame,
                &json!({"type": "LAUNCH_ERROR", "requestId": 1, "reason": "NOT_FOUND"}),
                1
            ),
            Some(Err("NOT_FOUND".to_string()))
        );
        let media_ns = CastFrame::new(SENDER_ID, NS_MEDIA, &json!({}));
        assert_eq!(launch_reply(&media_ns, &status(1), 1), None);
    }

    #[test]
    fn test_reason_of() {
        assert_eq!(reason_of(&json!({"type": "LOAD_FAILED"}), "LOAD_FAILED"), "LOAD_FAILED");
        assert_eq!(
            reason_of(&json!({"type": "LAUNCH_ERROR", "reason": "NOT_FOUND"}), "x"),
            "NOT_FOUND"
        );
    }
}
