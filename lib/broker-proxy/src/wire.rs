//! Multipart messages and the binary envelope / control-frame codec
//!
//! All integers are little-endian. The request envelope is the first body
//! frame of a message:
//!
//! ```text
//! u32 uri_len | uri[uri_len] | u32 seq | u32 timeout | u32 attr | i32 body_frames | i32 body_size | payload...
//! ```
//!
//! Worker control frames carry a `u32` message type followed by a type
//! specific payload frame.

use broker_core::{CoreError, Identity, RequestUri, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Longest URI accepted in an envelope
pub const MAX_URI_LEN: usize = 8192;

/// Size of the fixed content header following the URI
pub const CONTENT_HEADER_LEN: usize = 20;

const URI_HEADER_LEN: usize = 4;
const CONTROL_HEADER_LEN: usize = 4;
// u32 capacity hint, 4 bytes padding, u64 name length
const REGISTER_INFO_LEN: usize = 16;
const REPLY_INFO_LEN: usize = 4;

/// Role tags prepended to redundant dispatches
pub const ROLE_MASTER: &[u8] = b"MASTER";
pub const ROLE_SLAVE: &[u8] = b"SLAVE";

/// Ordered list of frames
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Multipart {
    frames: Vec<Bytes>,
}

impl Multipart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_frames(frames: Vec<Bytes>) -> Self {
        Self { frames }
    }

    pub fn frames(&self) -> &[Bytes] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Bytes> {
        self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, index: usize) -> Option<&Bytes> {
        self.frames.get(index)
    }

    pub fn push(&mut self, frame: impl Into<Bytes>) {
        self.frames.push(frame.into());
    }

    pub fn push_front(&mut self, frame: impl Into<Bytes>) {
        self.frames.insert(0, frame.into());
    }

    /// Replace an existing frame, or append when `index` is one past the end
    pub fn set_frame(&mut self, index: usize, frame: impl Into<Bytes>) -> Result<()> {
        match index.cmp(&self.frames.len()) {
            std::cmp::Ordering::Less => {
                self.frames[index] = frame.into();
                Ok(())
            }
            std::cmp::Ordering::Equal => {
                self.frames.push(frame.into());
                Ok(())
            }
            std::cmp::Ordering::Greater => Err(CoreError::Malformed(format!(
                "frame {} out of range ({} frames)",
                index,
                self.frames.len()
            ))),
        }
    }

    pub fn remove(&mut self, index: usize) -> Result<Bytes> {
        if index >= self.frames.len() {
            return Err(CoreError::Malformed(format!(
                "frame {} out of range ({} frames)",
                index,
                self.frames.len()
            )));
        }
        Ok(self.frames.remove(index))
    }

    pub fn truncate(&mut self, len: usize) {
        self.frames.truncate(len);
    }

    /// Identity of the peer that sent the message (frame 0)
    pub fn identity(&self) -> Option<Identity> {
        self.frames.first().map(|f| Identity::from(f.as_ref()))
    }

    /// Index of the first body frame: the frame following the first empty
    /// delimiter after the routing identity
    pub fn body_start(&self) -> Option<usize> {
        self.frames
            .iter()
            .skip(1)
            .position(|f| f.is_empty())
            .map(|pos| pos + 2)
            .filter(|start| *start < self.frames.len())
    }

    /// Message made of the frames from `from` onwards (shares buffers)
    pub fn tail(&self, from: usize) -> Self {
        Self {
            frames: self.frames.get(from..).map(<[Bytes]>::to_vec).unwrap_or_default(),
        }
    }

    /// Copy every frame into fresh buffers
    pub fn deep_copy(&self) -> Self {
        Self {
            frames: self
                .frames
                .iter()
                .map(|f| Bytes::copy_from_slice(f))
                .collect(),
        }
    }
}

impl From<Vec<Bytes>> for Multipart {
    fn from(frames: Vec<Bytes>) -> Self {
        Self::from_frames(frames)
    }
}

/// Fixed header describing the body of a request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContentHeader {
    pub sequence_id: u32,
    pub timeout_ms: u32,
    /// bits 0-3 pattern, bits 4-7 message type
    pub attr: u32,
    pub body_frames: i32,
    pub body_size: i32,
}

impl ContentHeader {
    pub fn pattern(&self) -> u8 {
        (self.attr & 0x0f) as u8
    }

    pub fn message_type(&self) -> u8 {
        ((self.attr >> 4) & 0x0f) as u8
    }
}

/// Decoded request envelope
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub uri: String,
    pub content: ContentHeader,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(uri: impl Into<String>, content: ContentHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            uri: uri.into(),
            content,
            payload: payload.into(),
        }
    }

    /// Bounds-checked decode of an envelope frame
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut buf = frame;
        if buf.remaining() < URI_HEADER_LEN {
            return Err(CoreError::Malformed(format!(
                "envelope too short ({} bytes)",
                frame.len()
            )));
        }
        let uri_len = buf.get_u32_le() as usize;
        if uri_len == 0 || uri_len > MAX_URI_LEN {
            return Err(CoreError::Malformed(format!("uri length {}", uri_len)));
        }
        if buf.remaining() < uri_len + CONTENT_HEADER_LEN {
            return Err(CoreError::Malformed(format!(
                "envelope truncated: uri {} bytes, {} remaining",
                uri_len,
                buf.remaining()
            )));
        }
        let uri = std::str::from_utf8(&buf[..uri_len])
            .map_err(|_| CoreError::Malformed("uri is not utf-8".to_string()))?
            .to_string();
        buf.advance(uri_len);

        let content = ContentHeader {
            sequence_id: buf.get_u32_le(),
            timeout_ms: buf.get_u32_le(),
            attr: buf.get_u32_le(),
            body_frames: buf.get_i32_le(),
            body_size: buf.get_i32_le(),
        };

        Ok(Self {
            uri,
            content,
            payload: Bytes::copy_from_slice(buf),
        })
    }

    pub fn encode(&self) -> Result<Bytes> {
        if self.uri.is_empty() || self.uri.len() > MAX_URI_LEN {
            return Err(CoreError::InvalidArgument(format!(
                "uri length {} outside 1..={}",
                self.uri.len(),
                MAX_URI_LEN
            )));
        }
        let mut out = BytesMut::with_capacity(
            URI_HEADER_LEN + self.uri.len() + CONTENT_HEADER_LEN + self.payload.len(),
        );
        out.put_u32_le(self.uri.len() as u32);
        out.put_slice(self.uri.as_bytes());
        out.put_u32_le(self.content.sequence_id);
        out.put_u32_le(self.content.timeout_ms);
        out.put_u32_le(self.content.attr);
        out.put_i32_le(self.content.body_frames);
        out.put_i32_le(self.content.body_size);
        out.put_slice(&self.payload);
        Ok(out.freeze())
    }

    pub fn request_uri(&self) -> Result<RequestUri> {
        RequestUri::parse(&self.uri)
    }

    pub fn set_uri(&mut self, uri: &RequestUri) {
        self.uri = uri.to_string();
    }
}

/// Worker control message types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ServiceMsgType {
    Unknown = 0,
    Forward = 1,
    Request = 2,
    Register = 3,
    Heartbeat = 4,
    Deregister = 5,
    Reply = 6,
}

impl From<u32> for ServiceMsgType {
    fn from(value: u32) -> Self {
        match value {
            1 => ServiceMsgType::Forward,
            2 => ServiceMsgType::Request,
            3 => ServiceMsgType::Register,
            4 => ServiceMsgType::Heartbeat,
            5 => ServiceMsgType::Deregister,
            6 => ServiceMsgType::Reply,
            _ => ServiceMsgType::Unknown,
        }
    }
}

pub fn encode_control_header(msg_type: ServiceMsgType) -> Bytes {
    let mut out = BytesMut::with_capacity(CONTROL_HEADER_LEN);
    out.put_u32_le(msg_type as u32);
    out.freeze()
}

pub fn decode_control_header(frame: &[u8]) -> Result<ServiceMsgType> {
    let mut buf = frame;
    if buf.remaining() < CONTROL_HEADER_LEN {
        return Err(CoreError::Malformed(format!(
            "control header of {} bytes",
            frame.len()
        )));
    }
    Ok(ServiceMsgType::from(buf.get_u32_le()))
}

/// Payload of REGISTER, HEARTBEAT and DEREGISTER frames
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterInfo {
    pub capacity_hint: u32,
    pub service_name: String,
}

impl RegisterInfo {
    pub fn new(service_name: impl Into<String>, capacity_hint: u32) -> Self {
        Self {
            capacity_hint,
            service_name: service_name.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let name = self.service_name.as_bytes();
        let mut out = BytesMut::with_capacity(REGISTER_INFO_LEN + name.len());
        out.put_u32_le(self.capacity_hint);
        out.put_u32_le(0);
        out.put_u64_le(name.len() as u64);
        out.put_slice(name);
        out.freeze()
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut buf = frame;
        if buf.remaining() < REGISTER_INFO_LEN {
            return Err(CoreError::Malformed(format!(
                "register info of {} bytes",
                frame.len()
            )));
        }
        let capacity_hint = buf.get_u32_le();
        buf.advance(4);
        let name_len = usize::try_from(buf.get_u64_le())
            .map_err(|_| CoreError::Malformed("service name length overflow".to_string()))?;
        if name_len > buf.remaining() {
            return Err(CoreError::Malformed(format!(
                "service name of {} bytes, {} available",
                name_len,
                buf.remaining()
            )));
        }
        let service_name = std::str::from_utf8(&buf[..name_len])
            .map_err(|_| CoreError::Malformed("service name is not utf-8".to_string()))?
            // Senders may include a trailing NUL
            .trim_end_matches('\0')
            .to_string();
        Ok(Self {
            capacity_hint,
            service_name,
        })
    }
}

pub fn encode_reply(result: i32) -> Bytes {
    let mut out = BytesMut::with_capacity(REPLY_INFO_LEN);
    out.put_i32_le(result);
    out.freeze()
}

pub fn decode_reply(frame: &[u8]) -> Result<i32> {
    let mut buf = frame;
    if buf.remaining() < REPLY_INFO_LEN {
        return Err(CoreError::Malformed(format!(
            "reply of {} bytes",
            frame.len()
        )));
    }
    Ok(buf.get_i32_le())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(parts: &[&[u8]]) -> Multipart {
        Multipart::from_frames(parts.iter().map(|p| Bytes::copy_from_slice(p)).collect())
    }

    #[test]
    fn test_envelope_round_trip() {
        let content = ContentHeader {
            sequence_id: 7,
            timeout_ms: 3000,
            attr: 0x11,
            body_frames: 1,
            body_size: 4,
        };
        let envelope = Envelope::new("ztcp://host/update?vid=ABC123", content, &b"\x00\x01\x02\x03"[..]);
        let encoded = envelope.encode().unwrap();
        assert_eq!(encoded.len(), 4 + envelope.uri.len() + CONTENT_HEADER_LEN + 4);

        let decoded = Envelope::decode(&encoded).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.content.pattern(), 1);
        assert_eq!(decoded.content.message_type(), 1);
    }

    #[test]
    fn test_envelope_at_max_uri_len() {
        let uri = format!("/update?pad={}", "x".repeat(MAX_URI_LEN - 12));
        assert_eq!(uri.len(), MAX_URI_LEN);
        let envelope = Envelope::new(uri.clone(), ContentHeader::default(), Bytes::new());
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded.uri, uri);
        assert!(decoded.payload.is_empty());

        let too_long = Envelope::new(format!("{}x", uri), ContentHeader::default(), Bytes::new());
        assert!(matches!(too_long.encode(), Err(CoreError::InvalidArgument(_))));
    }

    #[test]
    fn test_envelope_rejects_truncated_frames() {
        assert!(Envelope::decode(b"").is_err());
        assert!(Envelope::decode(&[0, 0, 0, 0]).is_err());

        // Declared uri longer than the frame
        let mut frame = BytesMut::new();
        frame.put_u32_le(100);
        frame.put_slice(b"/update");
        assert!(matches!(Envelope::decode(&frame), Err(CoreError::Malformed(_))));

        // Missing content header
        let mut frame = BytesMut::new();
        frame.put_u32_le(7);
        frame.put_slice(b"/update");
        frame.put_u32_le(1);
        assert!(matches!(Envelope::decode(&frame), Err(CoreError::Malformed(_))));
    }

    #[test]
    fn test_register_info_layout() {
        let info = RegisterInfo::new("snapshot", 5);
        let encoded = info.encode();
        assert_eq!(encoded.len(), 16 + 8);
        assert_eq!(&encoded[..4], &5u32.to_le_bytes());
        assert_eq!(&encoded[8..16], &8u64.to_le_bytes());
        assert_eq!(RegisterInfo::decode(&encoded).unwrap(), info);

        assert!(RegisterInfo::decode(&encoded[..20]).is_err());
    }

    #[test]
    fn test_control_header_and_reply() {
        let header = encode_control_header(ServiceMsgType::Register);
        assert_eq!(header.as_ref(), &3u32.to_le_bytes());
        assert_eq!(decode_control_header(&header).unwrap(), ServiceMsgType::Register);
        assert_eq!(decode_control_header(&99u32.to_le_bytes()).unwrap(), ServiceMsgType::Unknown);
        assert!(decode_control_header(&[1, 0]).is_err());

        assert_eq!(decode_reply(&encode_reply(-2)).unwrap(), -2);
    }

    #[test]
    fn test_body_start() {
        assert_eq!(frames(&[b"C1", b"", b"env"]).body_start(), Some(2));
        assert_eq!(frames(&[b"W1", b"C1", b"", b"env"]).body_start(), Some(3));
        // Empty identity frame is not a delimiter
        assert_eq!(frames(&[b"", b"", b"env"]).body_start(), Some(2));
        assert_eq!(frames(&[b"C1", b"env"]).body_start(), None);
        assert_eq!(frames(&[b"C1", b""]).body_start(), None);
    }

    #[test]
    fn test_deep_copy_does_not_alias() {
        let original = frames(&[b"C1", b"", b"payload"]);
        let copy = original.deep_copy();
        assert_eq!(copy, original);
        assert_ne!(copy.frames()[2].as_ptr(), original.frames()[2].as_ptr());

        let tail = original.tail(1);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail.frames()[1].as_ptr(), original.frames()[2].as_ptr());
    }

    #[test]
    fn test_set_and_remove_frames() {
        let mut msg = frames(&[b"W1", b"", b"hdr"]);
        msg.set_frame(3, Bytes::from_static(b"info")).unwrap();
        assert_eq!(msg.len(), 4);
        assert!(msg.set_frame(9, Bytes::new()).is_err());
        assert_eq!(msg.remove(2).unwrap().as_ref(), b"hdr");
        assert!(msg.remove(5).is_err());
        assert_eq!(msg.identity(), Some(Identity::from("W1")));
    }
}
