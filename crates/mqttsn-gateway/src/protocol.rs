// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// MQTT-SN v1.2 wire format parser/builder.
//
// All parsing is safe: malformed input returns Err, never panics.
// Multi-byte integers are big-endian on the wire.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors produced while decoding an MQTT-SN datagram.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty datagram")]
    Empty,

    #[error("buffer too short for message header")]
    BufferTooShort,

    #[error("declared length {declared} does not match datagram length {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown message type: 0x{0:02x}")]
    UnknownMessageType(u8),

    #[error("{kind} body too short ({len} bytes)")]
    BodyTooShort { kind: MessageType, len: usize },

    #[error("reserved topic id type in flags 0x{0:02x}")]
    ReservedTopicIdType(u8),

    #[error("unknown return code: 0x{0:02x}")]
    UnknownReturnCode(u8),

    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Header size when the length fits in one byte (length + type).
pub const SHORT_HEADER_SIZE: usize = 2;

/// Header size with the three-byte length form (0x01 + u16 + type).
pub const LONG_HEADER_SIZE: usize = 4;

/// Marker in the first byte announcing the three-byte length form.
pub const LONG_LENGTH_MARKER: u8 = 0x01;

/// Largest message the three-byte length form can describe.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// MQTT-SN protocol id carried in CONNECT.
pub const PROTOCOL_ID: u8 = 0x01;

// Message type tags
pub const ADVERTISE: u8 = 0x00;
pub const SEARCHGW: u8 = 0x01;
pub const GWINFO: u8 = 0x02;
pub const CONNECT: u8 = 0x04;
pub const CONNACK: u8 = 0x05;
pub const WILLTOPICREQ: u8 = 0x06;
pub const WILLTOPIC: u8 = 0x07;
pub const WILLMSGREQ: u8 = 0x08;
pub const WILLMSG: u8 = 0x09;
pub const REGISTER: u8 = 0x0A;
pub const REGACK: u8 = 0x0B;
pub const PUBLISH: u8 = 0x0C;
pub const PUBACK: u8 = 0x0D;
pub const PUBCOMP: u8 = 0x0E;
pub const PUBREC: u8 = 0x0F;
pub const PUBREL: u8 = 0x10;
pub const SUBSCRIBE: u8 = 0x12;
pub const SUBACK: u8 = 0x13;
pub const UNSUBSCRIBE: u8 = 0x14;
pub const UNSUBACK: u8 = 0x15;
pub const PINGREQ: u8 = 0x16;
pub const PINGRESP: u8 = 0x17;
pub const DISCONNECT: u8 = 0x18;
pub const WILLTOPICUPD: u8 = 0x1A;
pub const WILLTOPICRESP: u8 = 0x1B;
pub const WILLMSGUPD: u8 = 0x1C;
pub const WILLMSGRESP: u8 = 0x1D;

// Flag bits
const FLAG_DUP: u8 = 0x80;
const FLAG_QOS_MASK: u8 = 0x60;
const FLAG_QOS_SHIFT: u8 = 5;
const FLAG_RETAIN: u8 = 0x10;
const FLAG_WILL: u8 = 0x08;
const FLAG_CLEAN_SESSION: u8 = 0x04;
const FLAG_TOPIC_ID_TYPE_MASK: u8 = 0x03;

// ---------------------------------------------------------------------------
// Message type enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Advertise = ADVERTISE,
    SearchGw = SEARCHGW,
    GwInfo = GWINFO,
    Connect = CONNECT,
    Connack = CONNACK,
    WillTopicReq = WILLTOPICREQ,
    WillTopic = WILLTOPIC,
    WillMsgReq = WILLMSGREQ,
    WillMsg = WILLMSG,
    Register = REGISTER,
    Regack = REGACK,
    Publish = PUBLISH,
    Puback = PUBACK,
    Pubcomp = PUBCOMP,
    Pubrec = PUBREC,
    Pubrel = PUBREL,
    Subscribe = SUBSCRIBE,
    Suback = SUBACK,
    Unsubscribe = UNSUBSCRIBE,
    Unsuback = UNSUBACK,
    Pingreq = PINGREQ,
    Pingresp = PINGRESP,
    Disconnect = DISCONNECT,
    WillTopicUpd = WILLTOPICUPD,
    WillTopicResp = WILLTOPICRESP,
    WillMsgUpd = WILLMSGUPD,
    WillMsgResp = WILLMSGRESP,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Result<Self, DecodeError> {
        match v {
            ADVERTISE => Ok(Self::Advertise),
            SEARCHGW => Ok(Self::SearchGw),
            GWINFO => Ok(Self::GwInfo),
            CONNECT => Ok(Self::Connect),
            CONNACK => Ok(Self::Connack),
            WILLTOPICREQ => Ok(Self::WillTopicReq),
            WILLTOPIC => Ok(Self::WillTopic),
            WILLMSGREQ => Ok(Self::WillMsgReq),
            WILLMSG => Ok(Self::WillMsg),
            REGISTER => Ok(Self::Register),
            REGACK => Ok(Self::Regack),
            PUBLISH => Ok(Self::Publish),
            PUBACK => Ok(Self::Puback),
            PUBCOMP => Ok(Self::Pubcomp),
            PUBREC => Ok(Self::Pubrec),
            PUBREL => Ok(Self::Pubrel),
            SUBSCRIBE => Ok(Self::Subscribe),
            SUBACK => Ok(Self::Suback),
            UNSUBSCRIBE => Ok(Self::Unsubscribe),
            UNSUBACK => Ok(Self::Unsuback),
            PINGREQ => Ok(Self::Pingreq),
            PINGRESP => Ok(Self::Pingresp),
            DISCONNECT => Ok(Self::Disconnect),
            WILLTOPICUPD => Ok(Self::WillTopicUpd),
            WILLTOPICRESP => Ok(Self::WillTopicResp),
            WILLMSGUPD => Ok(Self::WillMsgUpd),
            WILLMSGRESP => Ok(Self::WillMsgResp),
            _ => Err(DecodeError::UnknownMessageType(v)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Advertise => "ADVERTISE",
            Self::SearchGw => "SEARCHGW",
            Self::GwInfo => "GWINFO",
            Self::Connect => "CONNECT",
            Self::Connack => "CONNACK",
            Self::WillTopicReq => "WILLTOPICREQ",
            Self::WillTopic => "WILLTOPIC",
            Self::WillMsgReq => "WILLMSGREQ",
            Self::WillMsg => "WILLMSG",
            Self::Register => "REGISTER",
            Self::Regack => "REGACK",
            Self::Publish => "PUBLISH",
            Self::Puback => "PUBACK",
            Self::Pubcomp => "PUBCOMP",
            Self::Pubrec => "PUBREC",
            Self::Pubrel => "PUBREL",
            Self::Subscribe => "SUBSCRIBE",
            Self::Suback => "SUBACK",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Unsuback => "UNSUBACK",
            Self::Pingreq => "PINGREQ",
            Self::Pingresp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
            Self::WillTopicUpd => "WILLTOPICUPD",
            Self::WillTopicResp => "WILLTOPICRESP",
            Self::WillMsgUpd => "WILLMSGUPD",
            Self::WillMsgResp => "WILLMSGRESP",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// MQTT-SN quality of service, including the connectionless level -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
    /// QoS -1: publish without CONNECT or REGISTER.
    Connectionless,
}

impl QoS {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::AtMostOnce,
            1 => Self::AtLeastOnce,
            2 => Self::ExactlyOnce,
            _ => Self::Connectionless,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
            Self::Connectionless => 3,
        }
    }

    /// Numeric level as used by MQTT (0..=2); -1 maps to 0.
    pub fn level(self) -> u8 {
        match self {
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
            Self::AtMostOnce | Self::Connectionless => 0,
        }
    }

    /// Inverse of [`QoS::level`]; anything above 2 saturates.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self::AtMostOnce,
            1 => Self::AtLeastOnce,
            _ => Self::ExactlyOnce,
        }
    }
}

/// How the topic field of PUBLISH / SUBSCRIBE / UNSUBSCRIBE is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TopicIdType {
    #[default]
    Normal = 0,
    Predefined = 1,
    Short = 2,
}

/// The one-byte flags field shared by several message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub will: bool,
    pub clean_session: bool,
    pub topic_id_type: TopicIdType,
}

impl Flags {
    pub fn from_byte(b: u8) -> Result<Self, DecodeError> {
        let topic_id_type = match b & FLAG_TOPIC_ID_TYPE_MASK {
            0 => TopicIdType::Normal,
            1 => TopicIdType::Predefined,
            2 => TopicIdType::Short,
            _ => return Err(DecodeError::ReservedTopicIdType(b)),
        };
        Ok(Self {
            dup: b & FLAG_DUP != 0,
            qos: QoS::from_bits((b & FLAG_QOS_MASK) >> FLAG_QOS_SHIFT),
            retain: b & FLAG_RETAIN != 0,
            will: b & FLAG_WILL != 0,
            clean_session: b & FLAG_CLEAN_SESSION != 0,
            topic_id_type,
        })
    }

    pub fn to_byte(self) -> u8 {
        let mut b = (self.qos.bits() << FLAG_QOS_SHIFT) | self.topic_id_type as u8;
        if self.dup {
            b |= FLAG_DUP;
        }
        if self.retain {
            b |= FLAG_RETAIN;
        }
        if self.will {
            b |= FLAG_WILL;
        }
        if self.clean_session {
            b |= FLAG_CLEAN_SESSION;
        }
        b
    }

    /// Flags carrying only a QoS level.
    pub fn with_qos(qos: QoS) -> Self {
        Self {
            qos,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Return code
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    Accepted = 0x00,
    Congestion = 0x01,
    InvalidTopicId = 0x02,
    NotSupported = 0x03,
}

impl ReturnCode {
    pub fn from_u8(v: u8) -> Result<Self, DecodeError> {
        match v {
            0x00 => Ok(Self::Accepted),
            0x01 => Ok(Self::Congestion),
            0x02 => Ok(Self::InvalidTopicId),
            0x03 => Ok(Self::NotSupported),
            _ => Err(DecodeError::UnknownReturnCode(v)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ---------------------------------------------------------------------------
// Message bodies
// ---------------------------------------------------------------------------

/// ADVERTISE (0x00)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertise {
    pub gw_id: u8,
    pub duration: u16,
}

/// GWINFO (0x02) - gw_addr is only present when sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GwInfo {
    pub gw_id: u8,
    pub gw_addr: Vec<u8>,
}

/// CONNECT (0x04). The client id is kept raw; the gateway validates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub flags: Flags,
    pub protocol_id: u8,
    /// Keep-alive duration in seconds.
    pub duration: u16,
    pub client_id: Vec<u8>,
}

/// WILLTOPIC (0x07) and WILLTOPICUPD (0x1A). An empty body decodes to
/// default flags and an empty topic.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WillTopic {
    pub flags: Flags,
    pub topic: String,
}

/// REGISTER (0x0A)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub topic_id: u16,
    pub msg_id: u16,
    pub topic_name: String,
}

/// REGACK (0x0B)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Regack {
    pub topic_id: u16,
    pub msg_id: u16,
    pub return_code: ReturnCode,
}

/// PUBLISH (0x0C)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub flags: Flags,
    pub topic_id: u16,
    pub msg_id: u16,
    pub data: Bytes,
}

/// PUBACK (0x0D)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Puback {
    pub topic_id: u16,
    pub msg_id: u16,
    pub return_code: ReturnCode,
}

/// Topic field of SUBSCRIBE / UNSUBSCRIBE, selected by the topic id type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicRef {
    Name(String),
    Predefined(u16),
    Short([u8; 2]),
}

impl TopicRef {
    fn id_type(&self) -> TopicIdType {
        match self {
            Self::Name(_) => TopicIdType::Normal,
            Self::Predefined(_) => TopicIdType::Predefined,
            Self::Short(_) => TopicIdType::Short,
        }
    }
}

/// SUBSCRIBE (0x12) and UNSUBSCRIBE (0x14).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRequest {
    pub flags: Flags,
    pub msg_id: u16,
    pub topic: TopicRef,
}

/// SUBACK (0x13)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Suback {
    pub flags: Flags,
    pub topic_id: u16,
    pub msg_id: u16,
    pub return_code: ReturnCode,
}

// ---------------------------------------------------------------------------
// Unified message enum
// ---------------------------------------------------------------------------

/// One decoded MQTT-SN message. Every protocol message type has exactly one
/// variant, so a `match` without a wildcard arm covers the whole protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Advertise(Advertise),
    SearchGw { radius: u8 },
    GwInfo(GwInfo),
    Connect(Connect),
    Connack { return_code: ReturnCode },
    WillTopicReq,
    WillTopic(WillTopic),
    WillMsgReq,
    WillMsg { msg: Bytes },
    Register(Register),
    Regack(Regack),
    Publish(Publish),
    Puback(Puback),
    Pubcomp { msg_id: u16 },
    Pubrec { msg_id: u16 },
    Pubrel { msg_id: u16 },
    Subscribe(TopicRequest),
    Suback(Suback),
    Unsubscribe(TopicRequest),
    Unsuback { msg_id: u16 },
    Pingreq { client_id: Option<Vec<u8>> },
    Pingresp,
    Disconnect { duration: Option<u16> },
    WillTopicUpd(WillTopic),
    WillTopicResp { return_code: ReturnCode },
    WillMsgUpd { msg: Bytes },
    WillMsgResp { return_code: ReturnCode },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Advertise(_) => MessageType::Advertise,
            Self::SearchGw { .. } => MessageType::SearchGw,
            Self::GwInfo(_) => MessageType::GwInfo,
            Self::Connect(_) => MessageType::Connect,
            Self::Connack { .. } => MessageType::Connack,
            Self::WillTopicReq => MessageType::WillTopicReq,
            Self::WillTopic(_) => MessageType::WillTopic,
            Self::WillMsgReq => MessageType::WillMsgReq,
            Self::WillMsg { .. } => MessageType::WillMsg,
            Self::Register(_) => MessageType::Register,
            Self::Regack(_) => MessageType::Regack,
            Self::Publish(_) => MessageType::Publish,
            Self::Puback(_) => MessageType::Puback,
            Self::Pubcomp { .. } => MessageType::Pubcomp,
            Self::Pubrec { .. } => MessageType::Pubrec,
            Self::Pubrel { .. } => MessageType::Pubrel,
            Self::Subscribe(_) => MessageType::Subscribe,
            Self::Suback(_) => MessageType::Suback,
            Self::Unsubscribe(_) => MessageType::Unsubscribe,
            Self::Unsuback { .. } => MessageType::Unsuback,
            Self::Pingreq { .. } => MessageType::Pingreq,
            Self::Pingresp => MessageType::Pingresp,
            Self::Disconnect { .. } => MessageType::Disconnect,
            Self::WillTopicUpd(_) => MessageType::WillTopicUpd,
            Self::WillTopicResp { .. } => MessageType::WillTopicResp,
            Self::WillMsgUpd { .. } => MessageType::WillMsgUpd,
            Self::WillMsgResp { .. } => MessageType::WillMsgResp,
        }
    }

    /// Decode one datagram. The length field must cover the datagram exactly.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let (kind, body) = split_header(buf)?;
        parse_body(kind, body)
    }

    /// Encode into a single datagram.
    ///
    /// Callers keep messages below [`MAX_MESSAGE_SIZE`]; the gateway checks
    /// outbound PUBLISH sizes before encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        self.write_body(&mut body);
        frame(self.message_type(), &body)
    }

    fn write_body(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Advertise(m) => {
                buf.push(m.gw_id);
                buf.extend_from_slice(&m.duration.to_be_bytes());
            }
            Self::SearchGw { radius } => buf.push(*radius),
            Self::GwInfo(m) => {
                buf.push(m.gw_id);
                buf.extend_from_slice(&m.gw_addr);
            }
            Self::Connect(m) => {
                buf.push(m.flags.to_byte());
                buf.push(m.protocol_id);
                buf.extend_from_slice(&m.duration.to_be_bytes());
                buf.extend_from_slice(&m.client_id);
            }
            Self::Connack { return_code }
            | Self::WillTopicResp { return_code }
            | Self::WillMsgResp { return_code } => buf.push(return_code.as_u8()),
            Self::WillTopicReq | Self::WillMsgReq | Self::Pingresp => {}
            Self::WillTopic(m) | Self::WillTopicUpd(m) => {
                // An empty WILLTOPIC deletes the will; it carries no flags.
                if !m.topic.is_empty() {
                    buf.push(m.flags.to_byte());
                    buf.extend_from_slice(m.topic.as_bytes());
                }
            }
            Self::WillMsg { msg } | Self::WillMsgUpd { msg } => buf.extend_from_slice(msg),
            Self::Register(m) => {
                buf.extend_from_slice(&m.topic_id.to_be_bytes());
                buf.extend_from_slice(&m.msg_id.to_be_bytes());
                buf.extend_from_slice(m.topic_name.as_bytes());
            }
            Self::Regack(m) => {
                buf.extend_from_slice(&m.topic_id.to_be_bytes());
                buf.extend_from_slice(&m.msg_id.to_be_bytes());
                buf.push(m.return_code.as_u8());
            }
            Self::Publish(m) => {
                buf.push(m.flags.to_byte());
                buf.extend_from_slice(&m.topic_id.to_be_bytes());
                buf.extend_from_slice(&m.msg_id.to_be_bytes());
                buf.extend_from_slice(&m.data);
            }
            Self::Puback(m) => {
                buf.extend_from_slice(&m.topic_id.to_be_bytes());
                buf.extend_from_slice(&m.msg_id.to_be_bytes());
                buf.push(m.return_code.as_u8());
            }
            Self::Pubcomp { msg_id }
            | Self::Pubrec { msg_id }
            | Self::Pubrel { msg_id }
            | Self::Unsuback { msg_id } => buf.extend_from_slice(&msg_id.to_be_bytes()),
            Self::Subscribe(m) | Self::Unsubscribe(m) => {
                let flags = Flags {
                    topic_id_type: m.topic.id_type(),
                    ..m.flags
                };
                buf.push(flags.to_byte());
                buf.extend_from_slice(&m.msg_id.to_be_bytes());
                match &m.topic {
                    TopicRef::Name(name) => buf.extend_from_slice(name.as_bytes()),
                    TopicRef::Predefined(id) => buf.extend_from_slice(&id.to_be_bytes()),
                    TopicRef::Short(name) => buf.extend_from_slice(name),
                }
            }
            Self::Suback(m) => {
                buf.push(m.flags.to_byte());
                buf.extend_from_slice(&m.topic_id.to_be_bytes());
                buf.extend_from_slice(&m.msg_id.to_be_bytes());
                buf.push(m.return_code.as_u8());
            }
            Self::Pingreq { client_id } => {
                if let Some(id) = client_id {
                    buf.extend_from_slice(id);
                }
            }
            Self::Disconnect { duration } => {
                if let Some(d) = duration {
                    buf.extend_from_slice(&d.to_be_bytes());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

fn header_len(body_len: usize) -> usize {
    if body_len + SHORT_HEADER_SIZE <= u8::MAX as usize {
        SHORT_HEADER_SIZE
    } else {
        LONG_HEADER_SIZE
    }
}

fn frame(kind: MessageType, body: &[u8]) -> Vec<u8> {
    let total = header_len(body.len()) + body.len();
    let mut buf = Vec::with_capacity(total);
    if total <= u8::MAX as usize {
        buf.push(total as u8);
    } else {
        buf.push(LONG_LENGTH_MARKER);
        buf.extend_from_slice(&(total as u16).to_be_bytes());
    }
    buf.push(kind.as_u8());
    buf.extend_from_slice(body);
    buf
}

/// Validate the length prefix and split off the message type.
pub fn split_header(buf: &[u8]) -> Result<(MessageType, &[u8]), DecodeError> {
    let first = *buf.first().ok_or(DecodeError::Empty)?;
    let (declared, header) = if first == LONG_LENGTH_MARKER {
        if buf.len() < LONG_HEADER_SIZE {
            return Err(DecodeError::BufferTooShort);
        }
        (u16::from_be_bytes([buf[1], buf[2]]) as usize, LONG_HEADER_SIZE)
    } else {
        if buf.len() < SHORT_HEADER_SIZE {
            return Err(DecodeError::BufferTooShort);
        }
        (first as usize, SHORT_HEADER_SIZE)
    };
    if declared != buf.len() {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: buf.len(),
        });
    }
    let kind = MessageType::from_u8(buf[header - 1])?;
    Ok((kind, &buf[header..]))
}

// ---------------------------------------------------------------------------
// Body parsing
// ---------------------------------------------------------------------------

/// Cursor over a message body; every read is bounds-checked.
struct BodyReader<'a> {
    kind: MessageType,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn new(kind: MessageType, buf: &'a [u8]) -> Self {
        Self { kind, buf, pos: 0 }
    }

    fn too_short(&self) -> DecodeError {
        DecodeError::BodyTooShort {
            kind: self.kind,
            len: self.buf.len(),
        }
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.buf.get(self.pos).ok_or_else(|| self.too_short())?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        if self.pos + 2 > self.buf.len() {
            return Err(self.too_short());
        }
        let v = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn flags(&mut self) -> Result<Flags, DecodeError> {
        Flags::from_byte(self.u8()?)
    }

    fn return_code(&mut self) -> Result<ReturnCode, DecodeError> {
        ReturnCode::from_u8(self.u8()?)
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        self.pos = self.buf.len();
        rest
    }

    fn rest_string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        String::from_utf8(self.rest().to_vec()).map_err(|_| DecodeError::InvalidUtf8(field))
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

fn parse_will_topic(r: &mut BodyReader<'_>) -> Result<WillTopic, DecodeError> {
    if r.is_empty() {
        return Ok(WillTopic::default());
    }
    Ok(WillTopic {
        flags: r.flags()?,
        topic: r.rest_string("will topic")?,
    })
}

fn parse_topic_request(r: &mut BodyReader<'_>) -> Result<TopicRequest, DecodeError> {
    let flags = r.flags()?;
    let msg_id = r.u16()?;
    let topic = match flags.topic_id_type {
        TopicIdType::Normal => TopicRef::Name(r.rest_string("topic name")?),
        TopicIdType::Predefined => TopicRef::Predefined(r.u16()?),
        TopicIdType::Short => TopicRef::Short([r.u8()?, r.u8()?]),
    };
    Ok(TopicRequest {
        flags,
        msg_id,
        topic,
    })
}

fn parse_body(kind: MessageType, body: &[u8]) -> Result<Message, DecodeError> {
    let mut r = BodyReader::new(kind, body);
    let msg = match kind {
        MessageType::Advertise => Message::Advertise(Advertise {
            gw_id: r.u8()?,
            duration: r.u16()?,
        }),
        MessageType::SearchGw => Message::SearchGw { radius: r.u8()? },
        MessageType::GwInfo => Message::GwInfo(GwInfo {
            gw_id: r.u8()?,
            gw_addr: r.rest().to_vec(),
        }),
        MessageType::Connect => Message::Connect(Connect {
            flags: r.flags()?,
            protocol_id: r.u8()?,
            duration: r.u16()?,
            client_id: r.rest().to_vec(),
        }),
        MessageType::Connack => Message::Connack {
            return_code: r.return_code()?,
        },
        MessageType::WillTopicReq => Message::WillTopicReq,
        MessageType::WillTopic => Message::WillTopic(parse_will_topic(&mut r)?),
        MessageType::WillMsgReq => Message::WillMsgReq,
        MessageType::WillMsg => Message::WillMsg {
            msg: Bytes::copy_from_slice(r.rest()),
        },
        MessageType::Register => Message::Register(Register {
            topic_id: r.u16()?,
            msg_id: r.u16()?,
            topic_name: r.rest_string("topic name")?,
        }),
        MessageType::Regack => Message::Regack(Regack {
            topic_id: r.u16()?,
            msg_id: r.u16()?,
            return_code: r.return_code()?,
        }),
        MessageType::Publish => Message::Publish(Publish {
            flags: r.flags()?,
            topic_id: r.u16()?,
            msg_id: r.u16()?,
            data: Bytes::copy_from_slice(r.rest()),
        }),
        MessageType::Puback => Message::Puback(Puback {
            topic_id: r.u16()?,
            msg_id: r.u16()?,
            return_code: r.return_code()?,
        }),
        MessageType::Pubcomp => Message::Pubcomp { msg_id: r.u16()? },
        MessageType::Pubrec => Message::Pubrec { msg_id: r.u16()? },
        MessageType::Pubrel => Message::Pubrel { msg_id: r.u16()? },
        MessageType::Subscribe => Message::Subscribe(parse_topic_request(&mut r)?),
        MessageType::Suback => Message::Suback(Suback {
            flags: r.flags()?,
            topic_id: r.u16()?,
            msg_id: r.u16()?,
            return_code: r.return_code()?,
        }),
        MessageType::Unsubscribe => Message::Unsubscribe(parse_topic_request(&mut r)?),
        MessageType::Unsuback => Message::Unsuback { msg_id: r.u16()? },
        MessageType::Pingreq => {
            let rest = r.rest();
            Message::Pingreq {
                client_id: (!rest.is_empty()).then(|| rest.to_vec()),
            }
        }
        MessageType::Pingresp => Message::Pingresp,
        MessageType::Disconnect => {
            let duration = if r.is_empty() { None } else { Some(r.u16()?) };
            Message::Disconnect { duration }
        }
        MessageType::WillTopicUpd => Message::WillTopicUpd(parse_will_topic(&mut r)?),
        MessageType::WillTopicResp => Message::WillTopicResp {
            return_code: r.return_code()?,
        },
        MessageType::WillMsgUpd => Message::WillMsgUpd {
            msg: Bytes::copy_from_slice(r.rest()),
        },
        MessageType::WillMsgResp => Message::WillMsgResp {
            return_code: r.return_code()?,
        },
    };
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_connect() {
        // len=10, CONNECT, flags=CLEAN, proto=1, duration=60, "dev1"
        let buf = [10, 0x04, 0x04, 0x01, 0x00, 0x3C, b'd', b'e', b'v', b'1'];
        let msg = Message::decode(&buf).expect("decode");
        match msg {
            Message::Connect(c) => {
                assert!(c.flags.clean_session);
                assert!(!c.flags.will);
                assert_eq!(c.protocol_id, PROTOCOL_ID);
                assert_eq!(c.duration, 60);
                assert_eq!(c.client_id, b"dev1");
            }
            other => panic!("expected CONNECT, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_regack_bytes() {
        let msg = Message::Regack(Regack {
            topic_id: 0x0102,
            msg_id: 0x0304,
            return_code: ReturnCode::Accepted,
        });
        assert_eq!(msg.encode(), vec![7, 0x0B, 0x01, 0x02, 0x03, 0x04, 0x00]);
    }

    #[test]
    fn test_encode_publish_flags() {
        let msg = Message::Publish(Publish {
            flags: Flags {
                qos: QoS::AtLeastOnce,
                retain: true,
                ..Default::default()
            },
            topic_id: 1,
            msg_id: 0,
            data: Bytes::from_static(b"22.5"),
        });
        let bytes = msg.encode();
        assert_eq!(bytes[0] as usize, bytes.len());
        assert_eq!(bytes[1], PUBLISH);
        assert_eq!(bytes[2], 0x20 | 0x10);
        assert_eq!(&bytes[7..], b"22.5");
    }

    #[test]
    fn test_long_length_form() {
        let data = Bytes::from(vec![0xAB; 300]);
        let msg = Message::Publish(Publish {
            flags: Flags::default(),
            topic_id: 7,
            msg_id: 0,
            data: data.clone(),
        });
        let bytes = msg.encode();
        assert_eq!(bytes[0], LONG_LENGTH_MARKER);
        assert_eq!(u16::from_be_bytes([bytes[1], bytes[2]]) as usize, bytes.len());
        // Long header (4) + flags, topic id, msg id (5) + data.
        assert_eq!(bytes.len(), 4 + 5 + 300);
        match Message::decode(&bytes).expect("decode") {
            Message::Publish(p) => {
                assert_eq!(p.topic_id, 7);
                assert_eq!(p.data, data);
            }
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    #[test]
    fn test_length_mismatch() {
        let buf = [5, 0x16, b'a'];
        assert_eq!(
            Message::decode(&buf),
            Err(DecodeError::LengthMismatch {
                declared: 5,
                actual: 3
            })
        );
    }

    #[test]
    fn test_empty_and_short() {
        assert_eq!(Message::decode(&[]), Err(DecodeError::Empty));
        assert_eq!(Message::decode(&[1]), Err(DecodeError::BufferTooShort));
    }

    #[test]
    fn test_unknown_message_type() {
        assert_eq!(
            Message::decode(&[2, 0x11]),
            Err(DecodeError::UnknownMessageType(0x11))
        );
        assert_eq!(
            Message::decode(&[2, 0xFE]),
            Err(DecodeError::UnknownMessageType(0xFE))
        );
    }

    #[test]
    fn test_truncated_body() {
        // REGACK needs 5 body bytes
        let err = Message::decode(&[4, 0x0B, 0x00, 0x01]).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::BodyTooShort {
                kind: MessageType::Regack,
                ..
            }
        ));
    }

    #[test]
    fn test_reserved_topic_id_type() {
        let buf = [7, 0x12, 0x03, 0x00, 0x01, b'a', b'b'];
        assert_eq!(
            Message::decode(&buf),
            Err(DecodeError::ReservedTopicIdType(0x03))
        );
    }

    #[test]
    fn test_subscribe_topic_variants() {
        let name = [10, 0x12, 0x20, 0x00, 0x05, b'a', b'/', b'+', b'/', b'c'];
        match Message::decode(&name).expect("decode") {
            Message::Subscribe(s) => {
                assert_eq!(s.flags.qos, QoS::AtLeastOnce);
                assert_eq!(s.msg_id, 5);
                assert_eq!(s.topic, TopicRef::Name("a/+/c".into()));
            }
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        }

        let short = [7, 0x12, 0x02, 0x00, 0x01, b't', b'1'];
        match Message::decode(&short).expect("decode") {
            Message::Subscribe(s) => assert_eq!(s.topic, TopicRef::Short(*b"t1")),
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        }

        let predefined = [7, 0x14, 0x01, 0x00, 0x02, 0x00, 0x09];
        match Message::decode(&predefined).expect("decode") {
            Message::Unsubscribe(s) => assert_eq!(s.topic, TopicRef::Predefined(9)),
            other => panic!("expected UNSUBSCRIBE, got {:?}", other),
        }
    }

    #[test]
    fn test_subscribe_encode_sets_topic_id_type() {
        let msg = Message::Subscribe(TopicRequest {
            flags: Flags::default(),
            msg_id: 1,
            topic: TopicRef::Predefined(3),
        });
        let bytes = msg.encode();
        assert_eq!(bytes[2] & 0x03, TopicIdType::Predefined as u8);
        assert_eq!(Message::decode(&bytes).expect("decode"), msg);
    }

    #[test]
    fn test_optional_bodies() {
        assert_eq!(
            Message::decode(&[2, 0x16]).expect("decode"),
            Message::Pingreq { client_id: None }
        );
        assert_eq!(
            Message::decode(&[4, 0x16, b'i', b'd']).expect("decode"),
            Message::Pingreq {
                client_id: Some(b"id".to_vec())
            }
        );
        assert_eq!(
            Message::decode(&[2, 0x18]).expect("decode"),
            Message::Disconnect { duration: None }
        );
        assert_eq!(
            Message::decode(&[4, 0x18, 0x00, 0x1E]).expect("decode"),
            Message::Disconnect { duration: Some(30) }
        );
        assert_eq!(
            Message::decode(&[2, 0x07]).expect("decode"),
            Message::WillTopic(WillTopic::default())
        );
    }

    #[test]
    fn test_flags_byte_layout() {
        let flags = Flags {
            dup: true,
            qos: QoS::Connectionless,
            retain: false,
            will: true,
            clean_session: true,
            topic_id_type: TopicIdType::Short,
        };
        let b = flags.to_byte();
        assert_eq!(b, 0x80 | 0x60 | 0x08 | 0x04 | 0x02);
        assert_eq!(Flags::from_byte(b).expect("flags"), flags);
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(QoS::Connectionless.level(), 0);
        assert_eq!(QoS::ExactlyOnce.level(), 2);
        assert_eq!(QoS::from_level(1), QoS::AtLeastOnce);
        assert_eq!(QoS::from_level(9), QoS::ExactlyOnce);
    }

    #[test]
    fn test_invalid_utf8_topic() {
        let buf = [7, 0x0A, 0x00, 0x00, 0x00, 0x01, 0xFF];
        assert_eq!(
            Message::decode(&buf),
            Err(DecodeError::InvalidUtf8("topic name"))
        );
    }

    #[test]
    fn test_message_type_names() {
        assert_eq!(MessageType::WillTopicUpd.to_string(), "WILLTOPICUPD");
        assert_eq!(MessageType::from_u8(0x1D).expect("type"), MessageType::WillMsgResp);
    }
}
