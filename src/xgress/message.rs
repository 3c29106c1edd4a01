use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::util::buf::{put_bytes, put_string, try_get_bytes, try_get_string};

/// Identifies a destination in a router's destination table: either a link id or the address of
///  a local endpoint
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);
impl Address {
    pub fn new(address: impl Into<String>) -> Address {
        Address(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Address::new(value)
    }
}
impl From<String> for Address {
    fn from(value: String) -> Self {
        Address(value)
    }
}

/// The side of a circuit a message was produced on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Originator {
    Initiator,
    Terminator,
}
impl Originator {
    fn from_flags(flags: u32) -> Originator {
        if flags & PAYLOAD_FLAG_ORIGINATOR != 0 {
            Originator::Terminator
        }
        else {
            Originator::Initiator
        }
    }

    fn flags(self) -> u32 {
        match self {
            Originator::Initiator => 0,
            Originator::Terminator => PAYLOAD_FLAG_ORIGINATOR,
        }
    }
}
impl Display for Originator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Originator::Initiator => f.write_str("Initiator"),
            Originator::Terminator => f.write_str("Terminator"),
        }
    }
}

pub const PAYLOAD_FLAG_CIRCUIT_END: u32 = 1;
pub const PAYLOAD_FLAG_ORIGINATOR: u32 = 2;
pub const PAYLOAD_FLAG_CIRCUIT_START: u32 = 4;

#[derive(Clone, PartialEq, Eq)]
pub struct Payload {
    pub circuit_id: String,
    pub flags: u32,
    pub sequence: i32,
    pub headers: BTreeMap<u8, Bytes>,
    pub data: Bytes,
    /// low 16 bits of the sender's millisecond clock when the payload was (last) sent, echoed
    ///  back in the acknowledgement. 0 for retransmissions.
    pub rtt: u16,
}
impl Debug for Payload {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Payload{{circuit:{}, seq:{}, flags:{}, len:{}}}", self.circuit_id, self.sequence, self.flags, self.data.len())
    }
}
impl Payload {
    pub fn new(circuit_id: impl Into<String>, originator: Originator, sequence: i32, data: Bytes) -> Payload {
        Payload {
            circuit_id: circuit_id.into(),
            flags: originator.flags(),
            sequence,
            headers: Default::default(),
            data,
            rtt: 0,
        }
    }

    pub fn originator(&self) -> Originator {
        Originator::from_flags(self.flags)
    }

    pub fn is_circuit_end(&self) -> bool {
        self.flags & PAYLOAD_FLAG_CIRCUIT_END != 0
    }

    pub fn is_circuit_start(&self) -> bool {
        self.flags & PAYLOAD_FLAG_CIRCUIT_START != 0
    }

    pub fn size(&self) -> u32 {
        u32::try_from(self.data.len()).unwrap_or(u32::MAX)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.circuit_id);
        buf.put_u32(self.flags);
        buf.put_i32(self.sequence);
        buf.put_u16(self.rtt);
        put_headers(buf, &self.headers);
        put_bytes(buf, &self.data);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Payload> {
        let circuit_id = try_get_string(buf)?;
        let flags = buf.try_get_u32()?;
        let sequence = buf.try_get_i32()?;
        let rtt = buf.try_get_u16()?;
        let headers = try_get_headers(buf)?;
        let data = try_get_bytes(buf)?;
        Ok(Payload {
            circuit_id,
            flags,
            sequence,
            headers,
            data,
            rtt,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Acknowledgement {
    pub circuit_id: String,
    pub flags: u32,
    pub sequences: Vec<i32>,
    /// the acknowledging side's current receive buffer size in bytes
    pub recv_buffer_size: u32,
    pub rtt: u16,
}
impl Acknowledgement {
    pub fn new(circuit_id: impl Into<String>, originator: Originator) -> Acknowledgement {
        Acknowledgement {
            circuit_id: circuit_id.into(),
            flags: originator.flags(),
            sequences: Vec::new(),
            recv_buffer_size: 0,
            rtt: 0,
        }
    }

    pub fn originator(&self) -> Originator {
        Originator::from_flags(self.flags)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.circuit_id);
        buf.put_u32(self.flags);
        buf.put_u32(self.recv_buffer_size);
        buf.put_u16(self.rtt);
        buf.put_usize_varint(self.sequences.len());
        for &sequence in &self.sequences {
            buf.put_i32(sequence);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Acknowledgement> {
        let circuit_id = try_get_string(buf)?;
        let flags = buf.try_get_u32()?;
        let recv_buffer_size = buf.try_get_u32()?;
        let rtt = buf.try_get_u16()?;
        let num_sequences = buf.try_get_usize_varint()?;
        if num_sequences > buf.remaining() / 4 {
            bail!("acknowledgement claims {} sequences, but only {} bytes remain", num_sequences, buf.remaining());
        }
        let mut sequences = Vec::with_capacity(num_sequences);
        for _ in 0..num_sequences {
            sequences.push(buf.try_get_i32()?);
        }
        Ok(Acknowledgement {
            circuit_id,
            flags,
            sequences,
            recv_buffer_size,
            rtt,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlType {
    TraceRoute = 1,
    TraceRouteResponse = 2,
}
impl TryFrom<u32> for ControlType {
    type Error = anyhow::Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ControlType::TraceRoute),
            2 => Ok(ControlType::TraceRouteResponse),
            other => bail!("invalid control type {}", other),
        }
    }
}

pub const CONTROL_HOP_COUNT_HEADER: u8 = 20;
pub const CONTROL_HOP_TYPE_HEADER: u8 = 21;
pub const CONTROL_HOP_ID_HEADER: u8 = 22;
pub const CONTROL_TIMESTAMP_HEADER: u8 = 23;
pub const CONTROL_USER_VAL_HEADER: u8 = 24;
pub const CONTROL_ERROR_HEADER: u8 = 25;

/// In-band control message, currently used for trace routes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Control {
    pub control_type: ControlType,
    pub circuit_id: String,
    pub headers: BTreeMap<u8, Bytes>,
}
impl Control {
    pub fn new_trace_route(circuit_id: impl Into<String>, hops: u32, timestamp: i64, user_val: u32) -> Control {
        let mut headers = BTreeMap::new();
        headers.insert(CONTROL_HOP_COUNT_HEADER, Bytes::copy_from_slice(&hops.to_be_bytes()));
        headers.insert(CONTROL_TIMESTAMP_HEADER, Bytes::copy_from_slice(&timestamp.to_be_bytes()));
        headers.insert(CONTROL_USER_VAL_HEADER, Bytes::copy_from_slice(&user_val.to_be_bytes()));
        Control {
            control_type: ControlType::TraceRoute,
            circuit_id: circuit_id.into(),
            headers,
        }
    }

    pub fn is_trace_route(&self) -> bool {
        self.control_type == ControlType::TraceRoute
    }

    pub fn hop_count(&self) -> u32 {
        self.u32_header(CONTROL_HOP_COUNT_HEADER).unwrap_or(0)
    }

    /// Decrements the remaining hop count, saturating at 0, and returns the new value
    pub fn decrement_and_get_hop(&mut self) -> u32 {
        let hops = self.hop_count().saturating_sub(1);
        self.headers.insert(CONTROL_HOP_COUNT_HEADER, Bytes::copy_from_slice(&hops.to_be_bytes()));
        hops
    }

    /// Creates the response to a trace route, tagged with the type and id of the responding hop.
    ///  All request headers are carried over so the originator can correlate the response.
    pub fn create_trace_response(&self, hop_type: &str, hop_id: &str) -> Control {
        let mut headers = self.headers.clone();
        headers.insert(CONTROL_HOP_TYPE_HEADER, Bytes::copy_from_slice(hop_type.as_bytes()));
        headers.insert(CONTROL_HOP_ID_HEADER, Bytes::copy_from_slice(hop_id.as_bytes()));
        Control {
            control_type: ControlType::TraceRouteResponse,
            circuit_id: self.circuit_id.clone(),
            headers,
        }
    }

    pub fn set_error(&mut self, error: &str) {
        self.headers.insert(CONTROL_ERROR_HEADER, Bytes::copy_from_slice(error.as_bytes()));
    }

    pub fn error(&self) -> Option<String> {
        self.string_header(CONTROL_ERROR_HEADER)
    }

    pub fn hop_type(&self) -> Option<String> {
        self.string_header(CONTROL_HOP_TYPE_HEADER)
    }

    pub fn hop_id(&self) -> Option<String> {
        self.string_header(CONTROL_HOP_ID_HEADER)
    }

    fn u32_header(&self, key: u8) -> Option<u32> {
        let raw: [u8; 4] = self.headers.get(&key)?.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(raw))
    }

    fn string_header(&self, key: u8) -> Option<String> {
        self.headers.get(&key)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.control_type as u32);
        put_string(buf, &self.circuit_id);
        put_headers(buf, &self.headers);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Control> {
        let control_type = ControlType::try_from(buf.try_get_u32()?)?;
        let circuit_id = try_get_string(buf)?;
        let headers = try_get_headers(buf)?;
        Ok(Control {
            control_type,
            circuit_id,
            headers,
        })
    }
}

fn put_headers(buf: &mut BytesMut, headers: &BTreeMap<u8, Bytes>) {
    buf.put_usize_varint(headers.len());
    for (&key, value) in headers {
        buf.put_u8(key);
        put_bytes(buf, value);
    }
}

fn try_get_headers(buf: &mut impl Buf) -> anyhow::Result<BTreeMap<u8, Bytes>> {
    let num_headers = buf.try_get_usize_varint()?;
    let mut headers = BTreeMap::new();
    for _ in 0..num_headers {
        let key = buf.try_get_u8()?;
        let value = try_get_bytes(buf)?;
        headers.insert(key, value);
    }
    Ok(headers)
}

/// Everything that travels between routers over a link
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkFrame {
    Payload(Payload),
    Ack(Acknowledgement),
    Control(Control),
}
impl LinkFrame {
    const ID_PAYLOAD: u8 = 1;
    const ID_ACK: u8 = 2;
    const ID_CONTROL: u8 = 3;

    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            LinkFrame::Payload(p) => {
                buf.put_u8(Self::ID_PAYLOAD);
                p.ser(buf);
            }
            LinkFrame::Ack(a) => {
                buf.put_u8(Self::ID_ACK);
                a.ser(buf);
            }
            LinkFrame::Control(c) => {
                buf.put_u8(Self::ID_CONTROL);
                c.ser(buf);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<LinkFrame> {
        match buf.try_get_u8()? {
            Self::ID_PAYLOAD => Ok(LinkFrame::Payload(Payload::deser(buf)?)),
            Self::ID_ACK => Ok(LinkFrame::Ack(Acknowledgement::deser(buf)?)),
            Self::ID_CONTROL => Ok(LinkFrame::Control(Control::deser(buf)?)),
            id => bail!("invalid link frame id {}", id),
        }
    }
}

/// Returned when a send with a positive timeout could not complete in time. Callers distinguish
///  it from other failures by downcasting, since a timeout does not indicate a broken path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendTimeout;
impl Display for SendTimeout {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("timeout sending message")
    }
}
impl std::error::Error for SendTimeout {}

pub fn is_send_timeout(e: &anyhow::Error) -> bool {
    e.downcast_ref::<SendTimeout>().is_some()
}
