//! Envelope codec: MessagePack array with routing header and a trailing opaque payload.
//!
//! ```text
//! SERVICE: [0, hubId, (terminalId), methodId, payload]
//! RPC:     [1, hubId, (terminalId), methodId, rpcTarget, payload]
//! PING:    [2, pingId]
//! ```
//!
//! Inbound frames are only peeked: the header is read and the offset of the payload is
//! recorded, so the resolved hub can decode its own parameters.

use std::fmt;

/// Message kind, always the first array element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Service = 0,
    Rpc = 1,
    Ping = 2,
}

impl TryFrom<u8> for MessageType {
    type Error = EnvelopeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(MessageType::Service),
            1 => Ok(MessageType::Rpc),
            2 => Ok(MessageType::Ping),
            other => Err(EnvelopeError::UnknownMessageType(other)),
        }
    }
}

/// Which remote clients should receive a relayed RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RpcTarget {
    /// Every client in the room, sender included.
    All = 0,
    /// Every client except the sender.
    Others = 1,
    /// Only the sending client.
    Caller = 2,
}

impl TryFrom<u8> for RpcTarget {
    type Error = EnvelopeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(RpcTarget::All),
            1 => Ok(RpcTarget::Others),
            2 => Ok(RpcTarget::Caller),
            other => Err(EnvelopeError::UnknownRpcTarget(other)),
        }
    }
}

impl std::str::FromStr for RpcTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "all" => Ok(RpcTarget::All),
            "others" => Ok(RpcTarget::Others),
            "caller" | "self" => Ok(RpcTarget::Caller),
            other => Err(format!("unknown rpc target: {}", other)),
        }
    }
}

/// Whether the terminal id is on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnvelopeLayout {
    /// `[type, hubId, methodId, ...]`; terminal id is implicitly 0.
    #[default]
    Single,
    /// `[type, hubId, terminalId, methodId, ...]`.
    MultiTerminal,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope read failed: {0}")]
    Read(String),
    #[error("envelope write failed: {0}")]
    Write(String),
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),
    #[error("unknown rpc target: {0}")]
    UnknownRpcTarget(u8),
    #[error("{kind:?} envelope expects {expected} fields, found {found}")]
    FieldCount {
        kind: MessageType,
        expected: u32,
        found: u32,
    },
    #[error("envelope has no payload value")]
    MissingPayload,
    #[error("rpc envelope without rpc target")]
    MissingRpcTarget,
    #[error("payload must be exactly one MessagePack value ({len} bytes given)")]
    InvalidPayload { len: usize },
}

fn read_err<E: fmt::Display>(e: E) -> EnvelopeError {
    EnvelopeError::Read(e.to_string())
}

fn write_err<E: fmt::Display>(e: E) -> EnvelopeError {
    EnvelopeError::Write(e.to_string())
}

const NIL: u8 = 0xc0;

/// True when `bytes` holds one complete MessagePack value and nothing after it.
fn is_single_value(bytes: &[u8]) -> bool {
    matches!(rmp::decode::MessageLen::len_of(bytes), Ok(len) if len == bytes.len())
}

/// One wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Call {
        message_type: MessageType,
        hub_id: u8,
        terminal_id: u8,
        method_id: i16,
        /// Present only for RPC.
        rpc_target: Option<RpcTarget>,
        /// One serialized MessagePack value. `None`, an empty buffer and a bare nil are all
        /// written as nil and read back as `None`.
        payload: Option<Vec<u8>>,
    },
    Ping {
        ping_id: i32,
    },
}

impl Envelope {
    pub fn service(hub_id: u8, terminal_id: u8, method_id: i16, payload: Option<Vec<u8>>) -> Self {
        Envelope::Call {
            message_type: MessageType::Service,
            hub_id,
            terminal_id,
            method_id,
            rpc_target: None,
            payload,
        }
    }

    pub fn rpc(
        hub_id: u8,
        terminal_id: u8,
        method_id: i16,
        rpc_target: RpcTarget,
        payload: Option<Vec<u8>>,
    ) -> Self {
        Envelope::Call {
            message_type: MessageType::Rpc,
            hub_id,
            terminal_id,
            method_id,
            rpc_target: Some(rpc_target),
            payload,
        }
    }

    pub fn ping(ping_id: i32) -> Self {
        Envelope::Ping { ping_id }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Envelope::Call { message_type, .. } => *message_type,
            Envelope::Ping { .. } => MessageType::Ping,
        }
    }
}

/// Header of a SERVICE or RPC frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallHeader {
    pub message_type: MessageType,
    pub hub_id: u8,
    pub terminal_id: u8,
    pub method_id: i16,
    pub rpc_target: Option<RpcTarget>,
    /// Byte offset of the payload value inside the frame.
    pub params_offset: usize,
}

/// Result of peeking at a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    Ping { ping_id: i32 },
    Call(CallHeader),
}

fn field_count(message_type: MessageType, layout: EnvelopeLayout) -> u32 {
    let terminal = match layout {
        EnvelopeLayout::Single => 0,
        EnvelopeLayout::MultiTerminal => 1,
    };
    match message_type {
        MessageType::Ping => 2,
        MessageType::Service => 4 + terminal,
        MessageType::Rpc => 5 + terminal,
    }
}

/// Encode an envelope into one binary frame.
pub fn encode(envelope: &Envelope, layout: EnvelopeLayout) -> Result<Vec<u8>, EnvelopeError> {
    let mut out = Vec::with_capacity(16);
    match envelope {
        Envelope::Ping { ping_id } => {
            rmp::encode::write_array_len(&mut out, field_count(MessageType::Ping, layout))
                .map_err(write_err)?;
            rmp::encode::write_uint(&mut out, MessageType::Ping as u64).map_err(write_err)?;
            rmp::encode::write_sint(&mut out, i64::from(*ping_id)).map_err(write_err)?;
        }
        Envelope::Call {
            message_type,
            hub_id,
            terminal_id,
            method_id,
            rpc_target,
            payload,
        } => {
            rmp::encode::write_array_len(&mut out, field_count(*message_type, layout))
                .map_err(write_err)?;
            rmp::encode::write_uint(&mut out, *message_type as u64).map_err(write_err)?;
            rmp::encode::write_uint(&mut out, u64::from(*hub_id)).map_err(write_err)?;
            if layout == EnvelopeLayout::MultiTerminal {
                rmp::encode::write_uint(&mut out, u64::from(*terminal_id)).map_err(write_err)?;
            }
            rmp::encode::write_sint(&mut out, i64::from(*method_id)).map_err(write_err)?;
            match (message_type, rpc_target) {
                (MessageType::Rpc, Some(target)) => {
                    rmp::encode::write_uint(&mut out, *target as u64).map_err(write_err)?;
                }
                (MessageType::Rpc, None) => return Err(EnvelopeError::MissingRpcTarget),
                _ => {}
            }
            match payload.as_deref() {
                None | Some([]) | Some([NIL]) => {
                    rmp::encode::write_nil(&mut out).map_err(write_err)?
                }
                Some(bytes) if is_single_value(bytes) => out.extend_from_slice(bytes),
                Some(bytes) => return Err(EnvelopeError::InvalidPayload { len: bytes.len() }),
            }
        }
    }
    Ok(out)
}

/// Read the header of `frame` without touching the payload.
pub fn peek(frame: &[u8], layout: EnvelopeLayout) -> Result<Header, EnvelopeError> {
    let mut rd: &[u8] = frame;
    let found = rmp::decode::read_array_len(&mut rd).map_err(read_err)?;
    let message_type = MessageType::try_from(rmp::decode::read_int::<u8, _>(&mut rd).map_err(read_err)?)?;

    let expected = field_count(message_type, layout);
    if found != expected {
        return Err(EnvelopeError::FieldCount {
            kind: message_type,
            expected,
            found,
        });
    }

    if message_type == MessageType::Ping {
        let ping_id = rmp::decode::read_int::<i32, _>(&mut rd).map_err(read_err)?;
        return Ok(Header::Ping { ping_id });
    }

    let hub_id = rmp::decode::read_int::<u8, _>(&mut rd).map_err(read_err)?;
    let terminal_id = match layout {
        EnvelopeLayout::Single => 0,
        EnvelopeLayout::MultiTerminal => rmp::decode::read_int::<u8, _>(&mut rd).map_err(read_err)?,
    };
    let method_id = rmp::decode::read_int::<i16, _>(&mut rd).map_err(read_err)?;
    let rpc_target = if message_type == MessageType::Rpc {
        Some(RpcTarget::try_from(rmp::decode::read_int::<u8, _>(&mut rd).map_err(read_err)?)?)
    } else {
        None
    };
    if rd.is_empty() {
        return Err(EnvelopeError::MissingPayload);
    }
    if !is_single_value(rd) {
        return Err(EnvelopeError::InvalidPayload { len: rd.len() });
    }

    Ok(Header::Call(CallHeader {
        message_type,
        hub_id,
        terminal_id,
        method_id,
        rpc_target,
        params_offset: frame.len() - rd.len(),
    }))
}

/// Payload bytes at `offset`, or `None` when the value there is nil.
pub fn payload_at(frame: &[u8], offset: usize) -> Option<&[u8]> {
    match frame.get(offset..) {
        None | Some([]) | Some([NIL]) => None,
        Some(rest) => Some(rest),
    }
}

/// Fully decode a frame, copying the payload out.
pub fn decode(frame: &[u8], layout: EnvelopeLayout) -> Result<Envelope, EnvelopeError> {
    match peek(frame, layout)? {
        Header::Ping { ping_id } => Ok(Envelope::Ping { ping_id }),
        Header::Call(h) => Ok(Envelope::Call {
            message_type: h.message_type,
            hub_id: h.hub_id,
            terminal_id: h.terminal_id,
            method_id: h.method_id,
            rpc_target: h.rpc_target,
            payload: payload_at(frame, h.params_offset).map(<[u8]>::to_vec),
        }),
    }
}
