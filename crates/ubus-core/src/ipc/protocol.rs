//! Socket protocol types and framing.
//!
//! Every message is a 4-byte big-endian length prefix followed by a UTF-8
//! JSON payload. Encoded attribute streams travel as hex strings.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Requests that need an answer carry a `seq` chosen by the client; the
//! broker echoes it in the matching `status` or `objects` message.

use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::reactor::{
    BusEvent, CallId, InboundRequest, ListenerId, MethodInfo, ObjectId, ObjectInfo, RequestId, Status,
};
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::Write;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

mod hex_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Messages sent by a client to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    AddObject {
        seq: u64,
        name: String,
        methods: Vec<MethodInfo>,
    },
    RemoveObject {
        seq: u64,
        object: ObjectId,
    },
    Subscribe {
        seq: u64,
        pattern: String,
    },
    Unsubscribe {
        seq: u64,
        listener: ListenerId,
    },
    Lookup {
        seq: u64,
        path: String,
    },
    /// The `seq` doubles as the call id for the replies.
    Invoke {
        seq: u64,
        object: ObjectId,
        method: String,
        #[serde(with = "hex_bytes")]
        args: Bytes,
    },
    Reply {
        request: RequestId,
        #[serde(with = "hex_bytes")]
        data: Bytes,
    },
    Complete {
        request: RequestId,
        status: Status,
    },
    Publish {
        seq: u64,
        event: String,
        #[serde(with = "hex_bytes")]
        data: Bytes,
    },
}

/// Messages sent by the broker to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerMessage {
    Status {
        seq: u64,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u32>,
    },
    Objects {
        seq: u64,
        objects: Vec<ObjectInfo>,
    },
    Request {
        request: RequestId,
        object: ObjectId,
        method: String,
        #[serde(with = "hex_bytes")]
        args: Bytes,
    },
    Event {
        listener: ListenerId,
        event: String,
        #[serde(with = "hex_bytes")]
        data: Bytes,
    },
    Data {
        call: CallId,
        #[serde(with = "hex_bytes")]
        data: Bytes,
    },
    Complete {
        call: CallId,
        status: Status,
    },
}

impl BrokerMessage {
    /// Acknowledge a request.
    pub fn ack(seq: u64, result: std::result::Result<Option<u32>, Status>) -> Self {
        match result {
            Ok(id) => BrokerMessage::Status {
                seq,
                status: Status::Ok,
                id,
            },
            Err(status) => BrokerMessage::Status {
                seq,
                status,
                id: None,
            },
        }
    }

    /// Sequence number of an acknowledgment, `None` for pushed traffic.
    pub fn seq(&self) -> Option<u64> {
        match self {
            BrokerMessage::Status { seq, .. } | BrokerMessage::Objects { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    /// Convert pushed traffic into a reactor event.
    pub fn into_event(self) -> Option<BusEvent> {
        let event = match self {
            BrokerMessage::Request {
                request,
                object,
                method,
                args,
            } => BusEvent::Request(InboundRequest {
                id: request,
                object,
                method,
                args,
            }),
            BrokerMessage::Event {
                listener,
                event,
                data,
            } => BusEvent::Event {
                listener,
                event,
                data,
            },
            BrokerMessage::Data { call, data } => BusEvent::Data { call, data },
            BrokerMessage::Complete { call, status } => BusEvent::Complete { call, status },
            BrokerMessage::Status { .. } | BrokerMessage::Objects { .. } => return None,
        };
        Some(event)
    }
}

impl From<BusEvent> for BrokerMessage {
    fn from(event: BusEvent) -> Self {
        match event {
            BusEvent::Request(request) => BrokerMessage::Request {
                request: request.id,
                object: request.object,
                method: request.method,
                args: request.args,
            },
            BusEvent::Event {
                listener,
                event,
                data,
            } => BrokerMessage::Event {
                listener,
                event,
                data,
            },
            BusEvent::Data { call, data } => BrokerMessage::Data { call, data },
            BusEvent::Complete { call, status } => BrokerMessage::Complete { call, status },
        }
    }
}

fn oversized(len: usize) -> BusError {
    BusError::Transport {
        message: format!(
            "IPC frame size {} exceeds maximum {}",
            len,
            BusConfig::MAX_FRAME_SIZE
        ),
        source: None,
    }
}

fn check_len(len: usize) -> Result<u32> {
    if len > BusConfig::MAX_FRAME_SIZE {
        return Err(oversized(len));
    }
    Ok(len as u32)
}

/// Serialize a message into a complete frame.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(message)?;
    check_len(payload.len())?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write a length-prefixed frame to a blocking writer.
pub fn write_frame_sync<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = check_len(payload.len())?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Incremental frame decoder for a blocking reader.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Take the next complete frame payload, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > BusConfig::MAX_FRAME_SIZE {
            return Err(oversized(len));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        self.buf.advance(4);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > BusConfig::MAX_FRAME_SIZE {
        return Err(oversized(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = check_len(payload.len())?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
