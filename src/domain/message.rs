//! The message envelope exchanged in-process and across driver pipes.
//!
//! A [`Message`] is addressed by a two-level routing key (`channel`,
//! `subject`), carries free-form string labels, and a payload that is
//! either raw bytes (as read from or written to the wire) or a decoded
//! JSON value. Conversion between the two payload states is always
//! explicit.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// String label map carried by every message.
pub type Labels = BTreeMap<String, String>;

/// Well-known label names.
pub mod label {
    pub const RPC_ID: &str = "rpcID";
    pub const FEATURE: &str = "feature";
    pub const METHOD: &str = "method";
    pub const CALLER: &str = "caller";
    pub const STATUS: &str = "status";
    pub const ERROR: &str = "error";
    pub const SESSION_ID: &str = "sessionID";
    pub const RETRY: &str = "retry";
    pub const TIMEOUT: &str = "timeout";
    pub const BACKOFF_MS: &str = "backoff_ms";
    /// Echoed back on `state:pong` to pair it with its ping
    pub const NONCE: &str = "nonce";
}

/// Well-known channels.
pub mod channel {
    pub const COMMAND: &str = "command";
    pub const RPC: &str = "rpc";
    pub const STATE: &str = "state";
}

/// Well-known subjects.
pub mod subject {
    pub const OPTIONS: &str = "options";
    pub const START: &str = "start";
    pub const CALL: &str = "call";
    pub const RETURN: &str = "return";
    pub const ALIVE: &str = "alive";
    pub const COLD: &str = "cold";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
}

/// `rpcID` value meaning "no reply expected".
pub const NO_REPLY_ID: &str = "skip";

/// `caller` value meaning "this call originates here, it is not relayed".
pub const ORIGIN_CALLER: &str = "-";

/// `status` label values.
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";

/// Message payload: encoded bytes or a decoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Encoded JSON bytes (wire form)
    Raw(Vec<u8>),

    /// Decoded value (in-process form)
    Value(Value),
}

impl Default for Payload {
    fn default() -> Self {
        Self::Raw(Vec::new())
    }
}

/// In-process reply channel handed to synchronous handlers.
///
/// Never serialized: a message read from the wire never has one.
#[derive(Clone)]
pub struct Reply(mpsc::Sender<Message>);

impl Reply {
    /// Create a reply slot and its receiving end.
    pub fn channel() -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(1);
        (Self(tx), rx)
    }

    /// Deliver a reply. Returns false if nobody is waiting any more.
    pub async fn send(&self, message: Message) -> bool {
        self.0.send(message).await.is_ok()
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Reply")
    }
}

/// The universal envelope.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub channel: String,
    pub subject: String,
    pub labels: Labels,
    pub payload: Payload,
    pub reply: Option<Reply>,
}

impl Message {
    /// Create an empty message for a routing key
    pub fn new(channel: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            subject: subject.into(),
            ..Default::default()
        }
    }

    /// Builder: set a label
    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    /// Builder: set a raw payload
    pub fn with_raw(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.payload = Payload::Raw(bytes.into());
        self
    }

    /// Builder: set a decoded payload
    pub fn with_value(mut self, value: Value) -> Self {
        self.payload = Payload::Value(value);
        self
    }

    /// Builder: serialize any value into the payload
    pub fn with_json<T: Serialize>(self, value: &T) -> Result<Self, serde_json::Error> {
        Ok(self.with_value(serde_json::to_value(value)?))
    }

    /// Builder: attach a reply slot
    pub fn with_reply(mut self, reply: Reply) -> Self {
        self.reply = Some(reply);
        self
    }

    /// Get a label value
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    /// Set a label value, replacing any previous one
    pub fn set_label(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(name.into(), value.into());
    }

    /// The `"channel:subject"` dispatch key
    pub fn key(&self) -> String {
        format!("{}:{}", self.channel, self.subject)
    }

    /// Check the routing key
    pub fn is(&self, channel: &str, subject: &str) -> bool {
        self.channel == channel && self.subject == subject
    }

    /// Whether the payload currently holds encoded bytes
    pub fn is_raw(&self) -> bool {
        matches!(self.payload, Payload::Raw(_))
    }

    /// Encode a decoded payload to bytes. No-op when already raw.
    pub fn encode_payload(&mut self) -> Result<(), serde_json::Error> {
        if let Payload::Value(value) = &self.payload {
            self.payload = Payload::Raw(serde_json::to_vec(value)?);
        }
        Ok(())
    }

    /// Decode a raw payload to a value. No-op when already decoded.
    ///
    /// An empty raw payload decodes to `null`.
    pub fn decode_payload(&mut self) -> Result<(), serde_json::Error> {
        if let Payload::Raw(bytes) = &self.payload {
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(bytes)?
            };
            self.payload = Payload::Value(value);
        }
        Ok(())
    }

    /// Payload as bytes, encoding a decoded value on the fly
    pub fn payload_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match &self.payload {
            Payload::Raw(bytes) => Ok(bytes.clone()),
            Payload::Value(value) => serde_json::to_vec(value),
        }
    }

    /// Deserialize the payload into a typed value
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.payload {
            Payload::Raw(bytes) if bytes.is_empty() => serde_json::from_value(Value::Null),
            Payload::Raw(bytes) => serde_json::from_slice(bytes),
            Payload::Value(value) => serde_json::from_value(value.clone()),
        }
    }

    /// Copy of this message without its in-process reply slot
    pub fn detached(&self) -> Self {
        Self {
            reply: None,
            ..self.clone()
        }
    }
}
