//! Wire frames for the realtime pub/sub service
//!
//! Commands carry a numeric `id` and exactly one method object. The server
//! answers with a reply echoing the `id`, or sends a `push` (publications,
//! disconnects) without one. An empty object `{}` is a keepalive ping, and the
//! client answers with `{}` when pongs were negotiated. A single text frame may
//! hold several JSON objects separated by newlines.

use serde::{Deserialize, Serialize};

/// Empty object used as the keepalive pong
pub const PONG_FRAME: &str = "{}";

/// Commands sent from client to server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Authenticate the connection
    Connect { token: String, name: String },

    /// Subscribe to a channel
    Subscribe { channel: String },

    /// Unsubscribe from a channel
    Unsubscribe { channel: String },
}

#[derive(Serialize)]
struct CommandFrame<'a> {
    id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    connect: Option<ConnectRequest<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subscribe: Option<ChannelRequest<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unsubscribe: Option<ChannelRequest<'a>>,
}

#[derive(Serialize)]
struct ConnectRequest<'a> {
    token: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
struct ChannelRequest<'a> {
    channel: &'a str,
}

impl ClientMessage {
    /// Encode as a command frame with the given id
    pub fn encode(&self, id: u32) -> serde_json::Result<String> {
        let mut frame = CommandFrame {
            id,
            connect: None,
            subscribe: None,
            unsubscribe: None,
        };
        match self {
            ClientMessage::Connect { token, name } => {
                frame.connect = Some(ConnectRequest { token, name })
            }
            ClientMessage::Subscribe { channel } => {
                frame.subscribe = Some(ChannelRequest { channel })
            }
            ClientMessage::Unsubscribe { channel } => {
                frame.unsubscribe = Some(ChannelRequest { channel })
            }
        }
        serde_json::to_string(&frame)
    }
}

/// Raw server frame; at most one of the optional sections is set
#[derive(Debug, Clone, Default, Deserialize)]
struct ReplyFrame {
    #[serde(default)]
    id: Option<u32>,
    #[serde(default)]
    error: Option<ReplyError>,
    #[serde(default)]
    connect: Option<ConnectResult>,
    #[serde(default)]
    push: Option<PushFrame>,
}

/// Error attached to a reply
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReplyError {
    pub code: u32,
    #[serde(default)]
    pub message: String,
}

/// Result of a successful connect
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConnectResult {
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Server ping interval in seconds
    #[serde(default)]
    pub ping: Option<u32>,
    /// Whether the server expects pongs
    #[serde(default)]
    pub pong: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PushFrame {
    #[serde(default)]
    channel: String,
    #[serde(default, rename = "pub")]
    publication: Option<PublicationFrame>,
    #[serde(default)]
    disconnect: Option<DisconnectFrame>,
    #[serde(default)]
    unsubscribe: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct PublicationFrame {
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct DisconnectFrame {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    reason: String,
}

/// Messages received from server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Keepalive ping
    Ping,

    /// Connect accepted
    Connected { id: u32, result: ConnectResult },

    /// Non-connect command accepted
    Ack { id: u32 },

    /// Command rejected
    Rejected { id: u32, error: ReplyError },

    /// Publication on a subscribed channel
    Publication {
        channel: String,
        data: serde_json::Value,
    },

    /// Server is closing the connection
    Disconnect { code: u32, reason: String },

    /// Server dropped a subscription
    Unsubscribed { channel: String },

    /// Anything this client does not act on
    Unknown,
}

impl From<ReplyFrame> for ServerMessage {
    fn from(frame: ReplyFrame) -> Self {
        if let Some(push) = frame.push {
            if let Some(publication) = push.publication {
                return ServerMessage::Publication {
                    channel: push.channel,
                    data: publication.data,
                };
            }
            if let Some(disconnect) = push.disconnect {
                return ServerMessage::Disconnect {
                    code: disconnect.code,
                    reason: disconnect.reason,
                };
            }
            if push.unsubscribe.is_some() {
                return ServerMessage::Unsubscribed {
                    channel: push.channel,
                };
            }
            return ServerMessage::Unknown;
        }

        match (frame.id, frame.error, frame.connect) {
            (Some(id), Some(error), _) => ServerMessage::Rejected { id, error },
            (Some(id), None, Some(result)) => ServerMessage::Connected { id, result },
            (Some(id), None, None) => ServerMessage::Ack { id },
            (None, None, None) => ServerMessage::Ping,
            _ => ServerMessage::Unknown,
        }
    }
}

/// Decode every JSON object in a text frame
pub fn decode_frame(text: &str) -> Vec<serde_json::Result<ServerMessage>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str::<ReplyFrame>(line).map(ServerMessage::from))
        .collect()
}
