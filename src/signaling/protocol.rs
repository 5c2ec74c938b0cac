#![forbid(unsafe_code)]

// Signaling protocol - request/acknowledgement envelopes and room notifications

use crate::media::types::{ProducerInfo, TransportInfo};
use crate::session::SessionError;
use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw client frame: `{"id": 1, "method": "join", "data": {...}}`.
///
/// Parsed in two steps so a frame with a valid id but a bad method or payload can
/// still be acknowledged.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

impl RequestEnvelope {
    /// Decodes the method and payload into a typed request.
    pub fn into_request(self) -> Result<Request, serde_json::Error> {
        let data = match self.data {
            Value::Null => Value::Object(serde_json::Map::new()),
            data => data,
        };
        serde_json::from_value(serde_json::json!({
            "method": self.method,
            "data": data,
        }))
    }
}

/// Client-to-server requests
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum Request {
    /// Join a room and receive the router capabilities
    #[serde(alias = "joinRoom", rename_all = "camelCase")]
    Join { room_id: String },
    /// Allocate (or replace) the send transport
    #[serde(rename_all = "camelCase")]
    CreateSendTransport {
        #[serde(default)]
        room_id: Option<String>,
    },
    /// Complete the DTLS handshake on the send transport
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        dtls_parameters: DtlsParameters,
        #[serde(default)]
        room_id: Option<String>,
    },
    /// Start (or replace) the outgoing media stream
    #[serde(rename_all = "camelCase")]
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        room_id: Option<String>,
    },
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::CreateSendTransport { .. } => "createSendTransport",
            Self::ConnectTransport { .. } => "connectTransport",
            Self::Produce { .. } => "produce",
        }
    }
}

/// Successful acknowledgement payloads
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Response {
    Capabilities(RtpCapabilitiesFinalized),
    Transport(TransportInfo),
    /// Serializes as `null`
    Connected,
    Producer(ProducerInfo),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckError {
    pub code: String,
    pub message: String,
}

/// Acknowledgement of exactly one request
#[derive(Debug, Clone, Serialize)]
pub struct Ack {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Response>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AckError>,
}

impl Ack {
    pub fn success(id: u64, data: Response) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(id: u64, error: &SessionError) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(AckError {
                code: error.code().to_string(),
                message: error.to_string(),
            }),
        }
    }

    pub fn from_result(id: u64, result: &Result<Response, SessionError>) -> Self {
        match result {
            Ok(data) => Self::success(id, data.clone()),
            Err(e) => Self::failure(id, e),
        }
    }
}

/// Server-pushed room events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum Notification {
    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: String },
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: String },
    #[serde(rename_all = "camelCase")]
    NewProducer {
        peer_id: String,
        producer_id: String,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed { peer_id: String, producer_id: String },
    /// A frame that could not be acknowledged because it carried no usable id
    Error { message: String },
}

/// Server-to-client frames
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Ack(Ack),
    Notification(Notification),
}
