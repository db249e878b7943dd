//! Signaling wire format.
//!
//! Every frame is one JSON text message.
//!
//! Client to server:
//!
//! ```json
//! {"id": 7, "method": "produce", "data": {"kind": "video", "rtpParameters": {}, "producerTransportId": "..."}}
//! ```
//!
//! `id` correlates the response and is omitted for fire-and-forget methods
//! (`getProducers`, `producerClosed`). Responses are
//! `{"id": 7, "ok": true, "data": ...}` or
//! `{"id": 7, "ok": false, "error": {"code": "...", "message": "..."}}`.
//! Events pushed by the server are `{"event": "<name>", "data": ...}`.
//!
//! Payloads are decoded into [`ClientRequest`] before any room is touched;
//! anything that fails to decode is rejected with `invalid_message`.

use crate::errors::RcError;
use crate::media::{MediaKind, MediaSource};
use common::types::{ConsumerId, ProducerId, RoomId, TransportId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope of every client frame.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFrame {
    #[serde(default)]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

impl RawFrame {
    /// Decode a text frame.
    ///
    /// On failure, returns the error together with whatever `id` could be
    /// recovered so the rejection can still be correlated.
    pub fn decode(text: &str) -> Result<Self, (Option<u64>, RcError)> {
        serde_json::from_str(text).map_err(|e| {
            let id = serde_json::from_str::<Value>(text)
                .ok()
                .and_then(|v| v.get("id").and_then(Value::as_u64));
            (id, RcError::InvalidMessage(e.to_string()))
        })
    }
}

/// A validated client request.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    CreateRoom {
        room_id: RoomId,
    },
    Join {
        room_id: RoomId,
        name: String,
    },
    GetProducers,
    GetRouterRtpCapabilities,
    CreateWebRtcTransport,
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: Value,
    },
    Produce {
        kind: MediaKind,
        rtp_parameters: Value,
        producer_transport_id: TransportId,
        source: Option<MediaSource>,
    },
    Consume {
        consumer_transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: Value,
    },
    Resume {
        consumer_id: ConsumerId,
    },
    GetMyRoomInfo,
    ProducerClosed {
        producer_id: ProducerId,
    },
    ExitRoom,
    ReportMediaError {
        source: MediaSource,
        message: String,
    },
}

#[derive(Deserialize)]
struct CreateRoomData {
    room_id: RoomId,
}

#[derive(Deserialize)]
struct JoinData {
    room_id: RoomId,
    name: String,
}

#[derive(Deserialize)]
struct ConnectTransportData {
    transport_id: TransportId,
    #[serde(rename = "dtlsParameters")]
    dtls_parameters: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProduceData {
    kind: MediaKind,
    rtp_parameters: Value,
    producer_transport_id: TransportId,
    #[serde(default)]
    source: Option<MediaSource>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumeData {
    consumer_transport_id: TransportId,
    producer_id: ProducerId,
    rtp_capabilities: Value,
}

#[derive(Deserialize)]
struct ResumeData {
    consumer_id: ConsumerId,
}

#[derive(Deserialize)]
struct ProducerClosedData {
    producer_id: ProducerId,
}

#[derive(Deserialize)]
struct MediaErrorData {
    source: MediaSource,
    message: String,
}

fn payload<T: DeserializeOwned>(method: &str, data: Value) -> Result<T, RcError> {
    serde_json::from_value(data)
        .map_err(|e| RcError::InvalidMessage(format!("{method}: {e}")))
}

impl ClientRequest {
    /// Validate `data` against the payload shape of `method`.
    ///
    /// # Errors
    ///
    /// `RcError::InvalidMessage` for unknown methods and malformed payloads.
    pub fn parse(method: &str, data: Value) -> Result<Self, RcError> {
        let request = match method {
            "createRoom" => {
                let d: CreateRoomData = payload(method, data)?;
                ClientRequest::CreateRoom { room_id: d.room_id }
            }
            "join" => {
                let d: JoinData = payload(method, data)?;
                ClientRequest::Join {
                    room_id: d.room_id,
                    name: d.name,
                }
            }
            "getProducers" => ClientRequest::GetProducers,
            "getRouterRtpCapabilities" => ClientRequest::GetRouterRtpCapabilities,
            "createWebRtcTransport" => ClientRequest::CreateWebRtcTransport,
            "connectTransport" => {
                let d: ConnectTransportData = payload(method, data)?;
                ClientRequest::ConnectTransport {
                    transport_id: d.transport_id,
                    dtls_parameters: d.dtls_parameters,
                }
            }
            "produce" => {
                let d: ProduceData = payload(method, data)?;
                ClientRequest::Produce {
                    kind: d.kind,
                    rtp_parameters: d.rtp_parameters,
                    producer_transport_id: d.producer_transport_id,
                    source: d.source,
                }
            }
            "consume" => {
                let d: ConsumeData = payload(method, data)?;
                ClientRequest::Consume {
                    consumer_transport_id: d.consumer_transport_id,
                    producer_id: d.producer_id,
                    rtp_capabilities: d.rtp_capabilities,
                }
            }
            "resume" => {
                let d: ResumeData = payload(method, data)?;
                ClientRequest::Resume {
                    consumer_id: d.consumer_id,
                }
            }
            "getMyRoomInfo" => ClientRequest::GetMyRoomInfo,
            "producerClosed" => {
                let d: ProducerClosedData = payload(method, data)?;
                ClientRequest::ProducerClosed {
                    producer_id: d.producer_id,
                }
            }
            "exitRoom" => ClientRequest::ExitRoom,
            "reportMediaError" => {
                let d: MediaErrorData = payload(method, data)?;
                ClientRequest::ReportMediaError {
                    source: d.source,
                    message: d.message,
                }
            }
            other => {
                return Err(RcError::InvalidMessage(format!("unknown method '{other}'")));
            }
        };
        Ok(request)
    }

    /// Wire name of the request, used as a metric label.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            ClientRequest::CreateRoom { .. } => "createRoom",
            ClientRequest::Join { .. } => "join",
            ClientRequest::GetProducers => "getProducers",
            ClientRequest::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            ClientRequest::CreateWebRtcTransport => "createWebRtcTransport",
            ClientRequest::ConnectTransport { .. } => "connectTransport",
            ClientRequest::Produce { .. } => "produce",
            ClientRequest::Consume { .. } => "consume",
            ClientRequest::Resume { .. } => "resume",
            ClientRequest::GetMyRoomInfo => "getMyRoomInfo",
            ClientRequest::ProducerClosed { .. } => "producerClosed",
            ClientRequest::ExitRoom => "exitRoom",
            ClientRequest::ReportMediaError { .. } => "reportMediaError",
        }
    }

    /// Fire-and-forget methods never get a response frame.
    #[must_use]
    pub const fn expects_response(&self) -> bool {
        !matches!(
            self,
            ClientRequest::GetProducers | ClientRequest::ProducerClosed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&RcError> for ErrorBody {
    fn from(err: &RcError) -> Self {
        Self {
            code: err.error_code().to_string(),
            message: err.client_message(),
        }
    }
}

/// Response to one client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    #[serde(default)]
    pub id: Option<u64>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseFrame {
    #[must_use]
    pub fn success(id: Option<u64>, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(id: Option<u64>, err: &RcError) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(ErrorBody::from(err)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_and_parse_produce() {
        let frame = RawFrame::decode(
            r#"{"id":3,"method":"produce","data":{"kind":"video","rtpParameters":{"codecs":[]},"producerTransportId":"t-1","source":"screen"}}"#,
        )
        .unwrap();
        assert_eq!(frame.id, Some(3));

        let request = ClientRequest::parse(&frame.method, frame.data).unwrap();
        assert_eq!(
            request,
            ClientRequest::Produce {
                kind: MediaKind::Video,
                rtp_parameters: json!({"codecs": []}),
                producer_transport_id: TransportId::from("t-1"),
                source: Some(MediaSource::Screen),
            }
        );
        assert!(request.expects_response());
    }

    #[test]
    fn test_methods_without_payload() {
        let request = ClientRequest::parse("getProducers", Value::Null).unwrap();
        assert_eq!(request, ClientRequest::GetProducers);
        assert!(!request.expects_response());

        assert_eq!(
            ClientRequest::parse("exitRoom", Value::Null).unwrap().method(),
            "exitRoom"
        );
    }

    #[test]
    fn test_wire_field_names() {
        let request = ClientRequest::parse(
            "connectTransport",
            json!({"transport_id": "t-9", "dtlsParameters": {"role": "client"}}),
        )
        .unwrap();
        assert!(matches!(
            request,
            ClientRequest::ConnectTransport { ref transport_id, .. } if transport_id.as_str() == "t-9"
        ));

        let request = ClientRequest::parse(
            "consume",
            json!({"consumerTransportId": "t-2", "producerId": "p-1", "rtpCapabilities": {}}),
        )
        .unwrap();
        assert_eq!(request.method(), "consume");
    }

    #[test]
    fn test_rejects_unknown_method_and_bad_payload() {
        let unknown = ClientRequest::parse("teleport", Value::Null);
        assert!(matches!(unknown, Err(RcError::InvalidMessage(_))));

        let missing_name = ClientRequest::parse("join", json!({"room_id": "R1"}));
        assert!(matches!(missing_name, Err(RcError::InvalidMessage(_))));

        let bad_kind = ClientRequest::parse(
            "produce",
            json!({"kind": "hologram", "rtpParameters": {}, "producerTransportId": "t"}),
        );
        assert!(matches!(bad_kind, Err(RcError::InvalidMessage(_))));
    }

    #[test]
    fn test_decode_recovers_id_from_bad_frame() {
        let (id, err) = RawFrame::decode(r#"{"id":12,"data":{}}"#).unwrap_err();
        assert_eq!(id, Some(12));
        assert_eq!(err.error_code(), "invalid_message");

        let (id, _) = RawFrame::decode("not json").unwrap_err();
        assert_eq!(id, None);
    }

    #[test]
    fn test_response_frames() {
        let ok = serde_json::to_value(ResponseFrame::success(Some(1), json!("success"))).unwrap();
        assert_eq!(ok, json!({"id": 1, "ok": true, "data": "success"}));

        let err = ResponseFrame::failure(Some(2), &RcError::NotJoined);
        let value = serde_json::to_value(err).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"]["code"], "not_joined");
    }
}
