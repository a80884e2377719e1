//! Signaling messages exchanged between callers, the signaling server and answerers.

use chrono::{DateTime, Utc};
use rpc_webrtc::{Code, Status};
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

/// Terminal error carried on the signaling wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorStatus {
    pub code: Code,
    pub message: String,
}

impl From<Status> for ErrorStatus {
    fn from(status: Status) -> Self {
        Self {
            code: status.code,
            message: status.message,
        }
    }
}

impl From<ErrorStatus> for Status {
    fn from(status: ErrorStatus) -> Self {
        Status::new(status.code, status.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,
}

impl From<IceServer> for RTCIceServer {
    fn from(server: IceServer) -> Self {
        RTCIceServer {
            urls: server.urls,
            username: server.username,
            credential: server.credential,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebRtcConfig {
    #[serde(default)]
    pub additional_ice_servers: Vec<IceServer>,
}

impl WebRtcConfig {
    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.additional_ice_servers
            .iter()
            .cloned()
            .map(RTCIceServer::from)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
    pub sdp: String,
    #[serde(default)]
    pub disable_trickle: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallResponse {
    pub uuid: String,
    #[serde(flatten)]
    pub stage: CallResponseStage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum CallResponseStage {
    Init { sdp: String },
    Update { candidate: IceCandidate },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallUpdateRequest {
    pub uuid: String,
    #[serde(flatten)]
    pub update: CallUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "update", rename_all = "snake_case")]
pub enum CallUpdate {
    Candidate { candidate: IceCandidate },
    Done,
    Error { status: ErrorStatus },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallUpdateResponse {}

/// Server to answerer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerRequest {
    pub uuid: String,
    #[serde(flatten)]
    pub stage: AnswerRequestStage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum AnswerRequestStage {
    Init {
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        optional_config: Option<WebRtcConfig>,
        #[serde(default)]
        disable_trickle: bool,
        deadline: DateTime<Utc>,
    },
    Update {
        candidate: IceCandidate,
    },
    Done,
    Error {
        status: ErrorStatus,
    },
}

/// Answerer to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub uuid: String,
    #[serde(flatten)]
    pub stage: AnswerResponseStage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum AnswerResponseStage {
    Init { sdp: String },
    Update { candidate: IceCandidate },
    Done,
    Error { status: ErrorStatus },
}

/// Envelope for every server-to-client WebSocket text frame. An `Error` frame is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerFrame<T> {
    Message(T),
    Error(ErrorStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn call_update_wire_shape() {
        let update = CallUpdateRequest {
            uuid: "u1".into(),
            update: CallUpdate::Candidate {
                candidate: IceCandidate::new("candidate:1 1 udp 1 10.0.0.2 5000 typ host"),
            },
        };
        let json = serde_json::to_value(&update).expect("serialize");
        assert_eq!(json["uuid"], "u1");
        assert_eq!(json["update"], "candidate");
        assert_eq!(
            json["candidate"]["candidate"],
            "candidate:1 1 udp 1 10.0.0.2 5000 typ host"
        );
        assert!(json["candidate"].get("sdp_mid").is_none());

        let done: CallUpdateRequest =
            serde_json::from_str(r#"{"uuid":"u1","update":"done"}"#).expect("parse");
        assert_eq!(done.update, CallUpdate::Done);
    }

    #[test_timeout::timeout]
    fn server_frames_are_externally_tagged() {
        let frame = ServerFrame::Message(CallResponse {
            uuid: "u2".into(),
            stage: CallResponseStage::Init { sdp: "world".into() },
        });
        let text = serde_json::to_string(&frame).expect("serialize");
        assert_eq!(
            text,
            r#"{"message":{"uuid":"u2","stage":"init","sdp":"world"}}"#
        );

        let err: ServerFrame<CallResponse> =
            serde_json::from_str(r#"{"error":{"code":"ResourceExhausted","message":"slow down"}}"#)
                .expect("parse");
        match err {
            ServerFrame::Error(status) => {
                assert_eq!(status.code, Code::ResourceExhausted);
                assert_eq!(Status::from(status).message, "slow down");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn answer_init_defaults_optional_fields() {
        let parsed: AnswerRequest = serde_json::from_str(
            r#"{"uuid":"u3","stage":"init","sdp":"hello","deadline":"2026-01-01T00:00:00Z"}"#,
        )
        .expect("parse");
        match parsed.stage {
            AnswerRequestStage::Init {
                sdp,
                optional_config,
                disable_trickle,
                ..
            } => {
                assert_eq!(sdp, "hello");
                assert!(optional_config.is_none());
                assert!(!disable_trickle);
            }
            other => panic!("unexpected stage {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn candidate_converts_to_webrtc_init() {
        let candidate = IceCandidate {
            candidate: "candidate:2".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let init: RTCIceCandidateInit = candidate.clone().into();
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(IceCandidate::from(init), candidate);
    }
}
