//! The signaling relay contract. The relay forwards these payloads between participants and
//! tracks room membership; it never looks inside the session descriptions.
//!
//! On the wire every message is a JSON object tagged by a kebab-case `type` field, with
//! camelCase payload fields.
use derive_more::Display;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{MediaState, ParticipantInfo, RoomId, SessionId};
use crate::error::Error;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    #[display(fmt = "offer")]
    Offer,
    #[display(fmt = "answer")]
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
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

/// local -> relay
#[derive(Debug, Display, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundSignal {
    #[display(fmt = "JoinRoom")]
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: RoomId,
        microphone_enabled: bool,
        camera_enabled: bool,
    },
    #[display(fmt = "Offer")]
    #[serde(rename_all = "camelCase")]
    Offer {
        sdp_offer: SessionDescription,
        target_session_id: SessionId,
    },
    #[display(fmt = "Answer")]
    #[serde(rename_all = "camelCase")]
    Answer {
        sdp_answer: SessionDescription,
        target_session_id: SessionId,
    },
    #[display(fmt = "IceCandidate")]
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        candidate: IceCandidate,
        target_session_id: SessionId,
    },
    #[display(fmt = "MediaStatusChange")]
    #[serde(rename_all = "camelCase")]
    MediaStatusChange {
        room_id: RoomId,
        microphone_enabled: bool,
        camera_enabled: bool,
    },
}

impl OutboundSignal {
    /// the peer this signal is addressed to, if any
    pub fn target(&self) -> Option<&SessionId> {
        match self {
            OutboundSignal::Offer {
                target_session_id, ..
            }
            | OutboundSignal::Answer {
                target_session_id, ..
            }
            | OutboundSignal::IceCandidate {
                target_session_id, ..
            } => Some(target_session_id),
            _ => None,
        }
    }
}

/// relay -> local
#[derive(Debug, Display, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundSignal {
    #[display(fmt = "SelfInfo")]
    SelfInfo { participant: ParticipantInfo },
    #[display(fmt = "ExistingParticipants")]
    ExistingParticipants { participants: Vec<ParticipantInfo> },
    #[display(fmt = "ParticipantJoined")]
    ParticipantJoined { participant: ParticipantInfo },
    #[display(fmt = "ParticipantLeft")]
    #[serde(rename_all = "camelCase")]
    ParticipantLeft { session_id: SessionId },
    #[display(fmt = "OfferReceived")]
    #[serde(rename_all = "camelCase")]
    OfferReceived {
        sdp_offer: SessionDescription,
        from_session_id: SessionId,
    },
    #[display(fmt = "AnswerReceived")]
    #[serde(rename_all = "camelCase")]
    AnswerReceived {
        sdp_answer: SessionDescription,
        from_session_id: SessionId,
    },
    #[display(fmt = "IceCandidateReceived")]
    #[serde(rename_all = "camelCase")]
    IceCandidateReceived {
        candidate: IceCandidate,
        from_session_id: SessionId,
    },
    #[display(fmt = "MediaStatusChanged")]
    #[serde(rename_all = "camelCase")]
    MediaStatusChanged {
        session_id: SessionId,
        microphone_enabled: bool,
        camera_enabled: bool,
    },
}

impl InboundSignal {
    pub fn media_status_changed(session_id: impl Into<SessionId>, media: MediaState) -> Self {
        InboundSignal::MediaStatusChanged {
            session_id: session_id.into(),
            microphone_enabled: media.microphone_enabled,
            camera_enabled: media.camera_enabled,
        }
    }
}

/// serializes a signal into a text frame
pub fn encode<T: Serialize>(signal: &T) -> Result<String, Error> {
    Ok(serde_json::to_string(signal)?)
}

/// parses a text frame received from the relay
pub fn decode<T: DeserializeOwned>(frame: &str) -> Result<T, Error> {
    Ok(serde_json::from_str(frame)?)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn outbound_uses_kebab_tags_and_camel_fields() -> Result<(), Error> {
        let signal = OutboundSignal::IceCandidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
            target_session_id: "s-2".into(),
        };
        let frame = encode(&signal)?;
        let value: serde_json::Value = serde_json::from_str(&frame)?;
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["targetSessionId"], "s-2");
        assert_eq!(value["candidate"]["sdpMLineIndex"], 0);
        assert!(value["candidate"].get("usernameFragment").is_none());
        Ok(())
    }

    #[test]
    fn decodes_relay_frames() -> Result<(), Error> {
        let frame = r#"{
            "type": "existing-participants",
            "participants": [
                {"sessionId": "abc", "name": "Dr. Osei", "role": "physician", "specialty": "cardiology"},
                {"sessionId": "def", "name": "Nurse Lind", "media": {"microphoneEnabled": true, "cameraEnabled": false}}
            ]
        }"#;
        let signal: InboundSignal = decode(frame)?;
        let InboundSignal::ExistingParticipants { participants } = signal else {
            panic!("wrong variant");
        };
        assert_eq!(participants.len(), 2);
        assert_eq!(participants[0].specialty.as_deref(), Some("cardiology"));
        assert_eq!(participants[0].media, None);
        assert_eq!(participants[1].media, Some(MediaState::new(true, false)));

        let frame = r#"{"type":"offer-received","sdpOffer":{"type":"offer","sdp":"v=0"},"fromSessionId":"abc"}"#;
        let signal: InboundSignal = decode(frame)?;
        assert_eq!(
            signal,
            InboundSignal::OfferReceived {
                sdp_offer: SessionDescription::offer("v=0"),
                from_session_id: "abc".into(),
            }
        );
        Ok(())
    }

    #[test]
    fn unknown_type_is_rejected() {
        let res = decode::<InboundSignal>(r#"{"type":"chat-message","text":"hi"}"#);
        assert!(matches!(res, Err(Error::SerdeJsonError(_))));
    }
}
