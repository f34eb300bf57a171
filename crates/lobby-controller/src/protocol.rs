//! JSON wire protocol.
//!
//! Every frame is a JSON object with a `type` field naming the event and a
//! flat payload alongside it. Field casing on the wire is historical
//! (`sessionID`, `patientID`, `patientUsername`) and must not change, so each
//! field carries an explicit rename.
//!
//! Inbound frames are parsed in two steps: pull the `type` out of the raw
//! value, then deserialize the matching payload. This keeps "unknown event
//! type" and "malformed payload" distinguishable, and lets the error event
//! echo the offending type back to the client.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::CoordinatorError;

/// Events a client may send to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Doctor checks their setup before joining. No state change.
    PreviewDoctor,
    /// Doctor joins (or creates) a session.
    JoinMeeting {
        session_id: String,
        user_name: String,
        /// Role declared by the client (0 patient, 1 doctor), validated
        /// against the connection's bound role.
        declared_role: Option<u8>,
    },
    /// Patient enters the waiting lobby of a session.
    WaitingLobby {
        session_id: String,
        user_name: String,
        declared_role: Option<u8>,
    },
    /// Doctor approves a waiting patient.
    ApprovePatient {
        session_id: String,
        patient_id: Uuid,
    },
    /// Doctor rejects a waiting patient.
    RejectPatient {
        session_id: String,
        patient_id: Uuid,
    },
    /// Patient enters the meeting.
    PatientJoinMeeting {
        session_id: String,
        user_name: Option<String>,
    },
    /// Joined patient leaves the meeting.
    PatientLeaveMeeting { session_id: String },
    /// Doctor ends the session for everyone. No payload: the session is
    /// located through the sender's own doctor binding.
    DoctorEnd,
    /// Connection-health probe, answered with `pong`.
    Ping,
}

#[derive(Deserialize)]
struct SessionPayload {
    #[serde(rename = "sessionID")]
    session_id: String,
}

#[derive(Deserialize)]
struct NamedSessionPayload {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "userName")]
    user_name: String,
    role: Option<u8>,
}

#[derive(Deserialize)]
struct JoinPayload {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "userName")]
    user_name: Option<String>,
}

#[derive(Deserialize)]
struct PatientTargetPayload {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "patientID")]
    patient_id: Uuid,
}

impl ClientEvent {
    /// Parses a raw text frame into a client event.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::MalformedPayload`] if the frame is not a
    /// JSON object with a string `type`, or if the payload for a known type
    /// is missing required fields. Returns
    /// [`CoordinatorError::UnknownEventType`] for a type outside the
    /// protocol.
    pub fn parse(text: &str) -> Result<Self, CoordinatorError> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| CoordinatorError::MalformedPayload(format!("invalid JSON: {e}")))?;

        let event_type = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                CoordinatorError::MalformedPayload("missing string `type` field".to_string())
            })?
            .to_string();

        let malformed =
            |e: serde_json::Error| CoordinatorError::MalformedPayload(format!("{event_type}: {e}"));

        match event_type.as_str() {
            "preview_doctor" => Ok(ClientEvent::PreviewDoctor),
            "join_meeting" => {
                let p: NamedSessionPayload =
                    serde_json::from_value(value).map_err(malformed)?;
                Ok(ClientEvent::JoinMeeting {
                    session_id: p.session_id,
                    user_name: p.user_name,
                    declared_role: p.role,
                })
            }
            "waiting_lobby" => {
                let p: NamedSessionPayload =
                    serde_json::from_value(value).map_err(malformed)?;
                Ok(ClientEvent::WaitingLobby {
                    session_id: p.session_id,
                    user_name: p.user_name,
                    declared_role: p.role,
                })
            }
            "approve_patient" => {
                let p: PatientTargetPayload =
                    serde_json::from_value(value).map_err(malformed)?;
                Ok(ClientEvent::ApprovePatient {
                    session_id: p.session_id,
                    patient_id: p.patient_id,
                })
            }
            "reject_patient" => {
                let p: PatientTargetPayload =
                    serde_json::from_value(value).map_err(malformed)?;
                Ok(ClientEvent::RejectPatient {
                    session_id: p.session_id,
                    patient_id: p.patient_id,
                })
            }
            "patient_join_meeting" => {
                let p: JoinPayload = serde_json::from_value(value).map_err(malformed)?;
                Ok(ClientEvent::PatientJoinMeeting {
                    session_id: p.session_id,
                    user_name: p.user_name,
                })
            }
            "patient_leave_meeting" => {
                let p: SessionPayload = serde_json::from_value(value).map_err(malformed)?;
                Ok(ClientEvent::PatientLeaveMeeting {
                    session_id: p.session_id,
                })
            }
            "doctor_end" => Ok(ClientEvent::DoctorEnd),
            "ping" => Ok(ClientEvent::Ping),
            other => Err(CoordinatorError::UnknownEventType(other.to_string())),
        }
    }
}

/// Events the coordinator sends to clients.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// First frame on every new connection.
    Connected {
        message: String,
        #[serde(rename = "socketId")]
        socket_id: Uuid,
        timestamp: String,
    },
    /// Ack for `preview_doctor`.
    DoctorPreview { message: String },
    /// Ack for a doctor joining, with current occupancy counts.
    DoctorJoined {
        message: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "waitingPatients")]
        waiting_patients: usize,
        #[serde(rename = "joinedPatients")]
        joined_patients: usize,
    },
    /// Tells the doctor a patient is waiting in the lobby.
    PatientRequest {
        #[serde(rename = "patientId")]
        patient_id: Uuid,
        username: String,
    },
    /// Ack telling a patient to wait in the lobby.
    Waiting {
        message: String,
        #[serde(rename = "patientId")]
        patient_id: Uuid,
    },
    /// Tells a patient they were approved.
    Approved {
        message: String,
        #[serde(rename = "patientID")]
        patient_id: Uuid,
        #[serde(rename = "sessionID")]
        session_id: String,
    },
    /// Confirms an approval to the doctor.
    PatientApproved {
        message: String,
        #[serde(rename = "patientId")]
        patient_id: Uuid,
        #[serde(rename = "patientUsername")]
        patient_username: String,
    },
    /// Tells a patient they were rejected.
    Rejected { message: String },
    /// Ack telling a patient they are in the meeting.
    JoinedMeeting { message: String },
    /// Tells the doctor a patient entered the meeting.
    PatientJoined { message: String },
    /// Tells the doctor a patient left the meeting.
    PatientLeave { message: String },
    /// Ack for a patient leaving, sent before their connection closes.
    LeaveConfirmation { message: String },
    /// Tells everyone the doctor ended the session.
    DoctorEndMeeting { message: String },
    /// Answer to `ping`, milliseconds since the epoch.
    Pong { timestamp: i64 },
    /// Scoped error for the offending connection only.
    Error {
        message: String,
        #[serde(rename = "eventType", skip_serializing_if = "Option::is_none")]
        event_type: Option<String>,
    },
}

impl ServerEvent {
    /// Builds the scoped error event for a coordinator error.
    #[must_use]
    pub fn from_error(err: &CoordinatorError) -> Self {
        ServerEvent::Error {
            message: err.client_message(),
            event_type: err.event_type().map(String::from),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_join_meeting() {
        let event = ClientEvent::parse(
            r#"{"type":"join_meeting","sessionID":"room-1","userName":"Dr. Lee","role":1}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ClientEvent::JoinMeeting {
                session_id: "room-1".to_string(),
                user_name: "Dr. Lee".to_string(),
                declared_role: Some(1),
            }
        );
    }

    #[test]
    fn test_parse_waiting_lobby_without_role() {
        let event = ClientEvent::parse(
            r#"{"type":"waiting_lobby","sessionID":"room-1","userName":"Ada"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ClientEvent::WaitingLobby {
                session_id: "room-1".to_string(),
                user_name: "Ada".to_string(),
                declared_role: None,
            }
        );
    }

    #[test]
    fn test_parse_approve_patient() {
        let patient = Uuid::new_v4();
        let text = format!(
            r#"{{"type":"approve_patient","sessionID":"room-1","patientID":"{patient}"}}"#
        );
        let event = ClientEvent::parse(&text).unwrap();
        assert_eq!(
            event,
            ClientEvent::ApprovePatient {
                session_id: "room-1".to_string(),
                patient_id: patient,
            }
        );
    }

    #[test]
    fn test_parse_ping_takes_no_payload() {
        let event = ClientEvent::parse(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(event, ClientEvent::Ping);
    }

    #[test]
    fn test_parse_unknown_type() {
        let err = ClientEvent::parse(r#"{"type":"frobnicate"}"#).unwrap_err();
        match err {
            CoordinatorError::UnknownEventType(t) => assert_eq!(t, "frobnicate"),
            other => panic!("expected UnknownEventType, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_missing_type() {
        let err = ClientEvent::parse(r#"{"sessionID":"room-1"}"#).unwrap_err();
        assert!(matches!(err, CoordinatorError::MalformedPayload(_)));
    }

    #[test]
    fn test_parse_invalid_json() {
        let err = ClientEvent::parse("not json").unwrap_err();
        assert!(matches!(err, CoordinatorError::MalformedPayload(_)));
    }

    #[test]
    fn test_parse_missing_required_field() {
        let err = ClientEvent::parse(r#"{"type":"join_meeting","sessionID":"room-1"}"#).unwrap_err();
        assert!(matches!(err, CoordinatorError::MalformedPayload(_)));
    }

    #[test]
    fn test_parse_invalid_patient_id() {
        let err = ClientEvent::parse(
            r#"{"type":"approve_patient","sessionID":"room-1","patientID":"not-a-uuid"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, CoordinatorError::MalformedPayload(_)));
    }

    #[test]
    fn test_serialize_wire_field_names() {
        let patient = Uuid::new_v4();
        let json = serde_json::to_value(ServerEvent::PatientApproved {
            message: "Patient Ada has been approved".to_string(),
            patient_id: patient,
            patient_username: "Ada".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "patient_approved");
        assert_eq!(json["patientId"], patient.to_string());
        assert_eq!(json["patientUsername"], "Ada");

        let json = serde_json::to_value(ServerEvent::Approved {
            message: "You are approved to join the meeting.".to_string(),
            patient_id: patient,
            session_id: "room-1".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "approved");
        assert_eq!(json["patientID"], patient.to_string());
        assert_eq!(json["sessionID"], "room-1");

        let json = serde_json::to_value(ServerEvent::PatientRequest {
            patient_id: patient,
            username: "Ada".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "patient_request");
        assert_eq!(json["patientId"], patient.to_string());
        assert_eq!(json["username"], "Ada");
    }

    #[test]
    fn test_serialize_doctor_joined_counts() {
        let json = serde_json::to_value(ServerEvent::DoctorJoined {
            message: "Doctor has joined the meeting.".to_string(),
            session_id: "room-1".to_string(),
            waiting_patients: 2,
            joined_patients: 1,
        })
        .unwrap();
        assert_eq!(json["sessionId"], "room-1");
        assert_eq!(json["waitingPatients"], 2);
        assert_eq!(json["joinedPatients"], 1);
    }

    #[test]
    fn test_error_event_omits_absent_event_type() {
        let json = serde_json::to_value(ServerEvent::from_error(
            &CoordinatorError::SessionNotFound,
        ))
        .unwrap();
        assert_eq!(json["message"], "Session not found");
        assert!(json.get("eventType").is_none());

        let json = serde_json::to_value(ServerEvent::from_error(
            &CoordinatorError::UnknownEventType("frobnicate".to_string()),
        ))
        .unwrap();
        assert_eq!(json["eventType"], "frobnicate");
    }
}
