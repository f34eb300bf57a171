//! Session coordinator actor.
//!
//! Single owner of all session state. Every client event and every
//! disconnect signal is processed serially on this task, so handlers run to
//! completion without interleaving and no per-session locking exists.
//! Outbound notifications are fire-and-forget sends through the connection
//! registry and are never awaited for delivery.
//!
//! Handlers either fully apply or reject up front with an error that the
//! transport returns to the offending connection only. There are no partial
//! mutations to roll back.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::CoordinatorError;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::registry::ConnectionRegistry;

use super::messages::{CoordinatorMessage, CoordinatorStatus};
use super::metrics;
use super::session::{Removal, Role, Session, SessionSnapshot};

/// Wire encoding of the patient role in the inbound `role` field.
const ROLE_PATIENT: u8 = 0;
/// Wire encoding of the doctor role in the inbound `role` field.
const ROLE_DOCTOR: u8 = 1;

/// Role and session a connection committed to at its first successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    session_id: String,
    role: Role,
}

/// The coordinator actor. Owns the session map and the connection-to-session
/// bindings index; runs until its mailbox closes or shutdown is signalled.
pub struct SessionCoordinator {
    receiver: mpsc::Receiver<CoordinatorMessage>,
    registry: Arc<ConnectionRegistry>,
    sessions: HashMap<String, Session>,
    bindings: HashMap<Uuid, Binding>,
    shutdown: CancellationToken,
}

impl SessionCoordinator {
    pub fn new(
        receiver: mpsc::Receiver<CoordinatorMessage>,
        registry: Arc<ConnectionRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            receiver,
            registry,
            sessions: HashMap::new(),
            bindings: HashMap::new(),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(target: "lobby.coordinator", "session coordinator started");
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    tracing::info!(target: "lobby.coordinator", "shutdown requested");
                    break;
                }
                msg = self.receiver.recv() => {
                    let Some(msg) = msg else {
                        tracing::info!(target: "lobby.coordinator", "mailbox closed");
                        break;
                    };
                    self.handle_message(msg);
                }
            }
        }
        tracing::info!(
            target: "lobby.coordinator",
            sessions = self.sessions.len(),
            "session coordinator stopped"
        );
    }

    fn handle_message(&mut self, msg: CoordinatorMessage) {
        match msg {
            CoordinatorMessage::Client {
                connection_id,
                event,
                reply,
            } => {
                let result = self.handle_client(connection_id, event);
                if let Err(err) = &result {
                    metrics::record_error(error_kind(err));
                    tracing::debug!(
                        target: "lobby.coordinator",
                        connection_id = %connection_id,
                        error = %err,
                        "client event rejected"
                    );
                }
                let _ = reply.send(result);
            }
            CoordinatorMessage::ConnectionClosed {
                connection_id,
                reply,
            } => {
                self.handle_connection_closed(connection_id);
                let _ = reply.send(());
            }
            CoordinatorMessage::Snapshot { session_id, reply } => {
                let snapshot = self.sessions.get(&session_id).map(SessionSnapshot::of);
                let _ = reply.send(snapshot);
            }
            CoordinatorMessage::Status { reply } => {
                let _ = reply.send(CoordinatorStatus {
                    sessions: self.sessions.len(),
                    bound_connections: self.bindings.len(),
                });
            }
        }
        metrics::set_active_sessions(self.sessions.len());
        metrics::set_active_connections(self.registry.len());
    }

    /// Applies one client event. On error, state is unchanged and the caller
    /// sends a scoped `error` event back to the connection.
    pub fn handle_client(
        &mut self,
        connection_id: Uuid,
        event: ClientEvent,
    ) -> Result<(), CoordinatorError> {
        match event {
            ClientEvent::PreviewDoctor => {
                metrics::record_event("preview_doctor");
                self.registry.send_to(
                    connection_id,
                    ServerEvent::DoctorPreview {
                        message: "Doctor is in preview mode.".to_string(),
                    },
                );
                Ok(())
            }
            ClientEvent::Ping => {
                self.registry.send_to(
                    connection_id,
                    ServerEvent::Pong {
                        timestamp: Utc::now().timestamp_millis(),
                    },
                );
                Ok(())
            }
            ClientEvent::JoinMeeting {
                session_id,
                user_name,
                declared_role,
            } => {
                metrics::record_event("join_meeting");
                self.handle_doctor_join(connection_id, session_id, user_name, declared_role)
            }
            ClientEvent::WaitingLobby {
                session_id,
                user_name,
                declared_role,
            } => {
                metrics::record_event("waiting_lobby");
                self.handle_waiting_lobby(connection_id, session_id, user_name, declared_role)
            }
            ClientEvent::ApprovePatient {
                session_id,
                patient_id,
            } => {
                metrics::record_event("approve_patient");
                self.handle_approve(connection_id, &session_id, patient_id)
            }
            ClientEvent::RejectPatient {
                session_id,
                patient_id,
            } => {
                metrics::record_event("reject_patient");
                self.handle_reject(connection_id, &session_id, patient_id)
            }
            ClientEvent::PatientJoinMeeting {
                session_id,
                user_name,
            } => {
                metrics::record_event("patient_join_meeting");
                self.handle_patient_join(connection_id, session_id, user_name)
            }
            ClientEvent::PatientLeaveMeeting { session_id } => {
                metrics::record_event("patient_leave_meeting");
                self.handle_patient_leave(connection_id, &session_id)
            }
            ClientEvent::DoctorEnd => {
                metrics::record_event("doctor_end");
                self.handle_doctor_end(connection_id)
            }
        }
    }

    fn handle_doctor_join(
        &mut self,
        connection_id: Uuid,
        session_id: String,
        user_name: String,
        declared_role: Option<u8>,
    ) -> Result<(), CoordinatorError> {
        check_declared_role(declared_role, ROLE_DOCTOR)?;

        match self.bindings.get(&connection_id) {
            Some(binding) if binding.role == Role::Patient => {
                return Err(CoordinatorError::Conflict(
                    "Connection is already registered as a patient".to_string(),
                ));
            }
            Some(binding) if binding.session_id != session_id => {
                return Err(CoordinatorError::Conflict(
                    "Connection is already the doctor for another session".to_string(),
                ));
            }
            _ => {}
        }

        let session = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| Session::new(session_id.clone()));

        if session.is_doctor(connection_id) {
            // Idempotent retry: no reassignment, corrective ack only.
            self.registry.send_to(
                connection_id,
                ServerEvent::DoctorJoined {
                    message: "You are already the doctor for this meeting.".to_string(),
                    session_id,
                    waiting_patients: session.waiting_count(),
                    joined_patients: session.joined_count(),
                },
            );
            return Ok(());
        }

        let displaced = session.set_doctor(connection_id, user_name);
        let waiting_count = session.waiting_count();
        let joined_count = session.joined_count();
        let waiting: Vec<(Uuid, String)> = session
            .waiting()
            .map(|(id, p)| (id, p.user_name.clone()))
            .collect();

        if let Some(displaced) = displaced {
            self.bindings.remove(&displaced);
            tracing::info!(
                target: "lobby.coordinator",
                session_id = %session_id,
                displaced = %displaced,
                "doctor slot reassigned"
            );
        }
        self.bindings.insert(
            connection_id,
            Binding {
                session_id: session_id.clone(),
                role: Role::Doctor,
            },
        );

        self.registry.send_to(
            connection_id,
            ServerEvent::DoctorJoined {
                message: "Doctor has joined the meeting.".to_string(),
                session_id: session_id.clone(),
                waiting_patients: waiting_count,
                joined_patients: joined_count,
            },
        );
        // One request per lobby entry, in arrival order.
        for (patient_id, username) in waiting {
            self.registry.send_to(
                connection_id,
                ServerEvent::PatientRequest {
                    patient_id,
                    username,
                },
            );
        }

        tracing::info!(
            target: "lobby.coordinator",
            session_id = %session_id,
            connection_id = %connection_id,
            waiting = waiting_count,
            joined = joined_count,
            "doctor joined session"
        );
        Ok(())
    }

    fn handle_waiting_lobby(
        &mut self,
        connection_id: Uuid,
        session_id: String,
        user_name: String,
        declared_role: Option<u8>,
    ) -> Result<(), CoordinatorError> {
        check_declared_role(declared_role, ROLE_PATIENT)?;

        match self.bindings.get(&connection_id) {
            Some(binding) if binding.role == Role::Doctor => {
                return Err(CoordinatorError::Conflict(
                    "Connection is already registered as a doctor".to_string(),
                ));
            }
            Some(binding) if binding.session_id != session_id => {
                return Err(CoordinatorError::Conflict(
                    "Connection is already in another session".to_string(),
                ));
            }
            _ => {}
        }

        let session = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| Session::new(session_id.clone()));

        if session.is_waiting(connection_id) {
            // Idempotent retry, lobby entry is not duplicated.
            self.registry.send_to(
                connection_id,
                ServerEvent::Waiting {
                    message: "You are already in the waiting lobby.".to_string(),
                    patient_id: connection_id,
                },
            );
            return Ok(());
        }
        if session.is_joined(connection_id) {
            // Corrective ack: tell the client its true state.
            self.registry.send_to(
                connection_id,
                ServerEvent::JoinedMeeting {
                    message: "You are already in the meeting.".to_string(),
                },
            );
            return Ok(());
        }

        session.add_waiting(connection_id, user_name.clone());
        let doctor = session.doctor().map(|d| d.connection_id);
        self.bindings.insert(
            connection_id,
            Binding {
                session_id: session_id.clone(),
                role: Role::Patient,
            },
        );

        self.registry.send_to(
            connection_id,
            ServerEvent::Waiting {
                message: "Please wait in the lobby.".to_string(),
                patient_id: connection_id,
            },
        );
        if let Some(doctor) = doctor {
            if self.registry.is_connected(doctor) {
                self.registry.send_to(
                    doctor,
                    ServerEvent::PatientRequest {
                        patient_id: connection_id,
                        username: user_name.clone(),
                    },
                );
            }
        }

        tracing::info!(
            target: "lobby.coordinator",
            session_id = %session_id,
            connection_id = %connection_id,
            username = %user_name,
            "patient entered waiting lobby"
        );
        Ok(())
    }

    fn handle_approve(
        &mut self,
        connection_id: Uuid,
        session_id: &str,
        patient_id: Uuid,
    ) -> Result<(), CoordinatorError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or(CoordinatorError::SessionNotFound)?;
        if !session.is_doctor(connection_id) {
            return Err(CoordinatorError::Unauthorized(
                "Only the doctor can approve patients".to_string(),
            ));
        }
        if !session.is_waiting(patient_id) {
            return Err(CoordinatorError::PatientNotFound(
                "Patient not found in waiting lobby".to_string(),
            ));
        }

        if !self.registry.is_connected(patient_id) {
            // Stale lobby entry: reclaim silently, nobody is notified.
            session.remove_waiting(patient_id);
            self.bindings.remove(&patient_id);
            self.drop_session_if_empty(session_id);
            tracing::debug!(
                target: "lobby.coordinator",
                session_id = %session_id,
                patient_id = %patient_id,
                "reclaimed stale lobby entry on approval"
            );
            return Ok(());
        }

        let patient = session
            .approve(patient_id)
            .ok_or_else(|| CoordinatorError::Internal("lobby entry vanished".to_string()))?;

        self.registry.send_to(
            patient_id,
            ServerEvent::Approved {
                message: "You are approved to join the meeting.".to_string(),
                patient_id,
                session_id: session_id.to_string(),
            },
        );
        self.registry.send_to(
            connection_id,
            ServerEvent::PatientApproved {
                message: format!("Patient {} has been approved", patient.user_name),
                patient_id,
                patient_username: patient.user_name.clone(),
            },
        );

        metrics::record_patient_approved();
        tracing::info!(
            target: "lobby.coordinator",
            session_id = %session_id,
            patient_id = %patient_id,
            username = %patient.user_name,
            "patient approved"
        );
        Ok(())
    }

    fn handle_reject(
        &mut self,
        connection_id: Uuid,
        session_id: &str,
        patient_id: Uuid,
    ) -> Result<(), CoordinatorError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or(CoordinatorError::SessionNotFound)?;
        if !session.is_doctor(connection_id) {
            return Err(CoordinatorError::Unauthorized(
                "Only the doctor can reject patients".to_string(),
            ));
        }
        if session.remove_waiting(patient_id).is_none() {
            return Err(CoordinatorError::PatientNotFound(
                "Patient not found in waiting lobby".to_string(),
            ));
        }
        self.bindings.remove(&patient_id);

        self.registry.send_to(
            patient_id,
            ServerEvent::Rejected {
                message: "You are not allowed to join the meeting.".to_string(),
            },
        );

        metrics::record_patient_rejected();
        tracing::info!(
            target: "lobby.coordinator",
            session_id = %session_id,
            patient_id = %patient_id,
            "patient rejected"
        );
        Ok(())
    }

    fn handle_patient_join(
        &mut self,
        connection_id: Uuid,
        session_id: String,
        user_name: Option<String>,
    ) -> Result<(), CoordinatorError> {
        match self.bindings.get(&connection_id) {
            Some(binding) if binding.role == Role::Doctor => {
                return Err(CoordinatorError::Conflict(
                    "Connection is already registered as a doctor".to_string(),
                ));
            }
            Some(binding) if binding.session_id != session_id => {
                return Err(CoordinatorError::Conflict(
                    "Connection is already in another session".to_string(),
                ));
            }
            _ => {}
        }

        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(CoordinatorError::SessionNotFound)?;

        let name = session
            .waiting_name(connection_id)
            .or_else(|| session.joined_name(connection_id))
            .map(String::from)
            .or(user_name)
            .unwrap_or_else(|| "Patient".to_string());

        session.mark_joined(connection_id, name.clone());
        let doctor = session.doctor().map(|d| d.connection_id);
        self.bindings.insert(
            connection_id,
            Binding {
                session_id: session_id.clone(),
                role: Role::Patient,
            },
        );

        // Notified on retries too; membership itself is not duplicated.
        if let Some(doctor) = doctor {
            self.registry.send_to(
                doctor,
                ServerEvent::PatientJoined {
                    message: format!("{name} has joined the meeting."),
                },
            );
        }
        self.registry.send_to(
            connection_id,
            ServerEvent::JoinedMeeting {
                message: "You have successfully joined the meeting.".to_string(),
            },
        );

        tracing::info!(
            target: "lobby.coordinator",
            session_id = %session_id,
            connection_id = %connection_id,
            username = %name,
            "patient joined meeting"
        );
        Ok(())
    }

    fn handle_patient_leave(
        &mut self,
        connection_id: Uuid,
        session_id: &str,
    ) -> Result<(), CoordinatorError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or(CoordinatorError::SessionNotFound)?;
        if session.remove_joined(connection_id).is_none() {
            return Err(CoordinatorError::PatientNotFound(
                "Patient not found in meeting".to_string(),
            ));
        }
        let doctor = session.doctor().map(|d| d.connection_id);
        self.bindings.remove(&connection_id);

        if let Some(doctor) = doctor {
            self.registry.send_to(
                doctor,
                ServerEvent::PatientLeave {
                    message: "Patient left the meeting.".to_string(),
                },
            );
        }
        // Confirmation is queued before the close request, so it drains to
        // the socket ahead of the close frame.
        self.registry.send_to(
            connection_id,
            ServerEvent::LeaveConfirmation {
                message: "You have successfully left the meeting.".to_string(),
            },
        );
        if let Some(handle) = self.registry.get(connection_id) {
            handle.disconnect();
        }

        self.drop_session_if_empty(session_id);
        tracing::info!(
            target: "lobby.coordinator",
            session_id = %session_id,
            connection_id = %connection_id,
            "patient left meeting"
        );
        Ok(())
    }

    fn handle_doctor_end(&mut self, connection_id: Uuid) -> Result<(), CoordinatorError> {
        let session_id = match self.bindings.get(&connection_id) {
            Some(binding) if binding.role == Role::Doctor => binding.session_id.clone(),
            _ => {
                return Err(CoordinatorError::Unauthorized(
                    "Only the doctor can end the meeting".to_string(),
                ));
            }
        };
        let session = self
            .sessions
            .remove(&session_id)
            .ok_or(CoordinatorError::SessionNotFound)?;

        let end_message = "The doctor has ended the meeting.".to_string();
        // Joined patients first, then the lobby, then the doctor.
        let participants: Vec<Uuid> = session
            .joined()
            .map(|(id, _)| id)
            .chain(session.waiting().map(|(id, _)| id))
            .collect();
        for participant in participants {
            self.bindings.remove(&participant);
            if let Some(handle) = self.registry.get(participant) {
                if handle.is_connected() {
                    handle.send(ServerEvent::DoctorEndMeeting {
                        message: end_message.clone(),
                    });
                    handle.disconnect();
                }
            }
        }
        self.bindings.remove(&connection_id);
        if let Some(handle) = self.registry.get(connection_id) {
            handle.send(ServerEvent::DoctorEndMeeting {
                message: end_message,
            });
            handle.disconnect();
        }

        metrics::record_session_ended("doctor_end");
        tracing::info!(
            target: "lobby.coordinator",
            session_id = %session_id,
            "doctor ended session"
        );
        Ok(())
    }

    /// Disconnect reconciliation. Unconditional: a connection that was never
    /// bound anywhere is a no-op, and nothing here can fail.
    fn handle_connection_closed(&mut self, connection_id: Uuid) {
        let Some(binding) = self.bindings.remove(&connection_id) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&binding.session_id) else {
            return;
        };

        let removal = session.remove_connection(connection_id);
        match removal {
            Removal::Doctor => {
                // Session goes headless. Patients are not told; only an
                // explicit doctor_end notifies them.
                tracing::info!(
                    target: "lobby.coordinator",
                    session_id = %binding.session_id,
                    connection_id = %connection_id,
                    "doctor disconnected, session is headless"
                );
            }
            Removal::Waiting | Removal::Joined => {
                tracing::info!(
                    target: "lobby.coordinator",
                    session_id = %binding.session_id,
                    connection_id = %connection_id,
                    position = ?removal,
                    "patient disconnected"
                );
            }
            Removal::NotPresent => {}
        }

        if self.drop_session_if_empty(&binding.session_id) {
            metrics::record_session_ended("abandoned");
        }
    }

    /// Deletes the session if nobody remains in it. Returns true if deleted.
    fn drop_session_if_empty(&mut self, session_id: &str) -> bool {
        let empty = self
            .sessions
            .get(session_id)
            .is_some_and(Session::is_empty);
        if empty {
            self.sessions.remove(session_id);
            tracing::info!(
                target: "lobby.coordinator",
                session_id = %session_id,
                "deleted empty session"
            );
        }
        empty
    }
}

/// Rejects an explicit `role` field that contradicts the event's inherent
/// role. An absent field is accepted.
fn check_declared_role(declared: Option<u8>, expected: u8) -> Result<(), CoordinatorError> {
    match declared {
        None => Ok(()),
        Some(role) if role == expected => Ok(()),
        Some(_) => Err(CoordinatorError::Conflict(
            "Declared role does not match this event".to_string(),
        )),
    }
}

fn error_kind(err: &CoordinatorError) -> &'static str {
    match err {
        CoordinatorError::SessionNotFound => "session_not_found",
        CoordinatorError::Unauthorized(_) => "unauthorized",
        CoordinatorError::PatientNotFound(_) => "patient_not_found",
        CoordinatorError::Conflict(_) => "conflict",
        CoordinatorError::UnknownEventType(_) => "unknown_event_type",
        CoordinatorError::MalformedPayload(_) => "malformed_payload",
        CoordinatorError::Internal(_) => "internal",
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
    use crate::registry::ConnectionHandle;
    use tokio::sync::mpsc::Receiver;

    struct Fixture {
        coordinator: SessionCoordinator,
        registry: Arc<ConnectionRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(ConnectionRegistry::new());
            let (_sender, receiver) = mpsc::channel(8);
            let coordinator = SessionCoordinator::new(
                receiver,
                Arc::clone(&registry),
                CancellationToken::new(),
            );
            Self {
                coordinator,
                registry,
            }
        }

        fn connect(&self) -> (Arc<ConnectionHandle>, Receiver<ServerEvent>) {
            self.registry.register()
        }

        fn doctor_joins(&mut self, conn: Uuid, session: &str) -> Result<(), CoordinatorError> {
            self.coordinator.handle_client(
                conn,
                ClientEvent::JoinMeeting {
                    session_id: session.to_string(),
                    user_name: "Dr. Lee".to_string(),
                    declared_role: Some(ROLE_DOCTOR),
                },
            )
        }

        fn patient_waits(
            &mut self,
            conn: Uuid,
            session: &str,
            name: &str,
        ) -> Result<(), CoordinatorError> {
            self.coordinator.handle_client(
                conn,
                ClientEvent::WaitingLobby {
                    session_id: session.to_string(),
                    user_name: name.to_string(),
                    declared_role: Some(ROLE_PATIENT),
                },
            )
        }

        fn snapshot(&self, session: &str) -> Option<SessionSnapshot> {
            self.coordinator.sessions.get(session).map(SessionSnapshot::of)
        }
    }

    fn drain(receiver: &mut Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_doctor_join_replays_lobby_in_arrival_order() {
        let mut fx = Fixture::new();
        let patients: Vec<_> = (0..3).map(|_| fx.connect()).collect();
        let names = ["P1", "P2", "P3"];
        for ((handle, _), name) in patients.iter().zip(names) {
            fx.patient_waits(handle.id(), "s1", name).unwrap();
        }

        let (doctor, mut doctor_rx) = fx.connect();
        fx.doctor_joins(doctor.id(), "s1").unwrap();

        let events = drain(&mut doctor_rx);
        assert!(matches!(
            &events[0],
            ServerEvent::DoctorJoined { waiting_patients: 3, joined_patients: 0, .. }
        ));
        let requested: Vec<(Uuid, String)> = events[1..]
            .iter()
            .map(|e| match e {
                ServerEvent::PatientRequest { patient_id, username } => {
                    (*patient_id, username.clone())
                }
                other => panic!("expected patient_request, got {other:?}"),
            })
            .collect();
        let expected: Vec<(Uuid, String)> = patients
            .iter()
            .zip(names)
            .map(|((h, _), n)| (h.id(), n.to_string()))
            .collect();
        assert_eq!(requested, expected);
    }

    #[tokio::test]
    async fn test_waiting_lobby_is_idempotent() {
        let mut fx = Fixture::new();
        let (patient, mut patient_rx) = fx.connect();

        fx.patient_waits(patient.id(), "s1", "Ada").unwrap();
        fx.patient_waits(patient.id(), "s1", "Ada").unwrap();

        let snapshot = fx.snapshot("s1").unwrap();
        assert_eq!(snapshot.waiting.len(), 1);

        let events = drain(&mut patient_rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ServerEvent::Waiting { message, .. }
            if message == "Please wait in the lobby."));
        assert!(matches!(&events[1], ServerEvent::Waiting { message, .. }
            if message == "You are already in the waiting lobby."));
    }

    #[tokio::test]
    async fn test_doctor_join_is_idempotent() {
        let mut fx = Fixture::new();
        let (doctor, mut doctor_rx) = fx.connect();

        fx.doctor_joins(doctor.id(), "s1").unwrap();
        fx.doctor_joins(doctor.id(), "s1").unwrap();

        let events = drain(&mut doctor_rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], ServerEvent::DoctorJoined { message, .. }
            if message == "You are already the doctor for this meeting."));
        let snapshot = fx.snapshot("s1").unwrap();
        assert_eq!(snapshot.doctor.as_deref(), Some("Dr. Lee"));
    }

    #[tokio::test]
    async fn test_approve_flow() {
        let mut fx = Fixture::new();
        let (doctor, mut doctor_rx) = fx.connect();
        let (patient, mut patient_rx) = fx.connect();

        fx.doctor_joins(doctor.id(), "s1").unwrap();
        fx.patient_waits(patient.id(), "s1", "Alice").unwrap();
        let _ = drain(&mut doctor_rx);
        let _ = drain(&mut patient_rx);

        fx.coordinator
            .handle_client(
                doctor.id(),
                ClientEvent::ApprovePatient {
                    session_id: "s1".to_string(),
                    patient_id: patient.id(),
                },
            )
            .unwrap();

        let patient_events = drain(&mut patient_rx);
        assert!(matches!(&patient_events[0],
            ServerEvent::Approved { patient_id, session_id, .. }
            if *patient_id == patient.id() && session_id == "s1"));
        let doctor_events = drain(&mut doctor_rx);
        assert!(matches!(&doctor_events[0],
            ServerEvent::PatientApproved { patient_username, .. }
            if patient_username == "Alice"));

        let snapshot = fx.snapshot("s1").unwrap();
        assert!(snapshot.waiting.is_empty());
        assert_eq!(snapshot.joined, vec![(patient.id(), "Alice".to_string())]);
    }

    #[tokio::test]
    async fn test_reject_removes_only_target() {
        let mut fx = Fixture::new();
        let (doctor, _doctor_rx) = fx.connect();
        let (p1, mut p1_rx) = fx.connect();
        let (p2, _p2_rx) = fx.connect();

        fx.doctor_joins(doctor.id(), "s2").unwrap();
        fx.patient_waits(p1.id(), "s2", "P1").unwrap();
        fx.patient_waits(p2.id(), "s2", "P2").unwrap();
        let _ = drain(&mut p1_rx);

        fx.coordinator
            .handle_client(
                doctor.id(),
                ClientEvent::RejectPatient {
                    session_id: "s2".to_string(),
                    patient_id: p1.id(),
                },
            )
            .unwrap();

        let events = drain(&mut p1_rx);
        assert!(matches!(&events[0], ServerEvent::Rejected { message }
            if message == "You are not allowed to join the meeting."));
        let snapshot = fx.snapshot("s2").unwrap();
        assert_eq!(snapshot.waiting, vec![(p2.id(), "P2".to_string())]);
        assert!(snapshot.joined.is_empty());
    }

    #[tokio::test]
    async fn test_approve_error_precedence() {
        let mut fx = Fixture::new();
        let (doctor, _doctor_rx) = fx.connect();
        let (patient, _patient_rx) = fx.connect();
        let (intruder, _intruder_rx) = fx.connect();

        let err = fx
            .coordinator
            .handle_client(
                doctor.id(),
                ClientEvent::ApprovePatient {
                    session_id: "missing".to_string(),
                    patient_id: patient.id(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::SessionNotFound));

        fx.doctor_joins(doctor.id(), "s1").unwrap();
        fx.patient_waits(patient.id(), "s1", "Alice").unwrap();

        let err = fx
            .coordinator
            .handle_client(
                intruder.id(),
                ClientEvent::ApprovePatient {
                    session_id: "s1".to_string(),
                    patient_id: patient.id(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Unauthorized(_)));

        let err = fx
            .coordinator
            .handle_client(
                doctor.id(),
                ClientEvent::ApprovePatient {
                    session_id: "s1".to_string(),
                    patient_id: Uuid::new_v4(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::PatientNotFound(_)));

        // None of the failed attempts mutated the lobby.
        let snapshot = fx.snapshot("s1").unwrap();
        assert_eq!(snapshot.waiting.len(), 1);
        assert!(snapshot.joined.is_empty());
    }

    #[tokio::test]
    async fn test_approve_stale_connection_reclaims_silently() {
        let mut fx = Fixture::new();
        let (doctor, mut doctor_rx) = fx.connect();
        let (patient, _patient_rx) = fx.connect();

        fx.doctor_joins(doctor.id(), "s1").unwrap();
        fx.patient_waits(patient.id(), "s1", "Alice").unwrap();
        let _ = drain(&mut doctor_rx);

        // Socket died but the close signal has not been processed yet.
        patient.disconnect();

        fx.coordinator
            .handle_client(
                doctor.id(),
                ClientEvent::ApprovePatient {
                    session_id: "s1".to_string(),
                    patient_id: patient.id(),
                },
            )
            .unwrap();

        let snapshot = fx.snapshot("s1").unwrap();
        assert!(snapshot.waiting.is_empty());
        assert!(snapshot.joined.is_empty());
        assert!(drain(&mut doctor_rx).is_empty());
    }

    #[tokio::test]
    async fn test_patient_join_and_leave_round_trip() {
        let mut fx = Fixture::new();
        let (doctor, mut doctor_rx) = fx.connect();
        let (patient, mut patient_rx) = fx.connect();

        fx.doctor_joins(doctor.id(), "s1").unwrap();
        fx.patient_waits(patient.id(), "s1", "Alice").unwrap();
        fx.coordinator
            .handle_client(
                doctor.id(),
                ClientEvent::ApprovePatient {
                    session_id: "s1".to_string(),
                    patient_id: patient.id(),
                },
            )
            .unwrap();
        let _ = drain(&mut doctor_rx);
        let _ = drain(&mut patient_rx);

        fx.coordinator
            .handle_client(
                patient.id(),
                ClientEvent::PatientJoinMeeting {
                    session_id: "s1".to_string(),
                    user_name: None,
                },
            )
            .unwrap();
        let doctor_events = drain(&mut doctor_rx);
        assert!(matches!(&doctor_events[0], ServerEvent::PatientJoined { message }
            if message == "Alice has joined the meeting."));

        fx.coordinator
            .handle_client(
                patient.id(),
                ClientEvent::PatientLeaveMeeting {
                    session_id: "s1".to_string(),
                },
            )
            .unwrap();

        let patient_events = drain(&mut patient_rx);
        assert!(patient_events.iter().any(|e| matches!(e,
            ServerEvent::LeaveConfirmation { message }
            if message == "You have successfully left the meeting.")));
        assert!(!patient.is_connected());
        let doctor_events = drain(&mut doctor_rx);
        assert!(matches!(&doctor_events[0], ServerEvent::PatientLeave { .. }));

        // Patient ends up in neither set; session survives with the doctor.
        let snapshot = fx.snapshot("s1").unwrap();
        assert!(snapshot.waiting.is_empty());
        assert!(snapshot.joined.is_empty());
        assert_eq!(snapshot.doctor.as_deref(), Some("Dr. Lee"));
    }

    #[tokio::test]
    async fn test_patient_join_retry_notifies_doctor_without_duplicate_membership() {
        let mut fx = Fixture::new();
        let (doctor, mut doctor_rx) = fx.connect();
        let (patient, mut patient_rx) = fx.connect();

        fx.doctor_joins(doctor.id(), "s1").unwrap();
        fx.patient_waits(patient.id(), "s1", "Alice").unwrap();
        fx.coordinator
            .handle_client(
                doctor.id(),
                ClientEvent::ApprovePatient {
                    session_id: "s1".to_string(),
                    patient_id: patient.id(),
                },
            )
            .unwrap();
        let _ = drain(&mut doctor_rx);
        let _ = drain(&mut patient_rx);

        for _ in 0..2 {
            fx.coordinator
                .handle_client(
                    patient.id(),
                    ClientEvent::PatientJoinMeeting {
                        session_id: "s1".to_string(),
                        user_name: None,
                    },
                )
                .unwrap();
        }

        // The doctor hears about each join request, including the retry.
        let notifications = drain(&mut doctor_rx)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::PatientJoined { message }
                if message == "Alice has joined the meeting."))
            .count();
        assert_eq!(notifications, 2);

        // Membership itself is not duplicated.
        let snapshot = fx.snapshot("s1").unwrap();
        assert_eq!(snapshot.joined.len(), 1);
        assert!(snapshot.waiting.is_empty());
    }

    #[tokio::test]
    async fn test_ping_answers_pong_without_touching_sessions() {
        let mut fx = Fixture::new();
        let (conn, mut conn_rx) = fx.connect();

        fx.coordinator
            .handle_client(conn.id(), ClientEvent::Ping)
            .unwrap();

        let events = drain(&mut conn_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ServerEvent::Pong { timestamp } if timestamp > 0));
        assert!(fx.coordinator.sessions.is_empty());
        assert!(fx.coordinator.bindings.is_empty());
    }

    #[tokio::test]
    async fn test_doctor_end_notifies_and_deletes_session() {
        let mut fx = Fixture::new();
        let (doctor, mut doctor_rx) = fx.connect();
        let (joined, mut joined_rx) = fx.connect();
        let (waiting, mut waiting_rx) = fx.connect();

        fx.doctor_joins(doctor.id(), "s3").unwrap();
        fx.patient_waits(joined.id(), "s3", "Alice").unwrap();
        fx.coordinator
            .handle_client(
                doctor.id(),
                ClientEvent::ApprovePatient {
                    session_id: "s3".to_string(),
                    patient_id: joined.id(),
                },
            )
            .unwrap();
        fx.patient_waits(waiting.id(), "s3", "Ben").unwrap();
        let _ = drain(&mut doctor_rx);
        let _ = drain(&mut joined_rx);
        let _ = drain(&mut waiting_rx);

        fx.coordinator
            .handle_client(doctor.id(), ClientEvent::DoctorEnd)
            .unwrap();

        for rx in [&mut joined_rx, &mut waiting_rx, &mut doctor_rx] {
            let events = drain(rx);
            assert!(matches!(&events[0], ServerEvent::DoctorEndMeeting { message }
                if message == "The doctor has ended the meeting."));
        }
        assert!(!doctor.is_connected());
        assert!(!joined.is_connected());
        assert!(!waiting.is_connected());
        assert!(fx.snapshot("s3").is_none());
        assert!(fx.coordinator.bindings.is_empty());
    }

    #[tokio::test]
    async fn test_doctor_end_requires_doctor_binding() {
        let mut fx = Fixture::new();
        let (patient, _patient_rx) = fx.connect();
        fx.patient_waits(patient.id(), "s1", "Alice").unwrap();

        let err = fx
            .coordinator
            .handle_client(patient.id(), ClientEvent::DoctorEnd)
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Unauthorized(_)));
        assert!(fx.snapshot("s1").is_some());
    }

    #[tokio::test]
    async fn test_disconnect_cleanup_deletes_empty_session() {
        let mut fx = Fixture::new();
        let (patient, _patient_rx) = fx.connect();
        fx.patient_waits(patient.id(), "s4", "Alice").unwrap();

        fx.registry.remove(patient.id());
        fx.coordinator.handle_connection_closed(patient.id());

        assert!(fx.snapshot("s4").is_none());
        assert!(fx.coordinator.bindings.is_empty());
    }

    #[tokio::test]
    async fn test_doctor_disconnect_leaves_headless_session() {
        let mut fx = Fixture::new();
        let (doctor, _doctor_rx) = fx.connect();
        let (patient, mut patient_rx) = fx.connect();

        fx.doctor_joins(doctor.id(), "s1").unwrap();
        fx.patient_waits(patient.id(), "s1", "Alice").unwrap();
        let _ = drain(&mut patient_rx);

        fx.registry.remove(doctor.id());
        fx.coordinator.handle_connection_closed(doctor.id());

        // Patients stay, nobody is notified.
        let snapshot = fx.snapshot("s1").unwrap();
        assert!(snapshot.doctor.is_none());
        assert_eq!(snapshot.waiting.len(), 1);
        assert!(drain(&mut patient_rx).is_empty());
    }

    #[tokio::test]
    async fn test_role_conflicts_are_rejected() {
        let mut fx = Fixture::new();
        let (doctor, _doctor_rx) = fx.connect();
        let (patient, _patient_rx) = fx.connect();

        fx.doctor_joins(doctor.id(), "s1").unwrap();
        fx.patient_waits(patient.id(), "s1", "Alice").unwrap();

        // Bound doctor cannot act as a patient.
        let err = fx.patient_waits(doctor.id(), "s1", "Dr. Lee").unwrap_err();
        assert!(matches!(err, CoordinatorError::Conflict(_)));

        // Bound patient cannot take the doctor slot.
        let err = fx.doctor_joins(patient.id(), "s1").unwrap_err();
        assert!(matches!(err, CoordinatorError::Conflict(_)));

        // Bound patient cannot wait in a second session.
        let err = fx.patient_waits(patient.id(), "s2", "Alice").unwrap_err();
        assert!(matches!(err, CoordinatorError::Conflict(_)));
        assert!(fx.snapshot("s2").is_none());
    }

    #[tokio::test]
    async fn test_declared_role_mismatch_is_rejected() {
        let mut fx = Fixture::new();
        let (conn, _rx) = fx.connect();

        let err = fx
            .coordinator
            .handle_client(
                conn.id(),
                ClientEvent::JoinMeeting {
                    session_id: "s1".to_string(),
                    user_name: "Mallory".to_string(),
                    declared_role: Some(ROLE_PATIENT),
                },
            )
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Conflict(_)));
        assert!(fx.snapshot("s1").is_none());
    }

    #[tokio::test]
    async fn test_sets_stay_disjoint() {
        let mut fx = Fixture::new();
        let (doctor, _doctor_rx) = fx.connect();
        let (patient, _patient_rx) = fx.connect();

        fx.doctor_joins(doctor.id(), "s1").unwrap();
        fx.patient_waits(patient.id(), "s1", "Alice").unwrap();
        fx.coordinator
            .handle_client(
                doctor.id(),
                ClientEvent::ApprovePatient {
                    session_id: "s1".to_string(),
                    patient_id: patient.id(),
                },
            )
            .unwrap();
        fx.coordinator
            .handle_client(
                patient.id(),
                ClientEvent::PatientJoinMeeting {
                    session_id: "s1".to_string(),
                    user_name: None,
                },
            )
            .unwrap();

        let snapshot = fx.snapshot("s1").unwrap();
        let waiting: Vec<Uuid> = snapshot.waiting.iter().map(|(id, _)| *id).collect();
        let joined: Vec<Uuid> = snapshot.joined.iter().map(|(id, _)| *id).collect();
        assert!(waiting.iter().all(|id| !joined.contains(id)));
        assert!(!joined.contains(&doctor.id()));
        assert!(!waiting.contains(&doctor.id()));
    }
}
