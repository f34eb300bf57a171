//! End-to-end session flows through the spawned coordinator actor.
//!
//! These tests drive the public handle the transport uses and observe
//! outbound traffic on each connection's queue, so they cover the same
//! ordering and delivery guarantees a WebSocket client sees.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use lobby_controller::coordinator::SessionCoordinatorHandle;
use lobby_controller::errors::CoordinatorError;
use lobby_controller::protocol::{ClientEvent, ServerEvent};
use lobby_controller::registry::{ConnectionHandle, ConnectionRegistry};

const ROLE_PATIENT: u8 = 0;
const ROLE_DOCTOR: u8 = 1;

struct TestServer {
    registry: Arc<ConnectionRegistry>,
    coordinator: SessionCoordinatorHandle,
    shutdown: CancellationToken,
}

impl TestServer {
    fn spawn() -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let shutdown = CancellationToken::new();
        let (coordinator, _task) =
            SessionCoordinatorHandle::spawn(Arc::clone(&registry), shutdown.clone());
        Self {
            registry,
            coordinator,
            shutdown,
        }
    }

    fn connect(&self) -> (Arc<ConnectionHandle>, Receiver<ServerEvent>) {
        self.registry.register()
    }

    async fn doctor_joins(&self, conn: Uuid, session: &str) -> Result<(), CoordinatorError> {
        self.coordinator
            .dispatch(
                conn,
                ClientEvent::JoinMeeting {
                    session_id: session.to_string(),
                    user_name: "Dr. Lee".to_string(),
                    declared_role: Some(ROLE_DOCTOR),
                },
            )
            .await
    }

    async fn patient_waits(
        &self,
        conn: Uuid,
        session: &str,
        name: &str,
    ) -> Result<(), CoordinatorError> {
        self.coordinator
            .dispatch(
                conn,
                ClientEvent::WaitingLobby {
                    session_id: session.to_string(),
                    user_name: name.to_string(),
                    declared_role: Some(ROLE_PATIENT),
                },
            )
            .await
    }

    async fn approve(&self, doctor: Uuid, session: &str, patient: Uuid) -> Result<(), CoordinatorError> {
        self.coordinator
            .dispatch(
                doctor,
                ClientEvent::ApprovePatient {
                    session_id: session.to_string(),
                    patient_id: patient,
                },
            )
            .await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn recv(rx: &mut Receiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

fn drain(rx: &mut Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn scenario_approve_flow() {
    let server = TestServer::spawn();
    let (doctor, mut doctor_rx) = server.connect();
    let (patient, mut patient_rx) = server.connect();

    server.doctor_joins(doctor.id(), "S1").await.unwrap();
    let event = recv(&mut doctor_rx).await;
    assert!(matches!(event, ServerEvent::DoctorJoined { .. }));

    server.patient_waits(patient.id(), "S1", "Alice").await.unwrap();
    let event = recv(&mut patient_rx).await;
    assert!(matches!(event, ServerEvent::Waiting { patient_id, .. }
        if patient_id == patient.id()));
    let event = recv(&mut doctor_rx).await;
    assert!(matches!(event, ServerEvent::PatientRequest { patient_id, ref username }
        if patient_id == patient.id() && username == "Alice"));

    server.approve(doctor.id(), "S1", patient.id()).await.unwrap();
    let event = recv(&mut patient_rx).await;
    assert!(matches!(event, ServerEvent::Approved { patient_id, ref session_id, .. }
        if patient_id == patient.id() && session_id == "S1"));
    let event = recv(&mut doctor_rx).await;
    assert!(matches!(event, ServerEvent::PatientApproved { ref patient_username, .. }
        if patient_username == "Alice"));

    let snapshot = server.coordinator.session_snapshot("S1").await.unwrap();
    assert!(snapshot.waiting.is_empty());
    assert_eq!(snapshot.joined, vec![(patient.id(), "Alice".to_string())]);
}

#[tokio::test]
async fn scenario_reject_leaves_rest_of_lobby() {
    let server = TestServer::spawn();
    let (doctor, _doctor_rx) = server.connect();
    let (p1, mut p1_rx) = server.connect();
    let (p2, _p2_rx) = server.connect();

    server.doctor_joins(doctor.id(), "S2").await.unwrap();
    server.patient_waits(p1.id(), "S2", "P1").await.unwrap();
    server.patient_waits(p2.id(), "S2", "P2").await.unwrap();
    let _ = recv(&mut p1_rx).await;

    server
        .coordinator
        .dispatch(
            doctor.id(),
            ClientEvent::RejectPatient {
                session_id: "S2".to_string(),
                patient_id: p1.id(),
            },
        )
        .await
        .unwrap();

    let event = recv(&mut p1_rx).await;
    assert!(matches!(event, ServerEvent::Rejected { ref message }
        if message == "You are not allowed to join the meeting."));

    let snapshot = server.coordinator.session_snapshot("S2").await.unwrap();
    assert_eq!(snapshot.waiting, vec![(p2.id(), "P2".to_string())]);
    assert!(snapshot.joined.is_empty());
}

#[tokio::test]
async fn scenario_doctor_end_closes_everyone_and_deletes_session() {
    let server = TestServer::spawn();
    let (doctor, mut doctor_rx) = server.connect();
    let (patient, mut patient_rx) = server.connect();

    server.doctor_joins(doctor.id(), "S3").await.unwrap();
    server.patient_waits(patient.id(), "S3", "Alice").await.unwrap();
    server.approve(doctor.id(), "S3", patient.id()).await.unwrap();
    // The dispatch reply arrives after the handler queued its events, so the
    // backlog is fully drainable here.
    let _ = drain(&mut doctor_rx);
    let _ = drain(&mut patient_rx);

    server
        .coordinator
        .dispatch(doctor.id(), ClientEvent::DoctorEnd)
        .await
        .unwrap();

    let event = recv(&mut patient_rx).await;
    assert!(matches!(event, ServerEvent::DoctorEndMeeting { ref message }
        if message == "The doctor has ended the meeting."));
    let event = recv(&mut doctor_rx).await;
    assert!(matches!(event, ServerEvent::DoctorEndMeeting { .. }));
    assert!(!patient.is_connected());
    assert!(!doctor.is_connected());

    assert!(server.coordinator.session_snapshot("S3").await.is_none());
}

#[tokio::test]
async fn lobby_order_is_replayed_to_a_late_doctor() {
    let server = TestServer::spawn();
    let patients: Vec<_> = (0..3).map(|_| server.connect()).collect();
    let names = ["P1", "P2", "P3"];
    for ((handle, _), name) in patients.iter().zip(names) {
        server.patient_waits(handle.id(), "S4", name).await.unwrap();
    }

    let (doctor, mut doctor_rx) = server.connect();
    server.doctor_joins(doctor.id(), "S4").await.unwrap();

    let event = recv(&mut doctor_rx).await;
    assert!(matches!(event, ServerEvent::DoctorJoined { waiting_patients: 3, .. }));
    for ((handle, _), name) in patients.iter().zip(names) {
        let event = recv(&mut doctor_rx).await;
        assert!(matches!(event, ServerEvent::PatientRequest { patient_id, ref username }
            if patient_id == handle.id() && username == name));
    }
}

#[tokio::test]
async fn waiting_lobby_retry_is_idempotent() {
    let server = TestServer::spawn();
    let (patient, mut patient_rx) = server.connect();

    server.patient_waits(patient.id(), "S5", "Alice").await.unwrap();
    server.patient_waits(patient.id(), "S5", "Alice").await.unwrap();

    let first = recv(&mut patient_rx).await;
    let second = recv(&mut patient_rx).await;
    assert!(matches!(first, ServerEvent::Waiting { ref message, .. }
        if message == "Please wait in the lobby."));
    assert!(matches!(second, ServerEvent::Waiting { ref message, .. }
        if message == "You are already in the waiting lobby."));

    let snapshot = server.coordinator.session_snapshot("S5").await.unwrap();
    assert_eq!(snapshot.waiting.len(), 1);
}

#[tokio::test]
async fn non_doctor_approval_is_unauthorized_and_mutates_nothing() {
    let server = TestServer::spawn();
    let (doctor, _doctor_rx) = server.connect();
    let (patient, _patient_rx) = server.connect();
    let (intruder, _intruder_rx) = server.connect();

    server.doctor_joins(doctor.id(), "S6").await.unwrap();
    server.patient_waits(patient.id(), "S6", "Alice").await.unwrap();

    let err = server
        .approve(intruder.id(), "S6", patient.id())
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Unauthorized(_)));
    assert_eq!(
        err.client_message(),
        "Unauthorized: Only the doctor can approve patients"
    );

    let snapshot = server.coordinator.session_snapshot("S6").await.unwrap();
    assert_eq!(snapshot.waiting.len(), 1);
    assert!(snapshot.joined.is_empty());
}

#[tokio::test]
async fn disconnect_cleanup_removes_patient_and_deletes_empty_session() {
    let server = TestServer::spawn();
    let (patient, _patient_rx) = server.connect();

    server.patient_waits(patient.id(), "S7", "Alice").await.unwrap();
    assert!(server.coordinator.session_snapshot("S7").await.is_some());

    server.registry.remove(patient.id());
    server.coordinator.connection_closed(patient.id()).await;

    assert!(server.coordinator.session_snapshot("S7").await.is_none());
    let status = server.coordinator.status().await.unwrap();
    assert_eq!(status.sessions, 0);
    assert_eq!(status.bound_connections, 0);
}

#[tokio::test]
async fn doctor_disconnect_leaves_headless_session_without_notifications() {
    let server = TestServer::spawn();
    let (doctor, _doctor_rx) = server.connect();
    let (patient, mut patient_rx) = server.connect();

    server.doctor_joins(doctor.id(), "S8").await.unwrap();
    server.patient_waits(patient.id(), "S8", "Alice").await.unwrap();
    let _ = recv(&mut patient_rx).await;

    server.registry.remove(doctor.id());
    server.coordinator.connection_closed(doctor.id()).await;

    let snapshot = server.coordinator.session_snapshot("S8").await.unwrap();
    assert!(snapshot.doctor.is_none());
    assert_eq!(snapshot.waiting.len(), 1);
    assert!(drain(&mut patient_rx).is_empty());
}

#[tokio::test]
async fn patient_leave_confirms_then_closes() {
    let server = TestServer::spawn();
    let (doctor, mut doctor_rx) = server.connect();
    let (patient, mut patient_rx) = server.connect();

    server.doctor_joins(doctor.id(), "S9").await.unwrap();
    server.patient_waits(patient.id(), "S9", "Alice").await.unwrap();
    server.approve(doctor.id(), "S9", patient.id()).await.unwrap();
    let _ = drain(&mut doctor_rx);
    let _ = drain(&mut patient_rx);

    server
        .coordinator
        .dispatch(
            patient.id(),
            ClientEvent::PatientLeaveMeeting {
                session_id: "S9".to_string(),
            },
        )
        .await
        .unwrap();

    let event = recv(&mut patient_rx).await;
    assert!(matches!(event, ServerEvent::LeaveConfirmation { .. }));
    assert!(!patient.is_connected());
    let event = recv(&mut doctor_rx).await;
    assert!(matches!(event, ServerEvent::PatientLeave { .. }));

    // Doctor remains, so the session persists with empty patient sets.
    let snapshot = server.coordinator.session_snapshot("S9").await.unwrap();
    assert!(snapshot.waiting.is_empty());
    assert!(snapshot.joined.is_empty());
}

#[tokio::test]
async fn cross_session_membership_is_rejected() {
    let server = TestServer::spawn();
    let (patient, _patient_rx) = server.connect();

    server.patient_waits(patient.id(), "S10", "Alice").await.unwrap();
    let err = server
        .patient_waits(patient.id(), "S11", "Alice")
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Conflict(_)));
    assert!(server.coordinator.session_snapshot("S11").await.is_none());
}
