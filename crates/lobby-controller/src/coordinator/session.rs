//! Session state.
//!
//! A session is one doctor slot plus two ordered patient sets: the waiting
//! lobby and the joined set. A connection appears in at most one of the two
//! sets. All mutation happens on the coordinator task, so nothing here needs
//! synchronization.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use uuid::Uuid;

/// Role a connection holds within a session. Fixed at the first successful
/// join and never changed for the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Doctor,
    Patient,
}

/// The session's doctor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Doctor {
    pub connection_id: Uuid,
    pub user_name: String,
}

/// A patient known to the session, in either set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patient {
    pub user_name: String,
}

/// Where a connection was found when it got removed from a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Doctor,
    Waiting,
    Joined,
    NotPresent,
}

/// One waiting-room session.
#[derive(Debug)]
pub struct Session {
    id: String,
    doctor: Option<Doctor>,
    waiting_lobby: IndexMap<Uuid, Patient>,
    joined_patients: IndexMap<Uuid, Patient>,
    created_at: DateTime<Utc>,
}

impl Session {
    #[must_use]
    pub fn new(id: String) -> Self {
        Self {
            id,
            doctor: None,
            waiting_lobby: IndexMap::new(),
            joined_patients: IndexMap::new(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn doctor(&self) -> Option<&Doctor> {
        self.doctor.as_ref()
    }

    #[must_use]
    pub fn is_doctor(&self, connection_id: Uuid) -> bool {
        self.doctor
            .as_ref()
            .is_some_and(|d| d.connection_id == connection_id)
    }

    /// Installs a doctor, returning the displaced doctor's connection id if
    /// the slot was already held by someone else.
    pub fn set_doctor(&mut self, connection_id: Uuid, user_name: String) -> Option<Uuid> {
        let displaced = self
            .doctor
            .as_ref()
            .map(|d| d.connection_id)
            .filter(|&prev| prev != connection_id);
        self.doctor = Some(Doctor {
            connection_id,
            user_name,
        });
        displaced
    }

    /// Appends a patient to the waiting lobby. Insertion order is delivery
    /// order for `patient_request` notifications.
    pub fn add_waiting(&mut self, connection_id: Uuid, user_name: String) {
        self.waiting_lobby.insert(connection_id, Patient { user_name });
    }

    #[must_use]
    pub fn is_waiting(&self, connection_id: Uuid) -> bool {
        self.waiting_lobby.contains_key(&connection_id)
    }

    #[must_use]
    pub fn is_joined(&self, connection_id: Uuid) -> bool {
        self.joined_patients.contains_key(&connection_id)
    }

    /// Removes a patient from the waiting lobby, preserving the order of the
    /// rest.
    pub fn remove_waiting(&mut self, connection_id: Uuid) -> Option<Patient> {
        self.waiting_lobby.shift_remove(&connection_id)
    }

    pub fn remove_joined(&mut self, connection_id: Uuid) -> Option<Patient> {
        self.joined_patients.shift_remove(&connection_id)
    }

    /// Moves a patient from the waiting lobby into the joined set.
    pub fn approve(&mut self, connection_id: Uuid) -> Option<Patient> {
        let patient = self.waiting_lobby.shift_remove(&connection_id)?;
        self.joined_patients
            .insert(connection_id, patient.clone());
        Some(patient)
    }

    /// Marks a patient as joined, moving them out of the waiting lobby if
    /// they are still there.
    pub fn mark_joined(&mut self, connection_id: Uuid, user_name: String) {
        self.waiting_lobby.shift_remove(&connection_id);
        self.joined_patients
            .insert(connection_id, Patient { user_name });
    }

    #[must_use]
    pub fn waiting_name(&self, connection_id: Uuid) -> Option<&str> {
        self.waiting_lobby
            .get(&connection_id)
            .map(|p| p.user_name.as_str())
    }

    #[must_use]
    pub fn joined_name(&self, connection_id: Uuid) -> Option<&str> {
        self.joined_patients
            .get(&connection_id)
            .map(|p| p.user_name.as_str())
    }

    /// Waiting patients in arrival order.
    pub fn waiting(&self) -> impl Iterator<Item = (Uuid, &Patient)> {
        self.waiting_lobby.iter().map(|(id, p)| (*id, p))
    }

    /// Joined patients in join order.
    pub fn joined(&self) -> impl Iterator<Item = (Uuid, &Patient)> {
        self.joined_patients.iter().map(|(id, p)| (*id, p))
    }

    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.waiting_lobby.len()
    }

    #[must_use]
    pub fn joined_count(&self) -> usize {
        self.joined_patients.len()
    }

    /// Removes a connection from whichever position it holds.
    pub fn remove_connection(&mut self, connection_id: Uuid) -> Removal {
        if self.is_doctor(connection_id) {
            self.doctor = None;
            return Removal::Doctor;
        }
        if self.waiting_lobby.shift_remove(&connection_id).is_some() {
            return Removal::Waiting;
        }
        if self.joined_patients.shift_remove(&connection_id).is_some() {
            return Removal::Joined;
        }
        Removal::NotPresent
    }

    /// True when no doctor and no patients remain. Empty sessions are
    /// deleted by the coordinator.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.doctor.is_none() && self.waiting_lobby.is_empty() && self.joined_patients.is_empty()
    }
}

/// Point-in-time view of a session, for status reporting and tests.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub doctor: Option<String>,
    pub waiting: Vec<(Uuid, String)>,
    pub joined: Vec<(Uuid, String)>,
}

impl SessionSnapshot {
    #[must_use]
    pub fn of(session: &Session) -> Self {
        Self {
            session_id: session.id().to_string(),
            doctor: session.doctor().map(|d| d.user_name.clone()),
            waiting: session
                .waiting()
                .map(|(id, p)| (id, p.user_name.clone()))
                .collect(),
            joined: session
                .joined()
                .map(|(id, p)| (id, p.user_name.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_waiting_lobby_preserves_arrival_order() {
        let mut session = Session::new("room-1".to_string());
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        session.add_waiting(a, "Ada".to_string());
        session.add_waiting(b, "Ben".to_string());
        session.add_waiting(c, "Cleo".to_string());

        let order: Vec<Uuid> = session.waiting().map(|(id, _)| id).collect();
        assert_eq!(order, vec![a, b, c]);

        // Removing from the middle keeps the relative order of the rest.
        session.remove_waiting(b).unwrap();
        let order: Vec<Uuid> = session.waiting().map(|(id, _)| id).collect();
        assert_eq!(order, vec![a, c]);
    }

    #[test]
    fn test_approve_moves_to_joined() {
        let mut session = Session::new("room-1".to_string());
        let patient = Uuid::new_v4();
        session.add_waiting(patient, "Ada".to_string());

        let info = session.approve(patient).unwrap();
        assert_eq!(info.user_name, "Ada");
        assert!(!session.is_waiting(patient));
        assert!(session.is_joined(patient));
        assert_eq!(session.waiting_count(), 0);
        assert_eq!(session.joined_count(), 1);
    }

    #[test]
    fn test_approve_missing_patient() {
        let mut session = Session::new("room-1".to_string());
        assert!(session.approve(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_set_doctor_reports_displaced() {
        let mut session = Session::new("room-1".to_string());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert_eq!(session.set_doctor(first, "Dr. Lee".to_string()), None);
        // Same connection re-joining displaces nobody.
        assert_eq!(session.set_doctor(first, "Dr. Lee".to_string()), None);
        // A new connection taking the slot displaces the old one.
        assert_eq!(
            session.set_doctor(second, "Dr. Wu".to_string()),
            Some(first)
        );
        assert!(session.is_doctor(second));
        assert!(!session.is_doctor(first));
    }

    #[test]
    fn test_remove_connection_from_each_position() {
        let mut session = Session::new("room-1".to_string());
        let doctor = Uuid::new_v4();
        let waiting = Uuid::new_v4();
        let joined = Uuid::new_v4();

        session.set_doctor(doctor, "Dr. Lee".to_string());
        session.add_waiting(waiting, "Ada".to_string());
        session.mark_joined(joined, "Ben".to_string());

        assert_eq!(session.remove_connection(waiting), Removal::Waiting);
        assert_eq!(session.remove_connection(joined), Removal::Joined);
        assert_eq!(session.remove_connection(doctor), Removal::Doctor);
        assert_eq!(session.remove_connection(doctor), Removal::NotPresent);
        assert!(session.is_empty());
    }

    #[test]
    fn test_mark_joined_moves_out_of_lobby() {
        let mut session = Session::new("room-1".to_string());
        let patient = Uuid::new_v4();
        session.add_waiting(patient, "Ada".to_string());

        session.mark_joined(patient, "Ada".to_string());
        assert!(!session.is_waiting(patient));
        assert!(session.is_joined(patient));
    }

    #[test]
    fn test_snapshot() {
        let mut session = Session::new("room-1".to_string());
        let doctor = Uuid::new_v4();
        let patient = Uuid::new_v4();
        session.set_doctor(doctor, "Dr. Lee".to_string());
        session.add_waiting(patient, "Ada".to_string());

        let snapshot = SessionSnapshot::of(&session);
        assert_eq!(snapshot.session_id, "room-1");
        assert_eq!(snapshot.doctor.as_deref(), Some("Dr. Lee"));
        assert_eq!(snapshot.waiting, vec![(patient, "Ada".to_string())]);
        assert!(snapshot.joined.is_empty());
    }
}
