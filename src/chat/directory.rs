// Consultation collaborator interface.
// The messaging core only reads from it; status updates come from UI actions.

use anyhow::Result;
use async_trait::async_trait;
use log::info;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use crate::models::{Consultation, ConsultationStatus};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Unknown consultation {0}")]
    UnknownConsultation(String),
    #[error("Consultation {id} cannot move from {from:?} to {to:?}")]
    Illegal {
        id: String,
        from: ConsultationStatus,
        to: ConsultationStatus,
    },
}

#[async_trait]
pub trait ConsultationDirectory: Send + Sync + 'static {
    /// Fresh snapshot, `None` if the consultation does not exist.
    async fn get_consultation(&self, id: &str) -> Result<Option<Consultation>>;

    async fn update_status(&self, id: &str, status: ConsultationStatus) -> Result<()>;
}

/// In-process directory used by the demo binary and tests.
#[derive(Default)]
pub struct InMemoryDirectory {
    consultations: Mutex<HashMap<String, Consultation>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, consultation: Consultation) {
        let mut map = self.consultations.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(consultation.id.clone(), consultation);
    }
}

#[async_trait]
impl ConsultationDirectory for InMemoryDirectory {
    async fn get_consultation(&self, id: &str) -> Result<Option<Consultation>> {
        let map = self.consultations.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(id).cloned())
    }

    async fn update_status(&self, id: &str, status: ConsultationStatus) -> Result<()> {
        let mut map = self.consultations.lock().unwrap_or_else(|e| e.into_inner());
        let consultation = map
            .get_mut(id)
            .ok_or_else(|| TransitionError::UnknownConsultation(id.to_string()))?;
        if !consultation.status.can_transition_to(status) {
            return Err(TransitionError::Illegal {
                id: id.to_string(),
                from: consultation.status,
                to: status,
            }
            .into());
        }
        info!("Consultation {} moved from {:?} to {:?}", id, consultation.status, status);
        consultation.status = status;
        if status.is_terminal() {
            info!("Consultation {} is closed; live chat is no longer allowed", id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> Consultation {
        Consultation {
            id: "c1".to_string(),
            status: ConsultationStatus::Pending,
            doctor_id: "d1".to_string(),
            patient_id: "p1".to_string(),
            schedule: None,
        }
    }

    #[tokio::test]
    async fn test_lifecycle_walk() {
        let directory = InMemoryDirectory::new();
        directory.insert(pending());

        for next in [
            ConsultationStatus::Confirmed,
            ConsultationStatus::InProgress,
            ConsultationStatus::Completed,
        ] {
            directory.update_status("c1", next).await.unwrap();
        }
        let snapshot = directory.get_consultation("c1").await.unwrap().unwrap();
        assert_eq!(snapshot.status, ConsultationStatus::Completed);
    }

    #[tokio::test]
    async fn test_illegal_transitions_are_refused() {
        let directory = InMemoryDirectory::new();
        directory.insert(pending());

        let err = directory
            .update_status("c1", ConsultationStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransitionError>(),
            Some(TransitionError::Illegal { .. })
        ));

        directory.update_status("c1", ConsultationStatus::Cancelled).await.unwrap();
        // Cancelled is terminal
        assert!(directory.update_status("c1", ConsultationStatus::Confirmed).await.is_err());
        assert!(directory.update_status("c9", ConsultationStatus::Confirmed).await.is_err());
    }
}
