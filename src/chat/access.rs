// Consultation access gate.
// Evaluates a status snapshot; never caches it and never mutates it.

use log::debug;
use thiserror::Error;

use crate::models::{Actor, ActorRole, Consultation, ConsultationStatus};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("Consultation {0} is not confirmed")]
    NotConfirmed(String),
    #[error("Consultation {0} has ended; the room is read-only")]
    ConsultationEnded(String),
    #[error("Consultation {0} was cancelled")]
    Cancelled(String),
    #[error("{actor} is not a participant of consultation {consultation}")]
    Unauthorized { consultation: String, actor: String },
}

/// How a room is joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomMode {
    /// Two-way chat.
    Live,
    /// Read past messages only; sends are refused.
    HistoryOnly,
}

fn check_participant(consultation: &Consultation, actor: &Actor) -> Result<(), AccessError> {
    let bound_id = match actor.role {
        ActorRole::Doctor => &consultation.doctor_id,
        ActorRole::Patient => &consultation.patient_id,
    };
    if *bound_id != actor.id {
        return Err(AccessError::Unauthorized {
            consultation: consultation.id.clone(),
            actor: actor.id.clone(),
        });
    }
    Ok(())
}

/// Decide whether `actor` may join the consultation's room in `requested` mode.
pub fn evaluate_join(
    consultation: &Consultation,
    actor: &Actor,
    requested: RoomMode,
) -> Result<RoomMode, AccessError> {
    check_participant(consultation, actor)?;
    let id = consultation.id.clone();

    let decision = match (consultation.status, requested) {
        (ConsultationStatus::Cancelled, _) => Err(AccessError::Cancelled(id)),
        (ConsultationStatus::Confirmed | ConsultationStatus::InProgress, mode) => Ok(mode),
        (ConsultationStatus::Completed, RoomMode::HistoryOnly) => Ok(RoomMode::HistoryOnly),
        (ConsultationStatus::Completed, RoomMode::Live) | (ConsultationStatus::Pending, _) => {
            Err(AccessError::NotConfirmed(id))
        }
    };
    debug!(
        "Join check for {} on {} ({:?}, {:?}): {:?}",
        actor.id, consultation.id, consultation.status, requested, decision
    );
    decision
}

/// Decide whether `actor` may send into the consultation's room right now.
pub fn evaluate_send(consultation: &Consultation, actor: &Actor) -> Result<(), AccessError> {
    check_participant(consultation, actor)?;
    let id = consultation.id.clone();
    match consultation.status {
        ConsultationStatus::Confirmed | ConsultationStatus::InProgress => Ok(()),
        ConsultationStatus::Pending => Err(AccessError::NotConfirmed(id)),
        ConsultationStatus::Completed => Err(AccessError::ConsultationEnded(id)),
        ConsultationStatus::Cancelled => Err(AccessError::Cancelled(id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consultation(status: ConsultationStatus) -> Consultation {
        Consultation {
            id: "c1".to_string(),
            status,
            doctor_id: "d1".to_string(),
            patient_id: "p1".to_string(),
            schedule: None,
        }
    }

    #[test]
    fn test_live_join_by_status() {
        let doctor = Actor::doctor("d1", "Dr. Ada");
        let cases = [
            (ConsultationStatus::Pending, Err(AccessError::NotConfirmed("c1".into()))),
            (ConsultationStatus::Confirmed, Ok(RoomMode::Live)),
            (ConsultationStatus::InProgress, Ok(RoomMode::Live)),
            (ConsultationStatus::Completed, Err(AccessError::NotConfirmed("c1".into()))),
            (ConsultationStatus::Cancelled, Err(AccessError::Cancelled("c1".into()))),
        ];
        for (status, expected) in cases {
            assert_eq!(evaluate_join(&consultation(status), &doctor, RoomMode::Live), expected, "{:?}", status);
        }
    }

    #[test]
    fn test_history_join_on_completed_and_cancelled() {
        let patient = Actor::patient("p1", "Maria");
        assert_eq!(
            evaluate_join(&consultation(ConsultationStatus::Completed), &patient, RoomMode::HistoryOnly),
            Ok(RoomMode::HistoryOnly)
        );
        assert_eq!(
            evaluate_join(&consultation(ConsultationStatus::Cancelled), &patient, RoomMode::HistoryOnly),
            Err(AccessError::Cancelled("c1".into()))
        );
        assert_eq!(
            evaluate_join(&consultation(ConsultationStatus::Pending), &patient, RoomMode::HistoryOnly),
            Err(AccessError::NotConfirmed("c1".into()))
        );
    }

    #[test]
    fn test_only_the_bound_pair_may_join() {
        let stranger = Actor::doctor("d2", "Dr. Who");
        let impostor = Actor::patient("d1", "Not the patient");
        let confirmed = consultation(ConsultationStatus::Confirmed);

        assert!(matches!(
            evaluate_join(&confirmed, &stranger, RoomMode::Live),
            Err(AccessError::Unauthorized { .. })
        ));
        // Right id, wrong side of the consultation
        assert!(matches!(
            evaluate_join(&confirmed, &impostor, RoomMode::Live),
            Err(AccessError::Unauthorized { .. })
        ));
    }

    #[test]
    fn test_send_after_completion_reports_ended() {
        let patient = Actor::patient("p1", "Maria");
        assert_eq!(evaluate_send(&consultation(ConsultationStatus::Confirmed), &patient), Ok(()));
        assert_eq!(
            evaluate_send(&consultation(ConsultationStatus::Completed), &patient),
            Err(AccessError::ConsultationEnded("c1".into()))
        );
    }
}
