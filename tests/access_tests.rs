// Consultation access tests
// Join and send gating across the consultation lifecycle.

mod common;
use common::{contents, directory_with, doctor, fast_config, patient, session, settle, setup_logging, CONSULTATION};

use std::sync::Arc;

use carechat::chat::{AccessError, ChatError, ConsultationDirectory, MemoryHub, RoomMode};
use carechat::models::{Actor, ConsultationStatus};

#[tokio::test(start_paused = true)]
async fn test_pending_consultation_refuses_until_confirmed() {
    setup_logging();
    let hub = Arc::new(MemoryHub::new());
    let directory = directory_with(ConsultationStatus::Pending);
    let chat = session(patient(), &hub, &directory, fast_config());

    let refused = chat.join(CONSULTATION, RoomMode::Live).await;
    assert!(matches!(refused, Err(ChatError::Access(AccessError::NotConfirmed(_)))));
    // Refused before any transport work
    assert_eq!(hub.open_attempts(), 0);

    directory
        .update_status(CONSULTATION, ConsultationStatus::Confirmed)
        .await
        .expect("confirm");
    let channel = chat.join(CONSULTATION, RoomMode::Live).await.expect("join after confirm");
    assert!(!channel.is_history_only());
    assert!(channel.send("Hello doctor").await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_completed_consultation_is_read_only() {
    setup_logging();
    let hub = Arc::new(MemoryHub::new());
    let directory = directory_with(ConsultationStatus::Confirmed);

    {
        let doctor_chat = session(doctor(), &hub, &directory, fast_config());
        let room = doctor_chat.join(CONSULTATION, RoomMode::Live).await.expect("doctor join");
        room.send("Please rest and stay hydrated.").await.expect("send");
    }
    directory
        .update_status(CONSULTATION, ConsultationStatus::InProgress)
        .await
        .expect("start");
    directory
        .update_status(CONSULTATION, ConsultationStatus::Completed)
        .await
        .expect("complete");

    let chat = session(patient(), &hub, &directory, fast_config());
    let live = chat.join(CONSULTATION, RoomMode::Live).await;
    assert!(matches!(live, Err(ChatError::Access(AccessError::NotConfirmed(_)))));

    let archive = chat
        .join(CONSULTATION, RoomMode::HistoryOnly)
        .await
        .expect("history-only join");
    settle().await;
    assert!(archive.is_history_only());
    assert_eq!(contents(&archive.messages()), vec!["Please rest and stay hydrated."]);

    let sent = archive.send("One more question").await;
    assert!(matches!(sent, Err(ChatError::Access(AccessError::ConsultationEnded(_)))));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_consultation_refuses_everything() {
    setup_logging();
    let hub = Arc::new(MemoryHub::new());
    let directory = directory_with(ConsultationStatus::Cancelled);
    let chat = session(patient(), &hub, &directory, fast_config());

    for mode in [RoomMode::Live, RoomMode::HistoryOnly] {
        let result = chat.join(CONSULTATION, mode).await;
        assert!(matches!(result, Err(ChatError::Access(AccessError::Cancelled(_)))));
    }
}

#[tokio::test(start_paused = true)]
async fn test_status_is_rechecked_on_every_send() {
    setup_logging();
    let hub = Arc::new(MemoryHub::new());
    let directory = directory_with(ConsultationStatus::Confirmed);
    let chat = session(patient(), &hub, &directory, fast_config());

    let channel = chat.join(CONSULTATION, RoomMode::Live).await.expect("join");
    assert!(channel.send("See you at ten").await.is_ok());

    directory
        .update_status(CONSULTATION, ConsultationStatus::Cancelled)
        .await
        .expect("cancel");
    let result = channel.send("Are we still on?").await;
    assert!(matches!(result, Err(ChatError::Access(AccessError::Cancelled(_)))));
}

#[tokio::test(start_paused = true)]
async fn test_non_participants_are_unauthorized() {
    setup_logging();
    let hub = Arc::new(MemoryHub::new());
    let directory = directory_with(ConsultationStatus::Confirmed);

    let outsider = session(Actor::patient("p2", "Someone Else"), &hub, &directory, fast_config());
    let result = outsider.join(CONSULTATION, RoomMode::Live).await;
    assert!(matches!(result, Err(ChatError::Access(AccessError::Unauthorized { .. }))));

    // A doctor id in the patient seat does not count
    let impostor = session(Actor::doctor("p1", "Not A Doctor"), &hub, &directory, fast_config());
    let result = impostor.join(CONSULTATION, RoomMode::HistoryOnly).await;
    assert!(matches!(result, Err(ChatError::Access(AccessError::Unauthorized { .. }))));

    let chat = session(patient(), &hub, &directory, fast_config());
    let result = chat.join("no-such-consultation", RoomMode::Live).await;
    assert!(matches!(result, Err(ChatError::Access(AccessError::Unauthorized { .. }))));
    assert_eq!(hub.open_attempts(), 0);
}

#[tokio::test]
async fn test_illegal_transition_is_rejected() {
    setup_logging();
    let directory = directory_with(ConsultationStatus::Pending);

    let result = directory
        .update_status(CONSULTATION, ConsultationStatus::Completed)
        .await;
    assert!(result.is_err());
    let snapshot = directory
        .get_consultation(CONSULTATION)
        .await
        .expect("lookup")
        .expect("present");
    assert_eq!(snapshot.status, ConsultationStatus::Pending);
}
