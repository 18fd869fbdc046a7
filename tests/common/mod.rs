// Common test utilities for integration tests
// Shared fixtures: logging, the c1/d1/p1 consultation and sessions over an in-process hub.
#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};

use log::LevelFilter;
use tokio::time::Duration;

use carechat::chat::{ChatSession, InMemoryDirectory, MemoryHub};
use carechat::config::ChatConfig;
use carechat::models::{Actor, ChatMessage, Consultation, ConsultationStatus};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub const CONSULTATION: &str = "c1";

pub fn doctor() -> Actor {
    Actor::doctor("d1", "Dr. Ada")
}

pub fn patient() -> Actor {
    Actor::patient("p1", "Maria")
}

pub fn consultation(status: ConsultationStatus) -> Consultation {
    Consultation {
        id: CONSULTATION.to_string(),
        status,
        doctor_id: "d1".to_string(),
        patient_id: "p1".to_string(),
        schedule: None,
    }
}

pub fn directory_with(status: ConsultationStatus) -> Arc<InMemoryDirectory> {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.insert(consultation(status));
    directory
}

/// Shortened timings so failure paths finish quickly under paused time.
pub fn fast_config() -> ChatConfig {
    ChatConfig {
        connect_timeout_ms: 1_000,
        backoff_base_ms: 100,
        ack_timeout_ms: 1_000,
        ..ChatConfig::default()
    }
}

pub fn session(
    actor: Actor,
    hub: &Arc<MemoryHub>,
    directory: &Arc<InMemoryDirectory>,
    config: ChatConfig,
) -> ChatSession {
    ChatSession::new(actor, hub.clone(), directory.clone(), config)
}

/// Collects every message handed to an `on_receive` handler.
pub fn recorder() -> (Arc<Mutex<Vec<ChatMessage>>>, impl Fn(&ChatMessage) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |message: &ChatMessage| sink.lock().unwrap().push(message.clone()))
}

pub fn contents(messages: &[ChatMessage]) -> Vec<String> {
    messages.iter().map(|m| m.content.clone()).collect()
}

/// Let spawned reader and writer tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
