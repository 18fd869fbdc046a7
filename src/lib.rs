// Re-export needed modules for testing
pub mod chat;
pub mod config;
pub mod models;

// Re-export main types for convenience
pub use chat::{ChatError, ChatSession, MessageChannel, RoomMode};
pub use config::ChatConfig;
pub use models::*;
