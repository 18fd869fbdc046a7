#![deny(dead_code)]
use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;

mod utils;

use carechat::chat::{
    ChatError, ChatSession, ConsultationDirectory, InMemoryDirectory, MemoryHub, RoomMode,
};
use carechat::config::ChatConfig;
use carechat::models::{Actor, ChatMessage, Consultation, ConsultationStatus, Delivery};

/// Command line arguments for the consultation chat demo
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Walks a doctor and a patient through a consultation chat over an in-process hub."
)]
struct Args {
    /// JSON file with connection and delivery tunables
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Consultation id used for the walkthrough
    #[arg(long, default_value = "c1")]
    consultation: String,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn print_message(viewer: &str, message: &ChatMessage) {
    println!(
        "  [{}] {} {}: {}",
        viewer,
        message.created_at.format("%H:%M:%S%.3f"),
        message.sender_id,
        message.content
    );
}

fn describe(delivery: &Delivery) -> String {
    match delivery {
        Delivery::Acknowledged(stored) => format!("stored as {}", stored.id.as_deref().unwrap_or("?")),
        Delivery::Queued { request_id } => format!("queued as {}", request_id),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    utils::setup_logging(args.log_file.as_deref(), level)?;

    let config = ChatConfig::load(args.config.as_deref()).context("Failed to load chat config")?;
    info!("Using config: {:?}", config);

    let cid = args.consultation.as_str();
    let hub = Arc::new(MemoryHub::new());
    let directory = Arc::new(InMemoryDirectory::new());
    directory.insert(Consultation {
        id: cid.to_string(),
        status: ConsultationStatus::Pending,
        doctor_id: "d1".to_string(),
        patient_id: "p1".to_string(),
        schedule: Some(chrono::Utc::now()),
    });

    let doctor = ChatSession::new(
        Actor::doctor("d1", "Dr. Ada"),
        hub.clone(),
        directory.clone(),
        config.clone(),
    );
    let patient = ChatSession::new(
        Actor::patient("p1", "Maria"),
        hub.clone(),
        directory.clone(),
        config,
    );

    println!("Joining {} while it is still pending...", cid);
    match patient.join(cid, RoomMode::Live).await {
        Err(ChatError::Access(e)) => println!("  refused: {}", e),
        Err(e) => return Err(e.into()),
        Ok(_) => warn!("Pending consultation unexpectedly admitted a live join"),
    }

    directory.update_status(cid, ConsultationStatus::Confirmed).await?;
    println!("Consultation {} confirmed", cid);

    let patient_room = patient.join(cid, RoomMode::Live).await?;
    let doctor_room = doctor.join(cid, RoomMode::Live).await?;
    let _patient_rx = patient_room.on_receive(|message| print_message("patient", message));
    let _doctor_rx = doctor_room.on_receive(|message| print_message("doctor", message));
    let _doctor_typing = doctor_room.on_typing(|update| {
        let state = if update.is_typing { "is typing..." } else { "stopped typing" };
        println!("  [doctor] {} {}", update.username, state);
    });

    patient_room.emit_typing();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let delivery = patient_room.send("Good morning doctor, I have some questions.").await?;
    println!("Patient message {}", describe(&delivery));
    let delivery = doctor_room.send("Good morning Maria, go ahead.").await?;
    println!("Doctor message {}", describe(&delivery));

    println!("Dropping the network...");
    hub.set_online(false);
    hub.drop_connections();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let delivery = patient_room.send("Is this dizziness normal at week 20?").await?;
    println!("Patient message {} ({} waiting)", describe(&delivery), patient.connection().queued_len().await);

    hub.set_online(true);
    match patient.reconnect().await {
        Ok(ready) => println!("Patient back online as {}", ready.session_id),
        Err(e) => error!("Patient failed to reconnect: {}", e),
    }
    if let Err(e) = doctor.reconnect().await {
        error!("Doctor failed to reconnect: {}", e);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("Transcript seen by the doctor:");
    for message in doctor_room.messages() {
        print_message("doctor", &message);
    }

    directory.update_status(cid, ConsultationStatus::InProgress).await?;
    directory.update_status(cid, ConsultationStatus::Completed).await?;
    drop(patient_room);
    let archive = patient.join(cid, RoomMode::HistoryOnly).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("Completed consultation holds {} message(s)", archive.len());
    match archive.send("One more thing...").await {
        Err(ChatError::Access(e)) => println!("  refused: {}", e),
        other => warn!("Unexpected send result on a completed consultation: {:?}", other.map(|d| describe(&d))),
    }

    patient.disconnect();
    doctor.disconnect();
    info!("Demo finished");
    Ok(())
}
