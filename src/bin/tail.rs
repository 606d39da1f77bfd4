/**
 * livesync-tail
 *
 * Opens one chat room (and the user's notification queue when a user id is
 * configured) and logs every snapshot change until Ctrl-C.
 *
 * Usage: livesync-tail <room> [config.toml]
 */
use livesync::client::telemetry::init_tracing;
use livesync::client::{Config, SyncEngine};
use std::collections::HashSet;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file if present
    dotenv::dotenv().ok();
    init_tracing("livesync=info");

    let mut args = std::env::args().skip(1);
    let Some(room) = args.next() else {
        eprintln!("usage: livesync-tail <room> [config.toml]");
        std::process::exit(2);
    };
    let config_path = args.next().map(PathBuf::from);

    let config = Config::load(config_path.as_deref())?;
    tracing::info!(api = %config.app().api_url, broker = %config.broker_url(), "Starting");

    let engine = SyncEngine::from_config(&config)?;
    let mut events = engine.events();
    let mut room_rx = engine.open_room(&room).await?;
    let mut notifications_rx = match config.user_id() {
        Some(_) => match engine.open_notifications().await {
            Ok(rx) => Some(rx),
            Err(e) => {
                tracing::warn!("Notifications unavailable: {}", e);
                None
            }
        },
        None => None,
    };

    let mut printed = HashSet::new();
    for message in room_rx.borrow_and_update().messages.iter() {
        printed.insert(message.id);
        println!("[{}] {}: {}", message.created_at.format("%H:%M:%S"), message.sender_display_name, message.body);
    }
    loop {
        tokio::select! {
            changed = room_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = room_rx.borrow_and_update().clone();
                for message in snapshot.messages.iter().filter(|m| printed.insert(m.id)) {
                    println!(
                        "[{}] {}: {}",
                        message.created_at.format("%H:%M:%S"),
                        message.sender_display_name,
                        message.body
                    );
                }
                tracing::debug!(live = snapshot.is_live, cursor = ?snapshot.loaded_history_cursor, "Room updated");
            }
            changed = async {
                match notifications_rx.as_mut() {
                    Some(rx) => rx.changed().await,
                    None => std::future::pending().await,
                }
            } => {
                if changed.is_ok() {
                    tracing::info!(unread = engine.unread_count(), "Notifications updated");
                }
            }
            event = events.recv() => {
                if let Ok(event) = event {
                    tracing::info!(?event, "Session event");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    engine.shutdown().await;
    Ok(())
}
