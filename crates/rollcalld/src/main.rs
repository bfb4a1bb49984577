use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod capture;
mod config;
mod dbus_interface;
mod recognizer;
mod session;
mod sync;

use config::Config;
use dbus_interface::RollcallService;
use recognizer::RecognitionClient;
use session::SessionManager;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();
    let db = rollcall_store::Database::open(config.db_path.clone())?;
    tracing::info!(path = %config.db_path.display(), "database opened");

    let recognizer = RecognitionClient::new(
        config.recognizer_url.clone(),
        config.recognize_timeout_secs,
    )?;
    tracing::info!(url = %config.recognizer_url, "recognition client ready");

    let (notice_tx, mut notice_rx) = tokio::sync::mpsc::unbounded_channel();
    let manager = SessionManager::new(db, recognizer, &config, notice_tx);

    // Sessions left active by a previous run have no tasks anymore;
    // close them before accepting new work.
    let orphaned = manager.close_orphaned().await?;
    if orphaned > 0 {
        tracing::info!(count = orphaned, "closed orphaned sessions");
    }

    let recent = Arc::new(Mutex::new(VecDeque::with_capacity(config.recent_notices)));
    let recent_limit = config.recent_notices;
    let recent_writer = Arc::clone(&recent);
    tokio::spawn(async move {
        while let Some(notice) = notice_rx.recv().await {
            tracing::info!(
                session = %notice.session_id,
                class = %notice.class_id,
                student = %notice.student_id,
                status = notice.status.as_str(),
                "attendance notice"
            );
            let mut recent = dbus_interface::lock_recent(&recent_writer);
            if recent.len() == recent_limit {
                recent.pop_front();
            }
            recent.push_back(notice);
        }
    });

    let service = RollcallService {
        manager: Arc::clone(&manager),
        recent,
    };
    let _connection = zbus::connection::Builder::session()?
        .name("org.rollcall.Rollcall1")?
        .serve_at("/org/rollcall/Rollcall1", service)?
        .build()
        .await?;
    tracing::info!("rollcalld ready on org.rollcall.Rollcall1");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    manager.shutdown().await;

    Ok(())
}
