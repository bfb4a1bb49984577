use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an attendance session for a class
    Start {
        /// Class identifier
        class_id: String,
        /// Teacher identifier
        #[arg(short, long)]
        teacher: String,
        /// Session mode: standard, motion-triggered, or continuous-stream
        #[arg(short, long, default_value = "motion-triggered")]
        mode: String,
        /// Motion strength needed to trigger a capture, in (0, 1]
        #[arg(long)]
        motion_threshold: Option<f32>,
        /// Seconds between admitted captures
        #[arg(long)]
        cooldown_secs: Option<u64>,
        /// Minutes after start still counted as on time
        #[arg(long)]
        on_time_limit_mins: Option<u64>,
        /// Cap on admitted captures per rolling hour
        #[arg(long)]
        max_events_per_hour: Option<u32>,
        /// Session length in minutes before auto-expiry
        #[arg(long)]
        duration_mins: Option<u64>,
    },
    /// End a session and finalize absentees
    End {
        /// Session ID
        session_id: String,
    },
    /// Abort a session, keeping attendance recorded so far
    Cancel {
        /// Session ID
        session_id: String,
    },
    /// Trigger an immediate capture, bypassing motion gating
    Capture {
        /// Session ID
        session_id: String,
    },
    /// Check a student in by hand
    CheckIn {
        /// Session ID
        session_id: String,
        /// Student ID
        student_id: String,
    },
    /// Replace a class roster from a JSON file
    Roster {
        /// Class identifier
        class_id: String,
        /// Path to a JSON array of {"student_id", "display_name"} objects
        file: PathBuf,
    },
    /// Show daemon status and active sessions
    Status,
    /// Show recent attendance notices
    Notices,
}

#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    async fn start_session(
        &self,
        class_id: &str,
        teacher: &str,
        mode: &str,
        config_json: &str,
    ) -> zbus::Result<String>;
    async fn end_session(&self, session_id: &str) -> zbus::Result<String>;
    async fn cancel_session(&self, session_id: &str) -> zbus::Result<String>;
    async fn manual_capture(&self, session_id: &str) -> zbus::Result<String>;
    async fn manual_check_in(&self, session_id: &str, student_id: &str) -> zbus::Result<bool>;
    async fn set_roster(&self, class_id: &str, roster_json: &str) -> zbus::Result<u32>;
    async fn status(&self) -> zbus::Result<String>;
    async fn recent_notices(&self) -> zbus::Result<String>;
}

fn pretty(json: &str) -> String {
    serde_json::from_str::<serde_json::Value>(json)
        .and_then(|value| serde_json::to_string_pretty(&value))
        .unwrap_or_else(|_| json.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let connection = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus; is rollcalld running?")?;
    let proxy = RollcallProxy::new(&connection).await?;

    match cli.command {
        Commands::Start {
            class_id,
            teacher,
            mode,
            motion_threshold,
            cooldown_secs,
            on_time_limit_mins,
            max_events_per_hour,
            duration_mins,
        } => {
            let mut overrides = serde_json::Map::new();
            if let Some(v) = motion_threshold {
                overrides.insert("motion_threshold".into(), v.into());
            }
            if let Some(v) = cooldown_secs {
                overrides.insert("cooldown_secs".into(), v.into());
            }
            if let Some(v) = on_time_limit_mins {
                overrides.insert("on_time_limit_mins".into(), v.into());
            }
            if let Some(v) = max_events_per_hour {
                overrides.insert("max_events_per_hour".into(), v.into());
            }
            if let Some(v) = duration_mins {
                overrides.insert("duration_mins".into(), v.into());
            }
            let config_json = if overrides.is_empty() {
                String::new()
            } else {
                serde_json::Value::Object(overrides).to_string()
            };

            let session = proxy
                .start_session(&class_id, &teacher, &mode, &config_json)
                .await?;
            println!("{}", pretty(&session));
        }
        Commands::End { session_id } => {
            println!("{}", pretty(&proxy.end_session(&session_id).await?));
        }
        Commands::Cancel { session_id } => {
            println!("{}", pretty(&proxy.cancel_session(&session_id).await?));
        }
        Commands::Capture { session_id } => {
            let outcome = proxy.manual_capture(&session_id).await?;
            println!("capture: {outcome}");
        }
        Commands::CheckIn {
            session_id,
            student_id,
        } => {
            if proxy.manual_check_in(&session_id, &student_id).await? {
                println!("checked in {student_id}");
            } else {
                println!("{student_id} was already recorded");
            }
        }
        Commands::Roster { class_id, file } => {
            let roster_json = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let count = proxy.set_roster(&class_id, &roster_json).await?;
            println!("roster for {class_id}: {count} students");
        }
        Commands::Status => {
            println!("{}", pretty(&proxy.status().await?));
        }
        Commands::Notices => {
            println!("{}", pretty(&proxy.recent_notices().await?));
        }
    }

    Ok(())
}
