//! # rollcall
//!
//! Server binary: wires settings, logging, the enrollment store and the
//! notification server together, then serves until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use rollcall_core::enrollment::Role;
use rollcall_core::ids::{ClassId, UserId};
use rollcall_core::logging::{LogFormat, init_subscriber};
use rollcall_server::{JwtAuthority, RollcallServer, ServerConfig};
use rollcall_settings::RollcallSettings;
use rollcall_settings::loader::{apply_env_overrides, read_layers};
use rollcall_store::{Database, EnrollmentRepo, RosterRepo};

/// Real-time class enrollment notifications.
#[derive(Parser, Debug)]
#[command(name = "rollcall", about = "Real-time class enrollment notification server")]
struct Cli {
    /// Settings file (defaults to `$ROLLCALL_CONFIG` or `~/.rollcall/settings.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the `SQLite` database (`:memory:` for a throwaway store).
    #[arg(long, global = true)]
    db_path: Option<String>,

    /// HS256 secret shared with the auth service.
    #[arg(long, global = true)]
    jwt_secret: Option<String>,

    /// Log line format.
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP + WebSocket server (default).
    Serve {
        /// Host to bind.
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (0 for auto-assign).
        #[arg(long)]
        port: Option<u16>,

        /// Maximum concurrent WebSocket connections.
        #[arg(long)]
        max_connections: Option<usize>,
    },
    /// Record a teacher as owner of a class.
    GrantOwner {
        /// Class ID.
        #[arg(long)]
        class: String,
        /// Teacher user ID.
        #[arg(long)]
        teacher: String,
    },
    /// Print a short-lived token, for local testing.
    IssueToken {
        /// User ID.
        #[arg(long)]
        user: String,
        /// `student` or `teacher`.
        #[arg(long)]
        role: Role,
    },
}

impl Cli {
    /// Settings file layers, env overrides, then CLI flags, then validation.
    fn resolve_settings(&self) -> Result<RollcallSettings> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(rollcall_settings::settings_path);
        let mut settings = read_layers(&path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        apply_env_overrides(&mut settings);

        if let Some(ref db_path) = self.db_path {
            settings.store.db_path.clone_from(db_path);
        }
        if let Some(ref secret) = self.jwt_secret {
            settings.auth.jwt_secret.clone_from(secret);
        }
        if let Some(format) = self.log_format {
            settings.logging.format = format;
        }
        if let Some(Command::Serve {
            host,
            port,
            max_connections,
        }) = &self.command
        {
            if let Some(host) = host {
                settings.server.host.clone_from(host);
            }
            if let Some(port) = port {
                settings.server.port = *port;
            }
            if let Some(max) = max_connections {
                settings.server.max_connections = *max;
            }
        }

        settings.validate().context("Invalid settings")?;
        Ok(settings)
    }
}

fn ensure_parent_dir(db_path: &str) -> Result<()> {
    if db_path == ":memory:" {
        return Ok(());
    }
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
    }
    Ok(())
}

fn open_database(settings: &RollcallSettings) -> Result<Database> {
    ensure_parent_dir(&settings.store.db_path)?;
    Database::open_or_memory(&settings.store.db_path).context("Failed to open database")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.resolve_settings()?;
    init_subscriber(&settings.logging.level, settings.logging.format);

    match cli.command {
        None | Some(Command::Serve { .. }) => serve(&settings).await,
        Some(Command::GrantOwner { class, teacher }) => {
            let roster = RosterRepo::new(open_database(&settings)?);
            roster
                .add_owner(&ClassId::from(class.as_str()), &UserId::from(teacher.as_str()))
                .context("Failed to record class owner")?;
            tracing::info!(%class, %teacher, "class owner recorded");
            Ok(())
        }
        Some(Command::IssueToken { user, role }) => {
            let authority = JwtAuthority::new(&settings.auth.jwt_secret);
            let token = authority
                .issue(
                    &UserId::from(user.as_str()),
                    role,
                    Duration::from_secs(settings.auth.token_ttl_secs),
                )
                .context("Failed to sign token")?;
            println!("{token}");
            Ok(())
        }
    }
}

async fn serve(settings: &RollcallSettings) -> Result<()> {
    let db = open_database(settings)?;
    let roster = RosterRepo::new(db.clone());
    let repo = Arc::new(EnrollmentRepo::with_feed_capacity(
        db,
        settings.broker.feed_capacity,
    ));
    let authority = JwtAuthority::new(&settings.auth.jwt_secret);
    let metrics = rollcall_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let server = RollcallServer::new(
        ServerConfig::from(settings),
        repo,
        Arc::new(roster),
        Arc::new(authority),
        metrics,
    );
    let handle = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        addr = %handle.addr(),
        db_path = %settings.store.db_path,
        "rollcall listening on http://{}",
        handle.addr()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    handle.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
