use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use convoy_core::ids::UserId;
use convoy_core::model::{Principal, Role};
use convoy_server::{JwtVerifier, ServerConfig};
use convoy_store::directory::DirectoryRepo;
use convoy_store::{Database, SqliteChatStore};
use convoy_telemetry::{init_telemetry, LogQuery, SqliteLogSink, TelemetryConfig};

#[derive(Parser)]
#[command(name = "convoy", about = "Real-time conversations between renters and hosts")]
struct Cli {
    /// SQLite database file.
    #[arg(long, env = "CONVOY_DB", global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the chat server.
    Serve {
        #[arg(long, env = "CONVOY_HOST", default_value = "127.0.0.1")]
        host: String,
        #[arg(long, env = "CONVOY_PORT", default_value_t = 9091)]
        port: u16,
        #[arg(long, env = "CONVOY_JWT_SECRET")]
        jwt_secret: String,
        #[arg(long, env = "CONVOY_HEARTBEAT_SECS", default_value_t = 30)]
        heartbeat_secs: u64,
        #[arg(long, env = "CONVOY_LOG_LEVEL", default_value = "info")]
        log_level: tracing::Level,
        /// Human-readable logs instead of JSON lines.
        #[arg(long)]
        pretty: bool,
        /// Persist warn+ logs to this SQLite file.
        #[arg(long, env = "CONVOY_LOG_DB")]
        log_db: Option<PathBuf>,
    },
    /// Print a signed credential for a user.
    IssueToken {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        email: String,
        #[arg(long, default_value = "renter")]
        role: Role,
        #[arg(long, default_value_t = 3600)]
        ttl_secs: u64,
        #[arg(long, env = "CONVOY_JWT_SECRET")]
        jwt_secret: String,
    },
    /// Create demo users, a vehicle and a booking.
    Seed,
    /// Print persisted warn+ log records as JSON lines, newest first.
    Logs {
        #[arg(long, env = "CONVOY_LOG_DB")]
        log_db: Option<PathBuf>,
        #[arg(long)]
        level: Option<tracing::Level>,
        #[arg(long)]
        user_id: Option<i64>,
        #[arg(long)]
        conversation_id: Option<i64>,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(default_db_path);

    match cli.command {
        Command::Serve {
            host,
            port,
            jwt_secret,
            heartbeat_secs,
            log_level,
            pretty,
            log_db,
        } => {
            let _telemetry = init_telemetry(TelemetryConfig {
                log_level,
                json: !pretty,
                log_to_sqlite: log_db.is_some(),
                log_db_path: log_db.unwrap_or_else(|| TelemetryConfig::default().log_db_path),
                ..Default::default()
            });
            let config = ServerConfig {
                host,
                port,
                heartbeat_interval_secs: heartbeat_secs,
                ..Default::default()
            };
            serve(config, &db_path, jwt_secret.as_bytes()).await
        }
        Command::IssueToken {
            user_id,
            email,
            role,
            ttl_secs,
            jwt_secret,
        } => {
            let principal = Principal {
                user_id: UserId(user_id),
                email,
                role,
            };
            let token = JwtVerifier::new(jwt_secret.as_bytes())
                .issue(&principal, Duration::from_secs(ttl_secs))
                .context("failed to sign credential")?;
            println!("{token}");
            Ok(())
        }
        Command::Seed => seed(&db_path),
        Command::Logs {
            log_db,
            level,
            user_id,
            conversation_id,
            limit,
        } => {
            let query = log_query(level, user_id, conversation_id, limit);
            print_logs(&log_db.unwrap_or_else(|| TelemetryConfig::default().log_db_path), &query)
        }
    }
}

async fn serve(config: ServerConfig, db_path: &Path, secret: &[u8]) -> anyhow::Result<()> {
    let db = open_db(db_path)?;
    tracing::info!(path = %db_path.display(), "Database opened");

    let handle = convoy_server::start(config, Arc::new(SqliteChatStore::new(db)), Arc::new(JwtVerifier::new(secret)))
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "Convoy server ready");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl+c")?;
    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}

fn seed(db_path: &Path) -> anyhow::Result<()> {
    let dir = DirectoryRepo::new(open_db(db_path)?);
    let renter = dir.create_user("Ana Renter", "ana@example.com", Role::Renter)?;
    let host = dir.create_user("Ben Host", "ben@example.com", Role::Host)?;
    let vehicle = dir.create_vehicle(host.id, "Toyota", "Corolla", 2021)?;
    let booking = dir.create_booking(vehicle.id, renter.id)?;
    println!(
        "renter={} host={} vehicle={} booking={}",
        renter.id, host.id, vehicle.id, booking.id
    );
    Ok(())
}

/// Filters match what the SQLite layer stores: level names as `WARN`/`ERROR`
/// and correlation ids as decimal text.
fn log_query(level: Option<tracing::Level>, user_id: Option<i64>, conversation_id: Option<i64>, limit: u32) -> LogQuery {
    LogQuery {
        level: level.map(|l| l.to_string()),
        user_id: user_id.map(|id| id.to_string()),
        conversation_id: conversation_id.map(|id| id.to_string()),
        limit: Some(limit),
    }
}

fn print_logs(path: &Path, query: &LogQuery) -> anyhow::Result<()> {
    let sink = SqliteLogSink::new(path).with_context(|| format!("failed to open log database at {}", path.display()))?;
    for record in sink.query(query).context("failed to query logs")? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

fn open_db(path: &Path) -> anyhow::Result<Database> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Database::open(path).with_context(|| format!("failed to open database at {}", path.display()))
}

fn default_db_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".convoy")
        .join("convoy.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_filters_map_to_stored_columns() {
        let cli = Cli::try_parse_from(["convoy", "logs", "--level", "warn", "--user-id", "1", "--limit", "5"]).unwrap();
        let Command::Logs {
            level,
            user_id,
            conversation_id,
            limit,
            ..
        } = cli.command
        else {
            panic!("expected logs subcommand");
        };

        let query = log_query(level, user_id, conversation_id, limit);
        assert_eq!(query.level.as_deref(), Some("WARN"));
        assert_eq!(query.user_id.as_deref(), Some("1"));
        assert_eq!(query.conversation_id, None);
        assert_eq!(query.limit, Some(5));
    }
}
