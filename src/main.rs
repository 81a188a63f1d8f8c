use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use turnstile_core::settings::{load_settings_from_path, settings_path};
use turnstile_core::{Position, Right, Settings, SystemClock, TurnId};
use turnstile_engine::{ActionDispatcher, Collaborators, LatestFix, Request, Runtime, RuntimeConfig};
use turnstile_store::{Database, SqliteStore};
use turnstile_telemetry::{
    init_telemetry, parse_level, LogQuery, SqliteLogSink, TelemetryConfig, TelemetryGuard,
};

#[derive(Parser)]
#[command(name = "turnstile", version, about = "Queue and time-slice a single remote-controlled car")]
struct Cli {
    /// Settings file. Defaults to ~/.turnstile/settings.json.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler, reading JSON actions from stdin.
    Serve,
    /// Manage user accounts.
    #[command(subcommand)]
    User(UserCommand),
    /// Print recorded GPS samples as JSON.
    Track {
        /// Turn id. Omit to query by time window.
        turn: Option<i64>,
        #[arg(long, requires = "to")]
        from: Option<DateTime<Utc>>,
        #[arg(long, requires = "from")]
        to: Option<DateTime<Utc>>,
    },
    /// Show persisted warnings and errors.
    Logs {
        #[arg(long)]
        level: Option<String>,
        #[arg(long)]
        session: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

#[derive(Subcommand)]
enum UserCommand {
    Add {
        user_id: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        nickname: Option<String>,
        #[arg(long)]
        admin: bool,
    },
    List,
    Nickname {
        user_id: String,
        nickname: String,
    },
}

/// One line of the stdin feed: a client action, or a GPS fix from the car.
#[derive(Deserialize)]
#[serde(untagged)]
enum Inbound {
    Fix { fix: Position },
    Action(Request),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(settings_path);
    let settings = load_settings_from_path(&path)
        .with_context(|| format!("loading settings from {}", path.display()))?;

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: parse_level(&settings.logging.level),
        json: settings.logging.json,
        log_to_sqlite: settings.logging.persist_warnings,
        log_db_path: PathBuf::from(&settings.logging.log_db_path),
        ..Default::default()
    });

    match cli.command {
        Command::Serve => serve(settings).await,
        Command::User(cmd) => user(&settings, cmd),
        Command::Track { turn, from, to } => track(&settings, turn, from, to),
        Command::Logs {
            level,
            session,
            limit,
        } => logs(&settings, &telemetry, level, session, limit),
    }
}

fn open_store(settings: &Settings) -> Result<SqliteStore> {
    let db = Database::open(Path::new(&settings.database_path))
        .with_context(|| format!("opening database {}", settings.database_path))?;
    Ok(SqliteStore::new(db))
}

async fn serve(settings: Settings) -> Result<()> {
    let store = Arc::new(open_store(&settings)?);
    store
        .drives()
        .close_dangling(Utc::now())
        .context("closing drives left open")?;

    let fix = Arc::new(LatestFix::new());
    let runtime = Runtime::start(
        RuntimeConfig::new(settings.drive, &settings.scheduler),
        Collaborators {
            turns: store.clone(),
            identities: store,
            positions: fix.clone(),
            clock: Arc::new(SystemClock::new()),
        },
    );
    let dispatcher = runtime.dispatcher();
    tracing::info!(database = %settings.database_path, "turnstile ready");

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = true;

    while input_open {
        tokio::select! {
            signal = &mut interrupt => {
                signal.context("listening for ctrl-c")?;
                break;
            }
            line = lines.next_line() => match line.context("reading stdin")? {
                Some(line) => handle_line(&dispatcher, &fix, &line).await,
                None => input_open = false,
            },
        }
    }
    if !input_open {
        tracing::info!("input closed, waiting for ctrl-c");
        interrupt.await.context("listening for ctrl-c")?;
    }

    tracing::info!("shutting down");
    runtime.shutdown().await;
    Ok(())
}

async fn handle_line(dispatcher: &ActionDispatcher, fix: &LatestFix, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let reply = match serde_json::from_str::<Inbound>(line) {
        Ok(Inbound::Fix { fix: position }) => {
            fix.update(position);
            return;
        }
        Ok(Inbound::Action(request)) => {
            let session_id = request.session_id.clone();
            match dispatcher.dispatch(request).await {
                Ok(outcome) => json!({ "sessionId": session_id, "ok": true, "result": outcome }),
                Err(e) => json!({
                    "sessionId": session_id,
                    "ok": false,
                    "error": {
                        "kind": e.scheduler_error().map_or("internal", |s| s.error_kind()),
                        "message": e.to_string(),
                    },
                }),
            }
        }
        Err(e) => json!({
            "ok": false,
            "error": { "kind": "bad_request", "message": e.to_string() },
        }),
    };
    println!("{reply}");
}

fn user(settings: &Settings, cmd: UserCommand) -> Result<()> {
    let store = open_store(settings)?;
    match cmd {
        UserCommand::Add {
            user_id,
            password,
            nickname,
            admin,
        } => {
            let right = if admin { Right::Admin } else { Right::User };
            let identity = store
                .users()
                .create(&user_id, nickname.as_deref(), &password, right)
                .with_context(|| format!("creating user {user_id}"))?;
            println!("{}", serde_json::to_string_pretty(&identity)?);
        }
        UserCommand::List => {
            let users = store.users().list()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "count": store.users().count()?,
                    "users": users,
                }))?
            );
        }
        UserCommand::Nickname { user_id, nickname } => {
            store.users().change_nickname(&user_id, &nickname)?;
            println!("{}", serde_json::to_string_pretty(&store.users().get(&user_id)?)?);
        }
    }
    Ok(())
}

fn track(
    settings: &Settings,
    turn: Option<i64>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Result<()> {
    let store = open_store(settings)?;
    let samples = match (turn, from, to) {
        (Some(turn), _, _) => store.telemetry().for_turn(TurnId::from_raw(turn))?,
        (None, Some(from), Some(to)) => store.telemetry().between(from, to)?,
        _ => bail!("pass a turn id or --from and --to"),
    };
    println!("{}", serde_json::to_string_pretty(&samples)?);
    Ok(())
}

fn logs(
    settings: &Settings,
    telemetry: &TelemetryGuard,
    level: Option<String>,
    session: Option<String>,
    limit: u32,
) -> Result<()> {
    let opened;
    let sink = match telemetry.logs() {
        Some(sink) => sink,
        None => {
            opened = SqliteLogSink::new(Path::new(&settings.logging.log_db_path))
                .context("opening log database")?;
            &opened
        }
    };
    let records = sink.query(&LogQuery {
        level,
        session_id: session,
        limit: Some(limit),
        ..Default::default()
    })?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}
