use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::TryRecvError};

use tally_session::auth::{AuthService, SessionContext, SessionEvent};
use tally_session::config::{self, Command, Config};
use tally_session::error::ApiError;
use tally_session::http_client::ApiClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(api_url = %config.api_url, "Tally session client starting");

    let session = SessionContext::create(
        &config.api_url,
        Some(config.session_db_file.as_path()),
        config.http_request_timeout,
    )?;
    let auth = AuthService::new(session.clone());

    if auth.bootstrap_from_storage() {
        tracing::debug!("Using stored session");
    }

    let mut events = session.subscribe();
    let outcome = run(command, &config, &auth, &session).await;

    // A rejected round queues its event before any caller resumes
    if let Some(reason) = forced_logout_reason(&mut events) {
        tracing::warn!(reason = %reason, "Session was revoked by the server");
        eprintln!("Your session has expired. Run `tally-session login` to sign in again.");
    }

    session.dispose();

    outcome
}

/// Drain queued session events, returning the forced-logout reason if any
fn forced_logout_reason(events: &mut broadcast::Receiver<SessionEvent>) -> Option<String> {
    loop {
        match events.try_recv() {
            Ok(SessionEvent::ForcedLogout { reason }) => return Some(reason),
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
        }
    }
}

async fn run(
    command: Command,
    config: &Config,
    auth: &AuthService,
    session: &Arc<SessionContext>,
) -> Result<()> {
    match command {
        Command::Login { email } => {
            let (email, password) = config::prompt_credentials(email)?;
            auth.login(&email, &password).await?;
            println!("✅ Signed in as {}", email);
        }

        Command::Logout => {
            auth.logout();
            println!("👋 Signed out");
        }

        Command::Status => match session.tokens().get() {
            Some(pair) => {
                println!("Signed in (token: {}...)", pair.access_token_hint());
                match pair.access_expires_at {
                    Some(exp) => println!("  Access token expires: {}", exp.to_rfc3339()),
                    None => println!("  Access token expiry unknown"),
                }
                println!("  Store: {}", config.session_db_file.display());
            }
            None => println!("Not signed in"),
        },

        Command::Refresh => {
            let pair = session
                .refresh_lock()
                .ensure_fresh()
                .await
                .map_err(ApiError::from)?;
            println!("✅ Token refreshed (token: {}...)", pair.access_token_hint());
        }

        Command::Get { path } => {
            let client = ApiClient::new(
                session.clone(),
                config.http_max_connections,
                config.http_connect_timeout,
                config.http_request_timeout,
                config.http_max_retries,
                config.token_refresh_threshold,
            )?;

            let body = client.get_json(&path).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }

    Ok(())
}
