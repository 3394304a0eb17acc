use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Input, Password};
use std::path::PathBuf;

/// Tally session client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the Tally API
    #[arg(short = 'u', long, env = "TALLY_API_URL")]
    pub api_url: Option<String>,

    /// Path to the session SQLite database
    #[arg(short = 'd', long, env = "TALLY_SESSION_DB")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// HTTP max retries
    #[arg(long, env = "HTTP_MAX_RETRIES", default_value = "3")]
    pub http_retries: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Sign in and store the session
    Login {
        /// Account email (prompted when omitted)
        #[arg(short, long)]
        email: Option<String>,
    },

    /// Sign out and forget the stored session
    Logout,

    /// Show whether a session is stored
    Status,

    /// Force a token refresh
    Refresh,

    /// Authenticated GET against the API, printing the JSON body
    Get {
        /// Path relative to the API URL, e.g. /groups
        path: String,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // API
    pub api_url: String,

    // Session storage
    pub session_db_file: PathBuf,

    // Timeouts
    pub token_refresh_threshold: u64,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let command = args.command.clone();
        Ok((Self::from_args(args)?, command))
    }

    fn from_args(args: CliArgs) -> Result<Self> {
        let config = Config {
            api_url: args
                .api_url
                .context("TALLY_API_URL is required (use -u or set TALLY_API_URL env var)")?
                .trim_end_matches('/')
                .to_string(),

            session_db_file: args
                .db_file
                .map(|s| expand_tilde(&s))
                .or_else(default_db_path)
                .context("Could not determine a session database path (use -d)")?,

            token_refresh_threshold: env_or("TOKEN_REFRESH_THRESHOLD", 60),

            http_max_connections: env_or("HTTP_MAX_CONNECTIONS", 20),

            http_connect_timeout: env_or("HTTP_CONNECT_TIMEOUT", 10),

            http_request_timeout: args.http_timeout,

            http_max_retries: args.http_retries,

            log_level: args.log_level,
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            anyhow::bail!(
                "TALLY_API_URL must start with http:// or https://: {}",
                self.api_url
            );
        }

        Ok(())
    }
}

/// Read a numeric tunable from the environment, falling back to `default`
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Default session database under the user's data directory
fn default_db_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("tally").join("session.sqlite3"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Prompt for login credentials not given on the command line
pub fn prompt_credentials(email: Option<String>) -> Result<(String, String)> {
    let email = match email {
        Some(email) => email,
        None => Input::new()
            .with_prompt("Email")
            .interact_text()
            .context("Failed to read email")?,
    };

    let password = Password::new()
        .with_prompt("Password")
        .interact()
        .context("Failed to read password")?;

    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }

    Ok((email, password))
}
