//! CLI argument definitions for the Lockbox binary.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use lockbox::ServiceNamespace;

/// Per-user encrypted SQLite storage
#[derive(Parser, Debug)]
#[command(name = "lockbox")]
#[command(about = "Lockbox: per-user encrypted SQLite databases")]
#[command(version)]
pub struct Cli {
    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create an account and print its first token
    Register(CredentialArgs),
    /// Log in, rotating the keyring key, and print a fresh token
    Login(CredentialArgs),
    /// Run SQL statements in one session on one of the user's databases
    Sql(SqlArgs),
    /// Repair databases and deletions left behind by a crash
    Recover(TokenArgs),
    /// Show the user's databases
    Info(TokenArgs),
}

/// Where the data lives and how tokens are signed
#[derive(clap::Args, Debug)]
pub struct StorageArgs {
    /// Root directory holding one directory per user
    #[arg(short = 'D', long, default_value = "lockbox-data", env = "LOCKBOX_DATA_DIR")]
    pub data_dir: PathBuf,

    /// User directories are mounted by an orchestrator instead of created here
    #[arg(long, env = "LOCKBOX_HOSTED")]
    pub hosted: bool,

    /// HMAC secret used to sign bearer tokens
    #[arg(long, env = "LOCKBOX_TOKEN_SECRET", hide_env_values = true)]
    pub token_secret: String,

    /// Seconds a database stays open after its last session
    #[arg(long, default_value_t = 30, env = "LOCKBOX_IDLE_GRACE")]
    pub idle_grace: u64,
}

impl StorageArgs {
    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.idle_grace)
    }
}

/// Arguments for commands that take a password
#[derive(clap::Args, Debug)]
pub struct CredentialArgs {
    #[command(flatten)]
    pub storage: StorageArgs,

    /// Account e-mail address
    #[arg(long, env = "LOCKBOX_EMAIL")]
    pub email: String,

    /// Account password
    #[arg(long, env = "LOCKBOX_SECRET", hide_env_values = true)]
    pub secret: String,
}

/// Arguments for commands that act on behalf of a logged-in user
#[derive(clap::Args, Debug)]
pub struct TokenArgs {
    #[command(flatten)]
    pub storage: StorageArgs,

    /// Bearer token printed by `register` or `login`
    #[arg(long, env = "LOCKBOX_TOKEN", hide_env_values = true)]
    pub token: String,
}

/// Arguments for the sql command
#[derive(clap::Args, Debug)]
pub struct SqlArgs {
    #[command(flatten)]
    pub auth: TokenArgs,

    /// Service owning the database
    #[arg(long, default_value = "settings")]
    pub service: ServiceNamespace,

    /// Database name below the service directory
    #[arg(long, default_value = "settings.db")]
    pub db: String,

    /// Statements to run in order; the session commits only if all succeed
    #[arg(required = true)]
    pub statements: Vec<String>,
}
