use burrow_storage::deletion::DEFAULT_BATCH_SIZE;
use clap::{Parser, Subcommand, ValueEnum};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

pub const FILE_STORAGE_PATH_ENV: &str = "FILE_STORAGE_PATH";
pub const DATABASE_DSN_ENV: &str = "DATABASE_DSN";
pub const BASE_URL_ENV: &str = "BASE_URL";
pub const USER_ENV: &str = "BURROW_USER_ID";
pub const BATCH_SIZE_ENV: &str = "BURROW_DELETION_BATCH_SIZE";
pub const CONFIG_ENV: &str = "CONFIG";
pub const LOG_FORMAT_ENV: &str = "BURROW_LOG_FORMAT";

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/";
pub const DEFAULT_USER: &str = "anonymous";
pub const DEFAULT_DELETE_WAIT_MS: u64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[value(name = "text")]
    Text,
    #[value(name = "json")]
    Json,
}

impl Display for LogFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "burrow", about = "Shorten, resolve and delete URLs")]
pub struct CLI {
    /// Append-only journal used when no database is configured.
    #[arg(long, env = FILE_STORAGE_PATH_ENV, global = true)]
    pub file_storage_path: Option<PathBuf>,

    /// `postgres://` or `sqlite://` DSN. Takes precedence over the journal.
    #[arg(long, env = DATABASE_DSN_ENV, global = true)]
    pub database_dsn: Option<String>,

    /// Prefix for printed short URLs [default: http://localhost:8080/].
    #[arg(long, env = BASE_URL_ENV, global = true)]
    pub base_url: Option<String>,

    #[arg(long, env = USER_ENV, default_value = DEFAULT_USER, global = true)]
    pub user: String,

    #[arg(long, env = BATCH_SIZE_ENV, default_value_t = DEFAULT_BATCH_SIZE, global = true)]
    pub batch_size: usize,

    /// JSON file filling in options not given as flags or environment.
    #[arg(long = "config", env = CONFIG_ENV, global = true)]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        env = LOG_FORMAT_ENV,
        value_enum,
        default_value_t = LogFormat::Text,
        global = true
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Shorten one or more URLs.
    Shorten {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Print the URL behind a short code.
    Resolve { code: String },
    /// List the current user's live short URLs.
    List,
    /// Delete short codes owned by the current user.
    Delete {
        #[arg(required = true)]
        codes: Vec<String>,
        /// How long to wait for the deletions to be applied; 0 returns immediately.
        #[arg(long, value_name = "MS", default_value_t = DEFAULT_DELETE_WAIT_MS)]
        wait: u64,
    },
    /// Check that the database is reachable.
    Ping,
    /// Print URL and user counts.
    Stats,
}
