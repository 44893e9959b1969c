//! Command line flags and `.env` loading.
//!
//! Every flag stands in for one environment variable and wins over it. A
//! `.env` file in the working directory is loaded first and overrides the
//! process environment.

use std::path::Path;

use clap::{ArgAction, Parser};

/// Loaded at startup when present in the working directory.
pub const DOTENV_PATH: &str = ".env";

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "sqld",
    version,
    about = "REST and raw SQL gateway over MySQL, PostgreSQL and SQLite",
    disable_help_flag = true
)]
pub struct Cli {
    /// Allow raw SQL queries [env: ALLOW_RAW]
    #[arg(
        long,
        alias = "allowRaw",
        num_args = 0..=1,
        default_missing_value = "true",
        value_name = "BOOL"
    )]
    pub raw: Option<bool>,

    /// Database source name [env: DSN]
    #[arg(long)]
    pub dsn: Option<String>,

    /// Database username [env: DB_USER]
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// Database password [env: DB_PASS]
    #[arg(short = 'p', long)]
    pub pass: Option<String>,

    /// Database host, with port [env: DB_HOST]
    #[arg(short = 'h', long)]
    pub host: Option<String>,

    /// mysql, postgres or sqlite3 [env: DB_TYPE]
    #[arg(long = "type", alias = "dbtype", value_name = "TYPE")]
    pub db_type: Option<String>,

    /// Database name [env: DB_NAME]
    #[arg(long = "db", alias = "dbname", value_name = "NAME")]
    pub db_name: Option<String>,

    /// HTTP port [env: PORT]
    #[arg(long)]
    pub port: Option<u16>,

    /// URL prefix [env: URL]
    #[arg(long)]
    pub url: Option<String>,

    /// SQLite snapshot file [env: SQLITE_BACKUP]
    #[arg(long, alias = "sqliteBackup", value_name = "PATH")]
    pub sqlite_backup: Option<String>,

    /// URL fetched by the HTTP self-check [env: HEALTH_CHECK_URL]
    #[arg(long, alias = "healthCheckUrl", value_name = "URL")]
    pub health_check_url: Option<String>,

    /// Minutes between self-checks, 0 disables them [env: HEALTH_CHECK_INTERVAL]
    #[arg(long, alias = "healthCheckInterval", value_name = "MINUTES")]
    pub health_check_interval: Option<u64>,

    /// Minutes between SQLite snapshots, 0 disables them [env: BACKUP_INTERVAL]
    #[arg(long, alias = "backupInterval", value_name = "MINUTES")]
    pub backup_interval: Option<u64>,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

impl Cli {
    /// The flag value standing in for environment variable `key`.
    pub fn value(&self, key: &str) -> Option<String> {
        match key {
            "ALLOW_RAW" => self.raw.map(|raw| raw.to_string()),
            "DSN" => self.dsn.clone(),
            "DB_USER" => self.user.clone(),
            "DB_PASS" => self.pass.clone(),
            "DB_HOST" => self.host.clone(),
            "DB_TYPE" => self.db_type.clone(),
            "DB_NAME" => self.db_name.clone(),
            "PORT" => self.port.map(|port| port.to_string()),
            "URL" => self.url.clone(),
            "SQLITE_BACKUP" => self.sqlite_backup.clone(),
            "HEALTH_CHECK_URL" => self.health_check_url.clone(),
            "HEALTH_CHECK_INTERVAL" => self.health_check_interval.map(|m| m.to_string()),
            "BACKUP_INTERVAL" => self.backup_interval.map(|m| m.to_string()),
            _ => None,
        }
    }
}

/// What happened to the `.env` file at startup.
#[derive(Debug)]
pub enum DotEnv {
    Loaded,
    Missing,
    Failed(dotenvy::Error),
}

/// Loads `path` into the process environment, replacing variables that are
/// already set.
pub fn load_dotenv(path: &Path) -> DotEnv {
    if !path.is_file() {
        return DotEnv::Missing;
    }
    match dotenvy::from_path_override(path) {
        Ok(()) => DotEnv::Loaded,
        Err(err) => DotEnv::Failed(err),
    }
}
