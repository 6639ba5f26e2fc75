//! PostgreSQL connection helpers and server settings discovery.

use crate::config::{DatabaseSettings, SslMode};
use postgres::{Client, NoTls};
use postgres_native_tls::MakeTlsConnector;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("TLS setup failed: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("{}", format_postgres_error(.0))]
    Postgres(#[from] postgres::Error),
}

/// libpq-style connection string. The password is only included when set.
pub fn connection_string(db: &DatabaseSettings) -> String {
    let mut conn = format!(
        "host={} port={} user={} dbname={} application_name={}",
        db.host,
        db.port,
        db.user,
        db.dbname,
        crate::PROCESS_NAME
    );
    if let Some(password) = &db.password {
        conn.push_str(&format!(" password={password}"));
    }
    conn
}

pub fn connect(db: &DatabaseSettings) -> Result<Client, DbError> {
    let conn = connection_string(db);
    let client = match db.sslmode {
        SslMode::Disable => Client::connect(&conn, NoTls)?,
        SslMode::Require => {
            let connector = native_tls::TlsConnector::builder().build()?;
            Client::connect(&conn, MakeTlsConnector::new(connector))?
        }
    };
    Ok(client)
}

/// Short, user-facing description of a driver error.
pub fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        return format!("{}: {}", db_error.severity(), db_error.message());
    }
    let msg = e.to_string();
    if msg.contains("Connection refused") {
        "connection refused".to_string()
    } else if msg.contains("password authentication failed") {
        "password authentication failed".to_string()
    } else if msg.contains("does not exist") {
        msg.rsplit("FATAL:").next().unwrap_or(&msg).trim().to_string()
    } else {
        msg
    }
}

/// `pg_current_logfile()`, relative to the data directory when not absolute.
pub fn current_logfile(client: &mut Client) -> Result<Option<String>, postgres::Error> {
    let row = client.query_one("SELECT pg_current_logfile('stderr')", &[])?;
    row.try_get(0)
}

/// Server settings the monitor derives its defaults from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub data_directory: PathBuf,
    pub log_directory: String,
    pub log_filename: String,
    pub log_line_prefix: String,
    pub server_version_num: i32,
}

const SETTINGS_QUERY: &str = "SELECT name, setting FROM pg_settings \
     WHERE name IN ('data_directory', 'log_directory', 'log_filename', \
     'log_line_prefix', 'server_version_num')";

impl ServerSettings {
    pub fn discover(client: &mut Client) -> Result<Self, postgres::Error> {
        let rows = client.query(SETTINGS_QUERY, &[])?;
        let pairs = rows
            .iter()
            .map(|row| Ok((row.try_get::<_, String>(0)?, row.try_get::<_, String>(1)?)))
            .collect::<Result<Vec<_>, postgres::Error>>()?;
        Ok(Self::from_pairs(pairs))
    }

    /// Builds settings from name/value pairs; missing names stay empty.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut settings = Self {
            data_directory: PathBuf::new(),
            log_directory: String::new(),
            log_filename: String::new(),
            log_line_prefix: String::new(),
            server_version_num: 0,
        };
        for (name, value) in pairs {
            match name.as_str() {
                "data_directory" => settings.data_directory = PathBuf::from(value),
                "log_directory" => settings.log_directory = value,
                "log_filename" => settings.log_filename = value,
                "log_line_prefix" => settings.log_line_prefix = value,
                "server_version_num" => settings.server_version_num = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        settings
    }

    /// `log_directory`, resolved against the data directory when relative.
    pub fn log_directory_path(&self) -> PathBuf {
        let dir = Path::new(&self.log_directory);
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.data_directory.join(dir)
        }
    }

    /// `pg_wal` since 10, `pg_xlog` before.
    pub fn wal_directory(&self) -> PathBuf {
        let name = if self.server_version_num >= 100_000 || self.server_version_num == 0 {
            "pg_wal"
        } else {
            "pg_xlog"
        };
        self.data_directory.join(name)
    }
}
