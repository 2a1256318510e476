use std::{
    net::{IpAddr, SocketAddr},
    path::Path,
};

use chrono::NaiveDateTime;
use color_eyre::eyre::{eyre, Context};
use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    ConnectOptions, Row, SqlitePool,
};
use tracing::warn;

use crate::config::DatabaseConfig;

const CSV_HEADER: [&str; 4] = ["date", "address", "username", "password"];
const CSV_DATE_FORMAT: &str = "%Y/%m/%d %H:%M:%S";
const SQL_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One aggregated dashboard value.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Datapoint {
    pub name: String,
    pub count: i64,
}

/// SQLite-backed store for failed SSH login attempts. This is the
/// brute-force recorder's datastore; the tunnel dispatcher itself never
/// depends on it being present.
pub struct StatsDb {
    pool: SqlitePool,
}

impl StatsDb {
    pub async fn connect(config: &DatabaseConfig) -> color_eyre::Result<Self> {
        let mut options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true);
        options = options.log_statements(if config.debug {
            log::LevelFilter::Info
        } else {
            log::LevelFilter::Off
        });
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| "Error connecting to statistics database")?;
        let db = StatsDb { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> color_eyre::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS auth_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                username TEXT NOT NULL,
                password TEXT NOT NULL,
                remote_address TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .with_context(|| "Error migrating auth_attempts")?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS remote_addresses (
                address TEXT PRIMARY KEY,
                attempts INTEGER NOT NULL DEFAULT 0,
                city TEXT NOT NULL DEFAULT '',
                country TEXT NOT NULL DEFAULT ''
            )",
        )
        .execute(&self.pool)
        .await
        .with_context(|| "Error migrating remote_addresses")?;
        Ok(())
    }

    pub async fn register_auth_attempt(
        &self,
        username: &str,
        password: &str,
        remote_address: &str,
    ) -> color_eyre::Result<()> {
        self.insert_attempt(
            username,
            password,
            remote_address,
            chrono::Utc::now().naive_utc(),
        )
        .await
    }

    async fn insert_attempt(
        &self,
        username: &str,
        password: &str,
        remote_address: &str,
        created_at: NaiveDateTime,
    ) -> color_eyre::Result<()> {
        sqlx::query(
            "INSERT INTO auth_attempts (created_at, username, password, remote_address)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(created_at.format(SQL_DATE_FORMAT).to_string())
        .bind(username)
        .bind(password)
        .bind(remote_address)
        .execute(&self.pool)
        .await
        .with_context(|| "Error inserting auth attempt")?;
        sqlx::query(
            "INSERT INTO remote_addresses (address, attempts) VALUES (?1, 1)
             ON CONFLICT(address) DO UPDATE SET attempts = attempts + 1",
        )
        .bind(remote_address)
        .execute(&self.pool)
        .await
        .with_context(|| "Error upserting remote address")?;
        Ok(())
    }

    pub async fn top_countries(&self, top: i64) -> color_eyre::Result<Vec<Datapoint>> {
        self.datapoints(
            "SELECT country AS name, COUNT(*) AS count FROM remote_addresses
             GROUP BY name ORDER BY count DESC LIMIT ?1",
            top,
        )
        .await
    }

    pub async fn top_users(&self, top: i64) -> color_eyre::Result<Vec<Datapoint>> {
        self.datapoints(
            "SELECT username AS name, COUNT(*) AS count FROM auth_attempts
             GROUP BY name ORDER BY count DESC LIMIT ?1",
            top,
        )
        .await
    }

    pub async fn top_passwords(&self, top: i64) -> color_eyre::Result<Vec<Datapoint>> {
        self.datapoints(
            "SELECT password AS name, COUNT(*) AS count FROM auth_attempts
             GROUP BY name ORDER BY count DESC LIMIT ?1",
            top,
        )
        .await
    }

    pub async fn attempts_by_day(&self, days: i64) -> color_eyre::Result<Vec<Datapoint>> {
        let rows = sqlx::query(
            "SELECT date(created_at) AS name, COUNT(*) AS count FROM auth_attempts
             WHERE created_at > date('now', ?1) GROUP BY name ORDER BY name ASC",
        )
        .bind(format!("-{days} day"))
        .fetch_all(&self.pool)
        .await
        .with_context(|| "Error querying attempts by day")?;
        Ok(rows
            .into_iter()
            .map(|row| Datapoint {
                name: row.get("name"),
                count: row.get("count"),
            })
            .collect())
    }

    async fn datapoints(&self, query: &str, top: i64) -> color_eyre::Result<Vec<Datapoint>> {
        let rows = sqlx::query(query)
            .bind(top)
            .fetch_all(&self.pool)
            .await
            .with_context(|| "Error querying statistics")?;
        Ok(rows
            .into_iter()
            .map(|row| Datapoint {
                name: row.get("name"),
                count: row.get("count"),
            })
            .collect())
    }

    /// Loads `(date, address, username, password)` rows. Files with any
    /// other header are rejected. Returns the number of imported rows.
    pub async fn import_from_csv(&self, path: &Path) -> color_eyre::Result<usize> {
        let mut reader =
            csv::Reader::from_path(path).with_context(|| "failed to read csv file")?;
        {
            let headers: Vec<&str> = reader.headers()?.iter().collect();
            if headers != CSV_HEADER {
                return Err(eyre!("invalid csv file format"));
            }
        }
        let mut imported = 0usize;
        for record in reader.records() {
            let record = record.with_context(|| "failed to read csv row")?;
            let (Some(date), Some(address), Some(username), Some(password)) =
                (record.get(0), record.get(1), record.get(2), record.get(3))
            else {
                return Err(eyre!("invalid csv file format"));
            };
            let created_at = NaiveDateTime::parse_from_str(date, CSV_DATE_FORMAT)
                .with_context(|| format!("failed to parse date {date}"))?;
            // Addresses may come with or without a port.
            let ip = match address.parse::<SocketAddr>() {
                Ok(socket_addr) => socket_addr.ip(),
                Err(_) => match address.parse::<IpAddr>() {
                    Ok(ip) => ip,
                    Err(error) => {
                        warn!(%address, %error, "Skipping row with unparsable address.");
                        continue;
                    }
                },
            };
            self.insert_attempt(username, password, &ip.to_string(), created_at)
                .await?;
            imported += 1;
        }
        Ok(imported)
    }
}
