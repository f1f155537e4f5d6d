//! Per-pair kline tables keyed by local wall-clock timestamp.

use std::path::Path;
use std::sync::Mutex;

use chrono::NaiveDateTime;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use thiserror::Error;
use tracing::info;

use crate::interval::Interval;

pub const MAX_QUERY_LIMIT: u32 = 1_000;
const WALL_CLOCK_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KlineRecord {
    /// Bucket open time as local wall clock.
    pub timestamp: NaiveDateTime,
    pub open_price: String,
    pub close_price: String,
    pub high_price: String,
    pub low_price: String,
    pub volume: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KlineQuery {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    pub limit: u32,
}

impl KlineQuery {
    pub fn latest(limit: u32) -> Self {
        Self {
            start: None,
            end: None,
            limit,
        }
    }
}

/// Maps a caller-supplied limit onto `1..=MAX_QUERY_LIMIT`; anything outside
/// that range means "as many as allowed".
pub fn clamp_limit(requested: i64) -> u32 {
    if requested <= 0 || requested > i64::from(MAX_QUERY_LIMIT) {
        MAX_QUERY_LIMIT
    } else {
        requested as u32
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid table name: {0}")]
    InvalidTableName(String),
    #[error("stored timestamp '{0}' is not a valid wall-clock value")]
    InvalidTimestamp(String),
}

pub trait KlineStore: Send + Sync {
    fn ensure_table(&self, symbol: &str, interval: Interval) -> Result<(), StoreError>;

    /// Insert-or-update keyed by `record.timestamp`; every other column is
    /// overwritten on conflict.
    fn upsert(&self, symbol: &str, interval: Interval, record: &KlineRecord)
        -> Result<(), StoreError>;

    /// Newest-first. A table that has never been created reads as empty.
    fn query(
        &self,
        symbol: &str,
        interval: Interval,
        query: &KlineQuery,
    ) -> Result<Vec<KlineRecord>, StoreError>;

    fn latest(&self, symbol: &str, interval: Interval) -> Result<Option<KlineRecord>, StoreError> {
        Ok(self
            .query(symbol, interval, &KlineQuery::latest(1))?
            .into_iter()
            .next())
    }
}

pub fn init_all_tables(
    store: &dyn KlineStore,
    symbols: &[String],
    intervals: &[Interval],
) -> Result<(), StoreError> {
    for symbol in symbols {
        for interval in intervals {
            store.ensure_table(symbol, *interval)?;
        }
    }
    info!(
        component = "store",
        event = "store.tables.ready",
        symbols = symbols.len(),
        intervals = intervals.len()
    );
    Ok(())
}

/// Deterministic lowercase `{symbol}_{interval}` table name.
pub fn table_name(symbol: &str, interval: Interval) -> Result<String, StoreError> {
    let name = format!(
        "{}_{}",
        symbol.trim().to_ascii_lowercase(),
        interval.as_str().to_ascii_lowercase()
    );
    let valid_chars = name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
    if symbol.trim().is_empty() || !valid_chars {
        return Err(StoreError::InvalidTableName(name));
    }
    Ok(name)
}

pub struct SqliteKlineStore {
    conn: Mutex<Connection>,
}

impl SqliteKlineStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self
            .conn
            .lock()
            .expect("sqlite connection lock should not be poisoned");
        f(&conn)
    }
}

impl KlineStore for SqliteKlineStore {
    fn ensure_table(&self, symbol: &str, interval: Interval) -> Result<(), StoreError> {
        let table = table_name(symbol, interval)?;
        self.with_conn(|conn| {
            conn.execute_batch(&format!(
                "
                CREATE TABLE IF NOT EXISTS \"{table}\" (
                    timestamp TEXT NOT NULL PRIMARY KEY,
                    open_price TEXT NOT NULL,
                    close_price TEXT NOT NULL,
                    high_price TEXT NOT NULL,
                    low_price TEXT NOT NULL,
                    volume TEXT NOT NULL,
                    note TEXT
                ) WITHOUT ROWID;
                "
            ))?;
            Ok(())
        })
    }

    fn upsert(
        &self,
        symbol: &str,
        interval: Interval,
        record: &KlineRecord,
    ) -> Result<(), StoreError> {
        let table = table_name(symbol, interval)?;
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "
                    INSERT INTO \"{table}\" (
                        timestamp,
                        open_price,
                        close_price,
                        high_price,
                        low_price,
                        volume,
                        note
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    ON CONFLICT(timestamp) DO UPDATE SET
                        open_price = excluded.open_price,
                        close_price = excluded.close_price,
                        high_price = excluded.high_price,
                        low_price = excluded.low_price,
                        volume = excluded.volume,
                        note = excluded.note
                    "
                ),
                params![
                    format_wall_clock(record.timestamp),
                    record.open_price,
                    record.close_price,
                    record.high_price,
                    record.low_price,
                    record.volume,
                    record.note,
                ],
            )?;
            Ok(())
        })
    }

    fn query(
        &self,
        symbol: &str,
        interval: Interval,
        query: &KlineQuery,
    ) -> Result<Vec<KlineRecord>, StoreError> {
        let table = table_name(symbol, interval)?;
        self.with_conn(|conn| {
            if !table_exists(conn, &table)? {
                return Ok(Vec::new());
            }

            let mut clauses = Vec::new();
            let mut bind = Vec::new();
            if let Some(start) = query.start {
                clauses.push("timestamp >= ?");
                bind.push(SqlValue::Text(format_wall_clock(start)));
            }
            if let Some(end) = query.end {
                clauses.push("timestamp <= ?");
                bind.push(SqlValue::Text(format_wall_clock(end)));
            }
            bind.push(SqlValue::Integer(i64::from(query.limit)));

            let where_sql = if clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clauses.join(" AND "))
            };
            let sql = format!(
                "
                SELECT timestamp, open_price, close_price, high_price, low_price, volume, note
                FROM \"{table}\"
                {where_sql}
                ORDER BY timestamp DESC
                LIMIT ?
                "
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(bind), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(ts, open, close, high, low, volume, note)| {
                    Ok(KlineRecord {
                        timestamp: parse_wall_clock(&ts)?,
                        open_price: open,
                        close_price: close,
                        high_price: high,
                        low_price: low,
                        volume,
                        note,
                    })
                })
                .collect()
        })
    }
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, StoreError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1 LIMIT 1",
            params![table],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    Ok(exists)
}

fn format_wall_clock(ts: NaiveDateTime) -> String {
    ts.format(WALL_CLOCK_FORMAT).to_string()
}

fn parse_wall_clock(raw: &str) -> Result<NaiveDateTime, StoreError> {
    NaiveDateTime::parse_from_str(raw, WALL_CLOCK_FORMAT)
        .map_err(|_| StoreError::InvalidTimestamp(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn record(hour: u32, close: &str) -> KlineRecord {
        KlineRecord {
            timestamp: at(hour),
            open_price: "7195.24000000".to_string(),
            close_price: close.to_string(),
            high_price: "7196.25000000".to_string(),
            low_price: "7175.46000000".to_string(),
            volume: "511.81416400".to_string(),
            note: None,
        }
    }

    fn seeded() -> SqliteKlineStore {
        let store = SqliteKlineStore::open_in_memory().unwrap();
        store.ensure_table("BTCUSDT", Interval::H1).unwrap();
        for hour in 0..5 {
            store
                .upsert("BTCUSDT", Interval::H1, &record(hour, &format!("{hour}.5")))
                .unwrap();
        }
        store
    }

    #[test]
    fn table_name_is_lowercase_symbol_and_interval() {
        assert_eq!(table_name("BTCUSDT", Interval::H4).unwrap(), "btcusdt_4h");
        assert!(matches!(
            table_name("BTC;DROP", Interval::H1),
            Err(StoreError::InvalidTableName(_))
        ));
        assert!(matches!(
            table_name("  ", Interval::H1),
            Err(StoreError::InvalidTableName(_))
        ));
    }

    #[test]
    fn ensure_table_is_idempotent() {
        let store = SqliteKlineStore::open_in_memory().unwrap();
        store.ensure_table("ETHUSDT", Interval::M5).unwrap();
        store.ensure_table("ETHUSDT", Interval::M5).unwrap();
        assert!(store
            .query("ETHUSDT", Interval::M5, &KlineQuery::latest(10))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn upsert_same_timestamp_keeps_one_row_with_latest_values() {
        let store = SqliteKlineStore::open_in_memory().unwrap();
        store.ensure_table("BTCUSDT", Interval::H1).unwrap();
        store
            .upsert("BTCUSDT", Interval::H1, &record(0, "7177.02000000"))
            .unwrap();
        let mut second = record(0, "7180.00000001");
        second.note = Some("revised".to_string());
        store.upsert("BTCUSDT", Interval::H1, &second).unwrap();

        let rows = store
            .query("BTCUSDT", Interval::H1, &KlineQuery::latest(10))
            .unwrap();
        assert_eq!(rows, vec![second]);
    }

    #[test]
    fn query_orders_newest_first_and_honors_limit() {
        let store = seeded();
        let rows = store
            .query("BTCUSDT", Interval::H1, &KlineQuery::latest(2))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp, at(4));
        assert_eq!(rows[1].timestamp, at(3));
        assert_eq!(
            store.latest("BTCUSDT", Interval::H1).unwrap().unwrap().close_price,
            "4.5"
        );
    }

    #[test]
    fn query_supports_all_range_combinations() {
        let store = seeded();
        let run = |start, end| {
            store
                .query(
                    "BTCUSDT",
                    Interval::H1,
                    &KlineQuery {
                        start,
                        end,
                        limit: 100,
                    },
                )
                .unwrap()
                .into_iter()
                .map(|r| r.timestamp)
                .collect::<Vec<_>>()
        };

        assert_eq!(run(None, None).len(), 5);
        assert_eq!(run(Some(at(3)), None), vec![at(4), at(3)]);
        assert_eq!(run(None, Some(at(1))), vec![at(1), at(0)]);
        assert_eq!(run(Some(at(1)), Some(at(2))), vec![at(2), at(1)]);
    }

    #[test]
    fn missing_table_reads_as_empty() {
        let store = SqliteKlineStore::open_in_memory().unwrap();
        assert!(store.latest("SOLUSDT", Interval::H4).unwrap().is_none());
    }

    #[test]
    fn clamp_limit_maps_out_of_range_to_max() {
        assert_eq!(clamp_limit(0), 1_000);
        assert_eq!(clamp_limit(-5), 1_000);
        assert_eq!(clamp_limit(5_000), 1_000);
        assert_eq!(clamp_limit(250), 250);
    }

    #[test]
    fn on_disk_store_persists_across_reopen() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested/klines.sqlite");
        {
            let store = SqliteKlineStore::open(&path).unwrap();
            init_all_tables(
                &store,
                &["BTCUSDT".to_string(), "ETHUSDT".to_string()],
                &[Interval::M5, Interval::H1],
            )
            .unwrap();
            store
                .upsert("ETHUSDT", Interval::M5, &record(2, "1.0"))
                .unwrap();
        }

        let reopened = SqliteKlineStore::open(&path).unwrap();
        let latest = reopened.latest("ETHUSDT", Interval::M5).unwrap().unwrap();
        assert_eq!(latest.timestamp, at(2));
    }
}
