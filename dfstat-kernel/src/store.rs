/**
 * MEASUREMENT STORE - append-only SQLite time series
 *
 * ROLE : durable record of every poll outcome (measurement or failure),
 * bounded recent-window reads for trend analysis, retention pruning and
 * the persisted target list.
 *
 * Single writer: the connection sits behind one mutex and the collector
 * applies results sequentially. Every error here is a StorageError and
 * ends the daemon.
 */

use crate::error::StorageError;
use crate::models::{FailureRecord, Measurement, Targets};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS df_stat (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    host           TEXT    NOT NULL,
    partition      TEXT,
    partition_size INTEGER,
    used           INTEGER,
    available      INTEGER,
    error_code     INTEGER NOT NULL DEFAULT 0,
    measured_at    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_df_stat_series ON df_stat(host, partition, measured_at);
CREATE INDEX IF NOT EXISTS idx_df_stat_time ON df_stat(measured_at);

CREATE TABLE IF NOT EXISTS targets (
    host      TEXT NOT NULL,
    partition TEXT NOT NULL,
    PRIMARY KEY (host, partition)
);
";

struct Inner {
    conn: Connection,
    /// Last timestamp handed out by `next_stamp`, in microseconds.
    last_stamp: i64,
}

pub struct MeasurementStore {
    inner: Mutex<Inner>,
}

fn to_micros(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000) as i64
}

fn from_micros(micros: i64) -> Result<OffsetDateTime, StorageError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
        .map_err(|e| StorageError::Corrupt(format!("measured_at {micros}: {e}")))
}

fn to_column(column: &str, value: u64) -> Result<i64, StorageError> {
    i64::try_from(value).map_err(|_| StorageError::Corrupt(format!("{column} = {value} out of range")))
}

fn to_kb(column: &str, value: i64) -> Result<u64, StorageError> {
    u64::try_from(value).map_err(|_| StorageError::Corrupt(format!("{column} = {value}")))
}

impl MeasurementStore {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self::with_connection(conn)?;
        info!(path = %path.display(), "measurement store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        let last_stamp: Option<i64> =
            conn.query_row("SELECT MAX(measured_at) FROM df_stat", [], |row| row.get(0))?;
        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                last_stamp: last_stamp.unwrap_or(0),
            }),
        })
    }

    /// Wall-clock timestamp, bumped so it is strictly later than any row written before.
    fn next_stamp(inner: &mut Inner) -> i64 {
        let stamp = to_micros(OffsetDateTime::now_utc()).max(inner.last_stamp + 1);
        inner.last_stamp = stamp;
        stamp
    }

    /// Append a successful measurement stamped now.
    pub fn record(
        &self,
        host: &str,
        partition: &str,
        size: u64,
        used: u64,
        available: u64,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let stamp = Self::next_stamp(&mut inner);
        Self::insert(&inner.conn, host, partition, size, used, available, stamp)
    }

    /// Append a successful measurement with an explicit timestamp.
    #[cfg(test)]
    pub fn record_at(
        &self,
        host: &str,
        partition: &str,
        size: u64,
        used: u64,
        available: u64,
        at: OffsetDateTime,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let stamp = to_micros(at);
        inner.last_stamp = inner.last_stamp.max(stamp);
        Self::insert(&inner.conn, host, partition, size, used, available, stamp)
    }

    fn insert(
        conn: &Connection,
        host: &str,
        partition: &str,
        size: u64,
        used: u64,
        available: u64,
        stamp: i64,
    ) -> Result<(), StorageError> {
        conn.execute(
            "INSERT INTO df_stat (host, partition, partition_size, used, available, error_code, measured_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![
                host,
                partition,
                to_column("partition_size", size)?,
                to_column("used", used)?,
                to_column("available", available)?,
                stamp
            ],
        )?;
        Ok(())
    }

    /// Append a failure row for the host; usage columns stay NULL.
    pub fn record_error(&self, host: &str, code: i32) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let stamp = Self::next_stamp(&mut inner);
        inner.conn.execute(
            "INSERT INTO df_stat (host, error_code, measured_at) VALUES (?1, ?2, ?3)",
            params![host, code, stamp],
        )?;
        Ok(())
    }

    /// Last `n` successful measurements for the pair, oldest first.
    pub fn recent(&self, host: &str, partition: &str, n: usize) -> Result<Vec<Measurement>, StorageError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let inner = self.inner.lock();
        let mut stmt = inner.conn.prepare(
            "SELECT partition_size, used, available, measured_at
             FROM df_stat
             WHERE host = ?1 AND partition = ?2 AND error_code = 0
             ORDER BY measured_at DESC, id DESC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![host, partition, n as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (size, used, available, stamp) in rows.into_iter().rev() {
            out.push(Measurement {
                host: host.to_string(),
                partition: partition.to_string(),
                partition_size: to_kb("partition_size", size)?,
                used: to_kb("used", used)?,
                available: to_kb("available", available)?,
                error_code: 0,
                measured_at: from_micros(stamp)?,
            });
        }
        Ok(out)
    }

    /// Last `n` failure rows for a host, newest first.
    pub fn recent_errors(&self, host: &str, n: usize) -> Result<Vec<FailureRecord>, StorageError> {
        let inner = self.inner.lock();
        let mut stmt = inner.conn.prepare(
            "SELECT error_code, measured_at FROM df_stat
             WHERE host = ?1 AND error_code != 0
             ORDER BY measured_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![host, n as i64], |row| {
                Ok((row.get::<_, i32>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(error_code, stamp)| {
                Ok(FailureRecord {
                    host: host.to_string(),
                    error_code,
                    measured_at: from_micros(stamp)?,
                })
            })
            .collect()
    }

    /// Delete rows older than `retention_horizon`, keeping the newest
    /// `window_floor` successful rows of every configured pair.
    pub fn prune(&self, retention_horizon: std::time::Duration, window_floor: usize) -> Result<usize, StorageError> {
        let cutoff = time::Duration::try_from(retention_horizon)
            .ok()
            .and_then(|horizon| OffsetDateTime::now_utc().checked_sub(horizon));
        match cutoff {
            Some(cutoff) => self.prune_before(cutoff, window_floor),
            None => {
                warn!(?retention_horizon, "retention reaches before the representable range, nothing pruned");
                Ok(0)
            }
        }
    }

    pub fn prune_before(&self, cutoff: OffsetDateTime, window_floor: usize) -> Result<usize, StorageError> {
        let inner = self.inner.lock();
        let deleted = inner.conn.execute(
            "DELETE FROM df_stat
             WHERE measured_at < ?1
               AND id NOT IN (
                   SELECT id FROM (
                       SELECT d.id AS id,
                              ROW_NUMBER() OVER (
                                  PARTITION BY d.host, d.partition
                                  ORDER BY d.measured_at DESC, d.id DESC
                              ) AS rn
                       FROM df_stat d
                       JOIN targets t ON t.host = d.host AND t.partition = d.partition
                       WHERE d.error_code = 0
                   )
                   WHERE rn <= ?2
               )",
            params![to_micros(cutoff), window_floor as i64],
        )?;
        if deleted > 0 {
            debug!(deleted, "pruned measurements");
        }
        Ok(deleted)
    }

    /// Replace the persisted target list in one transaction.
    pub fn sync_targets(&self, targets: &Targets) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let tx = inner.conn.transaction()?;
        tx.execute("DELETE FROM targets", [])?;
        {
            let mut insert = tx.prepare("INSERT INTO targets (host, partition) VALUES (?1, ?2)")?;
            for (host, partitions) in targets {
                for partition in partitions {
                    insert.execute(params![host, partition])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn targets(&self) -> Result<Targets, StorageError> {
        let inner = self.inner.lock();
        let mut stmt = inner
            .conn
            .prepare("SELECT host, partition FROM targets ORDER BY host, partition")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut targets = Targets::new();
        for row in rows {
            let (host, partition) = row?;
            targets.entry(host).or_default().insert(partition);
        }
        Ok(targets)
    }

    #[cfg(test)]
    pub fn row_count(&self) -> Result<usize, StorageError> {
        let inner = self.inner.lock();
        let count: i64 = inner.conn.query_row("SELECT COUNT(*) FROM df_stat", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Flush the WAL into the main file before the process exits.
    pub fn close(&self) -> Result<(), StorageError> {
        let inner = self.inner.lock();
        inner.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        info!("measurement store checkpointed");
        Ok(())
    }
}
