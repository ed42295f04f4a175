//! Durable Parquet landing zone for websocket/event batches (§6.3). Grounded
//! line-for-line on original_source's `tradingbot_storage/parquet_sink.py`
//! (`ParquetConfig`, `ParquetSink`): same schema, same daily-partitioned
//! directory layout, same serialized-write discipline, expressed with the
//! `arrow`/`parquet` crates instead of `pyarrow`.

use arrow::array::{StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use parquet::arrow::ArrowWriter;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub struct ParquetConfig {
    pub base_dir: PathBuf,
}

impl ParquetConfig {
    pub fn from_env() -> Self {
        let base = std::env::var("PARQUET_DIR").unwrap_or_else(|_| "/srv/trading/storage/parquet".to_string());
        Self { base_dir: PathBuf::from(base) }
    }
}

fn schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("ingested_at", DataType::Timestamp(TimeUnit::Microsecond, None), false),
        Field::new("event", DataType::Utf8, false),
        Field::new("market", DataType::Utf8, false),
        Field::new("payload", DataType::Utf8, false),
    ]))
}

/// Append-only Parquet writer for websocket/book/signal event batches.
/// Writes are serialized through an internal mutex since multiple async
/// tasks within one process may flush batches concurrently.
pub struct ParquetSink {
    config: ParquetConfig,
    schema: Arc<Schema>,
    lock: Mutex<()>,
}

impl ParquetSink {
    pub fn new(config: ParquetConfig) -> Self {
        Self {
            config,
            schema: schema(),
            lock: Mutex::new(()),
        }
    }

    fn daily_dir(&self, event: &str) -> std::io::Result<PathBuf> {
        let day = Utc::now().format("%Y-%m-%d").to_string();
        let target = self.config.base_dir.join(day).join(event);
        std::fs::create_dir_all(&target)?;
        Ok(target)
    }

    fn filename(market: &str) -> String {
        let safe_market = if market.is_empty() {
            "unknown".to_string()
        } else {
            market.replace('/', "-")
        };
        let ts = Utc::now().format("%H%M%S").to_string();
        let token = &Uuid::new_v4().simple().to_string()[..10];
        format!("{}-{}-{}.parquet", safe_market, ts, token)
    }

    /// Writes one batch of already-serialized JSON payload rows. A no-op on
    /// an empty batch, matching the original's early return.
    pub fn write(&self, event: &str, market: &str, payload_rows: &[String]) -> std::io::Result<()> {
        if payload_rows.is_empty() {
            return Ok(());
        }

        let now_us = Utc::now().timestamp_micros();
        let n = payload_rows.len();
        let ingested_at = TimestampMicrosecondArray::from(vec![now_us; n]);
        let event_col = StringArray::from(vec![event; n]);
        let market_col = StringArray::from(vec![market; n]);
        let payload_col = StringArray::from(payload_rows.iter().map(String::as_str).collect::<Vec<_>>());

        let batch = RecordBatch::try_new(
            self.schema.clone(),
            vec![Arc::new(ingested_at), Arc::new(event_col), Arc::new(market_col), Arc::new(payload_col)],
        )
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let directory = self.daily_dir(event)?;
        let file_path: PathBuf = directory.join(Self::filename(market));

        let _guard = self.lock.lock().expect("parquet sink mutex poisoned");
        self.write_batch(&file_path, &batch)
    }

    /// Appends the same batch to a human-inspectable `.jsonl` file alongside
    /// the Parquet output, mirroring the original's parallel `append_jsonl`
    /// fallback for manual replay.
    pub fn write_jsonl_companion(&self, event: &str, market: &str, payload_rows: &[String]) -> std::io::Result<()> {
        if payload_rows.is_empty() {
            return Ok(());
        }
        let directory = self.daily_dir(event)?;
        let path = directory.join(format!("{}.jsonl", if market.is_empty() { "unknown" } else { market }));
        let _guard = self.lock.lock().expect("parquet sink mutex poisoned");
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        for row in payload_rows {
            writeln!(file, "{}", row)?;
        }
        Ok(())
    }

    fn write_batch(&self, file_path: &Path, batch: &RecordBatch) -> std::io::Result<()> {
        let file = File::create(file_path)?;
        let mut writer = ArrowWriter::try_new(file, self.schema.clone(), None)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writer.write(batch).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writer.close().map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_creates_a_daily_partitioned_parquet_file() {
        let dir = std::env::temp_dir().join(format!("parquet-sink-test-{}", Uuid::new_v4()));
        let sink = ParquetSink::new(ParquetConfig { base_dir: dir.clone() });

        sink.write("book", "BTC-EUR", &["{\"a\":1}".to_string()]).unwrap();

        let day = Utc::now().format("%Y-%m-%d").to_string();
        let event_dir = dir.join(day).join("book");
        let entries: Vec<_> = std::fs::read_dir(&event_dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].as_ref().unwrap().file_name().into_string().unwrap();
        assert!(name.starts_with("BTC-EUR-"));
        assert!(name.ends_with(".parquet"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn write_is_a_no_op_on_an_empty_batch() {
        let dir = std::env::temp_dir().join(format!("parquet-sink-test-{}", Uuid::new_v4()));
        let sink = ParquetSink::new(ParquetConfig { base_dir: dir.clone() });
        sink.write("book", "BTC-EUR", &[]).unwrap();
        assert!(!dir.exists());
    }
}
