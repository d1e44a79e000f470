//! Append-only CSV log of processed frames.

use anyhow::{Context, Result};
use scout_proto::wire::{ObstacleRow, NONE_SENTINEL};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

pub const HEADER: [&str; 7] = ["frame_id", "lat", "lon", "objects", "original_img", "predicted_img", "volumes"];
/// Separator between obstacle summaries in the `volumes` column.
pub const VOLUME_SEPARATOR: &str = " | ";

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub frame_id: String,
    /// Kept verbatim as received.
    pub lat: String,
    pub lon: String,
    pub objects: Vec<String>,
    pub original_img: String,
    pub predicted_img: String,
    pub volumes: Vec<String>,
}

impl LogRecord {
    fn fields(&self) -> [String; 7] {
        let joined = |v: &[String], sep: &str| if v.is_empty() { NONE_SENTINEL.to_string() } else { v.join(sep) };
        [
            self.frame_id.clone(),
            self.lat.clone(),
            self.lon.clone(),
            joined(&self.objects, ", "),
            self.original_img.clone(),
            self.predicted_img.clone(),
            joined(&self.volumes, VOLUME_SEPARATOR),
        ]
    }
}

#[derive(Debug, Error)]
pub enum LogRowError {
    #[error("line {line}: {source}")]
    Csv {
        line: u64,
        #[source]
        source: csv::Error,
    },
    #[error("line {line}: missing column {column}")]
    MissingColumn { line: u64, column: &'static str },
    #[error("line {line}: bad coordinate {value:?}")]
    BadCoordinate { line: u64, value: String },
}

#[derive(Debug, Default)]
pub struct LogPage {
    pub records: Vec<ObstacleRow>,
    /// Malformed rows passed over before the page filled up.
    pub skipped: usize,
}

pub struct ResultLog {
    path: PathBuf,
    // one writer at a time; readers take it too so they never see half a row
    lock: Mutex<()>,
}

impl ResultLog {
    /// Creates the file with its header when absent or empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        let empty = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        if empty {
            let mut w = csv::Writer::from_path(&path).with_context(|| format!("create log {}", path.display()))?;
            w.write_record(HEADER)?;
            w.flush()?;
        }
        Ok(Self { path, lock: Mutex::new(()) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one row with a single write so concurrent appends never interleave.
    pub fn append(&self, rec: &LogRecord) -> Result<()> {
        let mut w = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
        w.write_record(rec.fields())?;
        let row = w.into_inner().map_err(|e| anyhow::anyhow!("encode log row: {}", e))?;

        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut f = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .with_context(|| format!("open log {}", self.path.display()))?;
        f.write_all(&row).with_context(|| format!("append to {}", self.path.display()))?;
        debug!("ingest: logged {}", rec.frame_id);
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        match std::fs::read(&self.path) {
            Ok(b) => Ok(b),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("read log {}", self.path.display())),
        }
    }

    /// Every data row in file order, parsed independently.
    pub fn rows(&self) -> Result<Vec<Result<ObstacleRow, LogRowError>>> {
        Ok(parse_rows(&self.snapshot()?))
    }

    /// The first `limit` well-formed rows in file order.
    pub fn read(&self, limit: usize) -> Result<LogPage> {
        let mut page = LogPage::default();
        for row in self.rows()? {
            if page.records.len() >= limit {
                break;
            }
            match row {
                Ok(r) => page.records.push(r),
                Err(e) => {
                    warn!("ingest: skipping log row: {}", e);
                    page.skipped += 1;
                }
            }
        }
        Ok(page)
    }
}

fn parse_rows(raw: &[u8]) -> Vec<Result<ObstacleRow, LogRowError>> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(raw);
    let headers = match rdr.headers() {
        Ok(h) => h.clone(),
        Err(source) => return vec![Err(LogRowError::Csv { line: 1, source })],
    };
    let col = |name: &str| headers.iter().position(|h| h == name);
    let idx: Vec<Option<usize>> = HEADER.iter().map(|&h| col(h)).collect();

    rdr.records()
        .map(|rec| -> Result<ObstacleRow, LogRowError> {
            let rec = rec.map_err(|source| LogRowError::Csv { line: source.position().map_or(0, |p| p.line()), source })?;
            let line = rec.position().map_or(0, |p| p.line());
            let field = |i: usize| -> Result<&str, LogRowError> {
                idx[i].and_then(|c| rec.get(c)).ok_or(LogRowError::MissingColumn { line, column: HEADER[i] })
            };
            // an empty coordinate reads as 0
            let coord = |s: &str| -> Result<f64, LogRowError> {
                if s.trim().is_empty() {
                    return Ok(0.0);
                }
                s.trim().parse().map_err(|_| LogRowError::BadCoordinate { line, value: s.to_string() })
            };

            Ok(ObstacleRow {
                id: field(0)?.to_string(),
                latitude: coord(field(1)?)?,
                longitude: coord(field(2)?)?,
                objects: field(3)?.to_string(),
                original_img: field(4)?.to_string(),
                predicted_img: field(5)?.to_string(),
                volumes: field(6).ok().map(str::to_string),
            })
        })
        .collect()
}
