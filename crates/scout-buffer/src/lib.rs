//! Filesystem-backed queue of capture tasks waiting for the relay.
//!
//! Layout under the buffer root:
//!
//! ```text
//! task_0000/left.jpg
//! task_0000/right.jpg
//! task_0000/mask.jpg      (optional)
//! task_0000/gps.json      {"lat":..,"lon":..,"frame":".."}
//! .staging/               half-written tasks, never listed
//! .next_seq               next task sequence number
//! ```
//!
//! A task is written completely under `.staging/` and then renamed into the
//! root, so [`CaptureBuffer::list_pending`] only ever sees complete folders.
//! The directory tree is the only state; a restarted relay simply lists again.
//! Enqueueing assumes a single producer process.

pub mod doctor;
pub mod prepare;

use bytes::Bytes;
use scout_proto::wire::GpsRecord;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const LEFT_FILE: &str = "left.jpg";
pub const RIGHT_FILE: &str = "right.jpg";
pub const MASK_FILE: &str = "mask.jpg";
pub const GPS_FILE: &str = "gps.json";

const STAGING_DIR: &str = ".staging";
const SEQ_FILE: &str = ".next_seq";
const TASK_PREFIX: &str = "task_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn dir_name(&self) -> String {
        format!("{}{:04}", TASK_PREFIX, self.0)
    }

    pub fn parse(name: &str) -> Option<Self> {
        let digits = name.strip_prefix(TASK_PREFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(TaskId)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dir_name())
    }
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("missing sibling file: {}", .0.display())]
    MissingSibling(PathBuf),
    #[error("task already buffered: {0}")]
    TaskExists(TaskId),
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("invalid task {id}: {reason}")]
    InvalidTask { id: TaskId, reason: String },
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("gps descriptor: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> BufferError + '_ {
    move |source| BufferError::Io { path: path.to_path_buf(), source }
}

/// Files and metadata for one frame set, before it is buffered.
#[derive(Debug, Clone)]
pub struct CaptureSource {
    pub frame_name: String,
    pub lat: f64,
    pub lon: f64,
    pub left: PathBuf,
    pub right: PathBuf,
    pub mask: Option<PathBuf>,
}

impl CaptureSource {
    fn files(&self) -> Vec<(&Path, &'static str)> {
        let mut out = vec![(self.left.as_path(), LEFT_FILE), (self.right.as_path(), RIGHT_FILE)];
        if let Some(m) = &self.mask {
            out.push((m.as_path(), MASK_FILE));
        }
        out
    }

    /// Every source file that does not exist.
    pub fn missing_files(&self) -> Vec<PathBuf> {
        self.files().into_iter().filter(|(p, _)| !p.is_file()).map(|(p, _)| p.to_path_buf()).collect()
    }
}

/// A buffered task read back into memory for sending.
#[derive(Debug, Clone)]
pub struct LoadedTask {
    pub id: TaskId,
    pub gps: GpsRecord,
    pub left: Bytes,
    pub right: Bytes,
    pub mask: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct CaptureBuffer {
    root: PathBuf,
}

impl CaptureBuffer {
    /// Opens (creating if needed) the buffer directory. Failure here is fatal for callers.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BufferError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err(&root))?;
        let staging = root.join(STAGING_DIR);
        fs::create_dir_all(&staging).map_err(io_err(&staging))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self, id: TaskId) -> PathBuf {
        self.root.join(id.dir_name())
    }

    /// Buffers `src` under the next sequence number.
    pub fn enqueue(&self, src: &CaptureSource) -> Result<TaskId, BufferError> {
        check_siblings(src)?;
        let id = self.allocate_id()?;
        self.publish(id, src)
    }

    /// Buffers `src` under a caller-chosen id (e.g. the manifest row index).
    pub fn enqueue_at(&self, id: TaskId, src: &CaptureSource) -> Result<TaskId, BufferError> {
        check_siblings(src)?;
        if self.task_dir(id).exists() {
            return Err(BufferError::TaskExists(id));
        }
        let next = self.read_seq()?;
        if id.0 >= next {
            self.write_seq(id.0 + 1)?;
        }
        self.publish(id, src)
    }

    fn publish(&self, id: TaskId, src: &CaptureSource) -> Result<TaskId, BufferError> {
        let target = self.task_dir(id);
        if target.exists() {
            return Err(BufferError::TaskExists(id));
        }

        let stage = self.root.join(STAGING_DIR).join(format!(
            "{}-{}-{}",
            id.dir_name(),
            std::process::id(),
            time::OffsetDateTime::now_utc().unix_timestamp_nanos()
        ));
        fs::create_dir_all(&stage).map_err(io_err(&stage))?;

        let staged = (|| {
            for (from, name) in src.files() {
                copy_synced(from, &stage.join(name))?;
            }
            let gps = GpsRecord { lat: src.lat, lon: src.lon, frame: src.frame_name.clone() };
            write_synced(&stage.join(GPS_FILE), &serde_json::to_vec(&gps)?)?;
            fs::rename(&stage, &target).map_err(io_err(&target))
        })();

        if let Err(e) = staged {
            if let Err(cleanup) = fs::remove_dir_all(&stage) {
                warn!("buffer: could not clean staging dir {}: {}", stage.display(), cleanup);
            }
            return Err(e);
        }

        info!("buffer: {} buffered (frame={})", id, src.frame_name);
        Ok(id)
    }

    /// Snapshot of complete tasks, ascending id.
    pub fn list_pending(&self) -> Result<Vec<TaskId>, BufferError> {
        let mut ids = Vec::new();
        for ent in fs::read_dir(&self.root).map_err(io_err(&self.root))? {
            let ent = ent.map_err(io_err(&self.root))?;
            let Some(id) = ent.file_name().to_str().and_then(TaskId::parse) else { continue };
            // a task removed between read_dir and here is simply not pending anymore
            match ent.file_type() {
                Ok(t) if t.is_dir() => ids.push(id),
                _ => continue,
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn load(&self, id: TaskId) -> Result<LoadedTask, BufferError> {
        let dir = self.task_dir(id);
        if !dir.is_dir() {
            return Err(BufferError::NotFound(id));
        }
        let gps_raw = read_part(&dir, GPS_FILE, id)?;
        let gps: GpsRecord = serde_json::from_slice(&gps_raw)?;
        let left = read_part(&dir, LEFT_FILE, id)?;
        let right = read_part(&dir, RIGHT_FILE, id)?;
        let mask_path = dir.join(MASK_FILE);
        let mask = if mask_path.is_file() {
            Some(Bytes::from(fs::read(&mask_path).map_err(io_err(&mask_path))?))
        } else {
            None
        };
        Ok(LoadedTask { id, gps, left: Bytes::from(left), right: Bytes::from(right), mask })
    }

    /// Deletes the task folder. Removing an absent task is not an error.
    pub fn remove(&self, id: TaskId) -> Result<(), BufferError> {
        let dir = self.task_dir(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!("buffer: {} removed", id);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BufferError::Io { path: dir, source: e }),
        }
    }

    /// Drops staging leftovers from a producer that died mid-enqueue.
    /// Only the producer should call this.
    pub fn sweep_staging(&self) -> Result<usize, BufferError> {
        let staging = self.root.join(STAGING_DIR);
        let mut n = 0;
        for ent in fs::read_dir(&staging).map_err(io_err(&staging))? {
            let path = ent.map_err(io_err(&staging))?.path();
            let res = if path.is_dir() { fs::remove_dir_all(&path) } else { fs::remove_file(&path) };
            res.map_err(io_err(&path))?;
            n += 1;
        }
        if n > 0 {
            warn!("buffer: swept {} stale staging entries", n);
        }
        Ok(n)
    }

    fn allocate_id(&self) -> Result<TaskId, BufferError> {
        let from_seq = self.read_seq()?;
        let from_dirs = self.list_pending()?.last().map(|id| id.0 + 1).unwrap_or(0);
        let id = from_seq.max(from_dirs);
        self.write_seq(id + 1)?;
        Ok(TaskId(id))
    }

    fn read_seq(&self) -> Result<u64, BufferError> {
        let path = self.root.join(SEQ_FILE);
        match fs::read_to_string(&path) {
            Ok(s) => Ok(s.trim().parse().unwrap_or_else(|_| {
                warn!("buffer: unreadable {} ({:?}); recomputing from task dirs", SEQ_FILE, s.trim());
                0
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(BufferError::Io { path, source: e }),
        }
    }

    fn write_seq(&self, next: u64) -> Result<(), BufferError> {
        let tmp = self.root.join(STAGING_DIR).join(format!("{}.tmp", SEQ_FILE));
        write_synced(&tmp, next.to_string().as_bytes())?;
        let path = self.root.join(SEQ_FILE);
        fs::rename(&tmp, &path).map_err(io_err(&path))
    }
}

fn check_siblings(src: &CaptureSource) -> Result<(), BufferError> {
    match src.missing_files().into_iter().next() {
        Some(p) => Err(BufferError::MissingSibling(p)),
        None => Ok(()),
    }
}

fn read_part(dir: &Path, name: &str, id: TaskId) -> Result<Vec<u8>, BufferError> {
    let path = dir.join(name);
    match fs::read(&path) {
        Ok(b) => Ok(b),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(BufferError::InvalidTask { id, reason: format!("{} missing", name) })
        }
        Err(e) => Err(BufferError::Io { path, source: e }),
    }
}

fn copy_synced(from: &Path, to: &Path) -> Result<(), BufferError> {
    fs::copy(from, to).map_err(io_err(from))?;
    fs::File::open(to).and_then(|f| f.sync_all()).map_err(io_err(to))
}

fn write_synced(path: &Path, data: &[u8]) -> Result<(), BufferError> {
    let mut f = fs::File::create(path).map_err(io_err(path))?;
    f.write_all(data).map_err(io_err(path))?;
    f.sync_all().map_err(io_err(path))
}
