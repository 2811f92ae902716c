//! Incremental log reading across runs.
//!
//! Each run picks up where the previous one stopped: the byte offset just
//! past the last complete line is kept in a small JSON state file. A log
//! that is now shorter than the saved offset was rotated or truncated, so
//! reading restarts at the top. A lock file next to the state file keeps
//! overlapping runs from consuming the same range twice.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Contents of the offset state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TailState {
    offset: u64,
    #[serde(default)]
    updated: Option<DateTime<Utc>>,
}

/// An open tail over one log file, holding the run lock until dropped.
pub struct LogTail {
    log_path: PathBuf,
    state_path: PathBuf,
    start_offset: u64,
    pending_offset: u64,
    _lock: File,
}

impl LogTail {
    /// Lock the state file and work out where reading should resume.
    ///
    /// With `from_start` the saved offset is ignored.
    pub fn open(log_path: &Path, state_path: &Path, from_start: bool) -> Result<Self, TailError> {
        let lock = acquire_lock(&lock_path(state_path))?;

        let log_len = std::fs::metadata(log_path)
            .map_err(|source| TailError::Open {
                path: log_path.to_path_buf(),
                source,
            })?
            .len();

        let saved = if from_start {
            None
        } else {
            load_state(state_path)
        };

        let start_offset = match saved {
            Some(s) if s.offset <= log_len => s.offset,
            Some(s) => {
                tracing::info!(
                    saved_offset = s.offset,
                    log_len,
                    file = %log_path.display(),
                    "log is shorter than saved offset, assuming rotation"
                );
                0
            }
            None => 0,
        };

        tracing::debug!(start_offset, log_len, "opened log tail");

        Ok(Self {
            log_path: log_path.to_path_buf(),
            state_path: state_path.to_path_buf(),
            start_offset,
            pending_offset: start_offset,
            _lock: lock,
        })
    }

    /// Read every complete line appended since the resume offset.
    ///
    /// An unterminated final line is left for the next run. Trailing `\r`
    /// is stripped and invalid UTF-8 is replaced rather than rejected.
    pub fn read_new_lines(&mut self) -> Result<Vec<String>, TailError> {
        let read_err = |source| TailError::Read {
            path: self.log_path.clone(),
            source,
        };

        let mut file = File::open(&self.log_path).map_err(|source| TailError::Open {
            path: self.log_path.clone(),
            source,
        })?;
        file.seek(SeekFrom::Start(self.start_offset))
            .map_err(read_err)?;
        let mut reader = BufReader::new(file);

        let mut lines = Vec::new();
        let mut consumed: u64 = 0;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf).map_err(read_err)?;
            if n == 0 || buf.last() != Some(&b'\n') {
                break;
            }
            consumed += n as u64;
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            lines.push(String::from_utf8_lossy(&buf).into_owned());
        }

        self.pending_offset = self.start_offset + consumed;
        Ok(lines)
    }

    /// Persist the offset reached by [`LogTail::read_new_lines`].
    pub fn commit(&self) -> Result<(), TailError> {
        let state = TailState {
            offset: self.pending_offset,
            updated: Some(Utc::now()),
        };
        write_state(&self.state_path, &state).map_err(|source| TailError::WriteState {
            path: self.state_path.clone(),
            source,
        })?;
        tracing::debug!(offset = self.pending_offset, "committed log offset");
        Ok(())
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn pending_offset(&self) -> u64 {
        self.pending_offset
    }
}

fn lock_path(state_path: &Path) -> PathBuf {
    let mut p = state_path.as_os_str().to_owned();
    p.push(".lock");
    PathBuf::from(p)
}

fn acquire_lock(path: &Path) -> Result<File, TailError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|source| TailError::Lock {
            path: path.to_path_buf(),
            source,
        })?;

    if let Err(e) = file.try_lock_exclusive() {
        if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
            return Err(TailError::Locked {
                path: path.to_path_buf(),
            });
        }
        return Err(TailError::Lock {
            path: path.to_path_buf(),
            source: e,
        });
    }
    Ok(file)
}

fn load_state(path: &Path) -> Option<TailState> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(error = %e, file = %path.display(), "cannot read offset state, starting from the top");
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!(error = %e, file = %path.display(), "corrupt offset state, starting from the top");
            None
        }
    }
}

/// Write to a temp file in the same directory, then rename over the target
/// so a crash never leaves a half-written state file.
fn write_state(path: &Path, state: &TailState) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, state)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[derive(Debug)]
pub enum TailError {
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Another run holds the lock.
    Locked { path: PathBuf },
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    WriteState {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for TailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TailError::Lock { path, source } => {
                write!(f, "failed to lock {}: {source}", path.display())
            }
            TailError::Locked { path } => {
                write!(f, "another run holds {}", path.display())
            }
            TailError::Open { path, source } => {
                write!(f, "failed to open log {}: {source}", path.display())
            }
            TailError::Read { path, source } => {
                write!(f, "failed to read log {}: {source}", path.display())
            }
            TailError::WriteState { path, source } => {
                write!(f, "failed to write offset state {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for TailError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TailError::Lock { source, .. } => Some(source),
            TailError::Locked { .. } => None,
            TailError::Open { source, .. } => Some(source),
            TailError::Read { source, .. } => Some(source),
            TailError::WriteState { source, .. } => Some(source),
        }
    }
}
