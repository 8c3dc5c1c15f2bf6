//! # decision-storage
//!
//! why: durable persistence for the decision log and raft hard state using std fs apis
//! relations: implements decision_core::LogStore, opened by decision-cluster's node runtime
//! what: FileLogStore (meta.json + log.jsonl), crash recovery on open

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use decision_core::log::check_contiguous;
use decision_core::{HardState, LogEntry, LogIndex, LogStore, StorageError, Term};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.jsonl";

/// term, vote and commit watermark, rewritten atomically on every change
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct MetaData {
    term: Term,
    voted_for: Option<u64>,
    #[serde(default)]
    committed: LogIndex,
}

/// file-backed log store
///
/// stores state in a directory with:
/// - meta.json: term, voted_for and the commit watermark
/// - log.jsonl: one json log entry per line, append-only
///
/// every mutating call is fsynced before it returns, so an AppendEntries
/// success or a vote grant never outruns the disk. the whole log is also
/// cached in memory for reads.
#[derive(Debug)]
pub struct FileLogStore {
    dir: PathBuf,
    log_file: File,
    entries: Vec<LogEntry>,
    meta: MetaData,
}

impl FileLogStore {
    /// open the store at `dir`, creating it if needed and replaying what is on disk
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let meta = load_meta(&dir.join(META_FILE))?;
        let (entries, torn_tail) = load_log(&dir.join(LOG_FILE))?;

        if meta.committed > entries.len() as LogIndex {
            return Err(StorageError::Corrupt(format!(
                "commit watermark {} is past the last log entry {}",
                meta.committed,
                entries.len()
            )));
        }

        if torn_tail {
            // a crash mid-append leaves a partial last line; it was never acked
            warn!(dir = %dir.display(), last = entries.len(), "dropping torn log tail");
            rewrite_log(&dir, &entries)?;
        }

        let log_file = open_append(&dir.join(LOG_FILE))?;
        info!(
            dir = %dir.display(),
            entries = entries.len(),
            term = meta.term,
            committed = meta.committed,
            "opened log store"
        );
        Ok(Self { dir, log_file, entries, meta })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// atomic write: write to temp file, fsync, then rename over meta.json
    fn write_meta(&self, meta: &MetaData) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(meta)?;
        let temp_path = self.dir.join("meta.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, self.dir.join(META_FILE))?;
        Ok(())
    }
}

impl LogStore for FileLogStore {
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        check_contiguous(self.entries.len() as LogIndex, entries)?;

        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        self.log_file.write_all(&buf)?;
        self.log_file.sync_data()?;

        self.entries.extend(entries.iter().cloned());
        Ok(())
    }

    fn truncate_suffix(&mut self, from_index: LogIndex) -> Result<(), StorageError> {
        if from_index <= self.meta.committed {
            return Err(StorageError::CommittedTruncation {
                from: from_index,
                committed: self.meta.committed,
            });
        }
        if from_index > self.entries.len() as LogIndex {
            return Ok(());
        }

        let kept = (from_index - 1) as usize;
        debug!(from = from_index, dropped = self.entries.len() - kept, "truncating log");
        rewrite_log(&self.dir, &self.entries[..kept])?;
        self.log_file = open_append(&self.dir.join(LOG_FILE))?;
        self.entries.truncate(kept);
        Ok(())
    }

    fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    fn last_index_and_term(&self) -> (LogIndex, Term) {
        self.entries.last().map(|e| (e.index, e.term)).unwrap_or((0, 0))
    }

    fn mark_committed(&mut self, index: LogIndex) -> Result<(), StorageError> {
        if index <= self.meta.committed {
            return Ok(());
        }
        if index > self.entries.len() as LogIndex {
            return Err(StorageError::Corrupt(format!(
                "cannot commit index {} beyond last entry {}",
                index,
                self.entries.len()
            )));
        }
        let next = MetaData { committed: index, ..self.meta };
        self.write_meta(&next)?;
        self.meta = next;
        Ok(())
    }

    fn committed_index(&self) -> LogIndex {
        self.meta.committed
    }

    fn save_hard_state(&mut self, state: HardState) -> Result<(), StorageError> {
        let next = MetaData {
            term: state.term,
            voted_for: state.voted_for,
            committed: self.meta.committed,
        };
        self.write_meta(&next)?;
        self.meta = next;
        Ok(())
    }

    fn hard_state(&self) -> HardState {
        HardState {
            term: self.meta.term,
            voted_for: self.meta.voted_for,
        }
    }
}

fn load_meta(path: &Path) -> Result<MetaData, StorageError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        // default for new nodes
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(MetaData::default()),
        Err(e) => Err(e.into()),
    }
}

/// Reads every entry, checking indexes run 1..=n. The bool reports a
/// partial final line, which is tolerated; garbage anywhere else is not.
fn load_log(path: &Path) -> Result<(Vec<LogEntry>, bool), StorageError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), false)),
        Err(e) => return Err(e.into()),
    };

    let mut entries: Vec<LogEntry> = Vec::new();
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok((entries, false));
        }
        let complete = line.ends_with('\n');
        let entry: LogEntry = match serde_json::from_str(line.trim_end()) {
            Ok(entry) => entry,
            Err(_) if !complete => return Ok((entries, true)),
            Err(e) => {
                return Err(StorageError::Corrupt(format!(
                    "unreadable entry after index {}: {}",
                    entries.len(),
                    e
                )))
            }
        };
        let expected = entries.len() as LogIndex + 1;
        if entry.index != expected {
            return Err(StorageError::Corrupt(format!(
                "expected index {} on disk, found {}",
                expected, entry.index
            )));
        }
        entries.push(entry);
        if !complete {
            // parsed but unterminated: keep it and repair the newline
            return Ok((entries, true));
        }
    }
}

/// replace log.jsonl with exactly `entries`, via temp file and rename
fn rewrite_log(dir: &Path, entries: &[LogEntry]) -> Result<(), StorageError> {
    let temp_path = dir.join("log.tmp");
    let mut file = File::create(&temp_path)?;
    let mut buf = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut buf, entry)?;
        buf.push(b'\n');
    }
    file.write_all(&buf)?;
    file.sync_all()?;
    fs::rename(&temp_path, dir.join(LOG_FILE))?;
    Ok(())
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
