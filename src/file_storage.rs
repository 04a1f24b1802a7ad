use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::storage::{PersistedRecord, Storage};
use crate::types::{LogEntry, LogIndex, NodeId, ParseEntryError, Term};

/// Error type for FileStorage operations.
#[derive(Debug, thiserror::Error)]
pub enum FileStorageError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt metadata: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("corrupt log at line {line}: {source}")]
    Entry {
        line: usize,
        #[source]
        source: ParseEntryError,
    },
}

#[derive(Serialize, Deserialize)]
struct Meta {
    commit_length: LogIndex,
    current_term: Term,
    voted_for: Option<NodeId>,
}

/// Disk-backed storage. Persistent state lives in two files inside `dir`:
///   meta.json: commit length, current term and voted_for
///   log.txt: one entry per line, `NO_OP <term>` or `SET <key> <value> <term>`
///
/// Both files are rewritten in full on every save, each through a temp file,
/// fsync and rename. The log goes first: a crash between the two renames leaves
/// a longer log under older metadata, which only adds uncommitted entries the
/// node never acknowledged. The reverse order could leave a commit length
/// pointing past the end of the log.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open (or create) storage rooted at `dir`. On first use the directory is
    /// created and `load` returns the defaults (term 0, no vote, empty log).
    pub fn open(dir: &Path) -> Result<Self, FileStorageError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.txt")
    }

    fn read_meta(&self) -> Result<Option<Meta>, FileStorageError> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn read_log(&self) -> Result<Vec<LogEntry>, FileStorageError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&path)?);
        let mut entries = Vec::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = line.parse().map_err(|source| FileStorageError::Entry {
                line: number + 1,
                source,
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Write `contents` to `name` atomically: temp file → fsync → rename.
    fn replace_file(
        &self,
        name: &str,
        contents: impl FnOnce(&mut BufWriter<File>) -> io::Result<()>,
    ) -> Result<(), FileStorageError> {
        let tmp = self.dir.join(format!("{name}.tmp"));
        let mut writer = BufWriter::new(File::create(&tmp)?);
        contents(&mut writer)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, self.dir.join(name))?;
        Ok(())
    }
}

impl Storage for FileStorage {
    type Error = FileStorageError;

    fn load(&self) -> Result<PersistedRecord, Self::Error> {
        let log = self.read_log()?;
        let record = match self.read_meta()? {
            Some(meta) => PersistedRecord {
                commit_length: meta.commit_length,
                current_term: meta.current_term,
                voted_for: meta.voted_for,
                log,
            },
            None => PersistedRecord {
                log,
                ..PersistedRecord::default()
            },
        };
        Ok(record)
    }

    fn save(&mut self, record: &PersistedRecord) -> Result<(), Self::Error> {
        self.replace_file("log.txt", |w| {
            for entry in &record.log {
                writeln!(w, "{entry}")?;
            }
            Ok(())
        })?;

        let meta = serde_json::to_vec(&Meta {
            commit_length: record.commit_length,
            current_term: record.current_term,
            voted_for: record.voted_for,
        })?;
        self.replace_file("meta.json", |w| w.write_all(&meta))?;

        // Fsync the directory so both renames are visible after a crash.
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_fresh(dir: &Path) -> FileStorage {
        FileStorage::open(dir).expect("open failed")
    }

    fn sample_record() -> PersistedRecord {
        PersistedRecord {
            commit_length: LogIndex::from(2),
            current_term: Term::from(3),
            voted_for: Some(NodeId::from(2)),
            log: vec![
                LogEntry::noop(Term::from(1)),
                LogEntry::set(Term::from(1), "x", "5"),
                LogEntry::set(Term::from(3), "y", "7"),
            ],
        }
    }

    #[test]
    fn first_open_loads_defaults() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let s = open_fresh(&tmp.path().join("node-0"));
        assert_eq!(s.load().expect("load"), PersistedRecord::default());
    }

    #[test]
    fn record_survives_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir");
        {
            let mut s = open_fresh(tmp.path());
            s.save(&sample_record()).expect("save");
        }
        let s = open_fresh(tmp.path());
        assert_eq!(s.load().expect("load"), sample_record());
    }

    #[test]
    fn log_file_uses_line_format() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut s = open_fresh(tmp.path());
        s.save(&sample_record()).expect("save");

        let text = fs::read_to_string(tmp.path().join("log.txt")).expect("read log");
        assert_eq!(text, "NO_OP 1\nSET x 5 1\nSET y 7 3\n");
    }

    #[test]
    fn truncated_log_survives_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir");
        {
            let mut s = open_fresh(tmp.path());
            s.save(&sample_record()).expect("save");
            let mut shorter = sample_record();
            shorter.log.truncate(2);
            s.save(&shorter).expect("save");
        }
        let s = open_fresh(tmp.path());
        assert_eq!(s.load().expect("load").log.len(), 2);
    }

    #[test]
    fn missing_meta_keeps_log() {
        let tmp = tempfile::tempdir().expect("tempdir");
        {
            let mut s = open_fresh(tmp.path());
            s.save(&sample_record()).expect("save");
        }
        fs::remove_file(tmp.path().join("meta.json")).expect("remove meta");

        let record = open_fresh(tmp.path()).load().expect("load");
        assert_eq!(record.log, sample_record().log);
        assert_eq!(record.current_term, Term::default());
        assert_eq!(record.commit_length, LogIndex::default());
    }

    #[test]
    fn corrupt_log_line_is_reported() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("log.txt"), "NO_OP 1\nBOGUS\n").expect("write");

        let err = open_fresh(tmp.path()).load().expect_err("should fail");
        assert!(matches!(err, FileStorageError::Entry { line: 2, .. }));
    }
}
