//! Durable prepare log.
//!
//! Append-only JSON lines, fsync'd on every append. A commit decision is
//! durable once its `Prepared` record hits the disk; a crash before that
//! point means global abort. Recovery replays the file to find in-doubt
//! transactions.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::error::Error;
use crate::engine::PrepareToken;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRecord {
    pub shard: String,
    pub token: PrepareToken,
}

/// One log line.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogRecord {
    /// Every participant prepared; commit intent is now durable.
    Prepared {
        gtid: String,
        participants: Vec<ParticipantRecord>,
    },
    /// Commit is starting.
    Commit { gtid: String },
    /// Abort decision.
    Abort { gtid: String },
    /// All participants resolved; nothing left to recover.
    Completed { gtid: String },
}

impl LogRecord {
    pub fn gtid(&self) -> &str {
        match self {
            LogRecord::Prepared { gtid, .. }
            | LogRecord::Commit { gtid }
            | LogRecord::Abort { gtid }
            | LogRecord::Completed { gtid } => gtid,
        }
    }
}

pub struct PrepareLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl PrepareLog {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Append one record and fsync before returning.
    pub fn append(&self, record: &LogRecord) -> Result<(), Error> {
        let line = serde_json::to_string(record)?;
        let mut file = self.file.lock();
        writeln!(file, "{}", line).map_err(Error::from)?;
        file.sync_all()?;
        Ok(())
    }

    /// Replay the whole log from disk.
    pub fn read_all(&self) -> Result<Vec<LogRecord>, Error> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(err.into()),
        };
        let mut records = vec![];
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prepare.log");

        let log = PrepareLog::open(&path).unwrap();
        log.append(&LogRecord::Prepared {
            gtid: "gtid-1-ab".into(),
            participants: vec![ParticipantRecord {
                shard: "-80".into(),
                token: PrepareToken::new("t1"),
            }],
        })
        .unwrap();
        log.append(&LogRecord::Commit {
            gtid: "gtid-1-ab".into(),
        })
        .unwrap();

        // A new handle over the same file sees both records.
        let reopened = PrepareLog::open(&path).unwrap();
        let records = reopened.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].gtid(), "gtid-1-ab");
        assert!(matches!(records[1], LogRecord::Commit { .. }));
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = PrepareLog::open(&dir.path().join("fresh.log")).unwrap();
        assert!(log.read_all().unwrap().is_empty());
    }
}
