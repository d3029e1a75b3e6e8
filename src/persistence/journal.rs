use crate::engine::Engine;
use crate::error::{JournalError, StartupError};
use crate::protocol::{Method, Request};
use crate::store::entry::{now_nanos, now_seconds};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// One mutating request as stored on disk, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JournalRecord {
    pub method: Method,
    pub key: String,
    #[serde(default)]
    pub value: String,
    /// Absolute deadline in nanoseconds since the UNIX epoch; 0 = no expiry.
    #[serde(default)]
    pub expire: i64,
}

impl JournalRecord {
    /// Detached copy of `req` with its relative expiry turned into a deadline.
    pub fn from_request(req: &Request, now: i64) -> Self {
        let expire = if req.expire_secs != 0 {
            now.saturating_add(req.expire_secs.saturating_mul(NANOS_PER_SEC))
        } else {
            0
        };
        JournalRecord {
            method: req.method,
            key: req.key.clone(),
            value: req.value.clone(),
            expire,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    Always,
    Everysec,
    No,
}

impl FsyncPolicy {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Self {
        match s {
            "always" => FsyncPolicy::Always,
            "everysec" => FsyncPolicy::Everysec,
            _ => FsyncPolicy::No,
        }
    }
}

/// Appends records to the journal file. Owned by the journal task.
///
/// Unbuffered: each record goes out in a single write, so a failed append
/// leaves nothing behind to resurface with the next record.
pub struct JournalWriter {
    file: File,
    path: PathBuf,
    fsync_policy: FsyncPolicy,
}

impl JournalWriter {
    /// Open or create the journal file, creating its directory if needed.
    pub fn open(path: &Path, policy: FsyncPolicy) -> Result<Self, StartupError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| StartupError::JournalDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| StartupError::JournalOpen {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(JournalWriter {
            file,
            path: path.to_path_buf(),
            fsync_policy: policy,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one record. Each record reaches the OS before this returns.
    pub fn append(&mut self, record: &JournalRecord) -> Result<(), JournalError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.write_all(&line)?;

        if self.fsync_policy == FsyncPolicy::Always {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Sync the file to disk.
    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// Sending side of the journal queue. Never blocks the caller.
#[derive(Debug, Clone)]
pub struct JournalHandle {
    tx: mpsc::UnboundedSender<JournalRecord>,
}

impl JournalHandle {
    pub fn submit(&self, req: &Request) {
        let record = JournalRecord::from_request(req, now_nanos());
        if self.tx.send(record).is_err() {
            warn!("Journal task is gone, dropping record for {:?}", req.key);
        }
    }
}

/// Start the journal task. It exits, after a final sync, once every
/// `JournalHandle` has been dropped.
pub fn spawn_writer(writer: JournalWriter) -> (JournalHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_writer(writer, rx));
    (JournalHandle { tx }, task)
}

async fn run_writer(mut writer: JournalWriter, mut rx: mpsc::UnboundedReceiver<JournalRecord>) {
    let everysec = writer.fsync_policy == FsyncPolicy::Everysec;
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            record = rx.recv() => match record {
                Some(record) => {
                    if let Err(e) = writer.append(&record) {
                        warn!("Journal append to {} failed, record dropped: {e}", writer.path().display());
                    }
                }
                None => break,
            },
            _ = tick.tick(), if everysec => {
                if let Err(e) = writer.sync() {
                    warn!("Journal fsync failed: {e}");
                }
            }
        }
    }

    if let Err(e) = writer.sync() {
        warn!("Journal fsync failed: {e}");
    }
    debug!("Journal writer stopped");
}

/// Pick the journal file for this run.
///
/// An explicit filename always wins. Otherwise a restore picks the most recently
/// modified file in `dir`, and a fresh run gets a new timestamped file there.
pub fn resolve_path(dir: &Path, filename: &str, restore: bool) -> Result<PathBuf, StartupError> {
    if !filename.is_empty() {
        return Ok(PathBuf::from(filename));
    }
    if restore {
        return latest_journal(dir);
    }
    Ok(dir.join(format!("journal_{}", now_seconds())))
}

fn latest_journal(dir: &Path) -> Result<PathBuf, StartupError> {
    let dir_err = |source: io::Error| StartupError::JournalDir {
        path: dir.to_path_buf(),
        source,
    };

    let mut latest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir).map_err(dir_err)? {
        let entry = entry.map_err(dir_err)?;
        let meta = entry.metadata().map_err(dir_err)?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().map_err(dir_err)?;
        if latest.as_ref().is_none_or(|(t, _)| modified > *t) {
            latest = Some((modified, entry.path()));
        }
    }

    latest.map(|(_, path)| path).ok_or_else(|| StartupError::EmptyJournalDir {
        path: dir.to_path_buf(),
    })
}

/// Replay a journal file into `engine` in file order. Returns the number of
/// records applied. Any unreadable or malformed line aborts the replay.
pub fn replay(path: &Path, engine: &mut Engine) -> Result<usize, StartupError> {
    let read_err = |source: io::Error| StartupError::JournalRead {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(read_err)?;
    let reader = io::BufReader::new(file);
    let now = now_nanos();
    let mut count = 0usize;

    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(read_err)?;
        if line.trim().is_empty() {
            continue;
        }
        let record: JournalRecord =
            serde_json::from_str(&line).map_err(|source| StartupError::MalformedRecord {
                path: path.to_path_buf(),
                line: i + 1,
                source,
            })?;
        engine.restore(&record, now);
        count += 1;
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_json_shape() {
        let record = JournalRecord::from_request(&Request::set("key_1", "val_1", 0), 42);
        assert_eq!(
            serde_json::to_string(&record).unwrap(),
            r#"{"Method":"set","Key":"key_1","Value":"val_1","Expire":0}"#
        );

        let record = JournalRecord::from_request(&Request::delete("key_1"), 42);
        assert_eq!(
            serde_json::to_string(&record).unwrap(),
            r#"{"Method":"delete","Key":"key_1","Value":"","Expire":0}"#
        );
    }

    #[test]
    fn test_record_expiry_is_absolute() {
        let now = 5 * NANOS_PER_SEC;
        let record = JournalRecord::from_request(&Request::set("k", "v", 3), now);
        assert_eq!(record.expire, 8 * NANOS_PER_SEC);

        let record = JournalRecord::from_request(&Request::set("k", "v", -2), now);
        assert_eq!(record.expire, 3 * NANOS_PER_SEC);
    }

    #[test]
    fn test_resolve_explicit_filename() {
        let dir = tempfile::tempdir().unwrap();
        let path = resolve_path(dir.path(), "custom.log", true).unwrap();
        assert_eq!(path, PathBuf::from("custom.log"));
    }

    #[test]
    fn test_resolve_fresh_run_is_timestamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = resolve_path(dir.path(), "", false).unwrap();
        assert_eq!(path.parent().unwrap(), dir.path());
        assert!(
            path.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("journal_")
        );
    }

    #[test]
    fn test_resolve_restore_empty_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve_path(dir.path(), "", true),
            Err(StartupError::EmptyJournalDir { .. })
        ));
    }

    #[test]
    fn test_resolve_restore_picks_latest() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("journal_1");
        let new = dir.path().join("journal_2");
        std::fs::write(&old, "").unwrap();
        std::fs::write(&new, "").unwrap();
        let earlier = std::time::SystemTime::now() - Duration::from_secs(60);
        File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(earlier)
            .unwrap();

        assert_eq!(resolve_path(dir.path(), "", true).unwrap(), new);
    }

    #[test]
    fn test_writer_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("journal_test");
        let mut writer = JournalWriter::open(&path, FsyncPolicy::Always).unwrap();
        writer
            .append(&JournalRecord::from_request(&Request::set("a", "1", 0), 0))
            .unwrap();
        writer
            .append(&JournalRecord::from_request(&Request::delete("a"), 0))
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#""Method":"set""#));
        assert!(lines[1].contains(r#""Method":"delete""#));
    }

    #[test]
    fn test_append_to_full_device_fails() {
        let full = Path::new("/dev/full");
        if !full.exists() {
            return;
        }
        let mut writer = JournalWriter::open(full, FsyncPolicy::No).unwrap();
        let record = JournalRecord::from_request(&Request::set("a", "1", 0), 0);
        assert!(matches!(writer.append(&record), Err(JournalError::Io(_))));
        // Nothing is held back for a retry; the next record fails on its own.
        assert!(matches!(writer.append(&record), Err(JournalError::Io(_))));
    }

    #[tokio::test]
    async fn test_replay_applies_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal_replay");
        let future = now_nanos() + 60 * NANOS_PER_SEC;
        let lines = [
            r#"{"Method":"set","Key":"key_1","Value":"val_1","Expire":0}"#.to_string(),
            r#"{"Method":"delete","Key":"key_1","Value":"","Expire":0}"#.to_string(),
            r#"{"Method":"set","Key":"key_2","Value":"val_2","Expire":0}"#.to_string(),
            r#"{"Method":"set","Key":"key_3","Value":"val_3","Expire":1}"#.to_string(),
            format!(r#"{{"Method":"set","Key":"key_4","Value":"val_4","Expire":{future}}}"#),
            String::new(),
        ];
        std::fs::write(&path, lines.join("\n")).unwrap();

        let (mut engine, _handle) = Engine::new();
        assert_eq!(replay(&path, &mut engine).unwrap(), 5);
        assert!(!engine.store().contains("key_1"));
        assert_eq!(engine.store().get("key_2").unwrap().value, "val_2");
        assert!(!engine.store().contains("key_3"));
        assert!(engine.store().get("key_4").unwrap().has_timer());
    }

    #[tokio::test]
    async fn test_replay_rejects_malformed_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal_bad");
        std::fs::write(
            &path,
            "{\"Method\":\"set\",\"Key\":\"a\",\"Value\":\"b\",\"Expire\":0}\n{\"Method\":\"set\",\"Ke",
        )
        .unwrap();

        let (mut engine, _handle) = Engine::new();
        match replay(&path, &mut engine) {
            Err(StartupError::MalformedRecord { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected malformed record error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_writer_task_drains_then_exits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal_task");
        let writer = JournalWriter::open(&path, FsyncPolicy::Everysec).unwrap();
        let (handle, task) = spawn_writer(writer);

        handle.submit(&Request::set("k", "v", 0));
        handle.submit(&Request::delete("k"));
        drop(handle);
        task.await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
