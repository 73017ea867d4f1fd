use std::{
    collections::VecDeque,
    fmt, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
    sync::{mpsc, oneshot},
};

pub const DEFAULT_CAPACITY: usize = 50;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/* === Definitions === */

/// Operator-facing record of everything the device did.
///
/// Appending is synchronous and never fails. The most recent entries are
/// kept in memory (newest first) and every entry is forwarded to an
/// optional durable sink on a best-effort basis.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Inner>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Entry {
    pub timestamp: DateTime<Local>,
    pub message: String,
}

/// Durable destination for log lines.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str) -> io::Result<()>;
}

/// Appends each line to a plain text file. Lines are queued to a writer
/// task, so appending never blocks on the disk.
#[derive(Clone)]
pub struct FileSink {
    path: PathBuf,
    tx: mpsc::UnboundedSender<Write>,
}

enum Write {
    Line(String),
    Flush(oneshot::Sender<()>),
}

struct Inner {
    capacity: usize,
    entries: Mutex<VecDeque<Entry>>,
    sink: Option<Box<dyn LogSink>>,
}

/* === Implementations === */

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, None)
    }

    pub fn with_sink(capacity: usize, sink: impl LogSink + 'static) -> Self {
        Self::build(capacity, Some(Box::new(sink)))
    }

    fn build(capacity: usize, sink: Option<Box<dyn LogSink>>) -> Self {
        let capacity = capacity.max(1);

        Self {
            inner: Arc::new(Inner {
                capacity,
                entries: Mutex::new(VecDeque::with_capacity(capacity)),
                sink,
            }),
        }
    }

    pub fn append(&self, message: impl Into<String>) {
        let entry = Entry {
            timestamp: Local::now(),
            message: message.into(),
        };

        tracing::info!(target: "breeze::event", "{}", entry.message);

        let line = entry.to_string();

        {
            let mut entries = self.inner.lock();

            if entries.len() == self.inner.capacity {
                entries.pop_back();
            }

            entries.push_front(entry);
        }

        if let Some(sink) = &self.inner.sink {
            if let Err(error) = sink.write_line(&line) {
                tracing::trace!("Event log sink failed: {error}");
            }
        }
    }

    /// Most recent entries, newest first.
    pub fn recent(&self) -> Vec<Entry> {
        self.inner.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.message
        )
    }
}

impl FileSink {
    /// Creates the parent directory and opens the file for appending, then
    /// spawns the writer task.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::write_task(file, rx));

        Ok(Self { path, tx })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolves once every line queued before this call reached the file.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();

        if self.tx.send(Write::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    async fn write_task(mut file: File, mut rx: mpsc::UnboundedReceiver<Write>) {
        while let Some(write) = rx.recv().await {
            match write {
                Write::Line(line) => {
                    if let Err(error) = file.write_all(line.as_bytes()).await {
                        tracing::warn!("Failed to write event log: {error}");
                    }
                }

                Write::Flush(done) => {
                    if let Err(error) = file.flush().await {
                        tracing::warn!("Failed to flush event log: {error}");
                    }

                    let _ = done.send(());
                }
            }
        }
    }
}

impl LogSink for FileSink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        self.tx
            .send(Write::Line(format!("{line}\n")))
            .map_err(|_| io::Error::other("event log writer stopped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct MemorySink(Arc<Mutex<Vec<String>>>);

    impl LogSink for MemorySink {
        fn write_line(&self, line: &str) -> io::Result<()> {
            self.0.lock().unwrap().push(line.to_owned());
            Ok(())
        }
    }

    struct BrokenSink;

    impl LogSink for BrokenSink {
        fn write_line(&self, _: &str) -> io::Result<()> {
            Err(io::Error::other("disk full"))
        }
    }

    #[test]
    fn test_recent_is_newest_first_and_bounded() {
        let log = EventLog::new(3);

        for i in 0..5 {
            log.append(format!("event {i}"));
        }

        let messages: Vec<_> = log.recent().into_iter().map(|e| e.message).collect();

        assert_eq!(messages, ["event 4", "event 3", "event 2"]);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_every_entry_reaches_sink() {
        let sink = MemorySink::default();
        let log = EventLog::with_sink(2, sink.clone());

        for i in 0..4 {
            log.append(format!("event {i}"));
        }

        let lines = sink.0.lock().unwrap();

        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with(": event 0"));
        assert!(lines[3].ends_with(": event 3"));
    }

    #[test]
    fn test_sink_failure_is_swallowed() {
        let log = EventLog::with_sink(10, BrokenSink);

        log.append("still recorded");

        assert_eq!(log.recent()[0].message, "still recorded");
    }

    #[test]
    fn test_line_format() {
        let entry = Entry {
            timestamp: Local::now(),
            message: "Fan started".into(),
        };

        let line = entry.to_string();
        let (timestamp, message) = line.split_once(": ").unwrap();

        assert_eq!(message, "Fan started");
        assert_eq!(timestamp.len(), "2024-01-01 00:00:00".len());
    }

    #[tokio::test]
    async fn test_file_sink_appends_lines() {
        let dir = std::env::temp_dir().join(format!("breeze-log-{}", uuid::Uuid::new_v4()));
        let sink = FileSink::open(dir.join("logs").join("events.log")).await.unwrap();
        let log = EventLog::with_sink(10, sink.clone());

        sink.write_line("first").unwrap();
        log.append("second");
        sink.flush().await;

        let contents = fs::read_to_string(sink.path()).await.unwrap();
        let lines: Vec<_> = contents.lines().collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "first");
        assert!(lines[1].ends_with(": second"));

        let _ = fs::remove_dir_all(dir).await;
    }
}
