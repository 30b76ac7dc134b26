//! File-based message queue: atomic, crash-safe, observable.
//!
//! Queue structure:
//! - incoming/  : New messages waiting to be processed
//! - processing/: Messages currently being processed
//! - outgoing/  : Responses ready to send to channels
//!
//! The only synchronization primitive is filesystem rename atomicity, so
//! multiple processes may share one queue tree with no extra coordination.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::core::types::{now_timestamp, MessageData, QueuedMessage};
use crate::error::{Error, Result};

/// The three named partitions of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Incoming,
    Processing,
    Outgoing,
}

impl Partition {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Partition::Incoming => "incoming",
            Partition::Processing => "processing",
            Partition::Outgoing => "outgoing",
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// Default age after which a processing entry is assumed abandoned.
pub const DEFAULT_ORPHAN_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// File-backed message queue.
pub struct FileQueue {
    root: PathBuf,
    orphan_threshold: Duration,
}

impl FileQueue {
    /// Open (and create, if needed) a queue rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();

        for partition in [Partition::Incoming, Partition::Processing, Partition::Outgoing] {
            fs::create_dir_all(root.join(partition.dir_name()))?;
        }

        tracing::debug!("File queue initialized at {}", root.display());

        Ok(Self {
            root,
            orphan_threshold: DEFAULT_ORPHAN_THRESHOLD,
        })
    }

    /// Override the orphan recovery threshold.
    pub fn with_orphan_threshold(mut self, threshold: Duration) -> Self {
        self.orphan_threshold = threshold;
        self
    }

    fn partition_dir(&self, partition: Partition) -> PathBuf {
        self.root.join(partition.dir_name())
    }

    /// Add a message to the incoming or outgoing partition.
    ///
    /// The entry name embeds a millisecond timestamp plus a random suffix:
    /// lexicographic order approximates arrival order, the suffix guarantees
    /// uniqueness.
    pub fn enqueue(&self, message: &MessageData, partition: Partition) -> Result<PathBuf> {
        if partition == Partition::Processing {
            return Err(Error::Queue(
                "cannot enqueue directly into processing".to_string(),
            ));
        }

        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let filename = format!("{}_{}.json", millis, &suffix[..8]);

        let file_path = self.partition_dir(partition).join(&filename);
        let content = serde_json::to_string_pretty(message)?;
        fs::write(&file_path, content)?;

        tracing::debug!("Enqueued message to {}: {}", partition, filename);
        Ok(file_path)
    }

    /// Sorted entry names for a partition (oldest first).
    fn sorted_entries(&self, partition: Partition) -> Result<Vec<PathBuf>> {
        let dir = self.partition_dir(partition);
        let mut entries = Vec::new();

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                entries.push(path);
            }
        }

        entries.sort();
        Ok(entries)
    }

    /// Claim the oldest incoming message by atomically moving it into
    /// processing. Returns `None` when the queue is empty or a racing
    /// consumer claimed the entry first; the caller should simply re-poll.
    pub fn dequeue(&self) -> Result<Option<QueuedMessage>> {
        let entries = self.sorted_entries(Partition::Incoming)?;

        let Some(src) = entries.into_iter().next() else {
            return Ok(None);
        };

        let dst = self
            .partition_dir(Partition::Processing)
            .join(src.file_name().unwrap_or_default());

        match fs::rename(&src, &dst) {
            Ok(()) => {}
            // Another consumer won the race for this entry.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let content = fs::read_to_string(&dst)?;
        let data: MessageData = serde_json::from_str(&content)?;

        // Rewrite in place so mtime records when processing began; the orphan
        // scan measures time in processing, not time since enqueue.
        fs::write(&dst, &content)?;

        Ok(Some(QueuedMessage {
            path: dst,
            data,
            created_at: now_timestamp(),
        }))
    }

    /// Mark a message as completed (delete from processing). Idempotent:
    /// deleting an already-deleted entry is a no-op.
    pub fn complete(&self, queued_message: &QueuedMessage) -> Result<()> {
        remove_idempotent(&queued_message.path, "processing")
    }

    /// Move processing entries older than the orphan threshold back to
    /// incoming. This is the crash-recovery path for consumers that died
    /// mid-turn; it yields at-least-once delivery, never silent loss.
    pub fn recover_orphaned(&self) -> Result<usize> {
        let incoming_dir = self.partition_dir(Partition::Incoming);
        let mut recovered = 0;

        for path in self.sorted_entries(Partition::Processing)? {
            let Ok(modified) = path.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            let age = modified.elapsed().unwrap_or_default();

            if age > self.orphan_threshold {
                let dst = incoming_dir.join(path.file_name().unwrap_or_default());
                if fs::rename(&path, &dst).is_ok() {
                    recovered += 1;
                    tracing::warn!(
                        "Recovered orphaned message: {}",
                        path.file_name().unwrap_or_default().to_string_lossy()
                    );
                }
            }
        }

        if recovered > 0 {
            tracing::info!("Recovered {} orphaned messages", recovered);
        }

        Ok(recovered)
    }

    /// Ordered, non-destructive scan of the outgoing partition, for channels
    /// to poll. Entries that vanish mid-scan (delivered by another consumer)
    /// are skipped.
    pub fn iter_outgoing(&self) -> Result<Vec<QueuedMessage>> {
        let mut messages = Vec::new();

        for path in self.sorted_entries(Partition::Outgoing)? {
            let content = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            match serde_json::from_str::<MessageData>(&content) {
                Ok(data) => messages.push(QueuedMessage {
                    path: path.clone(),
                    data,
                    created_at: now_timestamp(),
                }),
                Err(e) => {
                    tracing::error!("Skipping malformed outgoing entry {}: {}", path.display(), e);
                }
            }
        }

        Ok(messages)
    }

    /// Delete an outgoing entry after the channel delivered it. Idempotent.
    pub fn delete_outgoing(&self, path: &Path) -> Result<()> {
        remove_idempotent(path, "outgoing")
    }

    /// Number of entries in a partition.
    pub fn size(&self, partition: Partition) -> Result<usize> {
        Ok(self.sorted_entries(partition)?.len())
    }
}

fn remove_idempotent(path: &Path, label: &str) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!("Removed {} entry: {}", label, path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("{} entry already deleted: {}", label, path.display());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn temp_queue() -> (tempfile::TempDir, FileQueue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::new(dir.path()).unwrap();
        (dir, queue)
    }

    #[test]
    fn test_enqueue_dequeue_round_trip() {
        let (_dir, queue) = temp_queue();

        let msg = MessageData::new("cli", "Alice", "1", "@coder hello");
        queue.enqueue(&msg, Partition::Incoming).unwrap();

        let queued = queue.dequeue().unwrap().unwrap();
        assert_eq!(queued.data.message, "@coder hello");
        assert_eq!(queue.size(Partition::Incoming).unwrap(), 0);
        assert_eq!(queue.size(Partition::Processing).unwrap(), 1);

        queue.complete(&queued).unwrap();
        assert_eq!(queue.size(Partition::Processing).unwrap(), 0);
    }

    #[test]
    fn test_dequeue_empty_returns_none() {
        let (_dir, queue) = temp_queue();
        assert!(queue.dequeue().unwrap().is_none());
    }

    #[test]
    fn test_dequeue_oldest_first() {
        let (_dir, queue) = temp_queue();

        for i in 0..3 {
            let msg = MessageData::new("cli", "Alice", "1", &format!("msg {}", i));
            queue.enqueue(&msg, Partition::Incoming).unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }

        for i in 0..3 {
            let queued = queue.dequeue().unwrap().unwrap();
            assert_eq!(queued.data.message, format!("msg {}", i));
        }
    }

    #[test]
    fn test_enqueue_into_processing_rejected() {
        let (_dir, queue) = temp_queue();
        let msg = MessageData::new("cli", "Alice", "1", "hi");
        assert!(queue.enqueue(&msg, Partition::Processing).is_err());
    }

    // Concurrent dequeuers claim each message exactly once.
    #[test]
    fn test_concurrent_dequeue_no_duplicates_no_losses() {
        let (_dir, queue) = temp_queue();
        let total = 25;

        for i in 0..total {
            let msg = MessageData::new("cli", "Alice", "1", &format!("msg {}", i));
            queue.enqueue(&msg, Partition::Incoming).unwrap();
        }

        let claimed: Mutex<Vec<String>> = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| loop {
                    match queue.dequeue().unwrap() {
                        Some(qm) => {
                            claimed.lock().unwrap().push(qm.data.message_id.clone());
                            queue.complete(&qm).unwrap();
                        }
                        None => {
                            if queue.size(Partition::Incoming).unwrap() == 0 {
                                break;
                            }
                        }
                    }
                });
            }
        });

        let claimed = claimed.into_inner().unwrap();
        assert_eq!(claimed.len(), total);
        let distinct: HashSet<_> = claimed.iter().collect();
        assert_eq!(distinct.len(), total);
        assert_eq!(queue.size(Partition::Processing).unwrap(), 0);
    }

    // Orphaned processing entries move back to incoming once past the
    // threshold, and are left alone while younger.
    #[test]
    fn test_recover_orphaned_threshold() {
        let dir = tempfile::tempdir().unwrap();

        let patient =
            FileQueue::new(dir.path()).unwrap().with_orphan_threshold(Duration::from_secs(3600));
        let msg = MessageData::new("cli", "Alice", "1", "@coder hi");
        patient.enqueue(&msg, Partition::Incoming).unwrap();
        let _queued = patient.dequeue().unwrap().unwrap();

        assert_eq!(patient.recover_orphaned().unwrap(), 0);
        assert_eq!(patient.size(Partition::Processing).unwrap(), 1);

        let eager = FileQueue::new(dir.path()).unwrap().with_orphan_threshold(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(eager.recover_orphaned().unwrap(), 1);
        assert_eq!(eager.size(Partition::Processing).unwrap(), 0);
        assert_eq!(eager.size(Partition::Incoming).unwrap(), 1);

        // The recovered entry is dequeueable again: at-least-once delivery.
        let again = eager.dequeue().unwrap().unwrap();
        assert_eq!(again.data.message, "@coder hi");
    }

    // Completion and outgoing deletion are idempotent.
    #[test]
    fn test_idempotent_completion() {
        let (_dir, queue) = temp_queue();

        let msg = MessageData::new("cli", "Alice", "1", "hi");
        queue.enqueue(&msg, Partition::Incoming).unwrap();
        let queued = queue.dequeue().unwrap().unwrap();

        queue.complete(&queued).unwrap();
        queue.complete(&queued).unwrap();

        let path = queue.enqueue(&msg, Partition::Outgoing).unwrap();
        queue.delete_outgoing(&path).unwrap();
        queue.delete_outgoing(&path).unwrap();
    }

    #[test]
    fn test_iter_outgoing_ordered_and_non_destructive() {
        let (_dir, queue) = temp_queue();

        for i in 0..3 {
            let msg = MessageData::new("cli", "Alice", "1", &format!("out {}", i));
            queue.enqueue(&msg, Partition::Outgoing).unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }

        let first_scan = queue.iter_outgoing().unwrap();
        let messages: Vec<_> = first_scan.iter().map(|m| m.data.message.clone()).collect();
        assert_eq!(messages, vec!["out 0", "out 1", "out 2"]);

        // Non-destructive: a second scan sees the same entries.
        assert_eq!(queue.iter_outgoing().unwrap().len(), 3);

        for qm in &first_scan {
            queue.delete_outgoing(&qm.path).unwrap();
        }
        assert!(queue.iter_outgoing().unwrap().is_empty());
    }
}
