//! Background replication consumer.
//!
//! Polls a [`ReplicationSlot`] on its own thread and hands each committed
//! transaction to a [`ReplicationHandler`]. The cursor is flushed after every
//! fully handled batch. When the handler fails the slot is rewound to the
//! last flushed position, so delivery is at-least-once: a batch that failed
//! half way is delivered again from its first message.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::config::Config;
use crate::error::{GraphError, GraphResult};
use crate::replication::{ReplicationMessage, ReplicationSlot};

const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// Receives committed transactions in commit order.
pub trait ReplicationHandler: Send + 'static {
    fn handle(&mut self, message: &ReplicationMessage) -> GraphResult<()>;
}

impl<F> ReplicationHandler for F
where
    F: FnMut(&ReplicationMessage) -> GraphResult<()> + Send + 'static,
{
    fn handle(&mut self, message: &ReplicationMessage) -> GraphResult<()> {
        self(message)
    }
}

/// Handle to a running consumer thread. Dropping it stops the thread.
pub struct ConsumerHandle {
    shutdown: Arc<AtomicBool>,
    delivered: Arc<AtomicU64>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ConsumerHandle {
    /// Stop the thread and wait for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Messages handled and flushed so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ReplicationSlot {
    /// Start a thread that feeds this slot into `handler`.
    pub fn spawn_consumer<H: ReplicationHandler>(self: &Arc<Self>, handler: H, config: &Config) -> GraphResult<ConsumerHandle> {
        let flushed = self.last_lsn()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let delivered = Arc::new(AtomicU64::new(0));

        let worker = Consumer {
            slot: Arc::clone(self),
            handler,
            batch: vec![ReplicationMessage::default(); config.replication_batch_size.max(1)],
            interval: config.replication_poll_interval,
            flushed,
            shutdown: Arc::clone(&shutdown),
            delivered: Arc::clone(&delivered),
        };

        let thread = thread::Builder::new()
            .name(format!("graphfs-repl-{}", self.name()))
            .spawn(move || worker.run())
            .map_err(|e| GraphError::Io {
                path: Some(self.journal().dir().to_path_buf()),
                kind: e.kind(),
                message: format!("failed to spawn replication consumer: {}", e),
            })?;

        Ok(ConsumerHandle {
            shutdown,
            delivered,
            thread: Some(thread),
        })
    }
}

struct Consumer<H> {
    slot: Arc<ReplicationSlot>,
    handler: H,
    batch: Vec<ReplicationMessage>,
    interval: Duration,
    flushed: u64,
    shutdown: Arc<AtomicBool>,
    delivered: Arc<AtomicU64>,
}

impl<H: ReplicationHandler> Consumer<H> {
    fn run(mut self) {
        debug!(slot = %self.slot.name(), from = self.flushed, "replication consumer started");
        while !self.stopping() {
            match self.poll_once() {
                Ok(0) => self.pause(),
                Ok(_) => {}
                Err(GraphError::Closed(_)) => break,
                Err(err) => {
                    error!(slot = %self.slot.name(), error = %err, "replication poll failed");
                    self.pause();
                }
            }
        }
        debug!(slot = %self.slot.name(), "replication consumer stopped");
    }

    fn poll_once(&mut self) -> GraphResult<usize> {
        let n = self.slot.read(&mut self.batch)?;
        if n == 0 {
            return Ok(0);
        }

        for message in &self.batch[..n] {
            if let Err(err) = self.handler.handle(message) {
                error!(slot = %self.slot.name(), xid = message.xid, error = %err, "replication handler failed; rewinding");
                self.slot.set_last_lsn(self.flushed)?;
                // Back off before redelivering the batch.
                return Ok(0);
            }
        }

        self.slot.flush_position()?;
        self.flushed = self.slot.last_lsn()?;
        self.delivered.fetch_add(n as u64, Ordering::AcqRel);
        Ok(n)
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn pause(&self) {
        let wake = Instant::now() + self.interval;
        while Instant::now() < wake {
            if self.stopping() {
                return;
            }
            thread::sleep(SHUTDOWN_POLL.min(self.interval));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use crate::kv::KvStore;
    use crate::record::{JournalEntry, JournalOp};
    use crate::replication::{ReplicationManager, ReplicationSlotOptions};
    use parking_lot::Mutex;
    use tempfile::TempDir;

    fn commit_one(journal: &Journal) -> u64 {
        let mut begin = JournalEntry::new(JournalOp::Begin);
        journal.write(&mut begin).unwrap();
        let mut commit = JournalEntry { xid: begin.xid, ..JournalEntry::new(JournalOp::Commit) };
        journal.write(&mut commit).unwrap();
        begin.xid
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for consumer");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_consumer_delivers_in_commit_order_and_flushes() {
        let dir = TempDir::new().unwrap();
        let config = Config::relaxed();
        let journal = Arc::new(Journal::open(dir.path().join("journal"), config.clone()).unwrap());
        let metadata = Arc::new(KvStore::open(dir.path().join("metadata"), config.clone()).unwrap());
        let manager = ReplicationManager::new(Arc::clone(&journal), Arc::clone(&metadata));
        let slot = manager.create_slot(ReplicationSlotOptions::persistent("c")).unwrap();

        let expected: Vec<u64> = (0..3).map(|_| commit_one(&journal)).collect();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let consumer = slot
            .spawn_consumer(
                move |m: &ReplicationMessage| {
                    sink.lock().push(m.xid);
                    Ok(())
                },
                &config,
            )
            .unwrap();

        wait_for(|| consumer.delivered() == 3);
        assert!(consumer.is_running());
        consumer.shutdown();
        assert_eq!(*seen.lock(), expected);
        assert_eq!(slot.last_lsn().unwrap(), journal.head());
    }

    #[test]
    fn test_handler_failure_redelivers() {
        let dir = TempDir::new().unwrap();
        let config = Config::relaxed();
        let journal = Arc::new(Journal::open(dir.path().join("journal"), config.clone()).unwrap());
        let metadata = Arc::new(KvStore::in_memory());
        let manager = ReplicationManager::new(Arc::clone(&journal), metadata);
        let slot = manager.create_slot(ReplicationSlotOptions::transient("r")).unwrap();
        let xid = commit_one(&journal);

        let attempts = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&attempts);
        let consumer = slot
            .spawn_consumer(
                move |m: &ReplicationMessage| {
                    assert_eq!(m.xid, xid);
                    if counter.fetch_add(1, Ordering::AcqRel) == 0 {
                        return Err(GraphError::InvalidArgument("first delivery refused".into()));
                    }
                    Ok(())
                },
                &config,
            )
            .unwrap();

        wait_for(|| consumer.delivered() == 1);
        assert_eq!(attempts.load(Ordering::Acquire), 2);
    }

    #[test]
    fn test_consumer_exits_when_slot_closes() {
        let dir = TempDir::new().unwrap();
        let config = Config::relaxed();
        let journal = Arc::new(Journal::open(dir.path().join("journal"), config.clone()).unwrap());
        let manager = ReplicationManager::new(journal, Arc::new(KvStore::in_memory()));
        let slot = manager.create_slot(ReplicationSlotOptions::transient("x")).unwrap();
        let consumer = slot.spawn_consumer(|_: &ReplicationMessage| Ok(()), &config).unwrap();

        manager.close().unwrap();
        wait_for(|| !consumer.is_running());
    }
}
