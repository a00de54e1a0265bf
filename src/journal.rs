use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};

use crate::model::Event;
use crate::wal::Wal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalError(pub String);

impl std::fmt::Display for JournalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "journal error: {}", self.0)
    }
}

impl std::error::Error for JournalError {}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("journal writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(ref e) = result {
        tracing::error!("journal flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush so partially buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Cloneable handle to the durable event log shared by every stateful component.
///
/// Writers hold a [`Journal::permit`] from before they take any component lock
/// until their event is applied in memory. Compaction takes
/// [`Journal::exclusive`], so the snapshot it writes never misses an event
/// that is already in the log.
#[derive(Clone)]
pub struct Journal {
    tx: mpsc::Sender<WalCommand>,
    gate: Arc<RwLock<()>>,
}

impl Journal {
    /// Replay the log at `path`, then start the group-commit writer.
    /// Must be called from within a tokio runtime.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let events = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, rx));
        tracing::info!("journal {} replayed {} events", path.display(), events.len());
        Ok((
            Self {
                tx,
                gate: Arc::new(RwLock::new(())),
            },
            events,
        ))
    }

    /// Shared permit for one append-then-apply sequence.
    pub async fn permit(&self) -> OwnedRwLockReadGuard<()> {
        self.gate.clone().read_owned().await
    }

    /// Waits for in-flight writers to finish and blocks new ones.
    pub async fn exclusive(&self) -> OwnedRwLockWriteGuard<()> {
        self.gate.clone().write_owned().await
    }

    /// Durably append one event. Returns once the batch containing it is fsynced.
    pub async fn append(&self, event: &Event) -> Result<(), JournalError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| JournalError("writer shut down".into()))?;
        rx.await
            .map_err(|_| JournalError("writer dropped response".into()))?
            .map_err(|e| JournalError(e.to_string()))
    }

    /// Replace the log with `events`, a snapshot recreating current state.
    pub async fn compact(&self, events: Vec<Event>) -> Result<(), JournalError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| JournalError("writer shut down".into()))?;
        rx.await
            .map_err(|_| JournalError("writer dropped response".into()))?
            .map_err(|e| JournalError(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn test_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("parkd_test_journal");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn setting(i: usize) -> Event {
        Event::SettingChanged {
            key: format!("k{i}"),
            value: Some(i.to_string()),
        }
    }

    #[tokio::test]
    async fn concurrent_appends_all_persist() {
        let path = test_path("concurrent.wal");
        let (journal, replayed) = Journal::open(&path).unwrap();
        assert!(replayed.is_empty());
        let journal = Arc::new(journal);

        let mut handles = Vec::new();
        for i in 0..50 {
            let j = journal.clone();
            handles.push(tokio::spawn(async move { j.append(&setting(i)).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(journal.appends_since_compact().await, 50);
        assert_eq!(Wal::replay(&path).unwrap().len(), 50);
    }

    #[tokio::test]
    async fn compact_resets_counter_and_contents() {
        let path = test_path("compact.wal");
        let (journal, _) = Journal::open(&path).unwrap();
        for i in 0..5 {
            journal.append(&setting(i)).await.unwrap();
        }
        journal.compact(vec![setting(4)]).await.unwrap();
        assert_eq!(journal.appends_since_compact().await, 0);
        assert_eq!(Wal::replay(&path).unwrap(), vec![setting(4)]);
    }

    #[tokio::test]
    async fn exclusive_waits_for_permits() {
        let path = test_path("gate.wal");
        let (journal, _) = Journal::open(&path).unwrap();
        let permit = journal.permit().await;

        let j = journal.clone();
        let waiter = tokio::spawn(async move {
            let _x = j.exclusive().await;
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(permit);
        waiter.await.unwrap();
    }
}
