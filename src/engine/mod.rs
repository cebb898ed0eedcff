mod conflict;
mod error;
mod ledger;
mod mutations;
mod promotion;
mod queries;
mod reservations;
mod store;
mod waitlist;

pub use error::EngineError;
pub use ledger::CapacityLedger;
pub use reservations::ReservationStore;
pub use store::ResourceState;
pub use waitlist::WaitlistQueue;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineSettings;
use crate::model::*;
use crate::notify::{NotifyHub, notifications_for};
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
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
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => batch.push((event, response)),
                        other => {
                            deferred = Some(other);
                            break;
                        }
                    }
                }
                flush_and_respond(&mut wal, batch);
                // A compaction queued behind appends runs only after they are durable
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so the partial buffer does not leak
    // into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => flush_and_respond(wal, vec![(event, response)]),
    }
}

// ── Transactions ─────────────────────────────────────────

/// One atomic unit of work on a resource, applied in place under the write
/// lock. The first change saves a checkpoint of the live rows; dropping the
/// Tx without a durable commit restores it. Audit rows are never copied.
pub(super) struct Tx<'a> {
    pub work: &'a mut ResourceState,
    pub at: Ms,
    pub changes: Vec<Change>,
    undo: Option<store::Checkpoint>,
}

impl<'a> Tx<'a> {
    pub fn begin(rs: &'a mut ResourceState, at: Ms) -> Self {
        Self {
            work: rs,
            at,
            changes: Vec::new(),
            undo: None,
        }
    }

    pub fn apply(&mut self, change: Change) {
        if self.undo.is_none() && self.changes.is_empty() {
            self.undo = Some(self.work.checkpoint());
        }
        self.work.apply(&change, self.at);
        self.changes.push(change);
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if let Some(checkpoint) = self.undo.take() {
            self.work.restore(checkpoint);
        }
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedResourceState>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    clock: Arc<dyn Clock>,
    pub settings: EngineSettings,
    /// Held by resource creation and by compaction so a snapshot never
    /// misses a resource whose creation record is still in flight.
    catalog: Mutex<()>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        settings: EngineSettings,
    ) -> io::Result<Self> {
        Self::with_clock(wal_path, notify, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        settings: EngineSettings,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let resources = replay(&events);
        tracing::debug!(
            "replayed {} records into {} resources from {}",
            events.len(),
            resources.len(),
            wal_path.display()
        );

        let state = DashMap::new();
        for (id, rs) in resources {
            state.insert(id, Arc::new(RwLock::new(rs)));
        }

        Ok(Self {
            state,
            wal_tx,
            notify,
            clock,
            settings,
            catalog: Mutex::new(()),
        })
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Make a transaction durable, keep it, then notify. Nothing is written
    /// for an empty transaction; a failed append rolls the changes back.
    pub(super) async fn commit(&self, mut tx: Tx<'_>) -> Result<(), EngineError> {
        if tx.changes.is_empty() {
            return Ok(());
        }
        debug_assert_eq!(tx.work.check_invariants(), Ok(()));

        let resource_id = tx.work.id;
        let outgoing = notifications_for(resource_id, &tx.changes);
        let event = Event::Committed {
            resource_id,
            at: tx.at,
            changes: std::mem::take(&mut tx.changes),
        };
        self.wal_append(&event).await?;
        tx.undo = None;
        drop(tx);

        for n in &outgoing {
            self.notify.send(n);
        }
        Ok(())
    }
}

/// Rebuild resource state from a WAL record sequence.
fn replay(events: &[Event]) -> HashMap<Ulid, ResourceState> {
    let mut resources: HashMap<Ulid, ResourceState> = HashMap::new();
    for event in events {
        match event {
            Event::ResourceCreated {
                id,
                name,
                capacity,
                created_at,
            } => {
                resources.insert(
                    *id,
                    ResourceState::new(*id, name.clone(), *capacity, *created_at),
                );
            }
            Event::ResourceRestored(image) => {
                resources.insert(image.id, ResourceState::from_image(image.clone()));
            }
            Event::ResourceActivation { id, .. }
            | Event::Committed {
                resource_id: id, ..
            } => match resources.get_mut(id) {
                Some(rs) => store::apply_event(rs, event),
                None => tracing::warn!("replay: record for unknown resource {id}, skipped"),
            },
        }
    }
    for rs in resources.values() {
        if let Err(e) = rs.check_invariants() {
            tracing::warn!("replay: resource {} fails invariants: {e}", rs.id);
        }
    }
    resources
}
