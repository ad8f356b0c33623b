//! Scan lifecycle controller
//!
//! Owns the end-to-end scan: a dedicated worker thread runs the
//! MftReader → TreeBuilder pipeline sequentially, while the controlling
//! thread delivers suspend/resume/cancel requests that the worker
//! checks at record boundaries. Suspension never lands mid-record, and
//! cancellation is cooperative: the worker finishes the current record,
//! releases the volume handle, discards the partial tree, and only then
//! reports `Cancelled`. The finished tree is published as an immutable
//! `Arc` once `Finished` is reached, so readers need no lock.

use crate::error::{MftScanError, Result};
use crate::ntfs::MftReader;
use crate::tree::{Tree, TreeBuilder};
use crate::volume::VolumeAccessor;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

/// Coarse scan state. `Finished`, `Cancelled` and `Failed` are terminal
/// until a new scan is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    NotStarted,
    Scanning,
    Suspended,
    Cancelling,
    Cancelled,
    Finished,
    Failed,
}

impl ScanState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanState::Finished | ScanState::Cancelled | ScanState::Failed
        )
    }
}

/// Coarse phase for progress reporting, independent of `ScanState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Starting,
    Started,
    Ending,
    Ended,
}

/// One transition event. Delivery is at-least-once and ordered with the
/// worker's own transition sequence; consumers treat duplicate terminal
/// events as idempotent.
#[derive(Debug, Clone)]
pub struct ScanEvent {
    pub state: ScanState,
    pub progress: ProgressState,
    pub error: Option<Arc<MftScanError>>,
    /// Record slots processed so far
    pub records_processed: u64,
}

/// Knobs the core genuinely has; aggregation thresholds are plain
/// parameters on the analysis functions instead.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Keep nodes with the hidden attribute in the tree
    pub include_hidden: bool,
    /// Keep nodes with the system attribute in the tree
    pub include_system: bool,
    /// MFT records per volume read
    pub batch_size: usize,
    /// Park the worker in `Suspended` at the first record boundary
    /// instead of scanning straight through. The scan holds its position
    /// until `resume` or `cancel`.
    pub start_suspended: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            include_hidden: true,
            include_system: true,
            batch_size: 1024,
            start_suspended: false,
        }
    }
}

/// Capacity of the event channel. Consumers that poll at UI rates have
/// ample headroom; if one stalls entirely the worker blocks at a record
/// boundary rather than queueing unbounded events.
pub const EVENT_CHANNEL_CAPACITY: usize = 4_096;

/// Pending control request, delivered asynchronously to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlRequest {
    Run,
    Suspend,
    Cancel,
}

struct Shared {
    state: Mutex<ScanState>,
    control: Mutex<ControlRequest>,
    resumed: Condvar,
    tree: Mutex<Option<Arc<Tree>>>,
    events: Sender<ScanEvent>,
}

impl Shared {
    fn transition(&self, state: ScanState, progress: ProgressState, records: u64) {
        *self.state.lock() = state;
        let _ = self.events.send(ScanEvent {
            state,
            progress,
            error: None,
            records_processed: records,
        });
    }

    fn fail(&self, err: MftScanError, records: u64) {
        error!(error = %err, "scan failed");
        *self.state.lock() = ScanState::Failed;
        let _ = self.events.send(ScanEvent {
            state: ScanState::Failed,
            progress: ProgressState::Ended,
            error: Some(Arc::new(err)),
            records_processed: records,
        });
    }
}

/// Drives scans of one volume path at a time.
pub struct ScanController {
    shared: Arc<Shared>,
    events_rx: Receiver<ScanEvent>,
    worker: Option<thread::JoinHandle<()>>,
    options: ScanOptions,
}

impl ScanController {
    pub fn new(options: ScanOptions) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ScanState::NotStarted),
                control: Mutex::new(ControlRequest::Run),
                resumed: Condvar::new(),
                tree: Mutex::new(None),
                events: events_tx,
            }),
            events_rx,
            worker: None,
            options,
        }
    }

    /// Current coarse state snapshot.
    pub fn state(&self) -> ScanState {
        *self.shared.state.lock()
    }

    /// Subscribe to transition events. Each event is delivered to
    /// exactly one receiver: cloned receivers compete for the stream
    /// rather than each seeing a copy, so drain from a single consumer
    /// and fan out from there if several parties need every event.
    pub fn events(&self) -> Receiver<ScanEvent> {
        self.events_rx.clone()
    }

    /// The finished tree, available only once `Finished` is reached.
    pub fn tree(&self) -> Option<Arc<Tree>> {
        self.shared.tree.lock().clone()
    }

    /// Start scanning `volume_path` on the worker thread. Valid from
    /// `NotStarted` or any terminal state; a restart discards the
    /// previous tree and transitions back through `NotStarted`.
    pub fn start<P: Into<PathBuf>>(&mut self, volume_path: P) -> Result<()> {
        {
            let state = self.shared.state.lock();
            if !(*state == ScanState::NotStarted || state.is_terminal()) {
                return Err(MftScanError::ScanInProgress);
            }
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        *self.shared.tree.lock() = None;
        *self.shared.control.lock() = if self.options.start_suspended {
            ControlRequest::Suspend
        } else {
            ControlRequest::Run
        };
        // Both transitions happen on the caller's thread, so the state
        // is `Scanning` before this returns and a second `start` is
        // rejected without racing the worker's startup.
        self.shared
            .transition(ScanState::NotStarted, ProgressState::Starting, 0);
        self.shared
            .transition(ScanState::Scanning, ProgressState::Starting, 0);

        let shared = self.shared.clone();
        let options = self.options.clone();
        let path = volume_path.into();

        let worker = thread::Builder::new()
            .name("mftscan-worker".into())
            .spawn(move || run_scan(shared, path, options))
            .map_err(|e| {
                *self.shared.state.lock() = ScanState::Failed;
                MftScanError::Io(e)
            })?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Request suspension at the next record boundary. No-op unless
    /// currently scanning.
    pub fn suspend(&self) {
        let state = *self.shared.state.lock();
        if state != ScanState::Scanning {
            return;
        }
        let mut control = self.shared.control.lock();
        if *control == ControlRequest::Run {
            *control = ControlRequest::Suspend;
        }
    }

    /// Resume a suspended scan.
    pub fn resume(&self) {
        let mut control = self.shared.control.lock();
        if *control == ControlRequest::Suspend {
            *control = ControlRequest::Run;
            self.shared.resumed.notify_all();
        }
    }

    /// Request cancellation. Idempotent: repeated calls while the scan
    /// unwinds produce exactly one `Cancelled` transition.
    pub fn cancel(&self) {
        let state = *self.shared.state.lock();
        match state {
            ScanState::NotStarted => {
                // No worker to unwind; complete the transition inline.
                self.shared
                    .transition(ScanState::Cancelling, ProgressState::Ended, 0);
                self.shared
                    .transition(ScanState::Cancelled, ProgressState::Ended, 0);
            }
            ScanState::Scanning | ScanState::Suspended => {
                let mut control = self.shared.control.lock();
                if *control != ControlRequest::Cancel {
                    *control = ControlRequest::Cancel;
                    self.shared.resumed.notify_all();
                }
            }
            // Already unwinding or terminal.
            ScanState::Cancelling
            | ScanState::Cancelled
            | ScanState::Finished
            | ScanState::Failed => {}
        }
    }

    /// Block until the current scan's worker exits.
    pub fn wait(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Default for ScanController {
    fn default() -> Self {
        Self::new(ScanOptions::default())
    }
}

impl Drop for ScanController {
    fn drop(&mut self) {
        self.cancel();
        self.wait();
    }
}

/// Outcome of a record-boundary checkpoint.
enum Checkpoint {
    Continue,
    Cancelled,
}

/// Honor any pending control request. Blocks while suspended; emits the
/// `Suspended`/`Scanning` transitions from the worker so event order
/// matches the worker's own sequence.
fn checkpoint(shared: &Shared, records: u64) -> Checkpoint {
    let mut control = shared.control.lock();
    loop {
        match *control {
            ControlRequest::Run => return Checkpoint::Continue,
            ControlRequest::Cancel => return Checkpoint::Cancelled,
            ControlRequest::Suspend => {
                info!(records, "scan suspended");
                shared.transition(ScanState::Suspended, ProgressState::Started, records);
                while *control == ControlRequest::Suspend {
                    shared.resumed.wait(&mut control);
                }
                if *control == ControlRequest::Run {
                    info!(records, "scan resumed");
                    shared.transition(ScanState::Scanning, ProgressState::Started, records);
                }
            }
        }
    }
}

fn cancelled(shared: &Shared, records: u64) {
    shared.transition(ScanState::Cancelling, ProgressState::Ended, records);
    // VolumeAccessor and the partial tree are dropped by the caller's
    // scope before this function runs; nothing is left to release.
    shared.transition(ScanState::Cancelled, ProgressState::Ended, records);
    info!(records, "scan cancelled");
}

/// Worker entry point: open, stream, build, publish.
fn run_scan(shared: Arc<Shared>, path: PathBuf, options: ScanOptions) {
    // `start` already emitted the `Scanning`/`Starting` transition.
    let volume = match VolumeAccessor::open(&path) {
        Ok(volume) => volume,
        Err(e) => return shared.fail(e, 0),
    };

    let outcome = scan_volume(&shared, &volume, &options);
    // `volume` drops here on every path: finish, cancel, or failure.
    drop(volume);

    match outcome {
        ScanOutcome::Finished(tree, records) => {
            info!(
                files = tree.stats.total_files,
                directories = tree.stats.total_directories,
                corrupt = tree.stats.corrupt_records,
                orphans = tree.stats.orphaned_nodes,
                "scan finished"
            );
            *shared.tree.lock() = Some(Arc::new(tree));
            shared.transition(ScanState::Finished, ProgressState::Ended, records);
        }
        ScanOutcome::Cancelled(records) => cancelled(&shared, records),
        ScanOutcome::Failed(err, records) => shared.fail(err, records),
    }
}

enum ScanOutcome {
    Finished(Tree, u64),
    Cancelled(u64),
    Failed(MftScanError, u64),
}

fn scan_volume(shared: &Shared, volume: &VolumeAccessor, options: &ScanOptions) -> ScanOutcome {
    let mut reader = match MftReader::new(volume, options.batch_size) {
        Ok(reader) => reader,
        Err(e) => return ScanOutcome::Failed(e, 0),
    };

    shared.transition(ScanState::Scanning, ProgressState::Started, 0);

    // Capacity is a pre-allocation hint only; an adversarial record 0 is
    // rejected by the reader, but cap it anyway so the hint stays sane.
    let mut builder = TreeBuilder::with_capacity((reader.total_records() as usize).min(1 << 20));
    let mut records = 0u64;

    loop {
        if let Checkpoint::Cancelled = checkpoint(shared, records) {
            return ScanOutcome::Cancelled(records);
        }

        match reader.next() {
            None => break,
            Some(Ok(node)) => {
                records = reader.position();
                if !options.include_hidden && node.is_hidden() {
                    continue;
                }
                if !options.include_system && node.is_system() {
                    continue;
                }
                builder.insert(node);
            }
            Some(Err(e)) if e.is_recoverable() => {
                records = reader.position();
                warn!(error = %e, "skipping record");
                builder.note_corrupt_record();
            }
            Some(Err(e)) => return ScanOutcome::Failed(e, records),
        }
    }

    // Last chance to honor a cancel that raced the end of the stream.
    if let Checkpoint::Cancelled = checkpoint(shared, records) {
        return ScanOutcome::Cancelled(records);
    }

    shared.transition(ScanState::Scanning, ProgressState::Ending, records);
    ScanOutcome::Finished(builder.finish(), records)
}
