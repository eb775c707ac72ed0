//! Flashes every removable card that gets plugged in.
//!
//! A [`Monitor`] polls a [`DeviceSource`], diffs the result against the
//! devices it already knows, and queues new ones for a pool of worker
//! threads. Each worker hands one device at a time to a [`Flasher`].
//!
//! All bookkeeping (known, queued, active, completed, failed) lives behind one
//! mutex. A device is moved into the active set in the same critical section
//! that dequeues it, so two workers can never flash the same device. Removing
//! a card forgets its terminal status; inserting it again flashes it again.
//! A card pulled during its flash gets no result, and a card inserted under
//! the same path before that flash ends is queued once the old session ends.
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::confirm::Refuse;
use crate::descriptor::PartitionRecord;
use crate::device::Target;
use crate::error::{Error, Result};
use crate::platform;
use crate::session::{FlashPolicy, FlashSession, Silent};

/// Where the monitor learns which devices are present.
pub trait DeviceSource {
    fn devices(&self) -> Result<Vec<PathBuf>>;
}

/// Removable block devices with media, from `/sys/block`.
pub struct RemovableDevices;

impl DeviceSource for RemovableDevices {
    fn devices(&self) -> Result<Vec<PathBuf>> {
        Ok(platform::get_removable_devices()?
            .into_iter()
            .map(|d| d.path)
            .collect())
    }
}

/// Flashes one device and reports only whether it worked.
pub trait Flasher: Send + Sync {
    fn flash(&self, device: &Path) -> Result<()>;
}

/// Runs a [`FlashSession`] in-process.
///
/// Nobody is at the keyboard, so every confirmation is declined: a
/// non-removable target or a verification mismatch fails the device.
pub struct SessionFlasher {
    pub records: Vec<PartitionRecord>,
    pub image_dir: PathBuf,
    pub policy: FlashPolicy,
}

impl Flasher for SessionFlasher {
    fn flash(&self, device: &Path) -> Result<()> {
        let target = Target::validate(device, self.policy.allow_non_removable, &Refuse)?;
        FlashSession::new(&target, &self.policy)
            .image_dir(&self.image_dir)
            .run(&self.records, &mut Silent)?;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    /// Number of concurrent flash workers.
    pub workers: usize,
    /// How long an idle worker waits for work before re-checking the stop flag.
    pub queue_wait: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            workers: 1,
            queue_wait: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Unknown,
    Queued,
    Active,
    Completed,
    Failed,
}

/// Devices that showed up and went away during one poll.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollDiff {
    pub appeared: Vec<PathBuf>,
    pub disappeared: Vec<PathBuf>,
}

impl PollDiff {
    pub fn is_empty(&self) -> bool {
        self.appeared.is_empty() && self.disappeared.is_empty()
    }
}

/// A snapshot of the monitor's bookkeeping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub active: Vec<PathBuf>,
    pub queued: Vec<PathBuf>,
    pub completed: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

fn join_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "None".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "active: {} | queued: {} | completed: {} | failed: {}",
            join_paths(&self.active),
            join_paths(&self.queued),
            join_paths(&self.completed),
            join_paths(&self.failed)
        )
    }
}

#[derive(Default)]
struct State {
    known: BTreeSet<PathBuf>,
    queue: VecDeque<PathBuf>,
    active: BTreeSet<PathBuf>,
    /// Active devices whose card was pulled mid-flash. Their session result
    /// belongs to the old card.
    removed_while_active: BTreeSet<PathBuf>,
    completed: BTreeSet<PathBuf>,
    failed: BTreeSet<PathBuf>,
}

impl State {
    /// Dequeues the next device and marks it active in one step.
    fn take_next(&mut self) -> Option<PathBuf> {
        while let Some(device) = self.queue.pop_front() {
            if self.active.insert(device.clone()) {
                return Some(device);
            }
            debug!("{} is already being flashed", device.display());
        }
        None
    }

    fn state_of(&self, device: &Path) -> DeviceState {
        if self.active.contains(device) {
            DeviceState::Active
        } else if self.queue.iter().any(|d| d == device) {
            DeviceState::Queued
        } else if self.completed.contains(device) {
            DeviceState::Completed
        } else if self.failed.contains(device) {
            DeviceState::Failed
        } else {
            DeviceState::Unknown
        }
    }
}

struct Shared {
    state: Mutex<State>,
    work: Condvar,
    running: Arc<AtomicBool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Blocks until a device is available or the monitor stops.
    fn next_job(&self, wait: Duration) -> Option<PathBuf> {
        let mut state = self.lock();
        loop {
            if !self.is_running() {
                return None;
            }
            if let Some(device) = state.take_next() {
                return Some(device);
            }
            state = self
                .work
                .wait_timeout(state, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn flash(&self, flasher: &dyn Flasher, device: &Path) -> bool {
        info!("Starting flash of {}", device.display());
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| flasher.flash(device)));
        let ok = match outcome {
            Ok(Ok(())) => {
                info!("✓ Successfully flashed {}", device.display());
                true
            }
            Ok(Err(e)) => {
                error!("✗ Failed to flash {}: {e}", device.display());
                false
            }
            Err(_) => {
                error!("✗ Flash worker panicked on {}", device.display());
                false
            }
        };
        self.finish(device, ok);
        ok
    }

    fn finish(&self, device: &Path, ok: bool) {
        let mut state = self.lock();
        state.active.remove(device);
        if state.removed_while_active.remove(device) {
            if state.known.contains(device) {
                info!(
                    "{} was swapped while flashing; flashing the new card",
                    device.display()
                );
                state.queue.push_back(device.to_path_buf());
                self.work.notify_one();
            } else {
                info!(
                    "{} was removed while flashing; its result is not kept",
                    device.display()
                );
            }
            return;
        }
        if ok {
            state.completed.insert(device.to_path_buf());
        } else {
            state.failed.insert(device.to_path_buf());
        }
    }
}

/// Tracks devices and dispatches them to flash workers.
pub struct Monitor {
    shared: Arc<Shared>,
    config: MonitorConfig,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Monitor {
    /// Creates an idle monitor. Clearing `running` stops polling and prevents
    /// workers from taking new devices.
    pub fn new(config: MonitorConfig, running: Arc<AtomicBool>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                work: Condvar::new(),
                running,
            }),
            config,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the worker pool.
    pub fn start(&self, flasher: Arc<dyn Flasher>) -> Result<()> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for id in 0..self.config.workers.max(1) {
            let shared = Arc::clone(&self.shared);
            let flasher = Arc::clone(&flasher);
            let wait = self.config.queue_wait;
            let handle = thread::Builder::new()
                .name(format!("flash-worker-{id}"))
                .spawn(move || {
                    debug!("Worker {id} started");
                    while let Some(device) = shared.next_job(wait) {
                        shared.flash(flasher.as_ref(), &device);
                    }
                    debug!("Worker {id} stopped");
                })
                .map_err(Error::Io)?;
            workers.push(handle);
        }
        Ok(())
    }

    /// Applies one observation of the present devices.
    pub fn observe(&self, current: &[PathBuf]) -> PollDiff {
        let current: BTreeSet<PathBuf> = current.iter().cloned().collect();
        let mut state = self.shared.lock();
        let mut diff = PollDiff::default();

        let appeared: Vec<PathBuf> = current.difference(&state.known).cloned().collect();
        for device in appeared {
            info!("New SD card detected: {}", device.display());
            state.known.insert(device.clone());
            if state.state_of(&device) == DeviceState::Unknown {
                state.queue.push_back(device.clone());
                self.shared.work.notify_one();
            }
            diff.appeared.push(device);
        }

        let disappeared: Vec<PathBuf> = state.known.difference(&current).cloned().collect();
        for device in disappeared {
            info!("SD card removed: {}", device.display());
            state.known.remove(&device);
            if state.active.contains(&device) {
                state.removed_while_active.insert(device.clone());
            }
            state.completed.remove(&device);
            state.failed.remove(&device);
            state.queue.retain(|d| d != &device);
            diff.disappeared.push(device);
        }

        diff
    }

    /// Polls `source` once, updates the queue, and logs the status.
    pub fn tick(&self, source: &dyn DeviceSource) -> Result<PollDiff> {
        let devices = source.devices()?;
        let diff = self.observe(&devices);
        let status = self.status();
        if diff.is_empty() {
            debug!("{status}");
        } else {
            info!("{status}");
        }
        Ok(diff)
    }

    /// Polls until the running flag is cleared.
    ///
    /// A failed poll is logged and retried on the next cycle.
    pub fn run(&self, source: &dyn DeviceSource) {
        info!("Monitoring for SD cards every {:?}", self.config.poll_interval);
        while self.shared.is_running() {
            if let Err(e) = self.tick(source) {
                warn!("Error getting SD card list: {e}");
            }
            self.sleep(self.config.poll_interval);
        }
    }

    fn sleep(&self, duration: Duration) {
        let step = Duration::from_millis(100);
        let mut slept = Duration::ZERO;
        while slept < duration && self.shared.is_running() {
            let nap = step.min(duration - slept);
            thread::sleep(nap);
            slept += nap;
        }
    }

    /// Takes the next queued device and flashes it on the calling thread.
    ///
    /// Returns `None` when nothing is queued.
    pub fn dispatch_next(&self, flasher: &dyn Flasher) -> Option<(PathBuf, bool)> {
        let device = self.shared.lock().take_next()?;
        let ok = self.shared.flash(flasher, &device);
        Some((device, ok))
    }

    /// Stops taking work and waits for running sessions to finish.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.work.notify_all();
        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("A flash worker exited abnormally");
            }
        }
    }

    pub fn state_of(&self, device: &Path) -> DeviceState {
        self.shared.lock().state_of(device)
    }

    pub fn status(&self) -> Status {
        let state = self.shared.lock();
        Status {
            active: state.active.iter().cloned().collect(),
            queued: state.queue.iter().cloned().collect(),
            completed: state.completed.iter().cloned().collect(),
            failed: state.failed.iter().cloned().collect(),
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}
