use img2sd_core::Error;
use img2sd_core::monitor::{DeviceSource, DeviceState, Flasher, Monitor, MonitorConfig};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn dev(name: &str) -> PathBuf {
    PathBuf::from(format!("/dev/{name}"))
}

/// A poll source whose device list the test sets directly.
#[derive(Default)]
struct FakeSource {
    present: Mutex<Vec<PathBuf>>,
}

impl FakeSource {
    fn set(&self, devices: &[&str]) {
        *self.present.lock().unwrap() = devices.iter().map(|d| dev(d)).collect();
    }
}

impl DeviceSource for FakeSource {
    fn devices(&self) -> img2sd_core::Result<Vec<PathBuf>> {
        Ok(self.present.lock().unwrap().clone())
    }
}

/// Counts flashes per device; devices named in `failing` fail.
#[derive(Default)]
struct CountingFlasher {
    calls: Mutex<HashMap<PathBuf, usize>>,
    failing: Vec<PathBuf>,
}

impl CountingFlasher {
    fn calls(&self, device: &Path) -> usize {
        self.calls.lock().unwrap().get(device).copied().unwrap_or(0)
    }
}

impl Flasher for CountingFlasher {
    fn flash(&self, device: &Path) -> img2sd_core::Result<()> {
        *self.calls.lock().unwrap().entry(device.to_path_buf()).or_default() += 1;
        if self.failing.iter().any(|d| d == device) {
            return Err(Error::VerifyFailed {
                name: "boot".to_string(),
                device: device.to_path_buf(),
            });
        }
        Ok(())
    }
}

fn monitor() -> Monitor {
    Monitor::new(MonitorConfig::default(), Arc::new(AtomicBool::new(true)))
}

#[test]
fn new_device_is_queued_once_and_completed() {
    let monitor = monitor();
    let source = FakeSource::default();
    let flasher = CountingFlasher::default();

    source.set(&["sdb"]);
    let diff = monitor.tick(&source).unwrap();
    assert_eq!(diff.appeared, vec![dev("sdb")]);
    assert_eq!(monitor.state_of(&dev("sdb")), DeviceState::Queued);

    monitor.tick(&source).unwrap();
    assert_eq!(monitor.status().queued, vec![dev("sdb")]);

    assert_eq!(monitor.dispatch_next(&flasher), Some((dev("sdb"), true)));
    assert_eq!(monitor.dispatch_next(&flasher), None);
    assert_eq!(monitor.state_of(&dev("sdb")), DeviceState::Completed);
}

#[test]
fn completed_device_is_not_reflashed_until_removed() {
    let monitor = monitor();
    let source = FakeSource::default();
    let flasher = CountingFlasher::default();

    source.set(&["sdb"]);
    monitor.tick(&source).unwrap();
    monitor.dispatch_next(&flasher);

    monitor.tick(&source).unwrap();
    assert_eq!(monitor.dispatch_next(&flasher), None);

    source.set(&[]);
    let diff = monitor.tick(&source).unwrap();
    assert_eq!(diff.disappeared, vec![dev("sdb")]);
    assert_eq!(monitor.state_of(&dev("sdb")), DeviceState::Unknown);

    source.set(&["sdb"]);
    monitor.tick(&source).unwrap();
    assert_eq!(monitor.dispatch_next(&flasher), Some((dev("sdb"), true)));
    assert_eq!(flasher.calls(&dev("sdb")), 2);
}

#[test]
fn failure_is_tracked_per_device() {
    let monitor = monitor();
    let source = FakeSource::default();
    let flasher = CountingFlasher {
        failing: vec![dev("sdc")],
        ..CountingFlasher::default()
    };

    source.set(&["sdb", "sdc"]);
    monitor.tick(&source).unwrap();
    while monitor.dispatch_next(&flasher).is_some() {}

    let status = monitor.status();
    assert_eq!(status.completed, vec![dev("sdb")]);
    assert_eq!(status.failed, vec![dev("sdc")]);
    assert!(status.to_string().contains("failed: /dev/sdc"));

    monitor.tick(&source).unwrap();
    assert_eq!(monitor.dispatch_next(&flasher), None);
}

#[test]
fn device_removed_while_queued_is_dropped_from_the_queue() {
    let monitor = monitor();
    let source = FakeSource::default();

    source.set(&["sdb"]);
    monitor.tick(&source).unwrap();
    source.set(&[]);
    monitor.tick(&source).unwrap();

    assert_eq!(monitor.dispatch_next(&CountingFlasher::default()), None);
}

/// Blocks inside `flash` until the test releases it.
struct GatedFlasher {
    started: Mutex<Sender<PathBuf>>,
    release: Mutex<Receiver<()>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Flasher for GatedFlasher {
    fn flash(&self, device: &Path) -> img2sd_core::Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.started.lock().unwrap().send(device.to_path_buf()).unwrap();
        self.release.lock().unwrap().recv().unwrap();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(10));
    }
}

fn gated() -> (Arc<GatedFlasher>, Receiver<PathBuf>, Sender<()>) {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let flasher = Arc::new(GatedFlasher {
        started: Mutex::new(started_tx),
        release: Mutex::new(release_rx),
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
    });
    (flasher, started_rx, release_tx)
}

#[test]
fn card_swapped_during_flash_gets_its_own_flash() {
    let config = MonitorConfig {
        queue_wait: Duration::from_millis(20),
        ..MonitorConfig::default()
    };
    let monitor = Monitor::new(config, Arc::new(AtomicBool::new(true)));
    let source = FakeSource::default();
    let (flasher, started, release) = gated();
    monitor.start(flasher.clone()).unwrap();

    source.set(&["sdb"]);
    monitor.tick(&source).unwrap();
    assert_eq!(started.recv_timeout(Duration::from_secs(5)).unwrap(), dev("sdb"));

    // The first card is pulled and another one lands on the same path.
    source.set(&[]);
    monitor.tick(&source).unwrap();
    source.set(&["sdb"]);
    monitor.tick(&source).unwrap();
    assert_eq!(monitor.state_of(&dev("sdb")), DeviceState::Active);
    assert!(monitor.status().queued.is_empty());

    // The old session's result is dropped and the new card is flashed.
    release.send(()).unwrap();
    assert_eq!(started.recv_timeout(Duration::from_secs(5)).unwrap(), dev("sdb"));
    assert_eq!(monitor.state_of(&dev("sdb")), DeviceState::Active);
    assert!(monitor.status().completed.is_empty());

    release.send(()).unwrap();
    wait_for(|| monitor.state_of(&dev("sdb")) == DeviceState::Completed);
    assert!(started.recv_timeout(Duration::from_millis(100)).is_err());

    monitor.stop();
}

#[test]
fn removal_during_flash_forgets_the_result() {
    let config = MonitorConfig {
        queue_wait: Duration::from_millis(20),
        ..MonitorConfig::default()
    };
    let monitor = Monitor::new(config, Arc::new(AtomicBool::new(true)));
    let source = FakeSource::default();
    let (flasher, started, release) = gated();
    monitor.start(flasher).unwrap();

    source.set(&["sdb"]);
    monitor.tick(&source).unwrap();
    started.recv_timeout(Duration::from_secs(5)).unwrap();
    source.set(&[]);
    monitor.tick(&source).unwrap();

    release.send(()).unwrap();
    wait_for(|| monitor.status().active.is_empty());
    assert_eq!(monitor.state_of(&dev("sdb")), DeviceState::Unknown);

    monitor.stop();
}

#[test]
fn workers_flash_different_devices_concurrently() {
    let config = MonitorConfig {
        workers: 2,
        queue_wait: Duration::from_millis(20),
        ..MonitorConfig::default()
    };
    let monitor = Monitor::new(config, Arc::new(AtomicBool::new(true)));
    let source = FakeSource::default();
    let (flasher, started, release) = gated();
    monitor.start(flasher.clone()).unwrap();

    source.set(&["sdb", "sdc"]);
    monitor.tick(&source).unwrap();
    let mut seen = vec![
        started.recv_timeout(Duration::from_secs(5)).unwrap(),
        started.recv_timeout(Duration::from_secs(5)).unwrap(),
    ];
    seen.sort();
    assert_eq!(seen, vec![dev("sdb"), dev("sdc")]);
    assert_eq!(flasher.max_in_flight.load(Ordering::SeqCst), 2);

    release.send(()).unwrap();
    release.send(()).unwrap();
    wait_for(|| monitor.status().completed.len() == 2);
    monitor.stop();
}

#[test]
fn stop_prevents_new_dequeues() {
    let running = Arc::new(AtomicBool::new(true));
    let config = MonitorConfig {
        queue_wait: Duration::from_millis(20),
        ..MonitorConfig::default()
    };
    let monitor = Monitor::new(config, running.clone());
    let source = FakeSource::default();
    let (flasher, started, release) = gated();
    monitor.start(flasher).unwrap();

    source.set(&["sdb"]);
    monitor.tick(&source).unwrap();
    started.recv_timeout(Duration::from_secs(5)).unwrap();

    source.set(&["sdb", "sdc"]);
    monitor.tick(&source).unwrap();
    running.store(false, Ordering::SeqCst);

    // The in-flight session is allowed to finish.
    release.send(()).unwrap();
    monitor.stop();

    assert!(started.try_recv().is_err());
    assert_eq!(monitor.state_of(&dev("sdb")), DeviceState::Completed);
    assert_eq!(monitor.state_of(&dev("sdc")), DeviceState::Queued);
}

#[test]
fn run_returns_once_stopped() {
    let running = Arc::new(AtomicBool::new(true));
    let config = MonitorConfig {
        poll_interval: Duration::from_millis(10),
        ..MonitorConfig::default()
    };
    let monitor = Arc::new(Monitor::new(config, running.clone()));
    let source = Arc::new(FakeSource::default());
    source.set(&["sdb"]);

    let handle = {
        let monitor = Arc::clone(&monitor);
        let source = Arc::clone(&source);
        thread::spawn(move || monitor.run(source.as_ref()))
    };
    wait_for(|| monitor.state_of(&dev("sdb")) == DeviceState::Queued);
    running.store(false, Ordering::SeqCst);
    handle.join().unwrap();
}
