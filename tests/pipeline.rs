use std::thread;
use std::time::{Duration, Instant};

use camstream::capture::fake::{FakeDriver, FakeEvent, FakeFeed};
use camstream::capture::PixelFormat;
use camstream::error::{SinkError, SourceError};
use camstream::sink::MemoryLauncher;
use camstream::{CaptureError, Config, SessionState, StreamManager};

const SERIAL: &str = "24750353";

fn test_config(width: u32, height: u32, pace_fps: u32) -> Config {
    let mut config = Config::default();
    config.capture.serial = SERIAL.into();
    config.capture.width = width;
    config.capture.height = height;
    config.capture.output_format = PixelFormat::Bgr24;
    config.capture.pace_fps = pace_fps;
    config.capture.grab_timeout_ms = 50;
    config.capture.open_attempts = 5;
    config.capture.open_backoff_ms = 0;
    config.encoder.output = "memory-{serial}.raw".into();
    config
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn pixel(n: u8) -> Vec<u8> {
    vec![n, n.wrapping_add(1), n.wrapping_add(2)]
}

#[test]
fn frames_reach_sink_in_order_despite_grab_errors() {
    let events = vec![
        FakeEvent::frame(pixel(10)),
        FakeEvent::Fail {
            code: 0xE100_0014,
            description: "incomplete buffer".into(),
        },
        FakeEvent::frame(pixel(20)),
        FakeEvent::Timeout,
        FakeEvent::frame(pixel(30)),
        FakeEvent::Fail {
            code: 0xE100_0014,
            description: "incomplete buffer".into(),
        },
        FakeEvent::Fail {
            code: 0xE100_0015,
            description: "payload missing".into(),
        },
        FakeEvent::frame(pixel(40)),
    ];
    let driver = FakeDriver::new().with_device(SERIAL, FakeFeed::script(events));
    let launcher = MemoryLauncher::new();
    let recording = launcher.recording();
    let manager = StreamManager::new(driver, launcher, test_config(1, 1, 0));

    manager.start(SERIAL).unwrap();
    wait_until("four frames", || recording.frames() == 4);
    let report = manager.stop(SERIAL).unwrap().unwrap();

    let expected: Vec<u8> = [10, 20, 30, 40].into_iter().flat_map(pixel).collect();
    assert_eq!(recording.bytes(), expected);
    assert_eq!(report.stats.frames_forwarded, 4);
    assert_eq!(report.stats.grab_failures, 3);
    assert!(report.stats.grab_timeouts >= 1);
    assert_eq!(report.output.to_str(), Some("memory-24750353.raw"));
}

#[test]
fn start_and_stop_are_idempotent() {
    let driver = FakeDriver::new().with_device(SERIAL, FakeFeed::script(vec![]));
    let manager = StreamManager::new(driver, MemoryLauncher::new(), test_config(1, 1, 50));

    manager.start(SERIAL).unwrap();
    manager.start(SERIAL).unwrap();
    assert_eq!(manager.active_sessions(), 1);
    assert_eq!(manager.driver().connect_attempts(), 1);
    assert_eq!(manager.state(SERIAL), SessionState::Running);

    assert!(manager.stop(SERIAL).unwrap().is_some());
    assert!(manager.stop(SERIAL).unwrap().is_none());
    assert_eq!(manager.state(SERIAL), SessionState::Idle);
    assert_eq!(manager.active_sessions(), 0);
}

#[test]
fn stop_releases_device_and_sink_for_restart() {
    let driver = FakeDriver::new().with_device(SERIAL, FakeFeed::script(vec![FakeEvent::frame(pixel(1))]));
    let launcher = MemoryLauncher::new();
    let recording = launcher.recording();
    let manager = StreamManager::new(driver, launcher, test_config(1, 1, 50));

    manager.start(SERIAL).unwrap();
    wait_until("first frame", || recording.frames() == 1);
    manager.stop(SERIAL).unwrap();

    assert_eq!(manager.driver().open_handles(), 0);
    assert_eq!(recording.finished(), 1);
    assert!(manager.get_frame(SERIAL).is_none());

    manager.start(SERIAL).unwrap();
    assert_eq!(manager.driver().open_handles(), 1);
    manager.stop(SERIAL).unwrap();
    assert_eq!(recording.sessions().len(), 2);
    assert_eq!(recording.finished(), 2);
}

#[test]
fn open_gives_up_after_retry_bound() {
    let driver = FakeDriver::new()
        .with_device(SERIAL, FakeFeed::script(vec![]))
        .failing_connects(6);
    let launcher = MemoryLauncher::new();
    let recording = launcher.recording();
    let manager = StreamManager::new(driver, launcher, test_config(1, 1, 50));

    let err = manager.start(SERIAL).unwrap_err();

    assert!(matches!(err, CaptureError::Source(SourceError::ConnectionFailed { .. })));
    assert_eq!(manager.driver().connect_attempts(), 5);
    assert_eq!(manager.driver().open_handles(), 0);
    assert_eq!(manager.state(SERIAL), SessionState::Idle);
    assert_eq!(manager.active_sessions(), 0);
    assert!(recording.sessions().is_empty());
}

#[test]
fn unknown_camera_is_not_found() {
    let driver = FakeDriver::new().with_device(SERIAL, FakeFeed::script(vec![]));
    let mut config = test_config(1, 1, 50);
    config.capture.open_attempts = 2;
    let manager = StreamManager::new(driver, MemoryLauncher::new(), config);

    let err = manager.start("00000000").unwrap_err();
    assert!(matches!(err, CaptureError::Source(SourceError::DeviceNotFound { .. })));
    assert_eq!(manager.state("00000000"), SessionState::Idle);
}

#[test]
fn broken_sink_fails_session_and_surfaces_on_stop() {
    let events = (0..10).map(|n| FakeEvent::frame(pixel(n))).collect();
    let driver = FakeDriver::new().with_device(SERIAL, FakeFeed::script(events));
    let launcher = MemoryLauncher::new().failing_after(3);
    let recording = launcher.recording();
    let manager = StreamManager::new(driver, launcher, test_config(1, 1, 0));

    manager.start(SERIAL).unwrap();
    wait_until("session failure", || !manager.failed_sessions().is_empty());

    assert_eq!(manager.state(SERIAL), SessionState::Failed);
    assert_eq!(manager.driver().open_handles(), 0);
    assert_eq!(recording.finished(), 1);

    let err = manager.stop(SERIAL).unwrap_err();
    assert!(matches!(err, CaptureError::Sink(SinkError::Write(_))));
    assert_eq!(recording.frames(), 3);
    assert_eq!(manager.state(SERIAL), SessionState::Idle);
}

#[test]
fn start_after_broken_sink_restarts_recording() {
    let feed = FakeFeed::cadence(Duration::from_millis(2), None, 1, 1);
    let driver = FakeDriver::new().with_device(SERIAL, feed);
    let launcher = MemoryLauncher::new().failing_after(2);
    let recording = launcher.recording();
    let manager = StreamManager::new(driver, launcher, test_config(1, 1, 0));

    manager.start(SERIAL).unwrap();
    wait_until("session failure", || manager.state(SERIAL) == SessionState::Failed);
    assert!(manager.get_frame(SERIAL).is_none());
    assert_eq!(recording.frames(), 2);

    manager.start(SERIAL).unwrap();
    assert_eq!(manager.driver().connect_attempts(), 2);
    assert_eq!(recording.sessions().len(), 2);
    wait_until("frames from the new sink", || recording.frames() == 4);

    wait_until("second failure", || manager.state(SERIAL) == SessionState::Failed);
    assert!(manager.stop(SERIAL).is_err());
    assert_eq!(manager.driver().open_handles(), 0);
    assert_eq!(recording.finished(), 2);
}

#[test]
fn preview_can_be_cleared_while_recording_continues() {
    let feed = FakeFeed::cadence(Duration::from_millis(5), None, 2, 2);
    let driver = FakeDriver::new().with_device(SERIAL, feed);
    let launcher = MemoryLauncher::new();
    let recording = launcher.recording();
    let manager = StreamManager::new(driver, launcher, test_config(2, 2, 0));

    assert!(manager.get_frame(SERIAL).is_none());
    manager.start(SERIAL).unwrap();
    wait_until("preview frame", || manager.get_frame(SERIAL).is_some());

    manager.clear_preview(SERIAL);
    let forwarded = recording.frames();
    wait_until("more frames", || recording.frames() > forwarded + 2);
    manager.stop(SERIAL).unwrap();
}

#[test]
fn fifty_hertz_camera_end_to_end() {
    let (width, height) = (8, 6);
    let frame_len = width as usize * height as usize * 3;
    let feed = FakeFeed::cadence(Duration::from_millis(20), Some(100), width, height);
    let driver = FakeDriver::new().with_device(SERIAL, feed);
    let launcher = MemoryLauncher::new();
    let recording = launcher.recording();
    let mut config = test_config(width, height, 50);
    config.capture.grab_timeout_ms = 100;
    let manager = StreamManager::new(driver, launcher, config);

    manager.start(SERIAL).unwrap();
    thread::sleep(Duration::from_millis(2500));
    let preview = manager.get_frame(SERIAL).expect("preview frame");
    manager.stop(SERIAL).unwrap();

    let bytes = recording.bytes();
    let frames = recording.frames();
    assert!((90..=110).contains(&frames), "sink received {frames} frames");
    assert_eq!(bytes.len(), frames * frame_len);
    assert_eq!(preview.as_bytes(), &bytes[bytes.len() - frame_len..]);

    let numbers: Vec<u64> = bytes
        .chunks_exact(frame_len)
        .map(|chunk| u64::from_le_bytes(chunk[..8].try_into().unwrap()))
        .collect();
    assert!(numbers.windows(2).all(|w| w[0] < w[1]), "frames out of order");
    assert_eq!(preview.sequence(), *numbers.last().unwrap());
}
