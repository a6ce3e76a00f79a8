use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use rtsp_frame_relay::{BoundaryMode, StderrPolicy, StreamOptions};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "RELAY_CONFIG",
        "RELAY_INPUT",
        "RELAY_RATE",
        "RELAY_RESOLUTION",
        "RELAY_QUALITY",
        "RELAY_FFMPEG_CMD",
        "RELAY_STDERR_POLICY",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_options_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "input": "rtsp://camera-1/stream",
        "rate": 12,
        "resolution": "800x600",
        "quality": 5,
        "arguments": ["-vf", "eq=saturation=0.9"],
        "cmd": "/opt/ffmpeg/bin/ffmpeg",
        "restart_delay_ms": 2500,
        "boundary": "chunk_tail"
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("RELAY_CONFIG", file.path());
    std::env::set_var("RELAY_INPUT", "rtsp://camera-2/stream");
    std::env::set_var("RELAY_QUALITY", "2");
    std::env::set_var("RELAY_STDERR_POLICY", "log");

    let cfg = StreamOptions::load()
        .expect("load options")
        .resolve()
        .expect("resolve config");

    assert_eq!(cfg.input(), "rtsp://camera-2/stream");
    assert_eq!(cfg.rate(), 12);
    assert_eq!(cfg.resolution(), Some("800x600"));
    assert_eq!(cfg.quality(), 2);
    assert_eq!(cfg.arguments(), ["-vf", "eq=saturation=0.9"]);
    assert_eq!(cfg.cmd(), "/opt/ffmpeg/bin/ffmpeg");
    assert_eq!(cfg.restart_delay(), Duration::from_millis(2500));
    assert_eq!(cfg.boundary(), BoundaryMode::ChunkTail);
    assert_eq!(cfg.stderr_policy(), StderrPolicy::Log);

    clear_env();
}

#[test]
fn env_alone_is_enough_to_configure_a_stream() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("RELAY_INPUT", "rtsp://camera-3/stream");
    std::env::set_var("RELAY_RATE", "0");

    let cfg = StreamOptions::load().unwrap().resolve().unwrap();
    assert_eq!(cfg.input(), "rtsp://camera-3/stream");
    assert_eq!(cfg.rate(), 10);
    assert_eq!(cfg.cmd(), "ffmpeg");

    clear_env();
}

#[test]
fn rejects_malformed_env_and_files() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("RELAY_RATE", "fast");
    assert!(StreamOptions::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"{ not json").expect("write config");
    std::env::set_var("RELAY_CONFIG", file.path());
    let err = StreamOptions::load().unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}
