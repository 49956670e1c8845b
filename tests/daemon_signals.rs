#![cfg(unix)]

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn sigterm_stops_the_daemon_cleanly() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut child = Command::new(env!("CARGO_BIN_EXE_autologd"))
        .arg("--no-stdin")
        .env_clear()
        .env("RUST_LOG", "info")
        .env("GOOGLE_API_KEY", "test-key")
        .env("AUTOLOG_CAMERA_URL", "stub://static")
        .env("AUTOLOG_OUTPUT_DIR", dir.path().join("captures"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn autologd");

    // The handler is installed before the camera connects.
    let stderr = child.stderr.take().expect("stderr");
    let mut lines = BufReader::new(stderr).lines();
    let streaming = lines
        .by_ref()
        .map_while(Result::ok)
        .any(|line| line.contains("streaming from"));
    assert!(streaming, "daemon never started streaming");
    let drain = thread::spawn(move || lines.for_each(drop));

    let status = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .expect("run kill");
    assert!(status.success());

    let deadline = Instant::now() + Duration::from_secs(10);
    let exit = loop {
        if let Some(exit) = child.try_wait().expect("poll autologd") {
            break exit;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("autologd ignored SIGTERM");
        }
        thread::sleep(Duration::from_millis(50));
    };
    drain.join().expect("drain stderr");
    // Killed by the signal would leave no exit code.
    assert_eq!(exit.code(), Some(0), "autologd exited with {:?}", exit);
}
