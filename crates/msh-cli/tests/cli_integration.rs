//! CLI integration tests
//!
//! Tests the meshsh CLI using assert_cmd.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;

fn meshsh() -> Command {
    Command::cargo_bin("meshsh")
        .expect("Failed to locate meshsh binary - ensure it's built before running tests")
}

/// Config file that keeps discovery off the well-known port
fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("config.toml");
    std::fs::write(
        &path,
        "[transport]\ndiscovery_port = 0\nbroadcast_address = \"127.0.0.1\"\n",
    )
    .unwrap();
    path
}

fn hash_after(output: &str, label: &str) -> String {
    output
        .lines()
        .find(|line| line.starts_with(label))
        .and_then(|line| line.split(':').nth(1))
        .map(|hash| hash.trim().to_string())
        .expect("label not in output")
}

#[test]
fn test_cli_help() {
    meshsh()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("meshsh"))
        .stdout(predicate::str::contains("Remote shell"));
}

#[test]
fn test_cli_version() {
    meshsh()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("meshsh"));
}

#[test]
fn test_cli_listen_help() {
    meshsh()
        .args(["listen", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--allowed"))
        .stdout(predicate::str::contains("--no-auth"));
}

#[test]
fn test_cli_connect_help() {
    meshsh()
        .args(["connect", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--mirror"));
}

#[test]
fn test_cli_unknown_command() {
    meshsh()
        .arg("nonexistent-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_identity_is_created_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let identity = dir.path().join("id");

    let first = meshsh()
        .arg("--config")
        .arg(&config)
        .arg("-i")
        .arg(&identity)
        .arg("identity")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert!(identity.exists());

    let second = meshsh()
        .arg("--config")
        .arg(&config)
        .arg("-i")
        .arg(&identity)
        .arg("identity")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let first = String::from_utf8(first).unwrap();
    let hash = hash_after(&first, "Identity");
    assert_eq!(hash.len(), 32);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(first, String::from_utf8(second).unwrap());
}

#[test]
fn test_destination_depends_on_service() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let identity = dir.path().join("id");

    let destination = |service: &str| {
        let output = meshsh()
            .arg("--config")
            .arg(&config)
            .args(["-i"])
            .arg(&identity)
            .args(["-s", service, "identity", "--listen"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        hash_after(&String::from_utf8(output).unwrap(), "Listening on")
    };

    assert_ne!(destination("default"), destination("files"));
}

#[test]
fn test_connect_rejects_bad_destination() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    meshsh()
        .arg("--config")
        .arg(&config)
        .args(["connect", "not-a-hash", "-N"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Invalid destination"));
}

#[test]
fn test_missing_config_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    meshsh()
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg("identity")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}

#[test]
fn test_unreachable_listener_exits_250() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    // Reserve a port and release it so nothing listens there
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    meshsh()
        .arg("--config")
        .arg(&config)
        .args([
            "connect",
            "0123456789abcdef0123456789abcdef",
            "-N",
            "-w",
            "2",
            "--via",
            &format!("127.0.0.1:{}", port),
        ])
        .write_stdin("")
        .assert()
        .code(250);
}

#[cfg(unix)]
mod over_tcp {
    use super::*;
    use std::process::{Child, Stdio};
    use std::time::{Duration, Instant};

    struct KillOnDrop(Child);

    impl Drop for KillOnDrop {
        fn drop(&mut self) {
            let _ = self.0.kill();
            let _ = self.0.wait();
        }
    }

    fn wait_for_port(port: u16) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while std::net::TcpStream::connect(("127.0.0.1", port)).is_err() {
            assert!(Instant::now() < deadline, "listener did not start");
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    #[test]
    fn test_exit_code_mirrors_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());
        let listener_identity = dir.path().join("listener");

        let output = meshsh()
            .arg("--config")
            .arg(&config)
            .arg("-i")
            .arg(&listener_identity)
            .args(["identity", "--listen"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let destination = hash_after(&String::from_utf8(output).unwrap(), "Listening on");

        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let address = format!("127.0.0.1:{}", port);

        let child = std::process::Command::new(assert_cmd::cargo::cargo_bin("meshsh"))
            .arg("--config")
            .arg(&config)
            .arg("-i")
            .arg(&listener_identity)
            .args(["listen", "-n", "-b", "--bind", &address, "--"])
            .args(["/bin/sh", "-c", "echo remote-says-hi; exit 7"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let _listener = KillOnDrop(child);
        wait_for_port(port);

        meshsh()
            .arg("--config")
            .arg(&config)
            .args(["connect", &destination, "-m", "-N", "-w", "10", "--via", &address])
            .write_stdin("")
            .assert()
            .code(7)
            .stdout(predicate::str::contains("remote-says-hi"));
    }
}
