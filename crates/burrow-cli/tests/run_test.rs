//! End-to-end tests of the `burrow` binary.
//!
//! The `pipeline_` tests need root, cgroups v2, `ip`, `iptables` and
//! `nsenter`, plus an extracted root filesystem (busybox is enough) named
//! by `BURROW_TEST_ROOTFS`. Run them with `cargo test -- --ignored`.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{Duration, Instant};

const BIN: &str = env!("CARGO_BIN_EXE_burrow");

struct Sandbox {
    dir: tempfile::TempDir,
}

impl Sandbox {
    /// A runtime root with the test root filesystem installed as image `base`.
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let images = dir.path().join("images");
        std::fs::create_dir_all(&images).expect("image root");
        if let Ok(rootfs) = std::env::var("BURROW_TEST_ROOTFS") {
            std::os::unix::fs::symlink(rootfs, images.join("base")).expect("link image");
        }
        Self { dir }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn burrow(&self, args: &[&str]) -> Output {
        Command::new(BIN)
            .arg("--root")
            .arg(self.root())
            .args(args)
            .env_remove("BURROW_CONFIG")
            .output()
            .expect("spawn burrow")
    }

    fn config_file(&self, name: &str) -> PathBuf {
        self.root().join("run").join(name).join("config.json")
    }

    fn workspace(&self, name: &str) -> PathBuf {
        self.root().join("containers").join(name)
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(100));
    }
}

// ── Unprivileged ─────────────────────────────────────────────────────

#[test]
fn missing_image_fails_without_leftovers() {
    let sandbox = Sandbox::new();
    let output = sandbox.burrow(&["run", "--name", "ghost", "no-such-image", "echo", "hi"]);
    assert!(!output.status.success());
    assert!(!sandbox.config_file("ghost").exists());
    assert!(!sandbox.workspace("ghost").exists());
}

#[test]
fn ps_on_empty_root_prints_only_headers() {
    let sandbox = Sandbox::new();
    let output = sandbox.burrow(&["ps", "-a"]);
    assert!(output.status.success());
    assert_eq!(stdout(&output).lines().count(), 1);
}

#[test]
fn logs_of_unknown_container_fail() {
    let sandbox = Sandbox::new();
    assert!(!sandbox.burrow(&["logs", "nobody"]).status.success());
}

#[test]
fn publish_without_network_is_rejected() {
    let sandbox = Sandbox::new();
    let output = sandbox.burrow(&["run", "-p", "8080:80", "base", "true"]);
    assert!(!output.status.success());
}

// ── Pipelines (root) ─────────────────────────────────────────────────

#[test]
#[ignore = "requires root and BURROW_TEST_ROOTFS"]
fn pipeline_foreground_run_cleans_up() {
    let sandbox = Sandbox::new();
    let output = sandbox.burrow(&["run", "-t", "--name", "fg", "-m", "64m", "base", "echo", "hi"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(stdout(&output), "hi\n");
    assert!(!sandbox.config_file("fg").exists());
    assert!(!sandbox.workspace("fg").exists());
    assert!(sandbox.root().join("images/base").exists());
}

#[test]
#[ignore = "requires root and BURROW_TEST_ROOTFS"]
fn pipeline_foreground_exit_code_is_forwarded() {
    let sandbox = Sandbox::new();
    let output = sandbox.burrow(&["run", "-t", "base", "sh", "-c", "exit 7"]);
    assert_eq!(output.status.code(), Some(7));
}

#[test]
#[ignore = "requires root and BURROW_TEST_ROOTFS"]
fn pipeline_background_run_logs_and_removes() {
    let sandbox = Sandbox::new();
    let output = sandbox.burrow(&["run", "--name", "bg", "-e", "GREETING=hi", "base", "sh", "-c", "echo $GREETING"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(stdout(&output).trim(), "bg");

    let record: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(sandbox.config_file("bg")).expect("record")).expect("json");
    assert_eq!(record["name"], "bg");
    assert_eq!(record["status"], "running");
    assert_eq!(record["command"], "sh -c echo $GREETING");

    wait_for("log output", || stdout(&sandbox.burrow(&["logs", "bg"])) == "hi\n");
    wait_for("exit", || stdout(&sandbox.burrow(&["ps", "-a"])).contains("exited"));

    assert!(sandbox.burrow(&["rm", "bg"]).status.success());
    assert!(!sandbox.config_file("bg").exists());
    assert!(!sandbox.workspace("bg").exists());
}

#[test]
#[ignore = "requires root and BURROW_TEST_ROOTFS"]
fn pipeline_volume_is_shared_with_host() {
    let sandbox = Sandbox::new();
    let host = sandbox.root().join("shared");
    let volume = format!("{}:/data", host.display());
    let output = sandbox.burrow(&["run", "-t", "-v", &volume, "base", "sh", "-c", "echo v > /data/out"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(std::fs::read_to_string(host.join("out")).expect("volume file"), "v\n");
}

#[test]
#[ignore = "requires root and BURROW_TEST_ROOTFS"]
fn pipeline_stop_then_force_remove() {
    let sandbox = Sandbox::new();
    assert!(sandbox.burrow(&["run", "--name", "sleeper", "base", "sleep", "300"]).status.success());
    assert!(!sandbox.burrow(&["rm", "sleeper"]).status.success());

    let exec = sandbox.burrow(&["exec", "sleeper", "--", "hostname"]);
    assert_eq!(stdout(&exec).trim(), "sleeper");

    assert!(sandbox.burrow(&["stop", "sleeper"]).status.success());
    assert!(stdout(&sandbox.burrow(&["ps", "-a"])).contains("stopped"));
    assert!(sandbox.burrow(&["rm", "-f", "sleeper"]).status.success());
    assert!(!sandbox.config_file("sleeper").exists());
}

#[test]
#[ignore = "requires root and BURROW_TEST_ROOTFS"]
fn pipeline_two_containers_on_default_bridge() {
    let sandbox = Sandbox::new();
    for (name, publish) in [("web1", "18080:80"), ("web2", "18081:80")] {
        let output = sandbox.burrow(&["run", "--name", name, "--net", "bridge0", "-p", publish, "base", "sleep", "300"]);
        assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    }

    let endpoint = |name: &str| -> serde_json::Value {
        let path = sandbox.root().join("network/endpoints").join(format!("{name}.json"));
        serde_json::from_str(&std::fs::read_to_string(path).expect("endpoint")).expect("json")
    };
    let (a, b) = (endpoint("web1"), endpoint("web2"));
    assert_ne!(a["ip"], b["ip"]);
    assert_eq!(a["port_forwards"][0]["host_port"], 18080);
    assert_eq!(b["port_forwards"][0]["host_port"], 18081);

    for name in ["web1", "web2"] {
        assert!(sandbox.burrow(&["rm", "-f", name]).status.success());
    }
    assert!(!sandbox.root().join("network/endpoints/web1.json").exists());
}
