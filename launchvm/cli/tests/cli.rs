use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::{os::unix::fs::PermissionsExt, path::PathBuf};

/// Answers `-device <model>,help` probes like QEMU does, and otherwise echoes its arguments.
const STUB_HYPERVISOR: &str = r#"#!/bin/sh
if [ "$1" = "-device" ]; then
    case "$2" in
        virtio-blk,help|virtio-net-pci,help)
            printf '  serial=<str>\n  drive=<str>\n  bootindex=<int32>\n  mac=<str>\n  netdev=<str>\n'
            exit 0 ;;
        *)
            echo "Device '${2%,help}' not found" >&2
            exit 1 ;;
    esac
fi
echo "stub hypervisor: $*"
exit "${STUB_EXIT:-0}"
"#;

struct Fixture {
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let kvm = dir.path().join("kvm");
        std::fs::write(&kvm, STUB_HYPERVISOR).unwrap();
        std::fs::set_permissions(&kvm, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
disk_driver = "virtio-blk"
nic_model = "virtio-net-pci"
netdevs = ["user"]
"#,
        )
        .unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn launch_vm(&self) -> assert_cmd::Command {
        let mut cmd: assert_cmd::Command = cargo_bin_cmd!("launch-vm").into();
        cmd.arg("--kvm").arg(self.path("kvm")).arg("--config").arg(self.path("config.toml"));
        cmd
    }
}

#[test]
fn help_works() {
    let mut cmd: assert_cmd::Command = cargo_bin_cmd!("launch-vm").into();
    cmd.arg("--help").assert().success().stdout(predicate::str::contains("--netdev")).stdout(predicate::str::contains("--dry-run"));
}

#[test]
fn dry_run_prints_the_command() {
    let fixture = Fixture::new();
    fixture
        .launch_vm()
        .args(["--dry-run", "-d", "root.img,format=raw,bootindex=1", "--", "-m", "512"])
        .assert()
        .success()
        .stdout(predicate::str::contains("-drive file=root.img,id=disk00,if=none,format=raw,index=0"))
        .stdout(predicate::str::contains("-device driver=virtio-blk,drive=disk00,serial=root.img,bootindex=1"))
        .stdout(predicate::str::contains("-netdev user,id=net00 -device driver=virtio-net-pci,netdev=net00"))
        .stdout(predicate::str::ends_with("-m 512\n"));
}

#[test]
fn netdevs_override_the_configured_default() {
    let fixture = Fixture::new();
    fixture
        .launch_vm()
        .args(["--dry-run", "-n", "user,hostfwd=tcp::2222-:22,macaddr=:07"])
        .assert()
        .success()
        .stdout(predicate::str::contains("-netdev user,id=net00,hostfwd=tcp::2222-:22"))
        .stdout(predicate::str::contains("mac=52:54:00:12:34:07"));
}

#[test]
fn conflicting_addressing_fails() {
    let fixture = Fixture::new();
    fixture
        .launch_vm()
        .args(["--dry-run", "-d", "root.img,format=raw,bus=ide.0,index=1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("cannot be combined with 'index'"));
}

#[test]
fn unsupported_interface_fails() {
    let fixture = Fixture::new();
    fixture
        .launch_vm()
        .args(["--dry-run", "-d", "card.img,if=sd,format=raw"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unsupported device type"));
}

#[test]
fn unknown_model_fails() {
    let fixture = Fixture::new();
    fixture
        .launch_vm()
        .args(["--dry-run", "-n", "user,model=rtl9999"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("rtl9999"));
}

#[test]
fn missing_hypervisor_names_the_package() {
    let fixture = Fixture::new();
    let mut cmd: assert_cmd::Command = cargo_bin_cmd!("launch-vm").into();
    cmd.args(["--kvm", "/nonexistent/kvm", "--dry-run", "--config"])
        .arg(fixture.path("config.toml"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("qemu-kvm"));
}

#[test]
fn firmware_options_are_exclusive() {
    let fixture = Fixture::new();
    fixture.launch_vm().args(["--dry-run", "--uefi", "--bios", "bios.bin"]).assert().failure();
}

#[test]
fn hypervisor_exit_status_is_propagated() {
    let fixture = Fixture::new();
    fixture
        .launch_vm()
        .env("STUB_EXIT", "7")
        .args(["-d", "root.img,format=raw"])
        .assert()
        .code(7)
        .stdout(predicate::str::contains("Disk (disk00)"))
        .stdout(predicate::str::contains("stub hypervisor: -drive file=root.img"));
}

#[test]
fn make_nics_skips_user_connections() {
    let mut cmd: assert_cmd::Command = cargo_bin_cmd!("launch-vm").into();
    cmd.args(["tap-control", "make-nics", "--prefix", "tap1", "--owner", "nobody", "user", "user"])
        .assert()
        .success()
        .stdout("skip\nskip\n");
}

#[test]
fn ovs_cleanup_counts_failures() {
    let mut cmd: assert_cmd::Command = cargo_bin_cmd!("launch-vm").into();
    cmd.args(["tap-control", "ovs-cleanup", "not-a-port", "also-bad"]).assert().code(2);
}
