use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::io::Write;

fn qemu_compose() -> assert_cmd::Command {
    cargo_bin_cmd!("qemu-compose").into()
}

fn write_compose(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("qemu-compose.yaml");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(body.as_bytes()).unwrap();
    path
}

#[test]
fn help_works() {
    qemu_compose().arg("--help").assert().success().stdout(
        predicate::str::contains("Declarative QEMU/KVM VM orchestration"),
    );
}

#[test]
fn version_prints_package_version() {
    qemu_compose()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("qemu-compose"));
}

#[test]
fn doctor_lists_every_check() {
    // doctor never errors out on a missing compose file and always prints
    // at least the required-binary checks, whatever the host's state is.
    qemu_compose()
        .arg("doctor")
        .assert()
        .stdout(predicate::str::contains("qemu-system-x86_64"));
}

#[test]
fn missing_compose_file_shows_error() {
    let dir = tempfile::tempdir().unwrap();
    qemu_compose()
        .current_dir(dir.path())
        .arg("ps")
        .assert()
        .failure();
}

#[test]
fn invalid_compose_rejects_undeclared_network_reference() {
    let dir = tempfile::tempdir().unwrap();
    write_compose(
        dir.path(),
        r#"
version: "1"
vms:
  web:
    image: https://example.com/image.qcow2
    cpu: 1
    memory: 512
    networks: [nope]
"#,
    );

    qemu_compose()
        .current_dir(dir.path())
        .arg("ps")
        .assert()
        .failure()
        .stderr(predicate::str::contains("undeclared network"));
}

#[test]
fn invalid_compose_rejects_bad_vm_name() {
    let dir = tempfile::tempdir().unwrap();
    write_compose(
        dir.path(),
        r#"
version: "1"
vms:
  "-bad":
    image: https://example.com/image.qcow2
    cpu: 1
    memory: 512
"#,
    );

    qemu_compose()
        .current_dir(dir.path())
        .arg("ps")
        .assert()
        .failure();
}

#[test]
fn ps_lists_vms_from_valid_compose() {
    let dir = tempfile::tempdir().unwrap();
    write_compose(
        dir.path(),
        r#"
version: "1"
vms:
  web:
    image: https://example.com/image.qcow2
    cpu: 1
    memory: 512
"#,
    );

    qemu_compose()
        .current_dir(dir.path())
        .arg("ps")
        .assert()
        .success()
        .stdout(predicate::str::contains("web"))
        .stdout(predicate::str::contains("not-created"));
}

#[test]
fn inspect_unknown_vm_fails() {
    let dir = tempfile::tempdir().unwrap();
    write_compose(
        dir.path(),
        r#"
version: "1"
vms:
  web:
    image: https://example.com/image.qcow2
    cpu: 1
    memory: 512
"#,
    );

    qemu_compose()
        .current_dir(dir.path())
        .args(["inspect", "nonexistent"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn image_ls_succeeds_on_empty_cache() {
    let dir = tempfile::tempdir().unwrap();
    write_compose(
        dir.path(),
        r#"
version: "1"
vms:
  web:
    image: https://example.com/image.qcow2
    cpu: 1
    memory: 512
"#,
    );

    qemu_compose()
        .current_dir(dir.path())
        .args(["image", "ls"])
        .assert()
        .success();
}

#[test]
fn network_ls_lists_declared_networks() {
    let dir = tempfile::tempdir().unwrap();
    write_compose(
        dir.path(),
        r#"
version: "1"
networks:
  front:
    driver: bridge
vms:
  web:
    image: https://example.com/image.qcow2
    cpu: 1
    memory: 512
    networks: [front]
"#,
    );

    qemu_compose()
        .current_dir(dir.path())
        .args(["network", "ls"])
        .assert()
        .success()
        .stdout(predicate::str::contains("front"));
}
