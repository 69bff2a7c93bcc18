use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;
use wiz::context::encode_context;

fn registry_with_foo() -> TempDir {
    let temp = TempDir::new().unwrap();
    fs::write(
        temp.path().join("foo.json"),
        r#"{
            "identifier": "foo",
            "version": "0.1.0",
            "environ": {"PATH": "/a:${PATH}"},
            "command": {"foo": "foo-bin"}
        }"#,
    )
    .unwrap();
    temp
}

fn wiz() -> Command {
    Command::cargo_bin("wiz").unwrap()
}

#[test]
fn use_resolves_and_prints_the_context() {
    let registry = registry_with_foo();
    wiz()
        .args(["use", "foo", "--registry"])
        .arg(registry.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("foo==0.1.0"))
        .stdout(predicate::str::contains("foo -> foo-bin"));
}

#[test]
fn use_emits_a_json_envelope() {
    let registry = registry_with_foo();
    let output = wiz()
        .args(["use", "foo", "--format", "json", "--registry"])
        .arg(registry.path())
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let envelope: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(envelope["version"], "1");
    assert_eq!(envelope["command"], "wiz use");
    assert_eq!(envelope["status"], "ok");
    assert_eq!(
        envelope["detail"]["packages"][0]["qualified_identifier"],
        "foo==0.1.0"
    );
    assert!(envelope["events"].as_array().is_some_and(|events| {
        events
            .iter()
            .any(|event| event["type"] == "resolve_complete")
    }));
}

#[test]
fn unresolvable_requests_fail() {
    let registry = registry_with_foo();
    wiz()
        .args(["use", "ghost", "--registry"])
        .arg(registry.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("ghost"));
}

#[test]
fn missing_registries_fail_with_guidance() {
    wiz()
        .env_remove("WIZ_REGISTRY_PATHS")
        .env("WIZ_CONFIG", "/nonexistent/wiz-config.toml")
        .args(["use", "foo"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--registry"));
}

#[test]
fn context_decodes_an_explicit_snapshot() {
    let encoded = encode_context(
        &["/studio/registry".into()],
        &["foo==0.1.0".to_string()],
    );
    wiz()
        .args(["context", &encoded])
        .assert()
        .success()
        .stdout(predicate::str::contains("/studio/registry"))
        .stdout(predicate::str::contains("foo==0.1.0"));
}

#[test]
fn context_reads_the_calling_environment() {
    let encoded = encode_context(
        &["/studio/registry".into()],
        &["bar==2.0".to_string()],
    );
    wiz()
        .env("WIZ_CONTEXT", &encoded)
        .arg("context")
        .assert()
        .success()
        .stdout(predicate::str::contains("bar==2.0"));
}

#[test]
fn commands_lists_the_reverse_index() {
    let registry = registry_with_foo();
    wiz()
        .args(["commands", "--registry"])
        .arg(registry.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("foo -> foo"));
}
