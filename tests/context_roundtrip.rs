use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;
use wiz::context::{CONTEXT_ENVIRON, decode_context, encode_context};
use wiz::history::EventCollector;
use wiz::registry::RegistryIndex;
use wiz::resolver::{ResolveOptions, Resolver};
use wiz::system::SystemDescriptor;

#[test]
fn encode_then_decode_is_the_identity() {
    let registries = vec![
        PathBuf::from("/studio/registry"),
        PathBuf::from("/project/registry"),
    ];
    let packages = vec![
        "studio::maya==2016.1".to_string(),
        "numpy[3.7]==1.16.6".to_string(),
        "tdsvn==0".to_string(),
    ];
    let encoded = encode_context(&registries, &packages);
    let (decoded_registries, decoded_packages) = decode_context(&encoded).unwrap();
    assert_eq!(decoded_registries, registries);
    assert_eq!(decoded_packages, packages);
}

#[test]
fn malformed_snapshots_are_rejected() {
    assert!(decode_context("%%%").is_err());
    // Valid base64, invalid payload.
    assert!(decode_context("aGVsbG8=").is_err());
}

#[test]
fn resolved_contexts_embed_a_decodable_snapshot() {
    let temp = TempDir::new().unwrap();
    fs::write(
        temp.path().join("foo.json"),
        r#"{"identifier": "foo", "version": "1.2.3"}"#,
    )
    .unwrap();
    fs::write(
        temp.path().join("bar.json"),
        r#"{"identifier": "bar", "version": "0.9", "requirements": ["foo"]}"#,
    )
    .unwrap();

    let system = SystemDescriptor::new("linux", "x86_64", "el", "7.3".parse().unwrap());
    let index = RegistryIndex::discover(
        &[temp.path().to_path_buf()],
        &system,
        &mut EventCollector::new(),
    )
    .unwrap();
    let resolver = Resolver::new(&index, ResolveOptions::default());
    let context = resolver
        .resolve(
            &["bar".to_string()],
            &BTreeMap::new(),
            &mut EventCollector::new(),
        )
        .unwrap();

    let encoded = &context.environ[CONTEXT_ENVIRON];
    let (registries, packages) = decode_context(encoded).unwrap();
    assert_eq!(registries, vec![temp.path().to_path_buf()]);
    let expected: Vec<String> = context
        .packages
        .iter()
        .map(|package| package.qualified_identifier.clone())
        .collect();
    assert_eq!(packages, expected);
}
