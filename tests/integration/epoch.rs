#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;

use serde_json::{json, Value};
use veridex::api::{ApiRequest, Method, QueryParams, Registry};

fn registry() -> Registry {
    let registry = Registry::in_memory("test-reg").expect("registry opens");
    let model = json!({
        "groups": {
            "dirs": {
                "singular": "dir",
                "resources": { "files": { "singular": "file" } }
            }
        }
    });
    let (status, body) = send(&registry, Method::Put, "modelsource", Some(model), &[]);
    assert_eq!(status, 200, "model install failed: {body}");
    registry
}

fn send(
    registry: &Registry,
    method: Method,
    path: &str,
    body: Option<Value>,
    query: &[(&str, &str)],
) -> (u16, Value) {
    let pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let params = QueryParams::from_pairs(&pairs).expect("query params parse");
    let mut request = ApiRequest::new(method, path).with_params(params);
    if let Some(body) = body {
        request = request.with_body(body);
    }
    let response = registry.process(request);
    (response.status, response.body.unwrap_or(Value::Null))
}

fn epoch_of(registry: &Registry, path: &str) -> u64 {
    let (status, body) = send(registry, Method::Get, path, None, &[]);
    assert_eq!(status, 200, "GET {path}: {body}");
    body["epoch"].as_u64().unwrap_or_else(|| panic!("no epoch in {body}"))
}

#[test]
fn epoch_increases_by_exactly_one_per_mutation() {
    let reg = registry();
    send(&reg, Method::Put, "dirs/d1", Some(json!({})), &[]);
    let mut expected = epoch_of(&reg, "dirs/d1");
    assert_eq!(expected, 1, "creation stamps epoch 1");
    for i in 0..5 {
        send(
            &reg,
            Method::Patch,
            "dirs/d1",
            Some(json!({"description": format!("pass {i}")})),
            &[],
        );
        expected += 1;
        assert_eq!(epoch_of(&reg, "dirs/d1"), expected, "gapless at pass {i}");
    }
}

#[test]
fn failed_conditional_write_changes_nothing_anywhere() {
    let reg = registry();
    send(&reg, Method::Put, "dirs/d1", Some(json!({})), &[]);
    let group_epoch = epoch_of(&reg, "dirs/d1");
    let registry_epoch = epoch_of(&reg, "");

    let (status, _) = send(
        &reg,
        Method::Patch,
        "dirs/d1",
        Some(json!({"epoch": group_epoch + 5, "description": "nope"})),
        &[],
    );
    assert_eq!(status, 400);
    assert_eq!(epoch_of(&reg, "dirs/d1"), group_epoch, "group untouched");
    assert_eq!(epoch_of(&reg, ""), registry_epoch, "registry untouched");
    let (_, body) = send(&reg, Method::Get, "dirs/d1", None, &[]);
    assert!(body.get("description").is_none(), "no partial mutation");
}

#[test]
fn descendant_mutations_bump_every_containing_level() {
    let reg = registry();
    send(&reg, Method::Put, "dirs/d1/files/f1/versions/v1", Some(json!({})), &[]);
    let group_before = epoch_of(&reg, "dirs/d1");
    let registry_before = epoch_of(&reg, "");

    send(
        &reg,
        Method::Patch,
        "dirs/d1/files/f1/versions/v1",
        Some(json!({"description": "touched"})),
        &[],
    );
    assert_eq!(epoch_of(&reg, "dirs/d1"), group_before + 1, "group sees the child write");
    assert_eq!(epoch_of(&reg, ""), registry_before + 1, "registry sees it too");
}

#[test]
fn conditional_delete_uses_the_epoch_parameter() {
    let reg = registry();
    send(&reg, Method::Put, "dirs/d1", Some(json!({})), &[]);
    let epoch = epoch_of(&reg, "dirs/d1");
    let (status, _) = send(
        &reg,
        Method::Delete,
        "dirs/d1",
        None,
        &[("epoch", &(epoch + 1).to_string())],
    );
    assert_eq!(status, 400, "wrong epoch refuses the delete");
    let (status, _) = send(
        &reg,
        Method::Delete,
        "dirs/d1",
        None,
        &[("epoch", &epoch.to_string())],
    );
    assert_eq!(status, 204);
    let (status, _) = send(&reg, Method::Get, "dirs/d1", None, &[]);
    assert_eq!(status, 404);
}

#[test]
fn concurrent_writer_storm_loses_no_updates() {
    let reg = Arc::new(registry());
    // Seed the paths each level's writers will hit.
    send(&reg, Method::Put, "dirs/g/files/f/versions/v", Some(json!({})), &[]);
    let registry_before = epoch_of(&reg, "");

    const WRITERS: usize = 4;
    const ROUNDS: usize = 10;
    let targets = [
        ("", "registry"),
        ("dirs/g", "group"),
        ("dirs/g/files/f/versions/v", "version"),
    ];
    let mut handles = Vec::new();
    for (path, tag) in targets {
        for writer in 0..WRITERS {
            let reg = Arc::clone(&reg);
            let path = path.to_string();
            let tag = format!("{tag}-{writer}");
            handles.push(thread::spawn(move || {
                let mut committed = 0u64;
                for round in 0..ROUNDS {
                    let (status, body) = send(
                        &reg,
                        Method::Patch,
                        &path,
                        Some(json!({"description": format!("{tag}-{round}")})),
                        &[],
                    );
                    assert_eq!(status, 200, "unconditional PATCH must commit: {body}");
                    committed += 1;
                }
                committed
            }));
        }
    }
    let total: u64 = handles.into_iter().map(|h| h.join().expect("writer panicked")).sum();
    assert_eq!(total, (WRITERS * ROUNDS * targets.len()) as u64);
    assert_eq!(
        epoch_of(&reg, ""),
        registry_before + total,
        "final registry epoch equals the committed-mutation count"
    );
}

#[test]
fn concurrent_conditional_writers_serialize_on_epochs() {
    let reg = Arc::new(registry());
    send(&reg, Method::Put, "dirs/d1", Some(json!({})), &[]);
    let start = epoch_of(&reg, "dirs/d1");

    // Every writer retries conditional updates until it lands exactly one.
    let mut handles = Vec::new();
    for writer in 0..6 {
        let reg = Arc::clone(&reg);
        handles.push(thread::spawn(move || loop {
            let (_, current) = send(&reg, Method::Get, "dirs/d1", None, &[]);
            let epoch = current["epoch"].as_u64().unwrap();
            let (status, _) = send(
                &reg,
                Method::Patch,
                "dirs/d1",
                Some(json!({"epoch": epoch, "description": format!("writer {writer}")})),
                &[],
            );
            match status {
                200 => break,
                400 => continue,
                other => panic!("unexpected status {other}"),
            }
        }));
    }
    for handle in handles {
        handle.join().expect("writer panicked");
    }
    assert_eq!(
        epoch_of(&reg, "dirs/d1"),
        start + 6,
        "each writer landed exactly one conditional update"
    );
}
