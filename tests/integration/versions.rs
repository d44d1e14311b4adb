#![allow(missing_docs)]

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

fn get(registry: &Registry, path: &str) -> Value {
    let (status, body) = send(registry, Method::Get, path, None, &[]);
    assert_eq!(status, 200, "GET {path} failed: {body}");
    body
}

#[test]
fn default_version_tracks_newest_until_pinned() {
    let reg = registry();
    let (status, _) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/f1/versions/v1",
        Some(json!({})),
        &[],
    );
    assert_eq!(status, 201);
    let (status, _) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/f1/versions/v2",
        Some(json!({})),
        &[],
    );
    assert_eq!(status, 201);

    let meta = get(&reg, "dirs/d1/files/f1/meta");
    assert_eq!(meta["defaultversionid"], "v2", "floating default tracks newest");

    // Pin to v1.
    let (status, _) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/f1",
        Some(json!({})),
        &[("setdefaultversionid", "v1")],
    );
    assert_eq!(status, 200);
    let meta = get(&reg, "dirs/d1/files/f1/meta");
    assert_eq!(meta["defaultversionid"], "v1");
    assert_eq!(meta["defaultversionsticky"], true);

    // A new version does not move a pinned default.
    let (status, _) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/f1/versions/v3",
        Some(json!({})),
        &[],
    );
    assert_eq!(status, 201);
    let meta = get(&reg, "dirs/d1/files/f1/meta");
    assert_eq!(meta["defaultversionid"], "v1", "sticky default stays put");

    // Unpinning floats back to the newest version.
    let (status, _) = send(
        &reg,
        Method::Patch,
        "dirs/d1/files/f1/meta",
        Some(json!({"defaultversionsticky": false})),
        &[],
    );
    assert_eq!(status, 200);
    let meta = get(&reg, "dirs/d1/files/f1/meta");
    assert_eq!(meta["defaultversionid"], "v3");
    assert!(meta.get("defaultversionsticky").is_none());
}

#[test]
fn pinning_an_unknown_version_fails() {
    let reg = registry();
    send(
        &reg,
        Method::Put,
        "dirs/d1/files/f1/versions/v1",
        Some(json!({})),
        &[],
    );
    let (status, body) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/f1",
        Some(json!({})),
        &[("setdefaultversionid", "nope")],
    );
    assert_eq!(status, 400);
    assert!(
        body["type"].as_str().unwrap_or("").ends_with("#unknown_id"),
        "got {body}"
    );
}

#[test]
fn server_generated_versionids_never_reuse() {
    let reg = registry();
    // Resource-level POST creates a fresh version with a generated id.
    let (status, v) = send(&reg, Method::Post, "dirs/d1/files/f1", Some(json!({})), &[]);
    assert_eq!(status, 201, "first POST creates the resource too: {v}");
    let (_, v2) = send(&reg, Method::Post, "dirs/d1/files/f1", Some(json!({})), &[]);
    let versions = get(&reg, "dirs/d1/files/f1/versions");
    let ids: Vec<&str> = versions.as_object().unwrap().keys().map(|s| s.as_str()).collect();
    assert_eq!(ids, ["1", "2"], "sequential integer ids: {v2}");

    let (status, _) = send(&reg, Method::Delete, "dirs/d1/files/f1/versions/2", None, &[]);
    assert_eq!(status, 204);
    send(&reg, Method::Post, "dirs/d1/files/f1", Some(json!({})), &[]);
    let versions = get(&reg, "dirs/d1/files/f1/versions");
    let ids: Vec<&str> = versions.as_object().unwrap().keys().map(|s| s.as_str()).collect();
    assert_eq!(
        ids,
        ["1", "3"],
        "the counter survives deletion; ids are never reused"
    );
}

#[test]
fn ancestors_default_to_prior_default_version() {
    let reg = registry();
    send(&reg, Method::Put, "dirs/d1/files/f1/versions/v1", Some(json!({})), &[]);
    send(&reg, Method::Put, "dirs/d1/files/f1/versions/v2", Some(json!({})), &[]);
    let v1 = get(&reg, "dirs/d1/files/f1/versions/v1");
    assert_eq!(v1["ancestor"], "v1", "a root version is its own ancestor");
    let v2 = get(&reg, "dirs/d1/files/f1/versions/v2");
    assert_eq!(v2["ancestor"], "v1", "new versions derive from the prior default");

    let (status, body) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/f1/versions/v3",
        Some(json!({"ancestor": "ghost"})),
        &[],
    );
    assert_eq!(status, 400, "{body}");
    assert!(body["type"].as_str().unwrap_or("").ends_with("#unknown_id"));
}

#[test]
fn deleting_versions_repoints_default_and_cascades() {
    let reg = registry();
    send(&reg, Method::Put, "dirs/d1/files/f1/versions/v1", Some(json!({})), &[]);
    send(&reg, Method::Put, "dirs/d1/files/f1/versions/v2", Some(json!({})), &[]);

    // v2 is the default; deleting it repoints to v1.
    let (status, _) = send(&reg, Method::Delete, "dirs/d1/files/f1/versions/v2", None, &[]);
    assert_eq!(status, 204);
    let meta = get(&reg, "dirs/d1/files/f1/meta");
    assert_eq!(meta["defaultversionid"], "v1");

    // Deleting the last version deletes the resource.
    let (status, _) = send(&reg, Method::Delete, "dirs/d1/files/f1/versions/v1", None, &[]);
    assert_eq!(status, 204);
    let (status, _) = send(&reg, Method::Get, "dirs/d1/files/f1", None, &[]);
    assert_eq!(status, 404, "the resource went with its last version");
}

#[test]
fn exactly_one_default_version() {
    let reg = registry();
    for vid in ["a", "b", "c"] {
        send(
            &reg,
            Method::Put,
            &format!("dirs/d1/files/f1/versions/{vid}"),
            Some(json!({})),
            &[],
        );
    }
    let versions = get(&reg, "dirs/d1/files/f1/versions");
    let defaults: Vec<&str> = versions
        .as_object()
        .unwrap()
        .iter()
        .filter(|(_, v)| v["isdefault"] == true)
        .map(|(k, _)| k.as_str())
        .collect();
    assert_eq!(defaults.len(), 1, "exactly one default: {versions}");
    let meta = get(&reg, "dirs/d1/files/f1/meta");
    assert_eq!(meta["defaultversionid"], defaults[0]);
}

#[test]
fn implicit_parent_creation_on_deep_put() {
    let reg = registry();
    let (status, _) = send(
        &reg,
        Method::Put,
        "dirs/deep/files/doc/versions/v1",
        Some(json!({"name": "first"})),
        &[],
    );
    assert_eq!(status, 201);
    let group = get(&reg, "dirs/deep");
    assert_eq!(group["dirid"], "deep");
    assert_eq!(group["filescount"], 1);
    let resource = get(&reg, "dirs/deep/files/doc");
    assert_eq!(resource["fileid"], "doc");
    assert_eq!(resource["name"], "first", "resource view is the default version");
}

#[test]
fn version_epoch_is_conditional() {
    let reg = registry();
    send(&reg, Method::Put, "dirs/d1/files/f1/versions/v1", Some(json!({})), &[]);
    let before = get(&reg, "dirs/d1/files/f1/versions/v1");
    let epoch = before["epoch"].as_u64().expect("epoch present");

    let (status, body) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/f1/versions/v1",
        Some(json!({"epoch": epoch + 7, "name": "x"})),
        &[],
    );
    assert_eq!(status, 400);
    assert!(body["type"].as_str().unwrap_or("").ends_with("#mismatched_epoch"));
    let unchanged = get(&reg, "dirs/d1/files/f1/versions/v1");
    assert_eq!(unchanged["epoch"].as_u64(), Some(epoch), "failed write mutated nothing");
    assert!(unchanged.get("name").is_none());

    let (status, _) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/f1/versions/v1",
        Some(json!({"epoch": epoch, "name": "x"})),
        &[],
    );
    assert_eq!(status, 200);
    let after = get(&reg, "dirs/d1/files/f1/versions/v1");
    assert_eq!(after["epoch"].as_u64(), Some(epoch + 1), "success bumps by exactly 1");
    assert_eq!(after["name"], "x");
}

#[test]
fn body_id_must_match_path() {
    let reg = registry();
    let (status, body) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/f1/versions/v1",
        Some(json!({"versionid": "other"})),
        &[],
    );
    assert_eq!(status, 400);
    assert!(body["type"].as_str().unwrap_or("").ends_with("#mismatched_id"), "{body}");
}

#[test]
fn document_content_round_trips() {
    let reg = registry();
    let (status, _) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/f1/versions/v1",
        Some(json!({"file": {"kind": "demo", "n": 3}})),
        &[],
    );
    assert_eq!(status, 201);

    // Without inline, content stays out of the metadata view.
    let plain = get(&reg, "dirs/d1/files/f1/versions/v1");
    assert!(plain.get("file").is_none());
    assert_eq!(plain["contenttype"], "application/json");

    let (status, inlined) = send(
        &reg,
        Method::Get,
        "dirs/d1/files/f1/versions/v1",
        None,
        &[("inline", "file")],
    );
    assert_eq!(status, 200);
    assert_eq!(inlined["file"], json!({"kind": "demo", "n": 3}));

    let (status, binary) = send(
        &reg,
        Method::Get,
        "dirs/d1/files/f1/versions/v1",
        None,
        &[("inline", "file"), ("binary", "")],
    );
    assert_eq!(status, 200);
    assert!(binary.get("file").is_none());
    assert!(binary["filebase64"].is_string(), "binary renders base64: {binary}");
}

#[test]
fn state_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("registry.db");
    let model = json!({
        "groups": {
            "dirs": {
                "singular": "dir",
                "resources": { "files": { "singular": "file" } }
            }
        }
    });
    {
        let reg = Registry::open(&db_path, "durable").expect("registry opens");
        let (status, _) = send(&reg, Method::Put, "modelsource", Some(model.clone()), &[]);
        assert_eq!(status, 200);
        send(
            &reg,
            Method::Put,
            "dirs/d1/files/f1/versions/v1",
            Some(json!({"name": "persisted"})),
            &[],
        );
    }
    let reg = Registry::open(&db_path, "durable").expect("reopen");
    let version = get(&reg, "dirs/d1/files/f1/versions/v1");
    assert_eq!(version["name"], "persisted");
    assert_eq!(version["isdefault"], true);
    let root = get(&reg, "");
    assert_eq!(root["registryid"], "durable");
}

#[test]
fn content_forms_are_mutually_exclusive() {
    let reg = registry();
    let (status, body) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/f1/versions/v1",
        Some(json!({"file": "text", "fileurl": "http://elsewhere.example/doc"})),
        &[],
    );
    assert_eq!(status, 400, "{body}");

    let (status, _) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/f1/versions/v1",
        Some(json!({"fileurl": "http://elsewhere.example/doc"})),
        &[],
    );
    assert_eq!(status, 201);
    let version = get(&reg, "dirs/d1/files/f1/versions/v1");
    assert_eq!(version["fileurl"], "http://elsewhere.example/doc");
}
