#![allow(missing_docs)]

use serde_json::{json, Value};
use veridex::api::{ApiRequest, Method, QueryParams, Registry};

fn registry() -> Registry {
    let registry = Registry::in_memory("test-reg").expect("registry opens");
    let model = json!({
        "groups": {
            "dirs": {
                "singular": "dir",
                "ximportresources": ["/archives/blobs"],
                "resources": { "files": { "singular": "file" } }
            },
            "archives": {
                "singular": "archive",
                "resources": { "blobs": { "singular": "blob" } }
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

fn error_kind(body: &Value) -> &str {
    body["type"]
        .as_str()
        .and_then(|t| t.rsplit('#').next())
        .unwrap_or("")
}

#[test]
fn mirroring_serves_target_versions_under_own_identity() {
    let reg = registry();
    send(
        &reg,
        Method::Put,
        "dirs/d1/files/f1/versions/v1",
        Some(json!({"name": "one"})),
        &[],
    );
    send(
        &reg,
        Method::Put,
        "dirs/d1/files/f1/versions/v2",
        Some(json!({"name": "two"})),
        &[],
    );

    let (status, _) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/fx/meta",
        Some(json!({"xref": "/dirs/d1/files/f1"})),
        &[],
    );
    assert_eq!(status, 200);

    let fx = get(&reg, "dirs/d1/files/fx");
    assert_eq!(fx["fileid"], "fx", "mirror keeps its own id");
    assert_eq!(fx["name"], "two", "content reads through to the target's default");
    assert_eq!(fx["versionscount"], 2);
    assert_eq!(fx["xid"], "/dirs/d1/files/fx");

    let versions = get(&reg, "dirs/d1/files/fx/versions");
    let ids: Vec<&str> = versions.as_object().unwrap().keys().map(|s| s.as_str()).collect();
    assert_eq!(ids, ["v1", "v2"]);
    assert_eq!(
        versions["v1"]["self"].as_str().unwrap(),
        "http://localhost:8080/dirs/d1/files/fx/versions/v1",
        "mirrored versions live in the mirror's URL space"
    );

    let meta = get(&reg, "dirs/d1/files/fx/meta");
    assert_eq!(meta["xref"], "/dirs/d1/files/f1");
    assert_eq!(meta["defaultversionid"], "v2", "default pointer reads through");
}

#[test]
fn clear_without_prior_versions_creates_version_one() {
    let reg = registry();
    send(&reg, Method::Put, "dirs/d1/files/f1/versions/v1", Some(json!({})), &[]);
    send(
        &reg,
        Method::Put,
        "dirs/d1/files/fx/meta",
        Some(json!({"xref": "/dirs/d1/files/f1"})),
        &[],
    );
    let meta_before = get(&reg, "dirs/d1/files/fx/meta");
    let createdat = meta_before["createdat"].clone();

    let (status, _) = send(
        &reg,
        Method::Patch,
        "dirs/d1/files/fx/meta",
        Some(json!({"xref": null})),
        &[],
    );
    assert_eq!(status, 200);

    let versions = get(&reg, "dirs/d1/files/fx/versions");
    let ids: Vec<&str> = versions.as_object().unwrap().keys().map(|s| s.as_str()).collect();
    assert_eq!(ids, ["1"], "a fresh version \"1\" is created on clear");
    let meta = get(&reg, "dirs/d1/files/fx/meta");
    assert!(meta.get("xref").is_none());
    assert_eq!(meta["createdat"], createdat, "creation time survives the cycle");
}

#[test]
fn round_trip_restores_parked_identity_exactly() {
    let reg = registry();
    // fx starts as an owning resource with one server-generated version
    // ("1"), which moves its versionid counter to 2.
    send(&reg, Method::Post, "dirs/d1/files/fx", Some(json!({})), &[]);
    send(&reg, Method::Put, "dirs/d1/files/f1/versions/v1", Some(json!({})), &[]);
    let before = get(&reg, "dirs/d1/files/fx/meta");
    let createdat = before["createdat"].clone();
    let owning_epoch = before["epoch"].as_u64().unwrap();

    send(
        &reg,
        Method::Put,
        "dirs/d1/files/fx/meta",
        Some(json!({"xref": "/dirs/d1/files/f1"})),
        &[],
    );
    // Mutate the mirroring meta a few times so its epoch moves past the
    // parked one.
    for _ in 0..3 {
        send(
            &reg,
            Method::Patch,
            "dirs/d1/files/fx/meta",
            Some(json!({"readonly": false})),
            &[],
        );
    }
    let mirroring = get(&reg, "dirs/d1/files/fx/meta");
    let mirroring_epoch = mirroring["epoch"].as_u64().unwrap();
    assert!(mirroring_epoch > owning_epoch);

    let (status, _) = send(
        &reg,
        Method::Patch,
        "dirs/d1/files/fx/meta",
        Some(json!({"xref": null})),
        &[],
    );
    assert_eq!(status, 200);

    let restored = get(&reg, "dirs/d1/files/fx/meta");
    assert_eq!(restored["createdat"], createdat, "createdat restored verbatim");
    assert_eq!(
        restored["epoch"].as_u64().unwrap(),
        owning_epoch.max(mirroring_epoch) + 1,
        "epoch continues from the larger of the two lifelines"
    );
    assert!(
        restored["modifiedat"].as_str().unwrap() >= mirroring["modifiedat"].as_str().unwrap(),
        "modifiedat advances"
    );

    // The owned versions were dropped on transition; the counter kept
    // counting.
    let versions = get(&reg, "dirs/d1/files/fx/versions");
    let ids: Vec<&str> = versions.as_object().unwrap().keys().map(|s| s.as_str()).collect();
    assert_eq!(ids, ["2"], "versionid counter survived the cycle");
}

#[test]
fn clear_with_replacement_versions_creates_them_instead() {
    let reg = registry();
    send(&reg, Method::Put, "dirs/d1/files/f1/versions/v1", Some(json!({})), &[]);
    send(
        &reg,
        Method::Put,
        "dirs/d1/files/fx/meta",
        Some(json!({"xref": "/dirs/d1/files/f1"})),
        &[],
    );

    let (status, body) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/fx",
        Some(json!({
            "meta": {"xref": null},
            "versions": {
                "a": {"name": "alpha"},
                "b": {"name": "beta"}
            }
        })),
        &[],
    );
    assert_eq!(status, 200, "{body}");
    let versions = get(&reg, "dirs/d1/files/fx/versions");
    let ids: Vec<&str> = versions.as_object().unwrap().keys().map(|s| s.as_str()).collect();
    assert_eq!(ids, ["a", "b"], "replacement versions supersede the placeholder");
}

#[test]
fn mirroring_rejects_owned_version_attributes() {
    let reg = registry();
    send(&reg, Method::Put, "dirs/d1/files/f1/versions/v1", Some(json!({})), &[]);

    let (status, body) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/fx/meta",
        Some(json!({"xref": "/dirs/d1/files/f1", "defaultversionsticky": true})),
        &[],
    );
    assert_eq!(status, 400);
    assert_eq!(error_kind(&body), "extra_xref_attribute");

    send(
        &reg,
        Method::Put,
        "dirs/d1/files/fx/meta",
        Some(json!({"xref": "/dirs/d1/files/f1"})),
        &[],
    );
    let (status, body) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/fx",
        Some(json!({"name": "nope"})),
        &[],
    );
    assert_eq!(status, 400, "resource-level sugar is rejected while mirroring");
    assert_eq!(error_kind(&body), "bad_request");

    let (status, _) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/fx/versions/v9",
        Some(json!({})),
        &[],
    );
    assert_eq!(status, 400, "version writes are rejected while mirroring");
}

#[test]
fn malformed_targets_are_rejected() {
    let reg = registry();
    for bad in [
        "dirs/d1/files/f1",
        "/dirs/d1/files",
        "/dirs/d1/files/f1/versions/v1",
        "/unknown/d1/files/f1",
    ] {
        let (status, body) = send(
            &reg,
            Method::Put,
            "dirs/d1/files/fx/meta",
            Some(json!({"xref": bad})),
            &[],
        );
        assert_eq!(status, 400, "{bad} accepted: {body}");
        assert_eq!(error_kind(&body), "malformed_xref", "{bad}");
    }
}

#[test]
fn cross_type_targets_require_ximportresources() {
    let reg = registry();
    send(&reg, Method::Put, "archives/a1/blobs/b1/versions/v1", Some(json!({"name": "blob one"})), &[]);

    // dirs declares /archives/blobs importable.
    let (status, _) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/fx/meta",
        Some(json!({"xref": "/archives/a1/blobs/b1"})),
        &[],
    );
    assert_eq!(status, 200);
    let fx = get(&reg, "dirs/d1/files/fx");
    assert_eq!(fx["fileid"], "fx", "imported content is served under the file type");
    assert_eq!(fx["name"], "blob one");

    // archives declares nothing importable.
    let (status, body) = send(
        &reg,
        Method::Put,
        "archives/a1/blobs/bx/meta",
        Some(json!({"xref": "/dirs/d1/files/fx"})),
        &[],
    );
    assert_eq!(status, 400);
    assert_eq!(error_kind(&body), "malformed_xref");
}

#[test]
fn retarget_keeps_original_parked_state() {
    let reg = registry();
    send(&reg, Method::Put, "dirs/d1/files/fx/versions/v1", Some(json!({})), &[]);
    send(&reg, Method::Put, "dirs/d1/files/f1/versions/v1", Some(json!({})), &[]);
    send(&reg, Method::Put, "dirs/d1/files/f2/versions/v1", Some(json!({})), &[]);
    let before = get(&reg, "dirs/d1/files/fx/meta");
    let createdat = before["createdat"].clone();

    send(
        &reg,
        Method::Put,
        "dirs/d1/files/fx/meta",
        Some(json!({"xref": "/dirs/d1/files/f1"})),
        &[],
    );
    send(
        &reg,
        Method::Put,
        "dirs/d1/files/fx/meta",
        Some(json!({"xref": "/dirs/d1/files/f2"})),
        &[],
    );
    let meta = get(&reg, "dirs/d1/files/fx/meta");
    assert_eq!(meta["xref"], "/dirs/d1/files/f2", "retargeted");

    send(
        &reg,
        Method::Patch,
        "dirs/d1/files/fx/meta",
        Some(json!({"xref": null})),
        &[],
    );
    let restored = get(&reg, "dirs/d1/files/fx/meta");
    assert_eq!(
        restored["createdat"], createdat,
        "the original owning-period state survives a retarget"
    );
}

#[test]
fn self_and_dangling_xrefs_serve_empty_version_sets() {
    let reg = registry();
    send(&reg, Method::Put, "dirs/d1/files/f1/versions/v1", Some(json!({})), &[]);

    // Self-reference is legal and serves nothing.
    let (status, _) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/f1/meta",
        Some(json!({"xref": "/dirs/d1/files/f1"})),
        &[],
    );
    assert_eq!(status, 200);
    let f1 = get(&reg, "dirs/d1/files/f1");
    assert_eq!(f1["versionscount"], 0, "{f1}");

    // Dangling target likewise.
    let (status, _) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/fy/meta",
        Some(json!({"xref": "/dirs/d1/files/ghost"})),
        &[],
    );
    assert_eq!(status, 200);
    let fy = get(&reg, "dirs/d1/files/fy");
    assert_eq!(fy["versionscount"], 0);
    assert_eq!(fy["fileid"], "fy");
}
