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

#[test]
fn star_must_be_the_only_list_member() {
    let reg = registry();
    let (status, body) = send(
        &reg,
        Method::Put,
        "capabilities",
        Some(json!({"mutable": ["model", "*"]})),
        &[],
    );
    assert_eq!(status, 400);
    assert_eq!(
        body["title"],
        "\"*\" must be the only value specified for \"mutable\"",
        "{body}"
    );

    let (status, body) = send(
        &reg,
        Method::Put,
        "capabilities",
        Some(json!({"mutable": ["*"]})),
        &[],
    );
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["mutable"], json!(["capabilities", "entities", "model"]));
}

#[test]
fn unknown_capability_values_are_rejected() {
    let reg = registry();
    let (status, _) = send(
        &reg,
        Method::Put,
        "capabilities",
        Some(json!({"flags": ["teleport"]})),
        &[],
    );
    assert_eq!(status, 400);
    let (status, _) = send(
        &reg,
        Method::Put,
        "capabilities",
        Some(json!({"bogus": true})),
        &[],
    );
    assert_eq!(status, 400);
}

#[test]
fn disabled_flags_reject_their_parameters() {
    let reg = registry();
    let (status, _) = send(
        &reg,
        Method::Put,
        "capabilities",
        Some(json!({"flags": ["inline", "sort"]})),
        &[],
    );
    assert_eq!(status, 200);

    let (status, body) = send(&reg, Method::Get, "dirs", None, &[("filter", "name=d1")]);
    assert_eq!(status, 400);
    assert_eq!(body["title"], "filtering is disabled");

    let (status, _) = send(&reg, Method::Get, "", None, &[("export", "")]);
    assert_eq!(status, 400, "export flag is off");

    // Sorting stayed enabled.
    let (status, _) = send(&reg, Method::Get, "dirs", None, &[("sort", "name")]);
    assert_eq!(status, 200);
}

#[test]
fn capabilities_patch_merges() {
    let reg = registry();
    let (status, body) = send(
        &reg,
        Method::Patch,
        "capabilities",
        Some(json!({"pagination": true})),
        &[],
    );
    assert_eq!(status, 200);
    assert_eq!(body["pagination"], true);
    assert_eq!(
        body["mutable"],
        json!(["capabilities", "entities", "model"]),
        "untouched lists keep their values"
    );
}

#[test]
fn disabled_apis_vanish() {
    let reg = registry();
    let (status, _) = send(
        &reg,
        Method::Put,
        "capabilities",
        Some(json!({"apis": ["/capabilities", "/model"]})),
        &[],
    );
    assert_eq!(status, 200);
    let (status, _) = send(&reg, Method::Get, "modelsource", None, &[]);
    assert_eq!(status, 404);
    let (status, _) = send(&reg, Method::Get, "model", None, &[]);
    assert_eq!(status, 200);
}

#[test]
fn model_writes_go_through_modelsource() {
    let reg = registry();
    let (status, _) = send(&reg, Method::Put, "model", Some(json!({})), &[]);
    assert_eq!(status, 400, "the derived model is read-only");

    let (status, _) = send(
        &reg,
        Method::Put,
        "modelsource",
        Some(json!({"mutable": ["model"]})),
        &[],
    );
    assert_eq!(status, 400, "unknown model keys are rejected");
}

#[test]
fn model_validation_rejects_bad_declarations() {
    let reg = registry();
    for bad in [
        json!({"groups": {"dirs": {"singular": "dir", "attributes": {"x": {"type": "float"}}}}}),
        json!({"groups": {"dirs": {"singular": "dir", "ximportresources": ["/ghosts/things"]}}}),
        json!({"groups": {"dirs": {"singular": "dir", "plural": "directories"}}}),
        json!({"groups": {"bad id": {"singular": "dir"}}}),
    ] {
        let (status, body) = send(&reg, Method::Put, "modelsource", Some(bad.clone()), &[]);
        assert_eq!(status, 400, "{bad} accepted: {body}");
    }
}

#[test]
fn removing_a_group_type_removes_its_instances() {
    let reg = registry();
    send(&reg, Method::Put, "dirs/d1/files/f1/versions/v1", Some(json!({})), &[]);

    let (status, _) = send(&reg, Method::Put, "modelsource", Some(json!({})), &[]);
    assert_eq!(status, 200);
    let (status, _) = send(&reg, Method::Get, "dirs", None, &[]);
    assert_eq!(status, 404, "the type itself is gone");

    // Re-declaring the type starts empty.
    let model = json!({
        "groups": {"dirs": {"singular": "dir", "resources": {"files": {"singular": "file"}}}}
    });
    send(&reg, Method::Put, "modelsource", Some(model), &[]);
    let (status, body) = send(&reg, Method::Get, "dirs", None, &[]);
    assert_eq!(status, 200);
    assert_eq!(body, json!({}), "old instances were deleted with their type");
}

#[test]
fn custom_attributes_are_type_checked() {
    let reg = registry();
    let model = json!({
        "groups": {
            "dirs": {
                "singular": "dir",
                "attributes": {"tier": {"type": "uinteger"}},
                "resources": {
                    "files": {
                        "singular": "file",
                        "attributes": {"tags": {"type": "map", "item": {"type": "string"}}}
                    }
                }
            }
        }
    });
    let (status, _) = send(&reg, Method::Put, "modelsource", Some(model), &[]);
    assert_eq!(status, 200);

    let (status, _) = send(&reg, Method::Put, "dirs/d1", Some(json!({"tier": "gold"})), &[]);
    assert_eq!(status, 400, "wrong type rejected");
    let (status, _) = send(&reg, Method::Put, "dirs/d1", Some(json!({"tier": 3})), &[]);
    assert_eq!(status, 201);
    let (_, group) = send(&reg, Method::Get, "dirs/d1", None, &[]);
    assert_eq!(group["tier"], 3);

    let (status, _) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/f1/versions/v1",
        Some(json!({"tags": {"env": "prod"}, "bogus": 1})),
        &[],
    );
    assert_eq!(status, 400, "undeclared attributes rejected");
    let (status, _) = send(
        &reg,
        Method::Put,
        "dirs/d1/files/f1/versions/v1",
        Some(json!({"tags": {"env": "prod"}})),
        &[],
    );
    assert_eq!(status, 201);
    let (_, version) = send(&reg, Method::Get, "dirs/d1/files/f1/versions/v1", None, &[]);
    assert_eq!(version["tags"], json!({"env": "prod"}));
}

#[test]
fn derived_model_merges_spec_attributes() {
    let reg = registry();
    let (status, model) = send(&reg, Method::Get, "model", None, &[]);
    assert_eq!(status, 200);
    let files = &model["groups"]["dirs"]["resources"]["files"];
    assert_eq!(files["singular"], "file");
    assert_eq!(files["hasdocument"], true);
    assert!(
        files["attributes"].get("versionid").is_some(),
        "spec attributes are merged into the derived model: {files}"
    );
    assert!(files["metaattributes"].get("xref").is_some());
    assert!(
        model["attributes"].get("registryid").is_some(),
        "registry level too"
    );
}

#[test]
fn entities_mutability_gate() {
    let reg = registry();
    send(&reg, Method::Put, "dirs/d1", Some(json!({})), &[]);
    let (status, _) = send(
        &reg,
        Method::Put,
        "capabilities",
        Some(json!({"mutable": ["capabilities"]})),
        &[],
    );
    assert_eq!(status, 200);

    let (status, body) = send(&reg, Method::Put, "dirs/d2", Some(json!({})), &[]);
    assert_eq!(status, 400, "{body}");
    let (status, _) = send(&reg, Method::Get, "dirs/d1", None, &[]);
    assert_eq!(status, 200, "reads still work");

    // Restore mutability through the still-mutable capabilities.
    let (status, _) = send(
        &reg,
        Method::Put,
        "capabilities",
        Some(json!({"mutable": ["*"]})),
        &[],
    );
    assert_eq!(status, 200);
    let (status, _) = send(&reg, Method::Put, "dirs/d2", Some(json!({})), &[]);
    assert_eq!(status, 201);
}
