#![allow(missing_docs)]

use proptest::prelude::*;
use serde_json::{json, Value};
use veridex::api::{ApiRequest, Method, QueryParams, Registry};
use veridex::value::PropValue;

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

fn keys(body: &Value) -> Vec<String> {
    body.as_object()
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default()
}

#[test]
fn sort_is_case_insensitive_with_id_tiebreak() {
    let reg = registry();
    for (gid, name) in [("d1", "d1"), ("d2", "d2"), ("d3", "D1")] {
        send(&reg, Method::Put, &format!("dirs/{gid}"), Some(json!({"name": name})), &[]);
    }
    let (status, body) = send(&reg, Method::Get, "dirs", None, &[("sort", "name")]);
    assert_eq!(status, 200);
    assert_eq!(
        keys(&body),
        ["d1", "d3", "d2"],
        "\"d1\" and \"D1\" tie case-insensitively; ids break the tie: {body}"
    );
}

#[test]
fn descending_sort_is_the_exact_reverse() {
    let reg = registry();
    for (gid, name) in [("a", "zeta"), ("b", "alpha"), ("c", "midway")] {
        send(&reg, Method::Put, &format!("dirs/{gid}"), Some(json!({"name": name})), &[]);
    }
    let (_, asc) = send(&reg, Method::Get, "dirs", None, &[("sort", "name")]);
    let (_, desc) = send(&reg, Method::Get, "dirs", None, &[("sort", "name=desc")]);
    let mut reversed = keys(&asc);
    reversed.reverse();
    assert_eq!(keys(&desc), reversed);
    assert_eq!(keys(&asc), ["b", "c", "a"]);
}

#[test]
fn numeric_sort_and_missing_values_first() {
    let reg = registry();
    send(&reg, Method::Put, "dirs/a", Some(json!({"name": "x"})), &[]);
    send(&reg, Method::Put, "dirs/b", Some(json!({"name": "x"})), &[]);
    send(&reg, Method::Put, "dirs/c", Some(json!({"name": "x"})), &[]);
    // Epochs: a=1, b gets bumped twice, c once.
    send(&reg, Method::Patch, "dirs/b", Some(json!({"description": "one"})), &[]);
    send(&reg, Method::Patch, "dirs/b", Some(json!({"description": "two"})), &[]);
    send(&reg, Method::Patch, "dirs/c", Some(json!({"description": "one"})), &[]);
    let (_, by_epoch) = send(&reg, Method::Get, "dirs", None, &[("sort", "epoch")]);
    assert_eq!(keys(&by_epoch), ["a", "c", "b"], "numeric epoch order: {by_epoch}");

    // "description" is missing on a; missing sorts as the minimum.
    let (_, by_desc) = send(&reg, Method::Get, "dirs", None, &[("sort", "description")]);
    assert_eq!(keys(&by_desc), ["a", "c", "b"], "{by_desc}");
}

#[test]
fn sort_on_single_entity_is_rejected() {
    let reg = registry();
    send(&reg, Method::Put, "dirs/d1", Some(json!({})), &[]);
    let (status, body) = send(&reg, Method::Get, "dirs/d1", None, &[("sort", "name")]);
    assert_eq!(status, 400);
    assert_eq!(body["title"], "Can't sort on a non-collection results");
}

fn seed_filter_fixture(reg: &Registry) {
    send(
        reg,
        Method::Put,
        "dirs/d1/files/f1/versions/v1",
        Some(json!({"name": "alpha"})),
        &[],
    );
    send(
        reg,
        Method::Put,
        "dirs/d1/files/f2/versions/v1",
        Some(json!({"name": "beta"})),
        &[],
    );
    send(
        reg,
        Method::Put,
        "dirs/d2/files/f3/versions/v1",
        Some(json!({"name": "alpha"})),
        &[],
    );
}

#[test]
fn comma_terms_are_a_conjunction_on_one_chain() {
    let reg = registry();
    seed_filter_fixture(&reg);
    // Both terms must hold on one candidate chain: the group named d1 that
    // also holds a file named alpha.
    let (status, body) = send(
        &reg,
        Method::Get,
        "dirs",
        None,
        &[("filter", "dirid=d1,files.name=alpha")],
    );
    assert_eq!(status, 200);
    assert_eq!(keys(&body), ["d1"], "{body}");
    assert_eq!(body["d1"]["filescount"], 1, "counts reflect the post-filter set");

    // A single chain cannot satisfy two different values of one attribute.
    let (_, body) = send(
        &reg,
        Method::Get,
        "dirs",
        None,
        &[("filter", "files.name=alpha,files.name=beta")],
    );
    assert_eq!(keys(&body).len(), 0, "conjunction binds to one chain: {body}");

    let (_, body) = send(
        &reg,
        Method::Get,
        "dirs",
        None,
        &[("filter", "files.name=alpha")],
    );
    assert_eq!(keys(&body), ["d1", "d2"]);
    assert_eq!(body["d1"]["filescount"], 1, "only the matching file survives");
}

#[test]
fn repeated_filters_are_a_disjunction() {
    let reg = registry();
    seed_filter_fixture(&reg);
    let (status, body) = send(
        &reg,
        Method::Get,
        "dirs",
        None,
        &[("filter", "files.name=beta"), ("filter", "dirid=d2")],
    );
    assert_eq!(status, 200);
    assert_eq!(keys(&body), ["d1", "d2"], "either expression admits a group: {body}");
}

#[test]
fn wildcards_and_presence_operators() {
    let reg = registry();
    seed_filter_fixture(&reg);
    let (_, body) = send(&reg, Method::Get, "dirs", None, &[("filter", "files.name=*lph*")]);
    assert_eq!(keys(&body), ["d1", "d2"]);

    let (_, body) = send(
        &reg,
        Method::Get,
        "dirs/d1/files",
        None,
        &[("filter", "name!=alpha")],
    );
    assert_eq!(keys(&body), ["f2"]);

    send(&reg, Method::Patch, "dirs/d1", Some(json!({"description": "has one"})), &[]);
    let (_, body) = send(&reg, Method::Get, "dirs", None, &[("filter", "description")]);
    assert_eq!(keys(&body), ["d1"], "bare path tests presence");
    let (_, body) = send(&reg, Method::Get, "dirs", None, &[("filter", "description=null")]);
    assert_eq!(keys(&body), ["d2"], "=null tests absence");
}

#[test]
fn eliminating_filters_404_single_reads_and_empty_collections() {
    let reg = registry();
    seed_filter_fixture(&reg);
    let (status, body) = send(
        &reg,
        Method::Get,
        "dirs/d1",
        None,
        &[("filter", "files.name=nothing")],
    );
    assert_eq!(status, 404, "single-entity read: {body}");

    let (status, body) = send(
        &reg,
        Method::Get,
        "dirs",
        None,
        &[("filter", "files.name=nothing")],
    );
    assert_eq!(status, 200);
    assert_eq!(keys(&body).len(), 0, "collection read returns empty: {body}");
}

#[test]
fn filtering_a_version_read_is_rejected() {
    let reg = registry();
    seed_filter_fixture(&reg);
    let (status, _) = send(
        &reg,
        Method::Get,
        "dirs/d1/files/f1/versions/v1",
        None,
        &[("filter", "name=alpha")],
    );
    assert_eq!(status, 400);
}

#[test]
fn filter_prunes_inlined_versions_and_counts() {
    let reg = registry();
    send(
        &reg,
        Method::Put,
        "dirs/d1/files/f1/versions/v1",
        Some(json!({"name": "keep"})),
        &[],
    );
    send(
        &reg,
        Method::Put,
        "dirs/d1/files/f1/versions/v2",
        Some(json!({"name": "drop"})),
        &[],
    );
    let (status, body) = send(
        &reg,
        Method::Get,
        "dirs/d1/files/f1",
        None,
        &[("filter", "versions.name=keep"), ("inline", "versions")],
    );
    assert_eq!(status, 200);
    assert_eq!(body["versionscount"], 1, "{body}");
    assert_eq!(keys(&body["versions"]), ["v1"]);
}

proptest! {
    // Sorting uses one total order: flipping the comparison direction of
    // distinct keys reverses the relation.
    #[test]
    fn prop_compare_is_antisymmetric(a in "[a-zA-Z0-9]{1,12}", b in "[a-zA-Z0-9]{1,12}") {
        let va = PropValue::String(a);
        let vb = PropValue::String(b);
        prop_assert_eq!(va.compare(&vb), vb.compare(&va).reverse());
    }

    #[test]
    fn prop_numeric_compare_matches_integers(a in -5000i64..5000, b in -5000i64..5000) {
        let va = PropValue::Int(a);
        let vb = PropValue::Int(b);
        prop_assert_eq!(va.compare(&vb), a.cmp(&b));
    }
}
