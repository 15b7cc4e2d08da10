#![forbid(unsafe_code)]

use maestro_api::{Composition, CompositionSpec, CompositionStatus, Manifest, ResourceSlice, ResourceSliceSpec, Synthesis};
use maestro_core::{CompositionRef, ResourceRef, SynthesisRef};
use maestro_store::{Cache, RangeDirection};

fn comp_ref() -> CompositionRef {
    CompositionRef { name: "test-comp".into(), namespace: "default".into() }
}

fn syn_ref(uuid: &str) -> SynthesisRef {
    SynthesisRef { composition: comp_ref(), uuid: uuid.into() }
}

fn config_map(name: &str, group: i64) -> String {
    let mut manifest = serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name, "namespace": "default"},
        "data": {"k": "v"}
    });
    if group != 0 {
        manifest["metadata"]["annotations"] =
            serde_json::json!({"eno.azure.io/readiness-group": group.to_string()});
    }
    manifest.to_string()
}

fn slice(name: &str, uuid: &str, manifests: Vec<String>) -> ResourceSlice {
    let mut s = ResourceSlice::new(
        name,
        ResourceSliceSpec {
            composition_generation: 1,
            synthesis_uuid: uuid.into(),
            resources: manifests
                .into_iter()
                .map(|m| Manifest { manifest: m, deleted: false })
                .collect(),
        },
    );
    s.metadata.namespace = Some("default".into());
    s
}

fn cm_ref(name: &str) -> ResourceRef {
    ResourceRef {
        group: "".into(),
        kind: "ConfigMap".into(),
        name: name.into(),
        namespace: Some("default".into()),
    }
}

#[test]
fn fill_then_get_and_range() {
    let cache = Cache::new();
    let slices = vec![slice(
        "slice-0",
        "syn-a",
        vec![config_map("obj-0", 0), config_map("obj-1", 2), config_map("obj-2", 4)],
    )];

    let result = cache.fill(&comp_ref(), "syn-a", &slices);
    assert_eq!(result.requests.len(), 3);
    assert!(result.failures.is_empty());
    assert!(cache.has_synthesis(&syn_ref("syn-a")));

    let got = cache.get(&syn_ref("syn-a"), &cm_ref("obj-1")).unwrap();
    assert_eq!(got.readiness_group, 2);

    // Strictly-lower enumeration, ascending: the gate for group 4 sees both
    // earlier groups, the gate for group 0 sees nothing.
    let lower = cache.range_by_readiness_group(&syn_ref("syn-a"), 4, RangeDirection::Lower);
    let names: Vec<_> = lower.iter().map(|r| r.object_ref.name.clone()).collect();
    assert_eq!(names, vec!["obj-0", "obj-1"]);
    assert!(cache
        .range_by_readiness_group(&syn_ref("syn-a"), 0, RangeDirection::Lower)
        .is_empty());

    let higher = cache.range_by_readiness_group(&syn_ref("syn-a"), 0, RangeDirection::Higher);
    let names: Vec<_> = higher.iter().map(|r| r.object_ref.name.clone()).collect();
    assert_eq!(names, vec!["obj-1", "obj-2"]);
}

#[test]
fn refill_is_idempotent() {
    let cache = Cache::new();
    let slices = vec![slice("slice-0", "syn-a", vec![config_map("obj-0", 0)])];

    let first = cache.fill(&comp_ref(), "syn-a", &slices);
    assert_eq!(first.requests.len(), 1);

    // Slices are immutable once synthesized; a second fill is a no-op and
    // must not generate duplicate work.
    let second = cache.fill(&comp_ref(), "syn-a", &slices);
    assert!(second.requests.is_empty());
}

#[test]
fn parse_failures_are_surfaced_not_fatal() {
    let cache = Cache::new();
    let slices = vec![slice(
        "slice-0",
        "syn-a",
        vec![config_map("obj-0", 0), "{\"kind\": \"MissingBits\"}".to_string()],
    )];

    let result = cache.fill(&comp_ref(), "syn-a", &slices);
    assert_eq!(result.requests.len(), 1);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].0.index, 1);
}

#[test]
fn defining_crd_lookup() {
    let crd = serde_json::json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": {"name": "widgets.example.com"},
        "spec": {"group": "example.com", "names": {"kind": "Widget", "plural": "widgets"}}
    })
    .to_string();
    let cr = serde_json::json!({
        "apiVersion": "example.com/v1",
        "kind": "Widget",
        "metadata": {"name": "w", "namespace": "default"}
    })
    .to_string();

    let cache = Cache::new();
    cache.fill(&comp_ref(), "syn-a", &[slice("slice-0", "syn-a", vec![crd, cr])]);

    let defining = cache
        .get_defining_crd(&syn_ref("syn-a"), "example.com", "Widget")
        .unwrap();
    assert_eq!(defining.object_ref.name, "widgets.example.com");
    assert!(cache.get_defining_crd(&syn_ref("syn-a"), "example.com", "Gadget").is_none());
}

#[test]
fn purge_follows_status_slots() {
    let cache = Cache::new();
    for uuid in ["syn-a", "syn-b", "syn-c"] {
        cache.fill(&comp_ref(), uuid, &[slice("s", uuid, vec![config_map("obj", 0)])]);
    }

    let mut comp = Composition::new("test-comp", CompositionSpec::default());
    comp.metadata.namespace = Some("default".into());
    comp.status = Some(CompositionStatus {
        current_synthesis: Some(Synthesis { uuid: "syn-c".into(), ..Synthesis::default() }),
        previous_synthesis: Some(Synthesis { uuid: "syn-b".into(), ..Synthesis::default() }),
    });

    cache.purge(&comp_ref(), Some(&comp));
    assert!(!cache.has_synthesis(&syn_ref("syn-a")));
    assert!(cache.has_synthesis(&syn_ref("syn-b")));
    assert!(cache.has_synthesis(&syn_ref("syn-c")));

    // Composition deleted: everything goes.
    cache.purge(&comp_ref(), None);
    assert!(!cache.has_synthesis(&syn_ref("syn-b")));
    assert!(!cache.has_synthesis(&syn_ref("syn-c")));
}
