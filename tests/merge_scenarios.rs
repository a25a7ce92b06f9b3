//! Merge scenarios against a real store
//!
//! Every test checks the store after the merge, not just the report.

use catalog_index::graph::{upgrade_targets, replaces_chain};
use catalog_index::{
    BundleDescriptor, CatalogError, GraphStore, MergeEngine, MergeOptions, SkipRange, WarningCode,
};
use semver::Version;
use serde_json::json;

fn prometheus(version: &str) -> BundleDescriptor {
    let name = format!("prometheusoperator.{}", version);
    BundleDescriptor::new(
        name.clone(),
        "prometheus",
        Version::parse(version).unwrap(),
        json!({"kind": "ClusterServiceVersion", "metadata": {"name": name}, "spec": {"version": version}}),
    )
    .in_channel("preview")
}

fn head(store: &GraphStore, package: &str, channel: &str) -> String {
    store.get_head(package, channel).unwrap().unwrap().node.name
}

fn chain(store: &GraphStore, package: &str, channel: &str) -> Vec<String> {
    let graph = store.snapshot(package).unwrap().unwrap();
    replaces_chain(&graph, channel)
        .into_iter()
        .map(|id| graph.bundle(id).name.clone())
        .collect()
}

// =============================================================================
// Linear growth
// =============================================================================

#[test]
fn test_prometheus_preview_grows_one_bundle_at_a_time() {
    let mut store = GraphStore::open_in_memory().unwrap();
    let mut engine = MergeEngine::new(&mut store, MergeOptions::default());
    engine.merge(&[prometheus("0.14.0")]).unwrap();
    engine
        .merge(&[prometheus("0.15.0").with_replaces("prometheusoperator.0.14.0")])
        .unwrap();
    assert_eq!(head(&store, "prometheus", "preview"), "prometheusoperator.0.15.0");
    assert_eq!(
        chain(&store, "prometheus", "preview"),
        vec!["prometheusoperator.0.15.0", "prometheusoperator.0.14.0"]
    );

    MergeEngine::new(&mut store, MergeOptions::default())
        .merge(&[prometheus("0.22.2").with_replaces("prometheusoperator.0.15.0")])
        .unwrap();
    assert_eq!(head(&store, "prometheus", "preview"), "prometheusoperator.0.22.2");
    assert_eq!(
        chain(&store, "prometheus", "preview"),
        vec![
            "prometheusoperator.0.22.2",
            "prometheusoperator.0.15.0",
            "prometheusoperator.0.14.0"
        ]
    );
    assert_eq!(store.default_channel("prometheus").unwrap().as_deref(), Some("preview"));
}

#[test]
fn test_batch_order_does_not_matter() {
    let batch = vec![
        prometheus("0.22.2").with_replaces("prometheusoperator.0.15.0"),
        prometheus("0.14.0"),
        prometheus("0.15.0").with_replaces("prometheusoperator.0.14.0"),
    ];
    let mut reversed = batch.clone();
    reversed.reverse();

    let mut a = GraphStore::open_in_memory().unwrap();
    let mut b = GraphStore::open_in_memory().unwrap();
    MergeEngine::new(&mut a, MergeOptions::default()).merge(&batch).unwrap();
    MergeEngine::new(&mut b, MergeOptions::default()).merge(&reversed).unwrap();
    assert_eq!(
        a.snapshot("prometheus").unwrap().unwrap().summary(),
        b.snapshot("prometheus").unwrap().unwrap().summary()
    );
}

#[test]
fn test_merging_the_same_set_twice_is_idempotent() {
    let batch = vec![
        prometheus("0.14.0"),
        prometheus("0.15.0").with_replaces("prometheusoperator.0.14.0"),
    ];
    let mut first = GraphStore::open_in_memory().unwrap();
    let mut second = GraphStore::open_in_memory().unwrap();
    MergeEngine::new(&mut first, MergeOptions::default()).merge(&batch).unwrap();
    MergeEngine::new(&mut second, MergeOptions::default()).merge(&batch).unwrap();
    assert_eq!(first.catalog().unwrap(), second.catalog().unwrap());

    let before = first.snapshot("prometheus").unwrap().unwrap().summary();
    let report = MergeEngine::new(&mut first, MergeOptions::default()).merge(&batch).unwrap();
    let package = report.package("prometheus").unwrap();
    assert!(package.added.is_empty());
    assert_eq!(package.unchanged.len(), 2);
    assert_eq!(first.snapshot("prometheus").unwrap().unwrap().summary(), before);
}

// =============================================================================
// Failures roll back
// =============================================================================

#[test]
fn test_dangling_replace_fails_and_leaves_store_unchanged() {
    let mut store = GraphStore::open_in_memory().unwrap();
    MergeEngine::new(&mut store, MergeOptions::default())
        .merge(&[prometheus("0.14.0")])
        .unwrap();
    let generation = store.generation().unwrap();
    let before = store.catalog().unwrap();

    let err = MergeEngine::new(&mut store, MergeOptions::default())
        .merge(&[
            prometheus("0.15.0").with_replaces("prometheusoperator.0.14.0"),
            prometheus("0.22.2").with_replaces("prometheusoperator.0.20.0"),
        ])
        .unwrap_err();
    assert!(matches!(err, CatalogError::DanglingReplace { .. }));
    assert_eq!(store.generation().unwrap(), generation);
    assert_eq!(store.catalog().unwrap(), before);
}

fn live(store: &GraphStore) -> Vec<String> {
    let mut names: Vec<String> = store
        .list_bundles("prometheus", false)
        .unwrap()
        .into_iter()
        .map(|b| b.node.name)
        .collect();
    names.sort();
    names
}

fn permissive() -> MergeOptions {
    MergeOptions {
        permissive: true,
        ..MergeOptions::default()
    }
}

#[test]
fn test_permissive_merge_follows_existing_chain() {
    let mut store = GraphStore::open_in_memory().unwrap();
    MergeEngine::new(&mut store, MergeOptions::default())
        .merge(&[prometheus("0.14.0")])
        .unwrap();

    let report = MergeEngine::new(&mut store, permissive())
        .merge(&[
            prometheus("0.15.0").with_replaces("prometheusoperator.0.14.0"),
            prometheus("0.22.2").with_replaces("prometheusoperator.0.20.0"),
        ])
        .unwrap();
    let warnings = report.warnings();
    assert!(warnings.has(WarningCode::DanglingReplace));
    assert!(warnings.has(WarningCode::MultipleHeads));
    assert!(warnings.has(WarningCode::Rejected));

    // the chain through the stored head survives; the dangling newcomer does not
    assert_eq!(head(&store, "prometheus", "preview"), "prometheusoperator.0.15.0");
    assert_eq!(live(&store), vec!["prometheusoperator.0.14.0", "prometheusoperator.0.15.0"]);
    let package = report.package("prometheus").unwrap();
    assert!(package.pruned.is_empty());
    assert_eq!(package.added, vec!["prometheusoperator.0.15.0"]);
    assert_eq!(package.rejected, vec!["prometheusoperator.0.22.2"]);
}

#[test]
fn test_permissive_dangling_bundle_alone_is_rejected_not_added() {
    let mut store = GraphStore::open_in_memory().unwrap();
    MergeEngine::new(&mut store, MergeOptions::default())
        .merge(&[prometheus("0.14.0")])
        .unwrap();

    let report = MergeEngine::new(&mut store, permissive())
        .merge(&[prometheus("0.22.2").with_replaces("prometheusoperator.0.20.0")])
        .unwrap();
    let package = report.package("prometheus").unwrap();
    assert!(package.added.is_empty());
    assert!(package.pruned.is_empty());
    assert_eq!(package.rejected, vec!["prometheusoperator.0.22.2"]);
    assert!(report.warnings().has(WarningCode::Rejected));

    assert_eq!(head(&store, "prometheus", "preview"), "prometheusoperator.0.14.0");
    assert_eq!(live(&store), vec!["prometheusoperator.0.14.0"]);
}

#[test]
fn test_divergent_content_needs_overwrite() {
    let mut store = GraphStore::open_in_memory().unwrap();
    MergeEngine::new(&mut store, MergeOptions::default())
        .merge(&[prometheus("0.14.0")])
        .unwrap();

    let mut changed = prometheus("0.14.0");
    changed.content = json!({"kind": "ClusterServiceVersion", "rebuilt": true});
    let err = MergeEngine::new(&mut store, MergeOptions::default())
        .merge(&[changed.clone()])
        .unwrap_err();
    assert!(matches!(err, CatalogError::Conflict(_)));

    let options = MergeOptions {
        overwrite: true,
        ..MergeOptions::default()
    };
    let report = MergeEngine::new(&mut store, options).merge(&[changed.clone()]).unwrap();
    assert!(report.warnings().has(WarningCode::Superseded));
    let stored = store.get_head("prometheus", "preview").unwrap().unwrap();
    assert_eq!(stored.node.digest, changed.digest());
}

// =============================================================================
// Upgrade queries
// =============================================================================

#[test]
fn test_skip_range_reaches_head_without_edges() {
    let mut store = GraphStore::open_in_memory().unwrap();
    MergeEngine::new(&mut store, MergeOptions::default())
        .merge(&[
            prometheus("0.14.0"),
            prometheus("0.15.0").with_replaces("prometheusoperator.0.14.0"),
            prometheus("0.22.2")
                .with_replaces("prometheusoperator.0.15.0")
                .with_skip_range(SkipRange::parse(">=0.14.0 <0.22.2").unwrap()),
        ])
        .unwrap();
    let graph = store.snapshot("prometheus").unwrap().unwrap();
    assert!(graph.channel("preview").unwrap().skips.is_empty());

    let targets: Vec<String> = upgrade_targets(
        &graph,
        "preview",
        "prometheusoperator.0.14.0",
        &Version::new(0, 14, 0),
    )
    .into_iter()
    .map(|id| graph.bundle(id).name.clone())
    .collect();
    assert_eq!(targets, vec!["prometheusoperator.0.22.2", "prometheusoperator.0.15.0"]);
}

#[test]
fn test_stale_base_is_rejected() {
    let mut store = GraphStore::open_in_memory().unwrap();
    let base = store.generation().unwrap();
    MergeEngine::new(&mut store, MergeOptions::default())
        .merge(&[prometheus("0.14.0")])
        .unwrap();

    let err = MergeEngine::new(&mut store, MergeOptions::default())
        .merge_with_base(base, &[prometheus("0.15.0").with_replaces("prometheusoperator.0.14.0")])
        .unwrap_err();
    assert!(matches!(err, CatalogError::BaseMismatch { .. }));
    assert_eq!(head(&store, "prometheus", "preview"), "prometheusoperator.0.14.0");
}
