//! Index add, delete and export against an in-process image engine
//!
//! `FakeEngine` keeps images in memory. `build` reads the Dockerfile's
//! LABEL and ADD lines; `save` writes a real `docker save` style archive so
//! extraction runs the same code as against docker or podman.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use catalog_index::bundle::manifest::write_bundle_dir;
use catalog_index::index::{
    AddToIndexRequest, Cancellation, Credentials, DeleteFromIndexRequest, ExportFromIndexRequest,
    ContainerTool, Extractor, ImageEngine, IndexAdder, IndexDeleter, IndexExporter, RenderOutcome,
    BASE_LABEL, DIGEST_LABEL,
};
use catalog_index::{BundleDescriptor, CatalogError, DirectoryLoader, GraphStore, MergeOptions, Result};
use semver::Version;
use serde_json::json;
use tempfile::TempDir;
use walkdir::WalkDir;

#[derive(Debug, Clone, Default)]
struct FakeImage {
    labels: BTreeMap<String, String>,
    files: Vec<(String, Vec<u8>)>,
}

#[derive(Default)]
struct FakeEngine {
    images: Mutex<BTreeMap<String, FakeImage>>,
}

impl FakeEngine {
    fn insert(&self, tag: &str, image: FakeImage) {
        self.images.lock().unwrap().insert(tag.to_string(), image);
    }

    fn get(&self, tag: &str) -> Option<FakeImage> {
        self.images.lock().unwrap().get(tag).cloned()
    }

    fn tags(&self) -> Vec<String> {
        self.images.lock().unwrap().keys().cloned().collect()
    }

    /// Register a bundle image holding `desc` in the export layout
    fn push_bundle(&self, tag: &str, desc: &BundleDescriptor) {
        let dir = TempDir::new().unwrap();
        let bundle = write_bundle_dir(dir.path(), desc).unwrap();
        let mut image = FakeImage::default();
        for entry in WalkDir::new(&bundle).sort_by_file_name() {
            let entry = entry.unwrap();
            if entry.file_type().is_file() {
                let relative = entry.path().strip_prefix(&bundle).unwrap();
                image
                    .files
                    .push((relative.to_string_lossy().into_owned(), fs::read(entry.path()).unwrap()));
            }
        }
        self.insert(tag, image);
    }
}

impl ImageEngine for FakeEngine {
    fn build(&self, context_dir: &Path, dockerfile: &Path, tag: &str, cancel: &Cancellation) -> Result<()> {
        cancel.check("build")?;
        let mut image = FakeImage::default();
        for line in fs::read_to_string(dockerfile)?.lines() {
            if let Some(label) = line.strip_prefix("LABEL ") {
                if let Some((key, value)) = label.split_once('=') {
                    image.labels.insert(key.to_string(), value.to_string());
                }
            } else if let Some(add) = line.strip_prefix("ADD ") {
                let (src, dst) = add.split_once(' ').unwrap();
                image.files.push((
                    dst.trim_start_matches('/').to_string(),
                    fs::read(context_dir.join(src))?,
                ));
            }
        }
        self.insert(tag, image);
        Ok(())
    }

    fn tag(&self, source: &str, target: &str) -> Result<()> {
        let image = self
            .get(source)
            .ok_or_else(|| CatalogError::Image(format!("no image {}", source)))?;
        self.insert(target, image);
        Ok(())
    }

    fn push(&self, _: &str, _: &Cancellation) -> Result<()> {
        Ok(())
    }

    fn pull(&self, image: &str, cancel: &Cancellation) -> Result<()> {
        cancel.check("pull")?;
        match self.get(image) {
            Some(_) => Ok(()),
            None => Err(CatalogError::Image(format!("manifest for {} not found", image))),
        }
    }

    fn login(&self, _: &str, _: &Credentials) -> Result<()> {
        Ok(())
    }

    fn save(&self, image: &str, archive: &Path, _: &Cancellation) -> Result<()> {
        let saved = self
            .get(image)
            .ok_or_else(|| CatalogError::Image(format!("no image {}", image)))?;

        let mut layer = tar::Builder::new(Vec::new());
        for (path, data) in &saved.files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            layer.append_data(&mut header, path, data.as_slice())?;
        }
        let layer = layer.into_inner()?;
        let config = json!({"config": {"Labels": saved.labels}});
        let manifest = json!([{"Config": "config.json", "RepoTags": [image], "Layers": ["layer/layer.tar"]}]);

        let mut out = tar::Builder::new(File::create(archive)?);
        for (name, data) in [
            ("manifest.json", manifest.to_string().into_bytes()),
            ("config.json", config.to_string().into_bytes()),
            ("layer/layer.tar", layer),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            out.append_data(&mut header, name, data.as_slice())?;
        }
        out.finish()?;
        Ok(())
    }

    fn remove(&self, tag: &str) -> Result<()> {
        self.images.lock().unwrap().remove(tag);
        Ok(())
    }
}

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

fn bundle_tag(version: &str) -> String {
    format!("quay.io/example/prometheus-bundle:{}", version)
}

/// Engine preloaded with the three prometheus bundle images
fn engine() -> FakeEngine {
    let engine = FakeEngine::default();
    engine.push_bundle(&bundle_tag("0.14.0"), &prometheus("0.14.0"));
    engine.push_bundle(
        &bundle_tag("0.15.0"),
        &prometheus("0.15.0").with_replaces("prometheusoperator.0.14.0"),
    );
    engine.push_bundle(
        &bundle_tag("0.22.2"),
        &prometheus("0.22.2").with_replaces("prometheusoperator.0.15.0"),
    );
    engine
}

fn add(engine: &FakeEngine, tag: &str, from: Option<&str>, versions: &[&str]) -> Result<catalog_index::index::AddToIndexResult> {
    let mut request = AddToIndexRequest::new(tag, versions.iter().map(|v| bundle_tag(v)).collect());
    request.from_index = from.map(String::from);
    IndexAdder::new(engine, Cancellation::new()).add_to_index(&request)
}

fn heads(engine: &FakeEngine, image: &str) -> BTreeMap<String, String> {
    Extractor::new(engine)
        .snapshot(image, &Cancellation::new())
        .unwrap()
        .package("prometheus")
        .unwrap()
        .heads()
}

// =============================================================================
// Add
// =============================================================================

#[test]
fn test_add_builds_incrementally_on_from_index() {
    let engine = engine();
    let first = add(&engine, "quay.io/example/index:1", None, &["0.14.0"]).unwrap();
    assert!(matches!(first.outcome, RenderOutcome::Built { .. }));
    assert_eq!(heads(&engine, "quay.io/example/index:1")["preview"], "prometheusoperator.0.14.0");

    add(&engine, "quay.io/example/index:2", Some("quay.io/example/index:1"), &["0.15.0"]).unwrap();
    add(&engine, "quay.io/example/index:3", Some("quay.io/example/index:2"), &["0.22.2"]).unwrap();
    assert_eq!(heads(&engine, "quay.io/example/index:3")["preview"], "prometheusoperator.0.22.2");
    // earlier images are untouched
    assert_eq!(heads(&engine, "quay.io/example/index:2")["preview"], "prometheusoperator.0.15.0");

    let third = engine.get("quay.io/example/index:3").unwrap();
    assert_eq!(third.labels.get(BASE_LABEL).map(String::as_str), Some("quay.io/example/index:2"));
    assert!(third.labels.contains_key(DIGEST_LABEL));
    assert!(engine.tags().iter().all(|t| !t.starts_with("catalog-index-staging")));
}

#[test]
fn test_add_over_the_base_tag() {
    let engine = engine();
    add(&engine, "quay.io/example/index:latest", None, &["0.14.0"]).unwrap();
    add(
        &engine,
        "quay.io/example/index:latest",
        Some("quay.io/example/index:latest"),
        &["0.15.0"],
    )
    .unwrap();
    assert_eq!(heads(&engine, "quay.io/example/index:latest")["preview"], "prometheusoperator.0.15.0");
}

#[test]
fn test_failed_merge_publishes_nothing() {
    let engine = engine();
    let err = add(&engine, "quay.io/example/index:broken", None, &["0.22.2"]).unwrap_err();
    assert!(matches!(err, CatalogError::DanglingReplace { .. }));
    assert!(engine.get("quay.io/example/index:broken").is_none());

    let mut request = AddToIndexRequest::new("quay.io/example/index:loose", vec![bundle_tag("0.22.2")]);
    request.permissive = true;
    let result = IndexAdder::new(&engine, Cancellation::new()).add_to_index(&request).unwrap();
    assert!(!result.report.warnings().is_empty());
    assert_eq!(heads(&engine, "quay.io/example/index:loose")["preview"], "prometheusoperator.0.22.2");
}

#[test]
fn test_cancelled_add_tags_nothing() {
    let engine = engine();
    let cancel = Cancellation::new();
    cancel.cancel();
    let request = AddToIndexRequest::new("quay.io/example/index:1", vec![bundle_tag("0.14.0")]);
    let err = IndexAdder::new(&engine, cancel).add_to_index(&request).unwrap_err();
    assert!(matches!(err, CatalogError::Cancelled(_)));
    assert!(engine.get("quay.io/example/index:1").is_none());
}

#[test]
fn test_generate_writes_build_context() {
    let engine = engine();
    let dir = TempDir::new().unwrap();
    let mut request = AddToIndexRequest::new("quay.io/example/index:1", vec![bundle_tag("0.14.0")]);
    request.generate = true;
    request.out_dockerfile = Some(dir.path().join("index.Dockerfile"));

    let result = IndexAdder::new(&engine, Cancellation::new()).add_to_index(&request).unwrap();
    let RenderOutcome::Generated { dockerfile, database, .. } = result.outcome else {
        panic!("expected a generated descriptor");
    };
    assert_eq!(dockerfile, dir.path().join("index.Dockerfile"));
    assert_eq!(database, dir.path().join("database/index.db"));
    let text = fs::read_to_string(&dockerfile).unwrap();
    assert!(text.contains("ADD database/index.db /database/index.db"));
    assert!(engine.get("quay.io/example/index:1").is_none());

    let store = GraphStore::open(&database).unwrap();
    assert_eq!(
        store.get_head("prometheus", "preview").unwrap().unwrap().node.name,
        "prometheusoperator.0.14.0"
    );
}

#[test]
fn test_failed_generate_keeps_previous_context() {
    let engine = engine();
    let dir = TempDir::new().unwrap();
    let dockerfile = dir.path().join("index.Dockerfile");
    let database = dir.path().join("database/index.db");

    let mut first = AddToIndexRequest::new("quay.io/example/index:1", vec![bundle_tag("0.14.0")]);
    first.generate = true;
    first.out_dockerfile = Some(dockerfile.clone());
    IndexAdder::new(&engine, Cancellation::new()).add_to_index(&first).unwrap();
    let database_before = fs::read(&database).unwrap();
    let dockerfile_before = fs::read_to_string(&dockerfile).unwrap();

    let mut broken = first.clone();
    broken.bundles = vec![bundle_tag("0.22.2")];
    let err = IndexAdder::new(&engine, Cancellation::new()).add_to_index(&broken).unwrap_err();
    assert!(matches!(err, CatalogError::DanglingReplace { .. }));

    assert_eq!(fs::read(&database).unwrap(), database_before);
    assert_eq!(fs::read_to_string(&dockerfile).unwrap(), dockerfile_before);
    // only the published files are left in the context
    let mut left: Vec<String> = WalkDir::new(dir.path())
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(dir.path()).unwrap().to_string_lossy().into_owned())
        .collect();
    left.sort();
    assert_eq!(left, vec!["database/index.db", "index.Dockerfile"]);
    let store = GraphStore::open(&database).unwrap();
    assert_eq!(
        store.get_head("prometheus", "preview").unwrap().unwrap().node.name,
        "prometheusoperator.0.14.0"
    );
}

#[test]
fn test_concurrent_adds_to_distinct_tags() {
    let engine = engine();
    add(&engine, "quay.io/example/index:base", None, &["0.14.0"]).unwrap();

    std::thread::scope(|scope| {
        let a = scope.spawn(|| add(&engine, "quay.io/example/index:a", Some("quay.io/example/index:base"), &["0.15.0"]));
        let b = scope.spawn(|| add(&engine, "quay.io/example/index:b", Some("quay.io/example/index:base"), &["0.15.0", "0.22.2"]));
        a.join().unwrap().unwrap();
        b.join().unwrap().unwrap();
    });

    assert_eq!(heads(&engine, "quay.io/example/index:a")["preview"], "prometheusoperator.0.15.0");
    assert_eq!(heads(&engine, "quay.io/example/index:b")["preview"], "prometheusoperator.0.22.2");
    assert_eq!(heads(&engine, "quay.io/example/index:base")["preview"], "prometheusoperator.0.14.0");
}

// =============================================================================
// Delete and export
// =============================================================================

#[test]
fn test_delete_package_from_index() {
    let engine = engine();
    add(&engine, "quay.io/example/index:1", None, &["0.14.0"]).unwrap();

    let request = DeleteFromIndexRequest {
        from_index: "quay.io/example/index:1".into(),
        packages: vec!["prometheus".into()],
        tag: "quay.io/example/index:2".into(),
        generate: false,
        binary_source_image: None,
        out_dockerfile: None,
        database_path: None,
    };
    IndexDeleter::new(&engine, Cancellation::new()).delete_from_index(&request).unwrap();
    let catalog = Extractor::new(&engine)
        .snapshot("quay.io/example/index:2", &Cancellation::new())
        .unwrap();
    assert!(catalog.packages.is_empty());

    let mut missing = request.clone();
    missing.tag = "quay.io/example/index:3".into();
    missing.packages = vec!["etcd".into()];
    let err = IndexDeleter::new(&engine, Cancellation::new()).delete_from_index(&missing).unwrap_err();
    assert!(matches!(err, CatalogError::NotFound(_)));
}

#[test]
fn test_export_from_index_round_trips() {
    let engine = engine();
    add(&engine, "quay.io/example/index:1", None, &["0.14.0", "0.15.0", "0.22.2"]).unwrap();

    let dir = TempDir::new().unwrap();
    let download: PathBuf = dir.path().join("prometheus");
    let request = ExportFromIndexRequest {
        index: "quay.io/example/index:1".into(),
        package: "prometheus".into(),
        download_path: download.clone(),
        container_tool: ContainerTool::Podman,
        minimal: false,
    };
    let summary = IndexExporter::new(&engine, Cancellation::new())
        .export_from_index(&request)
        .unwrap();
    assert_eq!(summary.bundles.len(), 3);

    let mut store = GraphStore::open_in_memory().unwrap();
    DirectoryLoader::new(&download, MergeOptions::default())
        .populate(&mut store)
        .unwrap();
    let source = Extractor::new(&engine)
        .snapshot("quay.io/example/index:1", &Cancellation::new())
        .unwrap();
    assert_eq!(
        store.snapshot("prometheus").unwrap().unwrap().summary(),
        source.package("prometheus").unwrap().summary()
    );
}
