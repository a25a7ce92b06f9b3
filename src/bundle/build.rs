//! Bundle image builds
//!
//! Turns a directory of manifests into a bundle image: writes the package
//! annotations and a `bundle.Dockerfile` next to the manifests, then hands
//! the build to the container engine.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::manifest::{package_annotations, AnnotationsFile, ANNOTATIONS_PATH, MANIFESTS_DIR};
use crate::error::{CatalogError, Result};
use crate::index::{Cancellation, ImageEngine};

pub const BUNDLE_DOCKERFILE: &str = "bundle.Dockerfile";

/// What to build
#[derive(Debug, Clone)]
pub struct BundleBuildRequest {
    /// Bundle directory holding `manifests/`
    pub manifest_dir: PathBuf,
    pub tag: String,
    pub package: String,
    pub channels: Vec<String>,
    pub default_channel: Option<String>,
    /// Replace existing annotations instead of refusing
    pub overwrite: bool,
}

/// Builds bundle images through an [`ImageEngine`]
pub struct BundleBuilder<'e> {
    engine: &'e dyn ImageEngine,
}

impl<'e> BundleBuilder<'e> {
    pub fn new(engine: &'e dyn ImageEngine) -> Self {
        Self { engine }
    }

    /// Write annotations and Dockerfile, then build; returns the Dockerfile path
    pub fn build(&self, request: &BundleBuildRequest, cancel: &Cancellation) -> Result<PathBuf> {
        let dockerfile = generate(request)?;
        let context = request
            .manifest_dir
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        self.engine.build(context, &dockerfile, &request.tag, cancel)?;
        info!(tag = %request.tag, package = %request.package, "bundle image built");
        Ok(dockerfile)
    }
}

/// Write `metadata/annotations.json` and `bundle.Dockerfile` for a bundle
/// directory without building
pub fn generate(request: &BundleBuildRequest) -> Result<PathBuf> {
    let dir = &request.manifest_dir;
    if !dir.join(MANIFESTS_DIR).is_dir() {
        return Err(CatalogError::validation(format!(
            "{} has no {}/ directory",
            dir.display(),
            MANIFESTS_DIR
        )));
    }
    if request.package.trim().is_empty() {
        return Err(CatalogError::validation("bundle package is empty"));
    }
    if request.channels.is_empty() {
        return Err(CatalogError::validation("bundle must name at least one channel"));
    }
    if let Some(default) = &request.default_channel {
        if !request.channels.contains(default) {
            return Err(CatalogError::validation(format!(
                "default channel {} is not one of {}",
                default,
                request.channels.join(",")
            )));
        }
    }

    let annotations_path = dir.join(ANNOTATIONS_PATH);
    let annotations = package_annotations(
        &request.package,
        &request.channels,
        request.default_channel.as_deref(),
    );
    if annotations_path.exists() && !request.overwrite {
        let existing = AnnotationsFile::load(&annotations_path)?;
        if existing.annotations != annotations {
            return Err(CatalogError::conflict(format!(
                "{} already exists with different values; pass overwrite to replace it",
                annotations_path.display()
            )));
        }
    } else {
        AnnotationsFile {
            annotations: annotations.clone(),
        }
        .save(&annotations_path)?;
    }

    let dockerfile = dir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join(BUNDLE_DOCKERFILE);
    fs::write(&dockerfile, render_dockerfile(dir, &annotations))?;
    Ok(dockerfile)
}

fn render_dockerfile(dir: &Path, annotations: &std::collections::BTreeMap<String, String>) -> String {
    let base = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string());
    let mut out = String::from("FROM scratch\n\n");
    for (key, value) in annotations {
        out.push_str(&format!("LABEL {}={}\n", key, value));
    }
    out.push('\n');
    out.push_str(&format!("COPY {}/{} /manifests/\n", base, MANIFESTS_DIR));
    out.push_str(&format!("COPY {}/metadata /metadata/\n", base));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        builds: RefCell<Vec<String>>,
    }

    impl ImageEngine for Recorder {
        fn build(&self, _: &Path, dockerfile: &Path, tag: &str, _: &Cancellation) -> Result<()> {
            assert!(dockerfile.is_file());
            self.builds.borrow_mut().push(tag.to_string());
            Ok(())
        }
        fn tag(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn push(&self, _: &str, _: &Cancellation) -> Result<()> {
            Ok(())
        }
        fn pull(&self, _: &str, _: &Cancellation) -> Result<()> {
            Ok(())
        }
        fn login(&self, _: &str, _: &crate::index::Credentials) -> Result<()> {
            Ok(())
        }
        fn save(&self, _: &str, _: &Path, _: &Cancellation) -> Result<()> {
            Ok(())
        }
        fn remove(&self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    fn request(dir: &Path) -> BundleBuildRequest {
        BundleBuildRequest {
            manifest_dir: dir.join("0.14.0"),
            tag: "quay.io/example/prometheus:0.14.0".into(),
            package: "prometheus".into(),
            channels: vec!["preview".into()],
            default_channel: Some("preview".into()),
            overwrite: false,
        }
    }

    #[test]
    fn test_build_writes_annotations_and_dockerfile() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("0.14.0/manifests")).unwrap();
        let engine = Recorder::default();

        let dockerfile = BundleBuilder::new(&engine)
            .build(&request(dir.path()), &Cancellation::new())
            .unwrap();
        let text = fs::read_to_string(&dockerfile).unwrap();
        assert!(text.contains("LABEL operators.operatorframework.io.bundle.package.v1=prometheus"));
        assert!(text.contains("COPY 0.14.0/manifests /manifests/"));
        assert_eq!(engine.builds.borrow().as_slice(), ["quay.io/example/prometheus:0.14.0"]);
    }

    #[test]
    fn test_refuses_to_replace_annotations() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("0.14.0/manifests")).unwrap();
        generate(&request(dir.path())).unwrap();

        let mut changed = request(dir.path());
        changed.channels = vec!["stable".into()];
        changed.default_channel = None;
        assert!(matches!(generate(&changed), Err(CatalogError::Conflict(_))));

        changed.overwrite = true;
        generate(&changed).unwrap();
    }
}
