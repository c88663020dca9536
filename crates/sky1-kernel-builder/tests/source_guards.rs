use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sky1_kernel_builder::config::ConfigDoc;
use sky1_kernel_builder::error::ErrorKind;
use sky1_kernel_builder::executor::{ExecCtx, MemorySink};
use sky1_kernel_builder::patchset::{HASH_MARKER, SourceMarker, check_staleness};
use sky1_kernel_builder::stages::build::VerifyStep;
use sky1_kernel_builder::stages::source::apply_patch_set;

const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

struct Fixture {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    patches: PathBuf,
    src: PathBuf,
}

impl Fixture {
    /// Workspace with an empty patch set for `main` and a fetched (but not yet
    /// patched) source tree.
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let patches = root.join("patches/main");
        let src = root.join("build/main/src");
        fs::create_dir_all(&patches).unwrap();
        fs::create_dir_all(&src).unwrap();
        fs::write(
            src.join("Makefile"),
            "VERSION = 6\nPATCHLEVEL = 18\nSUBLEVEL = 9\nEXTRAVERSION =\n",
        )
        .unwrap();
        Self {
            _tmp: tmp,
            root,
            patches,
            src,
        }
    }

    fn doc(&self, kernel_version: &str) -> ConfigDoc {
        let text = format!(
            r#"
[workspace]
root_dir = '{root}'

[build]
kernel_version = "{kernel_version}"

[variants.main]
config = 'configs/config.sky1'
patches = '{patches}'
"#,
            root = self.root.display(),
            patches = self.patches.display(),
        );
        ConfigDoc {
            path: PathBuf::from("<mem>"),
            value: toml::from_str(&text).unwrap(),
        }
    }

    fn mark_fetched(&self, variant: &str, kernel_version: &str) {
        SourceMarker {
            variant: variant.into(),
            kernel_version: kernel_version.into(),
            reference: "https://cdn.example.org/linux-6.18.9.tar.xz".into(),
            patches_applied: 0,
            prepared_at: "2026-01-01T00:00:00+00:00".into(),
        }
        .write(&self.src)
        .unwrap();
    }
}

fn ctx() -> ExecCtx {
    ExecCtx::new(false, Arc::new(MemorySink::default()))
}

fn verify(doc: &ConfigDoc) -> sky1_kernel_builder::Result<()> {
    let mut ctx = ctx();
    VerifyStep::exec(doc, &mut ctx)
}

fn recorded(src: &Path) -> String {
    fs::read_to_string(src.join(HASH_MARKER))
        .unwrap()
        .trim()
        .to_string()
}

#[test]
fn empty_patch_set_prepares_and_verifies() {
    let fx = Fixture::new();
    fx.mark_fetched("main", "6.18.9");

    let outcome = apply_patch_set(&ctx(), &fx.src, &fx.patches).unwrap();
    assert_eq!(outcome.applied, 0);
    assert_eq!(outcome.digest, EMPTY_SHA256);
    assert_eq!(recorded(&fx.src), EMPTY_SHA256);

    assert_eq!(
        check_staleness(&fx.src, &fx.patches, "main").unwrap(),
        EMPTY_SHA256
    );
    verify(&fx.doc("6.18.9")).unwrap();
}

#[test]
fn patch_added_after_prepare_is_stale() {
    let fx = Fixture::new();
    fx.mark_fetched("main", "6.18.9");
    apply_patch_set(&ctx(), &fx.src, &fx.patches).unwrap();

    fs::write(
        fx.patches.join("0001-arm64-dts-sky1-fix.patch"),
        "--- a/x\n+++ b/x\n",
    )
    .unwrap();

    let err = verify(&fx.doc("6.18.9")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Stale, "{err}");
    assert!(err.to_string().contains("skb prepare"), "{err}");
    assert_eq!(recorded(&fx.src), EMPTY_SHA256);
}

#[test]
fn edited_patch_is_stale() {
    let fx = Fixture::new();
    let patch = fx.patches.join("0001-fix.patch");
    fs::write(&patch, "one\n").unwrap();
    fx.mark_fetched("main", "6.18.9");
    // Record the digest without running `patch`: the marker is what the
    // guard compares against.
    let digest = sky1_kernel_builder::patchset::digest_patch_dir(&fx.patches).unwrap();
    sky1_kernel_builder::patchset::write_hash_marker(&fx.src, &digest).unwrap();
    verify(&fx.doc("6.18.9")).unwrap();

    fs::write(&patch, "two\n").unwrap();
    let err = verify(&fx.doc("6.18.9")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Stale, "{err}");
}

#[test]
fn tree_of_another_variant_is_stale() {
    let fx = Fixture::new();
    fx.mark_fetched("rc", "6.18.9");
    apply_patch_set(&ctx(), &fx.src, &fx.patches).unwrap();

    let err = check_staleness(&fx.src, &fx.patches, "main").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Stale, "{err}");
    assert!(err.to_string().contains("'rc'"), "{err}");
}

#[test]
fn tree_of_another_kernel_version_is_stale() {
    let fx = Fixture::new();
    fx.mark_fetched("main", "6.18.8");
    apply_patch_set(&ctx(), &fx.src, &fx.patches).unwrap();

    let err = verify(&fx.doc("6.18.9")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Stale, "{err}");
    assert!(err.to_string().contains("6.18.8"), "{err}");
}

#[test]
fn unprepared_tree_is_a_missing_prerequisite() {
    let fx = Fixture::new();
    let err = verify(&fx.doc("6.18.9")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingPrerequisite, "{err}");
}

#[test]
fn missing_patch_directory_fails_before_patching() {
    let fx = Fixture::new();
    let err = apply_patch_set(&ctx(), &fx.src, &fx.root.join("patches/nope")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingPrerequisite, "{err}");
    assert!(!fx.src.join(HASH_MARKER).exists());
}
