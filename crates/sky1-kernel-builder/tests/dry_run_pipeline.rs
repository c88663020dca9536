use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use sky1_kernel_builder::config::ConfigDoc;
use sky1_kernel_builder::executor::{ExecCtx, ExecEvent, MemorySink, builtin_registry, execute_plan};
use sky1_kernel_builder::stages::{plan_for, plan_stage};

struct Workspace {
    _tmp: tempfile::TempDir,
    root: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        fs::create_dir_all(root.join("patches/main")).unwrap();
        fs::create_dir_all(root.join("configs")).unwrap();
        fs::write(root.join("configs/config.sky1"), "CONFIG_ARM64=y\n").unwrap();
        Self { _tmp: tmp, root }
    }

    fn doc(&self) -> ConfigDoc {
        let text = format!(
            r#"
[workspace]
root_dir = '{root}'

[build]
kernel_version = "6.18.9"
revision = 2
jobs = 4

[variants.main]
config = 'configs/config.sky1'
patches = 'patches/main'

[publish]
repo = 'no-repo'
"#,
            root = self.root.display(),
        );
        ConfigDoc {
            path: PathBuf::from("<mem>"),
            value: toml::from_str(&text).unwrap(),
        }
    }
}

fn started(sink: &MemorySink) -> Vec<String> {
    sink.events()
        .into_iter()
        .filter_map(|ev| match ev {
            ExecEvent::TaskStarted { id } => Some(id),
            _ => None,
        })
        .collect()
}

#[test]
fn dry_run_walks_every_step_without_touching_sources() {
    let ws = Workspace::new();
    let doc = ws.doc();
    let plan = plan_for(&doc).unwrap();
    let reg = builtin_registry().unwrap();
    let sink = Arc::new(MemorySink::default());
    let mut ctx = ExecCtx::new(true, sink.clone());

    execute_plan(&doc, &plan, &reg, &mut ctx).unwrap();

    assert_eq!(
        started(&sink),
        [
            "core.init",
            "source.fetch",
            "source.patch",
            "build.verify",
            "build.configure",
            "build.compile",
            "build.collect",
            "package.fixup",
            "package.meta",
            "publish.verify",
            "publish.upload",
        ]
    );

    let lines = sink.lines();
    let compile = lines
        .iter()
        .find(|l| l.contains("bindeb-pkg"))
        .unwrap_or_else(|| panic!("no compile line in {lines:#?}"));
    assert!(compile.starts_with("DRY-RUN:"), "{compile}");
    assert!(compile.contains("-j4"), "{compile}");
    assert!(compile.contains("LOCALVERSION=-sky1"), "{compile}");
    assert!(compile.contains("KDEB_PKGVERSION=6.18.9-2"), "{compile}");
    assert!(
        lines.iter().any(|l| l.contains("DRY-RUN: download")
            && l.contains("linux-6.18.9.tar.xz")),
        "{lines:#?}"
    );

    assert!(!ws.root.join("build/main/src").exists());
    assert!(!ws.root.join("configs/.config").exists());
    assert!(ws.root.join("build").is_dir());
    assert!(ws.root.join("out").is_dir());
}

#[test]
fn dry_run_of_a_single_stage_runs_only_that_stage() {
    let ws = Workspace::new();
    let doc = ws.doc();
    let plan = plan_stage(&doc, "package").unwrap();
    let reg = builtin_registry().unwrap();
    let sink = Arc::new(MemorySink::default());
    let mut ctx = ExecCtx::new(true, sink.clone());

    execute_plan(&doc, &plan, &reg, &mut ctx).unwrap();

    assert_eq!(started(&sink), ["package.fixup", "package.meta"]);
    assert!(
        sink.lines().iter().any(|l| l.contains("no artifacts.json")),
        "{:#?}",
        sink.lines()
    );
}

#[test]
fn smoke_test_dry_run_builds_each_stock_config() {
    let ws = Workspace::new();
    let mut doc = ws.doc();
    for step in ["configure", "compile", "collect"] {
        doc.set_path(&format!("build.steps.{step}.enabled"), toml::Value::Boolean(false))
            .unwrap();
    }
    doc.set_path("build.steps.smoke.enabled", toml::Value::Boolean(true))
        .unwrap();
    doc.set_path(
        "build.steps.smoke.targets",
        toml::Value::Array(vec![toml::Value::String("all".into())]),
    )
    .unwrap();
    doc.set_path("build.steps.smoke.warnings", toml::Value::Boolean(true))
        .unwrap();

    let plan = plan_stage(&doc, "build").unwrap();
    let reg = builtin_registry().unwrap();
    let sink = Arc::new(MemorySink::default());
    let mut ctx = ExecCtx::new(true, sink.clone());
    execute_plan(&doc, &plan, &reg, &mut ctx).unwrap();

    assert_eq!(started(&sink), ["build.verify", "build.smoke"]);
    let make: Vec<String> = sink
        .lines()
        .into_iter()
        .filter(|l| l.starts_with("DRY-RUN:") && l.contains("\"make\""))
        .collect();
    assert_eq!(make.len(), 5, "{make:#?}");
    assert!(make[0].contains("allyesconfig"), "{}", make[0]);
    assert!(make[1].contains("-j4") && make[1].contains("W=1"), "{}", make[1]);
    assert!(make[1].contains("Image") && make[1].contains("modules"), "{}", make[1]);
    assert!(make[2].contains("clean"), "{}", make[2]);
    assert!(make[3].contains("allmodconfig"), "{}", make[3]);
    assert!(!ws.root.join("build/main/src").exists());
}

#[test]
fn failing_step_stops_the_run() {
    let ws = Workspace::new();
    fs::remove_file(ws.root.join("configs/config.sky1")).unwrap();
    let doc = ws.doc();
    let plan = plan_for(&doc).unwrap();
    let reg = builtin_registry().unwrap();
    let sink = Arc::new(MemorySink::default());
    let mut ctx = ExecCtx::new(true, sink.clone());

    let err = execute_plan(&doc, &plan, &reg, &mut ctx).unwrap_err();
    assert!(err.to_string().contains("build.configure"), "{err}");
    assert_eq!(started(&sink).last().map(String::as_str), Some("build.configure"));
    assert!(sink.events().iter().any(|ev| matches!(
        ev,
        ExecEvent::ExecutorDone { ok: false, .. }
    )));
}
