use std::path::PathBuf;

use sky1_kernel_builder::config::ConfigDoc;
use sky1_kernel_builder::stages::{plan_for, plan_stage};

fn doc(text: &str) -> ConfigDoc {
    ConfigDoc {
        path: PathBuf::from("<mem>"),
        value: toml::from_str(text).unwrap(),
    }
}

fn ids(plan: &sky1_kernel_builder::planner::Plan) -> Vec<String> {
    plan.ordered()
        .unwrap()
        .into_iter()
        .map(|t| t.id.clone())
        .collect()
}

const FULL_PIPELINE: &[&str] = &[
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
];

#[test]
fn full_run_orders_every_step() {
    let d = doc(
        r#"
[build]
kernel_version = "6.18.9"
"#,
    );
    let plan = plan_for(&d).unwrap();
    assert_eq!(ids(&plan), FULL_PIPELINE);
}

#[test]
fn stage_plan_drops_earlier_stages() {
    let d = doc("[build]\nkernel_version = \"6.19-rc7\"\nvariant = \"rc\"\n");

    let build = plan_stage(&d, "build").unwrap();
    assert_eq!(
        ids(&build),
        ["build.verify", "build.configure", "build.compile", "build.collect"]
    );

    let publish = plan_stage(&d, "publish").unwrap();
    assert_eq!(ids(&publish), ["publish.verify", "publish.upload"]);
}

#[test]
fn disabled_optional_step_keeps_the_chain() {
    let d = doc(
        r#"
[build]
kernel_version = "6.18.9"

[build.steps.configure]
enabled = false

[package]
enabled = false
"#,
    );
    let got = ids(&plan_for(&d).unwrap());
    assert!(!got.iter().any(|id| id == "build.configure"));
    assert!(!got.iter().any(|id| id.starts_with("package.")));

    let pos = |id: &str| got.iter().position(|t| t == id).unwrap();
    assert!(pos("build.verify") < pos("build.compile"));
    assert!(pos("build.collect") < pos("publish.verify"));
}

#[test]
fn smoke_test_runs_between_verify_and_configure_when_enabled() {
    let off = doc("[build]\nkernel_version = \"6.19\"\n");
    assert!(!ids(&plan_for(&off).unwrap()).iter().any(|id| id == "build.smoke"));

    let on = doc(
        r#"
[build]
kernel_version = "6.19"

[build.steps.smoke]
enabled = true
targets = ["all"]
"#,
    );
    assert_eq!(
        ids(&plan_stage(&on, "build").unwrap()),
        [
            "build.verify",
            "build.smoke",
            "build.configure",
            "build.compile",
            "build.collect"
        ]
    );
}

#[test]
fn required_steps_cannot_be_disabled() {
    let d = doc(
        r#"
[build]
kernel_version = "6.18.9"

[publish.steps.verify]
enabled = false
"#,
    );
    let err = plan_for(&d).unwrap_err().to_string();
    assert!(err.contains("publish.steps.verify"), "{err}");
}

#[test]
fn unknown_variant_is_rejected_at_plan_time() {
    let d = doc("[build]\nvariant = \"experimental\"\n");
    let err = plan_for(&d).unwrap_err().to_string();
    assert!(err.contains("unknown variant 'experimental'"), "{err}");
    assert!(err.contains("main"), "{err}");
}

#[test]
fn unknown_table_is_rejected() {
    let d = doc("[rootfs]\nenabled = true\n");
    let err = plan_for(&d).unwrap_err().to_string();
    assert!(err.contains("unknown config table 'rootfs'"), "{err}");
}

#[test]
fn custom_variant_plans_like_a_builtin() {
    let d = doc(
        r#"
[build]
kernel_version = "6.20"
variant = "lts"

[variants.lts]
config = "configs/config.lts"
patches = "patches/lts"
localversion = "-sky1-lts"
"#,
    );
    assert_eq!(ids(&plan_for(&d).unwrap()), FULL_PIPELINE);
}

#[test]
fn dot_output_lists_dependencies() {
    let d = doc("[build]\nkernel_version = \"6.18.9\"\n");
    let dot = plan_for(&d).unwrap().to_dot().unwrap();
    assert!(dot.starts_with("digraph"), "{dot}");
    assert!(dot.contains("\"source.fetch\" -> \"source.patch\""), "{dot}");
    assert!(dot.contains("\"publish.verify\" -> \"publish.upload\""), "{dot}");
}
