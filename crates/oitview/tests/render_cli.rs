use std::fs;
use std::process::Command;

use tempfile::TempDir;

const CONFIG: &str = r##"
version = 1

[technique]
mode = "three-target"
sample_count = "4x"
dither_table_size = 256
seed = 11

[viewport]
width = 16
height = 8

[background]
color = "#0000ff"
"##;

const SCENE: &str = r##"
[[quad]]
rect = [-1.0, -1.0, 1.0, 1.0]
depth = 0.5
color = "#ff0000"
alpha = 1.0
"##;

fn oitview() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_oitview"));
    command.env_remove("OITVIEW_CONFIG").env("RUST_LOG", "warn");
    command
}

#[test]
fn render_writes_png_of_configured_size() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("oit.toml");
    let scene = dir.path().join("scene.toml");
    let output = dir.path().join("out/frame.png");
    fs::write(&config, CONFIG).unwrap();
    fs::write(&scene, SCENE).unwrap();

    let status = oitview()
        .arg("--config")
        .arg(&config)
        .arg("render")
        .arg(&scene)
        .arg("--output")
        .arg(&output)
        .args(["--device", "cpu", "--frames", "2"])
        .status()
        .expect("failed to run oitview render");
    assert!(status.success());

    let image = image::open(&output).unwrap().to_rgba8();
    assert_eq!(image.dimensions(), (16, 8));
    assert!(image.pixels().all(|pixel| pixel.0 == [255, 0, 0, 255]));
}

#[test]
fn empty_scene_renders_background() {
    let dir = TempDir::new().unwrap();
    let scene = dir.path().join("empty.toml");
    let output = dir.path().join("empty.png");
    fs::write(&scene, "").unwrap();

    let status = oitview()
        .args(["--size", "4x4", "--samples", "2", "--background", "#00ff00"])
        .arg("render")
        .arg(&scene)
        .arg("-o")
        .arg(&output)
        .status()
        .expect("failed to run oitview render");
    assert!(status.success());

    let image = image::open(&output).unwrap().to_rgba8();
    assert!(image.pixels().all(|pixel| pixel.0 == [0, 255, 0, 255]));
}

#[test]
fn invalid_scene_fails() {
    let dir = TempDir::new().unwrap();
    let scene = dir.path().join("bad.toml");
    fs::write(
        &scene,
        "[[quad]]\nrect = [-1.0, -1.0, 1.0, 1.0]\ndepth = 0.5\ncolor = [1.0, 0.0, 0.0]\nalpha = 2.0\n",
    )
    .unwrap();

    let output = oitview()
        .args(["--size", "4x4", "render"])
        .arg(&scene)
        .arg("-o")
        .arg(dir.path().join("bad.png"))
        .output()
        .expect("failed to run oitview render");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("alpha"), "{stderr}");
}

#[test]
fn table_reports_statistics() {
    let output = oitview()
        .args(["--samples", "8", "--table-size", "512", "--alpha-levels", "16", "table"])
        .output()
        .expect("failed to run oitview table");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("512 columns x 17 rows"), "{stdout}");
    assert!(stdout.contains("max mean error"), "{stdout}");
}

#[test]
fn config_prints_resolved_document() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("oit.toml");
    fs::write(&config, CONFIG).unwrap();

    let output = oitview()
        .arg("--config")
        .arg(&config)
        .args(["--mode", "merged", "config"])
        .output()
        .expect("failed to run oitview config");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("mode = \"two-target-merged\""), "{stdout}");
    assert!(stdout.contains("sample_count = 4"), "{stdout}");
    assert!(stdout.contains("width = 16"), "{stdout}");
}

#[test]
fn oversized_sample_count_is_a_configuration_error() {
    let output = oitview()
        .args(["--samples", "64", "config"])
        .output()
        .expect("failed to run oitview config");
    assert!(!output.status.success());
}

#[test]
fn oversized_table_is_a_configuration_error() {
    let output = oitview()
        .args(["--table-size", "2147483648", "table"])
        .output()
        .expect("failed to run oitview table");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("dither_table_size"), "{stderr}");
}
