use std::path::Path;

use anyhow::{bail, Context, Result};
use oitconfig::OitConfig;
use renderer::{
    GraphicsDevice, PixelBuffer, RendererConfig, SceneGeometry, SoftwareDevice,
    StochasticTransparency,
};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, DeviceKind, RenderArgs};
use crate::scene::SceneFile;

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Loads the configuration file, if any, and applies command-line overrides.
pub fn resolve_config(cli: &Cli) -> Result<OitConfig> {
    let mut config = match &cli.config {
        Some(path) => OitConfig::from_path(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => OitConfig::default(),
    };
    cli.overrides.apply(&mut config);
    config
        .validate()
        .context("configuration is invalid after applying overrides")?;
    tracing::debug!(
        mode = %config.technique.mode,
        samples = config.technique.sample_count,
        width = config.viewport.width,
        height = config.viewport.height,
        "resolved configuration"
    );
    Ok(config)
}

pub fn render(config: &OitConfig, args: &RenderArgs) -> Result<()> {
    if args.frames == 0 {
        bail!("--frames must be at least 1");
    }
    let scene = SceneFile::from_path(&args.scene)?;
    let batches = scene.to_batches();
    tracing::info!(
        scene = %args.scene.display(),
        opaque = batches.opaque.len(),
        transparent = batches.transparent.len(),
        device = ?args.device,
        "rendering scene"
    );

    let settings = RendererConfig::from(config);
    let pixels = match args.device {
        DeviceKind::Cpu => render_frames(SoftwareDevice::new(), settings, &batches, args.frames)?,
        DeviceKind::Gpu => render_gpu(settings, &batches, args.frames)?,
    };
    save_png(&pixels, &args.output)?;
    println!(
        "wrote {}x{} image to {}",
        pixels.width,
        pixels.height,
        args.output.display()
    );
    Ok(())
}

#[cfg(feature = "gpu")]
fn render_gpu<S>(settings: RendererConfig, scene: &S, frames: u32) -> Result<PixelBuffer>
where
    S: SceneGeometry + ?Sized,
{
    let device = renderer::WgpuDevice::new_headless().context("failed to open a GPU device")?;
    tracing::info!(adapter = %device.profile().name, "using GPU adapter");
    render_frames(device, settings, scene, frames)
}

#[cfg(not(feature = "gpu"))]
fn render_gpu<S>(_settings: RendererConfig, _scene: &S, _frames: u32) -> Result<PixelBuffer>
where
    S: SceneGeometry + ?Sized,
{
    bail!("oitview was built without the `gpu` feature; use --device cpu")
}

fn render_frames<D, S>(
    device: D,
    settings: RendererConfig,
    scene: &S,
    frames: u32,
) -> Result<PixelBuffer>
where
    D: GraphicsDevice,
    S: SceneGeometry + ?Sized,
{
    let mut renderer = StochasticTransparency::new(device, settings)
        .context("failed to initialise the renderer")?;
    for _ in 0..frames {
        let report = renderer.render_frame(scene).context("frame failed")?;
        tracing::debug!(
            frame = report.frame,
            random_offset = report.random_offset,
            "rendered frame"
        );
    }
    renderer.read_output().context("failed to read back output")
}

fn save_png(pixels: &PixelBuffer, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    pixels
        .to_rgba8()
        .save_with_format(path, image::ImageFormat::Png)
        .with_context(|| format!("failed to write {}", path.display()))
}
