use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use oitconfig::{parse_hex_color, parse_sample_count, OitConfig, TechniqueMode};

#[derive(Parser, Debug)]
#[command(
    name = "oitview",
    author,
    version,
    about = "Stochastic transparency renderer",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Renderer configuration TOML. Built-in defaults apply when omitted.
    #[arg(long, global = true, value_name = "FILE", env = "OITVIEW_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

/// Command-line overrides layered on top of the configuration file.
#[derive(Parser, Debug, Default)]
pub struct Overrides {
    /// Technique: `three-target` or `two-target-merged`.
    #[arg(long, global = true, value_name = "MODE")]
    pub mode: Option<TechniqueMode>,

    /// Samples per pixel (e.g. `8`, `8x`, `msaa8`).
    #[arg(long, global = true, value_name = "COUNT", value_parser = parse_sample_count)]
    pub samples: Option<u32>,

    /// Number of dither columns in the mask table (power of two).
    #[arg(long, global = true, value_name = "COLUMNS")]
    pub table_size: Option<u32>,

    /// Number of alpha quantization steps.
    #[arg(long, global = true, value_name = "LEVELS")]
    pub alpha_levels: Option<u32>,

    /// Seed for the mask table generator.
    #[arg(long, global = true, value_name = "SEED")]
    pub seed: Option<u64>,

    /// Output resolution (e.g. `1280x720`).
    #[arg(long, global = true, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub size: Option<(u32, u32)>,

    /// Background color as `#rrggbb`.
    #[arg(long, global = true, value_name = "COLOR", value_parser = parse_hex_color)]
    pub background: Option<[f32; 3]>,

    /// Draw a fresh dither offset every frame.
    #[arg(long, global = true)]
    pub jitter: bool,
}

impl Overrides {
    pub fn apply(&self, config: &mut OitConfig) {
        let technique = &mut config.technique;
        if let Some(mode) = self.mode {
            technique.mode = mode;
        }
        if let Some(samples) = self.samples {
            technique.sample_count = samples;
        }
        if let Some(size) = self.table_size {
            technique.dither_table_size = size;
        }
        if let Some(levels) = self.alpha_levels {
            technique.alpha_levels = levels;
        }
        if let Some(seed) = self.seed {
            technique.seed = seed;
        }
        if self.jitter {
            technique.temporal_jitter = true;
        }
        if let Some((width, height)) = self.size {
            config.viewport.width = width;
            config.viewport.height = height;
        }
        if let Some(color) = self.background {
            config.background.color = color;
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Render a scene file to a PNG image.
    Render(RenderArgs),
    /// Build a coverage mask table and report how closely it tracks alpha.
    Table(TableArgs),
    /// Print the resolved configuration as TOML.
    Config,
}

#[derive(Parser, Debug)]
pub struct RenderArgs {
    /// Scene TOML listing the quads to draw.
    #[arg(value_name = "SCENE")]
    pub scene: PathBuf,

    /// Where to write the PNG.
    #[arg(short, long, value_name = "PATH", default_value = "oitview.png")]
    pub output: PathBuf,

    /// Rendering backend.
    #[arg(long, value_enum, default_value_t = DeviceKind::Cpu)]
    pub device: DeviceKind,

    /// Frames to render before reading back; the last one is saved.
    #[arg(long, value_name = "COUNT", default_value_t = 1)]
    pub frames: u32,
}

#[derive(Parser, Debug)]
pub struct TableArgs {
    /// Print statistics for every alpha level instead of a summary.
    #[arg(long)]
    pub all_rows: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeviceKind {
    /// CPU reference rasterizer.
    Cpu,
    /// Headless wgpu device.
    Gpu,
}

pub fn parse() -> Cli {
    Cli::parse()
}

fn parse_size(raw: &str) -> Result<(u32, u32), String> {
    let (width, height) = raw
        .trim()
        .split_once(|ch: char| ch == 'x' || ch == 'X')
        .ok_or_else(|| format!("invalid size '{raw}'; expected WIDTHxHEIGHT"))?;
    let width = width
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("invalid width in '{raw}'"))?;
    let height = height
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("invalid height in '{raw}'"))?;
    if width == 0 || height == 0 {
        return Err(format!("size '{raw}' must be non-zero"));
    }
    Ok((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_accepts_either_separator_case() {
        assert_eq!(parse_size("1280x720"), Ok((1280, 720)));
        assert_eq!(parse_size(" 64X32 "), Ok((64, 32)));
        assert!(parse_size("64").is_err());
        assert!(parse_size("0x32").is_err());
    }

    #[test]
    fn overrides_replace_config_values() {
        let cli = Cli::try_parse_from([
            "oitview",
            "--mode",
            "three-target",
            "--samples",
            "4x",
            "--size",
            "32x16",
            "--background",
            "#000000",
            "config",
        ])
        .unwrap();
        let mut config = OitConfig::default();
        cli.overrides.apply(&mut config);
        assert_eq!(config.technique.mode, TechniqueMode::ThreeTarget);
        assert_eq!(config.technique.sample_count, 4);
        assert_eq!((config.viewport.width, config.viewport.height), (32, 16));
        assert_eq!(config.background.color, [0.0; 3]);
        assert!(matches!(cli.command, Command::Config));
    }

    #[test]
    fn render_defaults_to_cpu() {
        let cli = Cli::try_parse_from(["oitview", "render", "scene.toml"]).unwrap();
        let Command::Render(args) = cli.command else {
            panic!("expected render");
        };
        assert_eq!(args.device, DeviceKind::Cpu);
        assert_eq!(args.frames, 1);
    }
}
