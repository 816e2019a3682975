use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SAMPLE_COUNT: u32 = 8;
pub const DEFAULT_DITHER_TABLE_SIZE: u32 = 2048;
pub const DEFAULT_ALPHA_LEVELS: u32 = 256;
pub const DEFAULT_SEED: u64 = 0;

/// Coverage masks are stored in `u32` cells, one bit per sample.
pub const MAX_MASK_SAMPLES: u32 = 32;

const MAX_TEXTURE_DIMENSION: u32 = 16384;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to read configuration at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How the accumulation stage is split into passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TechniqueMode {
    /// Separate transmittance and color passes.
    ThreeTarget,
    /// One geometry pass writing color and total alpha together.
    #[default]
    TwoTargetMerged,
}

impl TechniqueMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TechniqueMode::ThreeTarget => "three-target",
            TechniqueMode::TwoTargetMerged => "two-target-merged",
        }
    }
}

impl fmt::Display for TechniqueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TechniqueMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        parse_mode(raw)
    }
}

impl<'de> Deserialize<'de> for TechniqueMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_mode(&raw).map_err(de::Error::custom)
    }
}

fn parse_mode(raw: &str) -> Result<TechniqueMode, String> {
    let normalized = raw.trim().to_ascii_lowercase().replace('_', "-");
    match normalized.as_str() {
        "three-target" | "three" | "separate" => Ok(TechniqueMode::ThreeTarget),
        "two-target-merged" | "two-target" | "merged" | "two" => {
            Ok(TechniqueMode::TwoTargetMerged)
        }
        other => Err(format!(
            "unknown technique mode '{other}'; expected three-target or two-target-merged"
        )),
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OitConfig {
    pub version: u32,
    #[serde(default)]
    pub technique: Technique,
    #[serde(default)]
    pub viewport: Viewport,
    #[serde(default)]
    pub background: Background,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Technique {
    #[serde(default)]
    pub mode: TechniqueMode,
    #[serde(
        default = "default_sample_count",
        deserialize_with = "deserialize_sample_count"
    )]
    pub sample_count: u32,
    #[serde(default = "default_dither_table_size")]
    pub dither_table_size: u32,
    #[serde(default = "default_alpha_levels")]
    pub alpha_levels: u32,
    #[serde(default)]
    pub seed: u64,
    /// Draw a fresh dither offset every frame instead of the fixed zero offset.
    #[serde(default)]
    pub temporal_jitter: bool,
}

impl Default for Technique {
    fn default() -> Self {
        Self {
            mode: TechniqueMode::default(),
            sample_count: DEFAULT_SAMPLE_COUNT,
            dither_table_size: DEFAULT_DITHER_TABLE_SIZE,
            alpha_levels: DEFAULT_ALPHA_LEVELS,
            seed: DEFAULT_SEED,
            temporal_jitter: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Viewport {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Background {
    #[serde(
        default = "default_background_color",
        deserialize_with = "deserialize_color"
    )]
    pub color: [f32; 3],
}

impl Default for Background {
    fn default() -> Self {
        Self {
            color: default_background_color(),
        }
    }
}

fn default_sample_count() -> u32 {
    DEFAULT_SAMPLE_COUNT
}

fn default_dither_table_size() -> u32 {
    DEFAULT_DITHER_TABLE_SIZE
}

fn default_alpha_levels() -> u32 {
    DEFAULT_ALPHA_LEVELS
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_background_color() -> [f32; 3] {
    [1.0, 1.0, 1.0]
}

fn deserialize_sample_count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Helper {
        Str(String),
        Num(i64),
    }

    match Helper::deserialize(deserializer)? {
        Helper::Num(value) => u32::try_from(value)
            .map_err(|_| de::Error::custom(format!("sample_count {value} is out of range"))),
        Helper::Str(raw) => parse_sample_count(&raw).map_err(de::Error::custom),
    }
}

/// Accepts `8`, `8x` and `msaa8` style spellings.
pub fn parse_sample_count(raw: &str) -> Result<u32, String> {
    let normalized = raw.trim().to_ascii_lowercase();
    let digits = normalized
        .strip_prefix("msaa")
        .unwrap_or(&normalized)
        .trim_end_matches('x');
    digits
        .parse::<u32>()
        .map_err(|_| format!("invalid sample count '{raw}'"))
}

/// Accepts either `[r, g, b]` or a `#rrggbb` string.
pub fn deserialize_color<'de, D>(deserializer: D) -> Result<[f32; 3], D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Helper {
        Rgb([f32; 3]),
        Hex(String),
    }

    match Helper::deserialize(deserializer)? {
        Helper::Rgb(rgb) => Ok(rgb),
        Helper::Hex(raw) => parse_hex_color(&raw).map_err(de::Error::custom),
    }
}

/// Parses `#rrggbb` (leading `#` optional) into linear `[0, 1]` components.
pub fn parse_hex_color(raw: &str) -> Result<[f32; 3], String> {
    let trimmed = raw.trim();
    let hex = trimmed.strip_prefix('#').unwrap_or(trimmed);
    if hex.len() != 6 || !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err(format!("invalid color '{raw}'; expected #rrggbb"));
    }
    let mut rgb = [0.0f32; 3];
    for (index, slot) in rgb.iter_mut().enumerate() {
        let byte = u8::from_str_radix(&hex[index * 2..index * 2 + 2], 16)
            .map_err(|_| format!("invalid color '{raw}'"))?;
        *slot = f32::from(byte) / 255.0;
    }
    Ok(rgb)
}

impl Default for OitConfig {
    fn default() -> Self {
        Self {
            version: 1,
            technique: Technique::default(),
            viewport: Viewport::default(),
            background: Background::default(),
        }
    }
}

impl OitConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: OitConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|err| ConfigError::Invalid(format!("failed to serialize config: {err}")))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        self.technique.validate()?;

        let Viewport { width, height } = self.viewport;
        if width == 0 || height == 0 {
            return Err(ConfigError::Invalid(format!(
                "viewport must be non-empty, got {width}x{height}"
            )));
        }
        if width > MAX_TEXTURE_DIMENSION || height > MAX_TEXTURE_DIMENSION {
            return Err(ConfigError::Invalid(format!(
                "viewport {width}x{height} exceeds the {MAX_TEXTURE_DIMENSION} pixel limit"
            )));
        }

        for component in self.background.color {
            if !component.is_finite() || !(0.0..=1.0).contains(&component) {
                return Err(ConfigError::Invalid(format!(
                    "background.color components must lie in [0, 1], got {component}"
                )));
            }
        }

        Ok(())
    }
}

impl Technique {
    /// Checks the table parameters. The device sample limit is checked later,
    /// once a device is available.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_count == 0 || self.sample_count > MAX_MASK_SAMPLES {
            return Err(ConfigError::Invalid(format!(
                "technique.sample_count must be between 1 and {MAX_MASK_SAMPLES}, got {}",
                self.sample_count
            )));
        }

        if !self.dither_table_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "technique.dither_table_size must be a power of two, got {}",
                self.dither_table_size
            )));
        }

        if self.dither_table_size > MAX_TEXTURE_DIMENSION {
            return Err(ConfigError::Invalid(format!(
                "technique.dither_table_size {} exceeds the {MAX_TEXTURE_DIMENSION} texel limit",
                self.dither_table_size
            )));
        }

        if self.alpha_levels == 0 {
            return Err(ConfigError::Invalid(
                "technique.alpha_levels must be at least 1".into(),
            ));
        }
        if self.alpha_levels >= MAX_TEXTURE_DIMENSION {
            return Err(ConfigError::Invalid(format!(
                "technique.alpha_levels must be below {MAX_TEXTURE_DIMENSION}, got {}",
                self.alpha_levels
            )));
        }

        Ok(())
    }
}
