use std::path::Path;

use anyhow::{bail, Context, Result};
use renderer::{BatchList, MeshBatch};
use serde::Deserialize;

/// Scene document: a list of axis-aligned quads in normalized device
/// coordinates.
///
/// ```toml
/// [[quad]]
/// rect = [-0.5, -0.5, 0.5, 0.5]
/// depth = 0.25
/// color = "#ff8000"
/// alpha = 0.5
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SceneFile {
    #[serde(default, rename = "quad")]
    pub quads: Vec<QuadSpec>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QuadSpec {
    /// `[x0, y0, x1, y1]`.
    pub rect: [f32; 4],
    pub depth: f32,
    #[serde(deserialize_with = "oitconfig::deserialize_color")]
    pub color: [f32; 3],
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    /// Drawn in the opaque pass; `alpha` is ignored.
    #[serde(default)]
    pub opaque: bool,
}

fn default_alpha() -> f32 {
    1.0
}

impl SceneFile {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let scene: SceneFile = toml::from_str(input).context("failed to parse scene")?;
        scene.validate()?;
        Ok(scene)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scene {}", path.display()))?;
        Self::from_toml_str(&contents).with_context(|| format!("in {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        for (index, quad) in self.quads.iter().enumerate() {
            if !quad.rect.iter().all(|v| v.is_finite()) {
                bail!("quad {index}: rect must be finite");
            }
            if !(0.0..=1.0).contains(&quad.depth) {
                bail!("quad {index}: depth {} is outside [0, 1]", quad.depth);
            }
            if !(0.0..=1.0).contains(&quad.alpha) {
                bail!("quad {index}: alpha {} is outside [0, 1]", quad.alpha);
            }
            if quad.color.iter().any(|c| !(0.0..=1.0).contains(c)) {
                bail!("quad {index}: color components must lie in [0, 1]");
            }
        }
        Ok(())
    }

    /// Splits the quads into opaque and transparent batches. Each quad is its
    /// own surface, numbered from 1 in file order.
    pub fn to_batches(&self) -> BatchList {
        let mut batches = BatchList::new();
        for (index, quad) in self.quads.iter().enumerate() {
            let surface = index as u32 + 1;
            let [r, g, b] = quad.color;
            if quad.opaque {
                batches
                    .opaque
                    .push(MeshBatch::quad(surface, quad.rect, quad.depth, [r, g, b, 1.0]));
            } else {
                batches.transparent.push(MeshBatch::quad(
                    surface,
                    quad.rect,
                    quad.depth,
                    [r, g, b, quad.alpha],
                ));
            }
        }
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quads_split_by_opacity() {
        let scene = SceneFile::from_toml_str(
            r##"
[[quad]]
rect = [-1.0, -1.0, 1.0, 1.0]
depth = 0.9
color = "#00ff00"
opaque = true

[[quad]]
rect = [-0.5, -0.5, 0.5, 0.5]
depth = 0.2
color = [1.0, 0.0, 0.0]
alpha = 0.5
"##,
        )
        .unwrap();
        let batches = scene.to_batches();
        assert_eq!(batches.opaque.len(), 1);
        assert_eq!(batches.transparent.len(), 1);
        assert_eq!(batches.opaque[0].surface, 1);
        assert_eq!(batches.transparent[0].surface, 2);
        assert_eq!(batches.transparent[0].vertices[0].color, [1.0, 0.0, 0.0, 0.5]);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let err = SceneFile::from_toml_str(
            r#"
[[quad]]
rect = [-1.0, -1.0, 1.0, 1.0]
depth = 1.5
color = [1.0, 1.0, 1.0]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("depth"), "{err}");
    }

    #[test]
    fn malformed_hex_color_is_rejected() {
        let err = SceneFile::from_toml_str(
            r##"
[[quad]]
rect = [-1.0, -1.0, 1.0, 1.0]
depth = 0.5
color = "#12345"
"##,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("invalid color"), "{err:#}");
    }

    #[test]
    fn empty_scene_is_valid() {
        let scene = SceneFile::from_toml_str("").unwrap();
        assert!(scene.quads.is_empty());
    }
}
