//! Program contracts.
//!
//! Each program is a pure function from a fragment (plus bound inputs) to
//! output values. The software device calls these directly; the WGSL in
//! `gpu::shaders` implements the same contracts.

use bytemuck::{Pod, Zeroable};
use maskgen::{dither_index, full_mask, quantize_alpha};

use crate::compositor::{self, CompositeLayout};

/// Depth slack used when comparing a fragment against stored stochastic
/// depth. The WGSL side uses the same constant.
pub const DEPTH_EPSILON: f32 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    /// Writes opaque scene color.
    Opaque,
    /// Emits a table-driven sample mask and depth only.
    StochasticCoverage,
    /// Writes `alpha` to every channel for multiplicative transmittance.
    Transmittance,
    /// Writes `(C·a·v, a·v)`.
    Accumulate,
    /// Writes `(C·a·v, a)` to target 0 and `a·v` to target 1.
    AccumulateMerged,
    /// Full-screen resolve.
    Composite(CompositeLayout),
}

impl ProgramKind {
    pub fn label(self) -> &'static str {
        match self {
            ProgramKind::Opaque => "opaque",
            ProgramKind::StochasticCoverage => "stochastic-coverage",
            ProgramKind::Transmittance => "transmittance",
            ProgramKind::Accumulate => "accumulate",
            ProgramKind::AccumulateMerged => "accumulate-merged",
            ProgramKind::Composite(CompositeLayout::SeparateTransmittance) => "composite-separate",
            ProgramKind::Composite(CompositeLayout::MergedTransmittance) => "composite-merged",
        }
    }

    /// Number of input textures the program reads, in slot order.
    pub fn input_count(self) -> usize {
        match self {
            ProgramKind::Opaque | ProgramKind::Transmittance => 0,
            ProgramKind::StochasticCoverage
            | ProgramKind::Accumulate
            | ProgramKind::AccumulateMerged => 1,
            ProgramKind::Composite(_) => 3,
        }
    }

    pub fn color_output_count(self) -> usize {
        match self {
            ProgramKind::StochasticCoverage => 0,
            ProgramKind::AccumulateMerged => 2,
            _ => 1,
        }
    }

    /// Whether the program rasterizes scene geometry rather than a
    /// full-screen triangle.
    pub fn draws_geometry(self) -> bool {
        !matches!(self, ProgramKind::Composite(_))
    }
}

/// Per-frame parameter block, laid out for a uniform buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameParams {
    pub viewport: [u32; 2],
    pub mask_size_minus_one: u32,
    pub alpha_levels: u32,
    pub sample_count: u32,
    pub random_offset: u32,
    pub padding: [u32; 2],
}

impl FrameParams {
    pub fn new(
        viewport: (u32, u32),
        table_width: u32,
        alpha_levels: u32,
        sample_count: u32,
        random_offset: u32,
    ) -> Self {
        Self {
            viewport: [viewport.0, viewport.1],
            mask_size_minus_one: table_width.saturating_sub(1),
            alpha_levels,
            sample_count,
            random_offset,
            padding: [0; 2],
        }
    }
}

/// One rasterized fragment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fragment {
    pub pixel: [u32; 2],
    pub depth: f32,
    pub color: [f32; 4],
    pub surface: u32,
    pub primitive: u32,
}

/// Row-major view of the coverage mask lookup texture.
#[derive(Debug, Clone, Copy)]
pub struct LookupView<'a> {
    pub width: u32,
    pub height: u32,
    pub cells: &'a [u32],
}

impl LookupView<'_> {
    fn load(&self, column: u32, row: u32) -> u32 {
        if column >= self.width || row >= self.height {
            return 0;
        }
        self.cells
            .get(row as usize * self.width as usize + column as usize)
            .copied()
            .unwrap_or(0)
    }
}

pub fn opaque(fragment: &Fragment) -> [f32; 4] {
    let [r, g, b, _] = fragment.color;
    [r, g, b, 1.0]
}

/// Sample mask for the stochastic coverage pass.
pub fn stochastic_coverage(
    fragment: &Fragment,
    params: &FrameParams,
    table: LookupView<'_>,
) -> u32 {
    let dither = dither_index(
        fragment.pixel[0],
        fragment.pixel[1],
        fragment.surface,
        fragment.primitive,
        params.random_offset,
    );
    let column = dither & params.mask_size_minus_one;
    let level = quantize_alpha(fragment.color[3], params.alpha_levels);
    table.load(column, level) & full_mask(params.sample_count)
}

pub fn transmittance(fragment: &Fragment) -> [f32; 4] {
    [fragment.color[3]; 4]
}

/// Fraction of stochastic depth samples the fragment is not behind.
pub fn visibility(depth: f32, stochastic_depths: &[f32]) -> f32 {
    if stochastic_depths.is_empty() {
        return 0.0;
    }
    let visible = stochastic_depths
        .iter()
        .filter(|&&stored| depth <= stored + DEPTH_EPSILON)
        .count();
    visible as f32 / stochastic_depths.len() as f32
}

pub fn accumulate(fragment: &Fragment, visibility: f32) -> [f32; 4] {
    let [r, g, b, a] = fragment.color;
    let weight = a * visibility;
    [r * weight, g * weight, b * weight, weight]
}

pub fn accumulate_merged(fragment: &Fragment, visibility: f32) -> [[f32; 4]; 2] {
    let [r, g, b, a] = fragment.color;
    let weight = a * visibility;
    [[r * weight, g * weight, b * weight, a], [weight; 4]]
}

/// Composite program: inputs are background, accumulated color and the
/// layout's auxiliary target, each already resolved to one value per pixel.
pub fn composite(layout: CompositeLayout, inputs: [[f32; 4]; 3]) -> [f32; 4] {
    let [background, accumulated, auxiliary] = inputs;
    let (transmittance, total_alpha) = layout.split(accumulated, auxiliary);
    compositor::resolve(background, accumulated, transmittance, total_alpha)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(alpha: f32) -> Fragment {
        Fragment {
            pixel: [3, 7],
            depth: 0.5,
            color: [0.8, 0.4, 0.2, alpha],
            surface: 1,
            primitive: 0,
        }
    }

    #[test]
    fn frame_params_match_uniform_layout() {
        assert_eq!(std::mem::size_of::<FrameParams>(), 32);
        let params = FrameParams::new((64, 32), 2048, 256, 8, 0);
        assert_eq!(params.mask_size_minus_one, 2047);
    }

    #[test]
    fn coverage_is_empty_for_zero_alpha_and_full_for_one() {
        let table = maskgen::CoverageMaskTable::build(maskgen::TableParams {
            dither_table_size: 64,
            ..Default::default()
        })
        .unwrap();
        let view = LookupView {
            width: table.width(),
            height: table.height(),
            cells: table.as_slice(),
        };
        let params = FrameParams::new((16, 16), table.width(), 256, 8, 0);
        assert_eq!(stochastic_coverage(&fragment(0.0), &params, view), 0);
        assert_eq!(stochastic_coverage(&fragment(1.0), &params, view), 0xff);
        let half = stochastic_coverage(&fragment(0.5), &params, view);
        assert_eq!(half.count_ones(), 4);
    }

    #[test]
    fn visibility_counts_samples_not_in_front() {
        let stored = [0.25, 0.5, 1.0, 1.0];
        assert_eq!(visibility(0.5, &stored), 0.75);
        assert_eq!(visibility(0.1, &stored), 1.0);
        assert_eq!(visibility(0.9, &stored), 0.5);
    }

    #[test]
    fn merged_accumulation_splits_targets() {
        let [color, total] = accumulate_merged(&fragment(0.5), 0.5);
        assert_eq!(color, [0.2, 0.1, 0.05, 0.5]);
        assert_eq!(total, [0.25; 4]);
        assert_eq!(accumulate(&fragment(0.5), 0.5), [0.2, 0.1, 0.05, 0.25]);
    }
}
