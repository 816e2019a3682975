//! Final resolve: the under-operator with alpha correction.
//!
//! ```text
//!   final.rgb = background.rgb × T + accumulated.rgb × k
//!   k         = (1 − T) / total_alpha   if total_alpha > ε
//!             = 1                       otherwise
//! ```
//!
//! `T` is the product of `(1 − alpha)` over every fragment in front of the
//! background. The correction `k` rescales the stochastic color estimate so
//! its total weight matches the exact transmittance.

use oitconfig::TechniqueMode;

use crate::device::DepthStencilDesc;
use crate::passes::{DrawTarget, PassDescriptor, PassStage, Slot};
use crate::programs::ProgramKind;

/// Below this total alpha the correction factor is left at 1.
pub const TOTAL_ALPHA_EPSILON: f32 = 1e-5;

/// Where transmittance and total alpha live after accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompositeLayout {
    /// `Transmittance.r` holds `T`; `AccumulatedColor.a` holds total alpha.
    SeparateTransmittance,
    /// `AccumulatedColor.a` holds `T`; `TotalAlpha.r` holds total alpha.
    MergedTransmittance,
}

impl CompositeLayout {
    pub fn for_mode(mode: TechniqueMode) -> Self {
        match mode {
            TechniqueMode::ThreeTarget => CompositeLayout::SeparateTransmittance,
            TechniqueMode::TwoTargetMerged => CompositeLayout::MergedTransmittance,
        }
    }

    pub fn auxiliary_slot(self) -> Slot {
        match self {
            CompositeLayout::SeparateTransmittance => Slot::Transmittance,
            CompositeLayout::MergedTransmittance => Slot::TotalAlpha,
        }
    }

    /// Returns `(transmittance, total_alpha)`.
    pub fn split(self, accumulated: [f32; 4], auxiliary: [f32; 4]) -> (f32, f32) {
        match self {
            CompositeLayout::SeparateTransmittance => (auxiliary[0], accumulated[3]),
            CompositeLayout::MergedTransmittance => (accumulated[3], auxiliary[0]),
        }
    }
}

pub fn resolve(
    background: [f32; 4],
    accumulated: [f32; 4],
    transmittance: f32,
    total_alpha: f32,
) -> [f32; 4] {
    let t = transmittance.clamp(0.0, 1.0);
    let k = if total_alpha > TOTAL_ALPHA_EPSILON {
        (1.0 - t) / total_alpha
    } else {
        1.0
    };
    [
        background[0] * t + accumulated[0] * k,
        background[1] * t + accumulated[1] * k,
        background[2] * t + accumulated[2] * k,
        1.0,
    ]
}

/// Exact front-to-back under-operator over layers sorted nearest first.
pub fn under(background: [f32; 3], layers: &[([f32; 3], f32)]) -> [f32; 3] {
    let mut color = [0.0f32; 3];
    let mut transmittance = 1.0f32;
    for (layer, alpha) in layers {
        for channel in 0..3 {
            color[channel] += layer[channel] * alpha * transmittance;
        }
        transmittance *= 1.0 - alpha;
    }
    [
        color[0] + background[0] * transmittance,
        color[1] + background[1] * transmittance,
        color[2] + background[2] * transmittance,
    ]
}

/// The full-screen resolve pass for `mode`.
pub fn composite_pass(mode: TechniqueMode) -> PassDescriptor {
    let layout = CompositeLayout::for_mode(mode);
    PassDescriptor {
        label: "composite",
        stage: PassStage::Composite,
        clears: Vec::new(),
        color_targets: vec![Slot::Output],
        blends: vec![None],
        depth_target: None,
        depth: DepthStencilDesc::DISABLED,
        program: Some(ProgramKind::Composite(layout)),
        inputs: vec![
            Slot::BackgroundColor,
            Slot::AccumulatedColor,
            layout.auxiliary_slot(),
        ],
        draw: DrawTarget::FullScreenTriangle,
        release_inputs: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_accumulation_returns_background() {
        let background = [0.2, 0.4, 0.6, 0.0];
        let out = resolve(background, [0.0; 4], 1.0, 0.0);
        assert_eq!(out, [0.2, 0.4, 0.6, 1.0]);
    }

    #[test]
    fn correction_rescales_to_exact_coverage() {
        // One fragment, alpha 0.5, seen by half of its samples.
        let accumulated = [0.25, 0.0, 0.0, 0.25];
        let out = resolve([0.0, 0.0, 1.0, 0.0], accumulated, 0.5, 0.25);
        assert!((out[0] - 0.5).abs() < 1e-6);
        assert!((out[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn layouts_read_opposite_channels() {
        let accumulated = [0.0, 0.0, 0.0, 0.3];
        let auxiliary = [0.7, 0.7, 0.7, 0.7];
        assert_eq!(
            CompositeLayout::SeparateTransmittance.split(accumulated, auxiliary),
            (0.7, 0.3)
        );
        assert_eq!(
            CompositeLayout::MergedTransmittance.split(accumulated, auxiliary),
            (0.3, 0.7)
        );
    }

    #[test]
    fn under_matches_two_layer_formula() {
        let out = under([1.0, 1.0, 1.0], &[([1.0, 0.0, 0.0], 0.5), ([0.0, 0.0, 1.0], 0.5)]);
        assert!((out[0] - 0.75).abs() < 1e-6);
        assert!((out[1] - 0.25).abs() < 1e-6);
        assert!((out[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn composite_pass_reads_mode_auxiliary() {
        let pass = composite_pass(TechniqueMode::ThreeTarget);
        assert_eq!(pass.inputs[2], Slot::Transmittance);
        let pass = composite_pass(TechniqueMode::TwoTargetMerged);
        assert_eq!(pass.inputs[2], Slot::TotalAlpha);
        assert!(pass.release_inputs);
    }
}
