//! Fixed per-mode pass sequences.

use std::fmt;

use oitconfig::TechniqueMode;

use crate::blend::NamedBlend;
use crate::compositor;
use crate::device::{ClearValue, CompareFunction, DepthStencilDesc};
use crate::programs::ProgramKind;

/// Named render target slots. The orchestrator maps slots to device textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    BackgroundColor,
    BackgroundDepth,
    StochasticDepth,
    AccumulatedColor,
    Transmittance,
    TotalAlpha,
    CoverageMasks,
    Output,
}

impl Slot {
    pub fn as_str(self) -> &'static str {
        match self {
            Slot::BackgroundColor => "background-color",
            Slot::BackgroundDepth => "background-depth",
            Slot::StochasticDepth => "stochastic-depth",
            Slot::AccumulatedColor => "accumulated-color",
            Slot::Transmittance => "transmittance",
            Slot::TotalAlpha => "total-alpha",
            Slot::CoverageMasks => "coverage-masks",
            Slot::Output => "output",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame stages in execution order. A frame visits them strictly ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PassStage {
    Begin,
    OpaqueDraw,
    StochasticCoverage,
    Transmittance,
    Accumulation,
    Composite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawTarget {
    /// Clears only.
    Nothing,
    OpaqueGeometry,
    TransparentGeometry,
    FullScreenTriangle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PassDescriptor {
    pub label: &'static str,
    pub stage: PassStage,
    pub clears: Vec<(Slot, ClearValue)>,
    pub color_targets: Vec<Slot>,
    /// One entry per color target.
    pub blends: Vec<Option<NamedBlend>>,
    pub depth_target: Option<Slot>,
    pub depth: DepthStencilDesc,
    pub program: Option<ProgramKind>,
    pub inputs: Vec<Slot>,
    pub draw: DrawTarget,
    /// Unbind the inputs as soon as the pass has drawn.
    pub release_inputs: bool,
}

const DEPTH_TEST_WRITE: DepthStencilDesc = DepthStencilDesc {
    depth_test: true,
    depth_write: true,
    compare: CompareFunction::Less,
};

const DEPTH_TEST_ONLY: DepthStencilDesc = DepthStencilDesc {
    depth_test: true,
    depth_write: false,
    compare: CompareFunction::LessEqual,
};

/// The ordered passes replayed every frame in `mode`.
pub fn frame_passes(mode: TechniqueMode, background: [f32; 3]) -> Vec<PassDescriptor> {
    let [r, g, b] = background;
    let mut passes = vec![
        PassDescriptor {
            label: "begin",
            stage: PassStage::Begin,
            clears: vec![
                (Slot::BackgroundColor, ClearValue::Color([r, g, b, 0.0])),
                (Slot::BackgroundDepth, ClearValue::Depth(1.0)),
            ],
            color_targets: Vec::new(),
            blends: Vec::new(),
            depth_target: None,
            depth: DepthStencilDesc::DISABLED,
            program: None,
            inputs: Vec::new(),
            draw: DrawTarget::Nothing,
            release_inputs: false,
        },
        PassDescriptor {
            label: "opaque",
            stage: PassStage::OpaqueDraw,
            clears: Vec::new(),
            color_targets: vec![Slot::BackgroundColor],
            blends: vec![None],
            depth_target: Some(Slot::BackgroundDepth),
            depth: DEPTH_TEST_WRITE,
            program: Some(ProgramKind::Opaque),
            inputs: Vec::new(),
            draw: DrawTarget::OpaqueGeometry,
            release_inputs: false,
        },
        PassDescriptor {
            label: "stochastic-coverage",
            stage: PassStage::StochasticCoverage,
            clears: vec![(Slot::StochasticDepth, ClearValue::Depth(1.0))],
            color_targets: Vec::new(),
            blends: Vec::new(),
            depth_target: Some(Slot::StochasticDepth),
            depth: DEPTH_TEST_WRITE,
            program: Some(ProgramKind::StochasticCoverage),
            inputs: vec![Slot::CoverageMasks],
            draw: DrawTarget::TransparentGeometry,
            release_inputs: true,
        },
    ];

    match mode {
        TechniqueMode::ThreeTarget => {
            passes.push(PassDescriptor {
                label: "transmittance",
                stage: PassStage::Transmittance,
                clears: vec![(Slot::Transmittance, ClearValue::Color([1.0; 4]))],
                color_targets: vec![Slot::Transmittance],
                blends: vec![Some(NamedBlend::MultiplicativeTransmittance)],
                depth_target: Some(Slot::BackgroundDepth),
                depth: DEPTH_TEST_ONLY,
                program: Some(ProgramKind::Transmittance),
                inputs: Vec::new(),
                draw: DrawTarget::TransparentGeometry,
                release_inputs: false,
            });
            passes.push(PassDescriptor {
                label: "accumulate",
                stage: PassStage::Accumulation,
                clears: vec![(Slot::AccumulatedColor, ClearValue::Color([0.0; 4]))],
                color_targets: vec![Slot::AccumulatedColor],
                blends: vec![Some(NamedBlend::Additive)],
                depth_target: Some(Slot::BackgroundDepth),
                depth: DEPTH_TEST_ONLY,
                program: Some(ProgramKind::Accumulate),
                inputs: vec![Slot::StochasticDepth],
                draw: DrawTarget::TransparentGeometry,
                release_inputs: true,
            });
        }
        TechniqueMode::TwoTargetMerged => {
            passes.push(PassDescriptor {
                label: "accumulate-merged",
                stage: PassStage::Accumulation,
                clears: vec![
                    (
                        Slot::AccumulatedColor,
                        ClearValue::Color([0.0, 0.0, 0.0, 1.0]),
                    ),
                    (Slot::TotalAlpha, ClearValue::Color([0.0; 4])),
                ],
                color_targets: vec![Slot::AccumulatedColor, Slot::TotalAlpha],
                blends: vec![
                    Some(NamedBlend::CorrectedAlphaAdditive),
                    Some(NamedBlend::Additive),
                ],
                depth_target: Some(Slot::BackgroundDepth),
                depth: DEPTH_TEST_ONLY,
                program: Some(ProgramKind::AccumulateMerged),
                inputs: vec![Slot::StochasticDepth],
                draw: DrawTarget::TransparentGeometry,
                release_inputs: true,
            });
        }
    }

    passes.push(compositor::composite_pass(mode));
    passes
}

/// Checks that a sequence is well formed: stages strictly ascending, blends
/// matching targets, and no slot read and written by the same pass.
pub fn validate_sequence(passes: &[PassDescriptor]) -> Result<(), String> {
    let mut previous: Option<PassStage> = None;
    for pass in passes {
        if let Some(prev) = previous {
            if pass.stage <= prev {
                return Err(format!(
                    "pass `{}` ({:?}) does not follow {:?}",
                    pass.label, pass.stage, prev
                ));
            }
        }
        previous = Some(pass.stage);

        if pass.blends.len() != pass.color_targets.len() {
            return Err(format!(
                "pass `{}` has {} blend entries for {} color targets",
                pass.label,
                pass.blends.len(),
                pass.color_targets.len()
            ));
        }
        if let Some(program) = pass.program {
            if program.input_count() != pass.inputs.len() {
                return Err(format!(
                    "pass `{}` binds {} inputs, program `{}` reads {}",
                    pass.label,
                    pass.inputs.len(),
                    program.label(),
                    program.input_count()
                ));
            }
            if program.color_output_count() != pass.color_targets.len() {
                return Err(format!(
                    "pass `{}` binds {} color targets, program `{}` writes {}",
                    pass.label,
                    pass.color_targets.len(),
                    program.label(),
                    program.color_output_count()
                ));
            }
        }
        let written = pass.color_targets.iter().chain(pass.depth_target.iter());
        for slot in written {
            if pass.inputs.contains(slot) {
                return Err(format!(
                    "pass `{}` reads and writes `{slot}`",
                    pass.label
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(mode: TechniqueMode) -> Vec<&'static str> {
        frame_passes(mode, [0.0; 3])
            .iter()
            .map(|pass| pass.label)
            .collect()
    }

    #[test]
    fn three_target_sequence() {
        assert_eq!(
            labels(TechniqueMode::ThreeTarget),
            [
                "begin",
                "opaque",
                "stochastic-coverage",
                "transmittance",
                "accumulate",
                "composite"
            ]
        );
    }

    #[test]
    fn merged_sequence() {
        assert_eq!(
            labels(TechniqueMode::TwoTargetMerged),
            [
                "begin",
                "opaque",
                "stochastic-coverage",
                "accumulate-merged",
                "composite"
            ]
        );
    }

    #[test]
    fn shipped_sequences_validate() {
        for mode in [TechniqueMode::ThreeTarget, TechniqueMode::TwoTargetMerged] {
            validate_sequence(&frame_passes(mode, [1.0; 3])).unwrap();
        }
    }

    #[test]
    fn accumulation_tests_background_depth_without_writing() {
        for mode in [TechniqueMode::ThreeTarget, TechniqueMode::TwoTargetMerged] {
            for pass in frame_passes(mode, [1.0; 3])
                .iter()
                .filter(|pass| {
                    pass.stage >= PassStage::Transmittance
                        && pass.draw == DrawTarget::TransparentGeometry
                })
            {
                assert_eq!(pass.depth_target, Some(Slot::BackgroundDepth));
                assert!(!pass.depth.depth_write);
                assert_eq!(pass.depth.compare, CompareFunction::LessEqual);
            }
        }
    }

    #[test]
    fn rejects_out_of_order_and_hazards() {
        let mut passes = frame_passes(TechniqueMode::TwoTargetMerged, [1.0; 3]);
        passes.swap(1, 2);
        assert!(validate_sequence(&passes).is_err());

        let mut passes = frame_passes(TechniqueMode::TwoTargetMerged, [1.0; 3]);
        passes[3].inputs = vec![Slot::AccumulatedColor];
        let err = validate_sequence(&passes).unwrap_err();
        assert!(err.contains("reads and writes"), "{err}");
    }
}
