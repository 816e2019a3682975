//! Named blend configurations used by the accumulation passes.
//!
//! Every entry is commutative in the order fragments arrive, which is what
//! makes the final image independent of submission order.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    InvSrcColor,
    InvSrcAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendOp {
    Add,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendComponent {
    pub src_factor: BlendFactor,
    pub dst_factor: BlendFactor,
    pub op: BlendOp,
}

impl BlendComponent {
    pub const ADDITIVE: Self = Self {
        src_factor: BlendFactor::One,
        dst_factor: BlendFactor::One,
        op: BlendOp::Add,
    };
}

/// Per-target blend: `result = op(src × src_factor, dst × dst_factor)`,
/// separately for the color and alpha channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendEquation {
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

impl BlendEquation {
    pub fn apply(&self, src: [f32; 4], dst: [f32; 4]) -> [f32; 4] {
        let mut out = [0.0; 4];
        for channel in 0..3 {
            out[channel] = combine(&self.color, src, dst, channel);
        }
        out[3] = combine(&self.alpha, src, dst, 3);
        out
    }
}

fn factor(factor: BlendFactor, src: [f32; 4], channel: usize) -> f32 {
    match factor {
        BlendFactor::Zero => 0.0,
        BlendFactor::One => 1.0,
        BlendFactor::InvSrcColor => 1.0 - src[channel],
        BlendFactor::InvSrcAlpha => 1.0 - src[3],
    }
}

fn combine(component: &BlendComponent, src: [f32; 4], dst: [f32; 4], channel: usize) -> f32 {
    let s = src[channel] * factor(component.src_factor, src, channel);
    let d = dst[channel] * factor(component.dst_factor, src, channel);
    match component.op {
        BlendOp::Add => s + d,
    }
}

/// The catalog. Passes refer to blends by name; the orchestrator turns names
/// into device state objects once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamedBlend {
    /// `dst += src` on all four channels.
    Additive,
    /// `dst *= 1 - src`, used for the product of `(1 - alpha)`.
    MultiplicativeTransmittance,
    /// Color adds, alpha multiplies by `1 - src.a`.
    CorrectedAlphaAdditive,
}

impl NamedBlend {
    pub fn equation(self) -> BlendEquation {
        match self {
            NamedBlend::Additive => BlendEquation {
                color: BlendComponent::ADDITIVE,
                alpha: BlendComponent::ADDITIVE,
            },
            NamedBlend::MultiplicativeTransmittance => BlendEquation {
                color: BlendComponent {
                    src_factor: BlendFactor::Zero,
                    dst_factor: BlendFactor::InvSrcColor,
                    op: BlendOp::Add,
                },
                alpha: BlendComponent {
                    src_factor: BlendFactor::Zero,
                    dst_factor: BlendFactor::InvSrcAlpha,
                    op: BlendOp::Add,
                },
            },
            NamedBlend::CorrectedAlphaAdditive => BlendEquation {
                color: BlendComponent::ADDITIVE,
                alpha: BlendComponent {
                    src_factor: BlendFactor::Zero,
                    dst_factor: BlendFactor::InvSrcAlpha,
                    op: BlendOp::Add,
                },
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NamedBlend::Additive => "additive",
            NamedBlend::MultiplicativeTransmittance => "multiplicative-transmittance",
            NamedBlend::CorrectedAlphaAdditive => "corrected-alpha-additive",
        }
    }
}

impl fmt::Display for NamedBlend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(blend: NamedBlend, clear: [f32; 4], sources: &[[f32; 4]]) -> [f32; 4] {
        let equation = blend.equation();
        sources
            .iter()
            .fold(clear, |dst, src| equation.apply(*src, dst))
    }

    #[test]
    fn transmittance_multiplies_one_minus_source() {
        let result = fold(
            NamedBlend::MultiplicativeTransmittance,
            [1.0; 4],
            &[[0.5; 4], [0.25; 4]],
        );
        for channel in result {
            assert!((channel - 0.375).abs() < 1e-6);
        }
    }

    #[test]
    fn corrected_alpha_adds_color_and_multiplies_alpha() {
        let result = fold(
            NamedBlend::CorrectedAlphaAdditive,
            [0.0, 0.0, 0.0, 1.0],
            &[[0.2, 0.1, 0.0, 0.5], [0.1, 0.1, 0.1, 0.5]],
        );
        assert!((result[0] - 0.3).abs() < 1e-6);
        assert!((result[1] - 0.2).abs() < 1e-6);
        assert!((result[2] - 0.1).abs() < 1e-6);
        assert!((result[3] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn catalog_is_order_independent() {
        let sources = [
            [0.3, 0.1, 0.7, 0.25],
            [0.05, 0.4, 0.2, 0.5],
            [0.6, 0.6, 0.1, 0.125],
        ];
        let reversed: Vec<_> = sources.iter().rev().copied().collect();
        for (blend, clear) in [
            (NamedBlend::Additive, [0.0; 4]),
            (NamedBlend::MultiplicativeTransmittance, [1.0; 4]),
            (NamedBlend::CorrectedAlphaAdditive, [0.0, 0.0, 0.0, 1.0]),
        ] {
            let forward = fold(blend, clear, &sources);
            let backward = fold(blend, clear, &reversed);
            for channel in 0..4 {
                assert!(
                    (forward[channel] - backward[channel]).abs() < 1e-6,
                    "{blend} differs on channel {channel}"
                );
            }
        }
    }
}
