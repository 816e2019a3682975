//! WGSL for every program. Each program gets its own module built from the
//! shared prelude plus its entry points, so bindings in group 1 never clash.

use crate::compositor::CompositeLayout;
use crate::programs::ProgramKind;

const PRELUDE: &str = r#"
struct FrameParams {
    viewport: vec2<u32>,
    mask_size_minus_one: u32,
    alpha_levels: u32,
    sample_count: u32,
    random_offset: u32,
    padding: vec2<u32>,
};

@group(0) @binding(0) var<uniform> params: FrameParams;

const DEPTH_EPSILON: f32 = 1e-6;
const TOTAL_ALPHA_EPSILON: f32 = 1e-5;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) color: vec4<f32>,
    @location(2) surface: u32,
};

struct VertexOutput {
    @builtin(position) clip: vec4<f32>,
    @location(0) @interpolate(flat) color: vec4<f32>,
    @location(1) @interpolate(flat) surface: u32,
    @location(2) @interpolate(flat) primitive: u32,
};

@vertex
fn vs_geometry(input: VertexInput, @builtin(vertex_index) index: u32) -> VertexOutput {
    var out: VertexOutput;
    out.clip = vec4<f32>(input.position, 1.0);
    out.color = input.color;
    out.surface = input.surface;
    out.primitive = index / 3u;
    return out;
}

@vertex
fn vs_fullscreen(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    let uv = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    return vec4<f32>(uv * vec2<f32>(2.0, -2.0) + vec2<f32>(-1.0, 1.0), 0.0, 1.0);
}
"#;

const OPAQUE: &str = r#"
@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    return vec4<f32>(input.color.rgb, 1.0);
}
"#;

const STOCHASTIC_COVERAGE: &str = r#"
@group(1) @binding(0) var coverage_masks: texture_2d<u32>;

fn wang_hash(seed_in: u32) -> u32 {
    var seed = (seed_in ^ 61u) ^ (seed_in >> 16u);
    seed = seed * 9u;
    seed = seed ^ (seed >> 4u);
    seed = seed * 0x27d4eb2du;
    seed = seed ^ (seed >> 15u);
    return seed;
}

fn dither_index(pixel: vec2<u32>, surface: u32, primitive: u32) -> u32 {
    var hash = wang_hash((surface * 0x9e3779b9u) ^ primitive);
    hash = wang_hash(hash ^ pixel.x);
    hash = wang_hash(hash ^ (pixel.y * 0x85ebca6bu));
    return hash + params.random_offset;
}

fn quantize_alpha(alpha: f32) -> u32 {
    let scaled = floor(clamp(alpha, 0.0, 1.0) * f32(params.alpha_levels) + 0.5);
    return min(u32(scaled), params.alpha_levels);
}

fn full_mask() -> u32 {
    if params.sample_count >= 32u {
        return 0xffffffffu;
    }
    return (1u << params.sample_count) - 1u;
}

struct CoverageOutput {
    @builtin(sample_mask) mask: u32,
};

@fragment
fn fs_main(input: VertexOutput) -> CoverageOutput {
    let pixel = vec2<u32>(input.clip.xy);
    let column = dither_index(pixel, input.surface, input.primitive) & params.mask_size_minus_one;
    let level = quantize_alpha(input.color.a);
    var out: CoverageOutput;
    out.mask = textureLoad(coverage_masks, vec2<u32>(column, level), 0).r & full_mask();
    return out;
}
"#;

const TRANSMITTANCE: &str = r#"
@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let a = input.color.a;
    return vec4<f32>(a, a, a, a);
}
"#;

const VISIBILITY: &str = r#"
@group(1) @binding(0) var stochastic_depth: texture_depth_multisampled_2d;

fn visibility(pixel: vec2<u32>, depth: f32) -> f32 {
    var visible = 0u;
    for (var s = 0u; s < params.sample_count; s = s + 1u) {
        let stored = textureLoad(stochastic_depth, pixel, s);
        if depth <= stored + DEPTH_EPSILON {
            visible = visible + 1u;
        }
    }
    return f32(visible) / f32(params.sample_count);
}
"#;

const ACCUMULATE: &str = r#"
@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let weight = input.color.a * visibility(vec2<u32>(input.clip.xy), input.clip.z);
    return vec4<f32>(input.color.rgb * weight, weight);
}
"#;

const ACCUMULATE_MERGED: &str = r#"
struct MergedOutput {
    @location(0) color: vec4<f32>,
    @location(1) total_alpha: vec4<f32>,
};

@fragment
fn fs_main(input: VertexOutput) -> MergedOutput {
    let weight = input.color.a * visibility(vec2<u32>(input.clip.xy), input.clip.z);
    var out: MergedOutput;
    out.color = vec4<f32>(input.color.rgb * weight, input.color.a);
    out.total_alpha = vec4<f32>(weight, weight, weight, weight);
    return out;
}
"#;

const COMPOSITE_INPUTS: &str = r#"
@group(1) @binding(0) var background_color: texture_2d<f32>;
@group(1) @binding(1) var accumulated_color: texture_2d<f32>;
@group(1) @binding(2) var auxiliary: texture_2d<f32>;

fn resolve(background: vec4<f32>, accumulated: vec4<f32>, transmittance: f32, total_alpha: f32) -> vec4<f32> {
    let t = clamp(transmittance, 0.0, 1.0);
    var k = 1.0;
    if total_alpha > TOTAL_ALPHA_EPSILON {
        k = (1.0 - t) / total_alpha;
    }
    return vec4<f32>(background.rgb * t + accumulated.rgb * k, 1.0);
}
"#;

const COMPOSITE_SEPARATE: &str = r#"
@fragment
fn fs_main(@builtin(position) position: vec4<f32>) -> @location(0) vec4<f32> {
    let pixel = vec2<u32>(position.xy);
    let background = textureLoad(background_color, pixel, 0);
    let accumulated = textureLoad(accumulated_color, pixel, 0);
    let transmittance = textureLoad(auxiliary, pixel, 0).r;
    return resolve(background, accumulated, transmittance, accumulated.a);
}
"#;

const COMPOSITE_MERGED: &str = r#"
@fragment
fn fs_main(@builtin(position) position: vec4<f32>) -> @location(0) vec4<f32> {
    let pixel = vec2<u32>(position.xy);
    let background = textureLoad(background_color, pixel, 0);
    let accumulated = textureLoad(accumulated_color, pixel, 0);
    let total_alpha = textureLoad(auxiliary, pixel, 0).r;
    return resolve(background, accumulated, accumulated.a, total_alpha);
}
"#;

pub(crate) const FRAGMENT_ENTRY: &str = "fs_main";

pub(crate) fn vertex_entry(kind: ProgramKind) -> &'static str {
    if kind.draws_geometry() {
        "vs_geometry"
    } else {
        "vs_fullscreen"
    }
}

pub(crate) fn program_source(kind: ProgramKind) -> String {
    let parts: &[&str] = match kind {
        ProgramKind::Opaque => &[OPAQUE],
        ProgramKind::StochasticCoverage => &[STOCHASTIC_COVERAGE],
        ProgramKind::Transmittance => &[TRANSMITTANCE],
        ProgramKind::Accumulate => &[VISIBILITY, ACCUMULATE],
        ProgramKind::AccumulateMerged => &[VISIBILITY, ACCUMULATE_MERGED],
        ProgramKind::Composite(CompositeLayout::SeparateTransmittance) => {
            &[COMPOSITE_INPUTS, COMPOSITE_SEPARATE]
        }
        ProgramKind::Composite(CompositeLayout::MergedTransmittance) => {
            &[COMPOSITE_INPUTS, COMPOSITE_MERGED]
        }
    };
    let mut source = String::from(PRELUDE);
    for part in parts {
        source.push_str(part);
    }
    source
}
