use std::borrow::Cow;

use crate::blend::{BlendComponent, BlendEquation, BlendFactor, BlendOp};
use crate::device::{BlendDesc, CompareFunction, DepthStencilDesc, TextureFormat};
use crate::programs::ProgramKind;
use crate::scene::Vertex;

use super::shaders;

/// Vertex layout uploaded per batch: position, color and the batch surface id.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct GpuVertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
    pub surface: u32,
}

impl GpuVertex {
    pub(crate) fn from_vertex(vertex: &Vertex, surface: u32) -> Self {
        Self {
            position: vertex.position,
            color: vertex.color,
            surface,
        }
    }
}

const VERTEX_ATTRIBUTES: [wgpu::VertexAttribute; 3] =
    wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x4, 2 => Uint32];

fn vertex_layout() -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout {
        array_stride: std::mem::size_of::<GpuVertex>() as wgpu::BufferAddress,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &VERTEX_ATTRIBUTES,
    }
}

pub(crate) fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::R16Float => wgpu::TextureFormat::R16Float,
        TextureFormat::R32Uint => wgpu::TextureFormat::R32Uint,
        TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
    }
}

fn blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
    match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::InvSrcColor => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::InvSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
    }
}

fn blend_component(component: BlendComponent) -> wgpu::BlendComponent {
    wgpu::BlendComponent {
        src_factor: blend_factor(component.src_factor),
        dst_factor: blend_factor(component.dst_factor),
        operation: match component.op {
            BlendOp::Add => wgpu::BlendOperation::Add,
        },
    }
}

pub(crate) fn blend_state(equation: BlendEquation) -> wgpu::BlendState {
    wgpu::BlendState {
        color: blend_component(equation.color),
        alpha: blend_component(equation.alpha),
    }
}

fn compare_function(compare: CompareFunction) -> wgpu::CompareFunction {
    match compare {
        CompareFunction::Always => wgpu::CompareFunction::Always,
        CompareFunction::Less => wgpu::CompareFunction::Less,
        CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
    }
}

/// Everything a render pipeline depends on. Pipelines are cached per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PipelineKey {
    pub program: u32,
    pub blend: u32,
    pub depth_state: u32,
    pub color_formats: Vec<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
    pub sample_count: u32,
}

/// A compiled program: shader module plus the layouts its pipelines share.
pub(crate) struct GpuProgram {
    pub kind: ProgramKind,
    pub module: wgpu::ShaderModule,
    pub input_layout: wgpu::BindGroupLayout,
    pub pipeline_layout: wgpu::PipelineLayout,
}

fn input_entries(kind: ProgramKind) -> Vec<wgpu::BindGroupLayoutEntry> {
    let texture = |binding: u32, sample_type: wgpu::TextureSampleType, multisampled: bool| {
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type,
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled,
            },
            count: None,
        }
    };
    match kind {
        ProgramKind::Opaque | ProgramKind::Transmittance => Vec::new(),
        ProgramKind::StochasticCoverage => vec![texture(0, wgpu::TextureSampleType::Uint, false)],
        ProgramKind::Accumulate | ProgramKind::AccumulateMerged => {
            vec![texture(0, wgpu::TextureSampleType::Depth, true)]
        }
        ProgramKind::Composite(_) => (0..3)
            .map(|binding| {
                texture(
                    binding,
                    wgpu::TextureSampleType::Float { filterable: false },
                    false,
                )
            })
            .collect(),
    }
}

impl GpuProgram {
    pub(crate) fn new(
        device: &wgpu::Device,
        params_layout: &wgpu::BindGroupLayout,
        kind: ProgramKind,
    ) -> Self {
        let source = shaders::program_source(kind);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(kind.label()),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(source)),
        });
        let input_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(kind.label()),
            entries: &input_entries(kind),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(kind.label()),
            bind_group_layouts: &[params_layout, &input_layout],
            push_constant_ranges: &[],
        });
        Self {
            kind,
            module,
            input_layout,
            pipeline_layout,
        }
    }

    pub(crate) fn create_pipeline(
        &self,
        device: &wgpu::Device,
        key: &PipelineKey,
        blend: &BlendDesc,
        depth: &DepthStencilDesc,
    ) -> wgpu::RenderPipeline {
        let targets: Vec<Option<wgpu::ColorTargetState>> = key
            .color_formats
            .iter()
            .enumerate()
            .map(|(index, format)| {
                Some(wgpu::ColorTargetState {
                    format: texture_format(*format),
                    blend: blend.targets.get(index).copied().flatten().map(blend_state),
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();

        let depth_stencil = key.depth_format.map(|format| wgpu::DepthStencilState {
            format: texture_format(format),
            depth_write_enabled: depth.depth_write,
            depth_compare: if depth.depth_test {
                compare_function(depth.compare)
            } else {
                wgpu::CompareFunction::Always
            },
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });

        let vertex_buffers = if self.kind.draws_geometry() {
            vec![vertex_layout()]
        } else {
            Vec::new()
        };

        device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(self.kind.label()),
            layout: Some(&self.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &self.module,
                entry_point: Some(shaders::vertex_entry(self.kind)),
                buffers: &vertex_buffers,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil,
            multisample: wgpu::MultisampleState {
                count: key.sample_count,
                mask: !0,
                alpha_to_coverage_enabled: blend.alpha_to_coverage,
            },
            fragment: Some(wgpu::FragmentState {
                module: &self.module,
                entry_point: Some(shaders::FRAGMENT_ENTRY),
                targets: &targets,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            multiview: None,
            cache: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blend::NamedBlend;

    #[test]
    fn transmittance_maps_to_one_minus_src() {
        let state = blend_state(NamedBlend::MultiplicativeTransmittance.equation());
        assert_eq!(state.color.src_factor, wgpu::BlendFactor::Zero);
        assert_eq!(state.color.dst_factor, wgpu::BlendFactor::OneMinusSrc);
        assert_eq!(state.alpha.dst_factor, wgpu::BlendFactor::OneMinusSrcAlpha);
    }

    #[test]
    fn vertex_stride_matches_attributes() {
        assert_eq!(std::mem::size_of::<GpuVertex>(), 32);
        assert_eq!(VERTEX_ATTRIBUTES[2].offset, 28);
    }

    #[test]
    fn composite_reads_three_textures() {
        use crate::compositor::CompositeLayout;
        let entries = input_entries(ProgramKind::Composite(CompositeLayout::MergedTransmittance));
        assert_eq!(entries.len(), 3);
        assert!(input_entries(ProgramKind::Opaque).is_empty());
    }
}
