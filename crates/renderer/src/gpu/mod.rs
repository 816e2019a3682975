//! wgpu implementation of [`GraphicsDevice`].
//!
//! - `context` owns the headless instance, device and queue and watches for
//!   device loss.
//! - `shaders` holds the WGSL translation of every program in
//!   [`crate::programs`].
//! - `pipeline` maps device descriptors onto wgpu state and builds render
//!   pipelines, cached per program, state and attachment layout.
//! - `readback` copies single-sample targets back to the CPU.
//!
//! One command encoder records a whole frame; clears become load-op passes.
//! wgpu tracks barriers itself, so transitions only enforce the state rules.

mod context;
mod pipeline;
mod readback;
mod shaders;

use std::collections::HashMap;

use wgpu::util::DeviceExt;

use crate::device::{
    BlendDesc, BlendStateId, ClearValue, DepthStateId, DepthStencilDesc, DeviceCaps, DeviceError,
    DrawCall, GraphicsDevice, HandleKind, PassBinding, PixelBuffer, ProgramId, ResourceState,
    TextureDesc, TextureFormat, TextureId, TextureRole,
};
use crate::programs::{FrameParams, ProgramKind};

pub use context::AdapterProfile;
use context::GpuContext;
use pipeline::{GpuProgram, GpuVertex, PipelineKey};

struct GpuTexture {
    desc: TextureDesc,
    state: ResourceState,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

fn texture_entry(
    textures: &[Option<GpuTexture>],
    id: TextureId,
) -> Result<&GpuTexture, DeviceError> {
    textures
        .get(id.index() as usize)
        .and_then(Option::as_ref)
        .ok_or(DeviceError::UnknownHandle {
            kind: HandleKind::Texture,
            index: id.index(),
        })
}

pub struct WgpuDevice {
    context: GpuContext,
    params_layout: wgpu::BindGroupLayout,
    params_buffer: wgpu::Buffer,
    params_group: wgpu::BindGroup,
    textures: Vec<Option<GpuTexture>>,
    blend_states: Vec<BlendDesc>,
    depth_states: Vec<DepthStencilDesc>,
    programs: Vec<GpuProgram>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    bound_inputs: Vec<TextureId>,
    encoder: Option<wgpu::CommandEncoder>,
}

impl WgpuDevice {
    /// Opens the default high-performance adapter without a surface.
    pub fn new_headless() -> Result<Self, DeviceError> {
        Self::with_power_preference(wgpu::PowerPreference::HighPerformance)
    }

    pub fn with_power_preference(
        power_preference: wgpu::PowerPreference,
    ) -> Result<Self, DeviceError> {
        let context = GpuContext::new(power_preference)?;
        let device = &context.device;

        let params_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("frame params layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("frame params"),
            contents: bytemuck::bytes_of(&FrameParams::new((1, 1), 1, 1, 1, 0)),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let params_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("frame params"),
            layout: &params_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: params_buffer.as_entire_binding(),
            }],
        });

        tracing::info!(
            adapter = %context.profile.name,
            backend = ?context.profile.backend,
            sample_counts = ?context.sample_counts,
            "wgpu device ready"
        );

        Ok(Self {
            context,
            params_layout,
            params_buffer,
            params_group,
            textures: Vec::new(),
            blend_states: Vec::new(),
            depth_states: Vec::new(),
            programs: Vec::new(),
            pipelines: HashMap::new(),
            bound_inputs: Vec::new(),
            encoder: None,
        })
    }

    pub fn profile(&self) -> &AdapterProfile {
        &self.context.profile
    }

    fn texture(&self, id: TextureId) -> Result<&GpuTexture, DeviceError> {
        texture_entry(&self.textures, id)
    }

    fn texture_mut(&mut self, id: TextureId) -> Result<&mut GpuTexture, DeviceError> {
        self.textures
            .get_mut(id.index() as usize)
            .and_then(Option::as_mut)
            .ok_or(DeviceError::UnknownHandle {
                kind: HandleKind::Texture,
                index: id.index(),
            })
    }

    fn insert(&mut self, texture: GpuTexture) -> TextureId {
        let id = TextureId::new(self.textures.len() as u32);
        self.textures.push(Some(texture));
        id
    }

    fn encoder(&mut self) -> Result<&mut wgpu::CommandEncoder, DeviceError> {
        self.encoder
            .as_mut()
            .ok_or_else(|| DeviceError::Invalid("no frame in progress".into()))
    }

    fn check_extent(&self, width: u32, height: u32) -> Result<(), DeviceError> {
        if width == 0 || height == 0 {
            return Err(DeviceError::Invalid(format!(
                "texture size {width}x{height} is empty"
            )));
        }
        let max = self.context.max_texture_dimension;
        if width > max || height > max {
            return Err(DeviceError::Unsupported(format!(
                "texture size {width}x{height} exceeds {max}"
            )));
        }
        Ok(())
    }

    /// Runs `create` inside its own error scopes so allocation failures are
    /// reported against the resource instead of the next frame.
    fn scoped<T>(
        &self,
        what: &str,
        create: impl FnOnce(&wgpu::Device) -> T,
    ) -> Result<T, DeviceError> {
        self.context.check_alive()?;
        self.context.push_error_scopes();
        let value = create(&self.context.device);
        self.context.pop_error_scopes(what)?;
        Ok(value)
    }

    /// Checks target states and returns the attachment layout of a draw.
    fn check_targets(&self, pass: &PassBinding<'_>) -> Result<AttachmentLayout, DeviceError> {
        let label = pass.label;
        let mut sample_count = None;
        let mut check = |id: TextureId,
                         required: ResourceState|
         -> Result<TextureFormat, DeviceError> {
            let texture = self.texture(id)?;
            if texture.state != required {
                return Err(DeviceError::Invalid(format!(
                    "pass `{label}`: target `{}` is in {:?}, expected {:?}",
                    texture.desc.label, texture.state, required
                )));
            }
            if self.bound_inputs.contains(&id) {
                return Err(DeviceError::Invalid(format!(
                    "pass `{label}`: `{}` is bound as both input and target",
                    texture.desc.label
                )));
            }
            sample_count.get_or_insert(texture.desc.sample_count);
            Ok(texture.desc.format)
        };

        let color_formats = pass
            .color_targets
            .iter()
            .map(|&id| check(id, ResourceState::RenderTarget))
            .collect::<Result<Vec<_>, _>>()?;
        let depth_format = match pass.depth_target {
            Some(id) => Some(check(id, ResourceState::DepthWrite)?),
            None => None,
        };
        let sample_count = sample_count
            .ok_or_else(|| DeviceError::Invalid(format!("pass `{label}` has no render targets")))?;
        Ok(AttachmentLayout {
            sample_count,
            color_formats,
            depth_format,
        })
    }

    fn pipeline_for(
        &mut self,
        pass: &PassBinding<'_>,
        key: PipelineKey,
    ) -> Result<PipelineKey, DeviceError> {
        if self.pipelines.contains_key(&key) {
            return Ok(key);
        }
        let program = self.programs.get(pass.program.index() as usize).ok_or(
            DeviceError::UnknownHandle {
                kind: HandleKind::Program,
                index: pass.program.index(),
            },
        )?;
        let blend = self.blend_states.get(pass.blend.index() as usize).ok_or(
            DeviceError::UnknownHandle {
                kind: HandleKind::BlendState,
                index: pass.blend.index(),
            },
        )?;
        let depth = self.depth_states.get(pass.depth_state.index() as usize).ok_or(
            DeviceError::UnknownHandle {
                kind: HandleKind::DepthState,
                index: pass.depth_state.index(),
            },
        )?;
        let pipeline = program.create_pipeline(&self.context.device, &key, blend, depth);
        tracing::debug!(
            pass = pass.label,
            program = program.kind.label(),
            samples = key.sample_count,
            "created render pipeline"
        );
        self.pipelines.insert(key.clone(), pipeline);
        Ok(key)
    }
}

struct AttachmentLayout {
    sample_count: u32,
    color_formats: Vec<TextureFormat>,
    depth_format: Option<TextureFormat>,
}

struct DrawRecording<'a> {
    label: &'a str,
    colors: Vec<&'a wgpu::TextureView>,
    depth: Option<&'a wgpu::TextureView>,
    pipeline: &'a wgpu::RenderPipeline,
    params: &'a wgpu::BindGroup,
    inputs: &'a wgpu::BindGroup,
}

fn record_draw(
    encoder: &mut wgpu::CommandEncoder,
    recording: &DrawRecording<'_>,
    buffers: &[(wgpu::Buffer, u32)],
    full_screen: bool,
) {
    let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment<'_>>> = recording
        .colors
        .iter()
        .map(|&view| {
            Some(wgpu::RenderPassColorAttachment {
                view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })
        })
        .collect();
    let depth_stencil_attachment =
        recording
            .depth
            .map(|view| wgpu::RenderPassDepthStencilAttachment {
                view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            });

    let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some(recording.label),
        color_attachments: &color_attachments,
        depth_stencil_attachment,
        timestamp_writes: None,
        occlusion_query_set: None,
    });
    pass.set_pipeline(recording.pipeline);
    pass.set_bind_group(0, recording.params, &[]);
    pass.set_bind_group(1, recording.inputs, &[]);
    if full_screen {
        pass.draw(0..3, 0..1);
        return;
    }
    for (buffer, count) in buffers {
        pass.set_vertex_buffer(0, buffer.slice(..));
        pass.draw(0..*count, 0..1);
    }
}

impl GraphicsDevice for WgpuDevice {
    fn caps(&self) -> DeviceCaps {
        self.context.caps()
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, DeviceError> {
        self.check_extent(desc.width, desc.height)?;
        if desc.sample_count != 1 && !self.context.sample_counts.contains(&desc.sample_count) {
            return Err(DeviceError::Unsupported(format!(
                "{} samples for `{}`",
                desc.sample_count, desc.label
            )));
        }
        let (usage, state) = match (desc.role, desc.format.is_depth()) {
            (TextureRole::ColorTarget, false) if desc.format != TextureFormat::R32Uint => {
                let mut usage =
                    wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING;
                if desc.sample_count == 1 {
                    usage |= wgpu::TextureUsages::COPY_SRC;
                }
                (usage, ResourceState::RenderTarget)
            }
            (TextureRole::DepthTarget, true) => (
                wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
                ResourceState::DepthWrite,
            ),
            (TextureRole::Lookup, _) => {
                return Err(DeviceError::Invalid(format!(
                    "`{}`: lookup textures are created with create_lookup_texture",
                    desc.label
                )))
            }
            (role, _) => {
                return Err(DeviceError::Unsupported(format!(
                    "`{}`: {:?} as {role:?}",
                    desc.label, desc.format
                )))
            }
        };

        let texture = self.scoped(&format!("texture `{}`", desc.label), |device| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(desc.label),
                size: wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: desc.sample_count,
                dimension: wgpu::TextureDimension::D2,
                format: pipeline::texture_format(desc.format),
                usage,
                view_formats: &[],
            })
        })?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = self.insert(GpuTexture {
            desc: *desc,
            state,
            texture,
            view,
        });
        tracing::trace!(label = desc.label, id = id.index(), "created texture");
        Ok(id)
    }

    fn create_lookup_texture(
        &mut self,
        label: &'static str,
        width: u32,
        height: u32,
        data: &[u32],
    ) -> Result<TextureId, DeviceError> {
        self.check_extent(width, height)?;
        if data.len() != width as usize * height as usize {
            return Err(DeviceError::Invalid(format!(
                "`{label}`: {} cells for a {width}x{height} table",
                data.len()
            )));
        }
        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let queue = &self.context.queue;
        let texture = self.scoped(&format!("lookup texture `{label}`"), |device| {
            let texture = device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::R32Uint,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            });
            queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                bytemuck::cast_slice(data),
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(width * 4),
                    rows_per_image: Some(height),
                },
                size,
            );
            texture
        })?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(self.insert(GpuTexture {
            desc: TextureDesc {
                label,
                width,
                height,
                sample_count: 1,
                format: TextureFormat::R32Uint,
                role: TextureRole::Lookup,
            },
            state: ResourceState::ShaderRead,
            texture,
            view,
        }))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if let Some(slot) = self.textures.get_mut(texture.index() as usize) {
            if let Some(entry) = slot.take() {
                entry.texture.destroy();
            }
        }
        self.bound_inputs.retain(|&bound| bound != texture);
    }

    fn create_blend_state(&mut self, desc: &BlendDesc) -> Result<BlendStateId, DeviceError> {
        self.context.check_alive()?;
        if desc.targets.len() > 8 {
            return Err(DeviceError::Unsupported(format!(
                "{} color targets",
                desc.targets.len()
            )));
        }
        self.blend_states.push(desc.clone());
        Ok(BlendStateId::new(self.blend_states.len() as u32 - 1))
    }

    fn create_depth_state(
        &mut self,
        desc: &DepthStencilDesc,
    ) -> Result<DepthStateId, DeviceError> {
        self.context.check_alive()?;
        self.depth_states.push(*desc);
        Ok(DepthStateId::new(self.depth_states.len() as u32 - 1))
    }

    fn create_program(&mut self, kind: ProgramKind) -> Result<ProgramId, DeviceError> {
        let params_layout = &self.params_layout;
        let program = self.scoped(&format!("program `{}`", kind.label()), |device| {
            GpuProgram::new(device, params_layout, kind)
        })?;
        self.programs.push(program);
        Ok(ProgramId::new(self.programs.len() as u32 - 1))
    }

    fn begin_frame(&mut self, params: &FrameParams) -> Result<(), DeviceError> {
        self.context.check_alive()?;
        if self.encoder.is_some() {
            return Err(DeviceError::Invalid("frame already in progress".into()));
        }
        self.context.push_error_scopes();
        self.context
            .queue
            .write_buffer(&self.params_buffer, 0, bytemuck::bytes_of(params));
        self.encoder = Some(self.context.device.create_command_encoder(
            &wgpu::CommandEncoderDescriptor {
                label: Some("stochastic transparency frame"),
            },
        ));
        Ok(())
    }

    fn transition(&mut self, texture: TextureId, state: ResourceState) -> Result<(), DeviceError> {
        self.context.check_alive()?;
        if state != ResourceState::ShaderRead && self.bound_inputs.contains(&texture) {
            return Err(DeviceError::Invalid(format!(
                "texture {} is bound as an input",
                texture.index()
            )));
        }
        let entry = self.texture_mut(texture)?;
        let allowed = match (entry.desc.role, state) {
            (_, ResourceState::ShaderRead) => true,
            (TextureRole::ColorTarget, ResourceState::RenderTarget) => true,
            (TextureRole::DepthTarget, ResourceState::DepthWrite) => true,
            _ => false,
        };
        if !allowed {
            return Err(DeviceError::Invalid(format!(
                "`{}` ({:?}) cannot enter {:?}",
                entry.desc.label, entry.desc.role, state
            )));
        }
        entry.state = state;
        Ok(())
    }

    fn clear(&mut self, texture: TextureId, value: ClearValue) -> Result<(), DeviceError> {
        self.context.check_alive()?;
        if self.bound_inputs.contains(&texture) {
            return Err(DeviceError::Invalid(format!(
                "texture {} is bound as an input",
                texture.index()
            )));
        }
        let mut encoder = self
            .encoder
            .take()
            .ok_or_else(|| DeviceError::Invalid("no frame in progress".into()))?;
        let result = (|| -> Result<(), DeviceError> {
            let entry = self.texture(texture)?;
            match (value, entry.state) {
                (ClearValue::Color([r, g, b, a]), ResourceState::RenderTarget) => {
                    encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some(entry.desc.label),
                        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                            view: &entry.view,
                            depth_slice: None,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load: wgpu::LoadOp::Clear(wgpu::Color {
                                    r: f64::from(r),
                                    g: f64::from(g),
                                    b: f64::from(b),
                                    a: f64::from(a),
                                }),
                                store: wgpu::StoreOp::Store,
                            },
                        })],
                        depth_stencil_attachment: None,
                        timestamp_writes: None,
                        occlusion_query_set: None,
                    });
                    Ok(())
                }
                (ClearValue::Depth(depth), ResourceState::DepthWrite) => {
                    encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some(entry.desc.label),
                        color_attachments: &[],
                        depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                            view: &entry.view,
                            depth_ops: Some(wgpu::Operations {
                                load: wgpu::LoadOp::Clear(depth),
                                store: wgpu::StoreOp::Store,
                            }),
                            stencil_ops: None,
                        }),
                        timestamp_writes: None,
                        occlusion_query_set: None,
                    });
                    Ok(())
                }
                (value, state) => Err(DeviceError::Invalid(format!(
                    "cannot clear `{}` in {:?} with {:?}",
                    entry.desc.label, state, value
                ))),
            }
        })();
        self.encoder = Some(encoder);
        result
    }

    fn bind_inputs(&mut self, inputs: &[TextureId]) -> Result<(), DeviceError> {
        self.context.check_alive()?;
        if !self.bound_inputs.is_empty() {
            return Err(DeviceError::Invalid(
                "inputs are already bound; unbind them first".into(),
            ));
        }
        for &id in inputs {
            let texture = self.texture(id)?;
            if texture.state != ResourceState::ShaderRead {
                return Err(DeviceError::Invalid(format!(
                    "input `{}` is in {:?}",
                    texture.desc.label, texture.state
                )));
            }
        }
        self.bound_inputs = inputs.to_vec();
        Ok(())
    }

    fn unbind_inputs(&mut self) -> Result<(), DeviceError> {
        self.context.check_alive()?;
        self.bound_inputs.clear();
        Ok(())
    }

    fn draw(&mut self, pass: &PassBinding<'_>, call: DrawCall<'_>) -> Result<(), DeviceError> {
        self.context.check_alive()?;
        self.encoder()?;
        let kind = self
            .programs
            .get(pass.program.index() as usize)
            .map(|program| program.kind)
            .ok_or(DeviceError::UnknownHandle {
                kind: HandleKind::Program,
                index: pass.program.index(),
            })?;
        let full_screen = match call {
            DrawCall::Meshes(_) if !kind.draws_geometry() => {
                return Err(DeviceError::Invalid(format!(
                    "pass `{}`: program `{}` draws a full-screen triangle",
                    pass.label,
                    kind.label()
                )))
            }
            DrawCall::FullScreenTriangle if kind.draws_geometry() => {
                return Err(DeviceError::Invalid(format!(
                    "pass `{}`: program `{}` needs geometry",
                    pass.label,
                    kind.label()
                )))
            }
            DrawCall::Meshes(_) => false,
            DrawCall::FullScreenTriangle => true,
        };
        if self.bound_inputs.len() != kind.input_count() {
            return Err(DeviceError::Invalid(format!(
                "pass `{}`: program `{}` reads {} inputs, {} bound",
                pass.label,
                kind.label(),
                kind.input_count(),
                self.bound_inputs.len()
            )));
        }

        let layout = self.check_targets(pass)?;
        let key = self.pipeline_for(
            pass,
            PipelineKey {
                program: pass.program.index(),
                blend: pass.blend.index(),
                depth_state: pass.depth_state.index(),
                color_formats: layout.color_formats,
                depth_format: layout.depth_format,
                sample_count: layout.sample_count,
            },
        )?;

        let device = &self.context.device;
        let buffers: Vec<(wgpu::Buffer, u32)> = match call {
            DrawCall::Meshes(batches) => batches
                .iter()
                .filter(|batch| batch.triangle_count() > 0)
                .map(|batch| {
                    let vertices: Vec<GpuVertex> = batch
                        .vertices
                        .iter()
                        .map(|vertex| GpuVertex::from_vertex(vertex, batch.surface))
                        .collect();
                    let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some(pass.label),
                        contents: bytemuck::cast_slice(&vertices),
                        usage: wgpu::BufferUsages::VERTEX,
                    });
                    (buffer, (batch.triangle_count() * 3) as u32)
                })
                .collect(),
            DrawCall::FullScreenTriangle => Vec::new(),
        };

        let textures = &self.textures;
        let program = &self.programs[pass.program.index() as usize];
        let input_views = self
            .bound_inputs
            .iter()
            .map(|&id| texture_entry(textures, id).map(|texture| &texture.view))
            .collect::<Result<Vec<_>, _>>()?;
        let entries: Vec<wgpu::BindGroupEntry<'_>> = input_views
            .iter()
            .enumerate()
            .map(|(binding, &view)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: wgpu::BindingResource::TextureView(view),
            })
            .collect();
        let inputs = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(pass.label),
            layout: &program.input_layout,
            entries: &entries,
        });

        let colors = pass
            .color_targets
            .iter()
            .map(|&id| texture_entry(textures, id).map(|texture| &texture.view))
            .collect::<Result<Vec<_>, _>>()?;
        let depth = match pass.depth_target {
            Some(id) => Some(&texture_entry(textures, id)?.view),
            None => None,
        };
        let pipeline = self.pipelines.get(&key).ok_or_else(|| {
            DeviceError::Invalid(format!("pass `{}`: pipeline missing from cache", pass.label))
        })?;
        let recording = DrawRecording {
            label: pass.label,
            colors,
            depth,
            pipeline,
            params: &self.params_group,
            inputs: &inputs,
        };
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| DeviceError::Invalid("no frame in progress".into()))?;
        record_draw(encoder, &recording, &buffers, full_screen);
        tracing::trace!(
            pass = pass.label,
            program = kind.label(),
            batches = buffers.len(),
            "recorded draw"
        );
        Ok(())
    }

    fn end_frame(&mut self) -> Result<(), DeviceError> {
        self.context.check_alive()?;
        if !self.bound_inputs.is_empty() {
            return Err(DeviceError::Invalid(
                "inputs still bound at end of frame".into(),
            ));
        }
        let encoder = self
            .encoder
            .take()
            .ok_or_else(|| DeviceError::Invalid("no frame in progress".into()))?;
        self.context.queue.submit(Some(encoder.finish()));
        self.context.pop_error_scopes("frame")
    }

    fn abandon_frame(&mut self) {
        self.bound_inputs.clear();
        if self.encoder.take().is_some() {
            if let Err(err) = self.context.pop_error_scopes("abandoned frame") {
                tracing::debug!(error = %err, "errors from abandoned frame");
            }
        }
    }

    fn read_texture(&mut self, texture: TextureId) -> Result<PixelBuffer, DeviceError> {
        self.context.check_alive()?;
        if self.encoder.is_some() {
            return Err(DeviceError::Invalid(
                "cannot read back while a frame is recording".into(),
            ));
        }
        let entry = self.texture(texture)?;
        readback::read_texture(
            &self.context.device,
            &self.context.queue,
            &entry.texture,
            &entry.desc,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{RendererConfig, StochasticTransparency};
    use crate::scene::{BatchList, MeshBatch};
    use maskgen::TableParams;
    use oitconfig::TechniqueMode;

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn renders_background_and_one_layer() {
        let device = match WgpuDevice::new_headless() {
            Ok(device) => device,
            Err(err) => {
                eprintln!("skipping: {err}");
                return;
            }
        };
        let Some(&samples) = device.caps().sample_counts.first() else {
            eprintln!("skipping: no multisampled depth support");
            return;
        };
        let config = RendererConfig {
            mode: TechniqueMode::TwoTargetMerged,
            table: TableParams {
                sample_count: samples,
                dither_table_size: 256,
                ..TableParams::default()
            },
            width: 16,
            height: 16,
            background: [0.0, 0.0, 1.0],
            ..RendererConfig::default()
        };
        let mut renderer = StochasticTransparency::new(device, config).unwrap();
        let scene =
            BatchList::with_transparent(vec![MeshBatch::full_screen(0, 0.5, [1.0, 0.0, 0.0, 1.0])]);
        renderer.render_frame(&scene).unwrap();
        let pixels = renderer.read_output().unwrap();
        let [r, _, b, _] = pixels.pixel(8, 8).unwrap();
        assert!(r > 0.95, "red {r}");
        assert!(b < 0.05, "blue {b}");
    }
}
