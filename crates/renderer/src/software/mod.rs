//! CPU reference implementation of [`GraphicsDevice`].
//!
//! Textures hold `f32` texels per sample. The device checks the same resource
//! state rules a real API would enforce (targets in `RenderTarget` or
//! `DepthWrite`, inputs in `ShaderRead`, nothing read and written by one draw)
//! and runs the program contracts from [`crate::programs`] directly.

mod raster;

use maskgen::full_mask;

use crate::device::{
    BlendDesc, BlendStateId, ClearValue, DepthStateId, DepthStencilDesc, DeviceCaps, DeviceError,
    DrawCall, GraphicsDevice, HandleKind, PassBinding, PixelBuffer, ProgramId, ResourceState,
    TextureDesc, TextureFormat, TextureId, TextureRole,
};
use crate::programs::{self, FrameParams, Fragment, LookupView, ProgramKind};

const DEFAULT_SAMPLE_COUNTS: [u32; 6] = [1, 2, 4, 8, 16, 32];
const MAX_TEXTURE_DIMENSION: u32 = 16384;
const MAX_TEXELS: u64 = 1 << 28;

#[derive(Debug, Clone)]
enum Texels {
    Color(Vec<[f32; 4]>),
    Depth(Vec<f32>),
    Uint(Vec<u32>),
}

#[derive(Debug, Clone)]
struct SoftTexture {
    desc: TextureDesc,
    state: ResourceState,
    texels: Texels,
}

impl SoftTexture {
    fn pixel_range(&self, x: u32, y: u32) -> std::ops::Range<usize> {
        let samples = self.desc.sample_count as usize;
        let start = (y as usize * self.desc.width as usize + x as usize) * samples;
        start..start + samples
    }

    /// Average of every sample at a pixel.
    fn resolve(&self, x: u32, y: u32) -> [f32; 4] {
        let range = self.pixel_range(x, y);
        let count = range.len() as f32;
        match &self.texels {
            Texels::Color(texels) => {
                let mut sum = [0.0f32; 4];
                for texel in &texels[range] {
                    for channel in 0..4 {
                        sum[channel] += texel[channel];
                    }
                }
                sum.map(|value| value / count)
            }
            Texels::Depth(texels) => {
                let depth = texels[range].iter().sum::<f32>() / count;
                [depth, depth, depth, 1.0]
            }
            Texels::Uint(texels) => [texels[range.start] as f32, 0.0, 0.0, 1.0],
        }
    }
}

/// Counters for the frames a device has executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftwareStats {
    pub frames: u64,
    pub draws: u64,
    pub fragments: u64,
}

#[derive(Debug)]
pub struct SoftwareDevice {
    caps: DeviceCaps,
    textures: Vec<Option<SoftTexture>>,
    blend_states: Vec<BlendDesc>,
    depth_states: Vec<DepthStencilDesc>,
    programs: Vec<ProgramKind>,
    frame: Option<FrameParams>,
    inputs: Vec<TextureId>,
    lost: Option<String>,
    stats: SoftwareStats,
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::with_sample_counts(DEFAULT_SAMPLE_COUNTS.to_vec())
    }

    /// A device that only accepts the given sample counts.
    pub fn with_sample_counts(mut sample_counts: Vec<u32>) -> Self {
        sample_counts.retain(|&count| (1..=32).contains(&count));
        if !sample_counts.contains(&1) {
            sample_counts.push(1);
        }
        sample_counts.sort_unstable();
        sample_counts.dedup();
        Self {
            caps: DeviceCaps {
                name: "software".to_string(),
                sample_counts,
                max_texture_dimension: MAX_TEXTURE_DIMENSION,
            },
            textures: Vec::new(),
            blend_states: Vec::new(),
            depth_states: Vec::new(),
            programs: Vec::new(),
            frame: None,
            inputs: Vec::new(),
            lost: None,
            stats: SoftwareStats::default(),
        }
    }

    /// Marks the device lost. Every later call fails with
    /// [`DeviceError::Lost`].
    pub fn lose_device(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(%reason, "software device lost");
        self.lost = Some(reason);
    }

    pub fn stats(&self) -> SoftwareStats {
        self.stats
    }

    /// Number of live textures.
    pub fn texture_count(&self) -> usize {
        self.textures.iter().filter(|slot| slot.is_some()).count()
    }

    fn check_alive(&self) -> Result<(), DeviceError> {
        match &self.lost {
            Some(reason) => Err(DeviceError::Lost(reason.clone())),
            None => Ok(()),
        }
    }

    fn check_frame(&self) -> Result<FrameParams, DeviceError> {
        self.frame
            .ok_or_else(|| DeviceError::Invalid("no frame in progress".into()))
    }

    fn texture(&self, id: TextureId) -> Result<&SoftTexture, DeviceError> {
        self.textures
            .get(id.index() as usize)
            .and_then(Option::as_ref)
            .ok_or(DeviceError::UnknownHandle {
                kind: HandleKind::Texture,
                index: id.index(),
            })
    }

    fn texture_mut(&mut self, id: TextureId) -> Result<&mut SoftTexture, DeviceError> {
        self.textures
            .get_mut(id.index() as usize)
            .and_then(Option::as_mut)
            .ok_or(DeviceError::UnknownHandle {
                kind: HandleKind::Texture,
                index: id.index(),
            })
    }

    fn insert(&mut self, texture: SoftTexture) -> TextureId {
        let id = TextureId::new(self.textures.len() as u32);
        self.textures.push(Some(texture));
        id
    }

    fn check_size(&self, width: u32, height: u32, samples: u32) -> Result<usize, DeviceError> {
        if width == 0 || height == 0 {
            return Err(DeviceError::Invalid(format!(
                "texture size {width}x{height} is empty"
            )));
        }
        let max = self.caps.max_texture_dimension;
        if width > max || height > max {
            return Err(DeviceError::Unsupported(format!(
                "texture size {width}x{height} exceeds {max}"
            )));
        }
        let texels = u64::from(width) * u64::from(height) * u64::from(samples);
        if texels > MAX_TEXELS {
            return Err(DeviceError::OutOfMemory(format!(
                "{texels} texels requested"
            )));
        }
        Ok(texels as usize)
    }

    /// Moves textures out of the table so a draw can own them; the caller
    /// must hand them back through `check_in`.
    fn check_out(&mut self, ids: &[TextureId]) -> Result<Vec<SoftTexture>, DeviceError> {
        let mut taken = Vec::with_capacity(ids.len());
        for &id in ids {
            match self
                .textures
                .get_mut(id.index() as usize)
                .and_then(Option::take)
            {
                Some(texture) => taken.push(texture),
                None => {
                    let count = taken.len();
                    self.check_in(&ids[..count], taken);
                    return Err(DeviceError::UnknownHandle {
                        kind: HandleKind::Texture,
                        index: id.index(),
                    });
                }
            }
        }
        Ok(taken)
    }

    fn check_in(&mut self, ids: &[TextureId], textures: Vec<SoftTexture>) {
        for (id, texture) in ids.iter().zip(textures) {
            self.textures[id.index() as usize] = Some(texture);
        }
    }

    fn validate_draw(
        &self,
        pass: &PassBinding<'_>,
        kind: ProgramKind,
        call: &DrawCall<'_>,
    ) -> Result<(), DeviceError> {
        let label = pass.label;
        match call {
            DrawCall::Meshes(_) if !kind.draws_geometry() => {
                return Err(DeviceError::Invalid(format!(
                    "pass `{label}`: program `{}` draws a full-screen triangle",
                    kind.label()
                )))
            }
            DrawCall::FullScreenTriangle if kind.draws_geometry() => {
                return Err(DeviceError::Invalid(format!(
                    "pass `{label}`: program `{}` needs geometry",
                    kind.label()
                )))
            }
            _ => {}
        }

        if pass.color_targets.len() != kind.color_output_count() {
            return Err(DeviceError::Invalid(format!(
                "pass `{label}`: program `{}` writes {} targets, {} bound",
                kind.label(),
                kind.color_output_count(),
                pass.color_targets.len()
            )));
        }
        if self.inputs.len() != kind.input_count() {
            return Err(DeviceError::Invalid(format!(
                "pass `{label}`: program `{}` reads {} inputs, {} bound",
                kind.label(),
                kind.input_count(),
                self.inputs.len()
            )));
        }

        let mut seen: Vec<TextureId> = Vec::new();
        let mut extent: Option<(u32, u32, u32)> = None;
        let targets = pass
            .color_targets
            .iter()
            .map(|id| (*id, ResourceState::RenderTarget))
            .chain(pass.depth_target.map(|id| (id, ResourceState::DepthWrite)));
        for (id, required) in targets {
            let texture = self.texture(id)?;
            if texture.state != required {
                return Err(DeviceError::Invalid(format!(
                    "pass `{label}`: target `{}` is in {:?}, expected {:?}",
                    texture.desc.label, texture.state, required
                )));
            }
            if self.inputs.contains(&id) {
                return Err(DeviceError::Invalid(format!(
                    "pass `{label}`: `{}` is bound as both input and target",
                    texture.desc.label
                )));
            }
            if seen.contains(&id) {
                return Err(DeviceError::Invalid(format!(
                    "pass `{label}`: `{}` bound twice",
                    texture.desc.label
                )));
            }
            seen.push(id);
            let this = (
                texture.desc.width,
                texture.desc.height,
                texture.desc.sample_count,
            );
            match extent {
                None => extent = Some(this),
                Some(other) if other != this => {
                    return Err(DeviceError::Invalid(format!(
                        "pass `{label}`: target `{}` is {}x{}@{}, others are {}x{}@{}",
                        texture.desc.label, this.0, this.1, this.2, other.0, other.1, other.2
                    )))
                }
                Some(_) => {}
            }
        }
        if extent.is_none() {
            return Err(DeviceError::Invalid(format!(
                "pass `{label}` has no render targets"
            )));
        }

        for (slot, &id) in self.inputs.iter().enumerate() {
            let texture = self.texture(id)?;
            if texture.state != ResourceState::ShaderRead {
                return Err(DeviceError::Invalid(format!(
                    "pass `{label}`: input `{}` is in {:?}",
                    texture.desc.label, texture.state
                )));
            }
            let expected = match (kind, slot) {
                (ProgramKind::StochasticCoverage, _) => matches!(texture.texels, Texels::Uint(_)),
                (ProgramKind::Accumulate | ProgramKind::AccumulateMerged, _) => {
                    matches!(texture.texels, Texels::Depth(_))
                }
                (ProgramKind::Composite(_), _) => matches!(texture.texels, Texels::Color(_)),
                _ => true,
            };
            if !expected {
                return Err(DeviceError::Invalid(format!(
                    "pass `{label}`: input {slot} `{}` has the wrong format for `{}`",
                    texture.desc.label,
                    kind.label()
                )));
            }
        }
        Ok(())
    }
}

/// One draw with every texture it touches checked out of the device.
struct DrawJob<'a> {
    kind: ProgramKind,
    params: FrameParams,
    blend: &'a BlendDesc,
    depth_state: DepthStencilDesc,
    colors: &'a mut [SoftTexture],
    depth: Option<&'a mut SoftTexture>,
    inputs: &'a [SoftTexture],
    samples: u32,
    fragments: u64,
}

impl DrawJob<'_> {
    fn lookup(&self) -> Option<LookupView<'_>> {
        let texture = self.inputs.first()?;
        match &texture.texels {
            Texels::Uint(cells) => Some(LookupView {
                width: texture.desc.width,
                height: texture.desc.height,
                cells,
            }),
            _ => None,
        }
    }

    fn stochastic_depths(&self, x: u32, y: u32) -> &[f32] {
        match self.inputs.first() {
            Some(texture) => match &texture.texels {
                Texels::Depth(depths) => &depths[texture.pixel_range(x, y)],
                _ => &[],
            },
            None => &[],
        }
    }

    fn shade(&mut self, fragment: Fragment) {
        self.fragments += 1;
        let [x, y] = fragment.pixel;
        let mut mask = match self.kind {
            ProgramKind::StochasticCoverage => match self.lookup() {
                Some(table) => programs::stochastic_coverage(&fragment, &self.params, table),
                None => 0,
            },
            _ => full_mask(self.samples),
        };

        if let Some(depth) = self.depth.as_deref_mut() {
            let range = depth.pixel_range(x, y);
            if let Texels::Depth(stored) = &mut depth.texels {
                let stored = &mut stored[range];
                for (sample, value) in stored.iter_mut().enumerate() {
                    let bit = 1u32 << sample;
                    if mask & bit == 0 {
                        continue;
                    }
                    if self.depth_state.depth_test
                        && !self.depth_state.compare.passes(fragment.depth, *value)
                    {
                        mask &= !bit;
                        continue;
                    }
                    if self.depth_state.depth_write {
                        *value = fragment.depth;
                    }
                }
            }
        }
        if mask == 0 {
            return;
        }

        let outputs: [Option<[f32; 4]>; 2] = match self.kind {
            ProgramKind::Opaque => [Some(programs::opaque(&fragment)), None],
            ProgramKind::StochasticCoverage | ProgramKind::Composite(_) => [None, None],
            ProgramKind::Transmittance => [Some(programs::transmittance(&fragment)), None],
            ProgramKind::Accumulate => {
                let visibility = programs::visibility(fragment.depth, self.stochastic_depths(x, y));
                [Some(programs::accumulate(&fragment, visibility)), None]
            }
            ProgramKind::AccumulateMerged => {
                let visibility = programs::visibility(fragment.depth, self.stochastic_depths(x, y));
                let [color, total] = programs::accumulate_merged(&fragment, visibility);
                [Some(color), Some(total)]
            }
        };
        self.write(x, y, mask, &outputs);
    }

    fn write(&mut self, x: u32, y: u32, mask: u32, outputs: &[Option<[f32; 4]>]) {
        for (index, target) in self.colors.iter_mut().enumerate() {
            let Some(src) = outputs.get(index).copied().flatten() else {
                continue;
            };
            let equation = self.blend.targets.get(index).copied().flatten();
            let unorm = target.desc.format == TextureFormat::Rgba8Unorm;
            let range = target.pixel_range(x, y);
            if let Texels::Color(texels) = &mut target.texels {
                for (sample, dst) in texels[range].iter_mut().enumerate() {
                    if mask & (1u32 << sample) == 0 {
                        continue;
                    }
                    let mut value = match equation {
                        Some(equation) => equation.apply(src, *dst),
                        None => src,
                    };
                    if unorm {
                        value = value.map(|channel| channel.clamp(0.0, 1.0));
                    }
                    *dst = value;
                }
            }
        }
    }

    fn full_screen(&mut self) {
        let ProgramKind::Composite(layout) = self.kind else {
            return;
        };
        let Some(first) = self.colors.first() else {
            return;
        };
        let (width, height) = (first.desc.width, first.desc.height);
        let mask = full_mask(self.samples);
        for y in 0..height {
            for x in 0..width {
                let mut inputs = [[0.0f32; 4]; 3];
                for (slot, texture) in self.inputs.iter().take(3).enumerate() {
                    let ix = x.min(texture.desc.width - 1);
                    let iy = y.min(texture.desc.height - 1);
                    inputs[slot] = texture.resolve(ix, iy);
                }
                self.fragments += 1;
                let out = programs::composite(layout, inputs);
                self.write(x, y, mask, &[Some(out)]);
            }
        }
    }
}

impl GraphicsDevice for SoftwareDevice {
    fn caps(&self) -> DeviceCaps {
        self.caps.clone()
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, DeviceError> {
        self.check_alive()?;
        if !self.caps.supports_sample_count(desc.sample_count) {
            return Err(DeviceError::Unsupported(format!(
                "{} samples for `{}`",
                desc.sample_count, desc.label
            )));
        }
        let count = self.check_size(desc.width, desc.height, desc.sample_count)?;
        let (texels, state) = match (desc.role, desc.format) {
            (TextureRole::DepthTarget, TextureFormat::Depth32Float) => {
                (Texels::Depth(vec![1.0; count]), ResourceState::DepthWrite)
            }
            (TextureRole::ColorTarget, format)
                if !format.is_depth() && format != TextureFormat::R32Uint =>
            {
                (Texels::Color(vec![[0.0; 4]; count]), ResourceState::RenderTarget)
            }
            (TextureRole::Lookup, _) => {
                return Err(DeviceError::Invalid(format!(
                    "`{}`: lookup textures are created with create_lookup_texture",
                    desc.label
                )))
            }
            (role, format) => {
                return Err(DeviceError::Unsupported(format!(
                    "`{}`: {format:?} as {role:?}",
                    desc.label
                )))
            }
        };
        let id = self.insert(SoftTexture {
            desc: *desc,
            state,
            texels,
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
        self.check_alive()?;
        let count = self.check_size(width, height, 1)?;
        if data.len() != count {
            return Err(DeviceError::Invalid(format!(
                "`{label}`: {} cells for a {width}x{height} table",
                data.len()
            )));
        }
        Ok(self.insert(SoftTexture {
            desc: TextureDesc {
                label,
                width,
                height,
                sample_count: 1,
                format: TextureFormat::R32Uint,
                role: TextureRole::Lookup,
            },
            state: ResourceState::ShaderRead,
            texels: Texels::Uint(data.to_vec()),
        }))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if let Some(slot) = self.textures.get_mut(texture.index() as usize) {
            *slot = None;
        }
        self.inputs.retain(|&bound| bound != texture);
    }

    fn create_blend_state(&mut self, desc: &BlendDesc) -> Result<BlendStateId, DeviceError> {
        self.check_alive()?;
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
        self.check_alive()?;
        self.depth_states.push(*desc);
        Ok(DepthStateId::new(self.depth_states.len() as u32 - 1))
    }

    fn create_program(&mut self, kind: ProgramKind) -> Result<ProgramId, DeviceError> {
        self.check_alive()?;
        self.programs.push(kind);
        Ok(ProgramId::new(self.programs.len() as u32 - 1))
    }

    fn begin_frame(&mut self, params: &FrameParams) -> Result<(), DeviceError> {
        self.check_alive()?;
        if self.frame.is_some() {
            return Err(DeviceError::Invalid("frame already in progress".into()));
        }
        if params.sample_count == 0 || params.sample_count > 32 {
            return Err(DeviceError::Invalid(format!(
                "frame sample count {}",
                params.sample_count
            )));
        }
        self.frame = Some(*params);
        Ok(())
    }

    fn transition(&mut self, texture: TextureId, state: ResourceState) -> Result<(), DeviceError> {
        self.check_alive()?;
        if state != ResourceState::ShaderRead && self.inputs.contains(&texture) {
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
        self.check_alive()?;
        self.check_frame()?;
        if self.inputs.contains(&texture) {
            return Err(DeviceError::Invalid(format!(
                "texture {} is bound as an input",
                texture.index()
            )));
        }
        let entry = self.texture_mut(texture)?;
        match (&mut entry.texels, value, entry.state) {
            (Texels::Color(texels), ClearValue::Color(color), ResourceState::RenderTarget) => {
                texels.fill(color);
            }
            (Texels::Depth(texels), ClearValue::Depth(depth), ResourceState::DepthWrite) => {
                texels.fill(depth);
            }
            (_, value, state) => {
                return Err(DeviceError::Invalid(format!(
                    "cannot clear `{}` in {:?} with {:?}",
                    entry.desc.label, state, value
                )))
            }
        }
        Ok(())
    }

    fn bind_inputs(&mut self, inputs: &[TextureId]) -> Result<(), DeviceError> {
        self.check_alive()?;
        if !self.inputs.is_empty() {
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
        self.inputs = inputs.to_vec();
        Ok(())
    }

    fn unbind_inputs(&mut self) -> Result<(), DeviceError> {
        self.check_alive()?;
        self.inputs.clear();
        Ok(())
    }

    fn draw(&mut self, pass: &PassBinding<'_>, call: DrawCall<'_>) -> Result<(), DeviceError> {
        self.check_alive()?;
        let params = self.check_frame()?;
        let kind = *self
            .programs
            .get(pass.program.index() as usize)
            .ok_or(DeviceError::UnknownHandle {
                kind: HandleKind::Program,
                index: pass.program.index(),
            })?;
        let blend = self
            .blend_states
            .get(pass.blend.index() as usize)
            .cloned()
            .ok_or(DeviceError::UnknownHandle {
                kind: HandleKind::BlendState,
                index: pass.blend.index(),
            })?;
        let depth_state = *self
            .depth_states
            .get(pass.depth_state.index() as usize)
            .ok_or(DeviceError::UnknownHandle {
                kind: HandleKind::DepthState,
                index: pass.depth_state.index(),
            })?;
        if blend.alpha_to_coverage {
            return Err(DeviceError::Unsupported(format!(
                "pass `{}`: alpha-to-coverage",
                pass.label
            )));
        }
        self.validate_draw(pass, kind, &call)?;

        let mut ids: Vec<TextureId> = pass.color_targets.to_vec();
        ids.extend(pass.depth_target);
        let target_count = ids.len();
        ids.extend(self.inputs.iter().copied());

        let mut textures = self.check_out(&ids)?;
        let inputs = textures.split_off(target_count);
        let depth = if pass.depth_target.is_some() {
            textures.pop()
        } else {
            None
        };
        let mut colors = textures;
        let samples = depth
            .as_ref()
            .or(colors.first())
            .map(|texture| texture.desc.sample_count)
            .unwrap_or(1);
        let (width, height) = depth
            .as_ref()
            .or(colors.first())
            .map(|texture| (texture.desc.width, texture.desc.height))
            .unwrap_or((0, 0));

        let mut depth = depth;
        let mut job = DrawJob {
            kind,
            params,
            blend: &blend,
            depth_state,
            colors: &mut colors,
            depth: depth.as_mut(),
            inputs: &inputs,
            samples,
            fragments: 0,
        };
        match call {
            DrawCall::Meshes(batches) => {
                for batch in batches {
                    for (primitive, triangle) in batch.triangles().enumerate() {
                        raster::rasterize_triangle(width, height, triangle, |x, y, depth| {
                            let color = triangle[0].color;
                            job.shade(Fragment {
                                pixel: [x, y],
                                depth,
                                color,
                                surface: batch.surface,
                                primitive: primitive as u32,
                            });
                        });
                    }
                }
            }
            DrawCall::FullScreenTriangle => job.full_screen(),
        }
        let fragments = job.fragments;

        let mut returned = colors;
        returned.extend(depth);
        returned.extend(inputs);
        self.check_in(&ids, returned);

        self.stats.draws += 1;
        self.stats.fragments += fragments;
        tracing::trace!(pass = pass.label, program = kind.label(), fragments, "software draw");
        Ok(())
    }

    fn end_frame(&mut self) -> Result<(), DeviceError> {
        self.check_alive()?;
        self.check_frame()?;
        if !self.inputs.is_empty() {
            return Err(DeviceError::Invalid(
                "inputs still bound at end of frame".into(),
            ));
        }
        self.frame = None;
        self.stats.frames += 1;
        Ok(())
    }

    fn abandon_frame(&mut self) {
        self.frame = None;
        self.inputs.clear();
    }

    fn read_texture(&mut self, texture: TextureId) -> Result<PixelBuffer, DeviceError> {
        self.check_alive()?;
        let texture = self.texture(texture)?;
        let (width, height) = (texture.desc.width, texture.desc.height);
        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.push(texture.resolve(x, y));
            }
        }
        Ok(PixelBuffer {
            width,
            height,
            pixels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blend::NamedBlend;
    use crate::device::CompareFunction;
    use crate::scene::MeshBatch;

    fn color_target(device: &mut SoftwareDevice, label: &'static str) -> TextureId {
        device
            .create_texture(&TextureDesc {
                label,
                width: 4,
                height: 4,
                sample_count: 1,
                format: TextureFormat::Rgba16Float,
                role: TextureRole::ColorTarget,
            })
            .unwrap()
    }

    fn params() -> FrameParams {
        FrameParams::new((4, 4), 1, 256, 1, 0)
    }

    #[test]
    fn lookup_textures_need_matching_data() {
        let mut device = SoftwareDevice::new();
        assert!(device.create_lookup_texture("table", 4, 2, &[0; 8]).is_ok());
        assert!(matches!(
            device.create_lookup_texture("table", 4, 2, &[0; 7]),
            Err(DeviceError::Invalid(_))
        ));
    }

    #[test]
    fn restricted_sample_counts_reject_textures() {
        let mut device = SoftwareDevice::with_sample_counts(vec![4]);
        assert_eq!(device.caps().sample_counts, vec![1, 4]);
        let err = device
            .create_texture(&TextureDesc {
                label: "depth",
                width: 4,
                height: 4,
                sample_count: 8,
                format: TextureFormat::Depth32Float,
                role: TextureRole::DepthTarget,
            })
            .unwrap_err();
        assert!(matches!(err, DeviceError::Unsupported(_)));
    }

    #[test]
    fn additive_draw_blends_into_target() {
        let mut device = SoftwareDevice::new();
        let target = color_target(&mut device, "accum");
        let program = device.create_program(ProgramKind::Transmittance).unwrap();
        let blend = device
            .create_blend_state(&BlendDesc {
                targets: vec![Some(NamedBlend::Additive.equation())],
                alpha_to_coverage: false,
            })
            .unwrap();
        let depth_state = device.create_depth_state(&DepthStencilDesc::DISABLED).unwrap();

        device.begin_frame(&params()).unwrap();
        device.clear(target, ClearValue::Color([0.0; 4])).unwrap();
        let batch = MeshBatch::full_screen(0, 0.5, [1.0, 1.0, 1.0, 0.25]);
        let binding = PassBinding {
            label: "test",
            program,
            color_targets: &[target],
            blend,
            depth_target: None,
            depth_state,
        };
        device.draw(&binding, DrawCall::Meshes(&[&batch, &batch])).unwrap();
        device.end_frame().unwrap();

        let pixels = device.read_texture(target).unwrap();
        assert!(pixels.pixels.iter().all(|p| *p == [0.5; 4]));
        assert_eq!(device.stats().fragments, 32);
    }

    #[test]
    fn input_and_target_hazard_is_rejected() {
        let mut device = SoftwareDevice::new();
        let target = color_target(&mut device, "accum");
        let depth = device
            .create_texture(&TextureDesc {
                label: "depth",
                width: 4,
                height: 4,
                sample_count: 1,
                format: TextureFormat::Depth32Float,
                role: TextureRole::DepthTarget,
            })
            .unwrap();
        device.transition(depth, ResourceState::ShaderRead).unwrap();
        device.bind_inputs(&[depth]).unwrap();

        // A bound input cannot go back to being a target while bound.
        assert!(device.transition(depth, ResourceState::DepthWrite).is_err());

        let program = device.create_program(ProgramKind::Accumulate).unwrap();
        let blend = device
            .create_blend_state(&BlendDesc {
                targets: vec![None],
                alpha_to_coverage: false,
            })
            .unwrap();
        let depth_state = device
            .create_depth_state(&DepthStencilDesc {
                depth_test: true,
                depth_write: false,
                compare: CompareFunction::LessEqual,
            })
            .unwrap();
        device.begin_frame(&params()).unwrap();
        let binding = PassBinding {
            label: "hazard",
            program,
            color_targets: &[target],
            blend,
            depth_target: Some(depth),
            depth_state,
        };
        let err = device.draw(&binding, DrawCall::Meshes(&[])).unwrap_err();
        assert!(matches!(err, DeviceError::Invalid(_)), "{err}");
        assert!(device.end_frame().is_err());
        device.unbind_inputs().unwrap();
        device.end_frame().unwrap();
    }

    #[test]
    fn lost_device_fails_every_call() {
        let mut device = SoftwareDevice::new();
        let target = color_target(&mut device, "accum");
        device.lose_device("test");
        assert!(matches!(
            device.begin_frame(&params()),
            Err(DeviceError::Lost(_))
        ));
        assert!(matches!(
            device.read_texture(target),
            Err(DeviceError::Lost(_))
        ));
    }

    #[test]
    fn clear_requires_target_state() {
        let mut device = SoftwareDevice::new();
        let target = color_target(&mut device, "accum");
        device.begin_frame(&params()).unwrap();
        device.transition(target, ResourceState::ShaderRead).unwrap();
        assert!(device.clear(target, ClearValue::Color([1.0; 4])).is_err());
        device.transition(target, ResourceState::RenderTarget).unwrap();
        device.clear(target, ClearValue::Color([1.0; 4])).unwrap();
        assert!(device.clear(target, ClearValue::Depth(1.0)).is_err());
    }
}
