//! Capability interface the orchestrator drives.
//!
//! A `GraphicsDevice` hands out opaque handles for textures, state objects and
//! programs, and executes one frame at a time as a flat sequence of
//! transitions, clears, binds and draws. Two implementations ship with the
//! crate: [`crate::SoftwareDevice`] (CPU reference) and, with the `gpu`
//! feature, `WgpuDevice`.

use std::fmt;

use crate::blend::BlendEquation;
use crate::programs::{FrameParams, ProgramKind};
use crate::scene::MeshBatch;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            pub fn new(index: u32) -> Self {
                Self(index)
            }

            pub fn index(self) -> u32 {
                self.0
            }
        }
    };
}

handle!(
    /// Texture owned by a device.
    TextureId
);
handle!(BlendStateId);
handle!(DepthStateId);
handle!(ProgramId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba16Float,
    R16Float,
    R32Uint,
    Depth32Float,
}

impl TextureFormat {
    pub fn is_depth(self) -> bool {
        matches!(self, TextureFormat::Depth32Float)
    }
}

/// What a texture is used for. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureRole {
    ColorTarget,
    DepthTarget,
    /// Read-only data uploaded once, such as the coverage mask table.
    Lookup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub sample_count: u32,
    pub format: TextureFormat,
    pub role: TextureRole,
}

/// Resource states. Moving a texture between them is the synchronization
/// barrier between passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    RenderTarget,
    DepthWrite,
    ShaderRead,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    Depth(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunction {
    Always,
    Less,
    LessEqual,
}

impl CompareFunction {
    pub fn passes(self, incoming: f32, stored: f32) -> bool {
        match self {
            CompareFunction::Always => true,
            CompareFunction::Less => incoming < stored,
            CompareFunction::LessEqual => incoming <= stored,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilDesc {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare: CompareFunction,
}

impl DepthStencilDesc {
    pub const DISABLED: Self = Self {
        depth_test: false,
        depth_write: false,
        compare: CompareFunction::Always,
    };
}

/// Blend state for every bound color target. `None` disables blending for
/// that target and replaces the stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct BlendDesc {
    pub targets: Vec<Option<BlendEquation>>,
    pub alpha_to_coverage: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCaps {
    pub name: String,
    /// Sample counts accepted for multisampled depth targets, ascending.
    pub sample_counts: Vec<u32>,
    pub max_texture_dimension: u32,
}

impl DeviceCaps {
    pub fn max_sample_count(&self) -> u32 {
        self.sample_counts.last().copied().unwrap_or(1)
    }

    pub fn supports_sample_count(&self, count: u32) -> bool {
        self.sample_counts.contains(&count)
    }
}

/// Everything a draw needs besides the geometry.
#[derive(Debug, Clone, Copy)]
pub struct PassBinding<'a> {
    pub label: &'a str,
    pub program: ProgramId,
    pub color_targets: &'a [TextureId],
    pub blend: BlendStateId,
    pub depth_target: Option<TextureId>,
    pub depth_state: DepthStateId,
}

#[derive(Debug, Clone, Copy)]
pub enum DrawCall<'a> {
    Meshes(&'a [&'a MeshBatch]),
    FullScreenTriangle,
}

/// Texels read back from a device, resolved to one RGBA value per pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<[f32; 4]>,
}

impl PixelBuffer {
    pub fn pixel(&self, x: u32, y: u32) -> Option<[f32; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    /// Mean absolute per-channel RGB difference, or `None` when the sizes
    /// differ.
    pub fn mean_abs_difference(&self, other: &PixelBuffer) -> Option<f32> {
        if self.width != other.width || self.height != other.height {
            return None;
        }
        if self.pixels.is_empty() {
            return Some(0.0);
        }
        let total: f32 = self
            .pixels
            .iter()
            .zip(&other.pixels)
            .map(|(a, b)| (0..3).map(|c| (a[c] - b[c]).abs()).sum::<f32>())
            .sum();
        Some(total / (self.pixels.len() * 3) as f32)
    }

    pub fn to_rgba8(&self) -> image::RgbaImage {
        image::RgbaImage::from_fn(self.width, self.height, |x, y| {
            let texel = self.pixels[y as usize * self.width as usize + x as usize];
            image::Rgba(texel.map(|channel| (channel.clamp(0.0, 1.0) * 255.0).round() as u8))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("device lost: {0}")]
    Lost(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("invalid operation: {0}")]
    Invalid(String),
    #[error("unknown {kind} handle {index}")]
    UnknownHandle { kind: HandleKind, index: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Texture,
    BlendState,
    DepthState,
    Program,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandleKind::Texture => "texture",
            HandleKind::BlendState => "blend state",
            HandleKind::DepthState => "depth state",
            HandleKind::Program => "program",
        })
    }
}

/// Rasterizer capability consumed by the stochastic transparency pipeline.
///
/// Calls between `begin_frame` and `end_frame` form one frame. Resource
/// states are explicit: a texture must be in `RenderTarget`/`DepthWrite` to be
/// cleared or drawn into, and in `ShaderRead` to be bound as an input. A
/// texture may never be an input and a target of the same draw.
pub trait GraphicsDevice {
    fn caps(&self) -> DeviceCaps;

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, DeviceError>;

    /// Uploads row-major `u32` data as a single-sample `R32Uint` lookup texture.
    fn create_lookup_texture(
        &mut self,
        label: &'static str,
        width: u32,
        height: u32,
        data: &[u32],
    ) -> Result<TextureId, DeviceError>;

    fn destroy_texture(&mut self, texture: TextureId);

    fn create_blend_state(&mut self, desc: &BlendDesc) -> Result<BlendStateId, DeviceError>;

    fn create_depth_state(&mut self, desc: &DepthStencilDesc)
        -> Result<DepthStateId, DeviceError>;

    fn create_program(&mut self, kind: ProgramKind) -> Result<ProgramId, DeviceError>;

    /// Opens a frame and uploads the per-frame parameter block.
    fn begin_frame(&mut self, params: &FrameParams) -> Result<(), DeviceError>;

    fn transition(&mut self, texture: TextureId, state: ResourceState) -> Result<(), DeviceError>;

    fn clear(&mut self, texture: TextureId, value: ClearValue) -> Result<(), DeviceError>;

    /// Binds program inputs in slot order.
    fn bind_inputs(&mut self, inputs: &[TextureId]) -> Result<(), DeviceError>;

    fn unbind_inputs(&mut self) -> Result<(), DeviceError>;

    fn draw(&mut self, pass: &PassBinding<'_>, call: DrawCall<'_>) -> Result<(), DeviceError>;

    fn end_frame(&mut self) -> Result<(), DeviceError>;

    /// Drops any partially recorded frame after a failure.
    fn abandon_frame(&mut self) {}

    fn read_texture(&mut self, texture: TextureId) -> Result<PixelBuffer, DeviceError>;
}

impl<D: GraphicsDevice + ?Sized> GraphicsDevice for &mut D {
    fn caps(&self) -> DeviceCaps {
        (**self).caps()
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, DeviceError> {
        (**self).create_texture(desc)
    }

    fn create_lookup_texture(
        &mut self,
        label: &'static str,
        width: u32,
        height: u32,
        data: &[u32],
    ) -> Result<TextureId, DeviceError> {
        (**self).create_lookup_texture(label, width, height, data)
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        (**self).destroy_texture(texture)
    }

    fn create_blend_state(&mut self, desc: &BlendDesc) -> Result<BlendStateId, DeviceError> {
        (**self).create_blend_state(desc)
    }

    fn create_depth_state(
        &mut self,
        desc: &DepthStencilDesc,
    ) -> Result<DepthStateId, DeviceError> {
        (**self).create_depth_state(desc)
    }

    fn create_program(&mut self, kind: ProgramKind) -> Result<ProgramId, DeviceError> {
        (**self).create_program(kind)
    }

    fn begin_frame(&mut self, params: &FrameParams) -> Result<(), DeviceError> {
        (**self).begin_frame(params)
    }

    fn transition(&mut self, texture: TextureId, state: ResourceState) -> Result<(), DeviceError> {
        (**self).transition(texture, state)
    }

    fn clear(&mut self, texture: TextureId, value: ClearValue) -> Result<(), DeviceError> {
        (**self).clear(texture, value)
    }

    fn bind_inputs(&mut self, inputs: &[TextureId]) -> Result<(), DeviceError> {
        (**self).bind_inputs(inputs)
    }

    fn unbind_inputs(&mut self) -> Result<(), DeviceError> {
        (**self).unbind_inputs()
    }

    fn draw(&mut self, pass: &PassBinding<'_>, call: DrawCall<'_>) -> Result<(), DeviceError> {
        (**self).draw(pass, call)
    }

    fn end_frame(&mut self) -> Result<(), DeviceError> {
        (**self).end_frame()
    }

    fn abandon_frame(&mut self) {
        (**self).abandon_frame()
    }

    fn read_texture(&mut self, texture: TextureId) -> Result<PixelBuffer, DeviceError> {
        (**self).read_texture(texture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_report_largest_sample_count() {
        let caps = DeviceCaps {
            name: "test".into(),
            sample_counts: vec![1, 2, 4, 8],
            max_texture_dimension: 4096,
        };
        assert_eq!(caps.max_sample_count(), 8);
        assert!(caps.supports_sample_count(4));
        assert!(!caps.supports_sample_count(16));
    }

    #[test]
    fn pixel_buffer_difference_requires_matching_size() {
        let a = PixelBuffer {
            width: 2,
            height: 1,
            pixels: vec![[0.0, 0.0, 0.0, 1.0], [1.0, 1.0, 1.0, 1.0]],
        };
        let mut b = a.clone();
        b.pixels[1] = [0.5, 1.0, 1.0, 1.0];
        let diff = a.mean_abs_difference(&b).unwrap();
        assert!((diff - 0.5 / 6.0).abs() < 1e-6);

        let c = PixelBuffer {
            width: 1,
            height: 1,
            pixels: vec![[0.0; 4]],
        };
        assert!(a.mean_abs_difference(&c).is_none());
    }

    #[test]
    fn rgba8_conversion_clamps() {
        let buffer = PixelBuffer {
            width: 1,
            height: 1,
            pixels: vec![[1.5, -0.2, 0.5, 1.0]],
        };
        let image = buffer.to_rgba8();
        assert_eq!(image.get_pixel(0, 0).0, [255, 0, 128, 255]);
    }

    #[test]
    fn compare_functions() {
        assert!(CompareFunction::Less.passes(0.2, 0.5));
        assert!(!CompareFunction::Less.passes(0.5, 0.5));
        assert!(CompareFunction::LessEqual.passes(0.5, 0.5));
        assert!(CompareFunction::Always.passes(2.0, 0.0));
    }
}
