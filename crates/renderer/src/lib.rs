//! Stochastic transparency renderer.
//!
//! Order-independent transparency on a rasterizer: every transparent fragment
//! turns its alpha into a random per-sample coverage mask taken from a
//! precomputed table, and the passes that follow accumulate color with
//! commutative blends only, so the image does not depend on draw order.
//!
//! ```text
//!   oitconfig::OitConfig ──▶ RendererConfig
//!                                 │
//!                                 ▼
//!   maskgen::CoverageMaskTable ─▶ StochasticTransparency<D: GraphicsDevice>
//!                                 │  fixed pass list per TechniqueMode
//!                                 ▼
//!              SoftwareDevice (CPU reference) | WgpuDevice (feature `gpu`)
//! ```
//!
//! The device sits behind the [`GraphicsDevice`] trait. Programs are
//! specified as pure functions in [`programs`]; the software device runs them
//! directly and the wgpu device runs WGSL translations of them.

pub mod blend;
pub mod compositor;
pub mod device;
mod error;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod orchestrator;
pub mod passes;
pub mod programs;
pub mod scene;
mod software;
pub mod targets;

pub use blend::{BlendEquation, NamedBlend};
pub use compositor::{resolve, CompositeLayout};
pub use device::{
    ClearValue, DeviceCaps, DeviceError, DrawCall, GraphicsDevice, PixelBuffer, ResourceState,
    TextureDesc, TextureFormat, TextureId, TextureRole,
};
pub use error::OitError;
#[cfg(feature = "gpu")]
pub use gpu::WgpuDevice;
pub use maskgen::{CoverageMaskTable, CoverageStats, TableParams};
pub use oitconfig::TechniqueMode;
pub use orchestrator::{FrameReport, RendererConfig, StochasticTransparency};
pub use passes::{PassDescriptor, PassStage, Slot};
pub use programs::{FrameParams, ProgramKind};
pub use scene::{BatchList, MeshBatch, SceneGeometry, Vertex};
pub use software::{SoftwareDevice, SoftwareStats};
