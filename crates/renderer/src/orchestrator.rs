//! Per-frame pass sequencing.
//!
//! ```text
//!   begin ─▶ opaque ─▶ stochastic-coverage ─▶ [transmittance] ─▶ accumulate ─▶ composite
//!              │              │                                      │              │
//!       BackgroundColor  StochasticDepth (MSAA) ── ShaderRead ──▶ reads it    reads targets,
//!       BackgroundDepth  masks from the table                                writes Output
//! ```
//!
//! `StochasticTransparency` owns its device, the coverage mask table, the
//! render targets and every state object. The pass list is fixed when the
//! renderer is built and replayed unchanged each frame; only the frame
//! parameter block changes.

use std::collections::HashMap;
use std::time::Instant;

use maskgen::{CoverageMaskTable, TableParams};
use oitconfig::{OitConfig, TechniqueMode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::blend::NamedBlend;
use crate::device::{
    BlendDesc, BlendStateId, DepthStateId, DepthStencilDesc, DeviceCaps, DeviceError, DrawCall,
    GraphicsDevice, PassBinding, PixelBuffer, ProgramId, ResourceState, TextureId,
};
use crate::error::OitError;
use crate::passes::{self, DrawTarget, PassDescriptor, Slot};
use crate::programs::{FrameParams, ProgramKind};
use crate::scene::{MeshBatch, SceneGeometry};
use crate::targets::RenderTargetSet;

/// Mixed into the table seed so the jitter stream differs from the table's.
const JITTER_STREAM: u64 = 0x6a09_e667_f3bc_c908;

/// Construction-time settings for [`StochasticTransparency`].
#[derive(Debug, Clone, PartialEq)]
pub struct RendererConfig {
    pub mode: TechniqueMode,
    pub table: TableParams,
    /// Draw a fresh dither offset every frame.
    pub temporal_jitter: bool,
    pub width: u32,
    pub height: u32,
    /// Linear RGB behind all geometry.
    pub background: [f32; 3],
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            mode: TechniqueMode::default(),
            table: TableParams::default(),
            temporal_jitter: false,
            width: 1280,
            height: 720,
            background: [1.0, 1.0, 1.0],
        }
    }
}

impl From<&OitConfig> for RendererConfig {
    fn from(config: &OitConfig) -> Self {
        let technique = &config.technique;
        Self {
            mode: technique.mode,
            table: TableParams {
                sample_count: technique.sample_count,
                dither_table_size: technique.dither_table_size,
                alpha_levels: technique.alpha_levels,
                seed: technique.seed,
            },
            temporal_jitter: technique.temporal_jitter,
            width: config.viewport.width,
            height: config.viewport.height,
            background: config.background.color,
        }
    }
}

/// What one frame executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReport {
    pub frame: u64,
    pub random_offset: u32,
    pub passes: Vec<&'static str>,
    pub opaque_batches: usize,
    pub transparent_batches: usize,
}

struct StateObjects {
    programs: HashMap<ProgramKind, ProgramId>,
    blends: HashMap<Vec<Option<NamedBlend>>, BlendStateId>,
    depth: HashMap<DepthStencilDesc, DepthStateId>,
}

impl StateObjects {
    fn create<D: GraphicsDevice>(
        device: &mut D,
        passes: &[PassDescriptor],
    ) -> Result<Self, OitError> {
        let mut states = Self {
            programs: HashMap::new(),
            blends: HashMap::new(),
            depth: HashMap::new(),
        };
        for pass in passes {
            let Some(program) = pass.program else {
                continue;
            };
            if !states.programs.contains_key(&program) {
                let id = device
                    .create_program(program)
                    .map_err(OitError::initialization(format!("program `{}`", program.label())))?;
                states.programs.insert(program, id);
            }
            if !states.blends.contains_key(&pass.blends) {
                let desc = blend_desc(&pass.blends);
                check_blend(pass.label, &desc)?;
                let id = device
                    .create_blend_state(&desc)
                    .map_err(OitError::initialization(format!(
                        "blend state for `{}`",
                        pass.label
                    )))?;
                states.blends.insert(pass.blends.clone(), id);
            }
            if !states.depth.contains_key(&pass.depth) {
                let id = device
                    .create_depth_state(&pass.depth)
                    .map_err(OitError::initialization(format!(
                        "depth state for `{}`",
                        pass.label
                    )))?;
                states.depth.insert(pass.depth, id);
            }
        }
        Ok(states)
    }
}

pub(crate) fn blend_desc(blends: &[Option<NamedBlend>]) -> BlendDesc {
    BlendDesc {
        targets: blends
            .iter()
            .map(|blend| blend.map(NamedBlend::equation))
            .collect(),
        alpha_to_coverage: false,
    }
}

/// Alpha-to-coverage would fight the table-driven sample mask.
pub(crate) fn check_blend(pass: &str, desc: &BlendDesc) -> Result<(), OitError> {
    if desc.alpha_to_coverage {
        return Err(OitError::Configuration(format!(
            "pass `{pass}` enables alpha-to-coverage"
        )));
    }
    Ok(())
}

fn validate_config(config: &RendererConfig, caps: &DeviceCaps) -> Result<(), OitError> {
    config.table.validate()?;
    if config.width == 0 || config.height == 0 {
        return Err(OitError::Configuration(format!(
            "viewport {}x{} is empty",
            config.width, config.height
        )));
    }
    if config.width > caps.max_texture_dimension || config.height > caps.max_texture_dimension {
        return Err(OitError::Configuration(format!(
            "viewport {}x{} exceeds the device limit of {}",
            config.width, config.height, caps.max_texture_dimension
        )));
    }
    let table_rows = u64::from(config.table.alpha_levels) + 1;
    if config.table.dither_table_size > caps.max_texture_dimension
        || table_rows > u64::from(caps.max_texture_dimension)
    {
        return Err(OitError::Configuration(format!(
            "coverage mask table {}x{table_rows} exceeds the device limit of {}",
            config.table.dither_table_size, caps.max_texture_dimension
        )));
    }
    let samples = config.table.sample_count;
    if samples > caps.max_sample_count() {
        return Err(OitError::Configuration(format!(
            "sample count {samples} exceeds the {} maximum of {}",
            caps.name,
            caps.max_sample_count()
        )));
    }
    if !caps.supports_sample_count(samples) {
        return Err(OitError::Configuration(format!(
            "{} does not support {samples} samples (supported: {:?})",
            caps.name, caps.sample_counts
        )));
    }
    Ok(())
}

struct PassFailure {
    pass: &'static str,
    source: DeviceError,
}

fn failed(pass: &'static str) -> impl Fn(DeviceError) -> PassFailure {
    move |source| PassFailure { pass, source }
}

fn slot_state(slot: Slot) -> ResourceState {
    match slot {
        Slot::BackgroundDepth | Slot::StochasticDepth => ResourceState::DepthWrite,
        _ => ResourceState::RenderTarget,
    }
}

fn transition<D: GraphicsDevice>(
    device: &mut D,
    known: &mut HashMap<TextureId, ResourceState>,
    texture: TextureId,
    state: ResourceState,
) -> Result<(), DeviceError> {
    if known.get(&texture) == Some(&state) {
        return Ok(());
    }
    device.transition(texture, state)?;
    tracing::trace!(texture = texture.index(), ?state, "transition");
    known.insert(texture, state);
    Ok(())
}

/// Order-independent transparency renderer parameterized by [`TechniqueMode`].
pub struct StochasticTransparency<D: GraphicsDevice> {
    device: D,
    config: RendererConfig,
    table: CoverageMaskTable,
    table_texture: Option<TextureId>,
    targets: RenderTargetSet,
    states: StateObjects,
    passes: Vec<PassDescriptor>,
    known_states: HashMap<TextureId, ResourceState>,
    jitter: Option<StdRng>,
    frame_index: u64,
    lost: Option<String>,
}

impl<D: GraphicsDevice> StochasticTransparency<D> {
    /// Validates `config` against the device, builds the coverage mask table
    /// and allocates every resource. Configuration errors are reported before
    /// anything is allocated.
    pub fn new(mut device: D, config: RendererConfig) -> Result<Self, OitError> {
        let caps = device.caps();
        validate_config(&config, &caps)?;
        let passes = passes::frame_passes(config.mode, config.background);
        passes::validate_sequence(&passes).map_err(OitError::Configuration)?;

        let started = Instant::now();
        let table = CoverageMaskTable::build(config.table)?;
        let table_texture = device
            .create_lookup_texture(
                "coverage-masks",
                table.width(),
                table.height(),
                table.as_slice(),
            )
            .map_err(OitError::initialization("coverage mask table"))?;

        let states = match StateObjects::create(&mut device, &passes) {
            Ok(states) => states,
            Err(err) => {
                device.destroy_texture(table_texture);
                return Err(err);
            }
        };
        let targets = match RenderTargetSet::create(
            &mut device,
            config.mode,
            config.width,
            config.height,
            config.table.sample_count,
        ) {
            Ok(targets) => targets,
            Err(err) => {
                device.destroy_texture(table_texture);
                return Err(err);
            }
        };

        tracing::info!(
            device = %caps.name,
            mode = %config.mode,
            sample_count = config.table.sample_count,
            table_width = table.width(),
            table_height = table.height(),
            width = config.width,
            height = config.height,
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            "stochastic transparency ready"
        );

        let jitter = config
            .temporal_jitter
            .then(|| StdRng::seed_from_u64(config.table.seed ^ JITTER_STREAM));

        Ok(Self {
            device,
            config,
            table,
            table_texture: Some(table_texture),
            targets,
            states,
            passes,
            known_states: HashMap::new(),
            jitter,
            frame_index: 0,
            lost: None,
        })
    }

    pub fn mode(&self) -> TechniqueMode {
        self.config.mode
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn passes(&self) -> &[PassDescriptor] {
        &self.passes
    }

    pub fn mask_table(&self) -> &CoverageMaskTable {
        &self.table
    }

    pub fn targets(&self) -> &RenderTargetSet {
        &self.targets
    }

    pub fn output(&self) -> Option<TextureId> {
        self.targets.get(Slot::Output)
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frame_index
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_some()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    fn check_usable(&self) -> Result<(), OitError> {
        match &self.lost {
            Some(reason) => Err(OitError::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }

    /// Recreates the render targets for a new viewport. The table and state
    /// objects are kept.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), OitError> {
        self.check_usable()?;
        if width == 0 || height == 0 {
            return Err(OitError::Configuration(format!(
                "viewport {width}x{height} is empty"
            )));
        }
        if (width, height) == self.targets.size() {
            return Ok(());
        }
        let max = self.device.caps().max_texture_dimension;
        if width > max || height > max {
            return Err(OitError::Configuration(format!(
                "viewport {width}x{height} exceeds the device limit of {max}"
            )));
        }

        let replacement = match RenderTargetSet::create(
            &mut self.device,
            self.config.mode,
            width,
            height,
            self.config.table.sample_count,
        ) {
            Ok(targets) => targets,
            Err(err) => {
                if err.is_device_lost() {
                    self.lost = Some(err.to_string());
                }
                return Err(err);
            }
        };
        let mut previous = std::mem::replace(&mut self.targets, replacement);
        for (_, id) in previous.iter() {
            self.known_states.remove(&id);
        }
        previous.release(&mut self.device);
        self.config.width = width;
        self.config.height = height;
        tracing::info!(width, height, "resized render targets");
        Ok(())
    }

    /// Renders one frame into the renderer's own output target.
    pub fn render_frame<S>(&mut self, scene: &S) -> Result<FrameReport, OitError>
    where
        S: SceneGeometry + ?Sized,
    {
        self.check_usable()?;
        let output = self
            .targets
            .get(Slot::Output)
            .ok_or_else(|| OitError::Configuration("output target missing".into()))?;
        self.render_frame_to(scene, output)
    }

    /// Renders one frame, compositing into `target` instead of the owned
    /// output. `target` must be a single-sample color target of viewport size.
    pub fn render_frame_to<S>(
        &mut self,
        scene: &S,
        target: TextureId,
    ) -> Result<FrameReport, OitError>
    where
        S: SceneGeometry + ?Sized,
    {
        self.check_usable()?;
        let random_offset = match self.jitter.as_mut() {
            Some(rng) => rng.gen(),
            None => 0,
        };
        let params = FrameParams::new(
            self.targets.size(),
            self.table.width(),
            self.table.alpha_levels(),
            self.table.sample_count(),
            random_offset,
        );
        let opaque: Vec<&MeshBatch> = scene.opaque_batches().collect();
        let transparent: Vec<&MeshBatch> = scene.transparent_batches().collect();
        let mut report = FrameReport {
            frame: self.frame_index,
            random_offset,
            passes: Vec::with_capacity(self.passes.len()),
            opaque_batches: opaque.len(),
            transparent_batches: transparent.len(),
        };

        match self.execute(&params, &opaque, &transparent, target, &mut report) {
            Ok(()) => {
                self.frame_index += 1;
                tracing::debug!(
                    frame = report.frame,
                    random_offset,
                    passes = report.passes.len(),
                    transparent = report.transparent_batches,
                    "frame complete"
                );
                Ok(report)
            }
            Err(PassFailure { pass, source }) => {
                self.device.abandon_frame();
                self.known_states.clear();
                match source {
                    DeviceError::Lost(reason) => {
                        tracing::error!(pass, %reason, "device lost; renderer disabled");
                        self.lost = Some(reason.clone());
                        Err(OitError::DeviceLost(reason))
                    }
                    source => {
                        tracing::warn!(pass, error = %source, "frame abandoned");
                        Err(OitError::Frame { pass, source })
                    }
                }
            }
        }
    }

    fn execute(
        &mut self,
        params: &FrameParams,
        opaque: &[&MeshBatch],
        transparent: &[&MeshBatch],
        output: TextureId,
        report: &mut FrameReport,
    ) -> Result<(), PassFailure> {
        self.device.begin_frame(params).map_err(failed("begin"))?;

        let targets = &self.targets;
        let table_texture = self.table_texture;
        let resolve = |slot: Slot| -> Option<TextureId> {
            match slot {
                Slot::Output => Some(output),
                Slot::CoverageMasks => table_texture,
                slot => targets.get(slot),
            }
        };
        let missing = |pass: &'static str, slot: Slot| PassFailure {
            pass,
            source: DeviceError::Invalid(format!("no texture for slot `{slot}`")),
        };

        for pass in &self.passes {
            let label = pass.label;
            let fail = failed(label);

            let writes = pass
                .clears
                .iter()
                .map(|(slot, _)| *slot)
                .chain(pass.color_targets.iter().copied())
                .chain(pass.depth_target);
            for slot in writes {
                let texture = resolve(slot).ok_or_else(|| missing(label, slot))?;
                transition(&mut self.device, &mut self.known_states, texture, slot_state(slot))
                    .map_err(&fail)?;
            }
            let mut inputs = Vec::with_capacity(pass.inputs.len());
            for &slot in &pass.inputs {
                let texture = resolve(slot).ok_or_else(|| missing(label, slot))?;
                transition(
                    &mut self.device,
                    &mut self.known_states,
                    texture,
                    ResourceState::ShaderRead,
                )
                .map_err(&fail)?;
                inputs.push(texture);
            }

            for (slot, value) in &pass.clears {
                let texture = resolve(*slot).ok_or_else(|| missing(label, *slot))?;
                self.device.clear(texture, *value).map_err(&fail)?;
            }

            if let Some(program) = pass.program {
                if !inputs.is_empty() {
                    self.device.bind_inputs(&inputs).map_err(&fail)?;
                }
                let call = match pass.draw {
                    DrawTarget::OpaqueGeometry if !opaque.is_empty() => {
                        Some(DrawCall::Meshes(opaque))
                    }
                    DrawTarget::TransparentGeometry if !transparent.is_empty() => {
                        Some(DrawCall::Meshes(transparent))
                    }
                    DrawTarget::FullScreenTriangle => Some(DrawCall::FullScreenTriangle),
                    _ => None,
                };
                if let Some(call) = call {
                    let color_targets = pass
                        .color_targets
                        .iter()
                        .map(|slot| resolve(*slot).ok_or_else(|| missing(label, *slot)))
                        .collect::<Result<Vec<_>, _>>()?;
                    let depth_target = match pass.depth_target {
                        Some(slot) => Some(resolve(slot).ok_or_else(|| missing(label, slot))?),
                        None => None,
                    };
                    let binding = PassBinding {
                        label,
                        program: self.states.programs[&program],
                        color_targets: &color_targets,
                        blend: self.states.blends[&pass.blends],
                        depth_target,
                        depth_state: self.states.depth[&pass.depth],
                    };
                    self.device.draw(&binding, call).map_err(&fail)?;
                }
                if pass.release_inputs && !inputs.is_empty() {
                    self.device.unbind_inputs().map_err(&fail)?;
                }
            }
            tracing::trace!(pass = label, "pass executed");
            report.passes.push(label);
        }

        self.device.end_frame().map_err(failed("end"))?;
        Ok(())
    }

    /// Reads back the renderer's output target.
    pub fn read_output(&mut self) -> Result<PixelBuffer, OitError> {
        self.check_usable()?;
        let output = self
            .targets
            .get(Slot::Output)
            .ok_or_else(|| OitError::Configuration("output target missing".into()))?;
        self.read_texture(output)
    }

    pub fn read_texture(&mut self, texture: TextureId) -> Result<PixelBuffer, OitError> {
        self.check_usable()?;
        self.device.read_texture(texture).map_err(|source| match source {
            DeviceError::Lost(reason) => {
                self.lost = Some(reason.clone());
                OitError::DeviceLost(reason)
            }
            source => OitError::Frame {
                pass: "readback",
                source,
            },
        })
    }

    fn release(&mut self) {
        self.targets.release(&mut self.device);
        if let Some(table) = self.table_texture.take() {
            self.device.destroy_texture(table);
        }
        self.known_states.clear();
    }
}

impl<D: GraphicsDevice> Drop for StochasticTransparency<D> {
    fn drop(&mut self) {
        self.release();
        tracing::debug!(frames = self.frame_index, "stochastic transparency released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::SoftwareDevice;

    #[test]
    fn config_maps_from_document() {
        let document = OitConfig::from_toml_str(
            r#"
version = 1

[technique]
mode = "three-target"
sample_count = "4x"
seed = 9

[viewport]
width = 64
height = 32
"#,
        )
        .unwrap();
        let config = RendererConfig::from(&document);
        assert_eq!(config.mode, TechniqueMode::ThreeTarget);
        assert_eq!(config.table.sample_count, 4);
        assert_eq!(config.table.seed, 9);
        assert_eq!((config.width, config.height), (64, 32));
    }

    #[test]
    fn alpha_to_coverage_is_rejected() {
        let mut desc = blend_desc(&[Some(NamedBlend::Additive)]);
        assert!(check_blend("accumulate", &desc).is_ok());
        desc.alpha_to_coverage = true;
        assert!(matches!(
            check_blend("accumulate", &desc),
            Err(OitError::Configuration(_))
        ));
    }

    #[test]
    fn validation_reports_device_limits() {
        let caps = DeviceCaps {
            name: "test".into(),
            sample_counts: vec![1, 2, 4],
            max_texture_dimension: 1024,
        };
        let mut config = RendererConfig {
            width: 64,
            height: 64,
            ..RendererConfig::default()
        };
        let err = validate_config(&config, &caps).unwrap_err();
        assert!(err.to_string().contains("exceeds"), "{err}");

        config.table.sample_count = 4;
        validate_config(&config, &caps).unwrap();

        config.width = 2048;
        assert!(validate_config(&config, &caps).is_err());
    }

    #[test]
    fn oversized_tables_fail_before_any_allocation() {
        let oversized = [
            TableParams {
                dither_table_size: 1 << 31,
                ..TableParams::default()
            },
            TableParams {
                dither_table_size: 32768,
                alpha_levels: 16,
                ..TableParams::default()
            },
            TableParams {
                dither_table_size: 256,
                alpha_levels: 16384,
                ..TableParams::default()
            },
        ];
        for table in oversized {
            let mut device = SoftwareDevice::new();
            let config = RendererConfig {
                table,
                width: 8,
                height: 8,
                ..RendererConfig::default()
            };
            match StochasticTransparency::new(&mut device, config) {
                Err(OitError::Configuration(_)) => {}
                other => panic!("expected a configuration error, got {:?}", other.err()),
            }
            assert_eq!(device.texture_count(), 0);
        }
    }
}
