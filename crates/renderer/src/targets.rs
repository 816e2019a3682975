//! Viewport-sized render targets owned by the orchestrator.

use std::collections::BTreeMap;

use oitconfig::TechniqueMode;

use crate::device::{GraphicsDevice, TextureDesc, TextureFormat, TextureId, TextureRole};
use crate::error::OitError;
use crate::passes::Slot;

/// Formats of the intermediate targets. Only the stochastic depth target is
/// multisampled.
pub fn target_layout(mode: TechniqueMode) -> Vec<(Slot, TextureFormat)> {
    let mut layout = vec![
        (Slot::BackgroundColor, TextureFormat::Rgba16Float),
        (Slot::BackgroundDepth, TextureFormat::Depth32Float),
        (Slot::StochasticDepth, TextureFormat::Depth32Float),
        (Slot::AccumulatedColor, TextureFormat::Rgba16Float),
    ];
    match mode {
        TechniqueMode::ThreeTarget => layout.push((Slot::Transmittance, TextureFormat::R16Float)),
        TechniqueMode::TwoTargetMerged => layout.push((Slot::TotalAlpha, TextureFormat::R16Float)),
    }
    layout.push((Slot::Output, TextureFormat::Rgba8Unorm));
    layout
}

#[derive(Debug)]
pub struct RenderTargetSet {
    width: u32,
    height: u32,
    sample_count: u32,
    textures: BTreeMap<Slot, TextureId>,
}

impl RenderTargetSet {
    /// Allocates every target for `mode`. On failure the targets created so
    /// far are destroyed again.
    pub(crate) fn create<D: GraphicsDevice>(
        device: &mut D,
        mode: TechniqueMode,
        width: u32,
        height: u32,
        sample_count: u32,
    ) -> Result<Self, OitError> {
        let mut set = Self {
            width,
            height,
            sample_count,
            textures: BTreeMap::new(),
        };
        for (slot, format) in target_layout(mode) {
            let desc = TextureDesc {
                label: slot.as_str(),
                width,
                height,
                sample_count: if slot == Slot::StochasticDepth {
                    sample_count
                } else {
                    1
                },
                format,
                role: if format.is_depth() {
                    TextureRole::DepthTarget
                } else {
                    TextureRole::ColorTarget
                },
            };
            match device.create_texture(&desc) {
                Ok(id) => {
                    set.textures.insert(slot, id);
                }
                Err(err) => {
                    set.release(device);
                    return Err(OitError::initialization(format!("render target `{slot}`"))(err));
                }
            }
        }
        tracing::debug!(
            width,
            height,
            sample_count,
            targets = set.textures.len(),
            "created render targets"
        );
        Ok(set)
    }

    pub fn get(&self, slot: Slot) -> Option<TextureId> {
        self.textures.get(&slot).copied()
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn iter(&self) -> impl Iterator<Item = (Slot, TextureId)> + '_ {
        self.textures.iter().map(|(slot, id)| (*slot, *id))
    }

    pub(crate) fn release<D: GraphicsDevice>(&mut self, device: &mut D) {
        for (_, id) in std::mem::take(&mut self.textures) {
            device.destroy_texture(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceError, GraphicsDevice};
    use crate::SoftwareDevice;

    #[test]
    fn layout_follows_mode() {
        let three: Vec<_> = target_layout(TechniqueMode::ThreeTarget)
            .into_iter()
            .map(|(slot, _)| slot)
            .collect();
        assert!(three.contains(&Slot::Transmittance));
        assert!(!three.contains(&Slot::TotalAlpha));

        let merged: Vec<_> = target_layout(TechniqueMode::TwoTargetMerged)
            .into_iter()
            .map(|(slot, _)| slot)
            .collect();
        assert!(merged.contains(&Slot::TotalAlpha));
        assert!(!merged.contains(&Slot::Transmittance));
    }

    #[test]
    fn failed_allocation_releases_partial_set() {
        let mut device = SoftwareDevice::with_sample_counts(vec![1, 4]);
        let err = RenderTargetSet::create(&mut device, TechniqueMode::ThreeTarget, 8, 8, 8)
            .unwrap_err();
        match err {
            OitError::Initialization { resource, source } => {
                assert!(resource.contains("stochastic-depth"), "{resource}");
                assert!(matches!(source, DeviceError::Unsupported(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(device.texture_count(), 0);
    }

    #[test]
    fn only_stochastic_depth_is_multisampled() {
        let mut device = SoftwareDevice::new();
        let mut set =
            RenderTargetSet::create(&mut device, TechniqueMode::TwoTargetMerged, 4, 2, 8).unwrap();
        assert_eq!(set.iter().count(), 6);
        let depth = set.get(Slot::StochasticDepth).unwrap();
        let pixels = device.read_texture(depth).unwrap();
        assert_eq!((pixels.width, pixels.height), (4, 2));
        set.release(&mut device);
        assert_eq!(device.texture_count(), 0);
    }
}
