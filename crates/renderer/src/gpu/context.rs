use std::sync::{Arc, Mutex};

use crate::device::{DeviceCaps, DeviceError};

/// Adapter details worth logging and reporting.
#[derive(Debug, Clone)]
pub struct AdapterProfile {
    pub name: String,
    pub backend: wgpu::Backend,
    pub device_type: wgpu::DeviceType,
}

impl AdapterProfile {
    fn from_info(info: &wgpu::AdapterInfo) -> Self {
        Self {
            name: info.name.clone(),
            backend: info.backend,
            device_type: info.device_type,
        }
    }

    pub fn is_software(&self) -> bool {
        matches!(self.device_type, wgpu::DeviceType::Cpu)
    }
}

/// Headless instance, device and queue plus what the adapter supports.
pub(crate) struct GpuContext {
    pub _instance: wgpu::Instance,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: AdapterProfile,
    pub sample_counts: Vec<u32>,
    pub max_texture_dimension: u32,
    pub lost: Arc<Mutex<Option<String>>>,
}

impl GpuContext {
    pub(crate) fn new(power_preference: wgpu::PowerPreference) -> Result<Self, DeviceError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: wgpu::InstanceFlags::default(),
            memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
            backend_options: wgpu::BackendOptions::default(),
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|err| DeviceError::Unsupported(format!("no suitable GPU adapter: {err}")))?;

        let profile = AdapterProfile::from_info(&adapter.get_info());
        let limits = adapter.limits();
        tracing::debug!(
            name = %profile.name,
            backend = ?profile.backend,
            device_type = ?profile.device_type,
            is_software = profile.is_software(),
            "selected GPU adapter"
        );

        let adapter_specific = adapter
            .features()
            .contains(wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES);
        let format_features =
            adapter.get_texture_format_features(wgpu::TextureFormat::Depth32Float);
        let mut sample_counts: Vec<u32> = format_features
            .flags
            .supported_sample_counts()
            .into_iter()
            .filter(|&count| count > 1 && (adapter_specific || count <= 4))
            .collect();
        sample_counts.sort_unstable();
        sample_counts.dedup();
        if sample_counts.is_empty() {
            tracing::warn!("adapter reports no multisampled depth support");
        }

        let mut required_features = wgpu::Features::empty();
        if sample_counts.iter().any(|&count| count > 4) {
            required_features |= wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES;
        }

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("stochastic transparency device"),
            required_features,
            required_limits: limits.clone(),
            memory_hints: wgpu::MemoryHints::MemoryUsage,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|err| DeviceError::Unsupported(format!("failed to create GPU device: {err}")))?;

        let lost = Arc::new(Mutex::new(None));
        let flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            tracing::error!(?reason, %message, "GPU device lost");
            if let Ok(mut slot) = flag.lock() {
                *slot = Some(format!("{reason:?}: {message}"));
            }
        });

        Ok(Self {
            _instance: instance,
            device,
            queue,
            profile,
            sample_counts,
            max_texture_dimension: limits.max_texture_dimension_2d,
            lost,
        })
    }

    pub(crate) fn caps(&self) -> DeviceCaps {
        DeviceCaps {
            name: self.profile.name.clone(),
            sample_counts: self.sample_counts.clone(),
            max_texture_dimension: self.max_texture_dimension,
        }
    }

    pub(crate) fn check_alive(&self) -> Result<(), DeviceError> {
        match self.lost.lock() {
            Ok(slot) => match slot.as_ref() {
                Some(reason) => Err(DeviceError::Lost(reason.clone())),
                None => Ok(()),
            },
            Err(_) => Err(DeviceError::Lost("device-lost flag poisoned".into())),
        }
    }

    pub(crate) fn push_error_scopes(&self) {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
    }

    /// Pops the scopes opened by `push_error_scopes`.
    pub(crate) fn pop_error_scopes(&self, what: &str) -> Result<(), DeviceError> {
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        self.check_alive()?;
        if let Some(error) = out_of_memory {
            return Err(DeviceError::OutOfMemory(format!("{what}: {error}")));
        }
        if let Some(error) = validation {
            return Err(DeviceError::Invalid(format!("{what}: {error}")));
        }
        Ok(())
    }
}
