use crate::device::DeviceError;

#[derive(Debug, thiserror::Error)]
pub enum OitError {
    /// Rejected before any device resource was allocated.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("failed to create {resource}: {source}")]
    Initialization {
        resource: String,
        #[source]
        source: DeviceError,
    },
    /// The device is gone; the renderer refuses further frames.
    #[error("graphics device lost: {0}")]
    DeviceLost(String),
    #[error("frame abandoned in pass `{pass}`: {source}")]
    Frame {
        pass: &'static str,
        #[source]
        source: DeviceError,
    },
}

impl OitError {
    pub(crate) fn initialization(resource: impl Into<String>) -> impl FnOnce(DeviceError) -> Self {
        let resource = resource.into();
        move |source| match source {
            DeviceError::Lost(reason) => OitError::DeviceLost(reason),
            source => OitError::Initialization { resource, source },
        }
    }

    pub fn is_device_lost(&self) -> bool {
        matches!(self, OitError::DeviceLost(_))
    }
}

impl From<maskgen::TableError> for OitError {
    fn from(err: maskgen::TableError) -> Self {
        OitError::Configuration(err.to_string())
    }
}
