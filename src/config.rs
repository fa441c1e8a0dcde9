use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::events::validate_event_name;
use crate::ipc::protocol::DEFAULT_MAX_FRAME_LEN;

/// Environment variable holding the host socket path
pub const SOCKET_ENV: &str = "TETHER_SOCKET";

/// Environment variable holding this context's window label
pub const LABEL_ENV: &str = "TETHER_LABEL";

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    label: Option<String>,
    max_frame_len: usize,
    socket_path: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            label: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            socket_path: None,
        }
    }
}

impl BridgeConfig {
    /// Create a new builder for BridgeConfig
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }

    /// Build a configuration from `TETHER_SOCKET` and `TETHER_LABEL`
    pub fn from_env() -> Result<Self> {
        let mut builder = Self::builder();
        if let Some(path) = env::var_os(SOCKET_ENV) {
            builder = builder.socket_path(PathBuf::from(path));
        }
        if let Ok(label) = env::var(LABEL_ENV) {
            builder = builder.label(label);
        }
        builder.build()
    }

    /// Label of the window this bridge runs in
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }
}

/// Builder for BridgeConfig
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    inner: BridgeConfig,
}

impl BridgeConfigBuilder {
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.inner.label = Some(label.into());
        self
    }

    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.inner.max_frame_len = len;
        self
    }

    pub fn socket_path(mut self, path: impl AsRef<Path>) -> Self {
        self.inner.socket_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn build(self) -> Result<BridgeConfig> {
        if let Some(label) = &self.inner.label {
            // Labels share the event name alphabet
            validate_event_name(label)
                .map_err(|_| Error::InvalidConfig(format!("invalid window label: {label:?}")))?;
        }
        if self.inner.max_frame_len == 0 || self.inner.max_frame_len > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "max_frame_len must be between 1 and {}",
                u32::MAX
            )));
        }
        Ok(self.inner)
    }
}
