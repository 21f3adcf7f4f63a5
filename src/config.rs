use std::path::PathBuf;

use log::warn;

use crate::bindings::BindingOptions;
use crate::preprocess::{
    DirIncludeSource, HttpIncludeSource, IncludeResolver, IncludeSource, DEFAULT_STD_ROOT,
    STRING_MAX_LEN,
};

/// Configuration built by [`EngineConfigBuilder`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub width: u32,
    pub height: u32,
    /// Format of the view the screen texture is presented to.
    pub surface_format: wgpu::TextureFormat,
    pub pass_f32: bool,
    pub profiling: bool,
    pub debug_asserts: bool,
    pub storage_limit: u64,
    pub string_max_len: usize,
    /// Root for `#include <name>`; `None` disables std includes.
    pub std_include_root: Option<String>,
    /// Directory for `#include "path"`.
    pub user_include_root: Option<PathBuf>,
    pub label: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let bindings = BindingOptions::default();
        Self {
            width: 512,
            height: 512,
            surface_format: wgpu::TextureFormat::Bgra8UnormSrgb,
            pass_f32: bindings.pass_f32,
            profiling: false,
            debug_asserts: bindings.debug_asserts,
            storage_limit: bindings.storage_limit,
            string_max_len: STRING_MAX_LEN,
            std_include_root: Some(DEFAULT_STD_ROOT.to_string()),
            user_include_root: None,
            label: "kernelpad".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    pub fn binding_options(&self) -> BindingOptions {
        BindingOptions {
            pass_f32: self.pass_f32,
            storage_limit: self.storage_limit,
            debug_asserts: self.debug_asserts,
        }
    }

    /// Include lookup wired to the configured roots.
    pub fn include_resolver(&self) -> IncludeResolver {
        let std_source = self.std_include_root.as_deref().and_then(|root| {
            match HttpIncludeSource::new(root) {
                Ok(source) => Some(Box::new(source) as Box<dyn IncludeSource>),
                Err(e) => {
                    warn!("std includes disabled: {:#}", e);
                    None
                }
            }
        });
        let user_source = self
            .user_include_root
            .clone()
            .map(|root| Box::new(DirIncludeSource::new(root)) as Box<dyn IncludeSource>);
        IncludeResolver::new(std_source, user_source)
    }
}

/// Builder for engine configurations
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.config.width = width;
        self.config.height = height;
        self
    }

    pub fn with_surface_format(mut self, format: wgpu::TextureFormat) -> Self {
        self.config.surface_format = format;
        self
    }

    /// Store pass textures as `rgba32float`
    pub fn with_pass_f32(mut self, enabled: bool) -> Self {
        self.config.pass_f32 = enabled;
        self
    }

    /// Time every dispatch with timestamp queries
    pub fn with_profiling(mut self) -> Self {
        self.config.profiling = true;
        self
    }

    /// Enable the `assert()` helper and its readback
    pub fn with_debug_asserts(mut self) -> Self {
        self.config.debug_asserts = true;
        self
    }

    pub fn with_storage_limit(mut self, bytes: u64) -> Self {
        self.config.storage_limit = bytes;
        self
    }

    pub fn with_string_max_len(mut self, len: usize) -> Self {
        self.config.string_max_len = len;
        self
    }

    pub fn with_std_include_root(mut self, root: Option<&str>) -> Self {
        self.config.std_include_root = root.map(str::to_string);
        self
    }

    pub fn with_user_include_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.user_include_root = Some(root.into());
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.config.label = label.to_string();
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = EngineConfig::builder()
            .with_size(256, 128)
            .with_pass_f32(true)
            .with_debug_asserts()
            .with_std_include_root(None)
            .build();
        assert_eq!((config.width, config.height), (256, 128));
        assert_eq!(config.string_max_len, 20);
        assert_eq!(config.storage_limit, 128 << 20);
        let options = config.binding_options();
        assert!(options.pass_f32 && options.debug_asserts);
        assert_eq!(options.pass_format(), wgpu::TextureFormat::Rgba32Float);
    }
}
