use log::info;

use crate::error::ResourceError;

/// One adapter/device/queue triple. Cloning shares the same device.
#[derive(Clone, Debug)]
pub struct Gpu {
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl Gpu {
    pub fn instance() -> wgpu::Instance {
        let instance_desc = wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            backend_options: wgpu::BackendOptions::default(),
            ..Default::default()
        };
        wgpu::Instance::new(&instance_desc)
    }

    /// Acquires a device, optionally compatible with `surface`.
    ///
    /// Timestamp queries are enabled whenever the adapter has them.
    pub async fn new(
        instance: wgpu::Instance,
        surface: Option<&wgpu::Surface<'_>>,
    ) -> Result<Self, ResourceError> {
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: surface,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| ResourceError::NoAdapter(e.to_string()))?;

        let adapter_limits = adapter.limits();
        let mut required_limits = wgpu::Limits::default();
        required_limits.max_storage_buffer_binding_size =
            adapter_limits.max_storage_buffer_binding_size;
        required_limits.max_buffer_size = adapter_limits.max_buffer_size;
        let required_features = adapter.features() & wgpu::Features::TIMESTAMP_QUERY;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("kernelpad device"),
                required_features,
                required_limits,
                ..Default::default()
            })
            .await
            .map_err(|e| ResourceError::RequestDevice(e.to_string()))?;

        let adapter_info = adapter.get_info();
        info!(
            "using {} ({:?}, features {:?})",
            adapter_info.name, adapter_info.backend, required_features
        );
        Ok(Self {
            instance,
            adapter,
            device,
            queue,
        })
    }

    pub async fn headless() -> Result<Self, ResourceError> {
        Self::new(Self::instance(), None).await
    }

    pub fn supports_timestamps(&self) -> bool {
        self.device.features().contains(wgpu::Features::TIMESTAMP_QUERY)
    }
}

/// Headless device for tests; `None` (with a log line) on machines without one.
#[cfg(test)]
pub(crate) fn test_gpu() -> Option<Gpu> {
    match pollster::block_on(Gpu::headless()) {
        Ok(gpu) => Some(gpu),
        Err(e) => {
            eprintln!("skipping GPU test: {e}");
            None
        }
    }
}
