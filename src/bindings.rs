//! GPU resources exposed to user programs.
//!
//! Every program sees the same `@group(0)` layout. The order of
//! [`BindingManager::bindings`] defines the `@binding(n)` indices, so it must
//! never change without recompiling every shader.

use log::{info, warn};

use crate::uniforms::{
    CustomUniforms, DispatchUniform, KeyboardUniform, MouseUniform, TimeUniform, UniformProvider,
};

/// `@binding` indices reserved for `#storage` declarations.
pub const STORAGE_SLOTS: [u32; 2] = [0, 1];
/// Dynamic-offset alignment of the per-dispatch uniform.
pub const DISPATCH_STRIDE: u64 = 256;
pub const SCREEN_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
pub const PASS_LAYERS: u32 = 4;
pub const CHANNEL_COUNT: usize = 2;
pub const ASSERT_COUNTERS: usize = 10;
const DEFAULT_DISPATCH_CAPACITY: u32 = 32;

/// A resource that occupies one `@binding` slot.
pub trait Binding {
    fn binding_type(&self) -> wgpu::BindingType;
    /// WGSL text following `@group(0) @binding(n)`; empty when the user declares it.
    fn declaration(&self) -> &str;
    fn resource(&self) -> wgpu::BindingResource<'_>;
}

pub struct BufferBinding<H> {
    pub host: H,
    pub buffer: wgpu::Buffer,
    ty: wgpu::BindingType,
    decl: String,
    size: Option<wgpu::BufferSize>,
}

impl<H> BufferBinding<H> {
    fn new(
        device: &wgpu::Device,
        label: &str,
        host: H,
        size: u64,
        usage: wgpu::BufferUsages,
        ty: wgpu::BufferBindingType,
        decl: &str,
    ) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        });
        Self {
            host,
            buffer,
            ty: wgpu::BindingType::Buffer {
                ty,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            decl: decl.to_string(),
            size: None,
        }
    }

    fn dynamic(mut self, binding_size: u64) -> Self {
        let size = wgpu::BufferSize::new(binding_size);
        if let wgpu::BindingType::Buffer { ty, .. } = self.ty {
            self.ty = wgpu::BindingType::Buffer {
                ty,
                has_dynamic_offset: true,
                min_binding_size: size,
            };
        }
        self.size = size;
        self
    }
}

impl<H: UniformProvider> BufferBinding<H> {
    pub fn stage(&self, queue: &wgpu::Queue) {
        queue.write_buffer(&self.buffer, 0, self.host.as_bytes());
    }
}

impl<H> Binding for BufferBinding<H> {
    fn binding_type(&self) -> wgpu::BindingType {
        self.ty
    }

    fn declaration(&self) -> &str {
        &self.decl
    }

    fn resource(&self) -> wgpu::BindingResource<'_> {
        wgpu::BindingResource::Buffer(wgpu::BufferBinding {
            buffer: &self.buffer,
            offset: 0,
            size: self.size,
        })
    }
}

/// Sampled texture (`pass_in`, channels).
#[derive(Clone)]
pub struct TextureBinding {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    ty: wgpu::BindingType,
    decl: String,
}

impl TextureBinding {
    pub fn new(texture: wgpu::Texture, dimension: wgpu::TextureViewDimension, filterable: bool, decl: &str) -> Self {
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(dimension),
            ..Default::default()
        });
        Self {
            texture,
            view,
            ty: wgpu::BindingType::Texture {
                multisampled: false,
                sample_type: wgpu::TextureSampleType::Float { filterable },
                view_dimension: dimension,
            },
            decl: decl.to_string(),
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.texture.width(), self.texture.height())
    }
}

impl Binding for TextureBinding {
    fn binding_type(&self) -> wgpu::BindingType {
        self.ty
    }

    fn declaration(&self) -> &str {
        &self.decl
    }

    fn resource(&self) -> wgpu::BindingResource<'_> {
        wgpu::BindingResource::TextureView(&self.view)
    }
}

/// Write-only storage texture (`screen`, `pass_out`).
pub struct StorageTextureBinding {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    ty: wgpu::BindingType,
    decl: String,
}

impl StorageTextureBinding {
    fn new(texture: wgpu::Texture, dimension: wgpu::TextureViewDimension, decl: &str) -> Self {
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(dimension),
            ..Default::default()
        });
        let format = texture.format();
        Self {
            texture,
            view,
            ty: wgpu::BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::WriteOnly,
                format,
                view_dimension: dimension,
            },
            decl: decl.to_string(),
        }
    }
}

impl Binding for StorageTextureBinding {
    fn binding_type(&self) -> wgpu::BindingType {
        self.ty
    }

    fn declaration(&self) -> &str {
        &self.decl
    }

    fn resource(&self) -> wgpu::BindingResource<'_> {
        wgpu::BindingResource::TextureView(&self.view)
    }
}

pub struct SamplerBinding {
    pub sampler: wgpu::Sampler,
    decl: String,
}

impl SamplerBinding {
    fn new(device: &wgpu::Device, name: &str, filter: wgpu::FilterMode, mipmaps: bool, address_mode: wgpu::AddressMode) -> Self {
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some(name),
            address_mode_u: address_mode,
            address_mode_v: address_mode,
            address_mode_w: address_mode,
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter: if mipmaps {
                wgpu::FilterMode::Linear
            } else {
                wgpu::FilterMode::Nearest
            },
            ..Default::default()
        });
        Self {
            sampler,
            decl: format!("var {}: sampler;", name),
        }
    }
}

impl Binding for SamplerBinding {
    fn binding_type(&self) -> wgpu::BindingType {
        wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering)
    }

    fn declaration(&self) -> &str {
        &self.decl
    }

    fn resource(&self) -> wgpu::BindingResource<'_> {
        wgpu::BindingResource::Sampler(&self.sampler)
    }
}

/// Construction parameters that survive a reset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BindingOptions {
    /// `pass_in`/`pass_out` in `rgba32float` instead of `rgba16float`.
    pub pass_f32: bool,
    /// Ceiling for each of the two storage buffers, in bytes.
    pub storage_limit: u64,
    pub debug_asserts: bool,
}

impl Default for BindingOptions {
    fn default() -> Self {
        Self {
            pass_f32: false,
            storage_limit: 128 << 20,
            debug_asserts: false,
        }
    }
}

impl BindingOptions {
    pub fn pass_format(&self) -> wgpu::TextureFormat {
        if self.pass_f32 {
            wgpu::TextureFormat::Rgba32Float
        } else {
            wgpu::TextureFormat::Rgba16Float
        }
    }
}

/// State that outlives a [`BindingManager`] across resize and reset.
#[derive(Default)]
pub struct Carryover {
    pub channels: [Option<TextureBinding>; CHANNEL_COUNT],
    pub custom: Option<CustomUniforms>,
}

pub struct BindingManager {
    device: wgpu::Device,
    width: u32,
    height: u32,
    pub storage: [BufferBinding<()>; 2],
    pub time: BufferBinding<TimeUniform>,
    pub mouse: BufferBinding<MouseUniform>,
    pub keyboard: BufferBinding<KeyboardUniform>,
    pub custom: BufferBinding<CustomUniforms>,
    pub dispatch: BufferBinding<u32>,
    pub screen: StorageTextureBinding,
    pub pass_in: TextureBinding,
    pub pass_out: StorageTextureBinding,
    pub channels: [TextureBinding; CHANNEL_COUNT],
    pub samplers: [SamplerBinding; 6],
    pub asserts: Option<BufferBinding<()>>,
}

impl BindingManager {
    pub fn new(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        width: u32,
        height: u32,
        options: BindingOptions,
        carryover: Carryover,
    ) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        let limits = device.limits();
        let storage_size = options
            .storage_limit
            .min(limits.max_storage_buffer_binding_size as u64)
            .min(limits.max_buffer_size)
            & !3;
        if storage_size < options.storage_limit {
            warn!(
                "storage buffers capped to {} bytes by device limits",
                storage_size
            );
        }
        let storage_usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST;
        let rw = wgpu::BufferBindingType::Storage { read_only: false };
        let uniform_usage = wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST;
        let uniform = wgpu::BufferBindingType::Uniform;
        let size_of = |bytes: &[u8]| bytes.len() as u64;

        let storage = [
            BufferBinding::new(device, "storage1", (), storage_size, storage_usage, rw, ""),
            BufferBinding::new(device, "storage2", (), storage_size, storage_usage, rw, ""),
        ];
        let time = TimeUniform::default();
        let time = BufferBinding::new(
            device,
            "time",
            time,
            size_of(time.as_bytes()),
            uniform_usage,
            uniform,
            "var<uniform> time: Time;",
        );
        let mouse = MouseUniform::default();
        let mouse = BufferBinding::new(
            device,
            "mouse",
            mouse,
            size_of(mouse.as_bytes()),
            uniform_usage,
            uniform,
            "var<uniform> mouse: Mouse;",
        );
        let keyboard = KeyboardUniform::default();
        let keyboard = BufferBinding::new(
            device,
            "keyboard",
            keyboard,
            size_of(keyboard.as_bytes()),
            uniform_usage,
            uniform,
            "var<uniform> _keyboard: array<vec4<u32>, 2>;",
        );
        let custom = carryover.custom.unwrap_or_default();
        let custom_size = size_of(custom.as_bytes());
        let custom = BufferBinding::new(
            device,
            "custom",
            custom,
            custom_size,
            uniform_usage,
            uniform,
            "var<uniform> custom: Custom;",
        );
        let dispatch = Self::create_dispatch_binding(device, DEFAULT_DISPATCH_CAPACITY);

        let screen = StorageTextureBinding::new(
            Self::create_texture(
                device,
                "screen",
                width,
                height,
                1,
                SCREEN_FORMAT,
                wgpu::TextureUsages::STORAGE_BINDING
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC,
            ),
            wgpu::TextureViewDimension::D2,
            "var screen: texture_storage_2d<rgba16float, write>;",
        );
        let pass_format = options.pass_format();
        let pass_wgsl = if options.pass_f32 { "rgba32float" } else { "rgba16float" };
        let pass_in = TextureBinding::new(
            Self::create_texture(
                device,
                "pass_in",
                width,
                height,
                PASS_LAYERS,
                pass_format,
                wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            ),
            wgpu::TextureViewDimension::D2Array,
            !options.pass_f32,
            "var pass_in: texture_2d_array<f32>;",
        );
        let pass_out = StorageTextureBinding::new(
            Self::create_texture(
                device,
                "pass_out",
                width,
                height,
                PASS_LAYERS,
                pass_format,
                wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::COPY_SRC,
            ),
            wgpu::TextureViewDimension::D2Array,
            &format!(
                "var pass_out: texture_storage_2d_array<{}, write>;",
                pass_wgsl
            ),
        );

        let [c0, c1] = carryover.channels;
        let channels = [
            c0.unwrap_or_else(|| Self::placeholder_channel(device, queue, 0)),
            c1.unwrap_or_else(|| Self::placeholder_channel(device, queue, 1)),
        ];

        use wgpu::{AddressMode::*, FilterMode::*};
        let samplers = [
            SamplerBinding::new(device, "nearest", Nearest, false, ClampToEdge),
            SamplerBinding::new(device, "bilinear", Linear, false, ClampToEdge),
            SamplerBinding::new(device, "trilinear", Linear, true, ClampToEdge),
            SamplerBinding::new(device, "nearest_repeat", Nearest, false, Repeat),
            SamplerBinding::new(device, "bilinear_repeat", Linear, false, Repeat),
            SamplerBinding::new(device, "trilinear_repeat", Linear, true, Repeat),
        ];

        let asserts = options.debug_asserts.then(|| {
            BufferBinding::new(
                device,
                "assert counts",
                (),
                (ASSERT_COUNTERS * 4) as u64,
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
                rw,
                "var<storage, read_write> _assert_counts: array<atomic<u32>>;",
            )
        });

        info!(
            "bindings created at {}x{} (pass {:?}, storage {} bytes)",
            width, height, pass_format, storage_size
        );

        Self {
            device: device.clone(),
            width,
            height,
            storage,
            time,
            mouse,
            keyboard,
            custom,
            dispatch,
            screen,
            pass_in,
            pass_out,
            channels,
            samplers,
            asserts,
        }
    }

    fn create_texture(
        device: &wgpu::Device,
        label: &str,
        width: u32,
        height: u32,
        layers: u32,
        format: wgpu::TextureFormat,
        usage: wgpu::TextureUsages,
    ) -> wgpu::Texture {
        device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: layers,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        })
    }

    fn create_dispatch_binding(device: &wgpu::Device, capacity: u32) -> BufferBinding<u32> {
        BufferBinding::new(
            device,
            "dispatch",
            capacity,
            capacity as u64 * DISPATCH_STRIDE,
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            wgpu::BufferBindingType::Uniform,
            "var<uniform> dispatch: DispatchInfo;",
        )
        .dynamic(std::mem::size_of::<DispatchUniform>() as u64)
    }

    /// 1x1 magenta stand-in until an image is loaded.
    fn placeholder_channel(device: &wgpu::Device, queue: &wgpu::Queue, index: usize) -> TextureBinding {
        let texture = Self::create_texture(
            device,
            &format!("channel{} placeholder", index),
            1,
            1,
            1,
            wgpu::TextureFormat::Rgba8UnormSrgb,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        );
        let magenta_data: [u8; 4] = [255, 0, 255, 255];
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &magenta_data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4),
                rows_per_image: Some(1),
            },
            wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
        Self::channel_binding(texture, index)
    }

    pub fn channel_binding(texture: wgpu::Texture, index: usize) -> TextureBinding {
        TextureBinding::new(
            texture,
            wgpu::TextureViewDimension::D2,
            true,
            &format!("var channel{}: texture_2d<f32>;", index),
        )
    }

    /// All bindings in wire order.
    pub fn bindings(&self) -> Vec<&dyn Binding> {
        let mut bindings: Vec<&dyn Binding> = vec![
            &self.storage[0] as &dyn Binding,
            &self.storage[1],
            &self.time,
            &self.mouse,
            &self.keyboard,
            &self.custom,
            &self.dispatch,
            &self.screen,
            &self.pass_in,
            &self.pass_out,
        ];
        bindings.extend(self.channels.iter().map(|c| c as &dyn Binding));
        bindings.extend(self.samplers.iter().map(|s| s as &dyn Binding));
        if let Some(asserts) = &self.asserts {
            bindings.push(asserts);
        }
        bindings
    }

    pub fn create_bind_group_layout(&self) -> wgpu::BindGroupLayout {
        let entries: Vec<wgpu::BindGroupLayoutEntry> = self
            .bindings()
            .iter()
            .enumerate()
            .map(|(index, binding)| wgpu::BindGroupLayoutEntry {
                binding: index as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: binding.binding_type(),
                count: None,
            })
            .collect();
        self.device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Program Bind Group Layout"),
                entries: &entries,
            })
    }

    pub fn create_bind_group(&self, layout: &wgpu::BindGroupLayout) -> wgpu::BindGroup {
        let bindings = self.bindings();
        let entries: Vec<wgpu::BindGroupEntry> = bindings
            .iter()
            .enumerate()
            .map(|(index, binding)| wgpu::BindGroupEntry {
                binding: index as u32,
                resource: binding.resource(),
            })
            .collect();
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Program Bind Group"),
            layout,
            entries: &entries,
        })
    }

    /// One global declaration per binding, in wire order.
    pub fn declarations(&self) -> String {
        self.bindings()
            .iter()
            .enumerate()
            .filter(|(_, binding)| !binding.declaration().is_empty())
            .map(|(index, binding)| {
                format!("@group(0) @binding({}) {}\n", index, binding.declaration())
            })
            .collect()
    }

    /// Uploads the mutable host state for this frame.
    pub fn stage(&self, queue: &wgpu::Queue) {
        self.time.stage(queue);
        self.mouse.stage(queue);
        self.keyboard.stage(queue);
        self.custom.stage(queue);
        if let Some(asserts) = &self.asserts {
            queue.write_buffer(&asserts.buffer, 0, &[0u8; ASSERT_COUNTERS * 4]);
        }
    }

    /// Writes one 256-byte slot per queued dispatch.
    pub fn stage_dispatches(&self, queue: &wgpu::Queue, ids: &[u32]) {
        if ids.is_empty() {
            return;
        }
        let mut data = vec![0u8; ids.len() * DISPATCH_STRIDE as usize];
        for (slot, id) in ids.iter().enumerate() {
            let uniform = DispatchUniform {
                id: *id,
                ..Default::default()
            };
            let start = slot * DISPATCH_STRIDE as usize;
            data[start..start + uniform.as_bytes().len()].copy_from_slice(uniform.as_bytes());
        }
        queue.write_buffer(&self.dispatch.buffer, 0, &data);
    }

    pub fn dispatch_capacity(&self) -> u32 {
        self.dispatch.host
    }

    /// Grows the dispatch buffer; returns true when the bind group must be rebuilt.
    pub fn ensure_dispatch_capacity(&mut self, dispatches: u32) -> bool {
        if dispatches <= self.dispatch.host {
            return false;
        }
        let capacity = dispatches.next_power_of_two();
        info!("growing dispatch buffer to {} slots", capacity);
        self.dispatch.buffer.destroy();
        self.dispatch = Self::create_dispatch_binding(&self.device, capacity);
        true
    }

    /// Records the pass_out → pass_in copy on `encoder`.
    pub fn copy_pass_out_to_in(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.copy_texture_to_texture(
            self.pass_out.texture.as_image_copy(),
            self.pass_in.texture.as_image_copy(),
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: PASS_LAYERS,
            },
        );
    }

    /// Installs a channel texture and hands back the one it replaces.
    ///
    /// The bind group built before this call still references the old texture.
    pub fn replace_channel(&mut self, index: usize, texture: wgpu::Texture) -> Option<TextureBinding> {
        let slot = self.channels.get_mut(index)?;
        Some(std::mem::replace(slot, Self::channel_binding(texture, index)))
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Releases GPU memory, optionally keeping channels and custom values for the next manager.
    ///
    /// The manager must be replaced right after this call.
    pub fn dispose(&self, preserve_channels: bool, preserve_custom: bool) -> Carryover {
        for buffer in [
            &self.storage[0].buffer,
            &self.storage[1].buffer,
            &self.time.buffer,
            &self.mouse.buffer,
            &self.keyboard.buffer,
            &self.custom.buffer,
            &self.dispatch.buffer,
        ] {
            buffer.destroy();
        }
        if let Some(asserts) = &self.asserts {
            asserts.buffer.destroy();
        }
        self.screen.texture.destroy();
        self.pass_in.texture.destroy();
        self.pass_out.texture.destroy();

        let channels = if preserve_channels {
            [Some(self.channels[0].clone()), Some(self.channels[1].clone())]
        } else {
            for channel in &self.channels {
                channel.texture.destroy();
            }
            [None, None]
        };
        Carryover {
            channels,
            custom: preserve_custom.then(|| self.custom.host.clone()),
        }
    }
}
