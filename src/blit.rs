use log::debug;

use crate::error::ResourceError;

/// Encoding of the texels in a blit source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
    Linear,
    /// Shared-exponent RGBE packed into an `rgba8unorm` texture.
    Rgbe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conversion {
    Passthrough,
    LinearToSrgb,
    DecodeRgbe,
}

impl Conversion {
    fn lookup(space: ColorSpace, target: wgpu::TextureFormat) -> Option<Self> {
        use wgpu::TextureFormat::*;
        match (space, target) {
            (ColorSpace::Linear, Rgba8Unorm | Bgra8Unorm) => Some(Self::LinearToSrgb),
            (ColorSpace::Linear, Rgba8UnormSrgb | Bgra8UnormSrgb | Rgba16Float) => {
                Some(Self::Passthrough)
            }
            (ColorSpace::Rgbe, Rgba16Float) => Some(Self::DecodeRgbe),
            _ => None,
        }
    }

    fn entry_point(self) -> &'static str {
        match self {
            Self::Passthrough => "fs_passthrough",
            Self::LinearToSrgb => "fs_linear_to_srgb",
            Self::DecodeRgbe => "fs_decode_rgbe",
        }
    }
}

const BLIT_SHADER: &str = r#"
struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@group(0) @binding(0) var src: texture_2d<f32>;
@group(0) @binding(1) var src_sampler: sampler;

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VertexOutput {
    let pos = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u)) * 2.0 - 1.0;
    var out: VertexOutput;
    out.position = vec4<f32>(pos, 0.0, 1.0);
    out.uv = vec2<f32>(pos.x * 0.5 + 0.5, 0.5 - pos.y * 0.5);
    return out;
}

fn linear_to_srgb(c: vec3<f32>) -> vec3<f32> {
    let lo = c * 12.92;
    let hi = 1.055 * pow(c, vec3<f32>(1.0 / 2.4)) - 0.055;
    return select(hi, lo, c <= vec3<f32>(0.0031308));
}

@fragment
fn fs_passthrough(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(src, src_sampler, in.uv);
}

@fragment
fn fs_linear_to_srgb(in: VertexOutput) -> @location(0) vec4<f32> {
    let c = textureSample(src, src_sampler, in.uv);
    return vec4<f32>(linear_to_srgb(clamp(c.rgb, vec3<f32>(0.0), vec3<f32>(1.0))), c.a);
}

@fragment
fn fs_decode_rgbe(in: VertexOutput) -> @location(0) vec4<f32> {
    let c = textureSample(src, src_sampler, in.uv);
    return vec4<f32>(c.rgb * exp2(c.a * 255.0 - 128.0), 1.0);
}
"#;

/// Draws one source view into a destination view with a fixed color conversion.
pub struct Blitter {
    pipeline: wgpu::RenderPipeline,
    bind_group: wgpu::BindGroup,
}

impl Blitter {
    /// Fails when `space` cannot be written to `format`.
    pub fn new(
        device: &wgpu::Device,
        src: &wgpu::TextureView,
        space: ColorSpace,
        format: wgpu::TextureFormat,
    ) -> Result<Self, ResourceError> {
        let conversion = Conversion::lookup(space, format)
            .ok_or(ResourceError::UnsupportedBlit { space, target: format })?;
        debug!("blitter {:?} -> {:?} via {:?}", space, format, conversion);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Blit Shader"),
            source: wgpu::ShaderSource::Wgsl(BLIT_SHADER.into()),
        });
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Blit Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        // RGBE must not be interpolated before decoding.
        let filter = match space {
            ColorSpace::Rgbe => wgpu::FilterMode::Nearest,
            ColorSpace::Linear => wgpu::FilterMode::Linear,
        };
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Blit Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: filter,
            min_filter: filter,
            ..Default::default()
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Blit Bind Group"),
            layout: &bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(src),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
            ],
        });
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Blit Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Blit Pipeline"),
            layout: Some(&layout),
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &module,
                entry_point: Some(conversion.entry_point()),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        Ok(Self {
            pipeline,
            bind_group,
        })
    }

    pub fn blit(&self, encoder: &mut wgpu::CommandEncoder, dest: &wgpu::TextureView) {
        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Blit Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: dest,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        render_pass.set_pipeline(&self.pipeline);
        render_pass.set_bind_group(0, &self.bind_group, &[]);
        render_pass.draw(0..3, 0..1);
    }
}

pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Builds a fully mipmapped copy of `source` in `format`.
///
/// Level 0 is converted from `space`; each further level is downsampled from
/// the previous one. The intermediate blitters and `source` are released once
/// the queue reports the work as done.
pub fn create_mipmapped_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    source: wgpu::Texture,
    space: ColorSpace,
    format: wgpu::TextureFormat,
    label: &str,
) -> Result<wgpu::Texture, ResourceError> {
    let (width, height) = (source.width(), source.height());
    let levels = mip_level_count(width, height);
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: levels,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    let level_view = |level: u32| {
        texture.create_view(&wgpu::TextureViewDescriptor {
            base_mip_level: level,
            mip_level_count: Some(1),
            ..Default::default()
        })
    };

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("Mipmap Encoder"),
    });
    let source_view = source.create_view(&wgpu::TextureViewDescriptor::default());
    let mut blitters = vec![Blitter::new(device, &source_view, space, format)?];
    blitters[0].blit(&mut encoder, &level_view(0));
    for level in 1..levels {
        // The previous level is already decoded.
        let blitter = Blitter::new(device, &level_view(level - 1), ColorSpace::Linear, format)?;
        blitter.blit(&mut encoder, &level_view(level));
        blitters.push(blitter);
    }
    queue.submit(Some(encoder.finish()));
    debug!("{} built with {} mip levels", label, levels);

    queue.on_submitted_work_done(move || {
        drop(blitters);
        source.destroy();
    });
    Ok(texture)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgpu::TextureFormat;

    #[test]
    fn conversion_table() {
        assert_eq!(
            Conversion::lookup(ColorSpace::Linear, TextureFormat::Bgra8Unorm),
            Some(Conversion::LinearToSrgb)
        );
        assert_eq!(
            Conversion::lookup(ColorSpace::Linear, TextureFormat::Rgba8UnormSrgb),
            Some(Conversion::Passthrough)
        );
        assert_eq!(
            Conversion::lookup(ColorSpace::Linear, TextureFormat::Rgba16Float),
            Some(Conversion::Passthrough)
        );
        assert_eq!(
            Conversion::lookup(ColorSpace::Rgbe, TextureFormat::Rgba16Float),
            Some(Conversion::DecodeRgbe)
        );
        assert_eq!(
            Conversion::lookup(ColorSpace::Rgbe, TextureFormat::Rgba8Unorm),
            None
        );
        assert_eq!(
            Conversion::lookup(ColorSpace::Linear, TextureFormat::Rgba32Float),
            None
        );
    }

    #[test]
    fn mip_levels_cover_the_longest_side() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(256, 256), 9);
        assert_eq!(mip_level_count(300, 20), 9);
        assert_eq!(mip_level_count(0, 0), 1);
    }

    #[test]
    fn unsupported_pairing_fails_at_construction() {
        let Some(gpu) = crate::gpu::test_gpu() else {
            return;
        };
        let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: None,
            size: wgpu::Extent3d {
                width: 4,
                height: 4,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&Default::default());
        let err = Blitter::new(&gpu.device, &view, ColorSpace::Rgbe, TextureFormat::Bgra8Unorm)
            .err()
            .unwrap();
        assert!(matches!(err, ResourceError::UnsupportedBlit { .. }));
        assert!(Blitter::new(&gpu.device, &view, ColorSpace::Rgbe, TextureFormat::Rgba16Float).is_ok());
    }
}
