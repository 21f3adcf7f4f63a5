//! Image decoding for the `channel0`/`channel1` textures.

use std::io::Cursor;

use anyhow::{bail, Context, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};
use image::codecs::hdr::HdrDecoder;
use log::{debug, info};

use crate::blit::{create_mipmapped_texture, ColorSpace};
use crate::error::ResourceError;

/// Pixels ready for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    /// Tightly packed 4-byte texels.
    pub pixels: Vec<u8>,
    pub space: ColorSpace,
}

impl DecodedImage {
    pub fn upload_format(&self) -> wgpu::TextureFormat {
        match self.space {
            ColorSpace::Rgbe => wgpu::TextureFormat::Rgba8Unorm,
            ColorSpace::Linear => wgpu::TextureFormat::Rgba8UnormSrgb,
        }
    }

    /// Format of the final, mipmapped channel texture.
    pub fn channel_format(&self) -> wgpu::TextureFormat {
        match self.space {
            ColorSpace::Rgbe => wgpu::TextureFormat::Rgba16Float,
            ColorSpace::Linear => wgpu::TextureFormat::Rgba8UnormSrgb,
        }
    }

    /// Uploads the texels and expands them into a mipmapped channel texture.
    ///
    /// Device errors raised on the way are scoped to this call and come back
    /// as an `Err`; they never reach the device-wide error handler.
    pub fn upload(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        label: &str,
    ) -> Result<wgpu::Texture> {
        let max = device.limits().max_texture_dimension_2d;
        if self.width == 0 || self.height == 0 || self.width > max || self.height > max {
            bail!(
                "{} is {}x{}, the device allows at most {}x{}",
                label,
                self.width,
                self.height,
                max,
                max
            );
        }
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let texture = self.create_texture(device, queue, label);
        let scoped = pollster::block_on(device.pop_error_scope());
        let texture = texture.with_context(|| format!("creating {}", label))?;
        if let Some(e) = scoped {
            texture.destroy();
            bail!("uploading {}: {}", label, e);
        }
        Ok(texture)
    }

    fn create_texture(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        label: &str,
    ) -> Result<wgpu::Texture, ResourceError> {
        let size = wgpu::Extent3d {
            width: self.width,
            height: self.height,
            depth_or_array_layers: 1,
        };
        let raw = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: self.upload_format(),
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &raw,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &self.pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * self.width),
                rows_per_image: Some(self.height),
            },
            size,
        );
        create_mipmapped_texture(device, queue, raw, self.space, self.channel_format(), label)
    }
}

fn is_radiance(data: &[u8]) -> bool {
    data.starts_with(b"#?RADIANCE") || data.starts_with(b"#?RGBE")
}

/// Decodes PNG/JPEG into sRGB texels, or Radiance HDR into packed RGBE.
pub fn decode(data: &[u8]) -> Result<DecodedImage> {
    if is_radiance(data) {
        return decode_hdr(data);
    }
    let image = image::load_from_memory(data).context("decoding channel image")?;
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(DecodedImage {
        width,
        height,
        pixels: rgba.into_raw(),
        space: ColorSpace::Linear,
    })
}

fn decode_hdr(data: &[u8]) -> Result<DecodedImage> {
    let decoder = HdrDecoder::new(Cursor::new(data)).context("reading HDR header")?;
    let image = image::DynamicImage::from_decoder(decoder).context("decoding HDR")?;
    let rgb = image.to_rgb32f();
    let (width, height) = rgb.dimensions();
    let pixels = rgb
        .pixels()
        .flat_map(|p| pack_rgbe([p.0[0], p.0[1], p.0[2]]))
        .collect();
    Ok(DecodedImage {
        width,
        height,
        pixels,
        space: ColorSpace::Rgbe,
    })
}

/// Packs a linear color so that `byte/255 * 2^(a*255 - 128)` recovers it.
pub fn pack_rgbe(rgb: [f32; 3]) -> [u8; 4] {
    let max = rgb[0].max(rgb[1]).max(rgb[2]);
    if !max.is_finite() || max <= 1e-32 {
        return [0; 4];
    }
    let exponent = (max.log2().floor() as i32 + 1).clamp(-128, 127);
    let scale = 255.0 / 2f32.powi(exponent);
    let channel = |v: f32| (v.max(0.0) * scale).round().min(255.0) as u8;
    [
        channel(rgb[0]),
        channel(rgb[1]),
        channel(rgb[2]),
        (exponent + 128) as u8,
    ]
}

pub type ChannelResult = (usize, Result<DecodedImage>);

/// Decodes channel images on worker threads.
pub struct ChannelLoader {
    sender: Sender<ChannelResult>,
    receiver: Receiver<ChannelResult>,
}

impl Default for ChannelLoader {
    fn default() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }
}

impl ChannelLoader {
    pub fn spawn(&self, index: usize, bytes: Vec<u8>) {
        let sender = self.sender.clone();
        std::thread::spawn(move || {
            let result = decode(&bytes);
            if let Ok(image) = &result {
                info!(
                    "decoded channel{} ({}x{}, {:?})",
                    index, image.width, image.height, image.space
                );
            }
            // The engine may be gone by now.
            let _ = sender.send((index, result));
        });
    }

    /// Every decode finished since the last call.
    pub fn drain(&self) -> Vec<ChannelResult> {
        let results: Vec<_> = self.receiver.try_iter().collect();
        if !results.is_empty() {
            debug!("{} channel decodes ready", results.len());
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unpack(rgbe: [u8; 4]) -> [f32; 3] {
        let scale = 2f32.powi(rgbe[3] as i32 - 128) / 255.0;
        [
            rgbe[0] as f32 * scale,
            rgbe[1] as f32 * scale,
            rgbe[2] as f32 * scale,
        ]
    }

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(3, 2, image::Rgba([10, 20, 30, 255]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn rgbe_packing_matches_the_blit_decoder() {
        assert_eq!(pack_rgbe([0.0, 0.0, 0.0]), [0, 0, 0, 0]);
        for color in [[1.0, 0.5, 0.25], [12.5, 3.0, 0.0], [0.01, 0.02, 0.004]] {
            let back = unpack(pack_rgbe(color));
            let max = color.iter().cloned().fold(0.0f32, f32::max);
            for (a, b) in color.iter().zip(back) {
                assert!((a - b).abs() <= max / 200.0, "{color:?} -> {back:?}");
            }
        }
    }

    #[test]
    fn png_decodes_as_srgb_texels() {
        let image = decode(&png_bytes()).unwrap();
        assert_eq!((image.width, image.height), (3, 2));
        assert_eq!(image.space, ColorSpace::Linear);
        assert_eq!(&image.pixels[..4], &[10, 20, 30, 255]);
        assert_eq!(image.channel_format(), wgpu::TextureFormat::Rgba8UnormSrgb);
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(decode(b"not an image").is_err());
        assert!(decode(b"#?RADIANCE\nbroken").is_err());
    }

    #[test]
    fn oversized_image_fails_to_upload() {
        let Some(gpu) = crate::gpu::test_gpu() else {
            return;
        };
        let width = gpu.device.limits().max_texture_dimension_2d + 1;
        let image = DecodedImage {
            width,
            height: 1,
            pixels: vec![0; width as usize * 4],
            space: ColorSpace::Linear,
        };
        let err = image
            .upload(&gpu.device, &gpu.queue, "channel0")
            .unwrap_err();
        assert!(err.to_string().contains("at most"), "{err:#}");

        let small = decode(&png_bytes()).unwrap();
        let texture = small.upload(&gpu.device, &gpu.queue, "channel1").unwrap();
        assert_eq!((texture.width(), texture.height()), (3, 2));
        assert_eq!(texture.mip_level_count(), 2);
    }

    #[test]
    fn loader_reports_results_off_thread() {
        let loader = ChannelLoader::default();
        loader.spawn(1, png_bytes());
        loader.spawn(0, b"junk".to_vec());
        let mut results = Vec::new();
        for _ in 0..200 {
            results.extend(loader.drain());
            if results.len() == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        results.sort_by_key(|(index, _)| *index);
        assert_eq!(results.len(), 2);
        assert!(results[0].1.is_err());
        assert_eq!(results[1].1.as_ref().unwrap().width, 3);
    }
}
