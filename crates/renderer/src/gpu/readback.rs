use half::f16;

use crate::device::{DeviceError, PixelBuffer, TextureDesc, TextureFormat};

fn bytes_per_texel(format: TextureFormat) -> Result<u32, DeviceError> {
    match format {
        TextureFormat::Rgba8Unorm | TextureFormat::R32Uint => Ok(4),
        TextureFormat::Rgba16Float => Ok(8),
        TextureFormat::R16Float => Ok(2),
        TextureFormat::Depth32Float => Err(DeviceError::Unsupported(
            "depth textures cannot be read back".into(),
        )),
    }
}

fn padded_row_bytes(unpadded: u32) -> u32 {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

fn decode_texel(format: TextureFormat, bytes: &[u8]) -> [f32; 4] {
    let half_at = |index: usize| {
        f16::from_le_bytes([bytes[index * 2], bytes[index * 2 + 1]]).to_f32()
    };
    match format {
        TextureFormat::Rgba8Unorm => [
            f32::from(bytes[0]) / 255.0,
            f32::from(bytes[1]) / 255.0,
            f32::from(bytes[2]) / 255.0,
            f32::from(bytes[3]) / 255.0,
        ],
        TextureFormat::Rgba16Float => [half_at(0), half_at(1), half_at(2), half_at(3)],
        TextureFormat::R16Float => [half_at(0), 0.0, 0.0, 1.0],
        TextureFormat::R32Uint => {
            let value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            [value as f32, 0.0, 0.0, 1.0]
        }
        TextureFormat::Depth32Float => [0.0; 4],
    }
}

/// Copies a single-sample texture into a mappable buffer and decodes it.
/// Blocks until the copy has finished.
pub(crate) fn read_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
    desc: &TextureDesc,
) -> Result<PixelBuffer, DeviceError> {
    if desc.sample_count != 1 {
        return Err(DeviceError::Unsupported(format!(
            "`{}` is multisampled and cannot be read back",
            desc.label
        )));
    }
    let texel_bytes = bytes_per_texel(desc.format)?;
    let row_bytes = desc.width * texel_bytes;
    let padded = padded_row_bytes(row_bytes);

    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("readback"),
        size: u64::from(padded) * u64::from(desc.height),
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("readback"),
    });
    encoder.copy_texture_to_buffer(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyBufferInfo {
            buffer: &buffer,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded),
                rows_per_image: Some(desc.height),
            },
        },
        wgpu::Extent3d {
            width: desc.width,
            height: desc.height,
            depth_or_array_layers: 1,
        },
    );
    queue.submit(Some(encoder.finish()));

    let slice = buffer.slice(..);
    let (sender, receiver) = crossbeam_channel::bounded(1);
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    device
        .poll(wgpu::PollType::Wait)
        .map_err(|err| DeviceError::Lost(format!("poll during readback: {err}")))?;
    receiver
        .recv()
        .map_err(|_| DeviceError::Lost("readback callback dropped".into()))?
        .map_err(|err| DeviceError::Invalid(format!("map `{}`: {err}", desc.label)))?;

    let mut pixels = Vec::with_capacity(desc.width as usize * desc.height as usize);
    {
        let mapped = slice.get_mapped_range();
        for row in mapped.chunks_exact(padded as usize) {
            pixels.extend(
                row[..row_bytes as usize]
                    .chunks_exact(texel_bytes as usize)
                    .map(|texel| decode_texel(desc.format, texel)),
            );
        }
    }
    buffer.unmap();

    Ok(PixelBuffer {
        width: desc.width,
        height: desc.height,
        pixels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_pad_to_copy_alignment() {
        assert_eq!(padded_row_bytes(4), 256);
        assert_eq!(padded_row_bytes(256), 256);
        assert_eq!(padded_row_bytes(260), 512);
    }

    #[test]
    fn half_float_texels_decode() {
        let mut bytes = Vec::new();
        for value in [0.5f32, 0.25, 1.0, 0.0] {
            bytes.extend(f16::from_f32(value).to_le_bytes());
        }
        assert_eq!(
            decode_texel(TextureFormat::Rgba16Float, &bytes),
            [0.5, 0.25, 1.0, 0.0]
        );
        assert_eq!(
            decode_texel(TextureFormat::R16Float, &bytes[..2]),
            [0.5, 0.0, 0.0, 1.0]
        );
        assert_eq!(
            decode_texel(TextureFormat::Rgba8Unorm, &[255, 0, 51, 255]),
            [1.0, 0.0, 0.2, 1.0]
        );
    }

    #[test]
    fn depth_is_not_readable() {
        assert!(bytes_per_texel(TextureFormat::Depth32Float).is_err());
    }
}
