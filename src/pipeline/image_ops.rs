//! Pixel-space helpers for CHW f32 tensors: decode, encode, and the geometric
//! primitives the augmentation and cropping modules build on.

use candle_core::{DType, Device, Tensor};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Rgb};
use std::path::Path;

use super::PipelineError;

type GrayF32Image = ImageBuffer<Luma<f32>, Vec<f32>>;
type RgbF32Image = ImageBuffer<Rgb<f32>, Vec<f32>>;

/// View a single-channel CHW tensor as an f32 image buffer.
fn gray_buffer(tensor: &Tensor, w: usize, h: usize) -> Result<GrayF32Image, PipelineError> {
    let data = tensor.flatten_all()?.to_vec1::<f32>()?;
    GrayF32Image::from_raw(w as u32, h as u32, data)
        .ok_or_else(|| PipelineError::Config("pixel buffer does not match dimensions".into()))
}

/// View a three-channel CHW tensor as an interleaved f32 image buffer.
fn rgb_buffer(tensor: &Tensor, w: usize, h: usize) -> Result<RgbF32Image, PipelineError> {
    let data = tensor
        .permute((1, 2, 0))?
        .contiguous()?
        .flatten_all()?
        .to_vec1::<f32>()?;
    RgbF32Image::from_raw(w as u32, h as u32, data)
        .ok_or_else(|| PipelineError::Config("pixel buffer does not match dimensions".into()))
}

fn gray_to_chw(buffer: GrayF32Image, device: &Device) -> Result<Tensor, PipelineError> {
    let (w, h) = (buffer.width() as usize, buffer.height() as usize);
    Ok(Tensor::from_vec(buffer.into_raw(), (1, h, w), device)?)
}

fn rgb_to_chw(buffer: RgbF32Image, device: &Device) -> Result<Tensor, PipelineError> {
    let (w, h) = (buffer.width() as usize, buffer.height() as usize);
    Ok(Tensor::from_vec(buffer.into_raw(), (h, w, 3), device)?
        .permute((2, 0, 1))?
        .contiguous()?)
}

/// Decode an image file into a CHW f32 tensor with values mapped linearly
/// into `[range_min, range_max]`. `channels` must be 1 (grayscale) or 3 (RGB).
pub fn load_image_tensor(
    path: &Path,
    range_min: f32,
    range_max: f32,
    channels: usize,
    device: &Device,
) -> Result<Tensor, PipelineError> {
    let img = image::open(path).map_err(|source| PipelineError::ImageLoad {
        path: path.to_path_buf(),
        source,
    })?;

    let scale = (range_max - range_min) / 255.0;
    let (data, h, w) = match channels {
        1 => {
            let img = img.to_luma8();
            let (w, h) = (img.width() as usize, img.height() as usize);
            let data: Vec<f32> = img.as_raw().iter().map(|&v| v as f32 * scale + range_min).collect();
            (data, h, w)
        }
        3 => {
            let img = img.to_rgb8();
            let (w, h) = (img.width() as usize, img.height() as usize);
            // Interleaved HWC u8 to planar CHW f32.
            let raw = img.as_raw();
            let mut data = vec![0f32; 3 * h * w];
            for y in 0..h {
                for x in 0..w {
                    for c in 0..3 {
                        data[c * h * w + y * w + x] =
                            raw[(y * w + x) * 3 + c] as f32 * scale + range_min;
                    }
                }
            }
            (data, h, w)
        }
        other => {
            return Err(PipelineError::Config(format!(
                "unsupported channel count {other} for image loading"
            )))
        }
    };

    Ok(Tensor::from_vec(data, (channels, h, w), device)?)
}

/// Save a CHW f32 tensor as a PNG, mapping `[range_min, range_max]` to u8.
pub fn save_image_tensor(
    tensor: &Tensor,
    range_min: f32,
    range_max: f32,
    path: &Path,
) -> Result<(), PipelineError> {
    let (c, h, w) = tensor.dims3()?;
    let data = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    let scale = 255.0 / (range_max - range_min);
    let to_u8 = |v: f32| ((v - range_min) * scale).clamp(0.0, 255.0) as u8;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }

    let result = match c {
        1 => {
            let pixels: Vec<u8> = data.iter().map(|&v| to_u8(v)).collect();
            image::GrayImage::from_raw(w as u32, h as u32, pixels)
                .expect("buffer length matches dimensions")
                .save(path)
        }
        3 => {
            let mut pixels = vec![0u8; h * w * 3];
            for y in 0..h {
                for x in 0..w {
                    for ch in 0..3 {
                        pixels[(y * w + x) * 3 + ch] = to_u8(data[ch * h * w + y * w + x]);
                    }
                }
            }
            image::RgbImage::from_raw(w as u32, h as u32, pixels)
                .expect("buffer length matches dimensions")
                .save(path)
        }
        other => {
            return Err(PipelineError::Config(format!(
                "cannot save tensor with {other} channels as an image"
            )))
        }
    };

    result.map_err(|source| PipelineError::ImageSave {
        path: path.to_path_buf(),
        source,
    })
}

/// Bilinear resize of a CHW tensor to `(out_w, out_h)`.
pub fn resize_chw(tensor: &Tensor, out_w: usize, out_h: usize) -> Result<Tensor, PipelineError> {
    let (c, h, w) = tensor.dims3()?;
    if (w, h) == (out_w, out_h) {
        return Ok(tensor.clone());
    }
    let device = tensor.device().clone();
    match c {
        1 => {
            let buffer = gray_buffer(tensor, w, h)?;
            let resized =
                imageops::resize(&buffer, out_w as u32, out_h as u32, FilterType::Triangle);
            gray_to_chw(resized, &device)
        }
        3 => {
            let buffer = rgb_buffer(tensor, w, h)?;
            let resized =
                imageops::resize(&buffer, out_w as u32, out_h as u32, FilterType::Triangle);
            rgb_to_chw(resized, &device)
        }
        other => Err(PipelineError::Config(format!(
            "unsupported channel count {other} for resize"
        ))),
    }
}

/// Crop a CHW tensor to the box starting at `(x, y)` with size `(crop_w, crop_h)`.
pub fn crop_chw(
    tensor: &Tensor,
    x: usize,
    y: usize,
    crop_w: usize,
    crop_h: usize,
) -> Result<Tensor, PipelineError> {
    let (_, h, w) = tensor.dims3()?;
    if x + crop_w > w || y + crop_h > h {
        return Err(PipelineError::Config(format!(
            "crop box {crop_w}x{crop_h}+{x}+{y} exceeds image {w}x{h}"
        )));
    }
    Ok(tensor.narrow(1, y, crop_h)?.narrow(2, x, crop_w)?.contiguous()?)
}

/// Rotate a CHW tensor around its center by `angle_deg` degrees, nearest
/// neighbor, out-of-frame pixels filled with `fill`.
pub fn rotate_chw(tensor: &Tensor, angle_deg: f32, fill: f32) -> Result<Tensor, PipelineError> {
    if angle_deg == 0.0 {
        return Ok(tensor.clone());
    }
    let (c, h, w) = tensor.dims3()?;
    let data = tensor.flatten_all()?.to_vec1::<f32>()?;
    let mut out = vec![fill; c * h * w];

    let angle = angle_deg.to_radians();
    let (sin, cos) = angle.sin_cos();
    let cx = (w as f32 - 1.0) / 2.0;
    let cy = (h as f32 - 1.0) / 2.0;

    for oy in 0..h {
        for ox in 0..w {
            // Inverse mapping: output pixel pulled from the source location.
            let dx = ox as f32 - cx;
            let dy = oy as f32 - cy;
            let sx = (cx + cos * dx + sin * dy).round();
            let sy = (cy - sin * dx + cos * dy).round();
            if sx < 0.0 || sy < 0.0 || sx >= w as f32 || sy >= h as f32 {
                continue;
            }
            let (sx, sy) = (sx as usize, sy as usize);
            for ch in 0..c {
                out[ch * h * w + oy * w + ox] = data[ch * h * w + sy * w + sx];
            }
        }
    }

    Ok(Tensor::from_vec(out, (c, h, w), tensor.device())?)
}

/// Horizontal flip of a CHW tensor.
pub fn flip_horizontal_chw(tensor: &Tensor) -> Result<Tensor, PipelineError> {
    let (c, h, w) = tensor.dims3()?;
    let device = tensor.device().clone();
    match c {
        1 => gray_to_chw(imageops::flip_horizontal(&gray_buffer(tensor, w, h)?), &device),
        3 => rgb_to_chw(imageops::flip_horizontal(&rgb_buffer(tensor, w, h)?), &device),
        other => Err(PipelineError::Config(format!(
            "unsupported channel count {other} for flip"
        ))),
    }
}
