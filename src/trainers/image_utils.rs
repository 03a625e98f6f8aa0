//! Tensor-to-image helpers for debug output during training.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Tensor};
use std::path::Path;

/// Save a CHW tensor in [-1, 1] as an RGB image. Single-channel tensors are
/// broadcast to gray RGB.
pub fn save_image<P: AsRef<Path>>(tensor: &Tensor, path: P) -> Result<()> {
    let tensor = ((tensor.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?;
    let tensor = tensor.to_dtype(DType::U8)?;

    let (channel, height, width) = tensor.dims3().context("expected 3D tensor [C, H, W]")?;
    let tensor = match channel {
        3 => tensor,
        1 => Tensor::cat(&[&tensor, &tensor, &tensor], 0)?,
        _ => bail!("expected 1 or 3 channels, got {channel}"),
    };

    // CHW to HWC for the image crate.
    let tensor = tensor.permute((1, 2, 0))?;
    let data = tensor.flatten_all()?.to_vec1::<u8>()?;

    let img =
        image::ImageBuffer::<image::Rgb<u8>, Vec<u8>>::from_raw(width as u32, height as u32, data)
            .context("failed to create image buffer")?;

    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    img.save_with_format(path, image::ImageFormat::Png)?;
    Ok(())
}

/// Save every sample of a BCHW batch as `<dir>/<prefix>-<sample>.png`.
pub fn save_batch_images(batch: &Tensor, dir: &Path, prefix: &str) -> Result<Vec<std::path::PathBuf>> {
    let (b, _, _, _) = batch.dims4().context("expected 4D tensor [B, C, H, W]")?;
    let mut written = Vec::with_capacity(b);
    for i in 0..b {
        let sample = batch.narrow(0, i, 1)?.squeeze(0)?;
        let path = dir.join(format!("{prefix}-{i}.png"));
        save_image(&sample, &path)?;
        written.push(path);
    }
    Ok(written)
}
