//! Debug artifact persistence
//!
//! Writes decoded intermediates and prompt text under
//! `<debug_dir>/training_batches`, namespaced by global step and a fixed
//! ordinal prefix per artifact kind. Pure side effect; nothing here feeds
//! back into training state.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use std::fs;
use std::path::{Path, PathBuf};

pub struct DebugWriter {
    base_dir: PathBuf,
}

impl DebugWriter {
    pub fn new<P: AsRef<Path>>(debug_dir: P) -> Self {
        Self {
            base_dir: debug_dir.as_ref().join("training_batches"),
        }
    }

    /// Save an image batch, `[batch, 3, H, W]` in [-1, 1], one PNG per
    /// element: `<step>-<name>-<index>.png`.
    pub fn save_image_batch(&self, images: &Tensor, name: &str, global_step: u64) -> Result<()> {
        fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("Failed to create debug directory {:?}", self.base_dir))?;

        let batch_size = images.dim(0)?;
        for i in 0..batch_size {
            let image = images.narrow(0, i, 1)?.squeeze(0)?;
            let path = self
                .base_dir
                .join(format!("{:07}-{}-{}.png", global_step, name, i));
            save_image(&image, &path)?;
        }
        Ok(())
    }

    /// Save decoded prompt text: `<step>-<name>.txt`, one line per element.
    pub fn save_text(&self, lines: &[String], name: &str, global_step: u64) -> Result<()> {
        fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("Failed to create debug directory {:?}", self.base_dir))?;

        let path = self
            .base_dir
            .join(format!("{:07}-{}.txt", global_step, name));
        fs::write(&path, lines.join("\n"))
            .with_context(|| format!("Failed to write debug text {:?}", path))?;
        Ok(())
    }
}

/// Save a `[3, H, W]` tensor in [-1, 1] as a PNG.
fn save_image(tensor: &Tensor, path: &Path) -> Result<()> {
    let tensor = ((tensor.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?;
    let tensor = if tensor.device().is_cuda() {
        tensor.to_device(&Device::Cpu)?
    } else {
        tensor
    };
    let tensor = tensor.to_dtype(DType::U8)?;

    let (channels, height, width) = tensor
        .dims3()
        .context("Expected 3D tensor [C, H, W] for image saving")?;
    if channels != 3 {
        anyhow::bail!("Expected 3 channels (RGB), got {}", channels);
    }

    // CHW to HWC for the image crate
    let tensor = tensor.permute((1, 2, 0))?;
    let data = tensor.flatten_all()?.to_vec1::<u8>()?;

    let img = image::ImageBuffer::<image::Rgb<u8>, Vec<u8>>::from_raw(
        width as u32,
        height as u32,
        data,
    )
    .context("Failed to create image buffer")?;
    img.save_with_format(path, image::ImageFormat::Png)?;
    Ok(())
}
