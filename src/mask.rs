use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use ndarray::prelude::*;

use crate::errors::{Result, SamSegError};

const ON: u8 = u8::MAX;
const OFF: u8 = 0;

/// Renders `[num_masks, height, width]` binary masks as one image, one channel per mask.
///
/// A single mask becomes a grayscale image, three candidate masks (the usual
/// multimask output) an RGB image, four an RGBA image.
pub fn masks_to_image(masks: ArrayView3<bool>) -> Result<DynamicImage> {
    let (channels, height, width) = masks.dim();
    let (w, h) = (width as u32, height as u32);
    let value = |c: usize, x: u32, y: u32| {
        if masks[[c, y as usize, x as usize]] {
            ON
        } else {
            OFF
        }
    };

    let image = match channels {
        1 => DynamicImage::ImageLuma8(GrayImage::from_fn(w, h, |x, y| {
            image::Luma([value(0, x, y)])
        })),
        3 => DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
            image::Rgb([value(0, x, y), value(1, x, y), value(2, x, y)])
        })),
        4 => DynamicImage::ImageRgba8(RgbaImage::from_fn(w, h, |x, y| {
            image::Rgba([
                value(0, x, y),
                value(1, x, y),
                value(2, x, y),
                value(3, x, y),
            ])
        })),
        n => {
            return Err(SamSegError::inference(
                "mask rendering",
                format!("cannot render {} candidate masks as one image", n),
            ))
        }
    };

    Ok(image)
}
