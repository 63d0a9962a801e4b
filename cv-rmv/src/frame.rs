//! Image buffer helpers: pixel format conversion, smoothing and the 2x pyramid step.

use image::{DynamicImage, GrayImage, Luma};

/// Converts any frame into an 8 bit grayscale frame with the origin in the upper left corner.
pub fn to_gray(frame: &DynamicImage) -> GrayImage {
    match frame {
        DynamicImage::ImageLuma8(gray) => gray.clone(),
        other => other.to_luma8(),
    }
}

/// Applies a small Gaussian filter, roughly a 3x3 kernel.
pub fn smooth(frame: &GrayImage) -> GrayImage {
    imageproc::filter::gaussian_blur_f32(frame, 0.85)
}

/// Halves both dimensions of the frame by averaging 2x2 pixel blocks.
///
/// An odd last row or column is dropped. Returns `None` if the frame is smaller than 2x2.
pub fn downsample_by_two(frame: &GrayImage) -> Option<GrayImage> {
    let (width, height) = (frame.width() / 2, frame.height() / 2);
    if width == 0 || height == 0 {
        return None;
    }
    Some(GrayImage::from_fn(width, height, |x, y| {
        let sum: u32 = [(0, 0), (1, 0), (0, 1), (1, 1)]
            .iter()
            .map(|&(dx, dy)| frame.get_pixel(x * 2 + dx, y * 2 + dy)[0] as u32)
            .sum();
        Luma([((sum + 2) / 4) as u8])
    }))
}

/// Halves the frame until it has the requested size.
///
/// Returns `None` if the requested size is not reachable by repeated halving.
pub fn downsample_to(frame: &GrayImage, width: u32, height: u32) -> Option<GrayImage> {
    let mut current = frame.clone();
    while current.width() != width || current.height() != height {
        if current.width() < width * 2 || current.height() < height * 2 {
            return None;
        }
        current = downsample_by_two(&current)?;
    }
    Some(current)
}
