//! Image decode and downscale helpers

use anyhow::Result;
use image::DynamicImage;

/// Decode image from bytes (JPEG, PNG, etc.)
pub fn decode_image(data: &[u8]) -> Result<DynamicImage> {
    let img = image::load_from_memory(data)?;
    Ok(img)
}

/// Downscale an image so neither side exceeds `max_dim`, preserving aspect
/// ratio. Images already within bounds are returned unchanged.
pub fn downscale(image: DynamicImage, max_dim: u32) -> DynamicImage {
    if image.width() <= max_dim && image.height() <= max_dim {
        return image;
    }
    image.resize(max_dim, max_dim, image::imageops::FilterType::Lanczos3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::new_rgb8(width, height);
        let mut buffer = Cursor::new(Vec::new());
        img.write_to(&mut buffer, image::ImageFormat::Png).unwrap();
        buffer.into_inner()
    }

    #[test]
    fn test_decode_valid_png() {
        let img = decode_image(&png_bytes(12, 8)).unwrap();
        assert_eq!(img.width(), 12);
        assert_eq!(img.height(), 8);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_image(b"definitely not an image").is_err());
    }

    #[test]
    fn test_downscale_large_image() {
        let img = DynamicImage::new_rgb8(200, 100);
        let small = downscale(img, 50);
        assert!(small.width() <= 50 && small.height() <= 50);
        // Aspect ratio preserved
        assert_eq!(small.width(), 50);
        assert_eq!(small.height(), 25);
    }

    #[test]
    fn test_downscale_small_image_untouched() {
        let img = DynamicImage::new_rgb8(40, 30);
        let same = downscale(img, 50);
        assert_eq!((same.width(), same.height()), (40, 30));
    }
}
