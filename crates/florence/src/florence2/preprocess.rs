use image::{DynamicImage, RgbImage};
use ndarray::Array4;

pub const IMAGE_SIZE: u32 = 768;

const IMAGE_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGE_STD: [f32; 3] = [0.229, 0.224, 0.225];
const RESCALE_FACTOR: f32 = 1.0 / 255.0;

pub fn load_image(data: &[u8]) -> anyhow::Result<DynamicImage> {
    let image = image::ImageReader::new(std::io::Cursor::new(data))
        .with_guessed_format()?
        .decode()?;
    Ok(image)
}

/// Resize to a square 768x768 (no crop), rescale and normalize.
/// Returns `pixel_values` shaped `[1, 3, 768, 768]`.
pub fn preprocess_image(image: &DynamicImage) -> Array4<f32> {
    preprocess_rgb8_image(&image.to_rgb8())
}

pub fn preprocess_rgb8_image(image: &RgbImage) -> Array4<f32> {
    let image = image::imageops::resize(
        image,
        IMAGE_SIZE,
        IMAGE_SIZE,
        image::imageops::FilterType::CatmullRom,
    );

    let size = IMAGE_SIZE as usize;
    let mut array = Array4::zeros((1, 3, size, size));

    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            array[[0, c, y as usize, x as usize]] =
                (pixel[c] as f32 * RESCALE_FACTOR - IMAGE_MEAN[c]) / IMAGE_STD[c];
        }
    }

    array
}

#[cfg(test)]
mod test {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_output_shape_ignores_aspect_ratio() {
        let image = RgbImage::from_pixel(40, 10, Rgb([0, 0, 0]));
        let pixel_values = preprocess_rgb8_image(&image);

        assert_eq!(pixel_values.shape(), &[1, 3, 768, 768]);
    }

    #[test]
    fn test_normalization() {
        let image = RgbImage::from_pixel(16, 16, Rgb([255, 0, 128]));
        let pixel_values = preprocess_rgb8_image(&image);

        let expect = |value: f32, c: usize| (value / 255.0 - IMAGE_MEAN[c]) / IMAGE_STD[c];
        assert!((pixel_values[[0, 0, 100, 200]] - expect(255.0, 0)).abs() < 1e-4);
        assert!((pixel_values[[0, 1, 767, 0]] - expect(0.0, 1)).abs() < 1e-4);
        assert!((pixel_values[[0, 2, 384, 384]] - expect(128.0, 2)).abs() < 1e-4);
    }

    #[test]
    fn test_load_image_from_bytes() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 2, Rgb([1, 2, 3])));
        let mut data = std::io::Cursor::new(vec![]);
        image.write_to(&mut data, image::ImageFormat::Png).unwrap();

        let loaded = load_image(data.get_ref()).unwrap();
        assert_eq!((loaded.width(), loaded.height()), (3, 2));
        assert!(load_image(b"not an image").is_err());
    }
}
