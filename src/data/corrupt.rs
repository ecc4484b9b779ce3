//! Fixed-magnitude pixel corruption

use super::source::PixelRange;
use ndarray::Array4;
use rand::Rng;

/// Salt-and-pepper noise
///
/// One uniform draw per pixel location is shared across channels. With
/// `u >= 1 - rate / 2` the pixel is set to the maximum intensity, with
/// `u < rate / 2` to the minimum. The total flip probability is `rate`.
pub fn salt_and_pepper<R: Rng>(
    images: &Array4<f32>,
    rate: f32,
    range: PixelRange,
    rng: &mut R,
) -> Array4<f32> {
    let mut out = images.clone();
    let (n, h, w, _) = images.dim();
    let half = rate / 2.0;
    for i in 0..n {
        for y in 0..h {
            for x in 0..w {
                let u: f32 = rng.random();
                let value = if u >= 1.0 - half {
                    range.max
                } else if u < half {
                    range.min
                } else {
                    continue;
                };
                out.slice_mut(ndarray::s![i, y, x, ..]).fill(value);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_zero_rate_is_identity() {
        let images = Array4::from_elem((2, 4, 4, 3), 100.0f32);
        let mut rng = StdRng::seed_from_u64(7);
        let out = salt_and_pepper(&images, 0.0, PixelRange::default(), &mut rng);
        assert_eq!(out, images);
    }

    #[test]
    fn test_flip_rate_and_polarity_split() {
        let images = Array4::from_elem((4, 32, 32, 3), 128.0f32);
        let mut rng = StdRng::seed_from_u64(42);
        let out = salt_and_pepper(&images, 0.2, PixelRange::default(), &mut rng);

        let locations = (4 * 32 * 32) as f32;
        let salt = out.iter().filter(|&&v| v == 255.0).count() as f32 / 3.0;
        let pepper = out.iter().filter(|&&v| v == 0.0).count() as f32 / 3.0;
        assert!(((salt + pepper) / locations - 0.2).abs() < 0.03);
        assert!((salt / locations - 0.1).abs() < 0.02);
        assert!((pepper / locations - 0.1).abs() < 0.02);
    }

    #[test]
    fn test_channels_flip_together() {
        let images = Array4::from_elem((1, 16, 16, 3), 50.0f32);
        let mut rng = StdRng::seed_from_u64(3);
        let out = salt_and_pepper(&images, 0.5, PixelRange::default(), &mut rng);
        for y in 0..16 {
            for x in 0..16 {
                let px: ndarray::ArrayView1<f32> = out.slice(ndarray::s![0, y, x, ..]);
                assert!(px.iter().all(|&v| v == px[0]));
            }
        }
    }
}
