//! Frame type and image utilities — luma conversion, downscaling, quality
//! metrics consumed by the pipeline and the enrollment gates.

/// A captured grayscale camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u64,
}

impl Frame {
    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    /// Variance of the 3×3 Laplacian response: a sharpness metric. Blurry
    /// frames score low; the enrollment gates reject them.
    pub fn laplacian_variance(&self) -> f32 {
        let w = self.width as usize;
        let h = self.height as usize;
        if w < 3 || h < 3 || self.data.len() < w * h {
            return 0.0;
        }

        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        let n = ((w - 2) * (h - 2)) as f64;

        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let center = self.data[y * w + x] as f64;
                let response = self.data[(y - 1) * w + x] as f64
                    + self.data[(y + 1) * w + x] as f64
                    + self.data[y * w + x - 1] as f64
                    + self.data[y * w + x + 1] as f64
                    - 4.0 * center;
                sum += response;
                sum_sq += response * response;
            }
        }

        let mean = sum / n;
        (sum_sq / n - mean * mean) as f32
    }

    /// Bilinear downscale by a factor in (0, 1]; used to bound detection
    /// cost. Factors at or above 1 return a clone.
    pub fn downscaled(&self, factor: f32) -> Frame {
        if factor >= 1.0 {
            return self.clone();
        }
        let w = self.width as usize;
        let h = self.height as usize;
        let new_w = ((w as f32 * factor).round() as usize).max(1);
        let new_h = ((h as f32 * factor).round() as usize).max(1);

        let x_ratio = w as f32 / new_w as f32;
        let y_ratio = h as f32 / new_h as f32;

        let mut out = vec![0u8; new_w * new_h];
        for y in 0..new_h {
            let src_y = (y as f32 + 0.5) * y_ratio - 0.5;
            let y0 = (src_y.floor() as i32).clamp(0, h as i32 - 1) as usize;
            let y1 = (y0 + 1).min(h - 1);
            let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

            for x in 0..new_w {
                let src_x = (x as f32 + 0.5) * x_ratio - 0.5;
                let x0 = (src_x.floor() as i32).clamp(0, w as i32 - 1) as usize;
                let x1 = (x0 + 1).min(w - 1);
                let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

                let tl = self.data[y0 * w + x0] as f32;
                let tr = self.data[y0 * w + x1] as f32;
                let bl = self.data[y1 * w + x0] as f32;
                let br = self.data[y1 * w + x1] as f32;

                let val = tl * (1.0 - fx) * (1.0 - fy)
                    + tr * fx * (1.0 - fy)
                    + bl * (1.0 - fx) * fy
                    + br * fx * fy;

                out[y * new_w + x] = val.round().clamp(0.0, 255.0) as u8;
            }
        }

        Frame {
            data: out,
            width: new_w as u32,
            height: new_h as u32,
            timestamp: self.timestamp,
            sequence: self.sequence,
        }
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Convert packed RGB24 to grayscale with the BT.601 luma weights.
pub fn rgb_to_grayscale(rgb: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = (width * height) as usize;
    let expected = pixels * 3;
    if rgb.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: rgb.len(),
        });
    }
    Ok(rgb[..expected]
        .chunks_exact(3)
        .map(|p| {
            (0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
                .round()
                .clamp(0.0, 255.0) as u8
        })
        .collect())
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(data: Vec<u8>, width: u32, height: u32) -> Frame {
        Frame {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence: 0,
        }
    }

    #[test]
    fn yuyv_extracts_y_channel() {
        let yuyv = vec![100, 128, 200, 128];
        assert_eq!(yuyv_to_grayscale(&yuyv, 2, 1).unwrap(), vec![100, 200]);
    }

    #[test]
    fn yuyv_rejects_short_buffer() {
        assert!(yuyv_to_grayscale(&[100, 128], 2, 1).is_err());
    }

    #[test]
    fn rgb_luma_weights() {
        // Pure green: 0.587 * 255 ≈ 150
        let gray = rgb_to_grayscale(&[0, 255, 0], 1, 1).unwrap();
        assert_eq!(gray, vec![150]);
        assert!(rgb_to_grayscale(&[0, 255], 1, 1).is_err());
    }

    #[test]
    fn brightness_average() {
        let f = frame(vec![100, 200], 2, 1);
        assert!((f.avg_brightness() - 150.0).abs() < 1e-6);
        assert_eq!(frame(vec![], 0, 0).avg_brightness(), 0.0);
    }

    #[test]
    fn flat_frame_has_zero_laplacian_variance() {
        let f = frame(vec![120u8; 16 * 16], 16, 16);
        assert!(f.laplacian_variance() < 1e-6);
    }

    #[test]
    fn edges_raise_laplacian_variance() {
        // Vertical step edge down the middle.
        let w = 16usize;
        let data: Vec<u8> = (0..w * w)
            .map(|i| if i % w < w / 2 { 0 } else { 255 })
            .collect();
        let f = frame(data, w as u32, w as u32);
        assert!(f.laplacian_variance() > 100.0);
    }

    #[test]
    fn downscale_dimensions_and_uniformity() {
        let f = frame(vec![90u8; 64 * 48], 64, 48);
        let small = f.downscaled(0.25);
        assert_eq!((small.width, small.height), (16, 12));
        assert!(small.data.iter().all(|&p| p == 90));

        let same = f.downscaled(1.0);
        assert_eq!((same.width, same.height), (64, 48));
    }
}
