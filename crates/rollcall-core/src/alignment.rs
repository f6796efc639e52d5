//! Face alignment via 4-DOF similarity transform.
//!
//! Detected faces are warped to the canonical 112×112 ArcFace position using
//! the five InsightFace reference landmarks and a least-squares estimate of
//! scale, rotation and translation.

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// Side length of the aligned output crop.
pub const ALIGNED_SIZE: usize = 112;

/// A 4-DOF similarity transform (uniform scale, rotation, translation).
///
/// Stored as the 2×3 row-major matrix
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
#[derive(Debug, Clone, Copy)]
pub struct SimilarityTransform {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl SimilarityTransform {
    /// Least-squares estimate mapping `src` landmarks onto `dst` landmarks.
    ///
    /// Builds the overdetermined system from the five point pairs and solves
    /// the 4×4 normal equations by Gaussian elimination. A degenerate system
    /// falls back to the identity transform.
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        // For each pair (sx, sy) -> (dx, dy):
        //   sx * a - sy * b + tx = dx
        //   sy * a + sx * b + ty = dy
        let mut ata = [0.0f32; 16];
        let mut atb = [0.0f32; 4];

        for i in 0..5 {
            let (sx, sy) = src[i];
            let (dx, dy) = dst[i];
            let r1 = [sx, -sy, 1.0, 0.0];
            let r2 = [sy, sx, 0.0, 1.0];

            for j in 0..4 {
                for k in 0..4 {
                    ata[j * 4 + k] += r1[j] * r1[k] + r2[j] * r2[k];
                }
                atb[j] += r1[j] * dx + r2[j] * dy;
            }
        }

        match solve_4x4(&ata, &atb) {
            Some([a, b, tx, ty]) => Self { a, b, tx, ty },
            None => Self {
                a: 1.0,
                b: 0.0,
                tx: 0.0,
                ty: 0.0,
            },
        }
    }

    /// Uniform scale factor of the transform.
    pub fn scale(&self) -> f32 {
        (self.a * self.a + self.b * self.b).sqrt()
    }

    /// Apply the transform to a point.
    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Warp a grayscale source image into an `out_size`² destination using
    /// the inverse mapping with bilinear sampling. Out-of-bounds pixels are
    /// black.
    pub fn warp(&self, frame: &[u8], width: usize, height: usize, out_size: usize) -> Vec<u8> {
        let det = self.a * self.a + self.b * self.b;
        if det.abs() < 1e-12 {
            return vec![0u8; out_size * out_size];
        }
        let ia = self.a / det;
        let ib = self.b / det;

        let mut output = vec![0u8; out_size * out_size];

        for oy in 0..out_size {
            for ox in 0..out_size {
                let dx = ox as f32 - self.tx;
                let dy = oy as f32 - self.ty;
                let sx = ia * dx + ib * dy;
                let sy = -ib * dx + ia * dy;

                let x0 = sx.floor() as i32;
                let y0 = sy.floor() as i32;
                let fx = sx - x0 as f32;
                let fy = sy - y0 as f32;

                let sample = |x: i32, y: i32| -> f32 {
                    if x >= 0 && x < width as i32 && y >= 0 && y < height as i32 {
                        frame[y as usize * width + x as usize] as f32
                    } else {
                        0.0
                    }
                };

                let val = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
                    + sample(x0 + 1, y0) * fx * (1.0 - fy)
                    + sample(x0, y0 + 1) * (1.0 - fx) * fy
                    + sample(x0 + 1, y0 + 1) * fx * fy;

                output[oy * out_size + ox] = val.round().clamp(0.0, 255.0) as u8;
            }
        }

        output
    }
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
/// Returns None when the pivot collapses.
fn solve_4x4(ata: &[f32; 16], atb: &[f32; 4]) -> Option<[f32; 4]> {
    let mut m = [[0.0f32; 5]; 4];
    for (i, row) in m.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().take(4).enumerate() {
            *cell = ata[i * 4 + j];
        }
        row[4] = atb[i];
    }

    for col in 0..4 {
        let mut max_row = col;
        for row in (col + 1)..4 {
            if m[row][col].abs() > m[max_row][col].abs() {
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    Some(x)
}

/// Align a detected face to the canonical 112×112 ArcFace crop.
pub fn align_face(frame: &[u8], width: u32, height: u32, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let transform = SimilarityTransform::estimate(landmarks, &REFERENCE_LANDMARKS_112);
    transform.warp(frame, width as usize, height as usize, ALIGNED_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_when_src_equals_dst() {
        let t = SimilarityTransform::estimate(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112);
        assert!((t.a - 1.0).abs() < 1e-4);
        assert!(t.b.abs() < 1e-4);
        assert!(t.tx.abs() < 1e-3);
        assert!(t.ty.abs() < 1e-3);
        assert!((t.scale() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn halves_doubled_landmarks() {
        let src: [(f32, f32); 5] =
            REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let t = SimilarityTransform::estimate(&src, &REFERENCE_LANDMARKS_112);
        assert!((t.scale() - 0.5).abs() < 0.05, "scale = {}", t.scale());

        // A doubled landmark should map back onto its reference position.
        let (x, y) = t.apply(src[2].0, src[2].1);
        assert!((x - REFERENCE_LANDMARKS_112[2].0).abs() < 0.5);
        assert!((y - REFERENCE_LANDMARKS_112[2].1).abs() < 0.5);
    }

    #[test]
    fn warp_output_size() {
        let frame = vec![128u8; 640 * 480];
        let t = SimilarityTransform {
            a: 1.0,
            b: 0.0,
            tx: 0.0,
            ty: 0.0,
        };
        assert_eq!(t.warp(&frame, 640, 480, ALIGNED_SIZE).len(), ALIGNED_SIZE * ALIGNED_SIZE);
    }

    #[test]
    fn bright_patch_lands_near_reference_eye() {
        let w = 200usize;
        let h = 200usize;
        let mut frame = vec![0u8; w * h];

        let src_landmarks: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];

        // 5x5 bright patch at the left eye survives bilinear interpolation
        let (lx, ly) = (src_landmarks[0].0 as usize, src_landmarks[0].1 as usize);
        for dy in 0..5 {
            for dx in 0..5 {
                let px = lx - 2 + dx;
                let py = ly - 2 + dy;
                frame[py * w + px] = 255;
            }
        }

        let aligned = align_face(&frame, w as u32, h as u32, &src_landmarks);

        let ref_x = REFERENCE_LANDMARKS_112[0].0.round() as usize;
        let ref_y = REFERENCE_LANDMARKS_112[0].1.round() as usize;
        let mut max_val = 0u8;
        for dy in 0..3 {
            for dx in 0..3 {
                let x = ref_x - 1 + dx;
                let y = ref_y - 1 + dy;
                if x < ALIGNED_SIZE && y < ALIGNED_SIZE {
                    max_val = max_val.max(aligned[y * ALIGNED_SIZE + x]);
                }
            }
        }
        assert!(max_val > 100, "expected bright patch near ({ref_x}, {ref_y}), max={max_val}");
    }
}
