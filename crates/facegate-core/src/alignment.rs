//! Face alignment via 4-DOF similarity transform.
//!
//! Warps a detected face onto the five InsightFace reference landmarks,
//! producing the 112×112 RGB crop ArcFace expects. A [`Jitter`] perturbs the
//! target landmarks so repeated passes sample slightly different crops.

use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Deterministic perturbations cycled through by jitter passes.
const JITTER_TABLE: [Jitter; 4] = [
    Jitter { dx: 1.5, dy: 0.0, scale: 1.0 },
    Jitter { dx: -1.5, dy: 1.0, scale: 0.97 },
    Jitter { dx: 0.0, dy: -1.5, scale: 1.03 },
    Jitter { dx: 1.0, dy: 1.0, scale: 0.99 },
];

/// Offset (pixels) and scale applied to the reference landmarks about the crop center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jitter {
    pub dx: f32,
    pub dy: f32,
    pub scale: f32,
}

impl Jitter {
    pub const NONE: Jitter = Jitter { dx: 0.0, dy: 0.0, scale: 1.0 };

    /// Perturbation for the `n`-th re-sampling pass (0-based).
    pub fn pass(n: u32) -> Jitter {
        JITTER_TABLE[n as usize % JITTER_TABLE.len()]
    }

    fn target(&self) -> [(f32, f32); 5] {
        let c = ALIGNED_SIZE as f32 / 2.0;
        REFERENCE_LANDMARKS_112
            .map(|(x, y)| (c + (x - c) * self.scale + self.dx, c + (y - c) * self.scale + self.dy))
    }
}

/// Least-squares similarity transform from `src` to `dst`.
///
/// Returns [a, -b, tx, b, a, ty] representing:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    // Normal equations for [a, b, tx, ty]: each pair contributes
    //   sx*a - sy*b + tx = dx
    //   sy*a + sx*b + ty = dy
    let mut ata = [[0.0f32; 4]; 4];
    let mut atb = [0.0f32; 4];

    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let rows = [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)];
        for (row, rhs) in rows {
            for j in 0..4 {
                for k in 0..4 {
                    ata[j][k] += row[j] * row[k];
                }
                atb[j] += row[j] * rhs;
            }
        }
    }

    let [a, b, tx, ty] = solve_4x4(ata, atb);
    [a, -b, tx, b, a, ty]
}

/// Gaussian elimination with partial pivoting. Degenerate systems yield identity.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(mut m: [[f32; 4]; 4], mut v: [f32; 4]) -> [f32; 4] {
    for col in 0..4 {
        let pivot_row = (col..4)
            .max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))
            .unwrap_or(col);
        m.swap(col, pivot_row);
        v.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0];
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for k in col..4 {
                m[row][k] -= factor * m[col][k];
            }
            v[row] -= factor * v[col];
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let tail: f32 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (v[i] - tail) / m[i][i];
    }
    x
}

/// Inverse-map every output pixel through the transform, bilinear per channel.
/// Out-of-bounds samples are black.
fn warp_affine(image: &RgbImage, matrix: &[f32; 6], out_size: u32) -> RgbImage {
    let (a, tx, b, ty) = (matrix[0], matrix[2], matrix[3], matrix[5]);
    let det = a * a + b * b;
    let mut output = RgbImage::new(out_size, out_size);
    if det.abs() < 1e-12 {
        return output;
    }
    let (ia, ib) = (a / det, b / det);
    let (w, h) = (image.width() as i64, image.height() as i64);

    let sample = |x: i64, y: i64| -> [f32; 3] {
        if (0..w).contains(&x) && (0..h).contains(&y) {
            image.get_pixel(x as u32, y as u32).0.map(f32::from)
        } else {
            [0.0; 3]
        }
    };

    for (ox, oy, pixel) in output.enumerate_pixels_mut() {
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        let sx = ia * dx + ib * dy;
        let sy = -ib * dx + ia * dy;

        let (x0, y0) = (sx.floor() as i64, sy.floor() as i64);
        let (fx, fy) = (sx - x0 as f32, sy - y0 as f32);
        let corners = [
            (sample(x0, y0), (1.0 - fx) * (1.0 - fy)),
            (sample(x0 + 1, y0), fx * (1.0 - fy)),
            (sample(x0, y0 + 1), (1.0 - fx) * fy),
            (sample(x0 + 1, y0 + 1), fx * fy),
        ];

        let mut value = [0.0f32; 3];
        for (rgb, weight) in corners {
            for c in 0..3 {
                value[c] += rgb[c] * weight;
            }
        }
        *pixel = Rgb(value.map(|v| v.round().clamp(0.0, 255.0) as u8));
    }

    output
}

/// Align a detected face to a canonical 112×112 RGB crop.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5], jitter: Jitter) -> RgbImage {
    let matrix = estimate_similarity_transform(landmarks, &jitter.target());
    warp_affine(image, &matrix, ALIGNED_SIZE)
}
