//! 2D affine transforms for frame registration.

use glam::DVec2;

/// Row-major 2×3 affine transform:
///
/// ```text
/// | a  b  tx |   | m[0] m[1] m[2] |
/// | c  d  ty | = | m[3] m[4] m[5] |
/// ```
///
/// Maps REFERENCE coordinates to FRAME coordinates: `T.apply(ref_point)`
/// gives the corresponding point in the frame, which is exactly what the
/// projector needs when resampling a frame onto the reference grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform2D {
    pub m: [f64; 6],
}

impl Default for Transform2D {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::fmt::Display for Transform2D {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[[{:.4} {:.4} {:.3}] [{:.4} {:.4} {:.3}]]",
            self.m[0], self.m[1], self.m[2], self.m[3], self.m[4], self.m[5]
        )
    }
}

impl Transform2D {
    pub fn identity() -> Self {
        Self {
            m: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
        }
    }

    pub fn translation(dx: f64, dy: f64) -> Self {
        Self {
            m: [1.0, 0.0, dx, 0.0, 1.0, dy],
        }
    }

    pub fn is_identity(&self) -> bool {
        let id = Self::identity();
        self.m
            .iter()
            .zip(id.m.iter())
            .all(|(a, b)| (a - b).abs() < 1e-12)
    }

    #[inline]
    pub fn apply(&self, p: DVec2) -> DVec2 {
        DVec2::new(
            self.m[0] * p.x + self.m[1] * p.y + self.m[2],
            self.m[3] * p.x + self.m[4] * p.y + self.m[5],
        )
    }

    /// Translation components (tx, ty).
    pub fn translation_components(&self) -> DVec2 {
        DVec2::new(self.m[2], self.m[5])
    }

    /// Least-squares fit of the six affine parameters from point
    /// correspondences, reference → frame. Needs at least three
    /// non-collinear pairs; returns None for degenerate geometry.
    pub fn from_least_squares(reference: &[DVec2], frame: &[DVec2]) -> Option<Self> {
        assert_eq!(reference.len(), frame.len());
        if reference.len() < 3 {
            return None;
        }

        // Normal equations: M · [a b tx]ᵀ = rhs_x, M · [c d ty]ᵀ = rhs_y
        // with M = Σ [x y 1]ᵀ[x y 1] over reference points.
        let mut m = [[0.0f64; 3]; 3];
        let mut rhs_x = [0.0f64; 3];
        let mut rhs_y = [0.0f64; 3];
        for (r, f) in reference.iter().zip(frame.iter()) {
            let row = [r.x, r.y, 1.0];
            for i in 0..3 {
                for j in 0..3 {
                    m[i][j] += row[i] * row[j];
                }
                rhs_x[i] += row[i] * f.x;
                rhs_y[i] += row[i] * f.y;
            }
        }

        let sol_x = solve_3x3(m, rhs_x)?;
        let sol_y = solve_3x3(m, rhs_y)?;
        Some(Self {
            m: [sol_x[0], sol_x[1], sol_x[2], sol_y[0], sol_y[1], sol_y[2]],
        })
    }

    /// RMS distance between transformed reference points and frame points.
    pub fn rms_residual(&self, reference: &[DVec2], frame: &[DVec2]) -> f64 {
        debug_assert_eq!(reference.len(), frame.len());
        if reference.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = reference
            .iter()
            .zip(frame.iter())
            .map(|(&r, &f)| self.apply(r).distance_squared(f))
            .sum();
        (sum_sq / reference.len() as f64).sqrt()
    }
}

/// Gaussian elimination with partial pivoting.
fn solve_3x3(mut m: [[f64; 3]; 3], mut rhs: [f64; 3]) -> Option<[f64; 3]> {
    for col in 0..3 {
        let pivot = (col..3).max_by(|&a, &b| m[a][col].abs().partial_cmp(&m[b][col].abs()).unwrap())?;
        if m[pivot][col].abs() < 1e-12 {
            return None;
        }
        m.swap(col, pivot);
        rhs.swap(col, pivot);

        for row in col + 1..3 {
            let factor = m[row][col] / m[col][col];
            for k in col..3 {
                m[row][k] -= factor * m[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut sol = [0.0f64; 3];
    for row in (0..3).rev() {
        let mut acc = rhs[row];
        for k in row + 1..3 {
            acc -= m[row][k] * sol[k];
        }
        sol[row] = acc / m[row][row];
    }
    Some(sol)
}
