//! Triangle-invariant star matching.
//!
//! Triangles formed from star positions are characterized by their sorted
//! normalized side lengths plus a chirality flag; both survive any affine
//! transform close to a similarity, so triangles from two frames of the
//! same field can be matched without knowing the transform. Each matched
//! triangle votes for three point correspondences; the vote matrix is
//! resolved greedily into a consensus set.

use glam::DVec2;

/// Minimum side length for valid triangles.
const MIN_TRIANGLE_SIDE: f64 = 1e-10;

/// Minimum squared area (Heron); rejects near-collinear triangles whose
/// ratios are numerically unstable.
const MIN_TRIANGLE_AREA_SQ: f64 = 1e-6;

/// A triangle formed from three stars.
#[derive(Debug, Clone)]
pub struct Triangle {
    /// Star indices ordered so `indices[i]` is the vertex opposite sorted
    /// side `i`. Matched triangles then correspond vertex-by-vertex.
    pub indices: [usize; 3],
    /// Scale-invariant ratios (sides[0]/sides[2], sides[1]/sides[2]).
    pub ratios: (f64, f64),
    /// Chirality of the vertex sequence in `indices` order.
    pub clockwise: bool,
}

impl Triangle {
    /// Build a triangle from three star positions.
    /// Returns None for degenerate (short-sided or near-collinear) triangles.
    pub fn from_positions(indices: [usize; 3], positions: [DVec2; 3]) -> Option<Self> {
        let d01 = positions[0].distance(positions[1]);
        let d12 = positions[1].distance(positions[2]);
        let d20 = positions[2].distance(positions[0]);

        if d01 < MIN_TRIANGLE_SIDE || d12 < MIN_TRIANGLE_SIDE || d20 < MIN_TRIANGLE_SIDE {
            return None;
        }

        // Sort sides, tracking the vertex opposite each side
        let mut side_vertex = [(d01, 2usize), (d12, 0), (d20, 1)];
        side_vertex.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        let sides = [side_vertex[0].0, side_vertex[1].0, side_vertex[2].0];

        let longest = sides[2];
        let ratios = (sides[0] / longest, sides[1] / longest);

        // Heron's formula for squared area
        let s = (sides[0] + sides[1] + sides[2]) / 2.0;
        let area_sq = s * (s - sides[0]) * (s - sides[1]) * (s - sides[2]);
        if area_sq < MIN_TRIANGLE_AREA_SQ {
            return None;
        }

        let ordered = [
            side_vertex[0].1,
            side_vertex[1].1,
            side_vertex[2].1,
        ];
        let p0 = positions[ordered[0]];
        let p1 = positions[ordered[1]];
        let p2 = positions[ordered[2]];
        let cross = (p1 - p0).perp_dot(p2 - p0);
        if cross.abs() < 1e-10 * longest * longest {
            return None;
        }

        Some(Self {
            indices: [indices[ordered[0]], indices[ordered[1]], indices[ordered[2]]],
            ratios,
            clockwise: cross < 0.0,
        })
    }

    /// Whether two triangles agree within `tolerance` on both ratios.
    pub fn is_similar(&self, other: &Triangle, tolerance: f64) -> bool {
        (self.ratios.0 - other.ratios.0).abs() < tolerance
            && (self.ratios.1 - other.ratios.1).abs() < tolerance
    }
}

/// Enumerate all C(n,3) triangles over the given positions.
///
/// The caller bounds `positions` to the top-K brightest stars, so the cubic
/// enumeration stays small (K = 20 gives 1140 triangles).
pub fn form_triangles(positions: &[DVec2]) -> Vec<Triangle> {
    let n = positions.len();
    let mut triangles = Vec::new();
    for i in 0..n {
        for j in i + 1..n {
            for k in j + 1..n {
                if let Some(tri) =
                    Triangle::from_positions([i, j, k], [positions[i], positions[j], positions[k]])
                {
                    triangles.push(tri);
                }
            }
        }
    }
    triangles
}

/// A matched star pair between reference and target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StarMatch {
    pub ref_idx: usize,
    pub target_idx: usize,
    pub votes: usize,
}

/// Match star positions by triangle voting.
///
/// Similar triangles (ratio agreement within `tolerance`, identical
/// chirality) vote for their three vertex correspondences; matches with at
/// least `min_votes` are resolved greedily so each star on either side is
/// used at most once.
pub fn match_stars(
    ref_positions: &[DVec2],
    target_positions: &[DVec2],
    tolerance: f64,
    min_votes: usize,
) -> Vec<StarMatch> {
    if ref_positions.len() < 3 || target_positions.len() < 3 {
        return Vec::new();
    }

    let ref_triangles = form_triangles(ref_positions);
    let target_triangles = form_triangles(target_positions);
    if ref_triangles.is_empty() || target_triangles.is_empty() {
        return Vec::new();
    }

    // Dense vote matrix: top-K star counts keep this tiny
    let n_ref = ref_positions.len();
    let n_target = target_positions.len();
    let mut votes = vec![0usize; n_ref * n_target];

    for target_tri in &target_triangles {
        for ref_tri in &ref_triangles {
            if !ref_tri.is_similar(target_tri, tolerance)
                || ref_tri.clockwise != target_tri.clockwise
            {
                continue;
            }
            // Vertices correspond through the sorted-side ordering
            for i in 0..3 {
                votes[ref_tri.indices[i] * n_target + target_tri.indices[i]] += 1;
            }
        }
    }

    resolve_matches(&votes, n_ref, n_target, min_votes)
}

/// Greedy conflict resolution over the vote matrix: best-voted pairs first,
/// each reference and target star assigned at most once.
fn resolve_matches(
    votes: &[usize],
    n_ref: usize,
    n_target: usize,
    min_votes: usize,
) -> Vec<StarMatch> {
    let mut candidates: Vec<StarMatch> = votes
        .iter()
        .enumerate()
        .filter(|&(_, &v)| v >= min_votes)
        .map(|(idx, &v)| StarMatch {
            ref_idx: idx / n_target,
            target_idx: idx % n_target,
            votes: v,
        })
        .collect();
    candidates.sort_by(|a, b| b.votes.cmp(&a.votes));

    let mut used_ref = vec![false; n_ref];
    let mut used_target = vec![false; n_target];
    let mut resolved = Vec::new();
    for m in candidates {
        if !used_ref[m.ref_idx] && !used_target[m.target_idx] {
            used_ref[m.ref_idx] = true;
            used_target[m.target_idx] = true;
            resolved.push(m);
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn test_positions() -> Vec<DVec2> {
        vec![
            DVec2::new(10.0, 10.0),
            DVec2::new(90.0, 20.0),
            DVec2::new(50.0, 80.0),
            DVec2::new(30.0, 40.0),
            DVec2::new(70.0, 60.0),
            DVec2::new(20.0, 70.0),
        ]
    }

    #[test]
    fn test_triangle_ratios_sorted() {
        let tri = Triangle::from_positions(
            [0, 1, 2],
            [
                DVec2::new(0.0, 0.0),
                DVec2::new(4.0, 0.0),
                DVec2::new(0.0, 3.0),
            ],
        )
        .unwrap();
        // sides 3, 4, 5 -> ratios (0.6, 0.8)
        assert!((tri.ratios.0 - 0.6).abs() < 1e-12);
        assert!((tri.ratios.1 - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_triangle_vertex_opposite_ordering() {
        let tri = Triangle::from_positions(
            [7, 8, 9],
            [
                DVec2::new(0.0, 0.0), // vertex 7, opposite side 1-2 (length 5)
                DVec2::new(4.0, 0.0), // vertex 8, opposite side 0-2 (length 3)
                DVec2::new(0.0, 3.0), // vertex 9, opposite side 0-1 (length 4)
            ],
        )
        .unwrap();
        // sorted sides 3 (opp 8), 4 (opp 9), 5 (opp 7)
        assert_eq!(tri.indices, [8, 9, 7]);
    }

    #[test]
    fn test_collinear_rejected() {
        assert!(
            Triangle::from_positions(
                [0, 1, 2],
                [
                    DVec2::new(0.0, 0.0),
                    DVec2::new(1.0, 1.0),
                    DVec2::new(2.0, 2.0),
                ],
            )
            .is_none()
        );
    }

    #[test]
    fn test_invariants_survive_translation_rotation() {
        let positions = [
            DVec2::new(0.0, 0.0),
            DVec2::new(4.0, 0.0),
            DVec2::new(1.0, 3.0),
        ];
        let angle = 0.7f64;
        let (sin, cos) = angle.sin_cos();
        let moved: Vec<DVec2> = positions
            .iter()
            .map(|p| {
                DVec2::new(
                    cos * p.x - sin * p.y + 100.0,
                    sin * p.x + cos * p.y - 50.0,
                )
            })
            .collect();

        let a = Triangle::from_positions([0, 1, 2], positions).unwrap();
        let b = Triangle::from_positions([0, 1, 2], [moved[0], moved[1], moved[2]]).unwrap();
        assert!(a.is_similar(&b, 1e-9));
        assert_eq!(a.clockwise, b.clockwise);
    }

    #[test]
    fn test_mirror_flips_chirality() {
        let positions = [
            DVec2::new(0.0, 0.0),
            DVec2::new(4.0, 0.0),
            DVec2::new(1.0, 3.0),
        ];
        let mirrored: Vec<DVec2> = positions.iter().map(|p| DVec2::new(-p.x, p.y)).collect();

        let a = Triangle::from_positions([0, 1, 2], positions).unwrap();
        let b =
            Triangle::from_positions([0, 1, 2], [mirrored[0], mirrored[1], mirrored[2]]).unwrap();
        assert!(a.is_similar(&b, 1e-9), "mirror preserves ratios");
        assert_ne!(a.clockwise, b.clockwise, "mirror flips chirality");
    }

    #[test]
    fn test_form_triangles_count() {
        let triangles = form_triangles(&test_positions());
        // C(6,3) = 20, all non-degenerate for this spread
        assert_eq!(triangles.len(), 20);
    }

    #[test]
    fn test_match_stars_identity() {
        let positions = test_positions();
        let matches = match_stars(&positions, &positions, 0.01, 2);
        assert_eq!(matches.len(), positions.len());
        for m in &matches {
            assert_eq!(m.ref_idx, m.target_idx);
        }
    }

    #[test]
    fn test_match_stars_translated_and_permuted() {
        let reference = test_positions();
        // target list is shuffled and translated
        let order = [3usize, 0, 5, 2, 4, 1];
        let target: Vec<DVec2> = order
            .iter()
            .map(|&i| reference[i] + DVec2::new(12.0, -7.0))
            .collect();

        let matches = match_stars(&reference, &target, 0.01, 2);
        assert_eq!(matches.len(), reference.len());

        let expected: StdHashMap<usize, usize> =
            order.iter().enumerate().map(|(t, &r)| (r, t)).collect();
        for m in &matches {
            assert_eq!(m.target_idx, expected[&m.ref_idx], "wrong pairing: {m:?}");
        }
    }

    #[test]
    fn test_match_stars_with_outlier() {
        let reference = test_positions();
        let mut target: Vec<DVec2> = reference
            .iter()
            .map(|&p| p + DVec2::new(5.0, 5.0))
            .collect();
        // Replace one star with an unrelated position
        target[5] = DVec2::new(5.0, 5.0);

        let matches = match_stars(&reference, &target, 0.01, 2);
        // The five real pairs dominate the votes
        let correct = matches
            .iter()
            .filter(|m| m.ref_idx == m.target_idx && m.ref_idx < 5)
            .count();
        assert!(correct >= 5, "got {matches:?}");
    }

    #[test]
    fn test_match_stars_too_few() {
        let two = vec![DVec2::new(0.0, 0.0), DVec2::new(1.0, 0.0)];
        assert!(match_stars(&two, &two, 0.01, 2).is_empty());
    }
}
