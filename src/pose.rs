// pose.rs — Batched pose hypotheses: linearize, solve, update, score.
//
// Every hypothesis is refined independently with the same fixed recipe
// (the GPU runs one hypothesis per lane):
//
//   pose ← I
//   repeat `iterations` times:
//     (A, b) ← normal equations of the reprojection residual of the
//              hypothesis's own 3-correspondence minimal set, linearized
//              at the current pose
//     x ← Cholesky solve of A·x = b          (6×6, unguarded)
//     pose ← exp(x) · pose                   (left-composed twist)
//
// POINT MODEL
// ───────────
// A frame-1 point is carried as (u, v, 1, q) — normalized ray plus
// inverse depth. A rigid transform M = [R t; 0 1] acts as
// M·(u,v,1,q)ᵀ = (R·(u,v,1)ᵀ + t·q, q), so translation is scaled by the
// inverse depth and no division by depth ever happens. The predicted
// frame-2 ray is the perspective division of the transformed point.
//
// The Cholesky factorization is deliberately unguarded: a degenerate
// minimal set produces a singular system, the factorization produces
// NaN, the NaN flows through exp and compose, and the scoring pass
// (whose comparisons are all NaN-false) gives that hypothesis a zero
// score. The solver never branches on failure.

use nalgebra::{Matrix3, Matrix4, Matrix6, Vector3, Vector4, Vector6};

use crate::correspond::Correspondence;

/// Refinement iterations per hypothesis.
pub const DEFAULT_ITERATIONS: usize = 10;
/// Reprojection inlier cutoff in normalized-ray units.
pub const DEFAULT_INLIER_CUTOFF: f32 = 0.01;

/// Result of solving and scoring a batch of hypotheses.
#[derive(Debug, Clone)]
pub struct SolveResult {
    /// Refined pose per hypothesis slot.
    pub poses: Vec<Matrix4<f32>>,
    /// Score per hypothesis slot (sum of inlier weights).
    pub scores: Vec<f32>,
    /// First-seen argmax of `scores`; None when there are no hypotheses.
    pub best_index: Option<usize>,
}

impl SolveResult {
    /// The selected pose, identity when no hypothesis exists.
    pub fn best_pose(&self) -> Matrix4<f32> {
        self.best_index
            .map(|i| self.poses[i])
            .unwrap_or_else(Matrix4::identity)
    }

    /// The selected score, 0 when no hypothesis exists.
    pub fn best_score(&self) -> f32 {
        self.best_index.map(|i| self.scores[i]).unwrap_or(0.0)
    }
}

/// Accumulate the 6×6 normal equations of the reprojection residual of
/// `set` linearized at `pose`. Twist order: (νx, νy, νz, ωx, ωy, ωz).
pub fn linearize(set: &[Correspondence; 3], pose: &Matrix4<f32>) -> (Matrix6<f32>, Vector6<f32>) {
    let mut a = Matrix6::<f32>::zeros();
    let mut b = Vector6::<f32>::zeros();

    for c in set {
        let p = pose * Vector4::new(c.u1, c.v1, 1.0, c.q1);
        let (x, y, z) = (p.x, p.y, p.z);
        let inv_z = 1.0 / z;
        let u_hat = x * inv_z;
        let v_hat = y * inv_z;

        // d p' / d twist = [ q·I | -[p']ₓ ], rows already divided by z
        // and corrected for the perspective division.
        let q = c.q1;
        let ju = [
            q * inv_z,
            0.0,
            -u_hat * q * inv_z,
            -u_hat * y * inv_z,
            (z + u_hat * x) * inv_z,
            -y * inv_z,
        ];
        let jv = [
            0.0,
            q * inv_z,
            -v_hat * q * inv_z,
            -(z + v_hat * y) * inv_z,
            v_hat * x * inv_z,
            x * inv_z,
        ];

        let eu = c.u2 - u_hat;
        let ev = c.v2 - v_hat;

        for i in 0..6 {
            for j in 0..6 {
                a[(i, j)] += ju[i] * ju[j] + jv[i] * jv[j];
            }
            b[i] += ju[i] * eu + jv[i] * ev;
        }
    }

    (a, b)
}

/// Solve A·x = b by Cholesky factorization, 6×6, no pivoting, no
/// singularity guard. Mirrors the WGSL kernel line for line; a
/// non-positive pivot propagates NaN into x.
pub fn cholesky_solve6(a: &Matrix6<f32>, b: &Vector6<f32>) -> Vector6<f32> {
    let mut l = [[0.0f32; 6]; 6];

    for k in 0..6 {
        let mut diag = a[(k, k)];
        for j in 0..k {
            diag -= l[k][j] * l[k][j];
        }
        l[k][k] = diag.sqrt();
        let inv = 1.0 / l[k][k];
        for i in (k + 1)..6 {
            let mut s = a[(i, k)];
            for j in 0..k {
                s -= l[i][j] * l[k][j];
            }
            l[i][k] = s * inv;
        }
    }

    // Forward substitution L·y = b.
    let mut y = [0.0f32; 6];
    for i in 0..6 {
        let mut s = b[i];
        for j in 0..i {
            s -= l[i][j] * y[j];
        }
        y[i] = s / l[i][i];
    }

    // Back substitution Lᵀ·x = y.
    let mut x = Vector6::<f32>::zeros();
    for i in (0..6).rev() {
        let mut s = y[i];
        for j in (i + 1)..6 {
            s -= l[j][i] * x[j];
        }
        x[i] = s / l[i][i];
    }

    x
}

/// Exponential map of a twist (ν, ω) to a rigid transform.
///
/// R = I + A·[ω]ₓ + B·[ω]ₓ², t = (I + B·[ω]ₓ + C·[ω]ₓ²)·ν with the usual
/// A = sinθ/θ, B = (1−cosθ)/θ², C = (θ−sinθ)/θ³ and their Taylor
/// expansions near θ = 0 so exp(0) is exactly the identity.
pub fn se3_exp(x: &Vector6<f32>) -> Matrix4<f32> {
    let nu = Vector3::new(x[0], x[1], x[2]);
    let omega = Vector3::new(x[3], x[4], x[5]);
    let theta_sq = omega.dot(&omega);

    let (a, b, c) = if theta_sq < 1e-8 {
        (
            1.0 - theta_sq / 6.0,
            0.5 - theta_sq / 24.0,
            1.0 / 6.0 - theta_sq / 120.0,
        )
    } else {
        let theta = theta_sq.sqrt();
        (
            theta.sin() / theta,
            (1.0 - theta.cos()) / theta_sq,
            (theta - theta.sin()) / (theta_sq * theta),
        )
    };

    let wx = Matrix3::new(
        0.0, -omega.z, omega.y, //
        omega.z, 0.0, -omega.x, //
        -omega.y, omega.x, 0.0,
    );
    let wx2 = wx * wx;

    let r = Matrix3::identity() + wx * a + wx2 * b;
    let v = Matrix3::identity() + wx * b + wx2 * c;
    let t = v * nu;

    let mut m = Matrix4::identity();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
    m.fixed_view_mut::<3, 1>(0, 3).copy_from(&t);
    m
}

/// The batched solver: refinement schedule plus scoring cutoff.
pub struct PoseSolver {
    /// Gauss-Newton iterations per hypothesis.
    pub iterations: usize,
    /// Reprojection inlier cutoff in normalized-ray units.
    pub inlier_cutoff: f32,
}

impl PoseSolver {
    pub fn new(iterations: usize, inlier_cutoff: f32) -> Self {
        PoseSolver {
            iterations,
            inlier_cutoff,
        }
    }

    /// Refine one hypothesis from its minimal set.
    pub fn refine(&self, set: &[Correspondence; 3]) -> Matrix4<f32> {
        let mut pose = Matrix4::<f32>::identity();
        for _ in 0..self.iterations {
            let (a, b) = linearize(set, &pose);
            let x = cholesky_solve6(&a, &b);
            pose = se3_exp(&x) * pose;
        }
        pose
    }

    /// Sum of inlier weights of `pose` over the full correspondence set.
    ///
    /// w = max(0, 1 − err²/cutoff²) per correspondence. All comparisons
    /// are NaN-false, so hypotheses with garbage poses score 0.
    pub fn score(&self, corrs: &[Correspondence], pose: &Matrix4<f32>) -> f32 {
        let cutoff_sq = self.inlier_cutoff * self.inlier_cutoff;
        let mut total = 0.0f32;
        for c in corrs {
            let p = pose * Vector4::new(c.u1, c.v1, 1.0, c.q1);
            let du = c.u2 - p.x / p.z;
            let dv = c.v2 - p.y / p.z;
            let w = 1.0 - (du * du + dv * dv) / cutoff_sq;
            if w > 0.0 {
                total += w;
            }
        }
        total
    }

    /// Refine and score every hypothesis slot, then select the
    /// first-seen argmax.
    pub fn solve(
        &self,
        corrs: &[Correspondence],
        sets: &[[Correspondence; 3]],
    ) -> SolveResult {
        let poses: Vec<Matrix4<f32>> = sets.iter().map(|s| self.refine(s)).collect();
        let scores: Vec<f32> = poses.iter().map(|m| self.score(corrs, m)).collect();

        let mut best_index = None;
        let mut best = f32::NEG_INFINITY;
        for (i, &s) in scores.iter().enumerate() {
            if s > best {
                best = s;
                best_index = Some(i);
            }
        }

        SolveResult {
            poses,
            scores,
            best_index,
        }
    }
}

/// Project every correspondence's frame-1 point under `pose`. Run once
/// for the selected hypothesis only; the output count equals the
/// correspondence count.
pub fn reproject(corrs: &[Correspondence], pose: &Matrix4<f32>) -> Vec<[f32; 2]> {
    corrs
        .iter()
        .map(|c| {
            let p = pose * Vector4::new(c.u1, c.v1, 1.0, c.q1);
            [p.x / p.z, p.y / p.z]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Correspondences generated exactly by `pose` (zero noise).
    fn synthetic_corrs(pose: &Matrix4<f32>, n: usize) -> Vec<Correspondence> {
        (0..n)
            .map(|i| {
                let u1 = -0.4 + 0.13 * (i % 7) as f32;
                let v1 = -0.3 + 0.17 * ((i * i) % 5) as f32;
                let q1 = 0.5 + 0.1 * (i % 3) as f32;
                let p = pose * Vector4::new(u1, v1, 1.0, q1);
                Correspondence::new(u1, v1, q1, p.x / p.z, p.y / p.z)
            })
            .collect()
    }

    fn small_pose() -> Matrix4<f32> {
        se3_exp(&Vector6::new(0.05, -0.02, 0.03, 0.01, -0.02, 0.015))
    }

    #[test]
    fn cholesky_recovers_known_solution() {
        // A = L·Lᵀ for a fixed well-conditioned lower-triangular L.
        let l = Matrix6::<f32>::new(
            2.0, 0.0, 0.0, 0.0, 0.0, 0.0, //
            0.3, 1.8, 0.0, 0.0, 0.0, 0.0, //
            -0.5, 0.2, 2.2, 0.0, 0.0, 0.0, //
            0.1, -0.4, 0.6, 1.5, 0.0, 0.0, //
            0.7, 0.1, -0.2, 0.3, 1.9, 0.0, //
            -0.3, 0.5, 0.4, -0.1, 0.2, 1.6,
        );
        let a = l * l.transpose();
        let x_known = Vector6::new(1.0, -2.0, 3.0, 0.5, -1.5, 2.5);
        let b = a * x_known;

        let x = cholesky_solve6(&a, &b);
        for i in 0..6 {
            assert_relative_eq!(x[i], x_known[i], max_relative = 1e-4);
        }
    }

    #[test]
    fn singular_system_propagates_nan_and_scores_zero() {
        let a = Matrix6::<f32>::zeros();
        let b = Vector6::new(1.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        let x = cholesky_solve6(&a, &b);
        assert!(x.iter().any(|v| v.is_nan()), "expected NaN, got {x:?}");

        let pose = se3_exp(&x);
        let corrs = synthetic_corrs(&Matrix4::identity(), 10);
        let solver = PoseSolver::new(DEFAULT_ITERATIONS, DEFAULT_INLIER_CUTOFF);
        assert_eq!(solver.score(&corrs, &pose), 0.0);
    }

    #[test]
    fn exp_of_zero_is_identity() {
        let m = se3_exp(&Vector6::zeros());
        assert_eq!(m, Matrix4::identity());
    }

    #[test]
    fn exp_of_pure_translation() {
        let m = se3_exp(&Vector6::new(1.0, 2.0, 3.0, 0.0, 0.0, 0.0));
        assert_relative_eq!(m[(0, 3)], 1.0);
        assert_relative_eq!(m[(1, 3)], 2.0);
        assert_relative_eq!(m[(2, 3)], 3.0);
        for i in 0..3 {
            for j in 0..3 {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(m[(i, j)], expect, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn exp_of_quarter_turn_about_z() {
        let m = se3_exp(&Vector6::new(
            0.0,
            0.0,
            0.0,
            0.0,
            0.0,
            std::f32::consts::FRAC_PI_2,
        ));
        let p = m * Vector4::new(1.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(p.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(p.y, 1.0, epsilon = 1e-5);
        assert_relative_eq!(p.z, 0.0, epsilon = 1e-5);
    }

    #[test]
    fn refine_recovers_the_generating_transform() {
        let truth = small_pose();
        let corrs = synthetic_corrs(&truth, 3);
        let set = [corrs[0], corrs[1], corrs[2]];

        let solver = PoseSolver::new(DEFAULT_ITERATIONS, DEFAULT_INLIER_CUTOFF);
        let pose = solver.refine(&set);

        for i in 0..3 {
            for j in 0..4 {
                assert_relative_eq!(pose[(i, j)], truth[(i, j)], epsilon = 1e-3);
            }
        }
    }

    #[test]
    fn final_iteration_is_idempotent_at_convergence() {
        let truth = small_pose();
        let corrs = synthetic_corrs(&truth, 3);
        let set = [corrs[0], corrs[1], corrs[2]];
        let converged = PoseSolver::new(10, DEFAULT_INLIER_CUTOFF).refine(&set);

        // One more linearize/solve/compose cycle at the converged pose
        // must not move it: x ≈ 0.
        let (a, b) = linearize(&set, &converged);
        let x = cholesky_solve6(&a, &b);
        let again = se3_exp(&x) * converged;
        for i in 0..3 {
            for j in 0..4 {
                assert_relative_eq!(again[(i, j)], converged[(i, j)], epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn true_transform_outscores_random_hypotheses() {
        let truth = small_pose();
        let corrs = synthetic_corrs(&truth, 40);
        let solver = PoseSolver::new(DEFAULT_ITERATIONS, DEFAULT_INLIER_CUTOFF);

        let true_score = solver.score(&corrs, &truth);
        assert_relative_eq!(true_score, 40.0, epsilon = 1e-3);

        let sets = crate::correspond::sample_hypotheses(&corrs, 32);
        for set in &sets {
            let pose = solver.refine(set);
            let s = solver.score(&corrs, &pose);
            assert!(
                s <= true_score + 1e-3,
                "hypothesis scored {s} above the truth's {true_score}"
            );
        }
    }

    #[test]
    fn solve_selects_a_near_truth_pose() {
        let truth = small_pose();
        let corrs = synthetic_corrs(&truth, 60);
        let sets = crate::correspond::sample_hypotheses(&corrs, 64);

        let solver = PoseSolver::new(DEFAULT_ITERATIONS, DEFAULT_INLIER_CUTOFF);
        let result = solver.solve(&corrs, &sets);

        assert_eq!(result.poses.len(), 64);
        assert_eq!(result.scores.len(), 64);
        let best = result.best_pose();
        for i in 0..3 {
            for j in 0..4 {
                assert_relative_eq!(best[(i, j)], truth[(i, j)], epsilon = 1e-2);
            }
        }
        // Near-perfect inlier weight on zero-noise data.
        assert!(result.best_score() > 59.0);
    }

    #[test]
    fn empty_hypothesis_set_selects_nothing() {
        let solver = PoseSolver::new(DEFAULT_ITERATIONS, DEFAULT_INLIER_CUTOFF);
        let result = solver.solve(&[], &[]);
        assert_eq!(result.best_index, None);
        assert_eq!(result.best_pose(), Matrix4::identity());
        assert_eq!(result.best_score(), 0.0);
    }

    #[test]
    fn reprojection_under_identity_returns_frame1_rays() {
        let corrs = synthetic_corrs(&Matrix4::identity(), 12);
        let uvs = reproject(&corrs, &Matrix4::identity());
        assert_eq!(uvs.len(), 12);
        for (c, uv) in corrs.iter().zip(&uvs) {
            assert_relative_eq!(uv[0], c.u1, epsilon = 1e-6);
            assert_relative_eq!(uv[1], c.v1, epsilon = 1e-6);
        }
    }
}
