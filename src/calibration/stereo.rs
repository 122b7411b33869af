//! ステレオキャリブレーション
//!
//! 両カメラの内部パラメータを固定したまま、カメラ1をカメラ0座標系へ写す
//! R, T と診断用の E, F を復元する。反復回数か再投影誤差の変化量の
//! どちらかが先に閾値へ達したら打ち切る。

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector, Matrix3, Point2, Rotation3, Vector3};

use super::intrinsics::{project_point, solve_normal_equations, Intrinsics};
use super::ChessboardSpec;

/// 反復の打ち切り条件（OpenCVのstereoCalibrate既定に合わせる）
const MAX_ITERATIONS: usize = 30;
const EPS: f64 = 1e-6;

/// ステレオキャリブレーション結果
#[derive(Debug, Clone)]
pub struct StereoExtrinsics {
    /// カメラ0座標系→カメラ1座標系の回転
    pub rotation: Matrix3<f64>,
    /// 並進ベクトル
    pub translation: Vector3<f64>,
    /// 本質行列 E = [T]× R（診断用）
    pub essential: Matrix3<f64>,
    /// 基礎行列 F = K1⁻ᵀ E K0⁻¹（診断用）
    pub fundamental: Matrix3<f64>,
    /// 残余RMS再投影誤差
    pub rms: f64,
}

fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v[2], v[1], v[2], 0.0, -v[0], -v[1], v[0], 0.0)
}

/// 回転行列群のchordal平均をSVDで最近傍回転へ射影する
fn average_rotations(rotations: &[Matrix3<f64>]) -> Result<Matrix3<f64>> {
    let mut sum = Matrix3::<f64>::zeros();
    for r in rotations {
        sum += r;
    }
    let svd = sum.svd(true, true);
    let (u, vt) = (
        svd.u.ok_or_else(|| anyhow::anyhow!("SVD U missing in rotation average"))?,
        svd.v_t.ok_or_else(|| anyhow::anyhow!("SVD V^T missing in rotation average"))?,
    );
    let mut r = u * vt;
    if r.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.set_column(2, &(-u.column(2)));
        r = u_fixed * vt;
    }
    Ok(r)
}

/// カメラ1への再投影残差（全ビュー・全コーナー）
///
/// ボード点はカメラ0でのビュー姿勢で3D化し、(R, T) でカメラ1へ写して投影する。
fn reprojection_residuals(
    r: &Matrix3<f64>,
    t: &Vector3<f64>,
    k1: &Matrix3<f64>,
    dist1: &[f64; 5],
    poses0: &[(Matrix3<f64>, Vector3<f64>)],
    object: &[nalgebra::Point3<f64>],
    views1: &[Vec<Point2<f64>>],
) -> DVector<f64> {
    let mut residuals = Vec::with_capacity(poses0.len() * object.len() * 2);
    for (view_idx, (r0, t0)) in poses0.iter().enumerate() {
        for (p_obj, observed) in object.iter().zip(views1[view_idx].iter()) {
            let p_cam0 = r0 * p_obj.coords + t0;
            let p_cam1 = r * p_cam0 + t;
            match project_point(k1, dist1, &p_cam1) {
                Some(projected) => {
                    residuals.push(projected.x - observed.x);
                    residuals.push(projected.y - observed.y);
                }
                None => {
                    residuals.push(0.0);
                    residuals.push(0.0);
                }
            }
        }
    }
    DVector::from_vec(residuals)
}

fn rms_of(residuals: &DVector<f64>) -> f64 {
    if residuals.is_empty() {
        return f64::MAX;
    }
    (residuals.norm_squared() / (residuals.len() as f64 / 2.0)).sqrt()
}

/// (ω, δt) 6パラメータのガウス・ニュートン精密化
///
/// ヤコビアンは中心差分で数値的に求める。パラメータが6つしかないので十分速い。
fn refine_relative_pose(
    mut r: Matrix3<f64>,
    mut t: Vector3<f64>,
    k1: &Matrix3<f64>,
    dist1: &[f64; 5],
    poses0: &[(Matrix3<f64>, Vector3<f64>)],
    object: &[nalgebra::Point3<f64>],
    views1: &[Vec<Point2<f64>>],
) -> (Matrix3<f64>, Vector3<f64>, f64) {
    let step = 1e-6;
    let mut prev_rms = rms_of(&reprojection_residuals(
        &r, &t, k1, dist1, poses0, object, views1,
    ));

    for _ in 0..MAX_ITERATIONS {
        let base = reprojection_residuals(&r, &t, k1, dist1, poses0, object, views1);
        let n = base.len();
        let mut jacobian = DMatrix::<f64>::zeros(n, 6);

        for p in 0..6 {
            let mut delta = [0.0f64; 6];
            delta[p] = step;
            let (rp, tp) = apply_update(&r, &t, &delta);
            delta[p] = -step;
            let (rm, tm) = apply_update(&r, &t, &delta);

            let plus = reprojection_residuals(&rp, &tp, k1, dist1, poses0, object, views1);
            let minus = reprojection_residuals(&rm, &tm, k1, dist1, poses0, object, views1);
            for i in 0..n {
                jacobian[(i, p)] = (plus[i] - minus[i]) / (2.0 * step);
            }
        }

        let jtj = jacobian.transpose() * &jacobian;
        let jtr = jacobian.transpose() * &base;
        let Some(delta) = solve_normal_equations(&jtj, &jtr) else {
            break;
        };

        let update: [f64; 6] = std::array::from_fn(|i| delta[i]);
        let (r_new, t_new) = apply_update(&r, &t, &update);
        let new_rms = rms_of(&reprojection_residuals(
            &r_new, &t_new, k1, dist1, poses0, object, views1,
        ));

        if new_rms > prev_rms {
            break;
        }
        r = r_new;
        t = t_new;
        // 誤差の変化量が閾値を下回ったら収束
        if (prev_rms - new_rms).abs() < EPS {
            prev_rms = new_rms;
            break;
        }
        prev_rms = new_rms;
    }

    (r, t, prev_rms)
}

/// 回転の左更新 R ← exp([ω]×) R、並進の加算更新
fn apply_update(r: &Matrix3<f64>, t: &Vector3<f64>, delta: &[f64; 6]) -> (Matrix3<f64>, Vector3<f64>) {
    let omega = Vector3::new(delta[0], delta[1], delta[2]);
    let dr = Rotation3::new(omega);
    (
        dr.matrix() * r,
        t + Vector3::new(delta[3], delta[4], delta[5]),
    )
}

/// ステレオキャリブレーション本体
///
/// views0/views1: 同じビューの両カメラのコーナー観測（ペア済み・同数）。
/// intr0/intr1 の内部パラメータは固定したまま使う。
pub fn stereo_calibrate(
    board: &ChessboardSpec,
    intr0: &Intrinsics,
    intr1: &Intrinsics,
    views1: &[Vec<Point2<f64>>],
) -> Result<StereoExtrinsics> {
    if intr0.view_poses.len() != views1.len() || intr1.view_poses.len() != views1.len() {
        bail!("stereo calibration needs matched view sets for both cameras");
    }
    if views1.is_empty() {
        bail!("no views for stereo calibration");
    }

    // ビューごとの相対変換 R_rel = R1 R0ᵀ、t_rel = t1 − R_rel t0
    let mut relative_rotations = Vec::with_capacity(views1.len());
    let mut relative_translations = Vec::with_capacity(views1.len());
    for ((r0, t0), (r1, t1)) in intr0.view_poses.iter().zip(intr1.view_poses.iter()) {
        let r_rel = r1 * r0.transpose();
        let t_rel = t1 - r_rel * t0;
        relative_rotations.push(r_rel);
        relative_translations.push(t_rel);
    }

    let r_init = average_rotations(&relative_rotations)?;
    let t_init = relative_translations
        .iter()
        .fold(Vector3::zeros(), |acc, t| acc + t)
        / relative_translations.len() as f64;

    let object = board.object_points();
    let (rotation, translation, rms) = refine_relative_pose(
        r_init,
        t_init,
        &intr1.matrix,
        &intr1.distortion,
        &intr0.view_poses,
        &object,
        views1,
    );

    if translation.norm() < 1e-9 {
        bail!("stereo calibration produced a zero baseline");
    }

    let essential = skew_symmetric(&translation) * rotation;
    let k0_inv = intr0
        .matrix
        .try_inverse()
        .ok_or_else(|| anyhow::anyhow!("singular K0"))?;
    let k1_inv = intr1
        .matrix
        .try_inverse()
        .ok_or_else(|| anyhow::anyhow!("singular K1"))?;
    let fundamental = k1_inv.transpose() * essential * k0_inv;

    Ok(StereoExtrinsics {
        rotation,
        translation,
        essential,
        fundamental,
        rms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::intrinsics::calibrate_intrinsics;

    fn board() -> ChessboardSpec {
        ChessboardSpec {
            cols: 8,
            rows: 6,
            square_size: 28.0,
        }
    }

    /// 既知のステレオリグで両カメラのコーナー観測を合成する
    fn synthetic_rig() -> (Matrix3<f64>, Matrix3<f64>, Vector3<f64>, Vec<Vec<Point2<f64>>>, Vec<Vec<Point2<f64>>>) {
        let k = Matrix3::new(800.0, 0.0, 640.0, 0.0, 800.0, 360.0, 0.0, 0.0, 1.0);
        // カメラ1はカメラ0から右へ100mm、わずかに内向き
        let r_true = *Rotation3::from_euler_angles(0.0, -0.05, 0.0).matrix();
        let t_true = Vector3::new(-100.0, 0.0, 5.0);

        let tilts: [(f64, f64); 4] = [(0.2, 0.0), (-0.15, 0.1), (0.05, -0.25), (0.3, 0.2)];
        let object = board().object_points();
        let mut views0 = Vec::new();
        let mut views1 = Vec::new();
        for &(rx, ry) in &tilts {
            let r0 = *Rotation3::from_euler_angles(rx, ry, 0.0).matrix();
            let t0 = Vector3::new(-80.0, -60.0, 600.0);
            let mut v0 = Vec::new();
            let mut v1 = Vec::new();
            for p in &object {
                let p_cam0 = r0 * p.coords + t0;
                let p_cam1 = r_true * p_cam0 + t_true;
                v0.push(project_point(&k, &[0.0; 5], &p_cam0).unwrap());
                v1.push(project_point(&k, &[0.0; 5], &p_cam1).unwrap());
            }
            views0.push(v0);
            views1.push(v1);
        }
        (k, r_true, t_true, views0, views1)
    }

    #[test]
    fn test_stereo_recovers_relative_pose() {
        let (_k, r_true, t_true, views0, views1) = synthetic_rig();

        let intr0 = calibrate_intrinsics(&board(), &views0).unwrap();
        let intr1 = calibrate_intrinsics(&board(), &views1).unwrap();
        let stereo = stereo_calibrate(&board(), &intr0, &intr1, &views1).unwrap();

        assert!((stereo.rotation - r_true).norm() < 0.01, "R error: {}", (stereo.rotation - r_true).norm());
        assert!((stereo.translation - t_true).norm() < 3.0, "T error: {}", (stereo.translation - t_true).norm());
        assert!(stereo.rms < 0.5, "rms: {}", stereo.rms);

        // R は正規直交で det = 1
        let rtr = stereo.rotation.transpose() * stereo.rotation;
        assert!((rtr - Matrix3::identity()).norm() < 1e-6);
        assert!((stereo.rotation.determinant() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_essential_epipolar_constraint() {
        let (k, _r_true, _t_true, views0, views1) = synthetic_rig();

        let intr0 = calibrate_intrinsics(&board(), &views0).unwrap();
        let intr1 = calibrate_intrinsics(&board(), &views1).unwrap();
        let stereo = stereo_calibrate(&board(), &intr0, &intr1, &views1).unwrap();

        // x1ᵀ E x0 ≈ 0（正規化座標）
        let k_inv = k.try_inverse().unwrap();
        for (p0, p1) in views0[0].iter().zip(views1[0].iter()).take(10) {
            let x0 = k_inv * Vector3::new(p0.x, p0.y, 1.0);
            let x1 = k_inv * Vector3::new(p1.x, p1.y, 1.0);
            let epi = (x1.transpose() * stereo.essential * x0)[(0, 0)];
            // Eのスケールに対して相対的に小さいこと
            assert!(epi.abs() / stereo.essential.norm() < 1e-4);
        }
    }

    #[test]
    fn test_mismatched_views_rejected() {
        let (_k, _r, _t, views0, views1) = synthetic_rig();
        let intr0 = calibrate_intrinsics(&board(), &views0).unwrap();
        let intr1 = calibrate_intrinsics(&board(), &views1).unwrap();
        assert!(stereo_calibrate(&board(), &intr0, &intr1, &views1[..2]).is_err());
    }
}
