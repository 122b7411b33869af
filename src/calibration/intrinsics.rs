//! 単眼内部パラメータキャリブレーション（Zhang法）
//!
//! 既知のチェスボードコーナー位置に対する複数画像の平面ホモグラフィから
//! 内部パラメータ行列と歪み係数を推定する。

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector, Matrix3, Point2, Point3, Vector3};

use super::ChessboardSpec;

/// キャリブレーションに必要な最小ビュー数
pub const MIN_VIEWS: usize = 3;

/// 単眼キャリブレーション結果
#[derive(Debug, Clone)]
pub struct Intrinsics {
    /// 内部パラメータ行列 K
    pub matrix: Matrix3<f64>,
    /// 歪み係数 [k1, k2, p1, p2, k3]（p1, p2, k3 は0のまま）
    pub distortion: [f64; 5],
    /// RMS再投影誤差（ピクセル）
    pub reprojection_error: f64,
    /// ビューごとのボード姿勢（ボード座標系→カメラ座標系）
    pub view_poses: Vec<(Matrix3<f64>, Vector3<f64>)>,
}

/// Hartley正規化: 重心を原点、平均距離を√2へ写す相似変換
fn normalize_points(pts: &[Point2<f64>]) -> (Vec<Point2<f64>>, Matrix3<f64>) {
    let n = pts.len() as f64;
    let cx = pts.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p.y).sum::<f64>() / n;

    let mean_dist = pts
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let scale = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let t = Matrix3::new(scale, 0.0, -scale * cx, 0.0, scale, -scale * cy, 0.0, 0.0, 1.0);
    let normalized = pts
        .iter()
        .map(|p| Point2::new(scale * (p.x - cx), scale * (p.y - cy)))
        .collect();
    (normalized, t)
}

/// 平面ホモグラフィの正規化DLT推定
///
/// object はボード平面上の (x, y)。H はボード平面→画像ピクセル。
pub fn estimate_homography(object: &[Point2<f64>], image: &[Point2<f64>]) -> Result<Matrix3<f64>> {
    if object.len() != image.len() || object.len() < 4 {
        bail!("homography needs >= 4 matched points");
    }

    let (obj_n, t_obj) = normalize_points(object);
    let (img_n, t_img) = normalize_points(image);

    let n = obj_n.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for i in 0..n {
        let (x, y) = (obj_n[i].x, obj_n[i].y);
        let (u, v) = (img_n[i].x, img_n[i].y);

        a[(2 * i, 0)] = -x;
        a[(2 * i, 1)] = -y;
        a[(2 * i, 2)] = -1.0;
        a[(2 * i, 6)] = u * x;
        a[(2 * i, 7)] = u * y;
        a[(2 * i, 8)] = u;

        a[(2 * i + 1, 3)] = -x;
        a[(2 * i + 1, 4)] = -y;
        a[(2 * i + 1, 5)] = -1.0;
        a[(2 * i + 1, 6)] = v * x;
        a[(2 * i + 1, 7)] = v * y;
        a[(2 * i + 1, 8)] = v;
    }

    let svd = a.svd(false, true);
    let vt = svd.v_t.ok_or_else(|| anyhow::anyhow!("SVD failed in homography estimation"))?;
    let h = vt.row(vt.nrows() - 1);

    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    // 正規化を外す: H = T_img⁻¹ Hn T_obj
    let t_img_inv = t_img
        .try_inverse()
        .ok_or_else(|| anyhow::anyhow!("singular normalization transform"))?;
    let mut h = t_img_inv * hn * t_obj;
    if h[(2, 2)].abs() > 1e-12 {
        h /= h[(2, 2)];
    }
    Ok(h)
}

/// Zhangの制約行 v_ij を構築
fn zhang_v(h: &Matrix3<f64>, i: usize, j: usize) -> [f64; 6] {
    // 列ベクトル h_i = H[:, i]
    let hi = h.column(i);
    let hj = h.column(j);
    [
        hi[0] * hj[0],
        hi[0] * hj[1] + hi[1] * hj[0],
        hi[1] * hj[1],
        hi[2] * hj[0] + hi[0] * hj[2],
        hi[2] * hj[1] + hi[1] * hj[2],
        hi[2] * hj[2],
    ]
}

/// ホモグラフィ群から内部パラメータ行列を閉形式で復元する
fn intrinsics_from_homographies(homographies: &[Matrix3<f64>]) -> Result<Matrix3<f64>> {
    let m = homographies.len();
    let mut v = DMatrix::<f64>::zeros(2 * m, 6);
    for (idx, h) in homographies.iter().enumerate() {
        let v12 = zhang_v(h, 0, 1);
        let v11 = zhang_v(h, 0, 0);
        let v22 = zhang_v(h, 1, 1);
        for c in 0..6 {
            v[(2 * idx, c)] = v12[c];
            v[(2 * idx + 1, c)] = v11[c] - v22[c];
        }
    }

    let svd = v.svd(false, true);
    let vt = svd.v_t.ok_or_else(|| anyhow::anyhow!("SVD failed in intrinsic estimation"))?;
    let b = vt.row(vt.nrows() - 1);
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let denom = b11 * b22 - b12 * b12;
    if denom.abs() < 1e-15 || b11.abs() < 1e-15 {
        bail!("degenerate homography set (views too similar)");
    }

    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    if lambda / b11 <= 0.0 {
        bail!("intrinsic estimation produced non-positive focal length");
    }

    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / denom).sqrt();
    let gamma = -b12 * alpha * alpha * beta / lambda;
    let u0 = gamma * v0 / beta - b13 * alpha * alpha / lambda;

    Ok(Matrix3::new(alpha, gamma, u0, 0.0, beta, v0, 0.0, 0.0, 1.0))
}

/// ホモグラフィと K からビューの外部パラメータを復元する
fn pose_from_homography(k: &Matrix3<f64>, h: &Matrix3<f64>) -> Result<(Matrix3<f64>, Vector3<f64>)> {
    let k_inv = k
        .try_inverse()
        .ok_or_else(|| anyhow::anyhow!("singular intrinsic matrix"))?;

    let h1 = k_inv * h.column(0);
    let h2 = k_inv * h.column(1);
    let h3 = k_inv * h.column(2);

    let norm = h1.norm();
    if norm < 1e-12 {
        bail!("degenerate homography (zero scale)");
    }
    let lambda = 1.0 / norm;

    let r1 = Vector3::new(h1[0], h1[1], h1[2]) * lambda;
    let r2 = Vector3::new(h2[0], h2[1], h2[2]) * lambda;
    let r3 = r1.cross(&r2);
    let mut t = Vector3::new(h3[0], h3[1], h3[2]) * lambda;

    let approx = Matrix3::from_columns(&[r1, r2, r3]);

    // 最近傍の回転行列へ射影
    let svd = approx.svd(true, true);
    let (u, vt) = (
        svd.u.ok_or_else(|| anyhow::anyhow!("SVD U missing"))?,
        svd.v_t.ok_or_else(|| anyhow::anyhow!("SVD V^T missing"))?,
    );
    let mut r = u * vt;
    if r.determinant() < 0.0 {
        r = -r;
        t = -t;
    }

    // ボードはカメラ前方 (z > 0) にあるはず
    if t[2] < 0.0 {
        let c0: Vector3<f64> = -r.column(0).clone_owned();
        let c1: Vector3<f64> = -r.column(1).clone_owned();
        let c2: Vector3<f64> = r.column(2).clone_owned();
        r = Matrix3::from_columns(&[c0, c1, c2]);
        t = -t;
    }

    Ok((r, t))
}

/// Brown歪みモデルの順方向投影（カメラ座標の3D点→ピクセル）
pub fn project_point(
    k: &Matrix3<f64>,
    dist: &[f64; 5],
    p_cam: &Vector3<f64>,
) -> Option<Point2<f64>> {
    if p_cam[2].abs() < 1e-12 {
        return None;
    }
    let x = p_cam[0] / p_cam[2];
    let y = p_cam[1] / p_cam[2];

    let [k1, k2, p1, p2, k3] = *dist;
    let r2 = x * x + y * y;
    let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
    let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
    let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;

    Some(Point2::new(
        k[(0, 0)] * xd + k[(0, 1)] * yd + k[(0, 2)],
        k[(1, 1)] * yd + k[(1, 2)],
    ))
}

/// 放射歪み係数 (k1, k2) の線形最小二乗推定
fn estimate_radial_distortion(
    k: &Matrix3<f64>,
    poses: &[(Matrix3<f64>, Vector3<f64>)],
    object: &[Point3<f64>],
    views: &[Vec<Point2<f64>>],
) -> [f64; 5] {
    let (cx, cy) = (k[(0, 2)], k[(1, 2)]);
    let mut ata = [[0.0f64; 2]; 2];
    let mut atb = [0.0f64; 2];

    for (view_idx, (r, t)) in poses.iter().enumerate() {
        for (p_obj, observed) in object.iter().zip(views[view_idx].iter()) {
            let p_cam = r * p_obj.coords + t;
            if p_cam[2].abs() < 1e-12 {
                continue;
            }
            let x = p_cam[0] / p_cam[2];
            let y = p_cam[1] / p_cam[2];
            let r2 = x * x + y * y;

            // 理想ピクセル座標（歪みなし）
            let u = k[(0, 0)] * x + k[(0, 1)] * y + k[(0, 2)];
            let v = k[(1, 1)] * y + k[(1, 2)];

            // (u_obs - u) = (u - cx)(k1 r² + k2 r⁴)、v も同様
            let du = observed.x - u;
            let dv = observed.y - v;
            let au = [(u - cx) * r2, (u - cx) * r2 * r2];
            let av = [(v - cy) * r2, (v - cy) * r2 * r2];

            for i in 0..2 {
                for j in 0..2 {
                    ata[i][j] += au[i] * au[j] + av[i] * av[j];
                }
                atb[i] += au[i] * du + av[i] * dv;
            }
        }
    }

    let det = ata[0][0] * ata[1][1] - ata[0][1] * ata[1][0];
    if det.abs() < 1e-15 {
        return [0.0; 5];
    }
    let k1 = (atb[0] * ata[1][1] - atb[1] * ata[0][1]) / det;
    let k2 = (atb[1] * ata[0][0] - atb[0] * ata[1][0]) / det;
    [k1, k2, 0.0, 0.0, 0.0]
}

/// RMS再投影誤差
pub fn reprojection_rms(
    k: &Matrix3<f64>,
    dist: &[f64; 5],
    poses: &[(Matrix3<f64>, Vector3<f64>)],
    object: &[Point3<f64>],
    views: &[Vec<Point2<f64>>],
) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for (view_idx, (r, t)) in poses.iter().enumerate() {
        for (p_obj, observed) in object.iter().zip(views[view_idx].iter()) {
            let p_cam = r * p_obj.coords + t;
            if let Some(projected) = project_point(k, dist, &p_cam) {
                sum += (projected.x - observed.x).powi(2) + (projected.y - observed.y).powi(2);
                count += 1;
            }
        }
    }
    if count == 0 {
        return f64::MAX;
    }
    (sum / count as f64).sqrt()
}

/// 蓄積されたコーナー観測から内部パラメータをキャリブレーションする
///
/// views: ビューごとのコーナーピクセル座標（ボードの objp と同順）
pub fn calibrate_intrinsics(
    board: &ChessboardSpec,
    views: &[Vec<Point2<f64>>],
) -> Result<Intrinsics> {
    if views.len() < MIN_VIEWS {
        bail!(
            "not enough views for intrinsic calibration (got {}, need >= {})",
            views.len(),
            MIN_VIEWS
        );
    }

    let object3 = board.object_points();
    let object2: Vec<Point2<f64>> = object3.iter().map(|p| Point2::new(p.x, p.y)).collect();

    for view in views {
        if view.len() != object2.len() {
            bail!(
                "corner count mismatch: expected {}, got {}",
                object2.len(),
                view.len()
            );
        }
    }

    let homographies: Vec<Matrix3<f64>> = views
        .iter()
        .map(|v| estimate_homography(&object2, v))
        .collect::<Result<_>>()?;

    let k = intrinsics_from_homographies(&homographies)?;

    let view_poses: Vec<(Matrix3<f64>, Vector3<f64>)> = homographies
        .iter()
        .map(|h| pose_from_homography(&k, h))
        .collect::<Result<_>>()?;

    let distortion = estimate_radial_distortion(&k, &view_poses, &object3, views);
    let reprojection_error = reprojection_rms(&k, &distortion, &view_poses, &object3, views);

    Ok(Intrinsics {
        matrix: k,
        distortion,
        reprojection_error,
        view_poses,
    })
}

/// ガウス・ニュートン用の小さな線形ソルバ (JᵀJ δ = -Jᵀr)
pub(crate) fn solve_normal_equations(jtj: &DMatrix<f64>, jtr: &DVector<f64>) -> Option<DVector<f64>> {
    jtj.clone().lu().solve(&(-jtr))
}
