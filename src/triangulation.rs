//! 2台のカメラの2D姿勢から3D姿勢を三角測量する
//!
//! 各関節について、両カメラのピクセル観測を歪み補正して視線レイに変換し、
//! 2本のレイの最接近点の中点を3D位置とする。カメラ0の光学中心が原点。

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use nalgebra::{Matrix3, Vector3};
use tracing::info;

use crate::buffer::{SlotReader, SlotWriter};
use crate::calibration::StereoParameters;
use crate::lifecycle::{FpsMeter, WorkerState};
use crate::pose::{Keypoint3d, KeypointIndex, Pose2d, Pose3d};

/// 関節を採用する最小2D信頼度。どちらかのカメラでこれを下回る関節は
/// 信頼度0の無効値になる。
pub const CONFIDENCE_THRESHOLD: f32 = 0.1;

/// 新データがないときのポーリングスリープ
const IDLE_SLEEP: Duration = Duration::from_millis(5);

/// キャリブレーション結果を三角測量用に前計算した形
///
/// R はカメラ0座標系→カメラ1座標系の回転なので、カメラ1のレイを
/// ワールド（=カメラ0）座標へ戻すときは R⁻¹ を掛ける。
#[derive(Debug, Clone)]
pub struct CameraRig {
    k0: Matrix3<f64>,
    dist0: [f64; 5],
    k1: Matrix3<f64>,
    dist1: [f64; 5],
    rotation_inv: Matrix3<f64>,
    translation: Vector3<f64>,
}

impl CameraRig {
    pub fn new(
        k0: Matrix3<f64>,
        dist0: [f64; 5],
        k1: Matrix3<f64>,
        dist1: [f64; 5],
        rotation: Matrix3<f64>,
        translation: Vector3<f64>,
    ) -> Self {
        // 回転行列なので逆行列は転置
        Self {
            k0,
            dist0,
            k1,
            dist1,
            rotation_inv: rotation.transpose(),
            translation,
        }
    }

    /// 永続化されたパラメータファイルの内容から構築する
    pub fn from_parameters(params: &StereoParameters) -> Result<Self> {
        params.validate()?;
        Ok(Self::new(
            params.intrinsic_matrix(0)?,
            params.distortion(0)?,
            params.intrinsic_matrix(1)?,
            params.distortion(1)?,
            params.rotation()?,
            params.translation()?,
        ))
    }

    /// カメラ1の原点（ワールド座標）
    pub fn camera1_origin(&self) -> Vector3<f64> {
        self.translation
    }
}

/// 歪んだピクセル座標を歪み補正して正規化カメラ座標のレイにする
///
/// Newton-Raphson法で順方向歪みモデルを逆算する。大きな歪み係数でも収束。
fn undistorted_ray(k: &Matrix3<f64>, dist: &[f64; 5], u: f64, v: f64) -> Vector3<f64> {
    let fx = k[(0, 0)];
    let fy = k[(1, 1)];
    let cx = k[(0, 2)];
    let cy = k[(1, 2)];
    let [k1, k2, p1, p2, k3] = *dist;

    // ピクセル→正規化カメラ座標（歪みあり = ターゲット）
    let xd = (u - cx) / fx;
    let yd = (v - cy) / fy;

    if k1 == 0.0 && k2 == 0.0 && p1 == 0.0 && p2 == 0.0 && k3 == 0.0 {
        return Vector3::new(xd, yd, 1.0);
    }

    let mut x = xd;
    let mut y = yd;
    let mut best = (x, y);
    let mut best_residual = f64::MAX;

    for _ in 0..30 {
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;
        let dr_dr2 = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;

        let fx_val = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x) - xd;
        let fy_val = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y - yd;

        let residual = fx_val * fx_val + fy_val * fy_val;
        if residual < best_residual {
            best_residual = residual;
            best = (x, y);
        }
        if residual < 1e-18 {
            break;
        }

        // ヤコビアン（j10 = j01 の対称形）
        let j00 = radial + 2.0 * x * x * dr_dr2 + 2.0 * p1 * y + 6.0 * p2 * x;
        let j01 = 2.0 * x * y * dr_dr2 + 2.0 * p1 * x + 2.0 * p2 * y;
        let j11 = radial + 2.0 * y * y * dr_dr2 + 6.0 * p1 * y + 2.0 * p2 * x;

        let det = j00 * j11 - j01 * j01;
        if det.abs() < 1e-12 {
            break;
        }

        x -= (j11 * fx_val - j01 * fy_val) / det;
        y -= (-j01 * fx_val + j00 * fy_val) / det;
    }

    Vector3::new(best.0, best.1, 1.0)
}

/// 2本のレイ（原点o0/o1、方向d0/d1）の最接近点の中点
///
/// 正規方程式の分母 AC − B² が0のとき（レイが平行）は t = s = 0、
/// つまり両原点の中点にフォールバックする。
fn closest_point_midpoint(
    o0: &Vector3<f64>,
    d0: &Vector3<f64>,
    o1: &Vector3<f64>,
    d1: &Vector3<f64>,
) -> Vector3<f64> {
    let w0 = o0 - o1;
    let a = d0.dot(d0);
    let b = d0.dot(d1);
    let c = d1.dot(d1);
    let d = d0.dot(&w0);
    let e = d1.dot(&w0);

    let denom = a * c - b * b;
    let (t, s) = if denom.abs() < 1e-12 {
        (0.0, 0.0)
    } else {
        ((b * e - c * d) / denom, (a * e - b * d) / denom)
    };

    let p0 = o0 + d0 * t;
    let p1 = o1 + d1 * s;
    (p0 + p1) * 0.5
}

/// カメラ座標 (x, y, z) → 出力座標 (x, z, -y)
///
/// Y-up・右手系の表示座標へ入れ替える。
fn permute_axes(p: &Vector3<f64>) -> Vector3<f64> {
    Vector3::new(p.x, p.z, -p.y)
}

/// 2D姿勢ペアから3D姿勢を計算する
///
/// 関節ごとに独立で、前回結果への依存はない（平滑化なし）。
/// 3D信頼度は両カメラの2D信頼度の積。
pub fn triangulate_pose(
    rig: &CameraRig,
    pose0: &Pose2d,
    pose1: &Pose2d,
    threshold: f32,
) -> Pose3d {
    let origin0 = Vector3::zeros();
    let origin1 = rig.translation;

    let mut keypoints = [Keypoint3d::invalid(); KeypointIndex::COUNT];
    for (idx, out) in keypoints.iter_mut().enumerate() {
        let kp0 = &pose0.keypoints[idx];
        let kp1 = &pose1.keypoints[idx];
        if kp0.confidence < threshold || kp1.confidence < threshold {
            continue;
        }

        let ray0 = undistorted_ray(&rig.k0, &rig.dist0, kp0.x as f64, kp0.y as f64);
        let ray1 = undistorted_ray(&rig.k1, &rig.dist1, kp1.x as f64, kp1.y as f64);
        let ray1_world = rig.rotation_inv * ray1;

        let mid = closest_point_midpoint(&origin0, &ray0, &origin1, &ray1_world);
        let p = permute_axes(&mid);
        *out = Keypoint3d::new(
            p.x as f32,
            p.y as f32,
            p.z as f32,
            kp0.confidence * kp1.confidence,
        );
    }

    Pose3d::new(keypoints)
}

/// 三角測量ワーカのループ本体
///
/// どちらかの2D姿勢バッファが進むたびに全25関節を再計算して公開する。
pub fn run_triangulator(
    rig: CameraRig,
    poses0: SlotReader<Pose2d>,
    poses1: SlotReader<Pose2d>,
    mut out: SlotWriter<Pose3d>,
    threshold: f32,
    state: Arc<WorkerState>,
) {
    info!("triangulator started");
    let mut meter = FpsMeter::new();
    let mut last_seq = (0u64, 0u64);

    while !state.halt_requested() {
        let seq = (poses0.sequence_id(), poses1.sequence_id());
        // 両カメラの2D姿勢が揃うまで、また新しい入力が来るまでは待つ
        if seq.0 == 0 || seq.1 == 0 || seq == last_seq {
            thread::sleep(IDLE_SLEEP);
            continue;
        }
        last_seq = seq;

        let pose0 = poses0.read();
        let pose1 = poses1.read();
        out.publish(triangulate_pose(&rig, &pose0, &pose1, threshold));
        state.set_fps(meter.tick());
    }

    state.mark_stopped();
    info!("triangulator stopped");
}

/// 三角測量ワーカを独立スレッドとして起動する
pub fn spawn_triangulator(
    rig: CameraRig,
    poses0: SlotReader<Pose2d>,
    poses1: SlotReader<Pose2d>,
    out: SlotWriter<Pose3d>,
    threshold: f32,
    state: Arc<WorkerState>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("triangulator".to_string())
        .spawn(move || run_triangulator(rig, poses0, poses1, out, threshold, state))
        .expect("failed to spawn triangulator thread")
}
