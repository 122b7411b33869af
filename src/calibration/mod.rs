//! ステレオキャリブレーション（オフライン）
//!
//! 2つの同期画像フォルダのチェスボードコーナー観測から内部・外部パラメータを
//! 求め、JSONファイルへ永続化する。三角測量器は起動時にこのファイルを読む。

pub mod intrinsics;
pub mod stereo;

use anyhow::{bail, Context, Result};
use nalgebra::{Matrix3, Point2, Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::PipelineError;
pub use intrinsics::{calibrate_intrinsics, Intrinsics, MIN_VIEWS};
pub use stereo::{stereo_calibrate, StereoExtrinsics};

/// チェスボードの仕様（内側コーナー数と1マスの実寸）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChessboardSpec {
    pub cols: usize,
    pub rows: usize,
    /// 1マスの辺長（mm）
    pub square_size: f64,
}

impl ChessboardSpec {
    pub fn corner_count(&self) -> usize {
        self.cols * self.rows
    }

    /// ボード座標系 (Z=0平面) のコーナー3D位置
    pub fn object_points(&self) -> Vec<Point3<f64>> {
        let mut points = Vec::with_capacity(self.corner_count());
        for y in 0..self.rows {
            for x in 0..self.cols {
                points.push(Point3::new(
                    x as f64 * self.square_size,
                    y as f64 * self.square_size,
                    0.0,
                ));
            }
        }
        points
    }
}

/// チェスボードコーナー検出器（検出自体は外部コラボレータ）
///
/// 検出できなかった画像は None を返す。そのペアはキャリブレーション集合から
/// 黙って除外される（エラーではなくサンプル減）。
pub trait CornerDetector {
    fn detect(
        &mut self,
        width: usize,
        height: usize,
        image: &[u8],
        board: &ChessboardSpec,
    ) -> Option<Vec<Point2<f64>>>;
}

/// 永続化されるキャリブレーションパラメータ一式
///
/// フィールド名と入れ子配列の形はパラメータファイル仕様そのまま。
/// save → load で全9フィールドが正確にラウンドトリップする。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StereoParameters {
    /// ステレオキャリブレーションの残余再投影誤差
    pub ret: f64,
    /// カメラ0の内部パラメータ行列 (3x3)
    pub mtx0: Vec<Vec<f64>>,
    /// カメラ0の歪み係数 (1xN, N >= 4)
    pub dist0: Vec<Vec<f64>>,
    pub mtx1: Vec<Vec<f64>>,
    pub dist1: Vec<Vec<f64>>,
    /// カメラ1の光線をカメラ0のワールド座標へ写す回転 (3x3, 正規直交)
    #[serde(rename = "R")]
    pub r: Vec<Vec<f64>>,
    /// 並進 (3x1, 非ゼロ)
    #[serde(rename = "T")]
    pub t: Vec<Vec<f64>>,
    /// 本質行列（診断用）
    #[serde(rename = "E")]
    pub e: Vec<Vec<f64>>,
    /// 基礎行列（診断用）
    #[serde(rename = "F")]
    pub f: Vec<Vec<f64>>,
}

fn matrix3_to_nested(m: &Matrix3<f64>) -> Vec<Vec<f64>> {
    (0..3)
        .map(|r| (0..3).map(|c| m[(r, c)]).collect())
        .collect()
}

fn nested_to_matrix3(v: &[Vec<f64>], name: &str) -> Result<Matrix3<f64>> {
    if v.len() != 3 || v.iter().any(|row| row.len() != 3) {
        bail!("{} must be a 3x3 nested array", name);
    }
    Ok(Matrix3::new(
        v[0][0], v[0][1], v[0][2], v[1][0], v[1][1], v[1][2], v[2][0], v[2][1], v[2][2],
    ))
}

impl StereoParameters {
    pub fn from_parts(
        intr0: &Intrinsics,
        intr1: &Intrinsics,
        stereo: &StereoExtrinsics,
    ) -> Self {
        Self {
            ret: stereo.rms,
            mtx0: matrix3_to_nested(&intr0.matrix),
            dist0: vec![intr0.distortion.to_vec()],
            mtx1: matrix3_to_nested(&intr1.matrix),
            dist1: vec![intr1.distortion.to_vec()],
            r: matrix3_to_nested(&stereo.rotation),
            t: stereo.translation.iter().map(|v| vec![*v]).collect(),
            e: matrix3_to_nested(&stereo.essential),
            f: matrix3_to_nested(&stereo.fundamental),
        }
    }

    pub fn intrinsic_matrix(&self, camera: usize) -> Result<Matrix3<f64>> {
        let (v, name) = match camera {
            0 => (&self.mtx0, "mtx0"),
            1 => (&self.mtx1, "mtx1"),
            _ => bail!("camera index must be 0 or 1"),
        };
        nested_to_matrix3(v, name)
    }

    /// 歪み係数の先頭5つ [k1, k2, p1, p2, k3]。4つしかなければ k3 = 0。
    pub fn distortion(&self, camera: usize) -> Result<[f64; 5]> {
        let (v, name) = match camera {
            0 => (&self.dist0, "dist0"),
            1 => (&self.dist1, "dist1"),
            _ => bail!("camera index must be 0 or 1"),
        };
        let row = v
            .first()
            .filter(|row| row.len() >= 4)
            .with_context(|| format!("{} must be a 1xN array with N >= 4", name))?;
        let mut out = [0.0f64; 5];
        for (i, value) in row.iter().take(5).enumerate() {
            out[i] = *value;
        }
        Ok(out)
    }

    pub fn rotation(&self) -> Result<Matrix3<f64>> {
        nested_to_matrix3(&self.r, "R")
    }

    pub fn translation(&self) -> Result<Vector3<f64>> {
        if self.t.len() != 3 || self.t.iter().any(|row| row.len() != 1) {
            bail!("T must be a 3x1 nested array");
        }
        Ok(Vector3::new(self.t[0][0], self.t[1][0], self.t[2][0]))
    }

    /// 不変条件の確認: R が正規直交 (det = 1)、T が非ゼロ
    pub fn validate(&self) -> Result<()> {
        let r = self.rotation()?;
        let orthogonality = (r.transpose() * r - Matrix3::identity()).norm();
        if orthogonality > 1e-3 {
            bail!("R is not orthonormal (||RᵀR - I|| = {:.2e})", orthogonality);
        }
        if (r.determinant() - 1.0).abs() > 1e-3 {
            bail!("R must have det = 1 (got {})", r.determinant());
        }
        if self.translation()?.norm() < 1e-9 {
            bail!("T must be non-zero");
        }
        self.intrinsic_matrix(0)?;
        self.intrinsic_matrix(1)?;
        self.distortion(0)?;
        self.distortion(1)?;
        Ok(())
    }
}

pub fn save_parameters<P: AsRef<Path>>(path: P, params: &StereoParameters) -> Result<()> {
    let json = serde_json::to_string_pretty(params)?;
    fs::write(path.as_ref(), json).context("Failed to write calibration parameter file")?;
    Ok(())
}

pub fn load_parameters<P: AsRef<Path>>(path: P) -> Result<StereoParameters> {
    let content =
        fs::read_to_string(path.as_ref()).context("Failed to read calibration parameter file")?;
    let params: StereoParameters = serde_json::from_str(&content)?;
    Ok(params)
}

/// 1ペア分のコーナー観測。どちらかが None ならそのペアは除外される。
pub type CornerPair = (Option<Vec<Point2<f64>>>, Option<Vec<Point2<f64>>>);

/// 同期フレームペア列をコーナー観測ペア列にする
///
/// 片方で検出に失敗したビューも None のまま残す（除外は run_calibration 側）。
pub fn detect_corner_pairs(
    detector: &mut dyn CornerDetector,
    board: &ChessboardSpec,
    width: usize,
    height: usize,
    frame_pairs: &[(Vec<u8>, Vec<u8>)],
) -> Vec<CornerPair> {
    frame_pairs
        .iter()
        .map(|(frame0, frame1)| {
            (
                detector.detect(width, height, frame0, board),
                detector.detect(width, height, frame1, board),
            )
        })
        .collect()
}

/// コーナー観測ペア列からフルキャリブレーションを実行する
///
/// 有効ペアが3未満なら InsufficientCalibrationSamples で中断し、
/// 部分的な結果は一切残さない。
pub fn run_calibration(board: &ChessboardSpec, pairs: &[CornerPair]) -> Result<StereoParameters> {
    let mut views0 = Vec::new();
    let mut views1 = Vec::new();
    for (c0, c1) in pairs {
        if let (Some(c0), Some(c1)) = (c0, c1) {
            views0.push(c0.clone());
            views1.push(c1.clone());
        }
    }

    if views0.len() < MIN_VIEWS {
        return Err(PipelineError::InsufficientCalibrationSamples {
            got: views0.len(),
            need: MIN_VIEWS,
        }
        .into());
    }

    let intr0 = calibrate_intrinsics(board, &views0)?;
    let intr1 = calibrate_intrinsics(board, &views1)?;
    let stereo = stereo_calibrate(board, &intr0, &intr1, &views1)?;

    let params = StereoParameters::from_parts(&intr0, &intr1, &stereo);
    params.validate()?;
    Ok(params)
}
