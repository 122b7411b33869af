use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::camera::CameraSettings;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CameraConfig {
    /// キャプチャモード "幅x高さ@fps" (e.g. "1280x720@60")
    #[serde(default = "default_mode")]
    pub mode: String,
    /// 露出（ドライバ固有の対数スケール）
    #[serde(default = "default_exposure")]
    pub exposure: i32,
    /// ゲイン
    #[serde(default = "default_gain")]
    pub gain: i32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// 三角測量で関節を採用する最小2D信頼度
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// 新データ待ちのポーリング間隔（ミリ秒）
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CalibrationConfig {
    /// チェスボード内側コーナーの横数
    #[serde(default = "default_grid_cols")]
    pub grid_cols: usize,
    /// チェスボード内側コーナーの縦数
    #[serde(default = "default_grid_rows")]
    pub grid_rows: usize,
    /// 1マスの辺長（mm）
    #[serde(default = "default_square_size")]
    pub square_size: f64,
    /// カメラ0のコーナー観測JSONを置くフォルダ
    #[serde(default = "default_corners_dir_0")]
    pub corners_dir_0: String,
    /// カメラ1のコーナー観測JSONを置くフォルダ
    #[serde(default = "default_corners_dir_1")]
    pub corners_dir_1: String,
    /// パラメータファイルの保存先
    #[serde(default = "default_calibration_output")]
    pub output_path: String,
}

fn default_mode() -> String { "1280x720@60".to_string() }
fn default_exposure() -> i32 { -7 }
fn default_gain() -> i32 { 200 }
fn default_confidence_threshold() -> f32 { 0.1 }
fn default_poll_interval_ms() -> u64 { 5 }
fn default_grid_cols() -> usize { 8 }
fn default_grid_rows() -> usize { 6 }
fn default_square_size() -> f64 { 28.0 }
fn default_corners_dir_0() -> String { "outputs/calibration/corners_0".to_string() }
fn default_corners_dir_1() -> String { "outputs/calibration/corners_1".to_string() }
fn default_calibration_output() -> String { "outputs/calibration/parameters.json".to_string() }

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            exposure: default_exposure(),
            gain: default_gain(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            grid_cols: default_grid_cols(),
            grid_rows: default_grid_rows(),
            square_size: default_square_size(),
            corners_dir_0: default_corners_dir_0(),
            corners_dir_1: default_corners_dir_1(),
            output_path: default_calibration_output(),
        }
    }
}

impl CameraConfig {
    /// "幅x高さ@fps" をデコードしてキャプチャ設定にする
    pub fn settings(&self) -> Result<CameraSettings> {
        let (size, fps) = self
            .mode
            .split_once('@')
            .with_context(|| format!("invalid camera mode '{}', expected WxH@FPS", self.mode))?;
        let (width, height) = size
            .split_once('x')
            .with_context(|| format!("invalid camera mode '{}', expected WxH@FPS", self.mode))?;

        let width: usize = width.parse().context("camera width is not a number")?;
        let height: usize = height.parse().context("camera height is not a number")?;
        let fps: u32 = fps.parse().context("camera fps is not a number")?;
        if width == 0 || height == 0 || fps == 0 {
            bail!("camera mode '{}' has a zero field", self.mode);
        }

        Ok(CameraSettings {
            width,
            height,
            fps,
            exposure: self.exposure,
            gain: self.gain,
        })
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// ファイルがなければ既定値で起動する
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}
