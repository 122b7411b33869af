use anyhow::{Context, Result};
use nalgebra::Point2;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing_subscriber::EnvFilter;

use stereopose::calibration::{
    detect_corner_pairs, run_calibration, save_parameters, ChessboardSpec, CornerDetector,
};
use stereopose::config::Config;

const CONFIG_PATH: &str = "config.toml";

/// 記録済みコーナー観測を「画像」として受け取る検出器
///
/// 入力バイト列は [[x, y], ...] のJSON。パース失敗やコーナー数の不一致は
/// 検出失敗（None）として扱う。
struct RecordedCornerDetector;

impl CornerDetector for RecordedCornerDetector {
    fn detect(
        &mut self,
        _width: usize,
        _height: usize,
        image: &[u8],
        board: &ChessboardSpec,
    ) -> Option<Vec<Point2<f64>>> {
        let raw: Vec<[f64; 2]> = serde_json::from_slice(image).ok()?;
        if raw.len() != board.corner_count() {
            return None;
        }
        Some(raw.iter().map(|[x, y]| Point2::new(*x, *y)).collect())
    }
}

/// フォルダ内の "<名前>.json" → 生バイト列のマップを読む
fn load_recordings(dir: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut recordings = BTreeMap::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("コーナーフォルダが開けません: {:?}", dir))?;

    for entry in entries {
        let path = entry?.path();
        if path.extension().map(|e| e != "json").unwrap_or(true) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let bytes =
            fs::read(&path).with_context(|| format!("コーナーファイルが読めません: {:?}", path))?;
        recordings.insert(stem.to_string(), bytes);
    }
    Ok(recordings)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::load_or_default(CONFIG_PATH)?;
    let cal = &config.calibration;
    let board = ChessboardSpec {
        cols: cal.grid_cols,
        rows: cal.grid_rows,
        square_size: cal.square_size,
    };
    let settings = config.camera.settings()?;

    println!("=== ステレオキャリブレーションツール ===");
    println!();
    println!("ボード設定:");
    println!("  コーナー数: {}x{}", board.cols, board.rows);
    println!("  マス辺長: {}mm", board.square_size);
    println!("  カメラ0コーナー: {}", cal.corners_dir_0);
    println!("  カメラ1コーナー: {}", cal.corners_dir_1);
    println!("  出力先: {}", cal.output_path);
    println!();

    // [1/3] 記録済み観測の読み込み（同名ファイルを同一ビューとしてペア化）
    println!("[1/3] コーナー観測を読み込み中...");
    let recs0 = load_recordings(Path::new(&cal.corners_dir_0))?;
    let recs1 = load_recordings(Path::new(&cal.corners_dir_1))?;

    let mut names: Vec<&String> = recs0.keys().chain(recs1.keys()).collect();
    names.sort();
    names.dedup();

    // 片方しかないビューは空バイト列（= 検出失敗）で埋める
    let frame_pairs: Vec<(Vec<u8>, Vec<u8>)> = names
        .iter()
        .map(|name| {
            (
                recs0.get(*name).cloned().unwrap_or_default(),
                recs1.get(*name).cloned().unwrap_or_default(),
            )
        })
        .collect();

    let mut detector = RecordedCornerDetector;
    let pairs = detect_corner_pairs(
        &mut detector,
        &board,
        settings.width,
        settings.height,
        &frame_pairs,
    );
    let complete = pairs
        .iter()
        .filter(|(a, b)| a.is_some() && b.is_some())
        .count();
    println!("  ビュー: {} (両カメラ揃い: {})", pairs.len(), complete);

    // [2/3] キャリブレーション実行
    println!();
    println!("[2/3] キャリブレーション中...");
    let params = run_calibration(&board, &pairs)?;
    println!("  残余再投影誤差: {:.4} px", params.ret);

    // [3/3] 保存
    println!();
    println!("[3/3] パラメータを保存中...");
    if let Some(parent) = Path::new(&cal.output_path).parent() {
        fs::create_dir_all(parent)?;
    }
    save_parameters(&cal.output_path, &params)?;
    println!("保存完了: {}", cal.output_path);

    println!();
    println!("=== キャリブレーション完了 ===");
    Ok(())
}
