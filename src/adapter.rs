//! 姿勢推定アダプタ
//!
//! 共有フレームバッファと外部姿勢推定エンジンの橋渡し。sequence_id が
//! 前回処理分から変わったフレームだけを推定し、最初に検出された人物の
//! 25キーポイントを共有2D姿勢バッファへ書き込む。

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::buffer::{FrameReader, SlotWriter};
use crate::lifecycle::{FpsMeter, WorkerState};
use crate::pose::{Pose2d, PoseEstimator};

/// 新データがないときのポーリングスリープ
const IDLE_SLEEP: Duration = Duration::from_millis(5);

/// アダプタのループ本体
///
/// 人物が検出されなかったフレームでは前回の2D姿勢をそのまま残す
/// （ゼロリセットではなく「最後の値を保持」するポリシー）。
pub fn run_adapter(
    camera_id: usize,
    mut estimator: Box<dyn PoseEstimator>,
    frames: FrameReader,
    mut poses: SlotWriter<Pose2d>,
    state: Arc<WorkerState>,
) {
    // エンジンは遅延初期化。失敗したら1フレームも処理せず終了する。
    if let Err(e) = estimator.initialize() {
        error!(camera_id, error = %e, "pose estimator failed to initialize");
        state.mark_stopped();
        return;
    }
    info!(camera_id, "pose adapter started");

    let (width, height) = frames.resolution();
    let mut frame = vec![0u8; frames.frame_len()];
    let mut meter = FpsMeter::new();
    let mut last_seq: u64 = 0;

    while !state.halt_requested() {
        // 同じフレームを再処理しない（推定は新フレームにつき一度だけ）
        if frames.sequence_id() == last_seq {
            thread::sleep(IDLE_SLEEP);
            continue;
        }
        let Some(seq) = frames.snapshot(&mut frame) else {
            thread::sleep(IDLE_SLEEP);
            continue;
        };
        last_seq = seq;

        match estimator.estimate(width, height, &frame) {
            Ok(people) => {
                if let Some(first) = people.first() {
                    poses.publish(*first);
                }
                state.set_fps(meter.tick());
            }
            Err(e) => {
                warn!(camera_id, error = %e, "pose estimation failed, stopping adapter");
                break;
            }
        }
    }

    estimator.shutdown();
    state.mark_stopped();
    info!(camera_id, "pose adapter stopped");
}

/// アダプタを独立スレッドとして起動する
pub fn spawn_adapter(
    camera_id: usize,
    estimator: Box<dyn PoseEstimator>,
    frames: FrameReader,
    poses: SlotWriter<Pose2d>,
    state: Arc<WorkerState>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("pose-adapter-{}", camera_id))
        .spawn(move || run_adapter(camera_id, estimator, frames, poses, state))
        .expect("failed to spawn adapter thread")
}
