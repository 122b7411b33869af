//! ライフサイクルコーディネータ
//!
//! ワーカーごとの {running, fps, halt} レコードが唯一のプロセス間制御チャネル。
//! halt はコントローラが一度だけ立て、running はワーカー自身がループ終了時に
//! 一度だけ落とす。応答確認のハンドシェイクはなく、halt を立てた側は
//! 共有バッファを回収する前に必ずワーカーの join を待つ（supervisor 参照）。

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

/// ワーカー種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    CameraReader,
    /// [`crate::buffer::FrameQueue`] からフレームを受け取って表示に回すワーカ
    CameraDisplayer,
    PoseEstimator,
    PoseEstimator3d,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CameraReader => "CameraReader",
            Self::CameraDisplayer => "CameraDisplayer",
            Self::PoseEstimator => "PoseEstimator",
            Self::PoseEstimator3d => "PoseEstimator3D",
        };
        write!(f, "{}", name)
    }
}

/// 型付きワーカーキー（旧来の "<Kind> <id>" 文字列キーの置き換え）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId {
    pub kind: WorkerKind,
    pub camera: usize,
}

impl WorkerId {
    pub fn new(kind: WorkerKind, camera: usize) -> Self {
        Self { kind, camera }
    }
}

impl fmt::Display for WorkerId {
    /// 制御サーフェス向けの旧来表記
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.camera)
    }
}

/// ワーカー1つ分の共有状態。ホットループはロックなしでフラグを読む。
pub struct WorkerState {
    halt: AtomicBool,
    running: AtomicBool,
    fps_bits: AtomicU64,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            halt: AtomicBool::new(false),
            running: AtomicBool::new(true),
            fps_bits: AtomicU64::new(0),
        }
    }

    /// 停止要求。ワーカーは毎イテレーション最低1回これを確認する。
    pub fn request_halt(&self) {
        self.halt.store(true, Ordering::Release);
    }

    pub fn halt_requested(&self) -> bool {
        self.halt.load(Ordering::Acquire)
    }

    /// ループ終了時にワーカー自身が呼ぶ
    pub fn mark_stopped(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_fps(&self, fps: f64) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        f64::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }
}

/// 1 Hz でポーリングされる表示用スナップショット
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerStatus {
    pub running: bool,
    pub fps: f64,
    pub halt: bool,
}

/// プロセスキー付きの制御レコードマップ
///
/// マップ自体はコントローラからの稀な変更のみロックで守る。
/// ワーカーが触るのは登録時に受け取った Arc<WorkerState> だけ。
#[derive(Default)]
pub struct Coordinator {
    workers: Mutex<HashMap<WorkerId, Arc<WorkerState>>>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// レコードを作成して halt=false で登録する。既存なら作り直す。
    pub fn register(&self, id: WorkerId) -> Arc<WorkerState> {
        let state = Arc::new(WorkerState::new());
        self.workers.lock().insert(id, state.clone());
        state
    }

    pub fn get(&self, id: WorkerId) -> Option<Arc<WorkerState>> {
        self.workers.lock().get(&id).cloned()
    }

    pub fn request_halt(&self, id: WorkerId) {
        if let Some(state) = self.get(id) {
            state.request_halt();
        }
    }

    pub fn remove(&self, id: WorkerId) {
        self.workers.lock().remove(&id);
    }

    pub fn status(&self, id: WorkerId) -> Option<WorkerStatus> {
        self.get(id).map(|s| WorkerStatus {
            running: s.is_running(),
            fps: s.fps(),
            halt: s.halt_requested(),
        })
    }

    /// ワーカーが running=false を立てるまでブロックする
    ///
    /// 未登録の id は停止済みとみなして即座に返る。
    pub fn wait_until_stopped(&self, id: WorkerId) {
        while self.status(id).map(|s| s.running).unwrap_or(false) {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    /// 登録済み全ワーカーの状態
    pub fn snapshot(&self) -> Vec<(WorkerId, WorkerStatus)> {
        self.workers
            .lock()
            .iter()
            .map(|(id, s)| {
                (
                    *id,
                    WorkerStatus {
                        running: s.is_running(),
                        fps: s.fps(),
                        halt: s.halt_requested(),
                    },
                )
            })
            .collect()
    }
}

/// 直近60サンプルの移動平均からFPSを算出する
pub struct FpsMeter {
    intervals: Vec<f64>,
    prev: Instant,
}

impl FpsMeter {
    const MAX_SAMPLES: usize = 60;

    pub fn new() -> Self {
        Self {
            intervals: vec![1.0],
            prev: Instant::now(),
        }
    }

    /// イテレーションごとに呼び、現在のFPSを返す
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        self.intervals.push(now.duration_since(self.prev).as_secs_f64());
        if self.intervals.len() > Self::MAX_SAMPLES {
            let drop = self.intervals.len() - Self::MAX_SAMPLES;
            self.intervals.drain(..drop);
        }
        self.prev = now;
        let mean: f64 = self.intervals.iter().sum::<f64>() / self.intervals.len() as f64;
        if mean > 0.0 {
            1.0 / mean
        } else {
            0.0
        }
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new()
    }
}
