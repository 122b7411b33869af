//! ワーカースーパーバイザ
//!
//! コントローラが全ワーカーのスレッドハンドルと制御レコードを一元管理する。
//! 停止は必ず「halt を立てる → join を待つ」の順で行い、ワーカーが
//! 共有バッファへ書き込み得る間はバッファを回収しない。

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::adapter::spawn_adapter;
use crate::buffer::{FrameReader, FrameWriter, SlotReader, SlotWriter};
use crate::camera::{spawn_capture, FrameSource};
use crate::lifecycle::{Coordinator, WorkerId, WorkerKind, WorkerState, WorkerStatus};
use crate::pose::{Pose2d, Pose3d, PoseEstimator};
use crate::triangulation::{spawn_triangulator, CameraRig};

pub struct Supervisor {
    coordinator: Coordinator,
    handles: HashMap<WorkerId, JoinHandle<()>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            coordinator: Coordinator::new(),
            handles: HashMap::new(),
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    fn register(&mut self, id: WorkerId) -> Result<Arc<WorkerState>> {
        if self.handles.contains_key(&id) {
            bail!("worker '{}' is already running", id);
        }
        Ok(self.coordinator.register(id))
    }

    /// キャプチャワーカーを起動する
    pub fn start_camera(
        &mut self,
        camera_id: usize,
        source: Box<dyn FrameSource>,
        writer: FrameWriter,
    ) -> Result<()> {
        let id = WorkerId::new(WorkerKind::CameraReader, camera_id);
        let state = self.register(id)?;
        let handle = spawn_capture(camera_id, source, writer, state);
        self.handles.insert(id, handle);
        Ok(())
    }

    /// 姿勢推定アダプタを起動する
    pub fn start_adapter(
        &mut self,
        camera_id: usize,
        estimator: Box<dyn PoseEstimator>,
        frames: FrameReader,
        poses: SlotWriter<Pose2d>,
    ) -> Result<()> {
        let id = WorkerId::new(WorkerKind::PoseEstimator, camera_id);
        let state = self.register(id)?;
        let handle = spawn_adapter(camera_id, estimator, frames, poses, state);
        self.handles.insert(id, handle);
        Ok(())
    }

    /// 三角測量ワーカーを起動する
    pub fn start_triangulator(
        &mut self,
        rig: CameraRig,
        poses0: SlotReader<Pose2d>,
        poses1: SlotReader<Pose2d>,
        out: SlotWriter<Pose3d>,
        threshold: f32,
    ) -> Result<()> {
        let id = WorkerId::new(WorkerKind::PoseEstimator3d, 0);
        let state = self.register(id)?;
        let handle = spawn_triangulator(rig, poses0, poses1, out, threshold, state);
        self.handles.insert(id, handle);
        Ok(())
    }

    /// ワーカーを停止して join まで待つ
    ///
    /// 知らない id は何もしない（既に停止済みのワーカーの再停止は無害）。
    pub fn stop(&mut self, id: WorkerId) {
        let Some(handle) = self.handles.remove(&id) else {
            return;
        };
        self.coordinator.request_halt(id);
        if handle.join().is_err() {
            warn!(worker = %id, "worker thread panicked");
        }
        self.coordinator.remove(id);
        info!(worker = %id, "worker stopped");
    }

    /// 全ワーカーを停止する
    pub fn stop_all(&mut self) {
        // 先に全員へ halt を配ってから join する（逐次停止より速い）
        let ids: Vec<WorkerId> = self.handles.keys().copied().collect();
        for id in &ids {
            self.coordinator.request_halt(*id);
        }
        for id in ids {
            self.stop(id);
        }
    }

    /// 自発停止したワーカー（デバイス断など）のハンドルを回収する
    pub fn reap_finished(&mut self) {
        let finished: Vec<WorkerId> = self
            .handles
            .keys()
            .filter(|id| {
                self.coordinator
                    .status(**id)
                    .map(|s| !s.running)
                    .unwrap_or(true)
            })
            .copied()
            .collect();
        for id in finished {
            self.stop(id);
        }
    }

    pub fn status(&self, id: WorkerId) -> Option<WorkerStatus> {
        self.coordinator.status(id)
    }

    /// 表示用の全ワーカースナップショット（id順）
    pub fn snapshot(&self) -> Vec<(WorkerId, WorkerStatus)> {
        let mut all = self.coordinator.snapshot();
        all.sort_by_key(|(id, _)| (id.to_string(), id.camera));
        all
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{shared_frame, shared_pose};
    use crate::camera::{CameraSettings, SyntheticCamera};
    use crate::pose::NullEstimator;

    fn small_settings() -> CameraSettings {
        CameraSettings {
            width: 8,
            height: 8,
            fps: 120,
            ..CameraSettings::default()
        }
    }

    #[test]
    fn test_start_and_stop_camera() {
        let mut sup = Supervisor::new();
        let (writer, reader) = shared_frame(8, 8);
        let source = SyntheticCamera::open(0, small_settings()).unwrap();
        sup.start_camera(0, Box::new(source), writer).unwrap();

        while reader.sequence_id() < 3 {
            std::thread::yield_now();
        }
        let id = WorkerId::new(WorkerKind::CameraReader, 0);
        assert!(sup.status(id).unwrap().running);

        sup.stop(id);
        assert_eq!(sup.worker_count(), 0);
        assert!(sup.status(id).is_none());
    }

    #[test]
    fn test_duplicate_start_rejected() {
        let mut sup = Supervisor::new();
        let (writer0, _reader0) = shared_frame(8, 8);
        let (writer1, _reader1) = shared_frame(8, 8);

        let source = SyntheticCamera::open(0, small_settings()).unwrap();
        sup.start_camera(0, Box::new(source), writer0).unwrap();

        let source = SyntheticCamera::open(0, small_settings()).unwrap();
        assert!(sup.start_camera(0, Box::new(source), writer1).is_err());

        sup.stop_all();
    }

    #[test]
    fn test_stop_all_joins_every_worker() {
        let mut sup = Supervisor::new();

        let (frame_writer, frame_reader) = shared_frame(8, 8);
        let (pose_writer, _pose_reader) = shared_pose();
        let source = SyntheticCamera::open(0, small_settings()).unwrap();

        sup.start_camera(0, Box::new(source), frame_writer).unwrap();
        sup.start_adapter(0, Box::new(NullEstimator), frame_reader, pose_writer)
            .unwrap();
        assert_eq!(sup.worker_count(), 2);

        sup.stop_all();
        assert_eq!(sup.worker_count(), 0);
        assert!(sup.snapshot().is_empty());
    }

    #[test]
    fn test_reap_finished_collects_dead_worker() {
        let mut sup = Supervisor::new();
        let (writer, _reader) = shared_frame(8, 8);
        // 2フレームで読み取りに失敗するカメラ → ワーカーは自発停止する
        let source = SyntheticCamera::failing_after(0, small_settings(), 2);
        sup.start_camera(0, Box::new(source), writer).unwrap();

        let id = WorkerId::new(WorkerKind::CameraReader, 0);
        while sup.status(id).map(|s| s.running).unwrap_or(false) {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        sup.reap_finished();
        assert_eq!(sup.worker_count(), 0);
    }

    #[test]
    fn test_unknown_worker_stop_is_noop() {
        let mut sup = Supervisor::new();
        sup.stop(WorkerId::new(WorkerKind::CameraDisplayer, 9));
        assert_eq!(sup.worker_count(), 0);
    }
}
