//! キャプチャ → 2D姿勢推定 → 三角測量 のエンドツーエンド試験
//!
//! 実カメラ・実推論エンジンなしで、合成カメラと固定出力エンジンを
//! 公開APIだけで配線して動かす。

use std::fs;

use stereopose::buffer::{shared_frame, shared_pose, shared_slot};
use stereopose::calibration::{load_parameters, save_parameters, StereoParameters};
use stereopose::camera::{CameraSettings, SyntheticCamera};
use stereopose::error::PipelineError;
use stereopose::lifecycle::{WorkerId, WorkerKind};
use stereopose::pose::{Keypoint, KeypointIndex, Pose2d, Pose3d, PoseEstimator};
use stereopose::supervisor::Supervisor;
use stereopose::triangulation::CameraRig;

/// 毎フレーム同じ1人分の姿勢を返すエンジン
struct FixedEstimator {
    pose: Pose2d,
}

impl PoseEstimator for FixedEstimator {
    fn estimate(
        &mut self,
        _width: usize,
        _height: usize,
        _frame: &[u8],
    ) -> Result<Vec<Pose2d>, PipelineError> {
        Ok(vec![self.pose])
    }
}

fn nose_pose(x: f32, y: f32, conf: f32) -> Pose2d {
    let mut pose = Pose2d::default();
    pose.keypoints[KeypointIndex::Nose as usize] = Keypoint::new(x, y, conf);
    pose
}

fn small_settings() -> CameraSettings {
    CameraSettings {
        width: 16,
        height: 16,
        fps: 120,
        ..CameraSettings::default()
    }
}

/// f=800, 主点(320,240), R=I, T=(100,0,0) の平行リグ
fn parallel_rig_parameters() -> StereoParameters {
    let mtx = vec![
        vec![800.0, 0.0, 320.0],
        vec![0.0, 800.0, 240.0],
        vec![0.0, 0.0, 1.0],
    ];
    StereoParameters {
        ret: 0.0,
        mtx0: mtx.clone(),
        dist0: vec![vec![0.0; 5]],
        mtx1: mtx,
        dist1: vec![vec![0.0; 5]],
        r: vec![
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.0, 0.0, 1.0],
        ],
        t: vec![vec![100.0], vec![0.0], vec![0.0]],
        e: vec![
            vec![0.0, 0.0, 0.0],
            vec![0.0, 0.0, -100.0],
            vec![0.0, 100.0, 0.0],
        ],
        f: vec![
            vec![0.0, 0.0, 0.0],
            vec![0.0, 0.0, -100.0],
            vec![0.0, 100.0, 0.0],
        ],
    }
}

#[test]
fn full_pipeline_produces_triangulated_nose() {
    // パラメータはファイル経由で受け渡す（本番と同じ経路）
    let dir = std::env::temp_dir().join("stereopose_pipeline_test");
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join("parameters.json");
    save_parameters(&path, &parallel_rig_parameters()).unwrap();
    let params = load_parameters(&path).unwrap();
    let rig = CameraRig::from_parameters(&params).unwrap();

    let mut sup = Supervisor::new();
    let settings = small_settings();

    // カメラ0: 鼻が主点ちょうど、カメラ1: 20px左
    let observations = [nose_pose(320.0, 240.0, 0.9), nose_pose(300.0, 240.0, 0.9)];
    let mut pose_readers = Vec::new();

    for (camera_id, pose) in observations.iter().enumerate() {
        let (frame_writer, frame_reader) = shared_frame(settings.width, settings.height);
        let (pose_writer, pose_reader) = shared_pose();

        let source = SyntheticCamera::open(camera_id, settings).unwrap();
        sup.start_camera(camera_id, Box::new(source), frame_writer)
            .unwrap();
        sup.start_adapter(
            camera_id,
            Box::new(FixedEstimator { pose: *pose }),
            frame_reader,
            pose_writer,
        )
        .unwrap();
        pose_readers.push(pose_reader);
    }

    let (out_writer, out_reader) = shared_slot::<Pose3d>();
    let reader1 = pose_readers.pop().unwrap();
    let reader0 = pose_readers.pop().unwrap();
    sup.start_triangulator(rig, reader0, reader1, out_writer, 0.1)
        .unwrap();
    assert_eq!(sup.worker_count(), 5);

    // 3D姿勢が少なくとも1回公開されるまで待つ
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while out_reader.sequence_id() == 0 {
        assert!(
            std::time::Instant::now() < deadline,
            "triangulator never published"
        );
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    let pose3d = out_reader.read();
    let nose = pose3d.get(KeypointIndex::Nose);
    // 交点はカメラ座標 (0, 0, 4000)、軸入れ替え後 (0, 4000, 0)
    assert!((nose.confidence - 0.81).abs() < 1e-6, "conf={}", nose.confidence);
    assert!(nose.x.abs() < 0.1, "x={}", nose.x);
    assert!((nose.y - 4000.0).abs() < 1.0, "y={}", nose.y);
    assert!(nose.z.abs() < 0.1, "z={}", nose.z);

    // 観測のない関節は無効のまま
    assert_eq!(pose3d.get(KeypointIndex::Neck).confidence, 0.0);

    sup.stop_all();
    assert_eq!(sup.worker_count(), 0);
}

#[test]
fn camera_failure_stops_its_workers_only() {
    let mut sup = Supervisor::new();
    let settings = small_settings();

    // カメラ0は3フレームで死ぬ、カメラ1は正常
    let (writer0, _reader0) = shared_frame(settings.width, settings.height);
    let (writer1, reader1) = shared_frame(settings.width, settings.height);
    sup.start_camera(
        0,
        Box::new(SyntheticCamera::failing_after(0, settings, 3)),
        writer0,
    )
    .unwrap();
    sup.start_camera(1, Box::new(SyntheticCamera::open(1, settings).unwrap()), writer1)
        .unwrap();

    let id0 = WorkerId::new(WorkerKind::CameraReader, 0);
    let id1 = WorkerId::new(WorkerKind::CameraReader, 1);

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while sup.status(id0).map(|s| s.running).unwrap_or(false) {
        assert!(std::time::Instant::now() < deadline, "camera 0 never stopped");
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    // もう一方のカメラは動き続けている
    assert!(sup.status(id1).unwrap().running);
    while reader1.sequence_id() == 0 {
        assert!(std::time::Instant::now() < deadline, "camera 1 never published");
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    sup.reap_finished();
    assert!(sup.status(id0).is_none());

    sup.stop_all();
}

#[test]
fn halt_precedes_join_for_every_worker() {
    let mut sup = Supervisor::new();
    let settings = small_settings();

    let (frame_writer, frame_reader) = shared_frame(settings.width, settings.height);
    let (pose_writer, _pose_reader) = shared_pose();
    sup.start_camera(
        0,
        Box::new(SyntheticCamera::open(0, settings).unwrap()),
        frame_writer,
    )
    .unwrap();
    sup.start_adapter(
        0,
        Box::new(FixedEstimator {
            pose: nose_pose(100.0, 100.0, 0.5),
        }),
        frame_reader,
        pose_writer,
    )
    .unwrap();

    // stop_all が返ってきた時点で全スレッド join 済み
    sup.stop_all();
    assert_eq!(sup.worker_count(), 0);
    assert!(sup.snapshot().is_empty());
}
