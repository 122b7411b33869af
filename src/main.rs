use anyhow::Result;
use std::io::{self, Write};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use stereopose::buffer::{shared_frame, shared_pose, shared_slot};
use stereopose::calibration::load_parameters;
use stereopose::camera::SyntheticCamera;
use stereopose::config::Config;
use stereopose::lifecycle::{WorkerId, WorkerKind};
use stereopose::pose::{NullEstimator, Pose3d};
use stereopose::supervisor::Supervisor;
use stereopose::triangulation::CameraRig;

const CONFIG_PATH: &str = "config.toml";
const CAMERA_IDS: [usize; 2] = [0, 1];

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::load_or_default(CONFIG_PATH)?;
    let mut supervisor = Supervisor::new();

    println!(
        "=== Stereopose {} - コントロールパネル ===",
        env!("GIT_VERSION")
    );
    println!();
    println!("コマンド:");
    println!("  start            - 全ワーカー起動");
    println!("  halt cam <id>    - キャプチャ停止 (例: halt cam 0)");
    println!("  halt pose <id>   - 2D姿勢推定停止");
    println!("  halt 3d          - 三角測量停止");
    println!("  s                - 状態表示");
    println!("  watch            - 1秒おきに状態表示 (10秒間)");
    println!("  q                - 全停止して終了");
    println!();

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let parts: Vec<&str> = input.trim().split_whitespace().collect();

        if parts.is_empty() {
            continue;
        }

        match parts[0] {
            "start" => {
                if supervisor.worker_count() > 0 {
                    println!("既に起動中です（halt 後は q で終了して再起動してください）");
                    continue;
                }
                start_pipeline(&mut supervisor, &config)?;
                println!("起動しました");
            }
            "halt" => match parse_worker(&parts[1..]) {
                Some(id) => {
                    supervisor.stop(id);
                    println!("停止: {}", id);
                }
                None => println!("不明なワーカー指定です"),
            },
            "s" => {
                supervisor.reap_finished();
                print_status(&supervisor);
            }
            "watch" => {
                for _ in 0..10 {
                    supervisor.reap_finished();
                    print_status(&supervisor);
                    if supervisor.worker_count() == 0 {
                        break;
                    }
                    std::thread::sleep(std::time::Duration::from_secs(1));
                }
            }
            "q" => {
                supervisor.stop_all();
                println!("終了します");
                break;
            }
            _ => {
                println!("不明なコマンド: {}", parts[0]);
            }
        }
    }

    Ok(())
}

fn print_status(supervisor: &Supervisor) {
    for (id, status) in supervisor.snapshot() {
        println!(
            "  {:<18} running={:<5} fps={:6.1} halt={}",
            id.to_string(),
            status.running,
            status.fps,
            status.halt
        );
    }
    if supervisor.worker_count() == 0 {
        println!("  (ワーカーなし)");
    }
}

/// "cam 0" / "pose 1" / "3d" をワーカーキーに変換する
fn parse_worker(parts: &[&str]) -> Option<WorkerId> {
    match parts {
        ["cam", id] => Some(WorkerId::new(WorkerKind::CameraReader, id.parse().ok()?)),
        ["pose", id] => Some(WorkerId::new(WorkerKind::PoseEstimator, id.parse().ok()?)),
        ["3d"] => Some(WorkerId::new(WorkerKind::PoseEstimator3d, 0)),
        _ => None,
    }
}

/// カメラ2台 + 2Dアダプタ2つ + 三角測量の全配線を組んで起動する
///
/// キャリブレーションファイルがなければ三角測量だけ省いて起動する。
fn start_pipeline(supervisor: &mut Supervisor, config: &Config) -> Result<()> {
    let settings = config.camera.settings()?;
    let mut pose_readers = Vec::new();

    for camera_id in CAMERA_IDS {
        let (frame_writer, frame_reader) = shared_frame(settings.width, settings.height);
        let (pose_writer, pose_reader) = shared_pose();

        let source = SyntheticCamera::open(camera_id, settings)?;
        supervisor.start_camera(camera_id, Box::new(source), frame_writer)?;
        supervisor.start_adapter(
            camera_id,
            Box::new(NullEstimator),
            frame_reader,
            pose_writer,
        )?;
        pose_readers.push(pose_reader);
    }
    match load_parameters(&config.calibration.output_path) {
        Ok(params) => {
            let [reader0, reader1]: [_; 2] = pose_readers
                .try_into()
                .map_err(|_| anyhow::anyhow!("expected exactly two cameras"))?;
            let rig = CameraRig::from_parameters(&params)?;
            let (out_writer, _out_reader) = shared_slot::<Pose3d>();
            supervisor.start_triangulator(
                rig,
                reader0,
                reader1,
                out_writer,
                config.pipeline.confidence_threshold,
            )?;
        }
        Err(e) => {
            warn!(
                path = %config.calibration.output_path,
                error = %e,
                "キャリブレーションパラメータが読めないため三角測量は起動しません"
            );
        }
    }

    Ok(())
}
