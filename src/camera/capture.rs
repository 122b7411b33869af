use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{info, warn};

use crate::buffer::FrameWriter;
use crate::camera::FrameSource;
use crate::lifecycle::{FpsMeter, WorkerState};

/// キャプチャプロデューサのループ本体
///
/// デバイスから1フレームずつ読み、共有バッファへバイト単位でコピーして
/// sequence_id を進める。キューも背圧もなし（最新優先）。読み取り失敗で
/// ループは終了し、自分で running=false を立てる。
pub fn run_capture(
    camera_id: usize,
    mut source: Box<dyn FrameSource>,
    mut writer: FrameWriter,
    state: Arc<WorkerState>,
) {
    let (width, height) = source.resolution();
    info!(camera_id, width, height, "capture started");

    let mut frame = vec![0u8; writer.frame_len()];
    let mut meter = FpsMeter::new();

    while !state.halt_requested() {
        match source.read(&mut frame) {
            Ok(()) => {
                writer.publish(&frame);
                state.set_fps(meter.tick());
            }
            Err(e) => {
                warn!(camera_id, error = %e, "frame read failed, stopping capture");
                break;
            }
        }
    }

    state.mark_stopped();
    info!(camera_id, "released camera");
}

/// キャプチャプロデューサを独立スレッドとして起動する
pub fn spawn_capture(
    camera_id: usize,
    source: Box<dyn FrameSource>,
    writer: FrameWriter,
    state: Arc<WorkerState>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("capture-{}", camera_id))
        .spawn(move || run_capture(camera_id, source, writer, state))
        .expect("failed to spawn capture thread")
}
