use crate::error::PipelineError;

/// カメラデバイスへ要求する設定
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraSettings {
    pub width: usize,
    pub height: usize,
    pub fps: u32,
    pub exposure: i32,
    pub gain: i32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 60,
            exposure: -7,
            gain: 200,
        }
    }
}

/// 生BGRフレームを返すフレームソース（実デバイスは外部コラボレータ）
///
/// read はデバイス読み取りの間ブロックしてよい。失敗は ReadFailure として
/// 返し、呼び出し側のキャプチャループはそこで終了する。
pub trait FrameSource: Send {
    fn resolution(&self) -> (usize, usize);

    /// 1フレームを dst (width*height*3 バイト、BGR) に読み込む
    fn read(&mut self, dst: &mut [u8]) -> Result<(), PipelineError>;
}

/// ハードウェアなしでパイプラインを動かすための合成カメラ
///
/// フレームごとに変化する決定的なテストパターンを生成する。
/// fps > 0 なら実デバイスのブロッキング読み出しを模して1フレーム分スリープする。
#[derive(Debug)]
pub struct SyntheticCamera {
    camera_id: usize,
    settings: CameraSettings,
    frame_count: u64,
    /// Some(n) なら n フレーム読み出した後に ReadFailure を返す
    fail_after: Option<u64>,
    paced: bool,
}

impl SyntheticCamera {
    pub fn open(camera_id: usize, settings: CameraSettings) -> Result<Self, PipelineError> {
        if settings.width == 0 || settings.height == 0 {
            return Err(PipelineError::DeviceUnavailable {
                camera_id,
                reason: "zero resolution requested".to_string(),
            });
        }
        Ok(Self {
            camera_id,
            settings,
            frame_count: 0,
            fail_after: None,
            paced: settings.fps > 0,
        })
    }

    /// n フレーム後に読み取り失敗するソース（デバイス断のシミュレーション）
    pub fn failing_after(camera_id: usize, settings: CameraSettings, n: u64) -> Self {
        Self {
            camera_id,
            settings,
            frame_count: 0,
            fail_after: Some(n),
            paced: false,
        }
    }

    /// ペーシングなし（テスト用、最大速度で読める）
    pub fn unpaced(camera_id: usize, settings: CameraSettings) -> Self {
        Self {
            camera_id,
            settings,
            frame_count: 0,
            fail_after: None,
            paced: false,
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.frame_count
    }
}

impl FrameSource for SyntheticCamera {
    fn resolution(&self) -> (usize, usize) {
        (self.settings.width, self.settings.height)
    }

    fn read(&mut self, dst: &mut [u8]) -> Result<(), PipelineError> {
        if let Some(limit) = self.fail_after {
            if self.frame_count >= limit {
                return Err(PipelineError::ReadFailure {
                    camera_id: self.camera_id,
                });
            }
        }
        if self.paced {
            std::thread::sleep(std::time::Duration::from_secs_f64(
                1.0 / self.settings.fps as f64,
            ));
        }

        let w = self.settings.width;
        let seed = self.frame_count as usize + self.camera_id * 7;
        for (i, px) in dst.chunks_exact_mut(3).enumerate() {
            let x = i % w;
            let y = i / w;
            px[0] = ((x + seed) % 256) as u8;
            px[1] = ((y + seed) % 256) as u8;
            px[2] = (seed % 256) as u8;
        }
        self.frame_count += 1;
        Ok(())
    }
}
