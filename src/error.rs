use thiserror::Error;

/// パイプライン各ワーカーの失敗分類
///
/// DegenerateGeometry（平行レイ）はエラーではなく三角測量側の
/// フォールバックで処理されるため、ここには含まれない。
#[derive(Debug, Error)]
pub enum PipelineError {
    /// カメラが開けない。該当キャプチャプロデューサにとって致命的。
    #[error("camera {camera_id} unavailable: {reason}")]
    DeviceUnavailable { camera_id: usize, reason: String },

    /// 単一フレームの読み取り失敗。ループは終了し running=false になる。
    #[error("camera {camera_id} frame read failed")]
    ReadFailure { camera_id: usize },

    /// 外部姿勢推定エンジンのロード失敗。アダプタは1フレームも処理せず終了する。
    #[error("pose estimator unavailable: {reason}")]
    EstimatorUnavailable { reason: String },

    /// 有効なチェスボードペアが不足。キャリブレーションは中断、結果は保存されない。
    #[error("not enough calibration samples (got {got}, need >= {need})")]
    InsufficientCalibrationSamples { got: usize, need: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = PipelineError::DeviceUnavailable {
            camera_id: 1,
            reason: "busy".to_string(),
        };
        assert_eq!(e.to_string(), "camera 1 unavailable: busy");

        let e = PipelineError::InsufficientCalibrationSamples { got: 2, need: 3 };
        assert!(e.to_string().contains("got 2"));
    }
}
