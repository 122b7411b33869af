use crate::error::PipelineError;
use crate::pose::Pose2d;

/// 外部姿勢推定エンジンのインターフェース
///
/// 生BGR画像1枚を受け取り、検出した人物ごとの25キーポイントを返す。
/// エンジン内部（ニューラルネット推論）はブラックボックスとして扱う。
pub trait PoseEstimator: Send {
    /// モデル/セッションの初期化。アダプタが初回使用時に一度だけ呼ぶ。
    fn initialize(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }

    /// 1フレームを推定する。検出人数分の姿勢を返す（0人なら空）。
    fn estimate(
        &mut self,
        width: usize,
        height: usize,
        frame: &[u8],
    ) -> Result<Vec<Pose2d>, PipelineError>;

    /// アダプタのループ終了時に一度だけ呼ばれる
    fn shutdown(&mut self) {}
}

/// 何も検出しないエンジン（ハードウェアなし実行用）
#[derive(Debug, Default)]
pub struct NullEstimator;

impl PoseEstimator for NullEstimator {
    fn estimate(
        &mut self,
        _width: usize,
        _height: usize,
        _frame: &[u8],
    ) -> Result<Vec<Pose2d>, PipelineError> {
        Ok(Vec::new())
    }
}

/// 固定シーケンスを順に返すエンジン（テスト・リプレイ用）
///
/// シーケンスを消費し尽くした後は「検出なし」を返し続ける。
/// 呼び出し回数を数えるので、フレームごとに一度しか推論しない
/// というアダプタの性質を検証できる。
pub struct ReplayEstimator {
    outputs: Vec<Option<Pose2d>>,
    cursor: usize,
    calls: usize,
}

impl ReplayEstimator {
    pub fn new(outputs: Vec<Option<Pose2d>>) -> Self {
        Self {
            outputs,
            cursor: 0,
            calls: 0,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl PoseEstimator for ReplayEstimator {
    fn estimate(
        &mut self,
        _width: usize,
        _height: usize,
        _frame: &[u8],
    ) -> Result<Vec<Pose2d>, PipelineError> {
        self.calls += 1;
        let out = self.outputs.get(self.cursor).cloned().flatten();
        self.cursor += 1;
        Ok(out.map(|p| vec![p]).unwrap_or_default())
    }
}

/// 初期化に失敗するエンジン（EstimatorUnavailable経路のテスト用）
#[derive(Debug, Default)]
pub struct UnavailableEstimator;

impl PoseEstimator for UnavailableEstimator {
    fn initialize(&mut self) -> Result<(), PipelineError> {
        Err(PipelineError::EstimatorUnavailable {
            reason: "engine failed to load".to_string(),
        })
    }

    fn estimate(
        &mut self,
        _width: usize,
        _height: usize,
        _frame: &[u8],
    ) -> Result<Vec<Pose2d>, PipelineError> {
        unreachable!("estimate must not be called when initialize failed")
    }
}
