/// OpenPose BODY-25 の 25 キーポイントインデックス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum KeypointIndex {
    Nose = 0,
    Neck = 1,
    RightShoulder = 2,
    RightElbow = 3,
    RightWrist = 4,
    LeftShoulder = 5,
    LeftElbow = 6,
    LeftWrist = 7,
    MidHip = 8,
    RightHip = 9,
    RightKnee = 10,
    RightAnkle = 11,
    LeftHip = 12,
    LeftKnee = 13,
    LeftAnkle = 14,
    RightEye = 15,
    LeftEye = 16,
    RightEar = 17,
    LeftEar = 18,
    LeftBigToe = 19,
    LeftSmallToe = 20,
    LeftHeel = 21,
    RightBigToe = 22,
    RightSmallToe = 23,
    RightHeel = 24,
}

impl KeypointIndex {
    pub const COUNT: usize = 25;

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Nose),
            1 => Some(Self::Neck),
            2 => Some(Self::RightShoulder),
            3 => Some(Self::RightElbow),
            4 => Some(Self::RightWrist),
            5 => Some(Self::LeftShoulder),
            6 => Some(Self::LeftElbow),
            7 => Some(Self::LeftWrist),
            8 => Some(Self::MidHip),
            9 => Some(Self::RightHip),
            10 => Some(Self::RightKnee),
            11 => Some(Self::RightAnkle),
            12 => Some(Self::LeftHip),
            13 => Some(Self::LeftKnee),
            14 => Some(Self::LeftAnkle),
            15 => Some(Self::RightEye),
            16 => Some(Self::LeftEye),
            17 => Some(Self::RightEar),
            18 => Some(Self::LeftEar),
            19 => Some(Self::LeftBigToe),
            20 => Some(Self::LeftSmallToe),
            21 => Some(Self::LeftHeel),
            22 => Some(Self::RightBigToe),
            23 => Some(Self::RightSmallToe),
            24 => Some(Self::RightHeel),
            _ => None,
        }
    }
}

/// BODY-25 スケルトンの 24 エッジ（関節インデックスのペア）
///
/// 描画と三角測量候補の反復の両方で使われる。全コンポーネント共通、読み取り専用。
pub const SKELETON_EDGES: [(usize, usize); 24] = [
    (1, 8),
    (1, 2),
    (1, 5),
    (2, 3),
    (3, 4),
    (5, 6),
    (6, 7),
    (8, 9),
    (9, 10),
    (10, 11),
    (8, 12),
    (12, 13),
    (13, 14),
    (1, 0),
    (0, 15),
    (15, 17),
    (0, 16),
    (16, 18),
    (14, 19),
    (19, 20),
    (14, 21),
    (11, 22),
    (22, 23),
    (11, 24),
];

/// 単一2Dキーポイント（元カメラのピクセル座標）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// 信頼度スコア (0.0〜1.0)
    pub confidence: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }

    /// 信頼度が閾値以上か
    pub fn is_valid(&self, threshold: f32) -> bool {
        self.confidence >= threshold
    }
}

impl Default for Keypoint {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            confidence: 0.0,
        }
    }
}

/// 25キーポイントからなる2D姿勢（1カメラ分）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose2d {
    pub keypoints: [Keypoint; KeypointIndex::COUNT],
}

impl Pose2d {
    pub fn new(keypoints: [Keypoint; KeypointIndex::COUNT]) -> Self {
        Self { keypoints }
    }

    pub fn get(&self, index: KeypointIndex) -> &Keypoint {
        &self.keypoints[index as usize]
    }

    /// 全キーポイントの平均信頼度
    pub fn average_confidence(&self) -> f32 {
        let sum: f32 = self.keypoints.iter().map(|k| k.confidence).sum();
        sum / KeypointIndex::COUNT as f32
    }
}

impl Default for Pose2d {
    fn default() -> Self {
        Self {
            keypoints: [Keypoint::default(); KeypointIndex::COUNT],
        }
    }
}

/// 単一3Dキーポイント（カメラ0の光学中心を原点とするワールド座標）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint3d {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// 両カメラの2D信頼度の積
    pub confidence: f32,
}

impl Keypoint3d {
    pub fn new(x: f32, y: f32, z: f32, confidence: f32) -> Self {
        Self { x, y, z, confidence }
    }

    /// 無効な関節（信頼度0）
    pub fn invalid() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0)
    }

    pub fn is_valid(&self, threshold: f32) -> bool {
        self.confidence >= threshold
    }
}

impl Default for Keypoint3d {
    fn default() -> Self {
        Self::invalid()
    }
}

/// 25キーポイントからなる3D姿勢
///
/// 三角測量サイクルごとにゼロから再計算される。平滑化なし。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose3d {
    pub keypoints: [Keypoint3d; KeypointIndex::COUNT],
}

impl Pose3d {
    pub fn new(keypoints: [Keypoint3d; KeypointIndex::COUNT]) -> Self {
        Self { keypoints }
    }

    pub fn get(&self, index: KeypointIndex) -> &Keypoint3d {
        &self.keypoints[index as usize]
    }
}

impl Default for Pose3d {
    fn default() -> Self {
        Self {
            keypoints: [Keypoint3d::default(); KeypointIndex::COUNT],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypoint_index_count() {
        assert_eq!(KeypointIndex::COUNT, 25);
    }

    #[test]
    fn test_keypoint_index_from_index() {
        assert_eq!(KeypointIndex::from_index(0), Some(KeypointIndex::Nose));
        assert_eq!(KeypointIndex::from_index(8), Some(KeypointIndex::MidHip));
        assert_eq!(KeypointIndex::from_index(24), Some(KeypointIndex::RightHeel));
        assert_eq!(KeypointIndex::from_index(25), None);
    }

    #[test]
    fn test_skeleton_edges() {
        assert_eq!(SKELETON_EDGES.len(), 24);
        for (a, b) in SKELETON_EDGES {
            assert!(a < KeypointIndex::COUNT);
            assert!(b < KeypointIndex::COUNT);
            assert_ne!(a, b);
        }
    }

    #[test]
    fn test_keypoint_is_valid() {
        let kp = Keypoint::new(320.0, 240.0, 0.7);
        assert!(kp.is_valid(0.5));
        assert!(!kp.is_valid(0.8));
    }

    #[test]
    fn test_pose_get() {
        let mut keypoints = [Keypoint::default(); KeypointIndex::COUNT];
        keypoints[KeypointIndex::Neck as usize] = Keypoint::new(640.0, 360.0, 0.9);

        let pose = Pose2d::new(keypoints);
        let neck = pose.get(KeypointIndex::Neck);
        assert_eq!(neck.x, 640.0);
        assert_eq!(neck.y, 360.0);
        assert_eq!(neck.confidence, 0.9);
    }

    #[test]
    fn test_pose_average_confidence() {
        let keypoints = [Keypoint::new(0.0, 0.0, 0.5); KeypointIndex::COUNT];
        let pose = Pose2d::new(keypoints);
        assert!((pose.average_confidence() - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_keypoint3d_invalid() {
        let kp = Keypoint3d::invalid();
        assert_eq!(kp.confidence, 0.0);
        assert!(!kp.is_valid(0.1));
    }
}
