//! カメラごとの共有フレーム/姿勢バッファ
//!
//! 単一ライタ・複数リーダ。2面の固定バッファとアトミックな公開インデックスで
//! 構成し、リーダは常に完成したフレームだけを観測する（ロックなし）。
//! 新フレームの検出は単調増加する sequence_id の変化のみで行う。

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};

use crate::pose::Pose2d;

/// 書き込み中プレーンのバージョンは奇数になる。
/// リーダはコピー前後でバージョンが一致する（かつ偶数の）ときだけ採用する。
struct Plane {
    version: AtomicU64,
    data: UnsafeCell<Box<[u8]>>,
}

struct FrameInner {
    width: usize,
    height: usize,
    planes: [Plane; 2],
    /// 公開中プレーンのインデックス (0/1)
    front: AtomicUsize,
    /// フレームごとに1増える。0 = まだ1枚も書かれていない。
    sequence: AtomicU64,
}

// SAFETY: ライタは FrameWriter を通じてのみ back プレーンに書き、
// リーダは version チェックで書き込み中のコピーを破棄して再試行する。
unsafe impl Sync for FrameInner {}
unsafe impl Send for FrameInner {}

/// 共有フレームバッファを作成し、ライタとリーダに分割する
///
/// バッファは width × height × 3 バイト (BGR) 固定。
pub fn shared_frame(width: usize, height: usize) -> (FrameWriter, FrameReader) {
    let len = width * height * 3;
    let inner = Arc::new(FrameInner {
        width,
        height,
        planes: [
            Plane {
                version: AtomicU64::new(0),
                data: UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
            },
            Plane {
                version: AtomicU64::new(0),
                data: UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
            },
        ],
        front: AtomicUsize::new(0),
        sequence: AtomicU64::new(0),
    });
    (
        FrameWriter {
            inner: inner.clone(),
        },
        FrameReader { inner },
    )
}

/// フレームバッファの唯一のライタ。Clone 不可。
pub struct FrameWriter {
    inner: Arc<FrameInner>,
}

impl FrameWriter {
    pub fn resolution(&self) -> (usize, usize) {
        (self.inner.width, self.inner.height)
    }

    pub fn frame_len(&self) -> usize {
        self.inner.width * self.inner.height * 3
    }

    /// フレームをバイト単位でコピーして公開し、sequence_id を進める
    ///
    /// 「最新優先」: 未読の旧フレームは黙って上書きされる。
    pub fn publish(&mut self, src: &[u8]) {
        let back = 1 - self.inner.front.load(Ordering::Relaxed);
        let plane = &self.inner.planes[back];

        // 奇数 = 書き込み中。Acquire RMW なので後続のデータ書き込みが
        // このインクリメントより前へ並び替わらない。
        plane.version.fetch_add(1, Ordering::Acquire);
        // SAFETY: back プレーンにはライタ以外書かない。リーダは version が
        // 不一致のコピーを必ず破棄する。
        unsafe {
            let dst = &mut *plane.data.get();
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
        }
        plane.version.fetch_add(1, Ordering::Release); // 偶数 = 完了

        self.inner.front.store(back, Ordering::Release);
        self.inner.sequence.fetch_add(1, Ordering::Release);
    }
}

/// フレームバッファのリーダ。複数クローン可。
#[derive(Clone)]
pub struct FrameReader {
    inner: Arc<FrameInner>,
}

impl FrameReader {
    pub fn resolution(&self) -> (usize, usize) {
        (self.inner.width, self.inner.height)
    }

    pub fn frame_len(&self) -> usize {
        self.inner.width * self.inner.height * 3
    }

    /// 現在の sequence_id。新フレームが公開されるたびに増える。
    pub fn sequence_id(&self) -> u64 {
        self.inner.sequence.load(Ordering::Acquire)
    }

    /// 公開中のフレームを dst にコピーし、その時点の sequence_id を返す
    ///
    /// まだ1枚も書かれていなければ None。
    pub fn snapshot(&self, dst: &mut [u8]) -> Option<u64> {
        let seq = self.inner.sequence.load(Ordering::Acquire);
        if seq == 0 {
            return None;
        }
        loop {
            let front = self.inner.front.load(Ordering::Acquire);
            let plane = &self.inner.planes[front];
            let v1 = plane.version.load(Ordering::Acquire);
            if v1 % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            // SAFETY: コピーは書き込み中のプレーンと競合し得るので volatile の
            // バイト読み出しで行い、version 不一致なら破棄して再試行する。
            unsafe {
                let src = (*plane.data.get()).as_ptr();
                let n = (&*plane.data.get()).len().min(dst.len());
                for (i, out) in dst[..n].iter_mut().enumerate() {
                    *out = std::ptr::read_volatile(src.add(i));
                }
            }
            // コピーの読み出しが v2 のロードより後へ沈まないようにする
            fence(Ordering::Acquire);
            let v2 = plane.version.load(Ordering::Relaxed);
            if v1 == v2 {
                return Some(self.inner.sequence.load(Ordering::Acquire));
            }
        }
    }
}

/// Copy 値用の共有スロット（2D姿勢、3D姿勢の出力など）
///
/// フレームバッファと同じ2面+公開インデックス方式。値が小さいので
/// バージョン再試行は不要に見えるが、同じ規約で統一している。
struct SlotInner<T: Copy> {
    planes: [Plane2<T>; 2],
    front: AtomicUsize,
    sequence: AtomicU64,
}

struct Plane2<T: Copy> {
    version: AtomicU64,
    data: UnsafeCell<T>,
}

unsafe impl<T: Copy + Send> Sync for SlotInner<T> {}
unsafe impl<T: Copy + Send> Send for SlotInner<T> {}

pub fn shared_slot<T: Copy + Send + Default>() -> (SlotWriter<T>, SlotReader<T>) {
    let inner = Arc::new(SlotInner {
        planes: [
            Plane2 {
                version: AtomicU64::new(0),
                data: UnsafeCell::new(T::default()),
            },
            Plane2 {
                version: AtomicU64::new(0),
                data: UnsafeCell::new(T::default()),
            },
        ],
        front: AtomicUsize::new(0),
        sequence: AtomicU64::new(0),
    });
    (
        SlotWriter {
            inner: inner.clone(),
        },
        SlotReader { inner },
    )
}

/// スロットの唯一のライタ
pub struct SlotWriter<T: Copy + Send> {
    inner: Arc<SlotInner<T>>,
}

impl<T: Copy + Send> SlotWriter<T> {
    /// 値をその場で上書きして公開する（履歴は持たない）
    pub fn publish(&mut self, value: T) {
        let back = 1 - self.inner.front.load(Ordering::Relaxed);
        let plane = &self.inner.planes[back];
        plane.version.fetch_add(1, Ordering::Acquire);
        // SAFETY: FrameWriter::publish と同じ規約
        unsafe {
            *plane.data.get() = value;
        }
        plane.version.fetch_add(1, Ordering::Release);
        self.inner.front.store(back, Ordering::Release);
        self.inner.sequence.fetch_add(1, Ordering::Release);
    }
}

/// スロットのリーダ。複数クローン可。
pub struct SlotReader<T: Copy + Send> {
    inner: Arc<SlotInner<T>>,
}

impl<T: Copy + Send> Clone for SlotReader<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Copy + Send> SlotReader<T> {
    pub fn sequence_id(&self) -> u64 {
        self.inner.sequence.load(Ordering::Acquire)
    }

    /// 現在の値を読む。鮮度チェックはしない（毎サイクルそのまま消費する用途）。
    pub fn read(&self) -> T {
        loop {
            let front = self.inner.front.load(Ordering::Acquire);
            let plane = &self.inner.planes[front];
            let v1 = plane.version.load(Ordering::Acquire);
            if v1 % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            // SAFETY: 書き込み中の値を読む可能性があるので volatile で読み、
            // version 一致を確認できるまで再試行する
            let value = unsafe { std::ptr::read_volatile(plane.data.get()) };
            fence(Ordering::Acquire);
            let v2 = plane.version.load(Ordering::Relaxed);
            if v1 == v2 {
                return value;
            }
        }
    }
}

/// 2D姿勢用の共有バッファペア
pub fn shared_pose() -> (SlotWriter<Pose2d>, SlotReader<Pose2d>) {
    shared_slot()
}

/// キャプチャ/表示間の有界フレームキュー（容量5、満杯時は最古を捨てる）
///
/// 消費側は [`crate::lifecycle::WorkerKind::CameraDisplayer`]。表示ウィンドウは
/// 外部プロセスなので、表示ワーカはここから取り出したフレームを引き渡す。
pub struct FrameQueue {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl FrameQueue {
    pub const CAPACITY: usize = 5;

    pub fn new() -> Self {
        let (tx, rx) = bounded(Self::CAPACITY);
        Self { tx, rx }
    }

    /// フレームを投入する。満杯なら最古の1枚を破棄してから入れる。
    pub fn push(&self, frame: Vec<u8>) {
        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                let _ = self.rx.try_recv();
                let _ = self.tx.try_send(frame);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn pop(&self) -> Option<Vec<u8>> {
        match self.rx.try_recv() {
            Ok(frame) => Some(frame),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::{Keypoint, KeypointIndex};

    #[test]
    fn test_frame_roundtrip() {
        let (mut writer, reader) = shared_frame(4, 2);
        assert_eq!(reader.frame_len(), 24);
        assert_eq!(reader.sequence_id(), 0);

        let mut dst = vec![0u8; 24];
        assert_eq!(reader.snapshot(&mut dst), None);

        let src: Vec<u8> = (0..24).collect();
        writer.publish(&src);
        assert_eq!(reader.sequence_id(), 1);
        assert_eq!(reader.snapshot(&mut dst), Some(1));
        assert_eq!(dst, src);
    }

    #[test]
    fn test_frame_latest_wins() {
        let (mut writer, reader) = shared_frame(2, 1);
        writer.publish(&[1, 1, 1, 1, 1, 1]);
        writer.publish(&[2, 2, 2, 2, 2, 2]);
        writer.publish(&[3, 3, 3, 3, 3, 3]);

        let mut dst = vec![0u8; 6];
        assert_eq!(reader.snapshot(&mut dst), Some(3));
        assert_eq!(dst, vec![3; 6]);
    }

    #[test]
    fn test_pose_slot() {
        let (mut writer, reader) = shared_pose();
        let initial = reader.read();
        assert_eq!(initial.average_confidence(), 0.0);

        let mut pose = Pose2d::default();
        pose.keypoints[KeypointIndex::Nose as usize] = Keypoint::new(320.0, 240.0, 0.9);
        writer.publish(pose);

        assert_eq!(reader.sequence_id(), 1);
        let read = reader.read();
        assert_eq!(read.get(KeypointIndex::Nose).confidence, 0.9);
    }

    #[test]
    fn test_queue_overwrites_oldest_when_full() {
        let queue = FrameQueue::new();
        for i in 0..7u8 {
            queue.push(vec![i]);
        }
        assert_eq!(queue.len(), FrameQueue::CAPACITY);
        // 0と1が捨てられ、2が先頭に残る
        assert_eq!(queue.pop(), Some(vec![2]));
        assert_eq!(queue.pop(), Some(vec![3]));
    }

    #[test]
    fn test_concurrent_reader_sees_complete_frames() {
        let (mut writer, reader) = shared_frame(64, 64);
        let len = reader.frame_len();

        let handle = std::thread::spawn(move || {
            for i in 1..=200u8 {
                writer.publish(&vec![i; len]);
            }
        });

        let mut dst = vec![0u8; len];
        for _ in 0..200 {
            if reader.snapshot(&mut dst).is_some() {
                let first = dst[0];
                assert!(dst.iter().all(|&b| b == first), "torn frame observed");
            }
        }
        handle.join().unwrap();
    }

    #[test]
    fn test_frame_stress_no_torn_snapshot_under_plane_reuse() {
        let (mut writer, reader) = shared_frame(32, 32);
        let len = reader.frame_len();

        // 2000 枚公開するので両プレーンが何度も再利用される
        let writer_handle = std::thread::spawn(move || {
            for i in 0..2000u32 {
                writer.publish(&vec![(i % 251) as u8; len]);
            }
        });

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let reader = reader.clone();
                std::thread::spawn(move || {
                    let mut dst = vec![0u8; len];
                    let mut seen = 0u64;
                    while seen < 500 {
                        if reader.snapshot(&mut dst).is_some() {
                            let first = dst[0];
                            assert!(dst.iter().all(|&b| b == first), "torn frame observed");
                            seen += 1;
                        }
                    }
                })
            })
            .collect();

        writer_handle.join().unwrap();
        for handle in readers {
            handle.join().unwrap();
        }
    }

    #[derive(Clone, Copy)]
    struct Paired {
        a: u64,
        b: u64,
    }

    impl Default for Paired {
        fn default() -> Self {
            Paired { a: 0, b: !0 }
        }
    }

    #[test]
    fn test_slot_stress_paired_fields_stay_consistent() {
        let (mut writer, reader) = shared_slot::<Paired>();

        // 常に b == !a を保って公開する
        let writer_handle = std::thread::spawn(move || {
            for i in 1..=20000u64 {
                writer.publish(Paired { a: i, b: !i });
            }
        });

        let reader_handle = std::thread::spawn(move || {
            for _ in 0..20000 {
                let value = reader.read();
                assert_eq!(value.b, !value.a, "torn slot value observed");
            }
        });

        writer_handle.join().unwrap();
        reader_handle.join().unwrap();
    }
}
