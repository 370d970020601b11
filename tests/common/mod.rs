#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{Rgb, RgbImage};
use people_flow::detector::{DetectionFilter, Detector, TrackedFrame, TrackingStream};
use people_flow::error::{PeopleFlowError, Result};
use people_flow::metadata::{DetectionBox, VideoMetadata};
use people_flow::video_processor::{FrameReader, FrameSink, OutputCodec, VideoBackend};

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 48;

pub fn blank_frame() -> RgbImage {
    RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([40, 40, 40]))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// 写出结果的记录
#[derive(Debug, Default, Clone)]
pub struct SinkRecord {
    pub frames: usize,
    pub finished: bool,
    pub codec: Option<OutputCodec>,
}

/// 内存中的视频后端：按文件名登记视频，写出的帧只计数
#[derive(Default)]
pub struct FakeBackend {
    videos: HashMap<String, u64>,
    rejected: Vec<OutputCodec>,
    pub outputs: Arc<Mutex<HashMap<PathBuf, SinkRecord>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个可打开的视频，未登记的视频在探测时失败
    pub fn with_video(mut self, name: &str, total_frames: u64) -> Self {
        self.videos.insert(name.to_string(), total_frames);
        self
    }

    pub fn rejecting(mut self, codec: OutputCodec) -> Self {
        self.rejected.push(codec);
        self
    }

    pub fn output(&self, path: &Path) -> Option<SinkRecord> {
        self.outputs.lock().unwrap().get(path).cloned()
    }
}

impl VideoBackend for FakeBackend {
    fn probe(&self, path: &Path) -> Result<VideoMetadata> {
        let total_frames =
            self.videos
                .get(&file_name(path))
                .copied()
                .ok_or_else(|| PeopleFlowError::VideoOpen {
                    path: path.to_path_buf(),
                    reason: "moov atom not found".to_string(),
                })?;
        Ok(VideoMetadata {
            fps: 25.0,
            width: WIDTH,
            height: HEIGHT,
            total_frames,
        })
    }

    fn open_reader(&self, _path: &Path, meta: &VideoMetadata) -> Result<FrameReader> {
        let n = meta.total_frames as usize;
        Ok(Box::new((0..n).map(|_| Ok(blank_frame()))))
    }

    fn open_writer(
        &self,
        path: &Path,
        codec: OutputCodec,
        _meta: &VideoMetadata,
    ) -> Result<Box<dyn FrameSink>> {
        if self.rejected.contains(&codec) {
            return Err(PeopleFlowError::OutputOpen {
                path: path.to_path_buf(),
                reason: format!("encoder {} not available", codec.fourcc()),
            });
        }
        std::fs::write(path, b"")?;
        self.outputs.lock().unwrap().insert(
            path.to_path_buf(),
            SinkRecord {
                codec: Some(codec),
                ..Default::default()
            },
        );
        Ok(Box::new(RecordingSink {
            path: path.to_path_buf(),
            outputs: self.outputs.clone(),
        }))
    }
}

struct RecordingSink {
    path: PathBuf,
    outputs: Arc<Mutex<HashMap<PathBuf, SinkRecord>>>,
}

impl FrameSink for RecordingSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        assert_eq!(frame.dimensions(), (WIDTH, HEIGHT));
        if let Some(record) = self.outputs.lock().unwrap().get_mut(&self.path) {
            record.frames += 1;
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        if let Some(record) = self.outputs.lock().unwrap().get_mut(&self.path) {
            record.finished = true;
        }
        Ok(())
    }
}

/// 每帧出现的 ID 列表
pub type Script = Vec<Vec<u64>>;

/// 按脚本产出跟踪结果的检测器
#[derive(Default)]
pub struct ScriptedDetector {
    scripts: HashMap<String, Script>,
    fail_after: HashMap<String, usize>,
    panic_on: Option<String>,
    frame_delay: Duration,
}

impl ScriptedDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, video: &str, script: Script) -> Self {
        self.scripts.insert(video.to_string(), script);
        self
    }

    /// 产出 `frames` 帧后返回错误
    pub fn failing_after(mut self, video: &str, frames: usize) -> Self {
        self.fail_after.insert(video.to_string(), frames);
        self
    }

    pub fn panicking_on(mut self, video: &str) -> Self {
        self.panic_on = Some(video.to_string());
        self
    }

    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }
}

pub fn tracked_boxes(ids: &[u64]) -> Vec<DetectionBox> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| {
            let x = 2 + i as i32 * 12;
            DetectionBox::new(x, 4, x + 10, 40, 0.9).with_identity(*id)
        })
        .collect()
}

impl Detector for ScriptedDetector {
    fn open_tracking_stream(
        &mut self,
        video_path: &Path,
        _filter: &DetectionFilter,
    ) -> Result<TrackingStream<'_>> {
        let name = file_name(video_path);
        if self.panic_on.as_deref() == Some(name.as_str()) {
            panic!("tracker state corrupted");
        }
        let script = self.scripts.get(&name).cloned().unwrap_or_default();
        let fail_after = self.fail_after.get(&name).copied();
        let delay = self.frame_delay;

        let frames = script.into_iter().enumerate().map(move |(i, ids)| {
            std::thread::sleep(delay);
            if fail_after == Some(i) {
                return Err(PeopleFlowError::Inference("CUDA out of memory".to_string()));
            }
            Ok(TrackedFrame {
                frame: blank_frame(),
                detections: tracked_boxes(&ids),
            })
        });
        Ok(Box::new(frames))
    }

    fn detect_single_frame(
        &mut self,
        _frame: &RgbImage,
        _filter: &DetectionFilter,
    ) -> Result<Vec<DetectionBox>> {
        Ok(vec![])
    }
}

/// 单帧检测器：记录是否出现并发调用
pub struct SlowDetector {
    pub delay: Duration,
    pub people: usize,
    pub in_flight: Arc<AtomicBool>,
    pub overlapped: Arc<AtomicBool>,
    pub calls: Arc<AtomicUsize>,
    pub fail: bool,
}

impl SlowDetector {
    pub fn new(delay: Duration, people: usize) -> Self {
        Self {
            delay,
            people,
            in_flight: Arc::new(AtomicBool::new(false)),
            overlapped: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(AtomicUsize::new(0)),
            fail: false,
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

impl Detector for SlowDetector {
    fn open_tracking_stream(
        &mut self,
        video_path: &Path,
        _filter: &DetectionFilter,
    ) -> Result<TrackingStream<'_>> {
        Err(PeopleFlowError::VideoOpen {
            path: video_path.to_path_buf(),
            reason: "single frame only".to_string(),
        })
    }

    fn detect_single_frame(
        &mut self,
        _frame: &RgbImage,
        _filter: &DetectionFilter,
    ) -> Result<Vec<DetectionBox>> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.in_flight.store(false, Ordering::SeqCst);

        if self.fail {
            return Err(PeopleFlowError::Inference("model not loaded".to_string()));
        }
        Ok((0..self.people)
            .map(|i| {
                let x = i as i32 * 10;
                DetectionBox::new(x, 0, x + 8, 20, 0.8)
            })
            .collect())
    }
}

/// 在目录下创建空的视频文件，供目录扫描使用
pub fn touch_videos(dir: &Path, names: &[&str]) {
    std::fs::create_dir_all(dir).unwrap();
    for name in names {
        std::fs::write(dir.join(name), b"\0").unwrap();
    }
}
