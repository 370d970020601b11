//! 检测/跟踪能力的抽象。
//!
//! 具体的模型（本地或远程推理服务）通过实现 [`Detector`] 注入，
//! 核心流程只依赖这里定义的两个操作。

use std::path::Path;

use image::RgbImage;

use crate::error::Result;
use crate::metadata::DetectionBox;

/// COCO 数据集中 "person" 的类别编号
pub const PERSON_CLASS: u32 = 0;

/// 类别过滤和置信度阈值
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionFilter {
    pub classes: Vec<u32>,
    pub confidence: f32,
}

impl Default for DetectionFilter {
    fn default() -> Self {
        Self {
            classes: vec![PERSON_CLASS],
            confidence: 0.5,
        }
    }
}

impl DetectionFilter {
    /// `0,2` 形式，用于请求参数
    pub fn classes_param(&self) -> String {
        self.classes
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// 跟踪流中的一帧：原始画面和带 ID 的检测框
#[derive(Debug, Clone)]
pub struct TrackedFrame {
    pub frame: RgbImage,
    pub detections: Vec<DetectionBox>,
}

/// 逐帧跟踪流：按源视频顺序产出，只能向前读一次，中途出错时产出 `Err`
pub type TrackingStream<'a> = Box<dyn Iterator<Item = Result<TrackedFrame>> + 'a>;

/// 检测/跟踪后端
///
/// 底层资源不保证可以并发调用，实时单帧检测必须经过
/// [`LiveDetectionGate`](crate::live::LiveDetectionGate)。
pub trait Detector: Send {
    /// 打开视频的跟踪流，检测框带有视频内持久的 ID
    fn open_tracking_stream(
        &mut self,
        video_path: &Path,
        filter: &DetectionFilter,
    ) -> Result<TrackingStream<'_>>;

    /// 无状态的单帧检测，检测框不带 ID
    fn detect_single_frame(
        &mut self,
        frame: &RgbImage,
        filter: &DetectionFilter,
    ) -> Result<Vec<DetectionBox>>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn open_tracking_stream(
        &mut self,
        video_path: &Path,
        filter: &DetectionFilter,
    ) -> Result<TrackingStream<'_>> {
        (**self).open_tracking_stream(video_path, filter)
    }

    fn detect_single_frame(
        &mut self,
        frame: &RgbImage,
        filter: &DetectionFilter,
    ) -> Result<Vec<DetectionBox>> {
        (**self).detect_single_frame(frame, filter)
    }
}
