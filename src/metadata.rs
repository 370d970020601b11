use serde::{Deserialize, Serialize};

/// 视频基础信息，打开视频时探测一次，之后不再变化
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    /// 视频帧率
    pub fps: f64,
    /// 宽度（像素）
    pub width: u32,
    /// 高度（像素）
    pub height: u32,
    /// 总帧数
    pub total_frames: u64,
}

impl VideoMetadata {
    /// 视频时长（秒），帧率无效时为 0
    pub fn duration(&self) -> f64 {
        if self.fps > 0.0 {
            self.total_frames as f64 / self.fps
        } else {
            0.0
        }
    }

    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// 单帧中的一个检测框
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub confidence: f32,
    /// 跟踪 ID，单帧检测模式下为 None
    #[serde(default, rename = "id", skip_serializing_if = "Option::is_none")]
    pub identity: Option<u64>,
}

impl DetectionBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32, confidence: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence,
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: u64) -> Self {
        self.identity = Some(identity);
        self
    }
}

/// 某一帧的人数快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OccupancySnapshot {
    /// 当前帧人数
    pub current_count: usize,
    /// 累计出现过的不同 ID 数
    pub cumulative_count: usize,
    /// 帧序号（从 1 开始）
    pub frame_index: u64,
}

/// 单个视频的处理状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Success {
        people_total: usize,
        /// 输出视频文件名
        output_file: String,
        frames_processed: u64,
        elapsed_secs: f64,
    },
    Failure {
        reason: String,
    },
}

/// 单个视频的最终结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoJobResult {
    pub video_name: String,
    #[serde(flatten)]
    pub status: JobStatus,
}

impl VideoJobResult {
    pub fn is_success(&self) -> bool {
        matches!(self.status, JobStatus::Success { .. })
    }

    /// 报告中的一行：`名称: N 人` 或 `名称: 处理失败: 原因`
    pub fn report_line(&self) -> String {
        match &self.status {
            JobStatus::Success { people_total, .. } => {
                format!("{}: {} 人", self.video_name, people_total)
            }
            JobStatus::Failure { reason } => {
                format!("{}: 处理失败: {}", self.video_name, reason)
            }
        }
    }
}

/// 一次批量处理的汇总，保持发现顺序
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub results: Vec<VideoJobResult>,
}

impl BatchReport {
    pub fn push(&mut self, result: VideoJobResult) {
        self.results.push(result);
    }

    pub fn get(&self, video_name: &str) -> Option<&VideoJobResult> {
        self.results.iter().find(|r| r.video_name == video_name)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.len() - self.success_count()
    }
}

/// 最近一次实时检测的结果
#[derive(Debug, Clone, PartialEq)]
pub struct LiveDetectionResult {
    /// 标注后的 JPEG 图像
    pub image_bytes: Vec<u8>,
    pub people_count: usize,
    pub inference_time_ms: f64,
    /// Unix 时间戳（秒）
    pub timestamp: f64,
}
