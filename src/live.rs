//! 实时单帧检测：串行访问共享的检测后端，并缓存最近一次结果。

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use tokio::sync::{watch, Mutex};
use tracing::{error, info};

use crate::annotator::{FrameAnnotator, OverlayMode};
use crate::detector::{DetectionFilter, Detector};
use crate::error::{PeopleFlowError, Result};
use crate::metadata::{LiveDetectionResult, OccupancySnapshot};
use crate::video_processor::{decode_image, encode_jpeg};

const JPEG_QUALITY: u8 = 85;

/// 实时检测错误日志的文件名（位于结果目录下）
pub const LIVE_ERROR_LOG: &str = "live_errors.log";

/// 最近一次实时检测结果的单槽缓存
///
/// 写入方是 [`LiveDetectionGate`]，读取不会等待正在进行的推理。
#[derive(Debug, Clone)]
pub struct LatestResultSlot {
    tx: Arc<watch::Sender<Option<Arc<LiveDetectionResult>>>>,
}

impl Default for LatestResultSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl LatestResultSlot {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// 整体替换为新结果
    pub fn publish(&self, result: LiveDetectionResult) {
        self.tx.send_replace(Some(Arc::new(result)));
    }

    pub fn latest(&self) -> Option<Arc<LiveDetectionResult>> {
        self.tx.borrow().clone()
    }
}

/// 单飞门：同一时刻最多一个推理调用在执行
///
/// 等待令牌超过 `wait_timeout` 的请求返回 [`PeopleFlowError::GateTimeout`]。
pub struct LiveDetectionGate {
    detector: Arc<Mutex<Box<dyn Detector>>>,
    filter: DetectionFilter,
    wait_timeout: Duration,
    latest: LatestResultSlot,
    error_log: Option<PathBuf>,
}

impl LiveDetectionGate {
    pub fn new(
        detector: Box<dyn Detector>,
        filter: DetectionFilter,
        wait_timeout: Duration,
        latest: LatestResultSlot,
    ) -> Self {
        Self {
            detector: Arc::new(Mutex::new(detector)),
            filter,
            wait_timeout,
            latest,
            error_log: None,
        }
    }

    /// 失败的请求追加写入该日志文件
    pub fn with_error_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.error_log = Some(path.into());
        self
    }

    pub fn latest_result(&self) -> Option<Arc<LiveDetectionResult>> {
        self.latest.latest()
    }

    /// 解码上传的图像后检测
    pub async fn detect_bytes(&self, bytes: &[u8]) -> Result<LiveDetectionResult> {
        let frame = match decode_image(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.record_error(&e);
                return Err(e);
            }
        };
        self.detect_once(frame).await
    }

    pub async fn detect_once(&self, frame: RgbImage) -> Result<LiveDetectionResult> {
        let result = self.run(frame).await;
        if let Err(e) = &result {
            self.record_error(e);
        }
        result
    }

    async fn run(&self, frame: RgbImage) -> Result<LiveDetectionResult> {
        let guard = tokio::time::timeout(self.wait_timeout, self.detector.clone().lock_owned())
            .await
            .map_err(|_| PeopleFlowError::GateTimeout {
                waited_ms: self.wait_timeout.as_millis() as u64,
            })?;

        // 令牌随闭包一起移入阻塞线程，推理结束（包括出错或 panic）即释放
        let filter = self.filter.clone();
        let (mut frame, boxes, inference_time) = tokio::task::spawn_blocking(move || {
            let mut detector = guard;
            let start = Instant::now();
            let boxes = detector.detect_single_frame(&frame, &filter);
            let elapsed = start.elapsed();
            drop(detector);
            boxes.map(|b| (frame, b, elapsed))
        })
        .await
        .map_err(|e| PeopleFlowError::Inference(format!("推理任务异常退出: {}", e)))?
        .map_err(|e| match e {
            PeopleFlowError::Inference(_) => e,
            other => PeopleFlowError::Inference(other.to_string()),
        })?;

        let people_count = boxes.len();
        let snapshot = OccupancySnapshot {
            current_count: people_count,
            cumulative_count: people_count,
            frame_index: 1,
        };
        FrameAnnotator::new().annotate(&mut frame, &boxes, &snapshot, OverlayMode::Live);
        let image_bytes = encode_jpeg(&frame, JPEG_QUALITY)?;

        let result = LiveDetectionResult {
            image_bytes,
            people_count,
            inference_time_ms: inference_time.as_secs_f64() * 1000.0,
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        };
        self.latest.publish(result.clone());

        info!(
            "📷 [实时检测] 检测到 {} 人，推理耗时 {:.1}ms",
            people_count, result.inference_time_ms
        );
        Ok(result)
    }

    fn record_error(&self, e: &PeopleFlowError) {
        error!("❌ [实时检测] {}", e);
        let Some(path) = &self.error_log else {
            return;
        };
        let line = format!("[{}] {}\n", chrono::Utc::now().to_rfc3339(), e);
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(io) = written {
            error!("❌ [实时检测] 写入错误日志失败: {}: {}", path.display(), io);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_slot_has_no_result() {
        let slot = LatestResultSlot::new();
        assert!(slot.latest().is_none());
    }

    #[test]
    fn publish_replaces_previous_result() {
        let slot = LatestResultSlot::new();
        let reader = slot.clone();
        for count in [3, 5] {
            slot.publish(LiveDetectionResult {
                image_bytes: vec![],
                people_count: count,
                inference_time_ms: 1.0,
                timestamp: count as f64,
            });
        }
        let latest = reader.latest().unwrap();
        assert_eq!(latest.people_count, 5);
        assert_eq!(latest.timestamp, 5.0);
    }
}
