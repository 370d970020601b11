use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use image::RgbImage;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tracing::{debug, info};

use crate::detector::{DetectionFilter, Detector, TrackedFrame, TrackingStream};
use crate::error::{PeopleFlowError, Result};
use crate::metadata::DetectionBox;
use crate::video_processor::{encode_jpeg, VideoBackend};

const JPEG_QUALITY: u8 = 90;

/// 推理服务返回的检测结果
#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    boxes: Vec<DetectionBox>,
}

/// 调用远程 HTTP 推理服务的检测后端
///
/// - 单帧检测：`POST <endpoint>/detect?classes=0&conf=0.5`，请求体为 JPEG
/// - 跟踪：逐帧 `POST <endpoint>/track?...&stream_id=<uuid>`，
///   服务端按 `stream_id` 保持跟踪器状态
pub struct RemoteDetector {
    client: Client,
    endpoint: String,
    video: Arc<dyn VideoBackend>,
}

impl RemoteDetector {
    pub fn new(
        endpoint: impl Into<String>,
        timeout: Duration,
        video: Arc<dyn VideoBackend>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PeopleFlowError::Inference(format!("创建 HTTP 客户端失败: {}", e)))?;
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        info!("🔌 [远程检测] 推理服务地址: {}", endpoint);
        Ok(Self {
            client,
            endpoint,
            video,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn post_frame(
        &self,
        route: &str,
        frame: &RgbImage,
        filter: &DetectionFilter,
        stream_id: Option<&str>,
    ) -> Result<Vec<DetectionBox>> {
        let body = encode_jpeg(frame, JPEG_QUALITY)
            .map_err(|e| PeopleFlowError::Inference(e.to_string()))?;

        let mut query = vec![
            ("classes", filter.classes_param()),
            ("conf", filter.confidence.to_string()),
        ];
        if let Some(id) = stream_id {
            query.push(("stream_id", id.to_string()));
        }

        let url = format!("{}/{}", self.endpoint, route);
        let response = self
            .client
            .post(&url)
            .query(&query)
            .header(CONTENT_TYPE, "image/jpeg")
            .body(body)
            .send()
            .map_err(|e| PeopleFlowError::Inference(format!("请求推理服务失败: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(PeopleFlowError::Inference(format!(
                "推理服务返回错误状态: {} - {}",
                status, text
            )));
        }

        let parsed: DetectResponse = response
            .json()
            .map_err(|e| PeopleFlowError::Inference(format!("解析推理结果失败: {}", e)))?;

        Ok(parsed
            .boxes
            .into_iter()
            .filter(|b| b.confidence >= filter.confidence)
            .collect())
    }
}

impl Detector for RemoteDetector {
    fn open_tracking_stream(
        &mut self,
        video_path: &Path,
        filter: &DetectionFilter,
    ) -> Result<TrackingStream<'_>> {
        let meta = self.video.probe(video_path)?;
        let frames = self.video.open_reader(video_path, &meta)?;
        let stream_id = uuid::Uuid::new_v4().to_string();
        let filter = filter.clone();
        debug!("[远程检测] 打开跟踪流 {} -> {}", video_path.display(), stream_id);

        let this: &Self = self;
        Ok(Box::new(frames.map(move |frame| {
            let frame = frame?;
            let detections = this.post_frame("track", &frame, &filter, Some(&stream_id))?;
            Ok(TrackedFrame { frame, detections })
        })))
    }

    fn detect_single_frame(
        &mut self,
        frame: &RgbImage,
        filter: &DetectionFilter,
    ) -> Result<Vec<DetectionBox>> {
        let boxes = self.post_frame("detect", frame, filter, None)?;
        // 单帧模式没有跟踪状态
        Ok(boxes
            .into_iter()
            .map(|b| DetectionBox {
                identity: None,
                ..b
            })
            .collect())
    }
}
