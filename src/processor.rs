use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::annotator::{FrameAnnotator, OverlayMode};
use crate::detector::{DetectionFilter, Detector, TrackedFrame};
use crate::error::{PeopleFlowError, Result};
use crate::metadata::VideoMetadata;
use crate::occupancy::OccupancyAggregator;
use crate::video_processor::{FrameSink, OutputCodec, VideoBackend};

/// 输出视频文件名后缀
pub const OUTPUT_SUFFIX: &str = "_人流统计";

/// 单个视频的处理配置
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// 类别过滤和置信度阈值
    pub filter: DetectionFilter,
    /// 每处理多少帧报告一次进度
    pub progress_interval: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            filter: DetectionFilter::default(),
            progress_interval: 100,
        }
    }
}

/// 单个视频任务的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Opening,
    Streaming,
    Finalizing,
    Succeeded,
    Failed,
}

/// 处理进度，按固定帧间隔发出
#[derive(Debug, Clone, PartialEq)]
pub struct FrameProgress {
    pub video_name: String,
    pub frames_processed: u64,
    pub total_frames: u64,
    pub cumulative_count: usize,
}

/// 进度订阅回调
pub type ProgressFn<'a> = &'a (dyn Fn(&FrameProgress) + Send + Sync);

/// 处理结果
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// 视频中出现过的总人数（不同 ID 数）
    pub people_total: usize,
    /// 标注后的输出视频
    pub output_path: PathBuf,
    pub codec: OutputCodec,
    pub frames_processed: u64,
    pub metadata: VideoMetadata,
    pub elapsed_secs: f64,
}

/// 输出视频路径：`<原文件名>_人流统计.<扩展名>`
pub fn output_path_for(input: &Path, output_dir: &Path, codec: OutputCodec) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "video".to_string());
    output_dir.join(format!("{}{}.{}", stem, OUTPUT_SUFFIX, codec.extension()))
}

/// 驱动单个视频的完整处理：探测 → 逐帧跟踪标注 → 写出 → 释放
pub struct VideoTrackingJob<'a> {
    input: PathBuf,
    output_dir: PathBuf,
    config: &'a ProcessConfig,
    progress: Option<ProgressFn<'a>>,
    state: JobState,
}

impl<'a> VideoTrackingJob<'a> {
    pub fn new(
        input: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        config: &'a ProcessConfig,
    ) -> Self {
        Self {
            input: input.into(),
            output_dir: output_dir.into(),
            config,
            progress: None,
            state: JobState::Opening,
        }
    }

    /// 订阅进度，每 `progress_interval` 帧回调一次
    pub fn with_progress(mut self, progress: ProgressFn<'a>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn video_name(&self) -> String {
        self.input
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.input.display().to_string())
    }

    pub fn run(
        &mut self,
        detector: &mut dyn Detector,
        backend: &dyn VideoBackend,
    ) -> Result<ProcessOutput> {
        let result = self.execute(detector, backend);
        self.state = match &result {
            Ok(_) => JobState::Succeeded,
            Err(e) => {
                error!("❌ [视频处理] {} 处理失败: {}", self.video_name(), e);
                JobState::Failed
            }
        };
        result
    }

    fn execute(
        &mut self,
        detector: &mut dyn Detector,
        backend: &dyn VideoBackend,
    ) -> Result<ProcessOutput> {
        let total_start = Instant::now();
        let video_name = self.video_name();

        // 1. 探测视频信息
        self.state = JobState::Opening;
        let open_start = Instant::now();
        let metadata = backend.probe(&self.input)?;
        validate_metadata(&self.input, &metadata)?;
        info!(
            "✅ [视频处理] 视频信息: {}, {:.1} FPS, {} 帧, 时长 {:.1}秒",
            metadata.resolution(),
            metadata.fps,
            metadata.total_frames,
            metadata.duration()
        );

        // 2. 打开输出视频，首选编码失败时回退一次
        std::fs::create_dir_all(&self.output_dir)?;
        let (sink, codec, output_path) = self.open_output(backend, &metadata)?;
        info!(
            "✅ [视频处理] 打开输入输出完成，耗时: {:.2}秒",
            open_start.elapsed().as_secs_f64()
        );

        // 3. 逐帧跟踪、统计、标注并写出
        self.state = JobState::Streaming;
        let stream_start = Instant::now();
        let (people_total, frames_processed, sink) =
            self.stream(detector, sink, &metadata, &video_name)?;
        let stream_secs = stream_start.elapsed().as_secs_f64();
        info!(
            "✅ [视频处理] 逐帧处理完成，{} 帧，耗时: {:.2}秒，平均 {:.2}ms/帧",
            frames_processed,
            stream_secs,
            stream_secs * 1000.0 / frames_processed.max(1) as f64
        );

        // 4. 收尾
        self.state = JobState::Finalizing;
        sink.finish()?;

        let elapsed_secs = total_start.elapsed().as_secs_f64();
        info!(
            "🎉 [视频处理] {} 分析完成！总人数: {}，输出: {}，总耗时: {:.2}秒",
            video_name,
            people_total,
            output_path.display(),
            elapsed_secs
        );

        Ok(ProcessOutput {
            people_total,
            output_path,
            codec,
            frames_processed,
            metadata,
            elapsed_secs,
        })
    }

    fn open_output(
        &self,
        backend: &dyn VideoBackend,
        metadata: &VideoMetadata,
    ) -> Result<(Box<dyn FrameSink>, OutputCodec, PathBuf)> {
        let mut last_error = None;
        for codec in OutputCodec::preference() {
            let path = output_path_for(&self.input, &self.output_dir, codec);
            match backend.open_writer(&path, codec, metadata) {
                Ok(sink) => return Ok((sink, codec, path)),
                Err(e) => {
                    warn!(
                        "⚠️  [视频处理] 无法以 {} 编码打开输出 {}: {}",
                        codec.fourcc(),
                        path.display(),
                        e
                    );
                    last_error = Some((path, e));
                }
            }
        }

        let (path, cause) = last_error.map_or_else(
            || (self.output_dir.clone(), "没有可用的编码".to_string()),
            |(path, e)| (path, e.to_string()),
        );
        Err(PeopleFlowError::OutputOpen {
            path,
            reason: cause,
        })
    }

    /// 出错时已写出的帧保留在输出文件里，sink 在此处被释放
    fn stream(
        &self,
        detector: &mut dyn Detector,
        mut sink: Box<dyn FrameSink>,
        metadata: &VideoMetadata,
        video_name: &str,
    ) -> Result<(usize, u64, Box<dyn FrameSink>)> {
        let mut aggregator = OccupancyAggregator::new();
        let mut annotator = FrameAnnotator::new();
        let mode = OverlayMode::Batch {
            total_frames: metadata.total_frames,
        };
        let interval = self.config.progress_interval.max(1);

        let stream = detector
            .open_tracking_stream(&self.input, &self.config.filter)
            .map_err(into_processing)?;

        for item in stream {
            let TrackedFrame {
                mut frame,
                detections,
            } = item.map_err(into_processing)?;

            let snapshot = aggregator.observe(&detections);
            annotator.annotate(&mut frame, &detections, &snapshot, mode);
            sink.write_frame(&frame).map_err(into_processing)?;

            if snapshot.frame_index % interval == 0 {
                info!(
                    "   已处理 {}/{} 帧，累计总人数: {}",
                    snapshot.frame_index, metadata.total_frames, snapshot.cumulative_count
                );
                if let Some(progress) = self.progress {
                    progress(&FrameProgress {
                        video_name: video_name.to_string(),
                        frames_processed: snapshot.frame_index,
                        total_frames: metadata.total_frames,
                        cumulative_count: snapshot.cumulative_count,
                    });
                }
            }
        }

        debug!("[视频处理] {} 分配了 {} 种 ID 颜色", video_name, annotator.colors().len());
        Ok((
            aggregator.cumulative_count(),
            aggregator.frames_observed(),
            sink,
        ))
    }
}

fn validate_metadata(path: &Path, metadata: &VideoMetadata) -> Result<()> {
    if metadata.fps <= 0.0 || !metadata.fps.is_finite() {
        return Err(PeopleFlowError::VideoOpen {
            path: path.to_path_buf(),
            reason: format!("无效的帧率: {}", metadata.fps),
        });
    }
    if metadata.width == 0 || metadata.height == 0 {
        return Err(PeopleFlowError::VideoOpen {
            path: path.to_path_buf(),
            reason: format!("无效的分辨率: {}", metadata.resolution()),
        });
    }
    Ok(())
}

fn into_processing(e: PeopleFlowError) -> PeopleFlowError {
    match e {
        PeopleFlowError::Processing(_) => e,
        other => PeopleFlowError::Processing(other.to_string()),
    }
}

/// 处理单个视频并返回结果
pub fn process_video(
    input: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
    config: &ProcessConfig,
    detector: &mut dyn Detector,
    backend: &dyn VideoBackend,
) -> Result<ProcessOutput> {
    VideoTrackingJob::new(input.as_ref(), output_dir.as_ref(), config).run(detector, backend)
}
