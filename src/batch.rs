use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::detector::Detector;
use crate::error::{PeopleFlowError, Result};
use crate::metadata::{BatchReport, JobStatus, VideoJobResult};
use crate::processor::{FrameProgress, ProcessConfig, VideoTrackingJob};
use crate::video_processor::VideoBackend;

/// 支持的视频扩展名（不区分大小写）
pub const VIDEO_EXTENSIONS: [&str; 6] = ["mp4", "avi", "mov", "mkv", "hevc", "h265"];

/// 文本报告文件名
pub const REPORT_FILE: &str = "人流统计报告.txt";
/// 结构化报告文件名
pub const REPORT_JSON_FILE: &str = "人流统计报告.json";
pub const REPORT_HEADER: &str = "各视频人流统计报告";

pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            VIDEO_EXTENSIONS
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// 列出目录中的视频文件，按文件名排序，跳过隐藏文件
pub fn discover_videos(input_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut videos = Vec::new();
    for entry in std::fs::read_dir(input_dir)? {
        let path = entry?.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(true);
        if !hidden && path.is_file() && is_video_file(&path) {
            videos.push(path);
        }
    }
    videos.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(videos)
}

/// 批处理过程中的事件订阅，默认全部忽略
pub trait BatchObserver: Send + Sync {
    fn video_started(&self, _video_name: &str, _index: usize, _total: usize) {}

    fn frame_progress(&self, _progress: &FrameProgress) {}

    fn video_finished(&self, _result: &VideoJobResult) {}
}

struct NoopObserver;

impl BatchObserver for NoopObserver {}

/// 批量处理目录下的所有视频，单个视频失败不会中断整批
pub struct BatchRunner {
    detector: Box<dyn Detector>,
    backend: Arc<dyn VideoBackend>,
    config: ProcessConfig,
}

impl BatchRunner {
    pub fn new(
        detector: Box<dyn Detector>,
        backend: Arc<dyn VideoBackend>,
        config: ProcessConfig,
    ) -> Self {
        Self {
            detector,
            backend,
            config,
        }
    }

    pub fn run(&mut self, input_dir: &Path, output_dir: &Path) -> Result<BatchReport> {
        self.run_with_observer(input_dir, output_dir, &NoopObserver)
    }

    pub fn run_with_observer(
        &mut self,
        input_dir: &Path,
        output_dir: &Path,
        observer: &dyn BatchObserver,
    ) -> Result<BatchReport> {
        let batch_start = Instant::now();
        std::fs::create_dir_all(input_dir)?;
        std::fs::create_dir_all(output_dir)?;

        let videos = discover_videos(input_dir)?;
        info!("📂 [批量处理] 找到 {} 个视频文件: {}", videos.len(), input_dir.display());
        if videos.is_empty() {
            warn!("⚠️  [批量处理] 目录中没有支持的视频文件（{}）", VIDEO_EXTENSIONS.join(", "));
        }

        let mut report = BatchReport::default();
        let total = videos.len();
        for (i, video) in videos.iter().enumerate() {
            let video_name = video
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| video.display().to_string());
            info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            info!("🎬 [批量处理] 正在处理视频 {}/{}: {}", i + 1, total, video_name);
            observer.video_started(&video_name, i, total);

            let result = self.process_one(video, &video_name, output_dir, observer);
            match &result.status {
                JobStatus::Success { people_total, output_file, .. } => {
                    info!("✓ 视频 {} 分析完成！总人数: {}", video_name, people_total);
                    info!("✓ 结果视频保存为: {}", output_file);
                }
                JobStatus::Failure { reason } => {
                    error!("✗ 处理视频 {} 时出错: {}", video_name, reason);
                }
            }
            observer.video_finished(&result);
            report.push(result);
        }

        let text_path = output_dir.join(REPORT_FILE);
        write_text_report(&report, &text_path)?;
        write_json_report(&report, &output_dir.join(REPORT_JSON_FILE))?;

        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!(
            "🎉 [批量处理] 完成！成功 {} 个，失败 {} 个，总耗时: {:.2}秒",
            report.success_count(),
            report.failure_count(),
            batch_start.elapsed().as_secs_f64()
        );
        for result in &report.results {
            info!("  📹 {}", result.report_line());
        }
        info!("📄 [批量处理] 详细报告已保存到: {}", text_path.display());

        Ok(report)
    }

    /// 任何错误（包括检测后端 panic）都记为该视频的失败
    fn process_one(
        &mut self,
        video: &Path,
        video_name: &str,
        output_dir: &Path,
        observer: &dyn BatchObserver,
    ) -> VideoJobResult {
        let forward = |p: &FrameProgress| observer.frame_progress(p);
        let detector = self.detector.as_mut();
        let backend = self.backend.as_ref();
        let config = &self.config;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            VideoTrackingJob::new(video, output_dir, config)
                .with_progress(&forward)
                .run(detector, backend)
        }));

        let status = match outcome {
            Ok(Ok(output)) => JobStatus::Success {
                people_total: output.people_total,
                output_file: output
                    .output_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
                frames_processed: output.frames_processed,
                elapsed_secs: output.elapsed_secs,
            },
            Ok(Err(e)) => JobStatus::Failure {
                reason: e.to_string(),
            },
            Err(panic) => JobStatus::Failure {
                reason: panic_message(panic.as_ref()),
            },
        };

        VideoJobResult {
            video_name: video_name.to_string(),
            status,
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "未知错误".to_string());
    format!("处理线程异常: {}", detail)
}

pub fn render_text_report(report: &BatchReport) -> String {
    let mut text = String::new();
    text.push_str(REPORT_HEADER);
    text.push('\n');
    text.push_str(&"=".repeat(50));
    text.push('\n');
    for result in &report.results {
        text.push_str(&result.report_line());
        text.push('\n');
    }
    text
}

pub fn write_text_report(report: &BatchReport, path: &Path) -> Result<()> {
    std::fs::write(path, render_text_report(report))
        .map_err(|e| PeopleFlowError::Report(format!("{}: {}", path.display(), e)))
}

pub fn write_json_report(report: &BatchReport, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| PeopleFlowError::Report(format!("序列化报告失败: {}", e)))?;
    std::fs::write(path, json)
        .map_err(|e| PeopleFlowError::Report(format!("{}: {}", path.display(), e)))
}

/// 后台批处理的状态
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running {
        current: String,
        index: usize,
        total: usize,
        frames_processed: u64,
    },
    Finished {
        report: BatchReport,
    },
    Crashed {
        reason: String,
    },
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Finished { .. } | BatchStatus::Crashed { .. })
    }
}

struct StatusObserver {
    tx: watch::Sender<BatchStatus>,
}

impl BatchObserver for StatusObserver {
    fn video_started(&self, video_name: &str, index: usize, total: usize) {
        self.tx.send_replace(BatchStatus::Running {
            current: video_name.to_string(),
            index,
            total,
            frames_processed: 0,
        });
    }

    fn frame_progress(&self, progress: &FrameProgress) {
        self.tx.send_modify(|status| {
            if let BatchStatus::Running {
                frames_processed, ..
            } = status
            {
                *frames_processed = progress.frames_processed;
            }
        });
    }
}

/// 后台批处理任务的句柄，可轮询状态或等待完成
pub struct BatchJobHandle {
    id: String,
    status: watch::Receiver<BatchStatus>,
    task: JoinHandle<Result<BatchReport>>,
}

impl BatchJobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> BatchStatus {
        let status = self.status.borrow().clone();
        if self.task.is_finished() && !status.is_terminal() {
            return BatchStatus::Crashed {
                reason: "批处理任务异常退出".to_string(),
            };
        }
        status
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<BatchReport> {
        self.task
            .await
            .map_err(|e| PeopleFlowError::Processing(format!("批处理任务异常退出: {}", e)))?
    }
}

/// 在阻塞线程池中启动批处理，立即返回句柄
pub fn spawn_batch(
    mut runner: BatchRunner,
    input_dir: PathBuf,
    output_dir: PathBuf,
) -> BatchJobHandle {
    let id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = watch::channel(BatchStatus::Pending);
    info!("🚀 [批量处理] 启动后台任务 {}", id);

    let task = tokio::task::spawn_blocking(move || {
        let observer = StatusObserver { tx };
        let result = runner.run_with_observer(&input_dir, &output_dir, &observer);
        match &result {
            Ok(report) => {
                observer.tx.send_replace(BatchStatus::Finished {
                    report: report.clone(),
                });
            }
            Err(e) => {
                error!("❌ [批量处理] 后台任务失败: {}", e);
                observer.tx.send_replace(BatchStatus::Crashed {
                    reason: e.to_string(),
                });
            }
        }
        result
    });

    BatchJobHandle {
        id,
        status: rx,
        task,
    }
}
