use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;

use image::RgbImage;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{PeopleFlowError, Result};
use crate::metadata::VideoMetadata;

/// 输出视频的编码/容器组合
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputCodec {
    /// MPEG-4 Part 2 (mp4v) + MP4 容器，首选
    Mp4v,
    /// XVID + AVI 容器，首选打不开时的备用
    Xvid,
}

impl OutputCodec {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputCodec::Mp4v => "mp4",
            OutputCodec::Xvid => "avi",
        }
    }

    pub fn fourcc(&self) -> &'static str {
        match self {
            OutputCodec::Mp4v => "mp4v",
            OutputCodec::Xvid => "XVID",
        }
    }

    /// 首选编码失败后依次尝试的顺序
    pub fn preference() -> [OutputCodec; 2] {
        [OutputCodec::Mp4v, OutputCodec::Xvid]
    }
}

/// 帧写入端，丢弃时释放底层资源
pub trait FrameSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()>;

    /// 正常结束写入并落盘
    fn finish(self: Box<Self>) -> Result<()>;
}

/// 逐帧读取端
pub type FrameReader = Box<dyn Iterator<Item = Result<RgbImage>> + Send>;

/// 视频编解码能力
pub trait VideoBackend: Send + Sync {
    /// 探测视频信息
    fn probe(&self, path: &Path) -> Result<VideoMetadata>;

    /// 打开视频逐帧读取（RGB24）
    fn open_reader(&self, path: &Path, meta: &VideoMetadata) -> Result<FrameReader>;

    /// 以指定编码打开输出视频
    fn open_writer(
        &self,
        path: &Path,
        codec: OutputCodec,
        meta: &VideoMetadata,
    ) -> Result<Box<dyn FrameSink>>;
}

/// 按编译选项选择默认后端：启用 `libav` 时在进程内编解码，否则调用 ffmpeg 命令行
pub fn default_backend() -> Arc<dyn VideoBackend> {
    #[cfg(feature = "libav")]
    {
        Arc::new(crate::libav_backend::LibavBackend::new())
    }
    #[cfg(not(feature = "libav"))]
    {
        Arc::new(FfmpegBackend::new())
    }
}

/// 基于 ffmpeg/ffprobe 命令行的编解码后端
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl FfmpegBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用指定路径的 ffmpeg/ffprobe 可执行文件
    pub fn with_binaries(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// rawvideo rgb24 从 stdin 输入，`max_frames` 限制编码帧数
    fn encoder_command(
        &self,
        path: &Path,
        codec: OutputCodec,
        meta: &VideoMetadata,
        max_frames: Option<u32>,
    ) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-s")
            .arg(meta.resolution())
            .arg("-r")
            .arg(format!("{}", meta.fps))
            .arg("-i")
            .arg("-")
            .arg("-c:v")
            .arg("mpeg4")
            .arg("-vtag")
            .arg(codec.fourcc());
        if let Some(n) = max_frames {
            cmd.arg("-frames:v").arg(n.to_string());
        }
        cmd.arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }

    /// 用一帧黑图试编码，确认编码器和容器组合可用
    fn trial_encode(
        &self,
        path: &Path,
        codec: OutputCodec,
        meta: &VideoMetadata,
    ) -> std::result::Result<(), String> {
        let mut child = self
            .encoder_command(path, codec, meta, Some(1))
            .spawn()
            .map_err(|e| format!("执行 ffmpeg 编码失败: {}", e))?;
        let stderr = drain_stderr(&mut child);

        if let Some(mut stdin) = child.stdin.take() {
            let blank = vec![0u8; meta.width as usize * meta.height as usize * 3];
            // 编码器已退出时会写入失败，以退出状态为准
            let _ = stdin.write_all(&blank);
        }

        let status = child
            .wait()
            .map_err(|e| format!("等待 ffmpeg 结束失败: {}", e))?;
        let stderr = collect_stderr(stderr);
        if !status.success() {
            return Err(format!("编码器不可用 ({}): {}", status, stderr));
        }
        Ok(())
    }
}

impl VideoBackend for FfmpegBackend {
    fn probe(&self, path: &Path) -> Result<VideoMetadata> {
        let open_err = |reason: String| PeopleFlowError::VideoOpen {
            path: path.to_path_buf(),
            reason,
        };
        if !path.is_file() {
            return Err(open_err("文件不存在".to_string()));
        }

        let output = Command::new(&self.ffprobe)
            .arg("-v")
            .arg("error")
            .arg("-select_streams")
            .arg("v:0")
            .arg("-show_entries")
            .arg("stream=width,height,avg_frame_rate,r_frame_rate,nb_frames:format=duration")
            .arg("-of")
            .arg("json")
            .arg(path)
            .output()
            .map_err(|e| open_err(format!("执行 ffprobe 失败: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(open_err(format!("无法打开视频文件: {}", stderr.trim())));
        }

        parse_ffprobe_output(&output.stdout).map_err(open_err)
    }

    fn open_reader(&self, path: &Path, meta: &VideoMetadata) -> Result<FrameReader> {
        let child = Command::new(&self.ffmpeg)
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(path)
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PeopleFlowError::VideoOpen {
                path: path.to_path_buf(),
                reason: format!("执行 ffmpeg 解码失败: {}", e),
            })?;

        Ok(Box::new(RawFrameReader::new(child, meta.width, meta.height)?))
    }

    fn open_writer(
        &self,
        path: &Path,
        codec: OutputCodec,
        meta: &VideoMetadata,
    ) -> Result<Box<dyn FrameSink>> {
        let output_err = |reason: String| PeopleFlowError::OutputOpen {
            path: path.to_path_buf(),
            reason,
        };

        if let Err(reason) = self.trial_encode(path, codec, meta) {
            remove_failed_output(path);
            return Err(output_err(reason));
        }

        let mut child = self
            .encoder_command(path, codec, meta, None)
            .spawn()
            .map_err(|e| {
                remove_failed_output(path);
                output_err(format!("执行 ffmpeg 编码失败: {}", e))
            })?;
        let stderr = drain_stderr(&mut child);
        let stdin = child.stdin.take();

        debug!("🎞️  [视频编码] 已打开输出: {} ({})", path.display(), codec.fourcc());
        Ok(Box::new(PipeWriter {
            child,
            stdin,
            stderr,
            frame_bytes: meta.width as usize * meta.height as usize * 3,
        }))
    }
}

/// 删除打开失败时留下的输出文件
pub(crate) fn remove_failed_output(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("🗑️  [视频编码] 已删除无效输出: {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("⚠️  [视频编码] 删除无效输出失败: {}: {}", path.display(), e),
    }
}

/// 后台收集子进程 stderr，防止管道写满后 ffmpeg 阻塞
fn drain_stderr(child: &mut Child) -> Option<JoinHandle<String>> {
    let mut stderr = child.stderr.take()?;
    Some(std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).trim().to_string()
    }))
}

fn collect_stderr(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// 把帧编码为 JPEG
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality)
        .encode(
            frame.as_raw(),
            frame.width(),
            frame.height(),
            image::ColorType::Rgb8,
        )
        .map_err(|e| PeopleFlowError::Processing(format!("JPEG 编码失败: {}", e)))?;
    Ok(buf)
}

/// 解码上传的图像（JPEG/PNG 等）
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    if bytes.is_empty() {
        return Err(PeopleFlowError::Decode("图像为空".to_string()));
    }
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| PeopleFlowError::Decode(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

fn parse_ffprobe_output(stdout: &[u8]) -> std::result::Result<VideoMetadata, String> {
    let probe: ProbeOutput =
        serde_json::from_slice(stdout).map_err(|e| format!("解析 ffprobe 输出失败: {}", e))?;
    let stream = probe
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| "未找到视频流".to_string())?;

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rational)
        .filter(|f| *f > 0.0)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rational))
        .unwrap_or(0.0);

    let total_frames = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or_else(|| {
            let duration = probe
                .format
                .and_then(|f| f.duration)
                .and_then(|d| d.parse::<f64>().ok())
                .unwrap_or(0.0);
            (duration * fps).round().max(0.0) as u64
        });

    Ok(VideoMetadata {
        fps,
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
        total_frames,
    })
}

/// 解析 `30000/1001` 形式的帧率，分母为 0 时返回 None
fn parse_rational(value: &str) -> Option<f64> {
    match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                None
            } else {
                Some(num / den)
            }
        }
        None => value.trim().parse().ok(),
    }
}

/// 从 ffmpeg 子进程的 stdout 读取 RGB24 原始帧
///
/// stdout 结束后检查 ffmpeg 的退出状态，解码中途失败不会被当成正常结束。
struct RawFrameReader {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    width: u32,
    height: u32,
    done: bool,
}

impl RawFrameReader {
    fn new(mut child: Child, width: u32, height: u32) -> Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PeopleFlowError::Processing("无法读取 ffmpeg 输出".to_string()))?;
        let stderr = drain_stderr(&mut child);
        Ok(Self {
            child,
            stdout,
            stderr,
            width,
            height,
            done: false,
        })
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        let size = self.width as usize * self.height as usize * 3;
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            match self.stdout.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(PeopleFlowError::Processing(format!("读取视频帧失败: {}", e))),
            }
        }

        if filled < size {
            self.check_exit()?;
            if filled == 0 {
                return Ok(None);
            }
            return Err(PeopleFlowError::Processing(format!(
                "视频帧数据不完整: {}/{} 字节",
                filled, size
            )));
        }

        RgbImage::from_raw(self.width, self.height, buf)
            .map(Some)
            .ok_or_else(|| PeopleFlowError::Processing("视频帧尺寸不匹配".to_string()))
    }

    /// 输出结束后等待 ffmpeg 退出，非零状态带上 stderr 报错
    fn check_exit(&mut self) -> Result<()> {
        let status = self
            .child
            .wait()
            .map_err(|e| PeopleFlowError::Processing(format!("等待 ffmpeg 结束失败: {}", e)))?;
        let stderr = collect_stderr(self.stderr.take());
        if !status.success() {
            return Err(PeopleFlowError::Processing(format!(
                "ffmpeg 解码失败 ({}): {}",
                status, stderr
            )));
        }
        Ok(())
    }
}

impl Iterator for RawFrameReader {
    type Item = Result<RgbImage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for RawFrameReader {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// 通过 stdin 把原始帧写给 ffmpeg 编码
struct PipeWriter {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<String>>,
    frame_bytes: usize,
}

impl FrameSink for PipeWriter {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        let raw = frame.as_raw();
        if raw.len() != self.frame_bytes {
            return Err(PeopleFlowError::Processing(format!(
                "输出帧尺寸不匹配: {} != {} 字节",
                raw.len(),
                self.frame_bytes
            )));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| PeopleFlowError::Processing("编码器已关闭".to_string()))?;
        stdin
            .write_all(raw)
            .map_err(|e| PeopleFlowError::Processing(format!("写入视频帧失败: {}", e)))
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        drop(self.stdin.take());
        let status = self
            .child
            .wait()
            .map_err(|e| PeopleFlowError::Processing(format!("等待 ffmpeg 结束失败: {}", e)))?;
        let stderr = collect_stderr(self.stderr.take());
        if !status.success() {
            return Err(PeopleFlowError::Processing(format!(
                "ffmpeg 编码失败 ({}): {}",
                status, stderr
            )));
        }
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        // 关闭 stdin 让 ffmpeg 写完已收到的帧
        if self.stdin.take().is_some() {
            if let Err(e) = self.child.wait() {
                warn!("⚠️  [视频编码] 等待 ffmpeg 退出失败: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rational_frame_rates() {
        assert_eq!(parse_rational("30/1"), Some(30.0));
        assert!((parse_rational("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_rational("0/0"), None);
        assert_eq!(parse_rational("25"), Some(25.0));
        assert_eq!(parse_rational("abc"), None);
    }

    #[test]
    fn ffprobe_json_with_frame_count() {
        let json = br#"{
            "streams": [{"width": 1920, "height": 1080, "avg_frame_rate": "25/1", "r_frame_rate": "25/1", "nb_frames": "250"}],
            "format": {"duration": "10.000000"}
        }"#;
        let meta = parse_ffprobe_output(json).unwrap();
        assert_eq!(meta.width, 1920);
        assert_eq!(meta.height, 1080);
        assert_eq!(meta.fps, 25.0);
        assert_eq!(meta.total_frames, 250);
    }

    #[test]
    fn ffprobe_json_without_frame_count_uses_duration() {
        let json = br#"{
            "streams": [{"width": 640, "height": 360, "avg_frame_rate": "0/0", "r_frame_rate": "30/1"}],
            "format": {"duration": "4.0"}
        }"#;
        let meta = parse_ffprobe_output(json).unwrap();
        assert_eq!(meta.fps, 30.0);
        assert_eq!(meta.total_frames, 120);
    }

    #[test]
    fn ffprobe_json_without_video_stream() {
        assert!(parse_ffprobe_output(br#"{"streams": []}"#).is_err());
    }

    #[test]
    fn codec_extensions() {
        assert_eq!(OutputCodec::Mp4v.extension(), "mp4");
        assert_eq!(OutputCodec::Xvid.extension(), "avi");
        assert_eq!(OutputCodec::preference()[0], OutputCodec::Mp4v);
    }

    #[test]
    fn jpeg_encode_then_decode_keeps_size() {
        let frame = RgbImage::from_pixel(32, 16, image::Rgb([10, 200, 30]));
        let jpeg = encode_jpeg(&frame, 85).unwrap();
        let decoded = decode_image(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (32, 16));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(matches!(
            decode_image(b"not an image"),
            Err(PeopleFlowError::Decode(_))
        ));
        assert!(matches!(decode_image(&[]), Err(PeopleFlowError::Decode(_))));
    }

    #[test]
    fn missing_file_fails_probe() {
        let backend = FfmpegBackend::new();
        let err = backend.probe(Path::new("/nonexistent/video.mp4")).unwrap_err();
        assert!(matches!(err, PeopleFlowError::VideoOpen { .. }));
    }
}
