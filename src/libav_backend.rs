//! 进程内的 libav 编解码后端，需要启用 `libav` feature 和系统 FFmpeg 开发库。

use std::path::Path;

use ffmpeg_next as ffmpeg;
use ffmpeg::format::{self, Pixel};
use ffmpeg::software::scaling;
use ffmpeg::frame::Video;
use ffmpeg::{codec, encoder, media, Packet, Rational};
use image::RgbImage;
use tracing::{debug, warn};

use crate::error::{PeopleFlowError, Result};
use crate::metadata::VideoMetadata;
use crate::video_processor::{
    remove_failed_output, FrameReader, FrameSink, OutputCodec, VideoBackend,
};

fn init_ffmpeg() -> std::result::Result<(), String> {
    ffmpeg::init().map_err(|e| format!("初始化 FFmpeg 失败: {}", e))?;
    unsafe {
        ffmpeg::sys::av_log_set_level(ffmpeg::sys::AV_LOG_ERROR as i32);
    }
    Ok(())
}

/// 直接链接 libavformat/libavcodec 的后端
#[derive(Debug, Clone, Default)]
pub struct LibavBackend;

impl LibavBackend {
    pub fn new() -> Self {
        Self
    }
}

impl VideoBackend for LibavBackend {
    fn probe(&self, path: &Path) -> Result<VideoMetadata> {
        let open_err = |reason: String| PeopleFlowError::VideoOpen {
            path: path.to_path_buf(),
            reason,
        };
        if !path.is_file() {
            return Err(open_err("文件不存在".to_string()));
        }
        init_ffmpeg().map_err(open_err)?;

        let ictx = format::input(&path).map_err(|e| open_err(format!("无法打开视频文件: {}", e)))?;
        let stream = ictx
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| open_err("未找到视频流".to_string()))?;
        let decoder = codec::context::Context::from_parameters(stream.parameters())
            .and_then(|ctx| ctx.decoder().video())
            .map_err(|e| open_err(format!("无法创建视频解码器: {}", e)))?;

        let rate = stream.avg_frame_rate();
        let fps = if rate.denominator() > 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            0.0
        };
        let total_frames = if stream.frames() > 0 {
            stream.frames() as u64
        } else {
            let duration = ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64;
            (duration * fps).round().max(0.0) as u64
        };

        Ok(VideoMetadata {
            fps,
            width: decoder.width(),
            height: decoder.height(),
            total_frames,
        })
    }

    fn open_reader(&self, path: &Path, _meta: &VideoMetadata) -> Result<FrameReader> {
        Ok(Box::new(LibavFrameReader::open(path)?))
    }

    fn open_writer(
        &self,
        path: &Path,
        codec: OutputCodec,
        meta: &VideoMetadata,
    ) -> Result<Box<dyn FrameSink>> {
        match LibavFrameWriter::open(path, codec, meta) {
            Ok(writer) => {
                debug!("🎞️  [视频编码] 已打开输出: {} ({})", path.display(), codec.fourcc());
                Ok(Box::new(writer))
            }
            Err(reason) => {
                remove_failed_output(path);
                Err(PeopleFlowError::OutputOpen {
                    path: path.to_path_buf(),
                    reason,
                })
            }
        }
    }
}

/// 解码视频流并缩放为 RGB24
struct LibavFrameReader {
    input: format::context::Input,
    decoder: ffmpeg::decoder::Video,
    scaler: scaling::Context,
    stream_index: usize,
    eof_sent: bool,
    done: bool,
}

// SAFETY: scaling::Context 只包装一个 SwsContext 指针，没有线程局部状态。
// 读取端在任一时刻只被持有它的那个线程使用，转移所有权是安全的。
unsafe impl Send for LibavFrameReader {}

impl LibavFrameReader {
    fn open(path: &Path) -> Result<Self> {
        let open_err = |reason: String| PeopleFlowError::VideoOpen {
            path: path.to_path_buf(),
            reason,
        };
        init_ffmpeg().map_err(open_err)?;

        let input = format::input(&path).map_err(|e| open_err(format!("无法打开视频文件: {}", e)))?;
        let (stream_index, decoder) = {
            let stream = input
                .streams()
                .best(media::Type::Video)
                .ok_or_else(|| open_err("未找到视频流".to_string()))?;
            let decoder = codec::context::Context::from_parameters(stream.parameters())
                .and_then(|ctx| ctx.decoder().video())
                .map_err(|e| open_err(format!("无法创建视频解码器: {}", e)))?;
            (stream.index(), decoder)
        };

        let scaler = scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            scaling::Flags::BILINEAR,
        )
        .map_err(|e| open_err(format!("无法创建图像缩放器: {}", e)))?;

        Ok(Self {
            input,
            decoder,
            scaler,
            stream_index,
            eof_sent: false,
            done: false,
        })
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        let mut decoded = Video::empty();
        loop {
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => return self.convert_frame(&decoded).map(Some),
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                    if self.eof_sent {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(PeopleFlowError::Processing(format!("视频解码失败: {}", e))),
            }
            self.feed_decoder()?;
        }
    }

    /// 送入下一个属于视频流的数据包，读完后发送 EOF 冲刷解码器
    fn feed_decoder(&mut self) -> Result<()> {
        let mut packet = Packet::empty();
        loop {
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if packet.stream() != self.stream_index {
                        continue;
                    }
                    return self
                        .decoder
                        .send_packet(&packet)
                        .map_err(|e| PeopleFlowError::Processing(format!("视频解码失败: {}", e)));
                }
                Err(ffmpeg::Error::Eof) => {
                    self.eof_sent = true;
                    return self
                        .decoder
                        .send_eof()
                        .map_err(|e| PeopleFlowError::Processing(format!("视频解码失败: {}", e)));
                }
                Err(e) => {
                    return Err(PeopleFlowError::Processing(format!("读取视频数据包失败: {}", e)))
                }
            }
        }
    }

    fn convert_frame(&mut self, decoded: &Video) -> Result<RgbImage> {
        let mut rgb = Video::empty();
        self.scaler
            .run(decoded, &mut rgb)
            .map_err(|e| PeopleFlowError::Processing(format!("图像格式转换失败: {}", e)))?;

        let (width, height) = (rgb.width(), rgb.height());
        let stride = rgb.stride(0);
        let data = rgb.data(0);
        let row_bytes = width as usize * 3;
        let mut buf = Vec::with_capacity(row_bytes * height as usize);
        for y in 0..height as usize {
            let start = y * stride;
            let row = data
                .get(start..start + row_bytes)
                .ok_or_else(|| PeopleFlowError::Processing("视频帧数据不完整".to_string()))?;
            buf.extend_from_slice(row);
        }
        RgbImage::from_raw(width, height, buf)
            .ok_or_else(|| PeopleFlowError::Processing("视频帧尺寸不匹配".to_string()))
    }
}

impl Iterator for LibavFrameReader {
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

/// 把 `mp4v`/`XVID` 转为 libav 的 codec tag
fn fourcc_tag(fourcc: &str) -> u32 {
    fourcc
        .bytes()
        .take(4)
        .enumerate()
        .fold(0, |tag, (i, b)| tag | (b as u32) << (8 * i))
}

/// MPEG-4 Part 2 编码写出，RGB24 输入先转为 YUV420P
struct LibavFrameWriter {
    output: format::context::Output,
    encoder: encoder::Video,
    scaler: scaling::Context,
    stream_index: usize,
    encoder_time_base: Rational,
    stream_time_base: Rational,
    width: u32,
    height: u32,
    next_pts: i64,
    finished: bool,
}

impl LibavFrameWriter {
    /// 写完文件头才算打开成功，容器不接受该编码时在这里失败
    fn open(
        path: &Path,
        output_codec: OutputCodec,
        meta: &VideoMetadata,
    ) -> std::result::Result<Self, String> {
        init_ffmpeg()?;

        let mut output = format::output(&path).map_err(|e| format!("无法创建输出文件: {}", e))?;
        let global_header = output.format().flags().contains(format::Flags::GLOBAL_HEADER);
        let mpeg4 = encoder::find(codec::Id::MPEG4).ok_or_else(|| "未找到 MPEG-4 编码器".to_string())?;

        let frame_rate = if meta.fps > 0.0 {
            Rational::from(meta.fps)
        } else {
            Rational::new(25, 1)
        };
        let encoder_time_base = frame_rate.invert();

        let mut ctx = codec::context::Context::new_with_codec(mpeg4)
            .encoder()
            .video()
            .map_err(|e| format!("无法创建视频编码器: {}", e))?;
        ctx.set_width(meta.width);
        ctx.set_height(meta.height);
        ctx.set_format(Pixel::YUV420P);
        ctx.set_time_base(encoder_time_base);
        ctx.set_frame_rate(Some(frame_rate));
        if global_header {
            ctx.set_flags(codec::Flags::GLOBAL_HEADER);
        }
        unsafe {
            (*ctx.as_mut_ptr()).codec_tag = fourcc_tag(output_codec.fourcc());
        }
        let encoder = ctx
            .open_as(mpeg4)
            .map_err(|e| format!("无法打开 {} 编码器: {}", output_codec.fourcc(), e))?;

        let stream_index = {
            let mut stream = output
                .add_stream(mpeg4)
                .map_err(|e| format!("无法添加视频流: {}", e))?;
            stream.set_parameters(&encoder);
            stream.index()
        };
        output
            .write_header()
            .map_err(|e| format!("写入文件头失败: {}", e))?;
        let stream_time_base = output
            .stream(stream_index)
            .map(|s| s.time_base())
            .ok_or_else(|| "视频流不存在".to_string())?;

        let scaler = scaling::Context::get(
            Pixel::RGB24,
            meta.width,
            meta.height,
            Pixel::YUV420P,
            meta.width,
            meta.height,
            scaling::Flags::BILINEAR,
        )
        .map_err(|e| format!("无法创建图像缩放器: {}", e))?;

        Ok(Self {
            output,
            encoder,
            scaler,
            stream_index,
            encoder_time_base,
            stream_time_base,
            width: meta.width,
            height: meta.height,
            next_pts: 0,
            finished: false,
        })
    }

    fn write_packets(&mut self) -> Result<()> {
        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
            packet
                .write_interleaved(&mut self.output)
                .map_err(|e| PeopleFlowError::Processing(format!("写入视频数据包失败: {}", e)))?;
        }
        Ok(())
    }

    /// 冲刷编码器并写文件尾
    fn close(&mut self) -> Result<()> {
        self.finished = true;
        self.encoder
            .send_eof()
            .map_err(|e| PeopleFlowError::Processing(format!("视频编码失败: {}", e)))?;
        self.write_packets()?;
        self.output
            .write_trailer()
            .map_err(|e| PeopleFlowError::Processing(format!("写入文件尾失败: {}", e)))
    }
}

impl FrameSink for LibavFrameWriter {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(PeopleFlowError::Processing(format!(
                "输出帧尺寸不匹配: {}x{} != {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }

        let mut src = Video::new(Pixel::RGB24, self.width, self.height);
        let stride = src.stride(0);
        let row_bytes = self.width as usize * 3;
        let data = src.data_mut(0);
        for (y, row) in frame.as_raw().chunks_exact(row_bytes).enumerate() {
            data[y * stride..y * stride + row_bytes].copy_from_slice(row);
        }

        let mut yuv = Video::empty();
        self.scaler
            .run(&src, &mut yuv)
            .map_err(|e| PeopleFlowError::Processing(format!("图像格式转换失败: {}", e)))?;
        yuv.set_pts(Some(self.next_pts));
        self.next_pts += 1;

        self.encoder
            .send_frame(&yuv)
            .map_err(|e| PeopleFlowError::Processing(format!("视频编码失败: {}", e)))?;
        self.write_packets()
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.close()
    }
}

impl Drop for LibavFrameWriter {
    fn drop(&mut self) {
        // 中途出错时也写完文件尾，已写出的帧保持可播放
        if !self.finished {
            if let Err(e) = self.close() {
                warn!("⚠️  [视频编码] 关闭输出失败: {}", e);
            }
        }
    }
}
