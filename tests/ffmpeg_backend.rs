//! 用脚本替身代替 ffmpeg/ffprobe，验证命令行后端对子进程失败的处理。
#![cfg(unix)]

mod common;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use common::ScriptedDetector;
use people_flow::error::PeopleFlowError;
use people_flow::metadata::VideoMetadata;
use people_flow::processor::{process_video, ProcessConfig};
use people_flow::video_processor::{FfmpegBackend, OutputCodec, VideoBackend};

/// 固定报告 64x48、25fps、3 帧
const FFPROBE: &str = r#"#!/bin/sh
echo '{"streams":[{"width":64,"height":48,"avg_frame_rate":"25/1","nb_frames":"3"}],"format":{"duration":"0.12"}}'
"#;

/// 最后一个参数是输出位置：`-` 为解码，`.mp4` 模拟 mp4v 编码器不可用，其余照收 stdin
fn ffmpeg_script(decode: &str) -> String {
    format!(
        r#"#!/bin/sh
for last; do :; done
case "$last" in
  -) {decode} ;;
  *.mp4) sleep 0.05; exit 1 ;;
  *) cat > "$last" ;;
esac
"#
    )
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn backend(dir: &Path, decode: &str) -> FfmpegBackend {
    let ffmpeg = write_script(dir, "ffmpeg", &ffmpeg_script(decode));
    let ffprobe = write_script(dir, "ffprobe", FFPROBE);
    FfmpegBackend::with_binaries(ffmpeg, ffprobe)
}

fn tiny_meta(total_frames: u64) -> VideoMetadata {
    VideoMetadata {
        fps: 25.0,
        width: 2,
        height: 2,
        total_frames,
    }
}

#[test]
fn test_encoder_that_exits_late_falls_back_to_xvid() {
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let backend = backend(&bin, "exit 0");

    let input = dir.path().join("clip.mp4");
    std::fs::write(&input, b"\0").unwrap();
    let out = dir.path().join("out");
    let mut detector =
        ScriptedDetector::new().with_script("clip.mp4", vec![vec![1], vec![1, 2], vec![2]]);

    let output = process_video(&input, &out, &ProcessConfig::default(), &mut detector, &backend)
        .unwrap();

    assert_eq!(output.codec, OutputCodec::Xvid);
    assert_eq!(output.output_path, out.join("clip_人流统计.avi"));
    assert_eq!(output.people_total, 2);

    // 3 帧 64x48 rgb24 全部写到了替身编码器
    let written = std::fs::metadata(&output.output_path).unwrap().len();
    assert_eq!(written, 3 * 64 * 48 * 3);
    // 首选编码失败时不留下空文件
    assert!(!out.join("clip_人流统计.mp4").exists());
}

#[test]
fn test_rejected_codec_is_output_open_error() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(dir.path(), "exit 0");
    let path = dir.path().join("result.mp4");

    let err = match backend.open_writer(&path, OutputCodec::Mp4v, &tiny_meta(1)) {
        Ok(_) => panic!("mp4v writer should be rejected"),
        Err(e) => e,
    };
    assert!(matches!(err, PeopleFlowError::OutputOpen { .. }));
    assert!(!path.exists());
}

#[test]
fn test_decoder_failure_after_partial_output_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(
        dir.path(),
        "head -c 12 /dev/zero; echo 'corrupt macroblock' >&2; exit 1",
    );
    let input = dir.path().join("clip.mp4");
    std::fs::write(&input, b"\0").unwrap();

    let mut frames = backend.open_reader(&input, &tiny_meta(5)).unwrap();

    let first = frames.next().unwrap().unwrap();
    assert_eq!(first.dimensions(), (2, 2));

    match frames.next() {
        Some(Err(PeopleFlowError::Processing(msg))) => assert!(msg.contains("corrupt macroblock")),
        other => panic!("expected decode failure, got {:?}", other.map(|r| r.is_ok())),
    }
    assert!(frames.next().is_none());
}

#[test]
fn test_decoder_clean_exit_ends_stream() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(dir.path(), "head -c 24 /dev/zero");
    let input = dir.path().join("clip.mp4");
    std::fs::write(&input, b"\0").unwrap();

    let frames: Vec<_> = backend
        .open_reader(&input, &tiny_meta(2))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(frames.len(), 2);
}
