mod common;

use std::path::Path;
use std::sync::{Arc, Mutex};

use common::{touch_videos, FakeBackend, ScriptedDetector};
use people_flow::batch::{BatchRunner, BatchStatus, REPORT_FILE, REPORT_HEADER, REPORT_JSON_FILE};
use people_flow::error::PeopleFlowError;
use people_flow::metadata::JobStatus;
use people_flow::processor::{process_video, FrameProgress, JobState, ProcessConfig, VideoTrackingJob};
use people_flow::video_processor::OutputCodec;
use people_flow::{spawn_batch, BatchReport};

fn three_frame_script() -> Vec<Vec<u64>> {
    vec![vec![1, 2], vec![2, 3], vec![]]
}

#[test]
fn test_single_video_counts_distinct_identities() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("gate.mp4");
    let out = dir.path().join("out");

    let backend = FakeBackend::new().with_video("gate.mp4", 3);
    let mut detector = ScriptedDetector::new().with_script("gate.mp4", three_frame_script());

    let output = process_video(&input, &out, &ProcessConfig::default(), &mut detector, &backend)
        .unwrap();

    assert_eq!(output.people_total, 3);
    assert_eq!(output.frames_processed, 3);
    assert_eq!(output.codec, OutputCodec::Mp4v);
    assert_eq!(output.output_path, out.join("gate_人流统计.mp4"));

    let record = backend.output(&output.output_path).unwrap();
    assert_eq!(record.frames, 3);
    assert!(record.finished);
}

#[test]
fn test_empty_video_reports_zero_people() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new().with_video("empty.mp4", 0);
    let mut detector = ScriptedDetector::new();

    let output = process_video(
        dir.path().join("empty.mp4"),
        dir.path(),
        &ProcessConfig::default(),
        &mut detector,
        &backend,
    )
    .unwrap();

    assert_eq!(output.people_total, 0);
    assert_eq!(output.frames_processed, 0);
    assert!(backend.output(&output.output_path).unwrap().finished);
}

#[test]
fn test_falls_back_to_avi_when_mp4v_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new()
        .with_video("clip.mov", 3)
        .rejecting(OutputCodec::Mp4v);
    let mut detector = ScriptedDetector::new().with_script("clip.mov", three_frame_script());

    let output = process_video(
        dir.path().join("clip.mov"),
        dir.path(),
        &ProcessConfig::default(),
        &mut detector,
        &backend,
    )
    .unwrap();

    assert_eq!(output.codec, OutputCodec::Xvid);
    assert_eq!(output.output_path, dir.path().join("clip_人流统计.avi"));
    assert_eq!(output.people_total, 3);
}

#[test]
fn test_no_usable_codec_is_output_open_error() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new()
        .with_video("clip.mp4", 3)
        .rejecting(OutputCodec::Mp4v)
        .rejecting(OutputCodec::Xvid);
    let mut detector = ScriptedDetector::new().with_script("clip.mp4", three_frame_script());

    let err = process_video(
        dir.path().join("clip.mp4"),
        dir.path(),
        &ProcessConfig::default(),
        &mut detector,
        &backend,
    )
    .unwrap_err();

    assert!(matches!(err, PeopleFlowError::OutputOpen { .. }));
}

#[test]
fn test_unreadable_video_fails_before_output() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let backend = FakeBackend::new();
    let mut detector = ScriptedDetector::new();
    let config = ProcessConfig::default();

    let mut job = VideoTrackingJob::new(dir.path().join("broken.mp4"), &out, &config);
    let err = job.run(&mut detector, &backend).unwrap_err();

    assert!(matches!(err, PeopleFlowError::VideoOpen { .. }));
    assert_eq!(job.state(), JobState::Failed);
    assert!(backend.outputs.lock().unwrap().is_empty());
}

#[test]
fn test_mid_stream_failure_keeps_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new().with_video("long.mp4", 5);
    let mut detector = ScriptedDetector::new()
        .with_script("long.mp4", vec![vec![1]; 5])
        .failing_after("long.mp4", 2);

    let err = process_video(
        dir.path().join("long.mp4"),
        dir.path(),
        &ProcessConfig::default(),
        &mut detector,
        &backend,
    )
    .unwrap_err();

    assert!(matches!(err, PeopleFlowError::Processing(ref m) if m.contains("CUDA")));
    let record = backend
        .output(&dir.path().join("long_人流统计.mp4"))
        .unwrap();
    assert_eq!(record.frames, 2);
    assert!(!record.finished);
}

#[test]
fn test_progress_reported_every_interval() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new().with_video("walk.mp4", 7);
    let mut detector = ScriptedDetector::new().with_script(
        "walk.mp4",
        vec![vec![1], vec![1, 2], vec![2], vec![3], vec![], vec![4], vec![4]],
    );
    let config = ProcessConfig {
        progress_interval: 3,
        ..Default::default()
    };

    let seen: Mutex<Vec<(u64, usize)>> = Mutex::new(Vec::new());
    let record = |p: &FrameProgress| {
        assert_eq!(p.video_name, "walk.mp4");
        assert_eq!(p.total_frames, 7);
        seen.lock()
            .unwrap()
            .push((p.frames_processed, p.cumulative_count));
    };

    let mut job = VideoTrackingJob::new(dir.path().join("walk.mp4"), dir.path(), &config)
        .with_progress(&record);
    let output = job.run(&mut detector, &backend).unwrap();

    assert_eq!(job.state(), JobState::Succeeded);
    assert_eq!(output.people_total, 4);
    assert_eq!(*seen.lock().unwrap(), vec![(3, 2), (6, 4)]);
}

fn three_video_fixture(root: &Path, broken: &str) -> (FakeBackend, ScriptedDetector) {
    let names = ["a.mp4", "b.mp4", "c.mov"];
    touch_videos(&root.join("video"), &names);
    std::fs::write(root.join("video").join("notes.txt"), "ignored").unwrap();

    let mut backend = FakeBackend::new();
    let mut detector = ScriptedDetector::new();
    for (i, name) in names.iter().enumerate() {
        if *name != broken {
            backend = backend.with_video(name, 3);
        }
        let ids: Vec<u64> = (0..=i as u64).collect();
        detector = detector.with_script(name, vec![ids; 3]);
    }
    (backend, detector)
}

#[test]
fn test_batch_isolates_failures_in_any_position() {
    for broken in ["a.mp4", "b.mp4", "c.mov"] {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("video");
        let out = dir.path().join("tracking_results");
        let (backend, detector) = three_video_fixture(dir.path(), broken);

        let mut runner =
            BatchRunner::new(Box::new(detector), Arc::new(backend), ProcessConfig::default());
        let report = runner.run(&input, &out).unwrap();

        let names: Vec<_> = report.results.iter().map(|r| r.video_name.as_str()).collect();
        assert_eq!(names, vec!["a.mp4", "b.mp4", "c.mov"]);
        assert_eq!(report.failure_count(), 1);
        assert_eq!(report.success_count(), 2);

        let failed = report.get(broken).unwrap();
        assert!(matches!(failed.status, JobStatus::Failure { .. }));

        for (i, name) in ["a.mp4", "b.mp4", "c.mov"].iter().enumerate() {
            if *name == broken {
                continue;
            }
            match &report.get(name).unwrap().status {
                JobStatus::Success { people_total, .. } => assert_eq!(*people_total, i + 1),
                other => panic!("{} should succeed, got {:?}", name, other),
            }
        }
    }
}

#[test]
fn test_batch_writes_text_and_json_reports() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("video");
    let out = dir.path().join("tracking_results");
    let (backend, detector) = three_video_fixture(dir.path(), "b.mp4");

    let mut runner =
        BatchRunner::new(Box::new(detector), Arc::new(backend), ProcessConfig::default());
    runner.run(&input, &out).unwrap();

    let text = std::fs::read_to_string(out.join(REPORT_FILE)).unwrap();
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines[0], REPORT_HEADER);
    assert_eq!(lines[1], "=".repeat(50));
    assert_eq!(lines[2], "a.mp4: 1 人");
    assert!(lines[3].starts_with("b.mp4: 处理失败: "));
    assert_eq!(lines[4], "c.mov: 3 人");

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join(REPORT_JSON_FILE)).unwrap())
            .unwrap();
    assert_eq!(json["results"][0]["video_name"], "a.mp4");
    assert_eq!(json["results"][0]["status"], "success");
    assert_eq!(json["results"][1]["status"], "failure");
}

#[test]
fn test_batch_survives_detector_panic() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("video");
    let out = dir.path().join("out");
    let (backend, detector) = three_video_fixture(dir.path(), "none");
    let detector = detector.panicking_on("a.mp4");

    let mut runner =
        BatchRunner::new(Box::new(detector), Arc::new(backend), ProcessConfig::default());
    let report = runner.run(&input, &out).unwrap();

    assert_eq!(report.len(), 3);
    match &report.get("a.mp4").unwrap().status {
        JobStatus::Failure { reason } => assert!(reason.contains("tracker state corrupted")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(report.success_count(), 2);
}

#[test]
fn test_batch_creates_missing_directories() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("video");
    let out = dir.path().join("tracking_results");

    let mut runner = BatchRunner::new(
        Box::new(ScriptedDetector::new()),
        Arc::new(FakeBackend::new()),
        ProcessConfig::default(),
    );
    let report = runner.run(&input, &out).unwrap();

    assert!(report.is_empty());
    assert!(input.is_dir());
    let text = std::fs::read_to_string(out.join(REPORT_FILE)).unwrap();
    assert_eq!(text.lines().count(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_background_batch_finishes() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("video");
    let out = dir.path().join("out");
    let (backend, detector) = three_video_fixture(dir.path(), "c.mov");

    let runner = BatchRunner::new(Box::new(detector), Arc::new(backend), ProcessConfig::default());
    let handle = spawn_batch(runner, input, out.clone());
    assert!(!handle.id().is_empty());

    while !handle.is_finished() {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    let status = handle.status();
    let report: BatchReport = match status {
        BatchStatus::Finished { report } => report,
        other => panic!("expected finished, got {:?}", other),
    };
    assert_eq!(report.len(), 3);
    assert_eq!(report.failure_count(), 1);

    let waited = handle.wait().await.unwrap();
    assert_eq!(waited, report);
    assert!(out.join(REPORT_FILE).exists());
}
