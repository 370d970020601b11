pub mod annotator;
pub mod batch;
pub mod color;
pub mod config;
pub mod detector;
pub mod error;
pub mod handler;
#[cfg(feature = "libav")]
pub mod libav_backend;
pub mod live;
pub mod metadata;
pub mod occupancy;
pub mod processor;
pub mod remote_detector;
pub mod video_processor;

pub use annotator::{FrameAnnotator, OverlayMode};
pub use batch::{spawn_batch, BatchJobHandle, BatchObserver, BatchRunner, BatchStatus};
pub use color::IdentityColorMap;
pub use config::{AppConfig, ConfigLoader, ConfigOverrides};
pub use detector::{DetectionFilter, Detector, TrackedFrame, TrackingStream};
pub use error::{PeopleFlowError, Result};
pub use live::{LatestResultSlot, LiveDetectionGate};
pub use metadata::{
    BatchReport, DetectionBox, JobStatus, LiveDetectionResult, OccupancySnapshot, VideoJobResult,
    VideoMetadata,
};
pub use occupancy::OccupancyAggregator;
pub use processor::{process_video, JobState, ProcessConfig, ProcessOutput, VideoTrackingJob};
pub use remote_detector::RemoteDetector;
pub use video_processor::{default_backend, FfmpegBackend, FrameSink, OutputCodec, VideoBackend};
