use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use people_flow::{
    config::{AppConfig, ConfigLoader, ConfigOverrides},
    live::LIVE_ERROR_LOG,
    spawn_batch,
    video_processor::default_backend,
    BatchRunner, LatestResultSlot, LiveDetectionGate, RemoteDetector, VideoBackend,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// 人流统计工具 - 对视频中的行人做检测跟踪，统计当前人数与累计人数
#[derive(Parser, Debug)]
#[command(name = "people-flow")]
#[command(about = "人流统计工具：批量处理视频目录，或启动实时检测服务", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 批处理模式：处理目录下的所有视频并生成统计报告
    Batch {
        /// 输入视频目录（默认 video）
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// 输出目录（默认 tracking_results）
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// 配置文件路径（可选，支持 .ini 格式）
        /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
        #[arg(long)]
        config: Option<PathBuf>,

        /// 检测置信度阈值 (0.0-1.0)
        /// 可通过环境变量 PEOPLE_FLOW_CONFIDENCE 或配置文件设置
        #[arg(long)]
        conf: Option<f32>,

        /// 推理服务地址
        /// 可通过环境变量 PEOPLE_FLOW_DETECTOR_ENDPOINT 或配置文件设置
        #[arg(long)]
        detector: Option<String>,
    },
    /// Web 服务模式：实时单帧检测与后台批处理
    Serve {
        /// 监听地址（默认从环境变量 PEOPLE_FLOW_BIND 或 FC_SERVER_PORT 读取，否则使用 0.0.0.0:9000）
        #[arg(short, long)]
        bind: Option<String>,

        /// 配置文件路径
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// 生成默认配置文件
    InitConfig {
        /// 配置文件输出路径
        #[arg(default_value = "people-flow.ini")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Batch {
            input,
            output,
            config: config_file,
            conf,
            detector,
        } => {
            let config = ConfigLoader::load_config(
                config_file.as_deref(),
                ConfigOverrides {
                    input_dir: input,
                    output_dir: output,
                    confidence: conf,
                    detector_endpoint: detector,
                },
            )
            .context("加载配置失败")?;
            init_logging(&config);

            tracing::info!(
                "使用配置: input={}, output={}, conf={:.2}, classes={:?}, detector={}",
                config.input_dir.display(),
                config.output_dir.display(),
                config.process.filter.confidence,
                config.process.filter.classes,
                config.detector_endpoint
            );

            let runner_config = config.clone();
            let runner = tokio::task::spawn_blocking(move || build_runner(&runner_config))
                .await
                .context("创建检测后端失败")??;

            let handle = spawn_batch(runner, config.input_dir.clone(), config.output_dir.clone());
            let report = handle.wait().await.context("批处理失败")?;

            println!(
                "处理完成: 成功 {} 个，失败 {} 个，报告已保存到 {}",
                report.success_count(),
                report.failure_count(),
                config.output_dir.display()
            );
        }
        Commands::Serve {
            bind,
            config: config_file,
        } => {
            let config = ConfigLoader::load_config(config_file.as_deref(), ConfigOverrides::default())
                .context("加载配置失败")?;
            init_logging(&config);

            // 优先使用命令行参数，其次使用环境变量，最后使用默认值 9000
            let bind_addr = bind
                .or_else(|| std::env::var("PEOPLE_FLOW_BIND").ok())
                .unwrap_or_else(|| {
                    std::env::var("FC_SERVER_PORT")
                        .map(|port| format!("0.0.0.0:{}", port))
                        .unwrap_or_else(|_| "0.0.0.0:9000".to_string())
                });
            start_web_server(&bind_addr, config).await?;
        }
        Commands::InitConfig { path } => {
            ConfigLoader::create_default_config(&path).context("生成配置文件失败")?;
            println!("已生成默认配置文件: {}", path.display());
        }
    }

    Ok(())
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_detector(
    config: &AppConfig,
    backend: Arc<dyn VideoBackend>,
) -> people_flow::Result<RemoteDetector> {
    RemoteDetector::new(
        config.detector_endpoint.clone(),
        config.detector_timeout,
        backend,
    )
}

fn build_runner(config: &AppConfig) -> people_flow::Result<BatchRunner> {
    let backend = default_backend();
    let detector = build_detector(config, backend.clone())?;
    Ok(BatchRunner::new(
        Box::new(detector),
        backend,
        config.process.clone(),
    ))
}

async fn start_web_server(bind: &str, config: AppConfig) -> Result<()> {
    use people_flow::handler::{self, AppState};
    use tower_http::cors::CorsLayer;

    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("创建输出目录失败: {}", config.output_dir.display()))?;

    // 实时检测独占一个检测后端实例
    let live_config = config.clone();
    let live_detector = tokio::task::spawn_blocking(move || {
        build_detector(&live_config, default_backend())
    })
    .await
    .context("创建检测后端失败")??;
    let detector_endpoint = live_detector.endpoint().to_string();

    let gate = LiveDetectionGate::new(
        Box::new(live_detector),
        config.process.filter.clone(),
        config.gate_timeout,
        LatestResultSlot::new(),
    )
    .with_error_log(config.output_dir.join(LIVE_ERROR_LOG));

    let factory_config = config.clone();
    let state = AppState::new(
        gate,
        Box::new(move || build_runner(&factory_config)),
        config.input_dir.clone(),
        config.output_dir.clone(),
    );

    let app = handler::router(state).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context(format!("绑定地址失败: {}", bind))?;

    tracing::info!("Web 服务器启动在: http://{}", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("可用端点:");
    tracing::info!("  • 健康检查: GET  http://{}/health", bind);
    tracing::info!("  • 实时检测: POST http://{}/detect", bind);
    tracing::info!("  • 最近结果: GET  http://{}/latest", bind);
    tracing::info!("  • 启动批处理: POST http://{}/batch", bind);
    tracing::info!("  • 批处理状态: GET  http://{}/batch", bind);
    tracing::info!("推理服务: {}", detector_endpoint);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    axum::serve(listener, app)
        .await
        .context("启动服务器失败")?;

    Ok(())
}
