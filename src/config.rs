use anyhow::Result;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detector::DetectionFilter;
use crate::processor::ProcessConfig;

const DEFAULT_INPUT_DIR: &str = "video";
const DEFAULT_OUTPUT_DIR: &str = "tracking_results";
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_PROGRESS_INTERVAL: u64 = 100;
const DEFAULT_GATE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_DETECTOR_ENDPOINT: &str = "http://127.0.0.1:8000";
const DEFAULT_DETECTOR_TIMEOUT_SECS: u64 = 30;

/// 完整运行配置
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// 待处理视频目录
    pub input_dir: PathBuf,
    /// 结果输出目录
    pub output_dir: PathBuf,
    /// 单个视频的处理配置
    pub process: ProcessConfig,
    /// 实时检测等待推理令牌的上限
    pub gate_timeout: Duration,
    /// 推理服务地址
    pub detector_endpoint: String,
    /// 单次推理请求超时
    pub detector_timeout: Duration,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from(DEFAULT_INPUT_DIR),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            process: ProcessConfig::default(),
            gate_timeout: Duration::from_millis(DEFAULT_GATE_TIMEOUT_MS),
            detector_endpoint: DEFAULT_DETECTOR_ENDPOINT.to_string(),
            detector_timeout: Duration::from_secs(DEFAULT_DETECTOR_TIMEOUT_SECS),
            log_level: "info".to_string(),
        }
    }
}

/// 命令行中显式给出的覆盖项
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub input_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub confidence: Option<f32>,
    pub detector_endpoint: Option<String>,
}

/// 从单一来源（环境变量或配置文件）读到的值，未设置的项为 None
#[derive(Debug, Clone, Default, PartialEq)]
struct PartialConfig {
    input_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    confidence: Option<f32>,
    classes: Option<Vec<u32>>,
    progress_interval: Option<u64>,
    gate_timeout_ms: Option<u64>,
    detector_endpoint: Option<String>,
    detector_timeout_secs: Option<u64>,
    log_level: Option<String>,
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load_config(config_file: Option<&Path>, overrides: ConfigOverrides) -> Result<AppConfig> {
        // 1. 配置文件：显式指定时必须可读，否则尝试默认位置
        let file_config = match config_file {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_from_default_locations().unwrap_or_default(),
        };

        // 2. 环境变量
        let env_config = Self::load_from_env();

        Ok(Self::merge(overrides, env_config, file_config))
    }

    fn merge(cli: ConfigOverrides, env: PartialConfig, file: PartialConfig) -> AppConfig {
        let defaults = AppConfig::default();

        let confidence = cli
            .confidence
            .or(env.confidence)
            .or(file.confidence)
            .unwrap_or(DEFAULT_CONFIDENCE)
            .clamp(0.0, 1.0);
        let classes = env
            .classes
            .or(file.classes)
            .filter(|c| !c.is_empty())
            .unwrap_or(defaults.process.filter.classes);

        AppConfig {
            input_dir: cli
                .input_dir
                .or(env.input_dir)
                .or(file.input_dir)
                .unwrap_or(defaults.input_dir),
            output_dir: cli
                .output_dir
                .or(env.output_dir)
                .or(file.output_dir)
                .unwrap_or(defaults.output_dir),
            process: ProcessConfig {
                filter: DetectionFilter {
                    classes,
                    confidence,
                },
                progress_interval: env
                    .progress_interval
                    .or(file.progress_interval)
                    .unwrap_or(DEFAULT_PROGRESS_INTERVAL)
                    .max(1),
            },
            gate_timeout: Duration::from_millis(
                env.gate_timeout_ms
                    .or(file.gate_timeout_ms)
                    .unwrap_or(DEFAULT_GATE_TIMEOUT_MS),
            ),
            detector_endpoint: cli
                .detector_endpoint
                .or(env.detector_endpoint)
                .or(file.detector_endpoint)
                .unwrap_or(defaults.detector_endpoint),
            detector_timeout: Duration::from_secs(
                env.detector_timeout_secs
                    .or(file.detector_timeout_secs)
                    .unwrap_or(DEFAULT_DETECTOR_TIMEOUT_SECS),
            ),
            log_level: env
                .log_level
                .or(file.log_level)
                .unwrap_or(defaults.log_level),
        }
    }

    /// 从环境变量加载配置
    fn load_from_env() -> PartialConfig {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> PartialConfig {
        PartialConfig {
            input_dir: lookup("PEOPLE_FLOW_INPUT_DIR").map(PathBuf::from),
            output_dir: lookup("PEOPLE_FLOW_OUTPUT_DIR").map(PathBuf::from),
            confidence: lookup("PEOPLE_FLOW_CONFIDENCE").and_then(|v| v.parse().ok()),
            classes: lookup("PEOPLE_FLOW_CLASSES").and_then(|v| parse_classes(&v)),
            progress_interval: lookup("PEOPLE_FLOW_PROGRESS_INTERVAL").and_then(|v| v.parse().ok()),
            gate_timeout_ms: lookup("PEOPLE_FLOW_GATE_TIMEOUT_MS").and_then(|v| v.parse().ok()),
            detector_endpoint: lookup("PEOPLE_FLOW_DETECTOR_ENDPOINT").filter(|v| !v.is_empty()),
            detector_timeout_secs: lookup("PEOPLE_FLOW_DETECTOR_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok()),
            log_level: lookup("LOG_LEVEL").filter(|v| !v.is_empty()),
        }
    }

    /// 从INI配置文件加载配置
    fn load_from_file(config_path: &Path) -> Result<PartialConfig> {
        if !config_path.exists() {
            return Err(anyhow::anyhow!("配置文件不存在: {}", config_path.display()));
        }

        let mut config_parser = configparser::ini::Ini::new();
        config_parser
            .load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;

        // 尝试从对应节读取，如果没有则使用 [DEFAULT] 节
        let get = |section: &str, key: &str| {
            config_parser
                .get(section, key)
                .or_else(|| config_parser.get("DEFAULT", key))
                .filter(|v| !v.is_empty())
        };

        Ok(PartialConfig {
            input_dir: get("people_flow", "input_dir").map(PathBuf::from),
            output_dir: get("people_flow", "output_dir").map(PathBuf::from),
            confidence: get("people_flow", "confidence").and_then(|v| v.parse().ok()),
            classes: get("people_flow", "classes").and_then(|v| parse_classes(&v)),
            progress_interval: get("people_flow", "progress_interval").and_then(|v| v.parse().ok()),
            gate_timeout_ms: get("people_flow", "gate_timeout_ms").and_then(|v| v.parse().ok()),
            detector_endpoint: get("detector", "endpoint"),
            detector_timeout_secs: get("detector", "timeout_secs").and_then(|v| v.parse().ok()),
            log_level: get("logging", "level"),
        })
    }

    /// 从默认位置加载配置文件
    fn load_from_default_locations() -> Result<PartialConfig> {
        let mut candidates = vec![
            // 1. 当前目录
            PathBuf::from("people-flow.ini"),
            PathBuf::from(".people-flow.ini"),
        ];
        // 2. 用户主目录
        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(".people-flow.ini"));
        }
        // 3. /etc (Linux/macOS)
        candidates.push(PathBuf::from("/etc/people-flow.ini"));

        for path in candidates {
            if path.exists() {
                return Self::load_from_file(&path);
            }
        }

        Err(anyhow::anyhow!("未找到配置文件"))
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let mut config_parser = configparser::ini::Ini::new();
        config_parser.set("people_flow", "input_dir", Some(DEFAULT_INPUT_DIR.to_string()));
        config_parser.set("people_flow", "output_dir", Some(DEFAULT_OUTPUT_DIR.to_string()));
        config_parser.set("people_flow", "confidence", Some(DEFAULT_CONFIDENCE.to_string()));
        config_parser.set("people_flow", "classes", Some("0".to_string()));
        config_parser.set(
            "people_flow",
            "progress_interval",
            Some(DEFAULT_PROGRESS_INTERVAL.to_string()),
        );
        config_parser.set(
            "people_flow",
            "gate_timeout_ms",
            Some(DEFAULT_GATE_TIMEOUT_MS.to_string()),
        );
        config_parser.set("detector", "endpoint", Some(DEFAULT_DETECTOR_ENDPOINT.to_string()));
        config_parser.set(
            "detector",
            "timeout_secs",
            Some(DEFAULT_DETECTOR_TIMEOUT_SECS.to_string()),
        );
        config_parser.set("logging", "level", Some("info".to_string()));

        config_parser
            .write(config_path)
            .map_err(|e| anyhow::anyhow!("写入配置文件失败: {}: {}", config_path.display(), e))?;

        Ok(())
    }
}

/// 解析 `0,2,5` 形式的类别列表
fn parse_classes(value: &str) -> Option<Vec<u32>> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().ok())
        .collect()
}
