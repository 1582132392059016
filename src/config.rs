use anyhow::Result;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::vision::{DEFAULT_ENDPOINT, DEFAULT_MODEL};

/// 视觉模型配置
#[derive(Debug, Clone, PartialEq)]
pub struct VisionConfig {
    /// 是否启用视觉分析
    pub enabled: bool,
    /// API Key（未设置时从凭证存储读取）
    pub api_key: Option<String>,
    pub model: String,
    pub endpoint: String,
    /// 请求超时（秒）
    pub timeout_secs: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout_secs: 60,
        }
    }
}

impl VisionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// 分析配置
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    /// 采样帧数
    pub frame_count: usize,
    /// 每帧之后的停顿（毫秒）
    pub pacing_ms: u64,
    /// 单次取帧超时（秒）
    pub seek_timeout_secs: u64,
    pub vision: VisionConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            frame_count: 12,
            pacing_ms: 0,
            seek_timeout_secs: 10,
            vision: VisionConfig::default(),
        }
    }
}

/// 扩展配置（包含输出路径、日志级别）
#[derive(Debug, Clone)]
pub struct ExtendedConfig {
    pub analysis: AnalysisConfig,
    /// 输出目录（可选）
    pub output_path: Option<PathBuf>,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
}

/// 命令行或请求参数中的覆盖值
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub frame_count: Option<usize>,
    pub pacing_ms: Option<u64>,
    pub vision: Option<bool>,
    pub api_key: Option<String>,
}

/// 某一个来源（环境变量或配置文件）中读到的值
#[derive(Debug, Clone, Default)]
struct PartialConfig {
    frame_count: Option<usize>,
    pacing_ms: Option<u64>,
    seek_timeout_secs: Option<u64>,
    vision_enabled: Option<bool>,
    api_key: Option<String>,
    model: Option<String>,
    endpoint: Option<String>,
    vision_timeout_secs: Option<u64>,
    output_path: Option<PathBuf>,
    log_level: Option<String>,
}

/// 默认配置文件名
const CONFIG_FILE_NAME: &str = "style-recon.ini";

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load_config(
        config_file: Option<&Path>,
        overrides: &ConfigOverrides,
    ) -> Result<AnalysisConfig> {
        let file_config = Self::load_file_config(config_file)?;
        Ok(Self::merge(overrides, &Self::load_from_env(), file_config.as_ref()))
    }

    /// 加载扩展配置
    pub fn load_extended_config(
        config_file: Option<&Path>,
        overrides: &ConfigOverrides,
    ) -> Result<ExtendedConfig> {
        let file_config = Self::load_file_config(config_file)?;
        let env_config = Self::load_from_env();

        Ok(ExtendedConfig {
            analysis: Self::merge(overrides, &env_config, file_config.as_ref()),
            output_path: env_config
                .output_path
                .or_else(|| file_config.as_ref().and_then(|c| c.output_path.clone())),
            log_level: env_config
                .log_level
                .or_else(|| file_config.as_ref().and_then(|c| c.log_level.clone()))
                .unwrap_or_else(|| "info".to_string()),
        })
    }

    /// 日志级别：配置读取失败或级别无法识别时使用 INFO
    pub fn resolve_log_level(config_file: Option<&Path>) -> tracing::Level {
        Self::load_extended_config(config_file, &ConfigOverrides::default())
            .ok()
            .and_then(|extended| extended.log_level.parse().ok())
            .unwrap_or(tracing::Level::INFO)
    }

    /// 显式指定的文件必须存在；否则按默认位置查找，找不到不算错误
    fn load_file_config(config_file: Option<&Path>) -> Result<Option<PartialConfig>> {
        match config_file {
            Some(path) => Self::load_from_file(path).map(Some),
            None => Ok(Self::default_locations()
                .into_iter()
                .find(|p| p.exists())
                .and_then(|p| Self::load_from_file(&p).ok())),
        }
    }

    fn merge(
        overrides: &ConfigOverrides,
        env_config: &PartialConfig,
        file_config: Option<&PartialConfig>,
    ) -> AnalysisConfig {
        let defaults = AnalysisConfig::default();
        AnalysisConfig {
            frame_count: overrides
                .frame_count
                .or(env_config.frame_count)
                .or(file_config.and_then(|c| c.frame_count))
                .filter(|n| *n > 0)
                .unwrap_or(defaults.frame_count),
            pacing_ms: overrides
                .pacing_ms
                .or(env_config.pacing_ms)
                .or(file_config.and_then(|c| c.pacing_ms))
                .unwrap_or(defaults.pacing_ms),
            seek_timeout_secs: env_config
                .seek_timeout_secs
                .or(file_config.and_then(|c| c.seek_timeout_secs))
                .filter(|n| *n > 0)
                .unwrap_or(defaults.seek_timeout_secs),
            vision: VisionConfig {
                enabled: overrides
                    .vision
                    .or(env_config.vision_enabled)
                    .or(file_config.and_then(|c| c.vision_enabled))
                    .unwrap_or(defaults.vision.enabled),
                api_key: overrides
                    .api_key
                    .clone()
                    .or_else(|| env_config.api_key.clone())
                    .or_else(|| file_config.and_then(|c| c.api_key.clone()))
                    .filter(|k| !k.trim().is_empty()),
                model: env_config
                    .model
                    .clone()
                    .or_else(|| file_config.and_then(|c| c.model.clone()))
                    .unwrap_or(defaults.vision.model),
                endpoint: env_config
                    .endpoint
                    .clone()
                    .or_else(|| file_config.and_then(|c| c.endpoint.clone()))
                    .unwrap_or(defaults.vision.endpoint),
                timeout_secs: env_config
                    .vision_timeout_secs
                    .or(file_config.and_then(|c| c.vision_timeout_secs))
                    .unwrap_or(defaults.vision.timeout_secs),
            },
        }
    }

    /// 从环境变量加载配置
    fn load_from_env() -> PartialConfig {
        fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
            env::var(key).ok().and_then(|v| v.trim().parse().ok())
        }

        PartialConfig {
            frame_count: parsed("STYLE_RECON_FRAME_COUNT"),
            pacing_ms: parsed("STYLE_RECON_PACING_MS"),
            seek_timeout_secs: parsed("STYLE_RECON_SEEK_TIMEOUT"),
            vision_enabled: env::var("STYLE_RECON_VISION").ok().map(|v| parse_bool(&v)),
            api_key: env::var("GEMINI_API_KEY").ok(),
            model: env::var("STYLE_RECON_VISION_MODEL").ok(),
            endpoint: env::var("STYLE_RECON_VISION_ENDPOINT").ok(),
            vision_timeout_secs: parsed("STYLE_RECON_VISION_TIMEOUT"),
            output_path: env::var("OUTPUT_PATH").ok().map(PathBuf::from),
            log_level: env::var("LOG_LEVEL").ok(),
        }
    }

    /// 从INI配置文件加载配置
    fn load_from_file(config_path: &Path) -> Result<PartialConfig> {
        if !config_path.exists() {
            return Err(anyhow::anyhow!("配置文件不存在: {}", config_path.display()));
        }

        let mut ini = configparser::ini::Ini::new();
        ini.load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;

        // 先读指定节，再回退到 [DEFAULT]
        let get = |section: &str, key: &str| {
            ini.get(section, key)
                .or_else(|| ini.get("DEFAULT", key))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Ok(PartialConfig {
            frame_count: get("style_recon", "frame_count").and_then(|v| v.parse().ok()),
            pacing_ms: get("style_recon", "pacing_ms").and_then(|v| v.parse().ok()),
            seek_timeout_secs: get("style_recon", "seek_timeout_secs").and_then(|v| v.parse().ok()),
            vision_enabled: get("vision", "enabled").map(|v| parse_bool(&v)),
            api_key: get("vision", "api_key"),
            model: get("vision", "model"),
            endpoint: get("vision", "endpoint"),
            vision_timeout_secs: get("vision", "timeout_secs").and_then(|v| v.parse().ok()),
            output_path: get("style_recon", "output_path").map(PathBuf::from),
            log_level: ini
                .get("logging", "level")
                .or_else(|| ini.get("DEFAULT", "log_level"))
                .filter(|v| !v.is_empty()),
        })
    }

    /// 默认查找位置，按顺序：当前目录、当前目录隐藏文件、用户主目录、/etc
    fn default_locations() -> Vec<PathBuf> {
        let mut locations = vec![
            PathBuf::from(CONFIG_FILE_NAME),
            PathBuf::from(format!(".{}", CONFIG_FILE_NAME)),
        ];
        if let Some(home) = env::var_os("HOME") {
            locations.push(PathBuf::from(home).join(format!(".{}", CONFIG_FILE_NAME)));
        }
        locations.push(PathBuf::from("/etc").join(CONFIG_FILE_NAME));
        locations
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = AnalysisConfig::default();
        let mut ini = configparser::ini::Ini::new();
        ini.set("style_recon", "frame_count", Some(defaults.frame_count.to_string()));
        ini.set("style_recon", "pacing_ms", Some(defaults.pacing_ms.to_string()));
        ini.set("style_recon", "seek_timeout_secs", Some(defaults.seek_timeout_secs.to_string()));
        ini.set("style_recon", "output_path", Some("".to_string()));
        ini.set("vision", "enabled", Some("false".to_string()));
        ini.set("vision", "api_key", Some("".to_string()));
        ini.set("vision", "model", Some(defaults.vision.model));
        ini.set("vision", "endpoint", Some(defaults.vision.endpoint));
        ini.set("vision", "timeout_secs", Some(defaults.vision.timeout_secs.to_string()));
        ini.set("logging", "level", Some("info".to_string()));

        ini.write(config_path)
            .map_err(|e| anyhow::anyhow!("写入配置文件失败: {}: {}", config_path.display(), e))?;

        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}
