use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::analyzer::{Analyzer, ConstantDemoAnalyzer};
use crate::composer::{compose, ComposedPrompt};
use crate::config::{AnalysisConfig, VisionConfig};
use crate::credentials::CredentialStore;
use crate::descriptor::StyleDescriptor;
use crate::media::{FfmpegSource, FrameSource, MediaInfo};
use crate::sampler::{FrameSampler, SampleProgress, SampledFrame, SamplerOptions};
use crate::vision::{GeminiBackend, VisionAugmenter};

/// 一次分析的结果
#[derive(Debug, Clone)]
pub struct AnalysisOutput {
    pub run_id: String,
    pub media: MediaInfo,
    pub frames: Vec<SampledFrame>,
    pub descriptor: StyleDescriptor,
    /// 视觉分析是否成功写入
    pub vision_applied: bool,
    pub prompt: ComposedPrompt,
}

/// 帧预览（data URL）
#[derive(Debug, Clone, Serialize)]
pub struct FramePreview {
    pub index: usize,
    pub timestamp: f64,
    pub data_url: String,
}

/// 对外输出的分析报告
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub run_id: String,
    pub input: String,
    pub generated_at: String,
    pub media: MediaInfo,
    pub frame_timestamps: Vec<f64>,
    pub descriptor: StyleDescriptor,
    pub vision_applied: bool,
    pub prompt: ComposedPrompt,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<Vec<FramePreview>>,
}

impl AnalysisOutput {
    pub fn to_report(&self, input: &str, include_frames: bool) -> AnalysisReport {
        AnalysisReport {
            run_id: self.run_id.clone(),
            input: input.to_string(),
            generated_at: chrono::Utc::now().to_rfc3339(),
            media: self.media,
            frame_timestamps: self.frames.iter().map(|f| f.timestamp).collect(),
            descriptor: self.descriptor.clone(),
            vision_applied: self.vision_applied,
            prompt: self.prompt.clone(),
            frames: include_frames.then(|| {
                self.frames
                    .iter()
                    .map(|f| FramePreview {
                        index: f.index,
                        timestamp: f.timestamp,
                        data_url: f.to_data_url(),
                    })
                    .collect()
            }),
        }
    }
}

/// 视觉分析所用的 API Key：配置优先，其次凭证存储
pub fn resolve_api_key(
    config: &VisionConfig,
    store: Option<&dyn CredentialStore>,
) -> Option<String> {
    config
        .api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .or_else(|| store.and_then(|s| s.get()))
}

/// 采样 → 分析 → 视觉补充 → 生成提示词
pub struct Pipeline {
    config: AnalysisConfig,
    analyzer: Box<dyn Analyzer>,
    augmenter: Option<VisionAugmenter>,
}

impl Pipeline {
    /// 只有启用视觉分析且有 API Key 时才会创建视觉补充器
    pub fn new(config: AnalysisConfig, api_key: Option<String>) -> Self {
        let augmenter = match (config.vision.enabled, api_key.filter(|k| !k.is_empty())) {
            (true, Some(key)) => Some(VisionAugmenter::new(
                GeminiBackend::new(key)
                    .with_model(config.vision.model.clone())
                    .with_endpoint(config.vision.endpoint.clone())
                    .with_timeout(config.vision.timeout()),
            )),
            (true, None) => {
                info!("ℹ️  [分析] 已启用视觉分析但没有 API Key，跳过");
                None
            }
            (false, _) => None,
        };

        Self {
            config,
            analyzer: Box::new(ConstantDemoAnalyzer),
            augmenter,
        }
    }

    pub fn with_analyzer(mut self, analyzer: impl Analyzer + 'static) -> Self {
        self.analyzer = Box::new(analyzer);
        self
    }

    pub fn with_augmenter(mut self, augmenter: Option<VisionAugmenter>) -> Self {
        self.augmenter = augmenter;
        self
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub async fn run<S: FrameSource>(
        &self,
        source: S,
        progress: Option<UnboundedSender<SampleProgress>>,
        cancel: Option<CancellationToken>,
    ) -> Result<AnalysisOutput> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let media = *source.info();

        let total_start = Instant::now();
        info!("🎬 [分析] 开始分析 run={}", run_id);
        info!("  • 时长: {:.2}秒", media.duration);
        info!("  • 分辨率: {}x{}", media.width, media.height);
        info!("  • 帧率: {:.2} fps", media.fps);

        // 1. 采样
        let sample_start = Instant::now();
        let mut sampler = FrameSampler::new(SamplerOptions {
            seek_timeout: Duration::from_secs(self.config.seek_timeout_secs),
            pacing: Duration::from_millis(self.config.pacing_ms),
        });
        if let Some(tx) = progress {
            sampler = sampler.with_progress(tx);
        }
        if let Some(cancel) = cancel {
            sampler = sampler.with_cancellation(cancel);
        }
        let frames = sampler
            .sample(source, self.config.frame_count)
            .await
            .map_err(|e| {
                error!("❌ [分析] 采样失败: {}", e);
                e
            })
            .context("采样视频帧失败")?;
        let sample_duration = sample_start.elapsed();

        // 2. 风格描述
        let analyze_start = Instant::now();
        let descriptor = self.analyzer.analyze(&media);
        let analyze_duration = analyze_start.elapsed();
        info!(
            "✅ [分析] 风格描述完成，{} 个片段",
            descriptor.segments.len()
        );

        // 3. 视觉补充（失败时沿用原描述）
        let vision_start = Instant::now();
        let descriptor = match &self.augmenter {
            Some(augmenter) => augmenter.augment(&frames, descriptor).await,
            None => descriptor,
        };
        let vision_applied = descriptor.is_augmented();
        let vision_duration = vision_start.elapsed();

        // 4. 生成提示词
        let prompt = compose(&descriptor);

        let total_duration = total_start.elapsed();
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!(
            "🎉 [分析] 完成！总耗时: {:.2}秒 ({:.0}ms)",
            total_duration.as_secs_f64(),
            total_duration.as_millis()
        );
        info!("   • 帧采样: {:.2}秒", sample_duration.as_secs_f64());
        info!("   • 风格描述: {:.2}秒", analyze_duration.as_secs_f64());
        info!(
            "   • 视觉分析: {:.2}秒 ({})",
            vision_duration.as_secs_f64(),
            if vision_applied { "已应用" } else { "未应用" }
        );
        info!("   • 提示词长度: {} 字符", prompt.as_str().chars().count());
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        Ok(AnalysisOutput {
            run_id,
            media,
            frames,
            descriptor,
            vision_applied,
            prompt,
        })
    }
}

/// 打开本地视频文件并执行完整分析
pub async fn analyze_video(
    input_video_path: impl AsRef<Path>,
    pipeline: &Pipeline,
    progress: Option<UnboundedSender<SampleProgress>>,
    cancel: Option<CancellationToken>,
) -> Result<AnalysisOutput> {
    let input_video_path = input_video_path.as_ref().to_path_buf();
    info!("🎬 [分析] 打开视频: {}", input_video_path.display());

    let open_path = input_video_path.clone();
    let source = tokio::task::spawn_blocking(move || FfmpegSource::open(&open_path))
        .await
        .context("打开视频任务异常退出")?
        .with_context(|| format!("无法打开视频: {}", input_video_path.display()))?;

    pipeline.run(source, progress, cancel).await
}

/// 保存帧、风格描述和提示词到输出目录，返回写入的文件
pub fn save_outputs(output: &AnalysisOutput, output_dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let output_dir = output_dir.as_ref();
    std::fs::create_dir_all(output_dir).context("创建输出目录失败")?;

    let mut written = Vec::with_capacity(output.frames.len() + 2);

    for frame in &output.frames {
        let path = output_dir.join(format!(
            "frame_{:04}.{}",
            frame.index,
            frame.format.extension()
        ));
        std::fs::write(&path, &frame.data)
            .with_context(|| format!("保存帧失败: {}", path.display()))?;
        written.push(path);
    }

    let descriptor_path = output_dir.join("descriptor.json");
    let descriptor_json =
        serde_json::to_string_pretty(&output.descriptor).context("序列化风格描述失败")?;
    std::fs::write(&descriptor_path, descriptor_json)
        .with_context(|| format!("写入风格描述失败: {}", descriptor_path.display()))?;
    written.push(descriptor_path);

    let prompt_path = output_dir.join("prompt.txt");
    std::fs::write(&prompt_path, output.prompt.as_str())
        .with_context(|| format!("写入提示词失败: {}", prompt_path.display()))?;
    written.push(prompt_path);

    info!(
        "📁 [分析] 已保存 {} 个文件到 {}",
        written.len(),
        output_dir.display()
    );
    Ok(written)
}
