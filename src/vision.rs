use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use crate::descriptor::StyleDescriptor;
use crate::sampler::SampledFrame;

/// 发送给视觉模型的分析指令
pub const VISION_INSTRUCTION: &str = "\
Analyze these video frames for a high-fidelity Sora video generation prompt.
Focus on achieving absolute broadcast realism and eliminating 'game-like' graphics.

Determine the following:
1. Precise Camera Settings: Lens type (e.g., 35mm, telephoto), f-stop feel.
2. Realistic Textures: Describe the grass, jersey fabric, and feline fur in terms of light interaction.
3. Visual Artifacts: Identify natural motion blur, sensor grain, and organic lens flare.
4. Lighting: Analyze the spectral quality of sunlight and shadows.

Return the results in a structured format that strictly emphasizes \"Authentic TV Broadcast Realism\".";

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("没有可发送的帧")]
    NoFrames,
    #[error("描述已经包含视觉分析结果")]
    AlreadyAugmented,
    #[error("视觉模型请求超时")]
    Timeout,
    #[error("视觉模型请求失败: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("认证失败 ({status}): {body}")]
    Unauthorized { status: u16, body: String },
    #[error("请求频率或配额超限: {0}")]
    RateLimited(String),
    #[error("视觉模型服务端错误 ({status}): {body}")]
    Server { status: u16, body: String },
    #[error("请求被拒绝 ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("响应格式错误: {0}")]
    Malformed(String),
    #[error("响应中没有文本")]
    EmptyResponse,
}

impl VisionError {
    /// 超时、网络错误、限流和 5xx 可以重试；认证和请求错误不可以
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VisionError::Timeout
                | VisionError::Transport(_)
                | VisionError::RateLimited(_)
                | VisionError::Server { .. }
        )
    }

    fn from_status(status: StatusCode, body: String) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => VisionError::Unauthorized {
                status: status.as_u16(),
                body,
            },
            StatusCode::TOO_MANY_REQUESTS => VisionError::RateLimited(body),
            s if s.is_server_error() => VisionError::Server {
                status: s.as_u16(),
                body,
            },
            s => VisionError::Rejected {
                status: s.as_u16(),
                body,
            },
        }
    }
}

/// 多模态推理服务
#[async_trait]
pub trait VisionBackend: Send + Sync {
    async fn describe(
        &self,
        instruction: &str,
        frames: &[&SampledFrame],
    ) -> Result<String, VisionError>;
}

/// Gemini generateContent 接口
pub struct GeminiBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
    timeout: Duration,
}

impl GeminiBackend {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn url(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.endpoint.trim_end_matches('/'),
            self.model
        )
    }
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text {
        text: &'a str,
    },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: &'static str,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

fn build_request<'a>(instruction: &'a str, frames: &[&SampledFrame]) -> GenerateContentRequest<'a> {
    let mut parts = vec![Part::Text { text: instruction }];
    parts.extend(frames.iter().map(|frame| Part::Inline {
        inline_data: InlineData {
            mime_type: frame.format.mime_type(),
            data: frame.to_base64(),
        },
    }));
    GenerateContentRequest {
        contents: vec![Content { parts }],
    }
}

/// 拼接第一个候选结果中的全部文本片段
fn extract_text(body: &str) -> Result<String, VisionError> {
    let response: GenerateContentResponse =
        serde_json::from_str(body).map_err(|e| VisionError::Malformed(e.to_string()))?;

    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(VisionError::EmptyResponse);
    }
    Ok(text)
}

#[async_trait]
impl VisionBackend for GeminiBackend {
    async fn describe(
        &self,
        instruction: &str,
        frames: &[&SampledFrame],
    ) -> Result<String, VisionError> {
        info!("🛰️  [视觉] 发送 {} 帧到 {}", frames.len(), self.model);

        let response = self
            .client
            .post(self.url())
            .header("x-goog-api-key", &self.api_key)
            .json(&build_request(instruction, frames))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    VisionError::Timeout
                } else {
                    VisionError::Transport(e)
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                VisionError::Timeout
            } else {
                VisionError::Transport(e)
            }
        })?;

        if !status.is_success() {
            return Err(VisionError::from_status(status, body));
        }

        extract_text(&body)
    }
}

/// 选取首帧、中间帧（len/2 向下取整）和末帧
///
/// 帧数不足 3 时允许重复，例如只有 1 帧时三者相同。
pub fn select_frames(frames: &[SampledFrame]) -> Option<[&SampledFrame; 3]> {
    let first = frames.first()?;
    let middle = &frames[frames.len() / 2];
    let last = frames.last()?;
    Some([first, middle, last])
}

/// 用视觉模型的描述补充风格字段
pub struct VisionAugmenter {
    backend: Box<dyn VisionBackend>,
}

impl VisionAugmenter {
    pub fn new(backend: impl VisionBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
        }
    }

    /// 失败时返回错误，不修改输入
    pub async fn try_augment(
        &self,
        frames: &[SampledFrame],
        descriptor: &StyleDescriptor,
    ) -> Result<StyleDescriptor, VisionError> {
        if descriptor.is_augmented() {
            return Err(VisionError::AlreadyAugmented);
        }
        let selected = select_frames(frames).ok_or(VisionError::NoFrames)?;

        let text = self.backend.describe(VISION_INSTRUCTION, &selected).await?;
        descriptor
            .with_vision_text(text)
            .ok_or(VisionError::AlreadyAugmented)
    }

    /// 失败时记录日志并原样返回描述，不重试
    pub async fn augment(
        &self,
        frames: &[SampledFrame],
        descriptor: StyleDescriptor,
    ) -> StyleDescriptor {
        let start = Instant::now();
        match self.try_augment(frames, &descriptor).await {
            Ok(augmented) => {
                info!(
                    "✅ [视觉] 视觉分析完成，耗时: {:.2}秒，返回 {} 字符",
                    start.elapsed().as_secs_f64(),
                    augmented
                        .style
                        .vision_text
                        .as_deref()
                        .map(|t| t.chars().count())
                        .unwrap_or(0)
                );
                augmented
            }
            Err(e) => {
                warn!(
                    "⚠️  [视觉] 视觉分析失败（{}），跳过: {}",
                    if e.is_transient() { "临时错误" } else { "永久错误" },
                    e
                );
                descriptor
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{Analyzer, ConstantDemoAnalyzer};
    use crate::media::MediaInfo;
    use crate::sampler::FrameFormat;
    use axum::http::StatusCode as HttpStatus;
    use std::sync::{Arc, Mutex};

    struct MockBackend {
        reply: Result<String, u16>,
        seen: Arc<Mutex<Vec<Vec<usize>>>>,
    }

    #[async_trait]
    impl VisionBackend for MockBackend {
        async fn describe(
            &self,
            instruction: &str,
            frames: &[&SampledFrame],
        ) -> Result<String, VisionError> {
            assert_eq!(instruction, VISION_INSTRUCTION);
            self.seen
                .lock()
                .unwrap()
                .push(frames.iter().map(|f| f.index).collect());
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(status) => Err(VisionError::from_status(
                    StatusCode::from_u16(*status).unwrap(),
                    "denied".to_string(),
                )),
            }
        }
    }

    fn frames(count: usize) -> Vec<SampledFrame> {
        (0..count)
            .map(|index| SampledFrame {
                index,
                timestamp: index as f64,
                format: FrameFormat::Jpeg,
                data: vec![index as u8],
            })
            .collect()
    }

    fn descriptor() -> StyleDescriptor {
        ConstantDemoAnalyzer.analyze(&MediaInfo {
            duration: 9.0,
            width: 1920,
            height: 1080,
            fps: 30.0,
        })
    }

    #[test]
    fn test_select_frames_first_middle_last() {
        let many = frames(12);
        let [a, b, c] = select_frames(&many).unwrap();
        assert_eq!((a.index, b.index, c.index), (0, 6, 11));

        let one = frames(1);
        let [a, b, c] = select_frames(&one).unwrap();
        assert!(a == b && b == c);

        let two = frames(2);
        let [a, b, c] = select_frames(&two).unwrap();
        assert_eq!((a.index, b.index, c.index), (0, 1, 1));

        assert!(select_frames(&[]).is_none());
    }

    #[tokio::test]
    async fn test_augment_sets_vision_text() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let augmenter = VisionAugmenter::new(MockBackend {
            reply: Ok("35mm telephoto, f/2.8".to_string()),
            seen: seen.clone(),
        });

        let base = descriptor();
        let augmented = augmenter.augment(&frames(12), base.clone()).await;

        assert_eq!(
            augmented.style.vision_text.as_deref(),
            Some("35mm telephoto, f/2.8")
        );
        assert_eq!(augmented.camera, base.camera);
        assert_eq!(augmented.segments, base.segments);
        assert_eq!(*seen.lock().unwrap(), vec![vec![0, 6, 11]]);
    }

    #[tokio::test]
    async fn test_failure_leaves_descriptor_unchanged() {
        let augmenter = VisionAugmenter::new(MockBackend {
            reply: Err(401),
            seen: Arc::new(Mutex::new(Vec::new())),
        });

        let base = descriptor();
        let err = augmenter.try_augment(&frames(3), &base).await.unwrap_err();
        assert!(matches!(err, VisionError::Unauthorized { status: 401, .. }));
        assert!(!err.is_transient());

        let result = augmenter.augment(&frames(3), base.clone()).await;
        assert_eq!(result, base);
    }

    #[tokio::test]
    async fn test_no_second_augmentation_pass() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let augmenter = VisionAugmenter::new(MockBackend {
            reply: Ok("second".to_string()),
            seen: seen.clone(),
        });

        let once = descriptor().with_vision_text("first").unwrap();
        let err = augmenter.try_augment(&frames(3), &once).await.unwrap_err();

        assert!(matches!(err, VisionError::AlreadyAugmented));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(
            augmenter.augment(&frames(3), once.clone()).await,
            once
        );
    }

    #[tokio::test]
    async fn test_empty_frames_rejected() {
        let augmenter = VisionAugmenter::new(MockBackend {
            reply: Ok("unused".to_string()),
            seen: Arc::new(Mutex::new(Vec::new())),
        });
        let err = augmenter.try_augment(&[], &descriptor()).await.unwrap_err();
        assert!(matches!(err, VisionError::NoFrames));
    }

    #[test]
    fn test_status_classification() {
        assert!(VisionError::from_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient());
        assert!(VisionError::from_status(StatusCode::BAD_GATEWAY, String::new()).is_transient());
        assert!(!VisionError::from_status(StatusCode::FORBIDDEN, String::new()).is_transient());
        assert!(matches!(
            VisionError::from_status(StatusCode::BAD_REQUEST, String::new()),
            VisionError::Rejected { status: 400, .. }
        ));
    }

    #[test]
    fn test_extract_text_joins_parts() {
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"Lens: "},{"text":"35mm"}]}}]}"#;
        assert_eq!(extract_text(body).unwrap(), "Lens: 35mm");

        assert!(matches!(
            extract_text(r#"{"candidates":[]}"#),
            Err(VisionError::EmptyResponse)
        ));
        assert!(matches!(
            extract_text("not json"),
            Err(VisionError::Malformed(_))
        ));
    }

    #[test]
    fn test_request_body_shape() {
        let frames = frames(3);
        let refs: Vec<&SampledFrame> = frames.iter().collect();
        let json = serde_json::to_value(build_request("describe", &refs)).unwrap();

        let parts = json["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0]["text"], "describe");
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(parts[2]["inlineData"]["data"], "AQ==");
    }

    /// 在本地端口上启动一个假的 generateContent 服务，返回 endpoint
    async fn serve_local(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/v1beta", addr)
    }

    async fn generate_content(
        uri: axum::http::Uri,
        headers: axum::http::HeaderMap,
        axum::Json(body): axum::Json<serde_json::Value>,
    ) -> (HttpStatus, String) {
        let key = headers
            .get("x-goog-api-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if key != "test-key" || uri.query().is_some() {
            return (HttpStatus::UNAUTHORIZED, "API key not valid".to_string());
        }
        let parts = body["contents"][0]["parts"].as_array().map(Vec::len).unwrap_or(0);
        (
            HttpStatus::OK,
            format!(
                r#"{{"candidates":[{{"content":{{"parts":[{{"text":"{} parts at {}"}}]}}}}]}}"#,
                parts,
                uri.path()
            ),
        )
    }

    #[tokio::test]
    async fn test_gemini_sends_key_header() {
        let endpoint = serve_local(axum::Router::new().fallback(generate_content)).await;
        let frames = frames(3);
        let refs: Vec<&SampledFrame> = frames.iter().collect();

        let text = GeminiBackend::new("test-key")
            .with_endpoint(&endpoint)
            .with_model("gemini-test")
            .describe("describe", &refs)
            .await
            .unwrap();
        assert_eq!(text, "4 parts at /v1beta/models/gemini-test:generateContent");

        let err = GeminiBackend::new("wrong-key")
            .with_endpoint(&endpoint)
            .describe("describe", &refs)
            .await
            .unwrap_err();
        assert!(matches!(err, VisionError::Unauthorized { status: 401, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_gemini_rate_limited() {
        let router = axum::Router::new().fallback(|| async {
            (HttpStatus::TOO_MANY_REQUESTS, "quota exceeded".to_string())
        });
        let endpoint = serve_local(router).await;
        let frames = frames(1);

        let err = GeminiBackend::new("test-key")
            .with_endpoint(&endpoint)
            .describe("describe", &[&frames[0]])
            .await
            .unwrap_err();
        assert!(matches!(&err, VisionError::RateLimited(body) if body == "quota exceeded"));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_gemini_timeout() {
        let router = axum::Router::new().fallback(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            "late"
        });
        let endpoint = serve_local(router).await;
        let frames = frames(1);

        let err = GeminiBackend::new("test-key")
            .with_endpoint(&endpoint)
            .with_timeout(Duration::from_millis(100))
            .describe("describe", &[&frames[0]])
            .await
            .unwrap_err();
        assert!(matches!(err, VisionError::Timeout));
        assert!(err.is_transient());
    }

    #[test]
    fn test_url_trims_trailing_slash() {
        let backend = GeminiBackend::new("key")
            .with_endpoint("http://localhost:8080/v1beta/")
            .with_model("gemini-test");
        assert_eq!(
            backend.url(),
            "http://localhost:8080/v1beta/models/gemini-test:generateContent"
        );
    }
}
