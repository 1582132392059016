use serde::{Deserialize, Serialize};

/// 片段在叙事中的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentKind {
    Setup,
    Emphasis,
    Resolution,
}

impl SegmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentKind::Setup => "Setup",
            SegmentKind::Emphasis => "Emphasis",
            SegmentKind::Resolution => "Resolution",
        }
    }
}

/// 单个片段：一段带有叙事角色和播放速度指令的时间区间
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// 片段类型
    pub kind: SegmentKind,
    /// 开始时间（秒）
    pub start: f64,
    /// 结束时间（秒）
    pub end: f64,
    /// 播放速度描述，例如 "0.35x (Intense Slow Motion)"
    pub speed: String,
    /// 转场方式
    pub transition: String,
    /// 片段内容描述
    pub description: String,
}

/// 视频基础信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorMeta {
    /// 视频总时长（秒）
    pub duration: f64,
    /// 视频帧率
    pub fps: f64,
    /// 视频分辨率（宽x高）
    pub resolution: String,
    /// 画面比例，例如 "16:9"
    pub aspect_ratio: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraParams {
    pub angle: String,
    pub size: String,
    pub movement: String,
    pub stability: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionParams {
    pub magnitude: String,
    pub consistency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectParams {
    pub count: u32,
    pub role: String,
    pub position: String,
    pub scale: String,
    pub motion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentParams {
    pub kind: String,
    pub background_motion: String,
    pub depth_of_field: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightingParams {
    pub source: String,
    pub direction: String,
    pub contrast: String,
    pub stability: String,
}

/// 画面风格，`vision_text` 由视觉模型补充
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleParams {
    pub saturation: String,
    pub texture: String,
    pub artifacts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_text: Option<String>,
}

/// 整个视频的风格描述
///
/// 构建完成后只有 `style.vision_text` 会被写入，并且只写一次。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleDescriptor {
    pub meta: DescriptorMeta,
    /// 片段列表，按开始时间非递减排列
    pub segments: Vec<Segment>,
    pub camera: CameraParams,
    pub motion: MotionParams,
    pub subjects: SubjectParams,
    pub environment: EnvironmentParams,
    pub lighting: LightingParams,
    pub style: StyleParams,
}

impl StyleDescriptor {
    /// 第一个 Emphasis 片段（慢动作段）
    pub fn emphasis_segment(&self) -> Option<&Segment> {
        self.segments
            .iter()
            .find(|s| s.kind == SegmentKind::Emphasis)
    }

    pub fn is_augmented(&self) -> bool {
        self.style.vision_text.is_some()
    }

    /// 返回写入视觉分析文本后的副本；已经写入过则返回 `None`
    pub fn with_vision_text(&self, text: impl Into<String>) -> Option<Self> {
        if self.is_augmented() {
            return None;
        }
        let mut augmented = self.clone();
        augmented.style.vision_text = Some(text.into());
        Some(augmented)
    }
}
