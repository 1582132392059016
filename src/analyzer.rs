use crate::descriptor::{
    CameraParams, DescriptorMeta, EnvironmentParams, LightingParams, MotionParams, Segment,
    SegmentKind, StyleDescriptor, StyleParams, SubjectParams,
};
use crate::media::MediaInfo;

/// 风格分析器：由视频元数据生成风格描述
pub trait Analyzer: Send + Sync {
    fn analyze(&self, info: &MediaInfo) -> StyleDescriptor;
}

/// 演示用分析器
///
/// 不做任何画面推理，返回固定的"足球运动员 + 闯入的猫"场景。
/// 只有时长、帧率、分辨率和画面比例来自真实视频。
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantDemoAnalyzer;

/// Emphasis 段的开始时间（秒）
const EMPHASIS_START: f64 = 3.2;
/// Resolution 段的开始时间（秒）
const RESOLUTION_START: f64 = 6.5;

impl Analyzer for ConstantDemoAnalyzer {
    fn analyze(&self, info: &MediaInfo) -> StyleDescriptor {
        let segments = vec![
            Segment {
                kind: SegmentKind::Setup,
                start: 0.0,
                end: EMPHASIS_START,
                speed: "1.0x".to_string(),
                transition: "None".to_string(),
                description: "A soccer player kicks the ball towards an open goal.".to_string(),
            },
            Segment {
                kind: SegmentKind::Emphasis,
                start: EMPHASIS_START,
                end: RESOLUTION_START,
                speed: "0.35x (Intense Slow Motion)".to_string(),
                transition: "Hard cut".to_string(),
                description:
                    "A cat suddenly appears and deflects the ball away from the goal line."
                        .to_string(),
            },
            Segment {
                kind: SegmentKind::Resolution,
                start: RESOLUTION_START,
                // 保留一位小数
                end: (info.duration * 10.0).round() / 10.0,
                speed: "1.0x".to_string(),
                transition: "Cross-fade".to_string(),
                description: "The ball rolls away, and the goal is missed.".to_string(),
            },
        ];

        StyleDescriptor {
            meta: DescriptorMeta {
                duration: (info.duration * 100.0).round() / 100.0,
                fps: info.fps,
                resolution: format!("{}x{}", info.width, info.height),
                aspect_ratio: aspect_ratio(info.width, info.height),
            },
            segments,
            camera: CameraParams {
                angle: "Low-angle Tracking".to_string(),
                size: "Medium to Wide".to_string(),
                movement: "Tracking the ball's trajectory".to_string(),
                stability: "Professional Cinematography (Stable)".to_string(),
            },
            motion: MotionParams {
                magnitude: "High Contrast (Fast to Slow)".to_string(),
                consistency: "Narrative-driven optical flow".to_string(),
            },
            subjects: SubjectParams {
                count: 2,
                role: "Primary: Soccer player, Secondary: Suddenly appearing cat".to_string(),
                position: "Center field to goal mouth".to_string(),
                scale: "Mid-shot showing full action".to_string(),
                motion: "Sudden direction change by external intervention".to_string(),
            },
            environment: EnvironmentParams {
                kind: "Sunny Soccer Stadium".to_string(),
                background_motion: "Cheering crowd (blurred)".to_string(),
                depth_of_field: "Dynamic telephoto depth-of-field".to_string(),
            },
            lighting: LightingParams {
                source: "Natural Sunlight".to_string(),
                direction: "Top-down / High-noon".to_string(),
                contrast: "High contrast".to_string(),
                stability: "Consistent".to_string(),
            },
            style: StyleParams {
                saturation: "Vibrant / Realistic Broadcast".to_string(),
                texture: "Hyper-realistic grass and feline fur with natural sensor grain"
                    .to_string(),
                artifacts: "Natural motion blur, no digital aliasing".to_string(),
                vision_text: None,
            },
        }
    }
}

/// 约分后的画面比例，宽或高为 0 时返回 "unknown"
fn aspect_ratio(width: u32, height: u32) -> String {
    if width == 0 || height == 0 {
        return "unknown".to_string();
    }
    let divisor = gcd(width, height);
    format!("{}:{}", width / divisor, height / divisor)
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}
