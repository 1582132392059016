use serde::Serialize;
use std::fmt;

use crate::descriptor::StyleDescriptor;

/// Lighting 段落中最多嵌入的视觉分析字符数
pub const LIGHTING_INSIGHT_LIMIT: usize = 300;

/// 结尾的生成工具指令，原样透传
pub const PROMPT_DIRECTIVES: &str = "--sora-recon-v4 --broadcast-mode";

pub const VISION_BLOCK_HEADER: &str = "Detailed Vision Analysis:";

const INSIGHT_LABEL: &str = "[AI VISION INSIGHT]";

/// 最终生成的提示词，只能整体重建
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ComposedPrompt(String);

impl ComposedPrompt {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ComposedPrompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 按 Camera → Stability → Subject → Motion → Environment → Lighting 顺序生成提示词
pub fn compose(descriptor: &StyleDescriptor) -> ComposedPrompt {
    let vision = descriptor
        .style
        .vision_text
        .as_deref()
        .filter(|t| !t.is_empty());

    let sections = [
        camera_section(descriptor, vision.is_some()),
        stability_section(descriptor),
        subject_section(descriptor),
        motion_section(descriptor),
        environment_section(descriptor),
        lighting_section(descriptor, vision),
    ];

    let mut prompt = sections.join(" ");
    if let Some(text) = vision {
        prompt.push_str("\n\n");
        prompt.push_str(VISION_BLOCK_HEADER);
        prompt.push('\n');
        prompt.push_str(INSIGHT_LABEL);
        prompt.push(' ');
        prompt.push_str(text);
        prompt.push('\n');
    }
    prompt.push(' ');
    prompt.push_str(PROMPT_DIRECTIVES);

    ComposedPrompt(prompt)
}

fn camera_section(d: &StyleDescriptor, refined: bool) -> String {
    let mut section = format!(
        "[CAMERA] {}, {}, {}. Captured with a high-end TV broadcast camera lens with natural telephoto compression.",
        d.camera.angle, d.camera.size, d.camera.movement
    );
    if refined {
        section.push_str(" Refining based on visual lens analysis.");
    }
    section
}

fn stability_section(d: &StyleDescriptor) -> String {
    format!(
        "[STABILITY] The camera is {}, exhibiting standard professional broadcast stability.",
        d.camera.stability
    )
}

fn subject_section(d: &StyleDescriptor) -> String {
    let opening = d
        .segments
        .first()
        .map(|s| format!(" At the beginning, at normal speed: {}", s.description))
        .unwrap_or_default();
    format!(
        "[SUBJECT] {} subjects ({}), positioned {}, framed as {}.{} {}. {}.",
        d.subjects.count,
        d.subjects.role,
        d.subjects.position.to_lowercase(),
        d.subjects.scale.to_lowercase(),
        opening,
        d.subjects.motion,
        d.style.texture
    )
}

/// 慢动作速度取自 Emphasis 片段，而不是固定下标
fn motion_section(d: &StyleDescriptor) -> String {
    let opening = "[MOTION] The video starts at normal playback speed (1.0x) with fast-paced action and natural motion blur.";
    match d.emphasis_segment() {
        Some(emphasis) => format!(
            "{} Then, the scene clearly transitions into {} at {:.1}s ({}), creating a dramatic but realistic temporal shift. {}.",
            opening,
            emphasis.speed,
            emphasis.start,
            emphasis.description.trim_end_matches('.'),
            d.motion.magnitude
        ),
        None => format!(
            "{} The playback speed stays constant throughout. {}.",
            opening, d.motion.magnitude
        ),
    }
}

fn environment_section(d: &StyleDescriptor) -> String {
    format!(
        "[ENVIRONMENT] Set in a {}. The background shows {}, with {}, characteristic of professional sports coverage.",
        d.environment.kind,
        d.environment.background_motion.to_lowercase(),
        d.environment.depth_of_field.to_lowercase()
    )
}

fn lighting_section(d: &StyleDescriptor, vision: Option<&str>) -> String {
    let insight = vision
        .map(|text| format!(" {} {}...", INSIGHT_LABEL, truncate_chars(text, LIGHTING_INSIGHT_LIMIT)))
        .unwrap_or_default();
    format!(
        "[LIGHTING & STYLE] {}, {}, {}. Overall visual is a 4k TV broadcast footage, featuring natural film grain, subtle sensor noise, and realistic color grading ({}).{} No digital rendering or 3D-game artifacts. Authentic broadcast realism.",
        d.lighting.source,
        d.lighting.direction,
        d.lighting.contrast.to_lowercase(),
        d.style.saturation,
        insight
    )
}

/// 按字符（而非字节）截断
fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}
