pub mod media;
pub mod sampler;
pub mod descriptor;
pub mod analyzer;
pub mod vision;
pub mod composer;
pub mod credentials;
pub mod pipeline;
pub mod handler;
pub mod config;

pub use media::{FfmpegSource, FrameSource, MediaInfo};
pub use sampler::{FrameSampler, SampleError, SampleProgress, SampledFrame, SamplerOptions};
pub use descriptor::{Segment, SegmentKind, StyleDescriptor};
pub use analyzer::{Analyzer, ConstantDemoAnalyzer};
pub use vision::{GeminiBackend, VisionAugmenter, VisionBackend, VisionError};
pub use composer::{compose, ComposedPrompt};
pub use credentials::{CredentialStore, IniCredentialStore, MemoryCredentialStore};
pub use pipeline::{analyze_video, resolve_api_key, save_outputs, AnalysisOutput, AnalysisReport, Pipeline};
pub use config::{AnalysisConfig, ConfigLoader, ConfigOverrides, ExtendedConfig};
