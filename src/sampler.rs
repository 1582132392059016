use base64::{engine::general_purpose::STANDARD, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::media::FrameSource;

/// JPEG 编码质量
pub const JPEG_QUALITY: u8 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Jpeg,
}

impl FrameFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            FrameFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FrameFormat::Jpeg => "jpg",
        }
    }
}

/// 采样得到的一帧（已编码）
#[derive(Debug, Clone, PartialEq)]
pub struct SampledFrame {
    /// 在采样序列中的序号
    pub index: usize,
    /// 来源时间点（秒）
    pub timestamp: f64,
    pub format: FrameFormat,
    pub data: Vec<u8>,
}

impl SampledFrame {
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.data)
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.format.mime_type(), self.to_base64())
    }
}

/// 每取到一帧发布一次的进度事件
#[derive(Debug, Clone)]
pub struct SampleProgress {
    /// 已完成帧数（1..=total）
    pub completed: usize,
    pub total: usize,
    pub frame: SampledFrame,
}

impl SampleProgress {
    pub fn fraction(&self) -> f64 {
        self.completed as f64 / self.total as f64
    }
}

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("采样帧数必须至少为 1")]
    InvalidCount,
    #[error("视频时长无效: {0}")]
    InvalidDuration(f64),
    #[error("seek 超时: {timestamp:.3}s 在 {timeout:?} 内没有返回画面")]
    SeekStalled { timestamp: f64, timeout: Duration },
    #[error("取帧失败: {timestamp:.3}s")]
    Capture {
        timestamp: f64,
        #[source]
        source: anyhow::Error,
    },
    #[error("JPEG 编码失败")]
    Encode(#[from] image::ImageError),
    #[error("采样已取消")]
    Cancelled,
    #[error("取帧任务异常退出")]
    Task(#[from] tokio::task::JoinError),
}

/// 采样参数
#[derive(Debug, Clone)]
pub struct SamplerOptions {
    /// 每次取帧的超时
    pub seek_timeout: Duration,
    /// 每帧之后的停顿，仅用于让进度显示可见
    pub pacing: Duration,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            seek_timeout: Duration::from_secs(10),
            pacing: Duration::ZERO,
        }
    }
}

/// 等间隔采样器
pub struct FrameSampler {
    options: SamplerOptions,
    progress: Option<UnboundedSender<SampleProgress>>,
    cancel: CancellationToken,
}

impl FrameSampler {
    pub fn new(options: SamplerOptions) -> Self {
        Self {
            options,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    /// 每取到一帧就向 `tx` 发送一个进度事件
    pub fn with_progress(mut self, tx: UnboundedSender<SampleProgress>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 采样时间点：`i * duration / count`，i ∈ [0, count)
    pub fn timestamps(duration: f64, count: usize) -> Result<Vec<f64>, SampleError> {
        if count == 0 {
            return Err(SampleError::InvalidCount);
        }
        if !duration.is_finite() || duration <= 0.0 {
            return Err(SampleError::InvalidDuration(duration));
        }
        let interval = duration / count as f64;
        Ok((0..count).map(|i| i as f64 * interval).collect())
    }

    /// 依次 seek 到每个时间点并取帧
    ///
    /// 严格顺序执行：上一帧的取帧、进度发布和停顿全部完成后才发起下一次 seek。
    pub async fn sample<S: FrameSource>(
        &self,
        source: S,
        count: usize,
    ) -> Result<Vec<SampledFrame>, SampleError> {
        let timestamps = Self::timestamps(source.info().duration, count)?;

        let extract_start = Instant::now();
        info!(
            "⏳ [采样] 开始采样 {} 帧，间隔 {:.3}秒",
            count,
            source.info().duration / count as f64
        );

        let mut source = Some(source);
        let mut frames = Vec::with_capacity(count);

        for (index, timestamp) in timestamps.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(SampleError::Cancelled);
            }

            let Some(mut current) = source.take() else {
                break;
            };
            let capture = tokio::task::spawn_blocking(move || {
                let result = current.capture_at(timestamp);
                (current, result)
            });

            let (returned, captured) = tokio::select! {
                _ = self.cancel.cancelled() => return Err(SampleError::Cancelled),
                joined = tokio::time::timeout(self.options.seek_timeout, capture) => match joined {
                    Ok(joined) => joined?,
                    Err(_) => {
                        return Err(SampleError::SeekStalled {
                            timestamp,
                            timeout: self.options.seek_timeout,
                        })
                    }
                },
            };
            source = Some(returned);

            let image = captured.map_err(|err| SampleError::Capture {
                timestamp,
                source: err,
            })?;
            let frame = SampledFrame {
                index,
                timestamp,
                format: FrameFormat::Jpeg,
                data: encode_jpeg(&image)?,
            };
            debug!(
                "📸 [采样] 第 {} 帧 @ {:.3}s ({} 字节)",
                index + 1,
                timestamp,
                frame.data.len()
            );

            if let Some(tx) = &self.progress {
                // 观察者已经退出时不影响采样
                let _ = tx.send(SampleProgress {
                    completed: index + 1,
                    total: count,
                    frame: frame.clone(),
                });
            }
            frames.push(frame);

            if !self.options.pacing.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(SampleError::Cancelled),
                    _ = tokio::time::sleep(self.options.pacing) => {}
                }
            }
        }

        let elapsed = extract_start.elapsed();
        info!(
            "✅ [采样] 采样完成，共 {} 帧，耗时: {:.2}秒",
            frames.len(),
            elapsed.as_secs_f64()
        );

        Ok(frames)
    }
}

/// 编码为 JPEG（质量 80）
pub fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let rgb = image.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        image::ColorType::Rgb8,
    )?;
    Ok(buf)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::media::MediaInfo;
    use image::{ImageBuffer, Rgb};
    use std::sync::{Arc, Mutex};

    /// 生成纯色画面的假媒体源，记录每次 seek 的时间点
    pub(crate) struct FakeSource {
        pub info: MediaInfo,
        pub seeks: Arc<Mutex<Vec<f64>>>,
        pub stall_at: Option<usize>,
        /// 与进度事件共用的操作日志
        pub log: Option<Arc<Mutex<Vec<String>>>>,
    }

    impl FakeSource {
        pub(crate) fn new(duration: f64) -> Self {
            Self {
                info: MediaInfo {
                    duration,
                    width: 32,
                    height: 18,
                    fps: 30.0,
                },
                seeks: Arc::new(Mutex::new(Vec::new())),
                stall_at: None,
                log: None,
            }
        }
    }

    impl FrameSource for FakeSource {
        fn info(&self) -> &MediaInfo {
            &self.info
        }

        fn capture_at(&mut self, timestamp: f64) -> anyhow::Result<DynamicImage> {
            let mut seeks = self.seeks.lock().unwrap();
            if self.stall_at == Some(seeks.len()) {
                drop(seeks);
                std::thread::sleep(Duration::from_millis(500));
                anyhow::bail!("stalled");
            }
            if let Some(log) = &self.log {
                log.lock().unwrap().push(format!("seek {}", seeks.len()));
            }
            seeks.push(timestamp);
            let shade = (timestamp * 10.0) as u8;
            Ok(DynamicImage::ImageRgb8(ImageBuffer::from_pixel(
                self.info.width,
                self.info.height,
                Rgb([shade, 128, 255 - shade]),
            )))
        }
    }

    #[test]
    fn test_timestamps_evenly_spaced() {
        let ts = FrameSampler::timestamps(9.0, 12).unwrap();
        assert_eq!(ts.len(), 12);
        assert_eq!(ts[0], 0.0);
        assert_eq!(ts[1], 0.75);
        assert_eq!(ts[11], 8.25);
        assert!(ts.windows(2).all(|w| w[0] < w[1]));

        for count in 1..40 {
            let duration = 3.7;
            let ts = FrameSampler::timestamps(duration, count).unwrap();
            assert_eq!(ts.len(), count);
            assert!(ts.windows(2).all(|w| w[0] < w[1]));
            assert!(ts.iter().all(|t| *t < duration));
        }
    }

    #[test]
    fn test_timestamps_reject_degenerate_input() {
        assert!(matches!(
            FrameSampler::timestamps(9.0, 0),
            Err(SampleError::InvalidCount)
        ));
        assert!(matches!(
            FrameSampler::timestamps(0.0, 12),
            Err(SampleError::InvalidDuration(_))
        ));
        assert!(matches!(
            FrameSampler::timestamps(f64::NAN, 12),
            Err(SampleError::InvalidDuration(_))
        ));
    }

    #[tokio::test]
    async fn test_sample_captures_in_order() {
        let source = FakeSource::new(9.0);
        let seeks = source.seeks.clone();

        let frames = FrameSampler::new(SamplerOptions::default())
            .sample(source, 12)
            .await
            .unwrap();

        assert_eq!(frames.len(), 12);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.index, i);
            assert_eq!(frame.timestamp, i as f64 * 0.75);
            // JPEG SOI 标记
            assert_eq!(&frame.data[..2], &[0xFF, 0xD8]);
        }
        assert_eq!(*seeks.lock().unwrap(), FrameSampler::timestamps(9.0, 12).unwrap());
    }

    #[tokio::test]
    async fn test_progress_events_one_per_frame() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let frames = FrameSampler::new(SamplerOptions::default())
            .with_progress(tx)
            .sample(FakeSource::new(2.0), 4)
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        assert_eq!(events.len(), 4);
        assert_eq!(
            events.iter().map(|e| e.completed).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert_eq!(events[3].fraction(), 1.0);
        assert_eq!(events[2].frame, frames[2]);
    }

    #[tokio::test]
    async fn test_stalled_seek_times_out() {
        let mut source = FakeSource::new(4.0);
        source.stall_at = Some(1);

        let err = FrameSampler::new(SamplerOptions {
            seek_timeout: Duration::from_millis(50),
            pacing: Duration::ZERO,
        })
        .sample(source, 4)
        .await
        .unwrap_err();

        assert!(matches!(err, SampleError::SeekStalled { timestamp, .. } if timestamp == 1.0));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = FrameSampler::new(SamplerOptions::default())
            .with_cancellation(cancel)
            .sample(FakeSource::new(4.0), 4)
            .await
            .unwrap_err();

        assert!(matches!(err, SampleError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_delays_next_seek() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut source = FakeSource::new(4.0);
        source.log = Some(log.clone());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<SampleProgress>();
        let progress_log = log.clone();
        let observer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                progress_log
                    .lock()
                    .unwrap()
                    .push(format!("progress {}", event.completed));
            }
        });

        let start = tokio::time::Instant::now();
        let frames = FrameSampler::new(SamplerOptions {
            seek_timeout: Duration::from_secs(60),
            pacing: Duration::from_millis(300),
        })
        .with_progress(tx)
        .sample(source, 4)
        .await
        .unwrap();
        observer.await.unwrap();

        assert_eq!(frames.len(), 4);
        assert!(start.elapsed() >= Duration::from_millis(1200));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "seek 0", "progress 1", "seek 1", "progress 2",
                "seek 2", "progress 3", "seek 3", "progress 4",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_first_frame() {
        let source = FakeSource::new(4.0);
        let seeks = source.seeks.clone();
        let cancel = CancellationToken::new();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<SampleProgress>();
        let trigger = cancel.clone();
        let observer = tokio::spawn(async move {
            let mut received = 0;
            while rx.recv().await.is_some() {
                received += 1;
                trigger.cancel();
            }
            received
        });

        let err = FrameSampler::new(SamplerOptions {
            seek_timeout: Duration::from_secs(60),
            pacing: Duration::from_millis(300),
        })
        .with_progress(tx)
        .with_cancellation(cancel)
        .sample(source, 4)
        .await
        .unwrap_err();

        assert!(matches!(err, SampleError::Cancelled));
        assert_eq!(observer.await.unwrap(), 1);
        assert_eq!(*seeks.lock().unwrap(), vec![0.0]);
    }

    #[test]
    fn test_data_url_prefix() {
        let frame = SampledFrame {
            index: 0,
            timestamp: 0.0,
            format: FrameFormat::Jpeg,
            data: vec![1, 2, 3],
        };
        assert_eq!(frame.to_data_url(), "data:image/jpeg;base64,AQID");
    }
}
