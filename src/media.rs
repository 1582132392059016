use ffmpeg_next as ffmpeg;
use image::DynamicImage;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// 视频基础信息
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    /// 时长（秒）
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// 可以按时间点取帧的媒体源
///
/// `capture_at` 会阻塞直到取到画面，采样器在阻塞线程池上调用它。
pub trait FrameSource: Send + 'static {
    fn info(&self) -> &MediaInfo;

    /// 跳转到 `timestamp`（秒）并返回当时显示的画面
    fn capture_at(&mut self, timestamp: f64) -> Result<DynamicImage>;
}

/// 每次 seek 后最多读取的数据包数量，避免损坏文件导致无限读取
const MAX_PACKETS_PER_SEEK: usize = 500;

/// 基于 FFmpeg 的媒体源
pub struct FfmpegSource {
    input_path: PathBuf,
    info: MediaInfo,
}

impl FfmpegSource {
    /// 打开视频文件并读取基础信息
    pub fn open(input_path: impl AsRef<Path>) -> Result<Self> {
        ffmpeg::init().context("初始化 FFmpeg 失败")?;

        // 只输出 FFmpeg 的错误日志
        unsafe {
            ffmpeg::sys::av_log_set_level(ffmpeg::sys::AV_LOG_ERROR as i32);
        }

        let input_path = input_path.as_ref().to_path_buf();
        let info = Self::probe(&input_path)?;
        debug!(
            "🎞️  [媒体] {} | {:.2}s | {}x{} | {:.2} fps",
            input_path.display(),
            info.duration,
            info.width,
            info.height,
            info.fps
        );

        Ok(Self { input_path, info })
    }

    fn probe(input_path: &Path) -> Result<MediaInfo> {
        let ictx = ffmpeg::format::input(&input_path).context("无法打开视频文件")?;

        let video_stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .context("未找到视频流")?;

        let decoder_context =
            ffmpeg::codec::context::Context::from_parameters(video_stream.parameters())
                .context("无法创建解码器上下文")?;

        let decoder = decoder_context
            .decoder()
            .video()
            .context("无法创建视频解码器")?;

        let fps = video_stream.avg_frame_rate();
        let fps_value = if fps.denominator() > 0 && fps.numerator() > 0 {
            fps.numerator() as f64 / fps.denominator() as f64
        } else {
            30.0
        };

        // 容器时长缺失时退回到视频流时长
        let mut duration = ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64;
        if duration <= 0.0 {
            let time_base = video_stream.time_base();
            duration = video_stream.duration() as f64 * time_base.numerator() as f64
                / time_base.denominator().max(1) as f64;
        }

        Ok(MediaInfo {
            duration: duration.max(0.0),
            width: decoder.width(),
            height: decoder.height(),
            fps: fps_value,
        })
    }

    /// 将 RGB24 帧转换为 DynamicImage
    fn frame_to_image(frame: &ffmpeg::frame::Video) -> DynamicImage {
        let width = frame.width();
        let height = frame.height();
        let stride = frame.stride(0);
        let data = frame.data(0);

        // 每行末尾可能有对齐填充，逐行拷贝
        let mut img_buf = image::RgbImage::new(width, height);
        for y in 0..height as usize {
            let row_start = y * stride;
            let row_end = row_start + width as usize * 3;
            if row_end > data.len() {
                break;
            }
            for (x, px) in data[row_start..row_end].chunks_exact(3).enumerate() {
                img_buf.put_pixel(x as u32, y as u32, image::Rgb([px[0], px[1], px[2]]));
            }
        }

        DynamicImage::ImageRgb8(img_buf)
    }

    fn convert(
        scaler: &mut ffmpeg::software::scaling::Context,
        frame: &ffmpeg::frame::Video,
    ) -> Result<DynamicImage> {
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        scaler.run(frame, &mut rgb_frame).context("帧格式转换失败")?;
        Ok(Self::frame_to_image(&rgb_frame))
    }
}

impl FrameSource for FfmpegSource {
    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn capture_at(&mut self, timestamp: f64) -> Result<DynamicImage> {
        let mut ictx = ffmpeg::format::input(&self.input_path).context("无法打开视频文件")?;

        let (video_stream_index, time_base, stream_start, parameters) = {
            let stream = ictx
                .streams()
                .best(ffmpeg::media::Type::Video)
                .context("未找到视频流")?;
            (
                stream.index(),
                stream.time_base(),
                stream.start_time(),
                stream.parameters(),
            )
        };
        // 容器起始时间（AV_TIME_BASE 单位），MPEG-TS 等格式通常不为 0
        let container_start = unsafe { (*ictx.as_ptr()).start_time };

        let mut decoder = ffmpeg::codec::context::Context::from_parameters(parameters)
            .context("无法创建解码器上下文")?
            .decoder()
            .video()
            .context("无法创建视频解码器")?;

        let mut scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .context("无法创建缩放器")?;

        // 向后 seek 到最近的关键帧，再解码到目标时间
        let av_timestamp = seek_target(timestamp, container_start);
        unsafe {
            let ret = ffmpeg::sys::av_seek_frame(
                ictx.as_mut_ptr(),
                -1,
                av_timestamp,
                ffmpeg::sys::AVSEEK_FLAG_BACKWARD as i32,
            );
            if ret < 0 {
                anyhow::bail!("seek 失败: {:.3}s (错误码 {})", timestamp, ret);
            }
        }

        // 允许半帧误差
        let tolerance = 0.5 / self.info.fps.max(1.0);
        let frame_time = |decoded: &ffmpeg::frame::Video| {
            decoded
                .timestamp()
                .map(|pts| {
                    pts_to_seconds(pts, stream_start, time_base.numerator(), time_base.denominator())
                })
                .unwrap_or(0.0)
        };

        let mut decoded = ffmpeg::frame::Video::empty();
        let mut last_frame: Option<(f64, ffmpeg::frame::Video)> = None;
        let mut packets_read = 0;
        let mut scan_end = ScanEnd::EndOfStream;

        for (stream, packet) in ictx.packets() {
            if stream.index() != video_stream_index {
                continue;
            }

            packets_read += 1;
            if packets_read > MAX_PACKETS_PER_SEEK {
                scan_end = ScanEnd::PacketLimit;
                break;
            }

            if decoder.send_packet(&packet).is_err() {
                continue;
            }

            while decoder.receive_frame(&mut decoded).is_ok() {
                let time = frame_time(&decoded);
                if reaches_target(time, timestamp, tolerance) {
                    return Self::convert(&mut scaler, &decoded);
                }
                last_frame = Some((time, decoded.clone()));
            }
        }

        // 冲刷解码器中缓存的帧
        if decoder.send_eof().is_ok() {
            while decoder.receive_frame(&mut decoded).is_ok() {
                let time = frame_time(&decoded);
                if reaches_target(time, timestamp, tolerance) {
                    return Self::convert(&mut scaler, &decoded);
                }
                last_frame = Some((time, decoded.clone()));
            }
        }

        // 只有真正读到文件末尾时才退回到最后一帧
        accept_fallback(scan_end, last_frame.as_ref().map(|(time, _)| *time), timestamp)?;
        let (_, frame) = last_frame
            .with_context(|| format!("{:.3}s 附近没有可解码的视频帧", timestamp))?;
        Self::convert(&mut scaler, &frame)
    }
}

/// 解码循环结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanEnd {
    /// 读到文件末尾
    EndOfStream,
    /// 达到数据包上限，目标时间之后可能还有帧
    PacketLimit,
}

/// 起始时间缺失时视为 0
fn known_start(start: i64) -> i64 {
    if start == ffmpeg::ffi::AV_NOPTS_VALUE {
        0
    } else {
        start
    }
}

/// 相对时间（秒）换算为 av_seek_frame 使用的绝对时间（AV_TIME_BASE 单位）
fn seek_target(timestamp: f64, container_start: i64) -> i64 {
    (timestamp * ffmpeg::ffi::AV_TIME_BASE as f64) as i64 + known_start(container_start)
}

/// 帧 pts 换算为相对于视频流起点的秒数
fn pts_to_seconds(pts: i64, stream_start: i64, numerator: i32, denominator: i32) -> f64 {
    (pts - known_start(stream_start)) as f64 * numerator as f64 / denominator.max(1) as f64
}

fn reaches_target(frame_time: f64, timestamp: f64, tolerance: f64) -> bool {
    frame_time + tolerance >= timestamp
}

/// 没有帧到达目标时间时，判断能否使用最后解出的一帧
fn accept_fallback(end: ScanEnd, last_frame_time: Option<f64>, timestamp: f64) -> Result<()> {
    match (end, last_frame_time) {
        (_, None) => anyhow::bail!("{:.3}s 附近没有可解码的视频帧", timestamp),
        (ScanEnd::PacketLimit, Some(last)) => anyhow::bail!(
            "读取 {} 个数据包后仍未到达 {:.3}s（最后一帧 {:.3}s）",
            MAX_PACKETS_PER_SEEK,
            timestamp,
            last
        ),
        (ScanEnd::EndOfStream, Some(_)) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_file_fails() {
        let result = FfmpegSource::open("/nonexistent/clip.mp4");
        assert!(result.is_err());
    }

    #[test]
    fn test_packet_limit_does_not_fall_back() {
        // 长 GOP：读满上限时最后一帧仍在目标之前
        let err = accept_fallback(ScanEnd::PacketLimit, Some(8.33), 9.5).unwrap_err();
        assert!(err.to_string().contains("9.500"));

        assert!(accept_fallback(ScanEnd::EndOfStream, Some(8.33), 9.5).is_ok());
        assert!(accept_fallback(ScanEnd::EndOfStream, None, 9.5).is_err());
        assert!(accept_fallback(ScanEnd::PacketLimit, None, 9.5).is_err());
    }

    #[test]
    fn test_reaches_target_with_half_frame_tolerance() {
        let tolerance = 0.5 / 60.0;
        assert!(reaches_target(9.5, 9.5, tolerance));
        assert!(reaches_target(9.49, 9.5, tolerance));
        assert!(!reaches_target(8.33, 9.5, tolerance));
    }

    #[test]
    fn test_nonzero_start_time_offsets() {
        let nopts = ffmpeg::ffi::AV_NOPTS_VALUE;
        let base = ffmpeg::ffi::AV_TIME_BASE as i64;

        // 容器从 1.4s 开始：相对 0s 的目标对应绝对 1.4s
        assert_eq!(seek_target(0.0, 1_400_000), 1_400_000);
        assert_eq!(seek_target(2.0, 1_400_000), 2 * base + 1_400_000);
        assert_eq!(seek_target(2.0, nopts), 2 * base);

        // 90kHz 时间基，流起点 126000 (1.4s)
        assert_eq!(pts_to_seconds(126_000, 126_000, 1, 90_000), 0.0);
        assert_eq!(pts_to_seconds(306_000, 126_000, 1, 90_000), 2.0);
        assert_eq!(pts_to_seconds(180_000, nopts, 1, 90_000), 2.0);
    }
}
