use clap::{Parser, Subcommand};
use anyhow::{Context, Result};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use style_recon::{
    analyze_video, resolve_api_key, save_outputs, ConfigLoader, ConfigOverrides, CredentialStore,
    IniCredentialStore, Pipeline, SampleProgress,
};

/// 风格逆向工具 - 从视频中采样帧、生成风格描述并重建视频生成提示词
#[derive(Parser, Debug)]
#[command(name = "style-recon")]
#[command(about = "风格逆向工具：采样视频帧、生成风格描述、重建生成提示词", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// CLI 模式：分析本地视频文件
    Analyze {
        /// 输入视频文件路径
        #[arg(short, long)]
        input: PathBuf,

        /// 输出目录（可选，保存帧、风格描述和提示词）
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// 配置文件路径（可选，支持 .ini 格式）
        /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
        #[arg(long)]
        config: Option<PathBuf>,

        /// 采样帧数
        /// 可通过环境变量 STYLE_RECON_FRAME_COUNT 或配置文件设置
        #[arg(short, long)]
        frames: Option<usize>,

        /// 每帧之后的停顿（毫秒）
        #[arg(long)]
        pacing_ms: Option<u64>,

        /// 启用视觉分析（需要 API Key）
        #[arg(long)]
        vision: bool,

        /// Gemini API Key（未提供时依次读取 GEMINI_API_KEY、配置文件、已保存的凭证）
        #[arg(long)]
        api_key: Option<String>,
    },
    /// Web 服务模式：启动 HTTP 服务器
    Serve {
        /// 监听地址（默认从环境变量 STYLE_RECON_PORT 读取端口，如果不存在则使用 127.0.0.1:9000）
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// 保存 Gemini API Key
    SetKey {
        api_key: String,
    },
    /// 生成默认配置文件
    InitConfig {
        #[arg(default_value = "style-recon.ini")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志（analyze 指定的配置文件中的 [logging] level 同样生效）
    let config_file = match &args.command {
        Commands::Analyze { config, .. } => config.clone(),
        _ => None,
    };
    init_logging(config_file.as_deref());

    match args.command {
        Commands::Analyze {
            input,
            output,
            config: config_file,
            frames,
            pacing_ms,
            vision,
            api_key,
        } => {
            let overrides = ConfigOverrides {
                frame_count: frames,
                pacing_ms,
                vision: vision.then_some(true),
                api_key,
            };
            let extended = ConfigLoader::load_extended_config(config_file.as_deref(), &overrides)
                .context("加载配置失败")?;
            let config = extended.analysis;

            println!(
                "使用配置: frames={}, pacing={}ms, seek_timeout={}s, vision={}",
                config.frame_count, config.pacing_ms, config.seek_timeout_secs, config.vision.enabled
            );

            let store = IniCredentialStore::default_location();
            let api_key = resolve_api_key(
                &config.vision,
                store.as_ref().map(|s| s as &dyn CredentialStore),
            );
            let pipeline = Pipeline::new(config, api_key);

            // Ctrl-C 取消采样
            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c.cancel();
                }
            });

            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            let printer = tokio::spawn(print_progress(rx));

            let result = analyze_video(&input, &pipeline, Some(tx), Some(cancel))
                .await
                .context("分析视频失败");
            printer.await.ok();
            let result = result?;

            println!();
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            println!("01. 风格描述");
            println!("   • Camera Angle: {}", result.descriptor.camera.angle);
            println!("   • Shot Size:    {}", result.descriptor.camera.size);
            println!("   • Movement:     {}", result.descriptor.camera.movement);
            println!("   • Stability:    {}", result.descriptor.camera.stability);
            println!("   • Light Source: {}", result.descriptor.lighting.source);
            println!("   • Contrast:     {}", result.descriptor.lighting.contrast);
            println!("   • Subject Scale: {}", result.descriptor.subjects.scale);
            println!("   • Texture:      {}", result.descriptor.style.texture);
            for (i, segment) in result.descriptor.segments.iter().enumerate() {
                println!(
                    "   • Scene {} | {:.1}s - {:.1}s | {} | {} | {}",
                    i + 1,
                    segment.start,
                    segment.end,
                    segment.kind.as_str(),
                    segment.speed,
                    segment.transition
                );
            }
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            println!("02. 提示词");
            println!("{}", result.prompt);

            if let Some(dir) = output.or(extended.output_path) {
                save_outputs(&result, &dir).context("保存结果失败")?;
                println!("📁 结果已保存到: {}", dir.display());
            }
        }
        Commands::Serve { bind } => {
            // 优先使用命令行参数，其次使用环境变量 STYLE_RECON_PORT，最后使用默认值 9000
            // 默认只监听本机，对外暴露需显式传入 --bind
            let bind_addr = bind.unwrap_or_else(|| {
                std::env::var("STYLE_RECON_PORT")
                    .map(|port| format!("127.0.0.1:{}", port))
                    .unwrap_or_else(|_| "127.0.0.1:9000".to_string())
            });
            start_web_server(&bind_addr).await?;
        }
        Commands::SetKey { api_key } => {
            let store = IniCredentialStore::default_location()
                .context("无法确定凭证文件位置（未设置 HOME）")?;
            store.set(&api_key)?;
            println!("API Key 已保存到: {}", store.path().display());
        }
        Commands::InitConfig { path } => {
            ConfigLoader::create_default_config(&path)?;
            println!("已生成配置文件: {}", path.display());
        }
    }

    Ok(())
}

fn init_logging(config_file: Option<&Path>) {
    let level = ConfigLoader::resolve_log_level(config_file);
    tracing_subscriber::fmt().with_max_level(level).init();
}

/// 根据进度事件绘制进度条
async fn print_progress(mut rx: tokio::sync::mpsc::UnboundedReceiver<SampleProgress>) {
    let start = Instant::now();
    while let Some(event) = rx.recv().await {
        let progress = (event.fraction() * 100.0) as u32;
        let bar_width = 30;
        let filled = (event.fraction() * bar_width as f64) as usize;
        let bar = "█".repeat(filled) + &"░".repeat(bar_width - filled);

        print!(
            "\r   📈 进度: [{}] {}% ({}/{}) | 帧时间: {:.2}s | 已用: {:.1}s     ",
            bar,
            progress,
            event.completed,
            event.total,
            event.frame.timestamp,
            start.elapsed().as_secs_f64()
        );
        io::stdout().flush().ok();
    }
    println!();
}

async fn start_web_server(bind: &str) -> Result<()> {
    use axum::{
        http::Method,
        routing::{get, post},
        Router,
    };
    use tower_http::cors::{Any, CorsLayer};
    use style_recon::handler;

    let app = Router::new()
        .route("/", get(handler::health_check))
        .route("/health", get(handler::health_check))
        .route("/analyze", post(handler::handle_analyze))
        .route("/analyze/query", get(handler::handle_analyze_query))
        .route("/credential", post(handler::handle_set_credential))
        // 跨域只开放只读接口，POST 的预检请求会被拒绝
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET]),
        );

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context(format!("绑定地址失败: {}", bind))?;

    tracing::info!("Web 服务器启动在: http://{}", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("可用端点:");
    tracing::info!("  • 健康检查: GET  http://{}/health", bind);
    tracing::info!("  • 分析视频: POST http://{}/analyze", bind);
    tracing::info!("  • 查询分析: GET  http://{}/analyze/query?input=<path>", bind);
    tracing::info!("  • 保存凭证: POST http://{}/credential", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    axum::serve(listener, app)
        .await
        .context("启动服务器失败")?;

    Ok(())
}
