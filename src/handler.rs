use axum::{
    extract::{Json, Query},
    http::StatusCode,
    response::Json as ResponseJson,
};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tracing::{error, info};

use crate::config::{ConfigLoader, ConfigOverrides};
use crate::credentials::{CredentialStore, IniCredentialStore};
use crate::pipeline::{analyze_video, resolve_api_key, save_outputs, AnalysisReport, Pipeline};

/// 分析接口的统一响应
#[derive(Debug, Serialize)]
pub struct AnalyzeResponse<T = AnalysisReport> {
    pub success: bool,
    pub message: String,
    pub result: Option<T>,
}

/// 分析请求
#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    /// 本地视频文件路径
    pub input: String,
    /// 采样帧数
    pub frame_count: Option<usize>,
    /// 是否启用视觉分析
    pub vision: Option<bool>,
    /// API Key（未提供时使用已保存的凭证）
    pub api_key: Option<String>,
    /// 是否在响应中返回帧（data URL）
    pub include_frames: Option<bool>,
    /// 输出目录（可选，提供时保存帧、描述和提示词）
    pub output: Option<String>,
}

/// 健康检查 Handler
pub async fn health_check() -> &'static str {
    "OK"
}

/// 分析本地视频文件
pub async fn handle_analyze(
    Json(request): Json<AnalyzeRequest>,
) -> Result<ResponseJson<AnalyzeResponse>, (StatusCode, String)> {
    info!(
        "收到分析请求: input={}, frame_count={:?}, vision={:?}",
        request.input, request.frame_count, request.vision
    );

    if request.input.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "input 不能为空".to_string()));
    }

    let input_path = PathBuf::from(&request.input);
    if !input_path.exists() {
        return Err((
            StatusCode::NOT_FOUND,
            format!("视频文件不存在: {}", input_path.display()),
        ));
    }

    // 请求参数 > 环境变量 > 配置文件 > 默认值
    let overrides = ConfigOverrides {
        frame_count: request.frame_count,
        pacing_ms: None,
        vision: request.vision,
        api_key: request.api_key.clone(),
    };
    let extended = ConfigLoader::load_extended_config(None, &overrides).map_err(|e| {
        error!("加载配置失败: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("加载配置失败: {}", e))
    })?;
    let output_dir = request
        .output
        .as_deref()
        .map(|requested| resolve_output_dir(extended.output_path.as_deref(), requested))
        .transpose()?;
    let config = extended.analysis;

    let store = IniCredentialStore::default_location();
    let api_key = resolve_api_key(
        &config.vision,
        store.as_ref().map(|s| s as &dyn CredentialStore),
    );
    let pipeline = Pipeline::new(config, api_key);

    let output = analyze_video(&input_path, &pipeline, None, None)
        .await
        .map_err(|e| {
            error!("分析视频失败: {:#}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("分析视频失败: {:#}", e))
        })?;

    if let Some(dir) = &output_dir {
        save_outputs(&output, dir).map_err(|e| {
            error!("保存结果失败: {:#}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("保存结果失败: {:#}", e))
        })?;
    }

    let report = output.to_report(&request.input, request.include_frames.unwrap_or(false));
    let response = AnalyzeResponse {
        success: true,
        message: format!(
            "成功分析视频，采样 {} 帧{}",
            report.frame_timestamps.len(),
            if report.vision_applied { "，已应用视觉分析" } else { "" }
        ),
        result: Some(report),
    };

    info!("分析完成: run={}", output.run_id);
    Ok(ResponseJson(response))
}

/// 请求中的输出目录只能是配置的 output_path 之下的相对路径
fn resolve_output_dir(
    root: Option<&Path>,
    requested: &str,
) -> Result<PathBuf, (StatusCode, String)> {
    let root = root.ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            "服务端未配置 output_path，不接受 output 参数".to_string(),
        )
    })?;

    let requested = Path::new(requested);
    let relative = requested
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !relative || requested.as_os_str().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("output 必须是不含 .. 的相对路径: {}", requested.display()),
        ));
    }

    Ok(root.join(requested))
}

/// 查询参数版本（GET 请求，方便测试）
#[derive(Debug, Deserialize)]
pub struct AnalyzeQueryParams {
    pub input: String,
    pub frame_count: Option<usize>,
    pub vision: Option<bool>,
    pub include_frames: Option<bool>,
}

pub async fn handle_analyze_query(
    Query(params): Query<AnalyzeQueryParams>,
) -> Result<ResponseJson<AnalyzeResponse>, (StatusCode, String)> {
    let request = AnalyzeRequest {
        input: params.input,
        frame_count: params.frame_count,
        vision: params.vision,
        api_key: None,
        include_frames: params.include_frames,
        output: None,
    };

    handle_analyze(Json(request)).await
}

#[derive(Debug, Deserialize)]
pub struct CredentialRequest {
    pub api_key: String,
}

/// 保存 API Key
pub async fn handle_set_credential(
    Json(request): Json<CredentialRequest>,
) -> Result<ResponseJson<AnalyzeResponse<()>>, (StatusCode, String)> {
    let store = IniCredentialStore::default_location().ok_or_else(|| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "无法确定凭证文件位置（未设置 HOME）".to_string(),
        )
    })?;

    store.set(&request.api_key).map_err(|e| {
        error!("保存凭证失败: {:#}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("保存凭证失败: {:#}", e))
    })?;

    info!("已保存 API Key 到 {}", store.path().display());
    Ok(ResponseJson(AnalyzeResponse {
        success: true,
        message: "API Key 已保存".to_string(),
        result: None,
    }))
}
