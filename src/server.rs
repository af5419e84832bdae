//! HTTP 推論サーバー
//!
//! - `POST /predict/` マルチパート（フィールド `file`）で画像を受け取り分類
//! - `GET /health` 稼働確認とカテゴリ一覧
//!
//! 推論エンジンは1つを共有し、推論はブロッキングスレッド上でロックを取って
//! 1リクエストずつ実行します。

use std::sync::{Arc, Mutex};

use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use burn::tensor::backend::Backend;
use serde_json::json;

use crate::error::ClassifierError;
use crate::ml::{InferenceEngine, Prediction};
use crate::model::ServerSettings;

/// アップロードのフィールド名
pub const UPLOAD_FIELD: &str = "file";

/// API エラー（`{"error": ...}` として返す）
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ClassifierError> for ApiError {
    fn from(err: ClassifierError) -> Self {
        if err.is_client_error() {
            Self::bad_request(err.to_string())
        } else {
            Self::internal(err.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("推論リクエストの処理に失敗しました: {}", self.message);
        } else {
            tracing::warn!("不正なリクエスト: {}", self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// サーバー共有状態
pub struct AppState<B: Backend> {
    engine: Arc<Mutex<InferenceEngine<B>>>,
    categories: Arc<Vec<String>>,
}

impl<B: Backend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            categories: Arc::clone(&self.categories),
        }
    }
}

impl<B: Backend> AppState<B> {
    pub fn new(engine: InferenceEngine<B>) -> Self {
        let categories = engine.registry().labels().to_vec();
        Self {
            engine: Arc::new(Mutex::new(engine)),
            categories: Arc::new(categories),
        }
    }
}

/// ルーターを構築
pub fn router<B: Backend>(engine: InferenceEngine<B>, settings: &ServerSettings) -> Router {
    Router::new()
        .route("/predict/", post(predict::<B>))
        .route("/health", get(health::<B>))
        .layer(DefaultBodyLimit::max(settings.max_upload_mb * 1024 * 1024))
        .with_state(AppState::new(engine))
}

async fn health<B: Backend>(State(state): State<AppState<B>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "categories": state.categories.as_slice(),
    }))
}

async fn predict<B: Backend>(
    State(state): State<AppState<B>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Prediction>, ApiError> {
    let mut multipart = multipart.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        upload = Some((filename, bytes));
        break;
    }

    let (filename, bytes) = upload.ok_or_else(|| {
        ApiError::bad_request(format!("multipart field '{UPLOAD_FIELD}' is required"))
    })?;
    tracing::debug!("アップロードを受信しました: {} ({} bytes)", filename, bytes.len());

    let engine = Arc::clone(&state.engine);
    let prediction = tokio::task::spawn_blocking(move || {
        let engine = engine
            .lock()
            .map_err(|_| ApiError::internal("inference engine lock poisoned"))?;
        engine.predict_bytes(&filename, &bytes).map_err(ApiError::from)
    })
    .await
    .map_err(|e| ApiError::internal(format!("inference task failed: {e}")))??;

    Ok(Json(prediction))
}

/// サーバーを起動（Ctrl+C で停止）
pub async fn serve<B: Backend>(
    engine: InferenceEngine<B>,
    settings: &ServerSettings,
) -> anyhow::Result<()> {
    let app = router(engine, settings);

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("{} で待ち受けできません: {}", settings.bind_addr, e))?;

    tracing::info!("推論サーバーを起動しました: http://{}/predict/", settings.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("シグナルの待機に失敗しました: {}", e);
            }
            tracing::info!("サーバーを停止します");
        })
        .await
        .map_err(|e| anyhow::anyhow!("サーバーエラー: {}", e))?;

    Ok(())
}
