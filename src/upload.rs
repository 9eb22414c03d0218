//! 上传处理：校验表单、探测真实类型、生成存储键、冲突检查后写入对象存储。

use axum::extract::multipart::MultipartRejection;
use axum::extract::{Extension, Multipart, Path};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::ApiError;
use crate::http::{base_url, join_key};
use crate::sniff::sniff;
use crate::store::{ObjectStoreClient, PutRequest, StoreError};

/// 表单中承载文件内容的字段名。
pub const FILE_FIELD: &str = "file";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(String),
    #[error("object already exists: {key}")]
    Conflict { key: String },
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Validation(msg) => ApiError::BadRequest(msg),
            UploadError::Conflict { .. } => ApiError::Conflict("file already exists".into()),
            UploadError::Storage(err) => ApiError::from(err),
        }
    }
}

/// 成功写入的对象。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredUpload {
    pub key: String,
    pub content_type: String,
}

#[derive(Serialize)]
pub(crate) struct UploadResponse {
    status: &'static str,
    url: String,
}

/// 校验客户端给出的文件名并返回去掉扩展名后的主体部分。
pub fn validate_name(requested: &str) -> Result<&str, UploadError> {
    let name = requested.trim();
    if name.is_empty() {
        return Err(UploadError::Validation("file name is required".into()));
    }
    if name.contains(['/', '\\']) || name.chars().any(char::is_control) {
        return Err(UploadError::Validation("invalid file name".into()));
    }
    let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
    if stem.is_empty() || stem.chars().all(|c| c == '.') {
        return Err(UploadError::Validation("invalid file name".into()));
    }
    Ok(stem)
}

/// 用探测到的扩展名替换客户端给出的扩展名。
///
/// 键必须原样作为对象路径保存，会被对象存储转义的字符一律拒绝，
/// 否则返回给客户端的 URL 与实际存储的键不一致。
pub fn derive_key(requested: &str, extension: &str) -> Result<String, UploadError> {
    let stem = validate_name(requested)?;
    let key = format!("{stem}.{extension}");
    if ObjectPath::from(key.as_str()).as_ref() != key {
        return Err(UploadError::Validation(
            "file name contains unsupported characters".into(),
        ));
    }
    Ok(key)
}

/// 已确定存储键、尚未写入的上传。
#[derive(Clone, Debug)]
pub struct PreparedUpload {
    pub key: String,
    pub content_type: String,
}

/// 探测类型并生成存储键，不访问对象存储。
pub fn prepare_upload(requested_name: &str, content: &[u8]) -> Result<PreparedUpload, UploadError> {
    let sniffed = sniff(content);
    let key = derive_key(requested_name, &sniffed.extension)?;
    Ok(PreparedUpload {
        key,
        content_type: sniffed.mime_type,
    })
}

/// 检查冲突后写入。已存在的键不会被覆盖。
pub async fn commit_upload(
    store: &ObjectStoreClient,
    config: &GatewayConfig,
    prepared: PreparedUpload,
    content: Bytes,
) -> Result<StoredUpload, UploadError> {
    let PreparedUpload { key, content_type } = prepared;

    // 并发上传同名文件时仍可能竞争，这里只做尽力检查
    if store.exists(&key).await? {
        return Err(UploadError::Conflict { key });
    }

    let request = PutRequest {
        content_type: content_type.clone(),
        cache_control: config.default_cache_control.clone(),
        make_public: config.set_public_acl,
    };
    let size = content.len();
    store.put(&key, content, &request).await?;
    info!(
        bucket = store.bucket(),
        key,
        size,
        content_type,
        "upload stored"
    );

    Ok(StoredUpload { key, content_type })
}

/// 上传流水线：探测类型、检查冲突、写入。
pub async fn store_upload(
    store: &ObjectStoreClient,
    config: &GatewayConfig,
    requested_name: &str,
    content: Bytes,
) -> Result<StoredUpload, UploadError> {
    let prepared = prepare_upload(requested_name, &content)?;
    commit_upload(store, config, prepared, content).await
}

/// `POST /upload`：文件名取自表单字段。
pub async fn upload_form(
    Extension(store): Extension<Arc<ObjectStoreClient>>,
    Extension(config): Extension<Arc<GatewayConfig>>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    handle_upload(&store, &config, &headers, None, multipart).await
}

/// `POST /{file}`：文件名取自路径。
pub async fn upload_named(
    Path(file): Path<String>,
    Extension(store): Extension<Arc<ObjectStoreClient>>,
    Extension(config): Extension<Arc<GatewayConfig>>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    handle_upload(&store, &config, &headers, Some(file), multipart).await
}

async fn handle_upload(
    store: &ObjectStoreClient,
    config: &GatewayConfig,
    headers: &HeaderMap,
    path_name: Option<String>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let multipart = multipart.map_err(|err| {
        warn!(error = %err, "invalid upload form");
        ApiError::BadRequest("file not found".into())
    })?;
    let (field_name, content) = read_file_field(multipart).await?;
    let requested_name = path_name
        .or(field_name)
        .ok_or_else(|| ApiError::BadRequest("file name is required".into()))?;

    let prepared = prepare_upload(&requested_name, &content)?;
    // 写入之前先确定 URL，避免对象已落盘却无法告知客户端
    let url = base_url(headers)
        .and_then(|base| join_key(&base, &prepared.key))
        .ok_or_else(|| {
            warn!(key = prepared.key, "upload without host, cannot build url");
            ApiError::BadRequest("host header is required".into())
        })?;

    let stored = commit_upload(store, config, prepared, content)
        .await
        .inspect_err(|err| {
            if let UploadError::Conflict { key } = err {
                info!(key, "upload rejected, object exists");
            }
        })?;

    debug!(url = %url, content_type = stored.content_type, "upload available");
    Ok((
        StatusCode::CREATED,
        JsonResponse(UploadResponse {
            status: "success",
            url: url.to_string(),
        }),
    )
        .into_response())
}

/// 读取 `file` 字段，返回客户端文件名与内容。
async fn read_file_field(mut multipart: Multipart) -> Result<(Option<String>, Bytes), ApiError> {
    loop {
        let field = multipart.next_field().await.map_err(|err| {
            warn!(error = %err, "malformed multipart body");
            ApiError::BadRequest("invalid multipart form".into())
        })?;
        let Some(field) = field else {
            return Err(ApiError::BadRequest("file not found".into()));
        };
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let content = field.bytes().await.map_err(|err| {
            warn!(error = %err, "failed reading upload body");
            ApiError::BadRequest("invalid multipart form".into())
        })?;
        return Ok((file_name, content));
    }
}
