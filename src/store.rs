//! 对象存储客户端：head/get/exists/put/delete 的带超时封装。

use axum::http::{HeaderMap, HeaderValue};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, AttributeValue, Attributes, ClientOptions, GetOptions, GetResult, ObjectStore,
    PutOptions, PutPayload, RetryConfig,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::GatewayConfig;

/// 启动探测使用的哨兵键，通常不存在。
const STARTUP_CHECK_KEY: &str = ".conspire-startup-check";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {key}")]
    NotFound { key: String },
    #[error("{op} timed out after {timeout:?}: {key}")]
    Timeout {
        op: &'static str,
        key: String,
        timeout: Duration,
    },
    /// 后端返回重定向，通常意味着 bucket 与 region 配置不匹配。
    #[error("object store redirected the request: {0}")]
    Misconfigured(object_store::Error),
    #[error(transparent)]
    Backend(object_store::Error),
}

impl StoreError {
    fn from_backend(key: &str, error: object_store::Error) -> Self {
        match error {
            object_store::Error::NotFound { .. } => StoreError::NotFound {
                key: key.to_string(),
            },
            other if is_redirect(&other) => StoreError::Misconfigured(other),
            other => StoreError::Backend(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// bucket 与 region 不匹配时 S3 返回不带 `Location` 的 301，或 `PermanentRedirect` 错误码。
const REDIRECT_MARKERS: [&str; 3] = [
    "incorrectly configured region",
    "PermanentRedirect",
    "301 Moved Permanently",
];

fn is_redirect(error: &object_store::Error) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(err) = current {
        let text = err.to_string();
        if REDIRECT_MARKERS.iter().any(|marker| text.contains(marker)) {
            return true;
        }
        current = err.source();
    }
    false
}

fn s3_builder(config: &GatewayConfig, client_options: ClientOptions) -> AmazonS3Builder {
    // 不在客户端内部重试，失败直接交给调用方
    let retry = RetryConfig {
        max_retries: 0,
        ..RetryConfig::default()
    };
    // 只限制连接；响应头之前的阶段由 `timed` 限制，响应体不设总时长
    let client_options = client_options
        .with_allow_http(config.s3_endpoint.starts_with("http://"))
        .with_connect_timeout(config.storage_timeout)
        .with_timeout_disabled();
    let builder = AmazonS3Builder::from_env()
        .with_endpoint(config.s3_endpoint.as_str())
        .with_region(config.s3_region.as_str())
        .with_bucket_name(config.bucket.as_str())
        .with_client_options(client_options)
        .with_retry(retry);
    match (&config.s3_access_key_id, &config.s3_secret_access_key) {
        (Some(key_id), Some(secret)) => builder
            .with_access_key_id(key_id.as_str())
            .with_secret_access_key(secret.as_str()),
        _ => builder,
    }
}

/// 对象元数据；`None` 与空字符串含义不同，前者触发回退策略。
#[derive(Clone, Debug, Default)]
pub struct ObjectMetadata {
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ObjectMetadata {
    pub fn from_result(result: &GetResult) -> Self {
        let attribute = |key: &Attribute| {
            result.attributes.get(key).map(|value| {
                let text: &str = value.as_ref();
                text.to_string()
            })
        };
        Self {
            content_type: attribute(&Attribute::ContentType),
            cache_control: attribute(&Attribute::CacheControl),
            size: u64::try_from(result.meta.size).ok(),
            last_modified: Some(result.meta.last_modified),
        }
    }
}

/// 写入对象时携带的元数据。
#[derive(Clone, Debug)]
pub struct PutRequest {
    pub content_type: String,
    pub cache_control: String,
    pub make_public: bool,
}

/// 单一 bucket 的对象存储客户端，每次调用都有独立超时且不重试。
#[derive(Clone, Debug)]
pub struct ObjectStoreClient {
    inner: Arc<dyn ObjectStore>,
    /// 附带 `x-amz-acl: public-read` 的写入端。
    public_writer: Arc<dyn ObjectStore>,
    bucket: String,
    timeout: Duration,
}

impl ObjectStoreClient {
    pub fn new(inner: Arc<dyn ObjectStore>, bucket: impl Into<String>, timeout: Duration) -> Self {
        Self {
            public_writer: inner.clone(),
            inner,
            bucket: bucket.into(),
            timeout,
        }
    }

    /// 按配置连接 S3 兼容存储。
    pub fn connect(config: &GatewayConfig) -> Result<Self, StoreError> {
        let store = s3_builder(config, ClientOptions::new())
            .build()
            .map_err(StoreError::Backend)?;

        let mut acl_headers = HeaderMap::new();
        acl_headers.insert("x-amz-acl", HeaderValue::from_static("public-read"));
        let public_writer = s3_builder(
            config,
            ClientOptions::new().with_default_headers(acl_headers),
        )
        .build()
        .map_err(StoreError::Backend)?;

        Ok(Self {
            inner: Arc::new(store),
            public_writer: Arc::new(public_writer),
            bucket: config.bucket.clone(),
            timeout: config.storage_timeout,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// 对哨兵键发起一次 `exists`，确认后端可达且配置正确。
    pub async fn check_access(&self) -> Result<(), StoreError> {
        self.exists(STARTUP_CHECK_KEY).await.map(|_| ())
    }

    pub async fn head(&self, key: &str) -> Result<ObjectMetadata, StoreError> {
        let location = ObjectPath::from(key);
        let options = GetOptions {
            head: true,
            ..GetOptions::default()
        };
        let result = self
            .timed("head", key, self.inner.get_opts(&location, options))
            .await?;
        Ok(ObjectMetadata::from_result(&result))
    }

    /// 打开对象读取流，元数据一并返回。
    pub async fn get(&self, key: &str) -> Result<GetResult, StoreError> {
        let location = ObjectPath::from(key);
        self.timed("get", key, self.inner.get(&location)).await
    }

    /// NotFound 视为 `false`，其他错误原样返回。
    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn put(&self, key: &str, body: Bytes, request: &PutRequest) -> Result<(), StoreError> {
        let location = ObjectPath::from(key);
        let mut attributes = Attributes::new();
        attributes.insert(
            Attribute::ContentType,
            AttributeValue::from(request.content_type.clone()),
        );
        attributes.insert(
            Attribute::CacheControl,
            AttributeValue::from(request.cache_control.clone()),
        );
        let options = PutOptions {
            attributes,
            ..PutOptions::default()
        };
        let size = body.len();
        let writer = if request.make_public {
            &self.public_writer
        } else {
            &self.inner
        };
        self.timed(
            "put",
            key,
            writer.put_opts(&location, PutPayload::from(body), options),
        )
        .await?;
        debug!(
            bucket = %self.bucket,
            key,
            size,
            public = request.make_public,
            "object stored"
        );
        Ok(())
    }

    /// 删除对象；网关本身不暴露删除接口。
    #[allow(dead_code)]
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let location = ObjectPath::from(key);
        self.timed("delete", key, self.inner.delete(&location)).await?;
        debug!(bucket = %self.bucket, key, "object deleted");
        Ok(())
    }

    /// 每次调用单独计时，超时即失败。
    async fn timed<T>(
        &self,
        op: &'static str,
        key: &str,
        future: impl Future<Output = object_store::Result<T>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, future).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(StoreError::from_backend(key, err)),
            Err(_) => Err(StoreError::Timeout {
                op,
                key: key.to_string(),
                timeout: self.timeout,
            }),
        }
    }
}
