//! 公共 URL 代理：配置了公共读取地址时，下载不走 S3 API 而是直接 HTTP 获取。

use axum::http::{HeaderMap, StatusCode, header};
use reqwest::{Client, Response, Url};
use std::time::Duration;
use thiserror::Error;
use tracing::error;

use crate::error::ApiError;
use crate::http::join_key;

/// 记录上游错误响应体时的最大长度。
const ERROR_BODY_LOG_LIMIT: usize = 512;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("object not found upstream")]
    NotFound,
    #[error("upstream returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid object url for key {0}")]
    InvalidKey(String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::NotFound => ApiError::NotFound,
            other => {
                error!(error = %other, "error while fetching public url");
                ApiError::Internal
            }
        }
    }
}

/// 上游响应中与下载相关的元数据。
#[derive(Debug)]
pub struct FetchedObject {
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub content_length: Option<u64>,
    pub response: Response,
}

#[derive(Clone, Debug)]
pub struct PublicFetcher {
    client: Client,
    base: Url,
    timeout: Duration,
    forbidden_is_404: bool,
}

impl PublicFetcher {
    pub fn new(base: Url, timeout: Duration, forbidden_is_404: bool) -> Result<Self, FetchError> {
        let client = Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            client,
            base,
            timeout,
            forbidden_is_404,
        })
    }

    pub fn object_url(&self, key: &str) -> Option<Url> {
        join_key(&self.base, key)
    }

    /// 获取对象；超时只约束到响应头返回为止，响应体按流转发。
    pub async fn fetch(&self, key: &str) -> Result<FetchedObject, FetchError> {
        let url = self
            .object_url(key)
            .ok_or_else(|| FetchError::InvalidKey(key.to_string()))?;
        let response = tokio::time::timeout(self.timeout, self.client.get(url).send())
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))??;

        let status = response.status();
        if status == StatusCode::NOT_FOUND
            || (status == StatusCode::FORBIDDEN && self.forbidden_is_404)
        {
            return Err(FetchError::NotFound);
        }
        if status.is_client_error() || status.is_server_error() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > ERROR_BODY_LOG_LIMIT {
                let mut end = ERROR_BODY_LOG_LIMIT;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
            return Err(FetchError::Status { status, body });
        }

        let headers = response.headers();
        Ok(FetchedObject {
            content_type: header_string(headers, header::CONTENT_TYPE),
            cache_control: header_string(headers, header::CACHE_CONTROL),
            content_length: response.content_length(),
            response,
        })
    }
}

/// 缺失或为空的头都视为未提供。
fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
