//! 下载处理器：从对象元数据确定 Content-Type 与 Cache-Control，按流返回对象内容。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use httpdate::fmt_http_date;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::ApiError;
use crate::fetch::PublicFetcher;
use crate::http::{base_url, join_key};
use crate::preview::image_embed;
use crate::store::{ObjectMetadata, ObjectStoreClient};

pub const OCTET_STREAM: &str = "application/octet-stream";

/// 会被识别为聊天应用链接预览爬虫的 User-Agent 片段。
const LINK_PREVIEW_AGENTS: [&str; 5] = [
    "Discord",
    "Slackbot",
    "TelegramBot",
    "Twitterbot",
    "facebookexternalhit",
];

/// 元数据优先，其次按扩展名推断，最后回退到 octet-stream。
pub fn resolve_content_type(stored: Option<&str>, key: &str) -> String {
    if let Some(content_type) = stored {
        return content_type.to_string();
    }
    mime_guess::from_path(key)
        .first()
        .map(|mime| mime.essence_str().to_string())
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

pub fn resolve_cache_control(stored: Option<&str>, default: &str) -> String {
    stored.unwrap_or(default).to_string()
}

pub fn is_link_preview_crawler(headers: &HeaderMap) -> bool {
    headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|agent| {
            LINK_PREVIEW_AGENTS
                .iter()
                .any(|needle| agent.contains(needle))
        })
}

/// 爬虫请求图片时返回卡片页而不是原始字节。
fn crawler_embed(
    config: &GatewayConfig,
    headers: &HeaderMap,
    key: &str,
    content_type: &str,
) -> Option<Result<Response, ApiError>> {
    if !config.link_preview_embeds
        || !content_type.starts_with("image/")
        || !is_link_preview_crawler(headers)
    {
        return None;
    }
    let url = base_url(headers).and_then(|base| join_key(&base, key))?;
    debug!(key, url = %url, "serving link preview embed");
    Some(image_embed(&url))
}

fn content_headers(content_type: &str, cache_control: &str) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, header_value(content_type)?);
    headers.insert(header::CACHE_CONTROL, header_value(cache_control)?);
    Ok(headers)
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| {
        warn!(value, "stored metadata is not a valid header value");
        ApiError::Internal
    })
}

fn insert_length(headers: &mut HeaderMap, length: u64) {
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
}

fn insert_last_modified(headers: &mut HeaderMap, modified: DateTime<Utc>) {
    let value = fmt_http_date(SystemTime::from(modified));
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}

/// `GET /{file}`：直接通过对象存储 API 下载。
pub async fn download_file(
    Path(file): Path<String>,
    request_headers: HeaderMap,
    Extension(store): Extension<Arc<ObjectStoreClient>>,
    Extension(config): Extension<Arc<GatewayConfig>>,
) -> Result<Response, ApiError> {
    let metadata = store.head(&file).await.inspect_err(|err| {
        if err.is_not_found() {
            debug!(key = file, "download of missing object");
        }
    })?;
    let content_type = resolve_content_type(metadata.content_type.as_deref(), &file);
    let cache_control = resolve_cache_control(
        metadata.cache_control.as_deref(),
        &config.default_cache_control,
    );

    if let Some(embed) = crawler_embed(&config, &request_headers, &file, &content_type) {
        return embed;
    }

    let mut response_headers = content_headers(&content_type, &cache_control)?;
    let result = store.get(&file).await?;
    let object = ObjectMetadata::from_result(&result);
    if let Some(size) = object.size {
        insert_length(&mut response_headers, size);
    }
    if let Some(modified) = object.last_modified {
        insert_last_modified(&mut response_headers, modified);
    }

    info!(bucket = store.bucket(), key = file, content_type, "download");
    let key = file.clone();
    let stream = result.into_stream().inspect_err(move |err| {
        warn!(key, error = %err, "object stream failed mid-download");
    });
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(stream),
    )
        .into_response())
}

/// `GET /{file}`：配置了公共地址时经 HTTP 代理下载。
pub async fn proxy_file(
    Path(file): Path<String>,
    request_headers: HeaderMap,
    Extension(fetcher): Extension<Arc<PublicFetcher>>,
    Extension(config): Extension<Arc<GatewayConfig>>,
) -> Result<Response, ApiError> {
    let fetched = fetcher.fetch(&file).await?;
    let content_type = resolve_content_type(fetched.content_type.as_deref(), &file);
    let cache_control = resolve_cache_control(
        fetched.cache_control.as_deref(),
        &config.default_cache_control,
    );

    if let Some(embed) = crawler_embed(&config, &request_headers, &file, &content_type) {
        return embed;
    }

    let mut response_headers = content_headers(&content_type, &cache_control)?;
    if let Some(length) = fetched.content_length {
        insert_length(&mut response_headers, length);
    }
    if let Some(modified) = fetched.response.headers().get(header::LAST_MODIFIED) {
        response_headers.insert(header::LAST_MODIFIED, modified.clone());
    }

    info!(key = file, content_type, "proxied download");
    let key = file.clone();
    let stream = fetched.response.bytes_stream().inspect_err(move |err| {
        warn!(key, error = %err, "upstream stream failed mid-download");
    });
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(stream),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn stored_content_type_wins_over_extension() {
        assert_eq!(
            resolve_content_type(Some("text/plain"), "photo.png"),
            "text/plain"
        );
    }

    #[test]
    fn extension_is_used_when_metadata_is_absent() {
        assert_eq!(resolve_content_type(None, "photo.png"), "image/png");
        assert_eq!(resolve_content_type(None, "clip.mp4"), "video/mp4");
        assert_eq!(resolve_content_type(None, "blob"), OCTET_STREAM);
        assert_eq!(resolve_content_type(None, "data.zzzunknown"), OCTET_STREAM);
    }

    #[test]
    fn cache_control_falls_back_to_default() {
        assert_eq!(
            resolve_cache_control(Some("no-cache"), "public, max-age=60"),
            "no-cache"
        );
        assert_eq!(
            resolve_cache_control(None, "public, max-age=60"),
            "public, max-age=60"
        );
    }

    #[test]
    fn recognizes_chat_crawlers() {
        assert!(is_link_preview_crawler(&agent(
            "Mozilla/5.0 (compatible; Discordbot/2.0; +https://discordapp.com)"
        )));
        assert!(is_link_preview_crawler(&agent(
            "facebookexternalhit/1.1 (+http://www.facebook.com/externalhit_uatext.php)"
        )));
        assert!(is_link_preview_crawler(&agent("TelegramBot (like TwitterBot)")));
        assert!(!is_link_preview_crawler(&agent(
            "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0"
        )));
        assert!(!is_link_preview_crawler(&HeaderMap::new()));
    }
}
