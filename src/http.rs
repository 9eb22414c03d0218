//! HTTP 辅助工具：主机名与基础 URL 解析、CORS、安全头与署名头。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, header};
use axum::{middleware, response::Response};
use reqwest::Url;
use std::net::IpAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::config::GatewayConfig;

pub const X_ATTRIBUTION: HeaderName = HeaderName::from_static("x-attribution");

/// 构建 CORS Layer（支持逗号分隔的来源列表）。
pub fn build_cors_layer(cors_origins: Option<&str>) -> Option<CorsLayer> {
    let origins = cors_origins?
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

/// 从 `x-forwarded-for` 解析客户端 IP。
pub fn extract_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<IpAddr>().ok())
}

/// `Host` 头原值（含端口）。
pub fn request_host(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// 去掉端口并转为小写的主机名，用于租户匹配。
pub fn request_hostname(headers: &HeaderMap) -> String {
    let Some(host) = request_host(headers) else {
        return String::new();
    };
    let hostname = if let Some(rest) = host.strip_prefix('[') {
        // IPv6 字面量
        rest.split(']').next().unwrap_or_default()
    } else {
        host.rsplit_once(':').map_or(host, |(name, _)| name)
    };
    hostname.to_ascii_lowercase()
}

/// 判断请求是否为 HTTPS（仅依据反向代理头）。
pub fn is_https_request(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("https"))
}

/// 请求的基础 URL，例如 `https://files.example.com/`。
pub fn base_url(headers: &HeaderMap) -> Option<Url> {
    let scheme = if is_https_request(headers) {
        "https"
    } else {
        "http"
    };
    let host = request_host(headers)?;
    Url::parse(&format!("{scheme}://{host}/")).ok()
}

/// 在基础 URL 后追加一个经过转义的路径段。
pub fn join_key(base: &Url, key: &str) -> Option<Url> {
    let mut url = base.clone();
    url.path_segments_mut().ok()?.pop_if_empty().push(key);
    Some(url)
}

/// 站内绝对路径 `/<key>`，键按路径段转义。
pub fn key_path(key: &str) -> Option<String> {
    let base = Url::parse("http://localhost/").ok()?;
    join_key(&base, key).map(|url| url.path().to_string())
}

/// HTTP/2 请求只带 `:authority`，补出 `Host` 头供主机名相关逻辑使用。
pub async fn fill_host_from_authority(
    mut request: Request<AxumBody>,
    next: middleware::Next,
) -> Response {
    if !request.headers().contains_key(header::HOST)
        && let Some(value) = request
            .uri()
            .authority()
            .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
    {
        request.headers_mut().insert(header::HOST, value);
    }
    next.run(request).await
}

/// 添加基础安全响应头。
pub async fn add_security_headers(request: Request<AxumBody>, next: middleware::Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

/// 为配置了署名的主机名追加 `X-Attribution` 响应头。
pub async fn add_attribution(
    Extension(config): Extension<Arc<GatewayConfig>>,
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Response {
    let attribution = config
        .attributions
        .get(&request_hostname(request.headers()))
        .and_then(|text| HeaderValue::from_str(text).ok());
    let mut response = next.run(request).await;
    if let Some(value) = attribution {
        response.headers_mut().insert(X_ATTRIBUTION, value);
    }
    response
}
