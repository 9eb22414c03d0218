//! 路由装配：处理器、中间件与共享状态。

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::assets::{self, AssetCatalog};
use crate::auth::{self, AuthConfig};
use crate::config::GatewayConfig;
use crate::fetch::PublicFetcher;
use crate::http::{self, build_cors_layer, extract_forwarded_ip};
use crate::store::ObjectStoreClient;
use crate::{files, preview, upload};

/// 启动时构建完成的共享依赖。
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub store: Arc<ObjectStoreClient>,
    pub auth: Arc<AuthConfig>,
    pub catalog: Arc<AssetCatalog>,
    pub fetcher: Option<Arc<PublicFetcher>>,
}

pub fn build_router(state: AppState) -> Router {
    let mut asset_routes = Router::new()
        .route("/", get(assets::serve_index))
        .route("/favicon.ico", get(assets::serve_favicon));
    if state.config.random_index {
        asset_routes = asset_routes.route_layer(middleware::from_fn(assets::random_index));
    }

    let download = if state.fetcher.is_some() {
        get(files::proxy_file)
    } else {
        get(files::download_file)
    };

    let mut app = Router::new()
        .route("/upload", post(upload::upload_form))
        .route("/{file}", download.post(upload::upload_named))
        .route("/{file}/preview", get(preview::preview_file))
        .merge(asset_routes)
        .layer(DefaultBodyLimit::max(state.config.body_limit))
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(middleware::from_fn(http::add_attribution))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(middleware::from_fn(http::fill_host_from_authority))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let client_ip = extract_forwarded_ip(request.headers())
                        .map(|ip| ip.to_string())
                        .or_else(|| {
                            request
                                .extensions()
                                .get::<ConnectInfo<SocketAddr>>()
                                .map(|ConnectInfo(addr)| addr.ip().to_string())
                        })
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(Extension(state.config.clone()))
        .layer(Extension(state.store))
        .layer(Extension(state.auth))
        .layer(Extension(state.catalog));

    if let Some(fetcher) = state.fetcher {
        app = app.layer(Extension(fetcher));
    }
    if let Some(cors_layer) = build_cors_layer(state.config.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }
    app
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderValue, Method, StatusCode, header};
    use axum::response::Response;
    use bytes::Bytes;
    use clap::Parser;
    use http_body_util::BodyExt;
    use object_store::memory::InMemory;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::assets::StaticAssets;
    use crate::config::Args;

    const PNG: &[u8] = &[
        0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
        0x52,
    ];
    const BOUNDARY: &str = "conspire-test-boundary";
    // alice:secret
    const ALICE: &str = "Basic YWxpY2U6c2VjcmV0";
    const HOST: &str = "files.example.com";

    struct TestApp {
        router: Router,
        store: Arc<ObjectStoreClient>,
    }

    fn make_app(extra_args: &[&str], catalog: AssetCatalog) -> TestApp {
        let mut argv = vec!["conspire", "--s3-bucket", "files"];
        argv.extend_from_slice(extra_args);
        let args = Args::try_parse_from(argv).expect("args");
        let config = GatewayConfig::from_args(args).expect("config");
        let store = Arc::new(ObjectStoreClient::new(
            Arc::new(InMemory::new()),
            "files",
            Duration::from_secs(5),
        ));
        let auth = AuthConfig::from_json(br#"[{"Username": "alice", "Password": "secret"}]"#)
            .expect("auth");
        let router = build_router(AppState {
            config: Arc::new(config),
            store: store.clone(),
            auth: Arc::new(auth),
            catalog: Arc::new(catalog),
            fetcher: None,
        });
        TestApp { router, store }
    }

    fn default_app() -> TestApp {
        make_app(&[], AssetCatalog::embedded())
    }

    fn multipart_body(file_name: &str, content: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(uri: &str, file_name: &str, content: &[u8], auth: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::HOST, HOST)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            );
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder
            .body(Body::from(multipart_body(file_name, content)))
            .expect("request")
    }

    fn get_request(uri: &str, host: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, host)
            .body(Body::empty())
            .expect("request")
    }

    async fn send(app: &TestApp, request: Request<Body>) -> Response {
        app.router.clone().oneshot(request).await.expect("response")
    }

    async fn body_bytes(response: Response) -> Bytes {
        response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes()
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_slice(&body_bytes(response).await).expect("json")
    }

    fn header_str<'a>(response: &'a Response, name: header::HeaderName) -> Option<&'a str> {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    #[tokio::test]
    async fn upload_uses_sniffed_extension_and_download_returns_bytes() {
        let app = default_app();
        let response = send(
            &app,
            upload_request("/upload", "photo.txt", PNG, Some(ALICE)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["status"], "success");
        assert_eq!(json["url"], "http://files.example.com/photo.png");

        let response = send(&app, get_request("/photo.png", HOST)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, header::CONTENT_TYPE), Some("image/png"));
        assert_eq!(
            header_str(&response, header::CACHE_CONTROL),
            Some(crate::config::DEFAULT_CACHE_CONTROL)
        );
        assert_eq!(
            header_str(&response, header::CONTENT_LENGTH),
            Some(PNG.len().to_string().as_str())
        );
        assert!(response.headers().contains_key(header::LAST_MODIFIED));
        assert_eq!(body_bytes(response).await.as_ref(), PNG);
    }

    #[tokio::test]
    async fn upload_to_named_path_uses_path_name() {
        let app = default_app();
        let response = send(
            &app,
            upload_request("/holiday.jpg", "ignored.txt", PNG, Some(ALICE)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["url"], "http://files.example.com/holiday.png");
        assert!(app.store.exists("holiday.png").await.expect("exists"));
    }

    #[tokio::test]
    async fn duplicate_upload_conflicts_and_keeps_original() {
        let app = default_app();
        let first = send(
            &app,
            upload_request("/upload", "photo.png", PNG, Some(ALICE)),
        )
        .await;
        assert_eq!(first.status(), StatusCode::CREATED);

        let mut altered = PNG.to_vec();
        altered.extend_from_slice(b"changed");
        let second = send(
            &app,
            upload_request("/upload", "photo.gif", &altered, Some(ALICE)),
        )
        .await;
        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(second).await["status"], "error");

        let response = send(&app, get_request("/photo.png", HOST)).await;
        assert_eq!(body_bytes(response).await.as_ref(), PNG);
    }

    #[tokio::test]
    async fn upload_requires_credentials() {
        let app = default_app();
        let response = send(&app, upload_request("/upload", "photo.png", PNG, None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // bob:wrong
        let response = send(
            &app,
            upload_request("/upload", "photo.png", PNG, Some("Basic Ym9iOndyb25n")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(!app.store.exists("photo.png").await.expect("exists"));
    }

    #[tokio::test]
    async fn upload_uses_uri_authority_without_host_header() {
        let app = default_app();
        let mut request = upload_request(
            "http://files.example.com/upload",
            "photo.png",
            PNG,
            Some(ALICE),
        );
        request.headers_mut().remove(header::HOST);
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            body_json(response).await["url"],
            "http://files.example.com/photo.png"
        );
    }

    #[tokio::test]
    async fn upload_without_any_host_is_rejected_before_storing() {
        let app = default_app();
        let mut request = upload_request("/upload", "photo.png", PNG, Some(ALICE));
        request.headers_mut().remove(header::HOST);
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!app.store.exists("photo.png").await.expect("exists"));
    }

    #[tokio::test]
    async fn upload_without_file_field_is_bad_request() {
        let app = default_app();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .header(header::HOST, HOST)
            .header(header::AUTHORIZATION, ALICE)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .expect("request");
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let app = default_app();
        let response = send(&app, get_request("/missing-file.png", HOST)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stored_content_type_wins_over_key_extension() {
        let app = default_app();
        app.store
            .put(
                "notes.png",
                Bytes::from_static(b"plain text"),
                &crate::store::PutRequest {
                    content_type: "text/plain".into(),
                    cache_control: "no-cache".into(),
                    make_public: false,
                },
            )
            .await
            .expect("put");
        let response = send(&app, get_request("/notes.png", HOST)).await;
        assert_eq!(header_str(&response, header::CONTENT_TYPE), Some("text/plain"));
        assert_eq!(header_str(&response, header::CACHE_CONTROL), Some("no-cache"));
    }

    #[tokio::test]
    async fn crawlers_get_image_embed() {
        let app = default_app();
        send(
            &app,
            upload_request("/upload", "photo.png", PNG, Some(ALICE)),
        )
        .await;

        let mut request = get_request("/photo.png", HOST);
        request.headers_mut().insert(
            header::USER_AGENT,
            HeaderValue::from_static("Mozilla/5.0 (compatible; Discordbot/2.0)"),
        );
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, header::CACHE_CONTROL), Some("private"));
        let page = String::from_utf8(body_bytes(response).await.to_vec()).expect("utf8");
        assert!(page.contains(r#"content="http://files.example.com/photo.png""#));
    }

    #[tokio::test]
    async fn crawler_embed_can_be_disabled() {
        let app = make_app(&["--link-preview-embeds", "false"], AssetCatalog::embedded());
        send(
            &app,
            upload_request("/upload", "photo.png", PNG, Some(ALICE)),
        )
        .await;
        let mut request = get_request("/photo.png", HOST);
        request.headers_mut().insert(
            header::USER_AGENT,
            HeaderValue::from_static("Slackbot-LinkExpanding 1.0"),
        );
        let response = send(&app, request).await;
        assert_eq!(header_str(&response, header::CONTENT_TYPE), Some("image/png"));
        assert_eq!(body_bytes(response).await.as_ref(), PNG);
    }

    #[tokio::test]
    async fn unknown_host_gets_default_assets() {
        let app = default_app();
        let index = send(&app, get_request("/", "unknown.example")).await;
        assert_eq!(index.status(), StatusCode::OK);
        assert_eq!(header_str(&index, header::CONTENT_TYPE), Some("image/jpeg"));
        let expected = StaticAssets::get("index/default.jpg").expect("default index");
        assert_eq!(body_bytes(index).await.as_ref(), expected.data.as_ref());

        let favicon = send(&app, get_request("/favicon.ico", "unknown.example")).await;
        assert_eq!(favicon.status(), StatusCode::OK);
        let expected = StaticAssets::get("favicon/default.ico").expect("default favicon");
        assert_eq!(body_bytes(favicon).await.as_ref(), expected.data.as_ref());
    }

    #[tokio::test]
    async fn tenant_host_gets_its_own_index() {
        let catalog = AssetCatalog::from_entries(vec![
            ("index/default.jpg".to_string(), Bytes::from_static(b"default")),
            ("index/lime.fan.png".to_string(), Bytes::from_static(b"lime")),
        ]);
        let app = make_app(&[], catalog);
        let response = send(&app, get_request("/", "Lime.Fan:8080")).await;
        assert_eq!(header_str(&response, header::CONTENT_TYPE), Some("image/png"));
        assert_eq!(body_bytes(response).await.as_ref(), b"lime");

        let response = send(&app, get_request("/favicon.ico", "lime.fan")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn random_index_substitutes_unknown_hosts() {
        let catalog = AssetCatalog::from_entries(vec![
            ("index/default.jpg".to_string(), Bytes::from_static(b"default")),
            ("index/lime.fan.png".to_string(), Bytes::from_static(b"lime")),
        ]);
        let app = make_app(&["--random-index"], catalog);
        let response = send(&app, get_request("/", "unknown.example")).await;
        assert_eq!(body_bytes(response).await.as_ref(), b"lime");
    }

    #[tokio::test]
    async fn preview_page_references_object() {
        let app = default_app();
        let response = send(&app, get_request("/photo.png/preview", HOST)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let page = String::from_utf8(body_bytes(response).await.to_vec()).expect("utf8");
        assert!(page.contains(r#"src="/photo.png""#));
    }

    #[tokio::test]
    async fn responses_carry_attribution_and_nosniff() {
        let app = make_app(
            &["--attribution", "files.example.com=Icons by Example"],
            AssetCatalog::embedded(),
        );
        let response = send(&app, get_request("/", HOST)).await;
        assert_eq!(
            header_str(&response, http::X_ATTRIBUTION),
            Some("Icons by Example")
        );
        assert_eq!(
            header_str(&response, header::X_CONTENT_TYPE_OPTIONS),
            Some("nosniff")
        );

        let response = send(&app, get_request("/", "other.example")).await;
        assert!(!response.headers().contains_key(http::X_ATTRIBUTION));
    }
}
