//! 按主机名解析首页与 favicon 资源，缺失时回退到默认资源。
//!
//! 资源目录在启动时扫描一次，生成只读的 [`AssetCatalog`]，请求期间不再访问
//! 文件系统。目录结构为 `index/<hostname>.<ext>` 与 `favicon/<hostname>.<ext>`，
//! 名为 `default` 的文件是回退资源，不算作租户。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, Request, header};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use rand::seq::IndexedRandom;
use rust_embed::RustEmbed;
use std::collections::{BTreeMap, HashMap};
use std::io::{self, ErrorKind};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::http::request_hostname;

#[derive(RustEmbed)]
#[folder = "static"]
/// 嵌入式静态资源（默认首页、favicon 与 HTML 模板）。
pub struct StaticAssets;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AssetClass {
    Index,
    Favicon,
}

impl AssetClass {
    const ALL: [AssetClass; 2] = [AssetClass::Index, AssetClass::Favicon];

    pub fn dir(self) -> &'static str {
        match self {
            AssetClass::Index => "index",
            AssetClass::Favicon => "favicon",
        }
    }

    fn default_file(self) -> &'static str {
        match self {
            AssetClass::Index => "default.jpg",
            AssetClass::Favicon => "default.ico",
        }
    }

    fn from_dir(dir: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|class| class.dir() == dir)
    }
}

#[derive(Clone, Debug)]
pub struct Asset {
    pub path: String,
    pub content_type: String,
    pub data: Bytes,
}

/// 启动时构建、之后只读的主机名资源表。
#[derive(Debug, Default)]
pub struct AssetCatalog {
    hostnames: Vec<String>,
    tenants: HashMap<(AssetClass, String), Asset>,
    defaults: HashMap<AssetClass, Asset>,
}

impl AssetCatalog {
    /// 由 `(相对路径, 内容)` 构建；同一主机名有多个文件时取字典序第一个。
    pub fn from_entries(entries: impl IntoIterator<Item = (String, Bytes)>) -> Self {
        let sorted: BTreeMap<String, Bytes> = entries.into_iter().collect();
        let mut catalog = Self::default();

        for (path, data) in sorted {
            let Some((dir, file)) = path.split_once('/') else {
                continue;
            };
            let Some(class) = AssetClass::from_dir(dir) else {
                continue;
            };
            if file.contains('/') {
                continue;
            }
            let Some((stem, _ext)) = file.rsplit_once('.') else {
                continue;
            };
            if stem.is_empty() {
                continue;
            }

            let asset = Asset {
                content_type: mime_guess::from_path(file)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string(),
                path: path.clone(),
                data,
            };

            if stem == "default" {
                if file == class.default_file() {
                    catalog.defaults.insert(class, asset);
                }
                continue;
            }

            let hostname = stem.to_ascii_lowercase();
            if !catalog.hostnames.contains(&hostname) {
                debug!(hostname, "found hostname");
                catalog.hostnames.push(hostname.clone());
            }
            catalog.tenants.entry((class, hostname)).or_insert(asset);
        }

        catalog.hostnames.sort();
        for class in AssetClass::ALL {
            if !catalog.defaults.contains_key(&class) {
                warn!(
                    asset = format!("{}/{}", class.dir(), class.default_file()),
                    "default asset missing"
                );
            }
        }
        catalog
    }

    /// 从编译期嵌入的 `static/` 目录构建。
    pub fn embedded() -> Self {
        let entries = StaticAssets::iter().filter_map(|path| {
            let is_asset = AssetClass::ALL
                .iter()
                .any(|class| path.starts_with(&format!("{}/", class.dir())));
            if !is_asset {
                return None;
            }
            let file = StaticAssets::get(&path)?;
            Some((path.into_owned(), Bytes::from(file.data.into_owned())))
        });
        Self::from_entries(entries)
    }

    /// 从磁盘目录构建，缺少子目录视为没有该类资源。
    pub async fn from_dir(root: &Path) -> io::Result<Self> {
        let mut entries = Vec::new();
        for class in AssetClass::ALL {
            let dir = root.join(class.dir());
            let mut read_dir = match fs::read_dir(&dir).await {
                Ok(read_dir) => read_dir,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    warn!(path = %dir.display(), "asset directory not found");
                    continue;
                }
                Err(err) => return Err(err),
            };
            while let Some(entry) = read_dir.next_entry().await? {
                if !entry.file_type().await?.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                let data = fs::read(entry.path()).await?;
                entries.push((format!("{}/{}", class.dir(), name), Bytes::from(data)));
            }
        }
        Ok(Self::from_entries(entries))
    }

    pub fn hostnames(&self) -> &[String] {
        &self.hostnames
    }

    pub fn is_known(&self, hostname: &str) -> bool {
        self.hostnames
            .binary_search_by(|known| known.as_str().cmp(hostname))
            .is_ok()
    }

    pub fn random_hostname(&self) -> Option<&str> {
        self.hostnames.choose(&mut rand::rng()).map(String::as_str)
    }

    /// 先找主机名专属资源，再回退到默认资源；都没有时返回 `None`。
    pub fn resolve(&self, class: AssetClass, hostname: &str) -> Option<&Asset> {
        self.tenants
            .get(&(class, hostname.to_ascii_lowercase()))
            .or_else(|| self.defaults.get(&class))
    }
}

/// 首页处理器。
pub async fn serve_index(
    Extension(catalog): Extension<Arc<AssetCatalog>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    serve_asset(&catalog, AssetClass::Index, &headers)
}

/// favicon 处理器。
pub async fn serve_favicon(
    Extension(catalog): Extension<Arc<AssetCatalog>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    serve_asset(&catalog, AssetClass::Favicon, &headers)
}

fn serve_asset(
    catalog: &AssetCatalog,
    class: AssetClass,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let hostname = request_hostname(headers);
    let Some(asset) = catalog.resolve(class, &hostname) else {
        warn!(hostname, class = class.dir(), "no asset available");
        return Err(ApiError::NotFound);
    };
    debug!(hostname, asset = asset.path, "serve asset");
    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&asset.content_type).map_err(|_| ApiError::Internal)?,
    );
    Ok((response_headers, AxumBody::from(asset.data.clone())).into_response())
}

/// 未知主机名随机替换为某个已知租户，让访客看到具体的租户页面。
pub async fn random_index(
    Extension(catalog): Extension<Arc<AssetCatalog>>,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Response {
    let hostname = request_hostname(req.headers());
    if !catalog.is_known(&hostname)
        && let Some(substitute) = catalog.random_hostname()
        && let Ok(value) = HeaderValue::from_str(substitute)
    {
        debug!(hostname, substitute, "random index substitution");
        req.headers_mut().insert(header::HOST, value);
    }
    next.run(req).await
}
