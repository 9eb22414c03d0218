//! 上传鉴权：从用户文件加载凭据，Basic 认证保护所有 POST 请求。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{Method, Request};
use axum::middleware;
use axum_extra::extract::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Basic};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::ApiError;

#[derive(Debug, Default)]
pub struct AuthConfig {
    users: HashMap<String, String>,
}

#[derive(Deserialize)]
struct UserEntry {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Password")]
    password: String,
}

impl AuthConfig {
    /// 加载用户文件；文件不存在时返回空凭据集（上传全部拒绝）。
    pub async fn load(path: &Path) -> io::Result<Self> {
        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "users file not found, uploads are disabled");
                return Ok(Self::default());
            }
            Err(err) => return Err(err),
        };
        Self::from_json(&data)
    }

    pub fn from_json(data: &[u8]) -> io::Result<Self> {
        let entries: Vec<UserEntry> = serde_json::from_slice(data)
            .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
        let users = entries
            .into_iter()
            .map(|entry| {
                debug!(user = %entry.username, "configuring privileged user");
                (entry.username, entry.password)
            })
            .collect();
        Ok(Self { users })
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|expected| expected == password)
    }
}

/// 认证中间件：只有上传（POST）需要 Basic 认证。
pub async fn auth_middleware(
    Extension(auth): Extension<Arc<AuthConfig>>,
    auth_header: Option<TypedHeader<Authorization<Basic>>>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<axum::response::Response, ApiError> {
    if req.method() != Method::POST {
        return Ok(next.run(req).await);
    }

    if let Some(TypedHeader(auth_header)) = auth_header
        && auth.verify(auth_header.username(), auth_header.password())
    {
        return Ok(next.run(req).await);
    }

    warn!(path = req.uri().path(), "rejected unauthenticated upload");
    Err(ApiError::Unauthorized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_users_file_format() {
        let auth = AuthConfig::from_json(
            br#"[{"Username": "alice", "Password": "secret"}, {"Username": "bob", "Password": "hunter2"}]"#,
        )
        .expect("users");
        assert!(auth.verify("alice", "secret"));
        assert!(auth.verify("bob", "hunter2"));
        assert!(!auth.verify("alice", "hunter2"));
        assert!(!auth.verify("carol", ""));
    }

    #[test]
    fn malformed_users_file_is_an_error() {
        let err = AuthConfig::from_json(b"{not json").expect_err("malformed");
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn missing_users_file_disables_uploads() {
        let temp = tempdir().expect("tempdir");
        let auth = AuthConfig::load(&temp.path().join("users.json"))
            .await
            .expect("load");
        assert!(auth.is_empty());
        assert!(!auth.verify("", ""));
    }
}
