//! 预览页与聊天应用链接卡片（crawler embed）的 HTML 渲染。

use axum::extract::Path;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{Html, IntoResponse, Response};
use html_escape::{encode_double_quoted_attribute, encode_text};
use reqwest::Url;
use std::borrow::Cow;
use tracing::{debug, error};

use crate::assets::StaticAssets;
use crate::error::ApiError;
use crate::http::key_path;

const IMAGE_PREVIEW_TEMPLATE: &str = "templates/image_preview.html";
const FILE_PREVIEW_TEMPLATE: &str = "templates/file_preview.html";
const IMAGE_EMBED_TEMPLATE: &str = "templates/image_embed.html";

/// 模板变量及其所在的 HTML 上下文。
#[derive(Clone, Copy, Debug)]
pub enum Slot<'a> {
    /// 元素文本，例如 `<title>`。
    Text(&'a str),
    /// 双引号属性值，例如 `href="..."`。
    Attribute(&'a str),
}

impl Slot<'_> {
    fn encode(&self) -> Cow<'_, str> {
        match self {
            Slot::Text(value) => encode_text(value),
            Slot::Attribute(value) => encode_double_quoted_attribute(value),
        }
    }
}

/// 单遍替换 `{{name}}` 占位符；变量值中的花括号不会被再次解释。
fn fill_placeholders(template: &str, vars: &[(&str, Slot<'_>)]) -> String {
    let mut page = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        page.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            page.push_str(&rest[start..]);
            return page;
        };
        let name = &after[..end];
        match vars.iter().find(|(key, _)| *key == name) {
            Some((_, slot)) => page.push_str(&slot.encode()),
            None => page.push_str(&rest[start..start + end + 4]),
        }
        rest = &after[end + 2..];
    }
    page.push_str(rest);
    page
}

/// 渲染内嵌模板。
pub fn render_template(name: &str, vars: &[(&str, Slot<'_>)]) -> Result<String, ApiError> {
    let file = StaticAssets::get(name).ok_or_else(|| {
        error!(template = name, "template missing from embedded assets");
        ApiError::Internal
    })?;
    Ok(fill_placeholders(&String::from_utf8_lossy(&file.data), vars))
}

fn is_image_name(file: &str) -> bool {
    mime_guess::from_path(file)
        .first()
        .is_some_and(|mime| mime.type_() == mime_guess::mime::IMAGE)
}

/// `GET /{file}/preview`：图片显示 `<img>`，其他文件显示下载链接。
pub async fn preview_file(Path(file): Path<String>) -> Result<Html<String>, ApiError> {
    let url = key_path(&file).ok_or(ApiError::NotFound)?;
    let template = if is_image_name(&file) {
        IMAGE_PREVIEW_TEMPLATE
    } else {
        FILE_PREVIEW_TEMPLATE
    };
    debug!(file, template, "render preview");
    render_template(
        template,
        &[
            ("file_name", Slot::Text(&file)),
            ("file_name_attr", Slot::Attribute(&file)),
            ("url", Slot::Attribute(&url)),
        ],
    )
    .map(Html)
}

/// 给链接预览爬虫的图片卡片页，禁止共享缓存。
pub fn image_embed(url: &Url) -> Result<Response, ApiError> {
    let page = render_template(IMAGE_EMBED_TEMPLATE, &[("url", Slot::Attribute(url.as_str()))])?;
    let mut headers = HeaderMap::new();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private"));
    Ok((headers, Html(page)).into_response())
}
