//! 文件真实类型探测：只看内容头部的魔数，不信任客户端文件名。

/// 参与探测的最大字节数。
pub const SNIFF_LEN: usize = 512;
pub const FALLBACK_MIME: &str = "application/octet-stream";
pub const FALLBACK_EXTENSION: &str = "bin";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SniffResult {
    pub mime_type: String,
    /// 不含前导 `.`。
    pub extension: String,
}

/// 根据内容前 512 字节判断 MIME 类型与规范扩展名。
pub fn sniff(content: &[u8]) -> SniffResult {
    let head = &content[..content.len().min(SNIFF_LEN)];
    let Some(kind) = infer::get(head) else {
        return SniffResult {
            mime_type: FALLBACK_MIME.to_string(),
            extension: FALLBACK_EXTENSION.to_string(),
        };
    };
    let mime_type = kind.mime_type();
    SniffResult {
        mime_type: mime_type.to_string(),
        extension: canonical_extension(mime_type).to_string(),
    }
}

/// MIME 类型到扩展名：取登记表中的第一个，`image/jpeg` 固定为 `jpg`。
pub fn canonical_extension(mime_type: &str) -> &'static str {
    if mime_type.eq_ignore_ascii_case("image/jpeg") {
        return "jpg";
    }
    mime_guess::get_mime_extensions_str(mime_type)
        .and_then(|extensions| extensions.first().copied())
        .unwrap_or(FALLBACK_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = &[
        0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
        0x52,
    ];
    const JPEG_HEADER: &[u8] = &[0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10, 0x4a, 0x46, 0x49, 0x46];

    #[test]
    fn png_is_detected() {
        let result = sniff(PNG_HEADER);
        assert_eq!(result.mime_type, "image/png");
        assert_eq!(result.extension, "png");
    }

    #[test]
    fn jpeg_always_maps_to_jpg() {
        let result = sniff(JPEG_HEADER);
        assert_eq!(result.mime_type, "image/jpeg");
        assert_eq!(result.extension, "jpg");
        assert_eq!(canonical_extension("image/jpeg"), "jpg");
    }

    #[test]
    fn unknown_content_falls_back_to_bin() {
        assert_eq!(sniff(b"just some words").extension, "bin");
        assert_eq!(sniff(&[]).extension, "bin");
        assert_eq!(sniff(&[b'a'; 2048]).mime_type, FALLBACK_MIME);
    }

    #[test]
    fn unregistered_mime_falls_back_to_bin() {
        assert_eq!(canonical_extension("application/x-not-a-real-type"), "bin");
    }

    #[test]
    fn only_leading_bytes_are_inspected() {
        let mut content = vec![b'a'; SNIFF_LEN];
        content.extend_from_slice(PNG_HEADER);
        assert_eq!(sniff(&content).extension, "bin");
    }
}
