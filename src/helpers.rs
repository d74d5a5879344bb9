use crate::header::Header;

/// Logs at debug level when the `log` feature is enabled; compiles to nothing otherwise.
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        #[cfg(feature = "log")]
        log::debug!($($arg)*);
        #[cfg(not(feature = "log"))]
        {
            let _ = format_args!($($arg)*);
        }
    }};
}

/// Logs at error level when the `log` feature is enabled; compiles to nothing otherwise.
macro_rules! log_error {
    ($($arg:tt)*) => {{
        #[cfg(feature = "log")]
        log::error!($($arg)*);
        #[cfg(not(feature = "log"))]
        {
            let _ = format_args!($($arg)*);
        }
    }};
}

pub(crate) use {log_debug, log_error};

/// Normalizes a content ID: trims it, strips one pair of enclosing angle brackets and a stray
/// `cid:` prefix some broken implementations add.
pub(crate) fn normalize_content_id(content_id: &str) -> String {
    let mut content_id = content_id.trim();
    if content_id.len() >= 2 && content_id.starts_with('<') && content_id.ends_with('>') {
        content_id = &content_id[1..content_id.len() - 1];
    }
    if content_id.len() > 4 && content_id.starts_with("cid:") {
        content_id = &content_id[4..];
    }
    content_id.to_owned()
}

pub(crate) fn convert_raw_headers(raw_headers: &[httparse::Header]) -> Vec<Header> {
    raw_headers
        .iter()
        .map(|raw| Header::new(raw.name, String::from_utf8_lossy(raw.value).trim()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_content_id() {
        assert_eq!(normalize_content_id("<root@example.org>"), "root@example.org");
        assert_eq!(normalize_content_id("  <root@example.org> "), "root@example.org");
        assert_eq!(normalize_content_id("cid:root@example.org"), "root@example.org");
        assert_eq!(normalize_content_id("<cid:root@example.org>"), "root@example.org");
        assert_eq!(normalize_content_id("CID:root@example.org"), "CID:root@example.org");
        assert_eq!(normalize_content_id("cid:"), "cid:");
        assert_eq!(normalize_content_id("<>"), "");
        assert_eq!(normalize_content_id("<<a>>"), "<a>");
    }
}
