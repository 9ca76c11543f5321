// 时间工具

use chrono::{DateTime, Utc};

/// 当前 Unix 时间戳（秒）
pub fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// ISO-8601 时间字符串转 Unix 时间戳（秒）
///
/// 服务端返回形如 `2021-06-01T07:24:18.521Z` 的时间
pub fn iso_8601_to_timestamp(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp())
}

/// Unix 时间戳转 ISO-8601 字符串（分享过期时间等请求字段使用）
pub fn timestamp_to_iso_8601(ts: i64) -> String {
    match DateTime::<Utc>::from_timestamp(ts, 0) {
        Some(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_8601_roundtrip() {
        let ts = iso_8601_to_timestamp("2021-06-01T07:24:18.521Z").unwrap();
        assert_eq!(ts, 1622532258);
        let s = timestamp_to_iso_8601(1622532258);
        assert!(s.starts_with("2021-06-01T07:24:18"));
    }

    #[test]
    fn test_iso_8601_invalid() {
        assert!(iso_8601_to_timestamp("not-a-date").is_none());
        assert!(iso_8601_to_timestamp("").is_none());
    }
}
