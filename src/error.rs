// 错误类型定义
//
// 服务端以字符串错误码（如 "AccessTokenInvalid"、"NotFound.File"）标识失败，
// 原始客户端层总是抛出带错误码的 AliPcsError，由上层包装层决定
// 哪些错误码转换为 None（NotFound.*）、哪些触发重试。

use thiserror::Error;

/// 阿里云盘客户端错误
#[derive(Debug, Error)]
pub enum AliPcsError {
    /// 服务端返回的业务错误（携带原始错误码与响应内容）
    #[error("服务端错误 {code}: {message}")]
    Api { code: String, message: String },

    /// 网络/传输层错误
    #[error("网络请求失败: {0}")]
    Network(#[from] reqwest::Error),

    /// 本地 I/O 错误
    #[error("本地 I/O 失败: {0}")]
    Io(#[from] std::io::Error),

    /// 响应内容解析失败
    #[error("响应解析失败: {0}")]
    Parse(#[from] serde_json::Error),

    /// 上传完成后本地与远端内容哈希不一致（不可重试）
    #[error("内容哈希不一致: local sha1 ({local}) != remote sha1 ({remote})")]
    HashMismatch { local: String, remote: String },

    /// 分片上传地址已过期且刷新失败
    #[error("上传会话已失效: upload_id={upload_id}")]
    UploadExpired { upload_id: String },

    /// 加解密失败（密码错误或内容被篡改）
    #[error("加解密失败: {0}")]
    Crypto(String),

    /// 其他不变式被破坏
    #[error("{0}")]
    Invalid(String),
}

impl AliPcsError {
    /// 由服务端响应构造业务错误
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        AliPcsError::Api {
            code: code.into(),
            message: message.into(),
        }
    }

    /// 服务端错误码（仅业务错误携带）
    pub fn error_code(&self) -> Option<&str> {
        match self {
            AliPcsError::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    /// 是否为 "NotFound.*" 类错误（包装层将其转换为 None）
    pub fn is_not_found(&self) -> bool {
        matches!(self, AliPcsError::Api { code, .. } if code.starts_with("NotFound"))
    }

    /// 是否为分享链接不可用类错误
    pub fn is_share_invalid(&self) -> bool {
        matches!(
            self,
            AliPcsError::Api { code, .. }
                if code == "ShareLink.Forbidden"
                    || code == "ShareLink.Cancelled"
                    || code == "ShareLink.Expired"
        )
    }
}

pub type PcsResult<T> = Result<T, AliPcsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_prefix() {
        assert!(AliPcsError::api("NotFound.File", "").is_not_found());
        assert!(AliPcsError::api("NotFound.UploadId", "").is_not_found());
        assert!(!AliPcsError::api("AccessTokenInvalid", "").is_not_found());
    }

    #[test]
    fn test_share_invalid_codes() {
        assert!(AliPcsError::api("ShareLink.Expired", "").is_share_invalid());
        assert!(!AliPcsError::api("ShareLink.Unknown", "").is_share_invalid());
    }

    #[test]
    fn test_error_code() {
        let err = AliPcsError::api("TooManyRequests", "limited");
        assert_eq!(err.error_code(), Some("TooManyRequests"));
        let err = AliPcsError::Invalid("x".into());
        assert_eq!(err.error_code(), None);
    }
}
