// 云盘 API 数据类型
//
// 服务端所有响应均为 JSON；时间字段为 ISO-8601 字符串，
// 反序列化时统一转换为 Unix 时间戳（秒）。

use crate::common::date::iso_8601_to_timestamp;
use crate::common::date::now_timestamp;
use serde::{Deserialize, Deserializer, Serialize};

/// 下载链接刷新安全余量（秒）
///
/// 距离链接过期不足该余量时视为已过期，必须重新获取
const URL_EXPIRE_MARGIN_SECS: i64 = 5;

fn de_iso8601_opt<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<String> = Option::deserialize(deserializer)?;
    Ok(s.as_deref().and_then(iso_8601_to_timestamp))
}

/// 从 URL query 中提取 `x-oss-expires` 过期时间戳
fn oss_expires_of(url: &str) -> Option<i64> {
    let re = regex::Regex::new(r"x-oss-expires=(\d+)").ok()?;
    let caps = re.captures(url)?;
    caps.get(1)?.as_str().parse().ok()
}

/// 判断带 `x-oss-expires` 的预签名链接是否已过期
///
/// 没有过期参数的链接按已过期处理，强制调用方重新获取
pub(crate) fn presigned_url_expired(url: &str) -> bool {
    match oss_expires_of(url) {
        Some(expire_at) => now_timestamp() >= expire_at - URL_EXPIRE_MARGIN_SECS,
        None => true,
    }
}

/// 文件/目录节点
///
/// 服务端响应不包含完整路径，`path` 由调用方在目录遍历时补写，
/// 除 `path` 与 `download_url` 刷新外构造后不再修改。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFile {
    /// 文件ID（服务端分配的稳定标识，根目录为 "root"）
    #[serde(default)]
    pub file_id: String,

    /// 文件名
    #[serde(default)]
    pub name: String,

    /// 父目录ID
    #[serde(default)]
    pub parent_file_id: String,

    /// 节点类型（"file" 或 "folder"）
    #[serde(default, rename = "type")]
    pub file_type: String,

    /// 文件大小（字节，目录为 0）
    #[serde(default)]
    pub size: u64,

    /// 远程绝对路径（客户端补写，服务端不返回）
    #[serde(default)]
    pub path: String,

    /// 服务器创建时间（Unix 秒）
    #[serde(default, deserialize_with = "de_iso8601_opt")]
    pub created_at: Option<i64>,

    /// 服务器修改时间（Unix 秒）
    #[serde(default, deserialize_with = "de_iso8601_opt")]
    pub updated_at: Option<i64>,

    /// 内容哈希（仅已知摘要的文件有）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,

    /// 内容哈希算法（通常为 "sha1"）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash_name: Option<String>,

    /// 下载链接（带 x-oss-expires 过期参数）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,

    /// 所属 drive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drive_id: Option<String>,

    /// 上传会话ID（创建文件响应中携带）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,

    /// 文件扩展名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_extension: Option<String>,

    /// 文件类别（image/video/doc 等）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    /// 节点状态
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl RemoteFile {
    /// 根目录哨兵节点
    ///
    /// 根节点没有 meta 信息，永远不会通过列表接口刷新
    pub fn root() -> Self {
        RemoteFile {
            file_id: "root".to_string(),
            name: String::new(),
            parent_file_id: "root".to_string(),
            file_type: "folder".to_string(),
            size: 0,
            path: "/".to_string(),
            created_at: None,
            updated_at: None,
            content_hash: None,
            content_hash_name: None,
            download_url: None,
            drive_id: None,
            upload_id: None,
            file_extension: None,
            category: None,
            status: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.file_id == "root"
    }

    /// 是否为目录
    pub fn is_dir(&self) -> bool {
        self.file_type == "folder"
    }

    /// 是否为文件
    pub fn is_file(&self) -> bool {
        self.file_type == "file"
    }

    /// 已缓存的下载链接是否过期（含 5 秒安全余量）
    pub fn download_url_expired(&self) -> bool {
        match self.download_url.as_deref() {
            Some(url) => presigned_url_expired(url),
            None => true,
        }
    }
}

/// 分片上传地址
#[derive(Debug, Clone, Deserialize)]
pub struct UploadUrl {
    /// 外网上传地址
    #[serde(default)]
    pub upload_url: String,

    /// 内网上传地址
    #[serde(default)]
    pub internal_upload_url: String,

    /// 分片序号（从 1 开始）
    #[serde(default)]
    pub part_number: u32,

    /// Content-Type（上传时需要原样携带）
    #[serde(default)]
    pub content_type: String,
}

impl UploadUrl {
    /// 预签名地址是否已过期
    pub fn is_expired(&self) -> bool {
        presigned_url_expired(&self.upload_url)
    }
}

/// 预创建文件响应（上传会话）
///
/// `part_info_list` 的长度等于请求时的 `part_number`，
/// 每个地址独立过期，过期后需携带 `upload_id` 重新获取。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreparedUpload {
    #[serde(default)]
    pub file_id: String,

    #[serde(default)]
    pub upload_id: String,

    #[serde(default)]
    pub file_name: String,

    #[serde(default)]
    pub parent_file_id: String,

    #[serde(default, rename = "type")]
    pub file_type: String,

    /// 是否秒传成功（服务端已有同内容文件）
    #[serde(default)]
    pub rapid_upload: bool,

    /// 服务端回显的 1KiB 前缀哈希；非空表示可以尝试秒传
    #[serde(default)]
    pub pre_hash: String,

    /// 分片上传地址列表（与 part_number 一一对应）
    #[serde(default)]
    pub part_info_list: Vec<UploadUrl>,

    #[serde(default)]
    pub drive_id: String,

    #[serde(default)]
    pub domain_id: String,

    #[serde(default)]
    pub encrypt_mode: String,

    #[serde(default)]
    pub location: String,
}

impl PreparedUpload {
    /// 服务端是否提示可尝试秒传（完整内容哈希校验）
    pub fn can_rapid_upload(&self) -> bool {
        !self.pre_hash.is_empty()
    }

    /// 是否已秒传完成
    pub fn is_rapid_upload(&self) -> bool {
        self.rapid_upload
    }

    /// 提取分片上传地址（按 part 顺序）
    pub fn upload_urls(&self) -> Vec<String> {
        self.part_info_list
            .iter()
            .map(|p| p.upload_url.clone())
            .filter(|u| !u.is_empty())
            .collect()
    }
}

/// 本人创建的分享链接
#[derive(Debug, Clone, Deserialize)]
pub struct SharedLink {
    #[serde(default)]
    pub share_id: String,

    #[serde(default)]
    pub share_url: String,

    #[serde(default)]
    pub share_name: String,

    #[serde(default)]
    pub file_id: String,

    #[serde(default)]
    pub file_id_list: Vec<String>,

    /// 提取码（空串表示无密码）
    #[serde(default)]
    pub share_pwd: String,

    /// 过期时间（Unix 秒，None 表示永久）
    #[serde(default, deserialize_with = "de_iso8601_opt")]
    pub expiration: Option<i64>,

    #[serde(default)]
    pub expired: bool,

    #[serde(default, deserialize_with = "de_iso8601_opt")]
    pub created_at: Option<i64>,

    #[serde(default, deserialize_with = "de_iso8601_opt")]
    pub updated_at: Option<i64>,

    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub preview_count: u64,

    #[serde(default)]
    pub save_count: u64,

    #[serde(default)]
    pub download_count: u64,
}

impl SharedLink {
    pub fn has_password(&self) -> bool {
        !self.share_pwd.is_empty()
    }
}

/// 任意用户可见的分享链接信息
#[derive(Debug, Clone, Deserialize)]
pub struct SharedLinkInfo {
    #[serde(default)]
    pub share_id: String,

    #[serde(default)]
    pub share_name: String,

    #[serde(default)]
    pub display_name: String,

    #[serde(default)]
    pub file_count: u64,

    #[serde(default, deserialize_with = "de_iso8601_opt")]
    pub expiration: Option<i64>,

    #[serde(default, deserialize_with = "de_iso8601_opt")]
    pub updated_at: Option<i64>,

    #[serde(default)]
    pub creator_id: String,

    #[serde(default)]
    pub creator_name: String,
}

impl SharedLinkInfo {
    pub fn share_url(&self) -> String {
        format!("https://www.alipan.com/s/{}", self.share_id)
    }
}

/// 分享链接的短时访问凭证
#[derive(Debug, Clone)]
pub struct SharedAuth {
    pub share_id: String,
    pub share_password: String,
    pub share_token: String,
    /// 过期时间（Unix 秒）
    pub expire_time: i64,
}

impl SharedAuth {
    pub fn is_expired(&self) -> bool {
        now_timestamp() >= self.expire_time
    }
}

/// 限速信息
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimit {
    #[serde(default)]
    pub part_speed: u64,

    #[serde(default)]
    pub part_size: u64,
}

/// 下载链接响应
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadUrlInfo {
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub internal_url: String,

    #[serde(default)]
    pub cdn_url: String,

    #[serde(default)]
    pub size: u64,

    #[serde(default)]
    pub method: String,

    #[serde(default, deserialize_with = "de_iso8601_opt")]
    pub expiration: Option<i64>,

    #[serde(default)]
    pub ratelimit: RateLimit,
}

/// 网盘空间信息
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PcsSpace {
    #[serde(default)]
    pub used_size: u64,

    #[serde(default)]
    pub total_size: u64,
}

/// 用户信息
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PcsUser {
    #[serde(default)]
    pub user_id: String,

    #[serde(default)]
    pub user_name: String,

    #[serde(default)]
    pub nick_name: String,

    #[serde(default)]
    pub default_drive_id: String,

    #[serde(default)]
    pub phone: String,

    #[serde(default)]
    pub role: String,

    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub personal_space_info: PcsSpace,
}

/// 文件列表/搜索的一页结果
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileListPage {
    #[serde(default)]
    pub items: Vec<RemoteFile>,

    /// 翻页标记（原样传回下一次请求，空串表示没有下一页）
    #[serde(default)]
    pub next_marker: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_file_from_json() {
        let info = serde_json::json!({
            "file_id": "63e2e4fd9d1",
            "name": "demo.txt",
            "parent_file_id": "root",
            "type": "file",
            "size": 5,
            "created_at": "2021-06-01T07:24:18.521Z",
            "updated_at": "2021-06-02T07:24:18.521Z",
            "content_hash": "AAF4C61DDCC5E8A2DABEDE0F3B482CD9AEA9434D",
            "content_hash_name": "sha1"
        });
        let pf: RemoteFile = serde_json::from_value(info).unwrap();
        assert!(pf.is_file());
        assert!(!pf.is_dir());
        assert_eq!(pf.size, 5);
        assert_eq!(pf.created_at, Some(1622532258));
        assert_eq!(pf.content_hash.as_deref(), Some("AAF4C61DDCC5E8A2DABEDE0F3B482CD9AEA9434D"));
        // path 由调用方补写
        assert_eq!(pf.path, "");
    }

    #[test]
    fn test_root_sentinel() {
        let root = RemoteFile::root();
        assert!(root.is_root());
        assert!(root.is_dir());
        assert!(!root.is_file());
        assert_eq!(root.path, "/");
        assert_eq!(root.size, 0);
    }

    #[test]
    fn test_type_tag_exclusive() {
        let folder: RemoteFile =
            serde_json::from_value(serde_json::json!({"file_id": "x", "type": "folder"})).unwrap();
        assert!(folder.is_dir() && !folder.is_file());
        let file: RemoteFile =
            serde_json::from_value(serde_json::json!({"file_id": "y", "type": "file"})).unwrap();
        assert!(file.is_file() && !file.is_dir());
    }

    #[test]
    fn test_download_url_expiry() {
        let future = now_timestamp() + 3600;
        let fresh = format!("https://cn-beijing-data.alipan.com/x?x-oss-expires={}&v=1", future);
        assert!(!presigned_url_expired(&fresh));

        let past = now_timestamp() - 10;
        let stale = format!("https://cn-beijing-data.alipan.com/x?x-oss-expires={}", past);
        assert!(presigned_url_expired(&stale));

        // 过期前 5 秒以内视为过期
        let edge = format!("https://x/y?x-oss-expires={}", now_timestamp() + 2);
        assert!(presigned_url_expired(&edge));

        // 无过期参数的链接按过期处理
        assert!(presigned_url_expired("https://x/y?sig=abc"));
    }

    #[test]
    fn test_prepared_upload() {
        let info = serde_json::json!({
            "file_id": "f1",
            "upload_id": "u1",
            "pre_hash": "da39a3ee5e6b4b0d3255bfef95601890afd80709",
            "part_info_list": [
                {"upload_url": "https://oss/p1?x-oss-expires=9999999999", "part_number": 1},
                {"upload_url": "https://oss/p2?x-oss-expires=9999999999", "part_number": 2}
            ]
        });
        let prepared: PreparedUpload = serde_json::from_value(info).unwrap();
        assert!(prepared.can_rapid_upload());
        assert!(!prepared.is_rapid_upload());
        assert_eq!(prepared.upload_urls().len(), 2);
        assert!(!prepared.part_info_list[0].is_expired());
    }

    #[test]
    fn test_shared_link_password() {
        let link: SharedLink = serde_json::from_value(serde_json::json!({
            "share_id": "s1",
            "share_url": "https://www.alipan.com/s/abc",
            "share_pwd": "1a2b"
        }))
        .unwrap();
        assert!(link.has_password());
    }
}
