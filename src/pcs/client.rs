// 云盘原始客户端实现
//
// 本层只负责发请求、鉴权刷新与瞬时错误重试，返回原始 JSON；
// 解析成类型化结构由上层 api 模块完成。
//
// 重试契约：
// - AccessTokenInvalid        -> 刷新 token 后重试一次（刷新经互斥锁串行化）
// - ShareLinkTokenInvalid     -> 失效对应分享的缓存凭证后重试
// - DeviceSessionSignatureInvalid -> 清空设备签名（下次请求重新握手）后重试
// - TooManyRequests           -> 固定退避 10 秒后重试
// 其余非空错误码一律转为 AliPcsError::Api 抛给上层。

use crate::common::date::{iso_8601_to_timestamp, now_timestamp, timestamp_to_iso_8601};
use crate::error::{AliPcsError, PcsResult};
use crate::pcs::types::SharedAuth;
use dashmap::DashMap;
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 客户端应用ID（Web 端）
pub const APP_ID: &str = "5dde4e1bdf9e4966b387ba58f4b3fdc3";

/// API 基地址
pub const PCS_API_HOST: &str = "https://api.aliyundrive.com";

/// 模拟浏览器 User-Agent
pub const PCS_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_14_6) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/77.0.3865.75 Safari/537.36";

/// 限流退避时长（秒）
const RATE_LIMIT_BACKOFF_SECS: u64 = 10;

/// 访问令牌提前刷新余量（秒）
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60 * 60;

/// 同名冲突处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckNameMode {
    /// 直接覆盖
    Overwrite,
    /// 自动换一个随机名称
    AutoRename,
    /// 不创建，返回已存在
    Refuse,
    /// 允许创建重名文件
    Ignore,
}

impl CheckNameMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckNameMode::Overwrite => "overwrite",
            CheckNameMode::AutoRename => "auto_rename",
            CheckNameMode::Refuse => "refuse",
            CheckNameMode::Ignore => "ignore",
        }
    }
}

/// API 节点
#[derive(Debug, Clone, Copy)]
pub(crate) enum PcsNode {
    Refresh,
    CreateSession,
    FileList,
    Meta,
    Search,
    DownloadUrl,
    CreateWithFolders,
    GetUploadUrl,
    UploadComplete,
    Batch,
    FileUpdate,
    ShareAvailable,
    ShareCreate,
    ShareToken,
    SharedInfo,
    SharedList,
    SharedFileDownloadUrl,
    PersonalInfo,
    User,
}

impl PcsNode {
    fn path(&self) -> &'static str {
        match self {
            PcsNode::Refresh => "token/refresh",
            PcsNode::CreateSession => "users/v1/users/device/create_session",
            PcsNode::FileList => "adrive/v3/file/list",
            PcsNode::Meta => "v2/file/get",
            PcsNode::Search => "adrive/v3/file/search",
            PcsNode::DownloadUrl => "v2/file/get_download_url",
            PcsNode::CreateWithFolders => "adrive/v2/file/createWithFolders",
            PcsNode::GetUploadUrl => "v2/file/get_upload_url",
            PcsNode::UploadComplete => "v2/file/complete",
            PcsNode::Batch => "v3/batch",
            PcsNode::FileUpdate => "v3/file/update",
            PcsNode::ShareAvailable => "adrive/v2/share_link/check_avaliable",
            PcsNode::ShareCreate => "adrive/v2/share_link/create",
            PcsNode::ShareToken => "v2/share_link/get_share_token",
            PcsNode::SharedInfo => "adrive/v3/share_link/get_share_by_anonymous",
            PcsNode::SharedList => "adrive/v3/share_link/list",
            PcsNode::SharedFileDownloadUrl => "v2/file/get_share_link_download_url",
            PcsNode::PersonalInfo => "v2/databox/get_personal_info",
            PcsNode::User => "v2/user/get",
        }
    }

    fn url(&self, host: &str) -> String {
        format!("{}/{}", host, self.path())
    }
}

/// 鉴权凭证（账户存储层持久化的就是这份数据）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub refresh_token: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    /// 访问令牌过期时间（Unix 秒）
    #[serde(default)]
    pub expire_time: i64,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub nick_name: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub default_drive_id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub status: String,
}

impl Credentials {
    pub fn from_refresh_token(refresh_token: impl Into<String>) -> Self {
        Credentials {
            refresh_token: refresh_token.into(),
            ..Default::default()
        }
    }

    /// 访问令牌是否需要刷新（缺失或临近过期）
    fn needs_refresh(&self) -> bool {
        self.access_token.is_empty()
            || now_timestamp() >= self.expire_time - TOKEN_REFRESH_MARGIN_SECS
    }
}

/// 分享凭证缓存
///
/// 显式对象，由构造方注入客户端，生命周期随客户端实例，
/// 不同客户端/测试之间互不干扰。
#[derive(Debug, Default)]
pub struct ShareTokenCache {
    auths: DashMap<String, SharedAuth>,
}

impl ShareTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取未过期的缓存凭证
    pub fn get(&self, share_id: &str) -> Option<SharedAuth> {
        let auth = self.auths.get(share_id)?;
        if auth.is_expired() {
            None
        } else {
            Some(auth.clone())
        }
    }

    pub fn insert(&self, auth: SharedAuth) {
        self.auths.insert(auth.share_id.clone(), auth);
    }

    /// 使指定分享的凭证立即失效
    pub fn invalidate(&self, share_id: &str) {
        if let Some(mut auth) = self.auths.get_mut(share_id) {
            auth.expire_time = 0;
        }
    }

    /// 缓存中保存过的提取码（刷新凭证时复用）
    pub fn password_of(&self, share_id: &str) -> Option<String> {
        self.auths.get(share_id).map(|a| a.share_password.clone())
    }
}

/// 每次请求的附加选项
///
/// 命中 ShareLinkTokenInvalid 时要失效哪个分享，由调用点显式声明。
#[derive(Debug, Clone, Default)]
pub(crate) struct RequestOpts {
    /// 本调用关联的分享ID（失效与 x-share-token 均据此处理）
    pub share_id: Option<String>,
    /// 是否携带 x-device-id / x-signature 设备会话头
    pub device_session: bool,
}

impl RequestOpts {
    pub fn with_share(share_id: Option<&str>) -> Self {
        RequestOpts {
            share_id: share_id.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    pub fn device() -> Self {
        RequestOpts {
            device_session: true,
            ..Default::default()
        }
    }
}

/// 阿里云盘原始客户端
///
/// Clone 后共享同一份凭证与缓存，token 刷新在克隆之间串行化。
#[derive(Debug, Clone)]
pub struct AliPcs {
    /// HTTP客户端
    client: reqwest::Client,
    /// API 基地址（测试时可替换）
    host: String,
    /// 鉴权凭证（互斥锁保证刷新不并发）
    credentials: Arc<Mutex<Credentials>>,
    /// 设备会话签名（懒创建，失效后清空重新握手）
    signature: Arc<Mutex<Option<String>>>,
    /// 设备会话 nonce
    nonce: Arc<std::sync::atomic::AtomicU64>,
    /// 分享凭证缓存
    share_cache: Arc<ShareTokenCache>,
}

impl AliPcs {
    /// 创建客户端
    pub fn new(credentials: Credentials) -> PcsResult<Self> {
        Self::with_share_cache(credentials, Arc::new(ShareTokenCache::new()))
    }

    /// 创建客户端并注入外部分享凭证缓存
    pub fn with_share_cache(
        credentials: Credentials,
        share_cache: Arc<ShareTokenCache>,
    ) -> PcsResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(PCS_UA)
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            host: PCS_API_HOST.to_string(),
            credentials: Arc::new(Mutex::new(credentials)),
            signature: Arc::new(Mutex::new(None)),
            nonce: Arc::new(std::sync::atomic::AtomicU64::new(0)),
            share_cache,
        })
    }

    /// 替换 API 基地址（测试用）
    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = host.into();
    }

    pub fn share_cache(&self) -> Arc<ShareTokenCache> {
        Arc::clone(&self.share_cache)
    }

    /// 当前凭证快照（账户持久化用）
    pub async fn credentials(&self) -> Credentials {
        self.credentials.lock().await.clone()
    }

    /// 取有效的访问令牌（必要时刷新）
    pub async fn access_token(&self) -> PcsResult<String> {
        let creds = self.fresh_credentials().await?;
        Ok(creds.access_token)
    }

    pub async fn default_drive_id(&self) -> PcsResult<String> {
        let creds = self.fresh_credentials().await?;
        Ok(creds.default_drive_id)
    }

    pub async fn user_id(&self) -> PcsResult<String> {
        let creds = self.fresh_credentials().await?;
        Ok(creds.user_id)
    }

    /// 确保凭证有效并返回快照
    ///
    /// 互斥锁保证同一账户的并发调用只触发一次刷新
    async fn fresh_credentials(&self) -> PcsResult<Credentials> {
        let mut creds = self.credentials.lock().await;
        if creds.needs_refresh() {
            self.refresh_locked(&mut creds).await?;
        }
        Ok(creds.clone())
    }

    /// 强制刷新访问令牌
    pub async fn refresh(&self) -> PcsResult<()> {
        let mut creds = self.credentials.lock().await;
        self.refresh_locked(&mut creds).await
    }

    async fn refresh_locked(&self, creds: &mut Credentials) -> PcsResult<()> {
        info!("刷新访问令牌");

        let url = PcsNode::Refresh.url(&self.host);
        let body = json!({ "refresh_token": creds.refresh_token });
        let resp = self.client.post(&url).json(&body).send().await?;
        let info: Value = resp.json().await?;

        if let Some(code) = info.get("code").and_then(|c| c.as_str()) {
            warn!("刷新访问令牌失败: code={}", code);
            return Err(AliPcsError::api(code, info.to_string()));
        }

        creds.user_id = str_field(&info, "user_id");
        creds.user_name = str_field(&info, "user_name");
        creds.nick_name = str_field(&info, "nick_name");
        creds.refresh_token = str_field(&info, "refresh_token");
        creds.access_token = str_field(&info, "access_token");
        creds.token_type = str_field(&info, "token_type");
        creds.device_id = str_field(&info, "device_id");
        creds.default_drive_id = str_field(&info, "default_drive_id");
        creds.role = str_field(&info, "role");
        creds.status = str_field(&info, "status");
        creds.expire_time = info
            .get("expire_time")
            .and_then(|v| v.as_str())
            .and_then(iso_8601_to_timestamp)
            .unwrap_or_else(|| now_timestamp() + 7200);

        info!(
            "刷新访问令牌成功: user_id={}, expire_time={}",
            creds.user_id, creds.expire_time
        );
        Ok(())
    }

    /// 设备会话握手
    ///
    /// 生成一次性密钥对，对 `{app_id}:{device_id}:{user_id}:{nonce}` 签名，
    /// 握手成功后缓存签名供后续请求携带。
    pub async fn create_session(&self) -> PcsResult<String> {
        let creds = self.fresh_credentials().await?;
        if creds.device_id.is_empty() || creds.user_id.is_empty() {
            return Err(AliPcsError::Invalid(
                "设备会话握手需要 device_id 与 user_id".to_string(),
            ));
        }

        let nonce = self.nonce.load(std::sync::atomic::Ordering::SeqCst);
        let message = format!("{}:{}:{}:{}", APP_ID, creds.device_id, creds.user_id, nonce);

        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let sign = format!("{}00", hex::encode(signing_key.sign(message.as_bytes()).to_bytes()));
        let pub_key = hex::encode(signing_key.verifying_key().to_bytes());

        let url = PcsNode::CreateSession.url(&self.host);
        let body = json!({
            "deviceName": "Chrome浏览器",
            "modelName": "Windows网页版",
            "pubKey": pub_key,
        });

        let resp = self
            .client
            .post(&url)
            .header("Authorization", self.authorization(&creds))
            .header("x-device-id", &creds.device_id)
            .header("x-signature", &sign)
            .json(&body)
            .send()
            .await?;
        let info: Value = resp.json().await?;

        let ok = info.get("result").and_then(|v| v.as_bool()).unwrap_or(false)
            && info.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
        if !ok {
            let code = str_field(&info, "code");
            warn!("设备会话握手失败: {}", info);
            return Err(AliPcsError::api(
                if code.is_empty() { "DeviceSessionFailed".to_string() } else { code },
                info.to_string(),
            ));
        }

        let mut cached = self.signature.lock().await;
        *cached = Some(sign.clone());
        info!("设备会话握手成功");
        Ok(sign)
    }

    /// 取设备签名（没有则先握手）
    async fn signature(&self) -> PcsResult<String> {
        {
            let cached = self.signature.lock().await;
            if let Some(sign) = cached.as_ref() {
                return Ok(sign.clone());
            }
        }
        self.create_session().await
    }

    async fn clear_signature(&self) {
        let mut cached = self.signature.lock().await;
        *cached = None;
    }

    fn authorization(&self, creds: &Credentials) -> String {
        let token_type = if creds.token_type.is_empty() {
            "Bearer"
        } else {
            &creds.token_type
        };
        format!("{} {}", token_type, creds.access_token)
    }

    /// 取分享访问凭证（优先走缓存）
    pub async fn share_token(&self, share_id: &str, share_password: &str) -> PcsResult<String> {
        if let Some(auth) = self.share_cache.get(share_id) {
            return Ok(auth.share_token);
        }

        // 刷新时复用之前保存的提取码
        let password = if share_password.is_empty() {
            self.share_cache.password_of(share_id).unwrap_or_default()
        } else {
            share_password.to_string()
        };

        let url = PcsNode::ShareToken.url(&self.host);
        let creds = self.fresh_credentials().await?;
        let body = json!({ "share_id": share_id, "share_pwd": password });
        let resp = self
            .client
            .post(&url)
            .header("Authorization", self.authorization(&creds))
            .json(&body)
            .send()
            .await?;
        let info: Value = resp.json().await?;

        if let Some(code) = info.get("code").and_then(|c| c.as_str()) {
            return Err(AliPcsError::api(code, info.to_string()));
        }

        let token = str_field(&info, "share_token");
        if token.is_empty() {
            return Err(AliPcsError::Invalid(format!(
                "分享凭证响应缺少 share_token: {}",
                info
            )));
        }

        let expire_time = info
            .get("expire_time")
            .and_then(|v| v.as_str())
            .and_then(iso_8601_to_timestamp)
            .unwrap_or_else(|| {
                now_timestamp() + info.get("expires_in").and_then(|v| v.as_i64()).unwrap_or(7200)
            });

        self.share_cache.insert(SharedAuth {
            share_id: share_id.to_string(),
            share_password: password,
            share_token: token.clone(),
            expire_time,
        });

        Ok(token)
    }

    /// 统一 POST 入口：鉴权 + 瞬时错误重试
    pub(crate) async fn post(
        &self,
        node: PcsNode,
        body: Value,
        opts: RequestOpts,
    ) -> PcsResult<Value> {
        let url = node.url(&self.host);
        let mut last_code = String::new();

        for attempt in 0..2u32 {
            let creds = self.fresh_credentials().await?;
            let mut req = self
                .client
                .post(&url)
                .header("Authorization", self.authorization(&creds))
                .header("Content-Type", "application/json;charset=UTF-8");

            if opts.device_session {
                let sign = self.signature().await?;
                req = req
                    .header("x-device-id", &creds.device_id)
                    .header("x-signature", sign);
            }

            if let Some(share_id) = &opts.share_id {
                let token = self.share_token(share_id, "").await?;
                req = req.header("x-share-token", token);
            }

            let resp = req.json(&body).send().await?;
            let info: Value = resp.json().await?;

            let code = match info.get("code").and_then(|c| c.as_str()) {
                Some(c) if !c.is_empty() => c.to_string(),
                _ => return Ok(info),
            };

            debug!(
                "请求返回错误码: node={}, code={}, attempt={}",
                node.path(),
                code,
                attempt
            );

            match code.as_str() {
                "AccessTokenInvalid" => {
                    self.refresh().await?;
                }
                "ShareLinkTokenInvalid" => {
                    // 调用点声明了本调用关联的分享，按声明失效
                    if let Some(share_id) = &opts.share_id {
                        self.share_cache.invalidate(share_id);
                    }
                }
                "DeviceSessionSignatureInvalid" => {
                    self.clear_signature().await;
                }
                "TooManyRequests" => {
                    warn!("触发限流，{} 秒后重试", RATE_LIMIT_BACKOFF_SECS);
                    tokio::time::sleep(Duration::from_secs(RATE_LIMIT_BACKOFF_SECS)).await;
                }
                _ => return Err(AliPcsError::api(code, info.to_string())),
            }
            last_code = code;
        }

        Err(AliPcsError::api(last_code, "重试后仍然失败"))
    }

    // =====================================================
    // 文件元数据与列表
    // =====================================================

    /// 取文件 meta 信息（"root" 没有 meta，调用方需先行短路）
    pub async fn meta(&self, file_id: &str, share_id: Option<&str>) -> PcsResult<Value> {
        debug_assert!(file_id != "root", "\"root\" 没有 meta 信息");

        let mut body = json!({ "file_id": file_id, "fields": "*" });
        match share_id {
            Some(sid) => body["share_id"] = json!(sid),
            None => body["drive_id"] = json!(self.default_drive_id().await?),
        }

        let mut opts = RequestOpts::with_share(share_id);
        opts.device_session = true;
        self.post(PcsNode::Meta, body, opts).await
    }

    /// 列目录一页
    pub async fn list(
        &self,
        file_id: &str,
        share_id: Option<&str>,
        order_by: &str,
        desc: bool,
        limit: u32,
        url_expire_sec: u32,
        next_marker: &str,
    ) -> PcsResult<Value> {
        debug_assert!(limit <= 200, "`limit` 不能超过 200");

        let mut body = json!({
            "all": false,
            "fields": "*",
            "limit": limit,
            "order_by": order_by,
            "order_direction": if desc { "DESC" } else { "ASC" },
            "parent_file_id": file_id,
            "url_expire_sec": url_expire_sec,
            "marker": next_marker,
        });
        match share_id {
            Some(sid) => body["share_id"] = json!(sid),
            None => body["drive_id"] = json!(self.default_drive_id().await?),
        }

        self.post(PcsNode::FileList, body, RequestOpts::with_share(share_id))
            .await
    }

    /// 按关键字搜索一页
    pub async fn search(
        &self,
        keyword: &str,
        order_by: &str,
        desc: bool,
        limit: u32,
        next_marker: &str,
    ) -> PcsResult<Value> {
        debug_assert!(limit <= 100, "`limit` 不能超过 100");

        let body = json!({
            "drive_id": self.default_drive_id().await?,
            "limit": limit,
            "order_by": format!("{} {}", order_by, if desc { "DESC" } else { "ASC" }),
            "query": format!("name match \"{}\"", keyword),
            "marker": next_marker,
        });
        self.post(PcsNode::Search, body, RequestOpts::default()).await
    }

    // =====================================================
    // 上传相关 API
    // =====================================================

    fn part_info_list(part_number: u32) -> Vec<Value> {
        (1..=part_number).map(|i| json!({ "part_number": i })).collect()
    }

    /// 创建/预创建文件
    ///
    /// - 带 `pre_hash`：预创建，服务端回告是否可秒传
    /// - 带 `content_hash` + `proof_code`：秒传请求
    /// - 都不带：普通创建，返回分片上传地址
    #[allow(clippy::too_many_arguments)]
    pub async fn create_file(
        &self,
        filename: &str,
        dir_id: &str,
        size: u64,
        pre_hash: &str,
        content_hash: &str,
        proof_code: &str,
        part_number: u32,
        check_name_mode: CheckNameMode,
    ) -> PcsResult<Value> {
        let body = json!({
            "drive_id": self.default_drive_id().await?,
            "part_info_list": Self::part_info_list(part_number),
            "parent_file_id": dir_id,
            "name": filename,
            "type": "file",
            "check_name_mode": check_name_mode.as_str(),
            "size": size,
            "pre_hash": pre_hash,
            "content_hash": content_hash,
            "content_hash_name": "sha1",
            "proof_code": proof_code,
            "proof_version": "v1",
        });
        self.post(PcsNode::CreateWithFolders, body, RequestOpts::default())
            .await
    }

    /// 为已有上传会话重新获取一批分片上传地址
    ///
    /// 预签名地址独立过期，过期后凭 `upload_id` 换新，会话本身不变
    pub async fn get_upload_url(
        &self,
        file_id: &str,
        upload_id: &str,
        part_number: u32,
    ) -> PcsResult<Value> {
        let body = json!({
            "drive_id": self.default_drive_id().await?,
            "file_id": file_id,
            "upload_id": upload_id,
            "part_info_list": Self::part_info_list(part_number),
        });
        self.post(PcsNode::GetUploadUrl, body, RequestOpts::default())
            .await
    }

    /// 向预签名地址上传一个分片
    ///
    /// 预签名地址自带鉴权，不能携带 Authorization 头
    pub async fn upload_slice(&self, data: Vec<u8>, url: &str) -> PcsResult<()> {
        let resp = self.client.put(url).body(data).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            // 预签名地址过期时 OSS 返回 403 + AccessDenied
            if status.as_u16() == 403 {
                return Err(AliPcsError::api(
                    "PreSignedUrlExpired",
                    format!("status={}, body={}", status, truncate(&body, 500)),
                ));
            }
            return Err(AliPcsError::api(
                format!("UploadSliceHttp{}", status.as_u16()),
                truncate(&body, 500).to_string(),
            ));
        }
        Ok(())
    }

    /// 通知服务端所有分片已上传，取回最终文件信息
    pub async fn upload_complete(&self, file_id: &str, upload_id: &str) -> PcsResult<Value> {
        let body = json!({
            "drive_id": self.default_drive_id().await?,
            "file_id": file_id,
            "upload_id": upload_id,
        });
        self.post(PcsNode::UploadComplete, body, RequestOpts::default())
            .await
    }

    // =====================================================
    // 目录与文件操作
    // =====================================================

    /// 创建目录
    pub async fn makedir(&self, dir_id: &str, name: &str) -> PcsResult<Value> {
        let body = json!({
            "check_name_mode": CheckNameMode::Refuse.as_str(),
            "drive_id": self.default_drive_id().await?,
            "name": name,
            "parent_file_id": dir_id,
            "type": "folder",
        });
        self.post(PcsNode::CreateWithFolders, body, RequestOpts::default())
            .await
    }

    /// 批量操作入口
    pub async fn batch_operate(
        &self,
        requests: Vec<Value>,
        resource: &str,
        share_id: Option<&str>,
    ) -> PcsResult<Value> {
        let body = json!({ "resource": resource, "requests": requests });
        self.post(PcsNode::Batch, body, RequestOpts::with_share(share_id))
            .await
    }

    /// 移动文件到目标目录
    pub async fn move_files(&self, source_ids: &[String], dest_id: &str) -> PcsResult<Value> {
        let drive_id = self.default_drive_id().await?;
        let requests = source_ids
            .iter()
            .map(|source_id| {
                json!({
                    "method": "POST",
                    "url": "/file/move",
                    "id": source_id,
                    "headers": { "Content-Type": "application/json" },
                    "body": {
                        "drive_id": drive_id,
                        "to_drive_id": drive_id,
                        "file_id": source_id,
                        "to_parent_file_id": dest_id,
                    },
                })
            })
            .collect();
        self.batch_operate(requests, "file", None).await
    }

    /// 重命名
    pub async fn rename(&self, file_id: &str, name: &str) -> PcsResult<Value> {
        let body = json!({
            "check_name_mode": CheckNameMode::Refuse.as_str(),
            "drive_id": self.default_drive_id().await?,
            "file_id": file_id,
            "name": name,
        });
        self.post(PcsNode::FileUpdate, body, RequestOpts::default())
            .await
    }

    /// 复制文件到目标目录
    pub async fn copy_files(&self, file_ids: &[String], dest_id: &str) -> PcsResult<Value> {
        let drive_id = self.default_drive_id().await?;
        let requests = file_ids
            .iter()
            .map(|file_id| {
                json!({
                    "method": "POST",
                    "url": "/file/copy",
                    "id": file_id,
                    "headers": { "Content-Type": "application/json" },
                    "body": {
                        "drive_id": drive_id,
                        "file_id": file_id,
                        "to_parent_file_id": dest_id,
                        "overwrite": false,
                        "auto_rename": true,
                    },
                })
            })
            .collect();
        self.batch_operate(requests, "file", None).await
    }

    /// 删除（移入回收站）
    pub async fn remove(&self, file_ids: &[String]) -> PcsResult<Value> {
        let drive_id = self.default_drive_id().await?;
        let requests = file_ids
            .iter()
            .map(|file_id| {
                json!({
                    "method": "POST",
                    "url": "/recyclebin/trash",
                    "id": file_id,
                    "headers": { "Content-Type": "application/json" },
                    "body": { "drive_id": drive_id, "file_id": file_id },
                })
            })
            .collect();
        self.batch_operate(requests, "file", None).await
    }

    /// 检查一组文件是否可用
    pub async fn check_available(&self, file_ids: &[String]) -> PcsResult<Value> {
        let body = json!({
            "drive_id": self.default_drive_id().await?,
            "file_id_list": file_ids,
        });
        self.post(PcsNode::ShareAvailable, body, RequestOpts::default())
            .await
    }

    // =====================================================
    // 分享相关 API
    // =====================================================

    /// 创建分享链接
    ///
    /// `period` 为有效天数，0 表示永久
    pub async fn share(
        &self,
        file_ids: &[String],
        password: &str,
        period: u64,
        description: &str,
    ) -> PcsResult<Value> {
        let expiration = if period > 0 {
            timestamp_to_iso_8601(now_timestamp() + (period * 24 * 60 * 60) as i64)
        } else {
            String::new()
        };

        let body = json!({
            "drive_id": self.default_drive_id().await?,
            "expiration": expiration,
            "file_id_list": file_ids,
            "share_pwd": password,
            "description": description,
        });
        self.post(PcsNode::ShareCreate, body, RequestOpts::default())
            .await
    }

    /// 列出本人创建的分享（一页）
    pub async fn list_shared(&self, next_marker: &str) -> PcsResult<Value> {
        let body = json!({
            "creator": self.user_id().await?,
            "include_canceled": false,
            "order_by": "created_at",
            "order_direction": "DESC",
            "marker": next_marker,
        });
        self.post(PcsNode::SharedList, body, RequestOpts::default())
            .await
    }

    /// 取消分享
    pub async fn cancel_shared(&self, share_ids: &[String]) -> PcsResult<Value> {
        let requests = share_ids
            .iter()
            .map(|share_id| {
                json!({
                    "method": "POST",
                    "url": "/share_link/cancel",
                    "id": share_id,
                    "headers": { "Content-Type": "application/json" },
                    "body": { "share_id": share_id },
                })
            })
            .collect();
        self.batch_operate(requests, "file", None).await
    }

    /// 匿名查看分享信息
    pub async fn shared_info(&self, share_id: &str) -> PcsResult<Value> {
        let body = json!({ "share_id": share_id });
        let mut info = self
            .post(PcsNode::SharedInfo, body, RequestOpts::default())
            .await?;
        info["share_id"] = json!(share_id);
        Ok(info)
    }

    /// 转存分享中的文件到自己网盘
    pub async fn transfer_shared_files(
        &self,
        shared_file_ids: &[String],
        dest_id: &str,
        share_id: &str,
        auto_rename: bool,
    ) -> PcsResult<Value> {
        let drive_id = self.default_drive_id().await?;
        let requests = shared_file_ids
            .iter()
            .map(|file_id| {
                json!({
                    "method": "POST",
                    "url": "/file/copy",
                    "id": "0",
                    "headers": { "Content-Type": "application/json" },
                    "body": {
                        "auto_rename": auto_rename,
                        "file_id": file_id,
                        "share_id": share_id,
                        "to_drive_id": drive_id,
                        "to_parent_file_id": dest_id,
                    },
                })
            })
            .collect();
        self.batch_operate(requests, "file", Some(share_id)).await
    }

    /// 取分享文件的下载直链
    ///
    /// 接口返回的是中转地址，需再请求一次并取 Location 重定向目标
    pub async fn shared_file_download_url(
        &self,
        shared_file_id: &str,
        share_id: &str,
        expire_duration: u64,
    ) -> PcsResult<String> {
        let body = json!({
            "expire_sec": expire_duration,
            "file_id": shared_file_id,
            "share_id": share_id,
        });
        let info = self
            .post(
                PcsNode::SharedFileDownloadUrl,
                body,
                RequestOpts::with_share(Some(share_id)),
            )
            .await?;

        let url = str_field(&info, "url");
        if url.is_empty() {
            return Err(AliPcsError::Invalid(format!("下载直链响应缺少 url: {}", info)));
        }

        // 禁止自动重定向，从 Location 头取真实直链
        let no_redirect = reqwest::Client::builder()
            .user_agent(PCS_UA)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let resp = no_redirect
            .get(&url)
            .header("Referer", "https://www.alipan.com/")
            .send()
            .await?;

        match resp.headers().get("location").and_then(|v| v.to_str().ok()) {
            Some(location) => Ok(location.to_string()),
            None => Ok(url),
        }
    }

    /// 获取文件下载链接
    pub async fn download_link(&self, file_id: &str) -> PcsResult<Value> {
        let body = json!({
            "drive_id": self.default_drive_id().await?,
            "file_id": file_id,
        });
        self.post(PcsNode::DownloadUrl, body, RequestOpts::device())
            .await
    }

    /// 用户信息（个人信息 + 用户详情合并）
    pub async fn user_info(&self) -> PcsResult<Value> {
        let info1 = self
            .post(PcsNode::PersonalInfo, json!({}), RequestOpts::default())
            .await?;
        let mut info2 = self.post(PcsNode::User, json!({}), RequestOpts::default()).await?;

        if let (Some(merged), Some(extra)) = (info2.as_object_mut(), info1.as_object()) {
            for (k, v) in extra {
                merged.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        Ok(info2)
    }
}

fn str_field(info: &Value, key: &str) -> String {
    info.get(key).and_then(|v| v.as_str()).unwrap_or_default().to_string()
}

fn truncate(s: &str, limit: usize) -> &str {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
