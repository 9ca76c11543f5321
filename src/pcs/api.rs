// 云盘类型化接口
//
// 包装原始客户端：把 JSON 响应解析成类型化结构，维护路径解析缓存。
// "NotFound.*" 类错误只在这一层吸收为 None，原始客户端层永远抛错。

use crate::error::{AliPcsError, PcsResult};
use crate::pcs::client::{AliPcs, CheckNameMode};
use crate::pcs::path_tree::{ListDirectory, PathTree};
use crate::pcs::types::{
    DownloadUrlInfo, FileListPage, PreparedUpload, RemoteFile, SharedLink, SharedLinkInfo, PcsUser,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// 单页列表默认大小
const LIST_LIMIT: u32 = 100;

/// 列表响应中下载链接的有效期（秒）
const URL_EXPIRE_SEC: u32 = 7200;

/// 下载链接/下载流由哪个客户端提供
///
/// 原始客户端之外可以再挂一个（如开放平台凭证的）客户端，
/// 用显式策略切换，而不是继承覆盖。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkSource {
    /// 主客户端
    #[default]
    Primary,
    /// 备用客户端（未配置时回落主客户端）
    Secondary,
}

/// 目录列表数据源适配：把 AliPcs.list 接到 PathTree 上
struct DirLister {
    pcs: AliPcs,
    share_id: Option<String>,
}

#[async_trait]
impl ListDirectory for DirLister {
    async fn list_page(&self, file_id: &str, marker: &str) -> PcsResult<(Vec<RemoteFile>, String)> {
        let info = self
            .pcs
            .list(
                file_id,
                self.share_id.as_deref(),
                "name",
                false,
                LIST_LIMIT,
                URL_EXPIRE_SEC,
                marker,
            )
            .await?;
        let page: FileListPage = serde_json::from_value(info)?;
        Ok((page.items, page.next_marker))
    }
}

/// 阿里云盘类型化 API
pub struct AliPcsApi {
    pcs: AliPcs,
    /// 备用客户端（下载直链可切换到它）
    secondary: Option<AliPcs>,
    /// 下载直链来源策略
    link_source: LinkSource,
    /// 本人网盘的路径解析缓存
    path_tree: Arc<PathTree>,
    /// 每个分享一棵独立的路径树
    shared_trees: DashMap<String, Arc<PathTree>>,
}

impl AliPcsApi {
    pub fn new(pcs: AliPcs) -> Self {
        let lister = Arc::new(DirLister {
            pcs: pcs.clone(),
            share_id: None,
        });
        AliPcsApi {
            pcs,
            secondary: None,
            link_source: LinkSource::Primary,
            path_tree: Arc::new(PathTree::new(lister)),
            shared_trees: DashMap::new(),
        }
    }

    /// 挂载备用客户端并指定直链来源
    pub fn with_link_client(mut self, secondary: AliPcs, source: LinkSource) -> Self {
        self.secondary = Some(secondary);
        self.link_source = source;
        self
    }

    /// 原始客户端（上传引擎等需要直接访问）
    pub fn pcs(&self) -> &AliPcs {
        &self.pcs
    }

    /// 直链请求使用的客户端（显式策略选择）
    fn link_client(&self) -> &AliPcs {
        match (self.link_source, self.secondary.as_ref()) {
            (LinkSource::Secondary, Some(pcs)) => pcs,
            _ => &self.pcs,
        }
    }

    fn shared_tree(&self, share_id: &str) -> Arc<PathTree> {
        self.shared_trees
            .entry(share_id.to_string())
            .or_insert_with(|| {
                let lister = Arc::new(DirLister {
                    pcs: self.pcs.clone(),
                    share_id: Some(share_id.to_string()),
                });
                Arc::new(PathTree::new(lister))
            })
            .clone()
    }

    // =====================================================
    // 元数据
    // =====================================================

    /// 取单个文件的 meta（根目录短路为哨兵节点）
    pub async fn meta_one(&self, file_id: &str, share_id: Option<&str>) -> PcsResult<RemoteFile> {
        if file_id == "root" {
            return Ok(RemoteFile::root());
        }
        let info = self.pcs.meta(file_id, share_id).await?;
        Ok(serde_json::from_value(info)?)
    }

    /// 批量取 meta
    pub async fn meta(&self, file_ids: &[String]) -> PcsResult<Vec<RemoteFile>> {
        let mut files = Vec::with_capacity(file_ids.len());
        for file_id in file_ids {
            files.push(self.meta_one(file_id, None).await?);
        }
        Ok(files)
    }

    /// 文件是否存在（NotFound.* 在这一层吸收为 false）
    pub async fn exists(&self, file_id: &str) -> PcsResult<bool> {
        match self.meta_one(file_id, None).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn is_file(&self, file_id: &str) -> PcsResult<bool> {
        match self.meta_one(file_id, None).await {
            Ok(pf) => Ok(pf.is_file()),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn is_dir(&self, file_id: &str) -> PcsResult<bool> {
        match self.meta_one(file_id, None).await {
            Ok(pf) => Ok(pf.is_dir()),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    // =====================================================
    // 列表与搜索
    // =====================================================

    /// 列目录一页
    pub async fn list(
        &self,
        file_id: &str,
        share_id: Option<&str>,
        next_marker: &str,
    ) -> PcsResult<(Vec<RemoteFile>, String)> {
        let info = self
            .pcs
            .list(file_id, share_id, "name", false, LIST_LIMIT, URL_EXPIRE_SEC, next_marker)
            .await?;
        let page: FileListPage = serde_json::from_value(info)?;
        Ok((page.items, page.next_marker))
    }

    /// 列目录全部条目（翻完所有分页）
    pub async fn list_all(
        &self,
        file_id: &str,
        share_id: Option<&str>,
    ) -> PcsResult<Vec<RemoteFile>> {
        let mut files = Vec::new();
        let mut marker = String::new();
        loop {
            let (mut page, next) = self.list(file_id, share_id, &marker).await?;
            files.append(&mut page);
            if next.is_empty() {
                break;
            }
            marker = next;
        }
        Ok(files)
    }

    /// 递归遍历目录
    ///
    /// 显式工作栈携带每个待处理目录的完整路径，
    /// 产出的每个条目 `path` 都已补写完毕，之后不再改动。
    pub async fn walk(&self, file_id: &str, dir_path: &str) -> PcsResult<Vec<RemoteFile>> {
        let mut results = Vec::new();
        let mut pending: Vec<(String, String)> = vec![(file_id.to_string(), dir_path.to_string())];

        while let Some((dir_id, base)) = pending.pop() {
            for mut pf in self.list_all(&dir_id, None).await? {
                pf.path = crate::common::path::join_path(&base, &pf.name);
                if pf.is_dir() {
                    pending.push((pf.file_id.clone(), pf.path.clone()));
                }
                results.push(pf);
            }
        }
        Ok(results)
    }

    /// 按关键字搜索（翻完所有分页）
    pub async fn search_all(&self, keyword: &str) -> PcsResult<Vec<RemoteFile>> {
        let mut files = Vec::new();
        let mut marker = String::new();
        loop {
            let info = self.pcs.search(keyword, "name", false, LIST_LIMIT, &marker).await?;
            let page: FileListPage = serde_json::from_value(info)?;
            files.extend(page.items);
            if page.next_marker.is_empty() {
                break;
            }
            marker = page.next_marker;
        }
        Ok(files)
    }

    // =====================================================
    // 路径解析
    // =====================================================

    /// 按绝对路径取文件信息（走路径缓存树）
    pub async fn get_file(&self, remotepath: &str) -> PcsResult<Option<RemoteFile>> {
        self.path_tree.resolve(remotepath).await
    }

    /// 分享内按路径取文件信息
    pub async fn get_shared_file(
        &self,
        remotepath: &str,
        share_id: &str,
    ) -> PcsResult<Option<RemoteFile>> {
        self.shared_tree(share_id).resolve(remotepath).await
    }

    // =====================================================
    // 目录与文件操作（变更后同步失效缓存）
    // =====================================================

    /// 创建目录
    pub async fn makedir(&self, dir_id: &str, name: &str) -> PcsResult<RemoteFile> {
        let info = self.pcs.makedir(dir_id, name).await?;
        Ok(serde_json::from_value(info)?)
    }

    /// 按绝对路径逐级创建目录，返回最深一级
    pub async fn makedir_path(&self, remotedir: &str) -> PcsResult<RemoteFile> {
        let parts = crate::common::path::split_path(remotedir);
        let mut parent = RemoteFile::root();
        let mut now_path = String::from("/");

        for part in &parts {
            now_path = crate::common::path::join_path(&now_path, part);

            match self.path_tree.resolve(&now_path).await? {
                Some(pf) => {
                    if !pf.is_dir() {
                        return Err(AliPcsError::Invalid(format!("{} 是一个文件", now_path)));
                    }
                    parent = pf;
                }
                None => {
                    let mut pf = self.makedir(&parent.file_id, part).await?;
                    pf.path = now_path.clone();
                    info!("创建目录: {}", now_path);
                    parent = pf;
                }
            }
        }
        Ok(parent)
    }

    /// 移动文件到目标目录，返回每个源文件是否成功
    pub async fn move_files(&self, source_ids: &[String], dest_id: &str) -> PcsResult<Vec<bool>> {
        if self.is_file(dest_id).await? {
            return Err(AliPcsError::Invalid(
                "移动目标必须是目录".to_string(),
            ));
        }

        let info = self.pcs.move_files(source_ids, dest_id).await?;

        // 旧路径作废，强制下次解析重新列父目录
        for file_id in source_ids {
            self.path_tree.invalidate(file_id).await;
        }

        Ok(batch_ok_flags(&info))
    }

    /// 重命名
    pub async fn rename(&self, file_id: &str, name: &str) -> PcsResult<RemoteFile> {
        let info = self.pcs.rename(file_id, name).await?;
        self.path_tree.invalidate(file_id).await;
        Ok(serde_json::from_value(info)?)
    }

    /// 复制文件到目标目录
    pub async fn copy_files(&self, file_ids: &[String], dest_id: &str) -> PcsResult<Vec<RemoteFile>> {
        let info = self.pcs.copy_files(file_ids, dest_id).await?;
        let mut files = Vec::new();
        for resp in batch_bodies(&info) {
            files.push(serde_json::from_value(resp)?);
        }
        Ok(files)
    }

    /// 删除（移入回收站）
    pub async fn remove(&self, file_ids: &[String]) -> PcsResult<Vec<bool>> {
        let info = self.pcs.remove(file_ids).await?;
        for file_id in file_ids {
            self.path_tree.invalidate(file_id).await;
        }
        Ok(batch_ok_flags(&info))
    }

    // =====================================================
    // 上传相关
    // =====================================================

    /// 预创建文件（带 1KiB 前缀哈希，探测能否秒传）
    pub async fn prepare_file(
        &self,
        filename: &str,
        dir_id: &str,
        size: u64,
        pre_hash: &str,
        part_number: u32,
        check_name_mode: CheckNameMode,
    ) -> PcsResult<PreparedUpload> {
        let info = self
            .pcs
            .create_file(filename, dir_id, size, pre_hash, "", "", part_number, check_name_mode)
            .await?;
        Ok(serde_json::from_value(info)?)
    }

    /// 秒传（携带完整内容哈希与持有证明）
    pub async fn rapid_upload_file(
        &self,
        filename: &str,
        dir_id: &str,
        size: u64,
        content_hash: &str,
        proof_code: &str,
        check_name_mode: CheckNameMode,
    ) -> PcsResult<PreparedUpload> {
        let info = self
            .pcs
            .create_file(
                filename,
                dir_id,
                size,
                "",
                content_hash,
                proof_code,
                1,
                check_name_mode,
            )
            .await?;
        Ok(serde_json::from_value(info)?)
    }

    /// 创建上传会话（不探测秒传）
    pub async fn create_file(
        &self,
        filename: &str,
        dir_id: &str,
        size: u64,
        part_number: u32,
        check_name_mode: CheckNameMode,
    ) -> PcsResult<PreparedUpload> {
        let info = self
            .pcs
            .create_file(filename, dir_id, size, "", "", "", part_number, check_name_mode)
            .await?;
        Ok(serde_json::from_value(info)?)
    }

    /// 刷新上传会话的分片地址
    pub async fn get_upload_url(
        &self,
        file_id: &str,
        upload_id: &str,
        part_number: u32,
    ) -> PcsResult<PreparedUpload> {
        let info = self.pcs.get_upload_url(file_id, upload_id, part_number).await?;
        Ok(serde_json::from_value(info)?)
    }

    /// 上传一个分片
    pub async fn upload_slice(&self, data: Vec<u8>, url: &str) -> PcsResult<()> {
        self.pcs.upload_slice(data, url).await
    }

    /// 完成上传，取回服务端确认的最终文件（含权威内容哈希）
    pub async fn upload_complete(&self, file_id: &str, upload_id: &str) -> PcsResult<RemoteFile> {
        let info = self.pcs.upload_complete(file_id, upload_id).await?;
        Ok(serde_json::from_value(info)?)
    }

    // =====================================================
    // 分享相关
    // =====================================================

    /// 创建分享链接（period 为有效天数，0 表示永久）
    pub async fn share(
        &self,
        file_ids: &[String],
        password: &str,
        period: u64,
        description: &str,
    ) -> PcsResult<SharedLink> {
        let info = self.pcs.share(file_ids, password, period, description).await?;
        Ok(serde_json::from_value(info)?)
    }

    /// 列出本人创建的全部分享
    pub async fn list_shared_all(&self) -> PcsResult<Vec<SharedLink>> {
        let mut links = Vec::new();
        let mut marker = String::new();
        loop {
            let info = self.pcs.list_shared(&marker).await?;
            let items = info.get("items").cloned().unwrap_or(Value::Array(vec![]));
            let page: Vec<SharedLink> = serde_json::from_value(items)?;
            links.extend(page);
            let next = info
                .get("next_marker")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if next.is_empty() {
                break;
            }
            marker = next;
        }
        Ok(links)
    }

    /// 取消分享
    pub async fn cancel_shared(&self, share_ids: &[String]) -> PcsResult<Vec<bool>> {
        let info = self.pcs.cancel_shared(share_ids).await?;
        Ok(batch_ok_flags(&info))
    }

    /// 取分享访问凭证
    pub async fn get_share_token(&self, share_id: &str, password: &str) -> PcsResult<String> {
        self.pcs.share_token(share_id, password).await
    }

    /// 匿名查看分享信息
    pub async fn shared_info(&self, share_id: &str) -> PcsResult<SharedLinkInfo> {
        let info = self.pcs.shared_info(share_id).await?;
        Ok(serde_json::from_value(info)?)
    }

    /// 分享链接是否仍有效
    pub async fn is_shared_valid(&self, share_id: &str) -> PcsResult<bool> {
        match self.shared_info(share_id).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_share_invalid() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// 转存分享文件到自己网盘
    pub async fn transfer_shared_files(
        &self,
        shared_file_ids: &[String],
        dest_id: &str,
        share_id: &str,
    ) -> PcsResult<Vec<RemoteFile>> {
        let info = self
            .pcs
            .transfer_shared_files(shared_file_ids, dest_id, share_id, false)
            .await?;
        let mut files = Vec::new();
        for body in batch_bodies(&info) {
            files.push(serde_json::from_value(body)?);
        }
        Ok(files)
    }

    /// 取分享文件的下载直链
    pub async fn shared_file_download_url(
        &self,
        shared_file_id: &str,
        share_id: &str,
    ) -> PcsResult<String> {
        self.pcs
            .shared_file_download_url(shared_file_id, share_id, 10 * 60)
            .await
    }

    // =====================================================
    // 下载与用户
    // =====================================================

    /// 取文件下载链接（按策略选择客户端）
    pub async fn download_link(&self, file_id: &str) -> PcsResult<DownloadUrlInfo> {
        let info = self.link_client().download_link(file_id).await?;
        Ok(serde_json::from_value(info)?)
    }

    /// 把远程文件打开为可 seek 的字节流
    pub async fn file_stream(
        &self,
        file_id: &str,
        encrypt_password: &[u8],
    ) -> PcsResult<crate::downloader::RangeStream> {
        let link = self.download_link(file_id).await?;
        if link.url.is_empty() {
            return Err(AliPcsError::Invalid(format!("文件 {} 没有下载链接", file_id)));
        }
        crate::downloader::RangeStream::open(&link.url, encrypt_password).await
    }

    /// 把分享中的文件打开为可 seek 的字节流
    pub async fn shared_file_stream(
        &self,
        shared_file_id: &str,
        share_id: &str,
        encrypt_password: &[u8],
    ) -> PcsResult<crate::downloader::RangeStream> {
        let url = self.shared_file_download_url(shared_file_id, share_id).await?;
        crate::downloader::RangeStream::open(&url, encrypt_password).await
    }

    /// 用户信息
    pub async fn user_info(&self) -> PcsResult<PcsUser> {
        let info = self.pcs.user_info().await?;
        Ok(serde_json::from_value(info)?)
    }

    /// 主动失效路径缓存中的一个节点
    pub async fn invalidate_path_cache(&self, file_id: &str) -> Option<RemoteFile> {
        debug!("失效路径缓存: file_id={}", file_id);
        self.path_tree.invalidate(file_id).await
    }
}

/// 批量操作响应中每个子请求是否成功（body 无 code 即成功）
fn batch_ok_flags(info: &Value) -> Vec<bool> {
    info.get("responses")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .map(|v| v.get("body").map(|b| b.get("code").is_none()).unwrap_or(false))
                .collect()
        })
        .unwrap_or_default()
}

/// 批量操作响应中的各 body
fn batch_bodies(info: &Value) -> Vec<Value> {
    info.get("responses")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.get("body").cloned()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_ok_flags() {
        let info = serde_json::json!({
            "responses": [
                { "id": "a", "body": { "file_id": "a" } },
                { "id": "b", "body": { "code": "NotFound.File", "message": "x" } }
            ]
        });
        assert_eq!(batch_ok_flags(&info), vec![true, false]);
    }

    #[test]
    fn test_batch_bodies() {
        let info = serde_json::json!({
            "responses": [
                { "id": "a", "body": { "file_id": "a" } },
                { "id": "b", "body": { "file_id": "b" } }
            ]
        });
        let bodies = batch_bodies(&info);
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[1]["file_id"], "b");
    }
}
