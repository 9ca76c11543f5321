// 下载引擎
//
// MeDownloader：把 RangeStream 顺序写到本地文件。
// - 断点续传：本地已有部分文件时，远程流与本地文件同时 seek 到
//   已有长度，只补写剩余字节
// - 整体重试：失败后重建流、以追加方式重开文件，重试次数有界
// - 先写 .tmp，完成后改名，避免半成品冒充完整文件

use crate::common::control::PauseSwitch;
use crate::downloader::stream::{RangeStream, StreamProgressFn, DEFAULT_MAX_CHUNK_SIZE};
use crate::pcs::{AliPcsApi, RemoteFile};
use anyhow::{bail, Context, Result};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 下载选项
#[derive(Clone)]
pub struct DownloadOptions {
    /// 批量下载的文件并发数
    pub max_workers: usize,
    /// 单个文件的整体重试次数
    pub max_retries: u32,
    /// 单个 Range 请求的最大跨度
    pub max_chunk_size: u64,
    /// 断点续传
    pub continue_: bool,
    /// 解密口令（空 = 不解密）
    pub encrypt_password: Vec<u8>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        DownloadOptions {
            max_workers: 4,
            max_retries: 2,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            continue_: true,
            encrypt_password: Vec::new(),
        }
    }
}

/// 一个下载任务：远程文件与本地目标路径
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub file: RemoteFile,
    pub localpath: PathBuf,
}

/// 续传起点：本地已有多少字节，远程流与本地文件就都 seek 到哪里
fn resume_offset(continue_: bool, existing_len: Option<u64>) -> u64 {
    if continue_ {
        existing_len.unwrap_or(0)
    } else {
        0
    }
}

/// 取可用的下载直链：缓存未过期直接用，否则重新获取
async fn effective_url(api: &AliPcsApi, file: &RemoteFile) -> Result<String> {
    if !file.download_url_expired() {
        if let Some(url) = &file.download_url {
            return Ok(url.clone());
        }
    }
    let link = api.download_link(&file.file_id).await?;
    if link.url.is_empty() {
        bail!("`{}` 没有可用的下载链接", file.name);
    }
    Ok(link.url)
}

/// 下载一个文件（含断点续传与整体重试）
pub async fn download_file(
    api: Arc<AliPcsApi>,
    job: &DownloadJob,
    opts: &DownloadOptions,
    pause: PauseSwitch,
    cancel: CancellationToken,
    progress: Option<StreamProgressFn>,
) -> Result<()> {
    if job.localpath.exists() {
        info!("`{:?}` 已存在，跳过下载", job.localpath);
        return Ok(());
    }
    if let Some(parent) = job.localpath.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp_path = job.localpath.with_extension(format!(
        "{}tmp",
        job.localpath
            .extension()
            .map(|e| format!("{}.", e.to_string_lossy()))
            .unwrap_or_default()
    ));

    let mut attempt: u32 = 0;
    loop {
        pause.wait_ready().await;
        if cancel.is_cancelled() {
            bail!("下载已取消");
        }

        match download_once(&api, job, opts, &tmp_path, &pause, &cancel, progress.clone()).await {
            Ok(()) => break,
            Err(err) => {
                attempt += 1;
                warn!(
                    "下载失败（第 {}/{} 次）: {:?}: {:#}",
                    attempt, opts.max_retries, job.localpath, err
                );
                if attempt > opts.max_retries {
                    return Err(err).context(format!("下载 `{}` 失败", job.file.name));
                }
                // 重试前不清理 .tmp：续传逻辑会从已有长度继续
            }
        }
    }

    tokio::fs::rename(&tmp_path, &job.localpath)
        .await
        .context("移动临时文件失败")?;
    info!("下载完成: {:?}", job.localpath);
    Ok(())
}

/// 单次下载尝试：重建流、对齐偏移、顺序写入
async fn download_once(
    api: &AliPcsApi,
    job: &DownloadJob,
    opts: &DownloadOptions,
    tmp_path: &PathBuf,
    pause: &PauseSwitch,
    cancel: &CancellationToken,
    progress: Option<StreamProgressFn>,
) -> Result<()> {
    let url = effective_url(api, &job.file).await?;

    let mut stream = RangeStream::open(&url, &opts.encrypt_password)
        .await?
        .with_max_chunk_size(opts.max_chunk_size);
    if let Some(cb) = progress {
        stream = stream.with_callback(cb);
    }

    let existing_len = tokio::fs::metadata(tmp_path).await.ok().map(|m| m.len());
    let offset = resume_offset(opts.continue_, existing_len);

    let total = stream.len();
    if offset > total {
        bail!("本地临时文件比远端还长: {} > {}", offset, total);
    }
    stream.seek(SeekFrom::Start(offset));

    let mut fd = tokio::fs::OpenOptions::new()
        .create(true)
        .append(opts.continue_)
        .write(true)
        .truncate(!opts.continue_)
        .open(tmp_path)
        .await
        .context("打开临时文件失败")?;

    info!(
        "开始下载: {} -> {:?}, total={}, 从偏移 {} 续传",
        job.file.name, tmp_path, total, offset
    );

    while let Some(buf) = stream.next_chunk().await? {
        pause.wait_ready().await;
        if cancel.is_cancelled() {
            bail!("下载已取消");
        }
        fd.write_all(&buf).await.context("写入临时文件失败")?;
    }

    fd.flush().await?;

    let written = fd.metadata().await?.len();
    if written != total {
        bail!("下载长度不符: {} != {}", written, total);
    }
    Ok(())
}

/// 批量下载的单文件结果
pub struct DownloadOutcome {
    pub job: DownloadJob,
    pub result: Result<()>,
}

/// 批量下载：有界并发，单个失败不影响其他任务
pub async fn download(
    api: Arc<AliPcsApi>,
    jobs: Vec<DownloadJob>,
    opts: DownloadOptions,
    pause: PauseSwitch,
    cancel: CancellationToken,
) -> Vec<DownloadOutcome> {
    info!("======== 开始批量下载: {} 个文件 ========", jobs.len());

    let semaphore = Arc::new(Semaphore::new(opts.max_workers.max(1)));
    let mut join_set: JoinSet<DownloadOutcome> = JoinSet::new();

    for job in jobs {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let api = api.clone();
        let opts = opts.clone();
        let pause = pause.clone();
        let cancel = cancel.clone();

        join_set.spawn(async move {
            let _permit = permit;
            let result = download_file(api, &job, &opts, pause, cancel, None).await;
            DownloadOutcome { job, result }
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        if let Ok(outcome) = joined {
            outcomes.push(outcome);
        }
    }

    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
    info!(
        "======== 批量下载结束: {} 成功, {} 失败 ========",
        outcomes.len() - failed,
        failed
    );
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_file(name: &str, url: Option<&str>) -> RemoteFile {
        let mut f = RemoteFile::root();
        f.file_id = "f1".to_string();
        f.name = name.to_string();
        f.file_type = "file".to_string();
        f.size = 10;
        f.download_url = url.map(|s| s.to_string());
        f
    }

    #[test]
    fn test_tmp_path_keeps_extension() {
        let job = DownloadJob {
            file: demo_file("a.txt", None),
            localpath: PathBuf::from("/tmp/demo/a.txt"),
        };
        let tmp = job.localpath.with_extension(format!(
            "{}tmp",
            job.localpath
                .extension()
                .map(|e| format!("{}.", e.to_string_lossy()))
                .unwrap_or_default()
        ));
        assert_eq!(tmp, PathBuf::from("/tmp/demo/a.txt.tmp"));
    }

    #[test]
    fn test_resume_offset() {
        // 本地已有 L 字节，续传从 L 开始，只补写剩余部分
        assert_eq!(resume_offset(true, Some(1024)), 1024);
        assert_eq!(resume_offset(true, None), 0);
        // 关闭续传时永远从头下载
        assert_eq!(resume_offset(false, Some(1024)), 0);
    }

    #[test]
    fn test_expired_cached_url_is_rejected() {
        // 无过期参数的缓存链接视为过期，必须重新获取
        let file = demo_file("a.txt", Some("https://x/y?sig=1"));
        assert!(file.download_url_expired());

        let fresh = format!(
            "https://x/y?x-oss-expires={}",
            crate::common::date::now_timestamp() + 3600
        );
        let file = demo_file("a.txt", Some(&fresh));
        assert!(!file.download_url_expired());
    }
}
