// 上传引擎
//
// 单文件状态机：
//
//   INIT -> PROBE_HASH -> (DEDUP_HIT -> DONE)
//                      -> (DEDUP_MISS -> SLICE_UPLOAD -> COMPLETE -> DONE)
//   任意状态 -> FAILED（不可恢复错误）
//
// - 文件不足 1KiB 或启用加密时跳过秒传探测，直接走分片上传
// - 分片严格按偏移顺序读取，SHA1 按发送顺序累积，
//   完成后与服务端返回的权威哈希比对，不一致即硬错误
// - 预签名地址独立过期，凭同一个 upload_id 换新后重试该分片
// - 批量模式下多个文件并发（各自的分片仍按序），单文件分片
//   并发仅在调用方显式要求时启用

use crate::common::control::PauseSwitch;
use crate::common::path::{path_basename, path_dirname};
use crate::crypto::{EncryptType, FrameCipher, FRAME_SIZE};
use crate::error::AliPcsError;
use crate::pcs::{AliPcsApi, CheckNameMode, PreparedUpload, RemoteFile, UploadUrl};
use crate::uploader::hash::{calc_file_sha1, calc_pre_hash, calc_proof_code, ONE_K};
use crate::uploader::slice::{SlicePlan, DEFAULT_SLICE_SIZE};
use anyhow::{bail, Context, Result};
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 进度回调：参数为当前文件已上传的字节数
///
/// 回调即发即弃，引擎不等待其返回值
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync + 'static>;

/// 上传选项
#[derive(Clone)]
pub struct UploadOptions {
    /// 同名冲突策略
    pub check_name_mode: CheckNameMode,
    /// 名义分片大小（会被 10_000 分片上限自动放大）
    pub slice_size: u64,
    /// 批量上传的文件并发数
    pub max_workers: usize,
    /// 单文件分片并发数（1 = 严格顺序上传）
    pub slice_workers: usize,
    /// 单个分片的重试上限（0 = 无限重试）
    pub max_slice_retries: u32,
    /// 只允许秒传，秒传未命中即报错
    pub only_rapid_upload: bool,
    /// 内容加密算法
    pub encrypt_type: EncryptType,
    /// 加密口令
    pub encrypt_password: Vec<u8>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        UploadOptions {
            check_name_mode: CheckNameMode::Overwrite,
            slice_size: DEFAULT_SLICE_SIZE,
            max_workers: 4,
            slice_workers: 1,
            max_slice_retries: 0,
            only_rapid_upload: false,
            encrypt_type: EncryptType::No,
            encrypt_password: Vec::new(),
        }
    }
}

/// 一个待上传文件：本地路径与目标远程路径
#[derive(Debug, Clone)]
pub struct FromTo {
    pub localpath: PathBuf,
    pub remotepath: String,
}

/// 展开本地路径列表为 (本地文件, 远程路径) 对
///
/// 目录递归展开，目录结构映射到远程路径
pub fn from_tos(localpaths: &[PathBuf], remotedir: &str) -> Vec<FromTo> {
    let mut result = Vec::new();
    for localpath in localpaths {
        if !localpath.exists() {
            warn!("本地路径不存在，跳过: {:?}", localpath);
            continue;
        }

        if localpath.is_file() {
            let name = localpath
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            result.push(FromTo {
                localpath: localpath.clone(),
                remotepath: crate::common::path::join_path(remotedir, &name),
            });
        } else {
            let base = localpath.parent().unwrap_or(Path::new(""));
            for entry in WalkDir::new(localpath).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(base)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                result.push(FromTo {
                    localpath: entry.path().to_path_buf(),
                    remotepath: crate::common::path::join_path(remotedir, &relative),
                });
            }
        }
    }
    result
}

/// 是否满足秒传探测条件
///
/// 服务端的探测要求内容至少 1KiB；加密上传的密文哈希对去重没有意义
fn rapid_probe_eligible(io_len: u64, encrypt_type: EncryptType) -> bool {
    encrypt_type == EncryptType::No && io_len >= ONE_K
}

/// 上传字节源：明文直读，或按帧加密后的密文流
///
/// 只支持顺序读取；分片重试不需要回绕，因为分片缓冲始终在内存里
enum UploadSource {
    Plain {
        file: tokio::fs::File,
        total: u64,
    },
    Encrypted {
        file: tokio::fs::File,
        cipher: FrameCipher,
        header_sent: bool,
        next_frame: u64,
        pending: Vec<u8>,
        total: u64,
    },
}

impl UploadSource {
    async fn open(path: &Path, encrypt_type: EncryptType, password: &[u8]) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .context(format!("打开上传文件失败: {:?}", path))?;
        let origin_len = file.metadata().await?.len();

        match encrypt_type {
            EncryptType::No => Ok(UploadSource::Plain {
                file,
                total: origin_len,
            }),
            algo => {
                let cipher = FrameCipher::new_encryptor(algo, password, origin_len)?;
                let total = cipher.encrypted_len();
                Ok(UploadSource::Encrypted {
                    file,
                    cipher,
                    header_sent: false,
                    next_frame: 0,
                    pending: Vec::new(),
                    total,
                })
            }
        }
    }

    /// 上传流的总长（加密时为密文总长）
    fn total_len(&self) -> u64 {
        match self {
            UploadSource::Plain { total, .. } => *total,
            UploadSource::Encrypted { total, .. } => *total,
        }
    }

    /// 顺序读出下一段字节（不足 size 说明到了末尾）
    async fn read_chunk(&mut self, size: usize) -> Result<Vec<u8>> {
        match self {
            UploadSource::Plain { file, .. } => {
                let mut buf = vec![0u8; size];
                let mut read = 0usize;
                while read < size {
                    let n = file.read(&mut buf[read..]).await?;
                    if n == 0 {
                        break;
                    }
                    read += n;
                }
                buf.truncate(read);
                Ok(buf)
            }
            UploadSource::Encrypted {
                file,
                cipher,
                header_sent,
                next_frame,
                pending,
                ..
            } => {
                if !*header_sent {
                    pending.extend_from_slice(cipher.header());
                    *header_sent = true;
                }

                let frame_count = cipher.origin_len().div_ceil(FRAME_SIZE);
                while pending.len() < size && *next_frame < frame_count {
                    let start = *next_frame * FRAME_SIZE;
                    let plain_len = FRAME_SIZE.min(cipher.origin_len() - start) as usize;
                    let mut plain = vec![0u8; plain_len];
                    file.read_exact(&mut plain).await?;
                    pending.extend_from_slice(&cipher.seal_frame(*next_frame, &plain)?);
                    *next_frame += 1;
                }

                let n = size.min(pending.len());
                let out = pending.drain(..n).collect();
                Ok(out)
            }
        }
    }
}

/// 上传会话的分片地址簿
///
/// 地址独立过期；任何一个分片发现地址失效时，凭 upload_id
/// 重新换一整批地址，会话本身不变。
struct SliceUrls {
    api: Arc<AliPcsApi>,
    file_id: String,
    upload_id: String,
    part_number: u32,
    urls: RwLock<Vec<UploadUrl>>,
}

impl SliceUrls {
    fn new(api: Arc<AliPcsApi>, prepared: &PreparedUpload, part_number: u32) -> Self {
        SliceUrls {
            api,
            file_id: prepared.file_id.clone(),
            upload_id: prepared.upload_id.clone(),
            part_number,
            urls: RwLock::new(prepared.part_info_list.clone()),
        }
    }

    /// 取第 idx 个分片的可用地址，过期则先换新
    async fn get(&self, idx: usize) -> Result<String> {
        {
            let urls = self.urls.read().await;
            if let Some(url) = urls.get(idx) {
                if !url.is_expired() {
                    return Ok(url.upload_url.clone());
                }
            }
        }

        self.refresh().await?;

        let urls = self.urls.read().await;
        match urls.get(idx) {
            Some(url) => Ok(url.upload_url.clone()),
            None => Err(AliPcsError::UploadExpired {
                upload_id: self.upload_id.clone(),
            }
            .into()),
        }
    }

    async fn refresh(&self) -> Result<()> {
        info!(
            "刷新分片上传地址: upload_id={}..., part_number={}",
            &self.upload_id[..8.min(self.upload_id.len())],
            self.part_number
        );
        let prepared = self
            .api
            .get_upload_url(&self.file_id, &self.upload_id, self.part_number)
            .await?;
        let mut urls = self.urls.write().await;
        *urls = prepared.part_info_list;
        Ok(())
    }
}

/// 上传单个分片（带重试与地址换新）
async fn upload_one_slice(
    urls: Arc<SliceUrls>,
    idx: usize,
    data: Vec<u8>,
    max_retries: u32,
    pause: PauseSwitch,
    cancel: CancellationToken,
) -> Result<()> {
    let mut fails: u32 = 0;
    loop {
        pause.wait_ready().await;
        if cancel.is_cancelled() {
            bail!("上传已取消");
        }

        let url = urls.get(idx).await?;
        match urls.api.upload_slice(data.clone(), &url).await {
            Ok(()) => {
                debug!("分片 #{} 上传成功, size={}", idx, data.len());
                return Ok(());
            }
            Err(err) => {
                fails += 1;
                warn!("分片 #{} 上传失败（第 {} 次）: {}", idx, fails, err);
                if max_retries > 0 && fails >= max_retries {
                    return Err(err).context(format!("分片 #{} 达到重试上限", idx));
                }
                // 失败多半是地址过期，换一批再试
                urls.refresh().await?;
            }
        }
    }
}

/// 上传一个文件
///
/// 先尝试秒传（内容寻址去重），未命中则按分片上传并在完成时
/// 校验内容哈希。返回服务端确认的远程文件。
pub async fn upload_file(
    api: Arc<AliPcsApi>,
    from_to: &FromTo,
    opts: &UploadOptions,
    pause: PauseSwitch,
    cancel: CancellationToken,
    progress: Option<ProgressFn>,
) -> Result<Option<RemoteFile>> {
    pause.wait_ready().await;

    let remotedir = path_dirname(&from_to.remotepath);
    let filename = path_basename(&from_to.remotepath);

    // 目标目录：不存在则逐级创建
    let dest_dir = match api.get_file(&remotedir).await? {
        Some(pf) => {
            if !pf.is_dir() {
                bail!("`{}` 不是目录", remotedir);
            }
            pf
        }
        None => api.makedir_path(&remotedir).await?,
    };
    let dest_id = dest_dir.file_id.clone();

    // refuse 模式下已存在即跳过
    if opts.check_name_mode == CheckNameMode::Refuse
        && api.get_file(&from_to.remotepath).await?.is_some()
    {
        info!("`{}` 已存在，跳过上传", from_to.remotepath);
        return Ok(None);
    }

    let mut source =
        UploadSource::open(&from_to.localpath, opts.encrypt_type, &opts.encrypt_password).await?;
    let io_len = source.total_len();
    let plan = SlicePlan::new(io_len, opts.slice_size);
    let part_number = plan.part_number();

    info!(
        "开始上传: local={:?}, remote={}, size={}, part_number={}",
        from_to.localpath, from_to.remotepath, io_len, part_number
    );

    // ---------- PROBE_HASH / 秒传 ----------
    let mut prepared: Option<PreparedUpload> = None;

    if rapid_probe_eligible(io_len, opts.encrypt_type) {
        let pre_hash = calc_pre_hash(&from_to.localpath).await?;
        let probe = api
            .prepare_file(&filename, &dest_id, io_len, &pre_hash, part_number, opts.check_name_mode)
            .await?;

        if probe.is_rapid_upload() {
            info!("秒传命中（预创建阶段）: {}", from_to.remotepath);
            if let Some(cb) = &progress {
                cb(io_len);
            }
            return Ok(None);
        }

        if probe.can_rapid_upload() {
            let content_hash = calc_file_sha1(&from_to.localpath).await?;
            let access_token = api.pcs().access_token().await?;
            let proof_code =
                calc_proof_code(&from_to.localpath, io_len, &access_token).await?;

            match api
                .rapid_upload_file(
                    &filename,
                    &dest_id,
                    io_len,
                    &content_hash,
                    &proof_code,
                    opts.check_name_mode,
                )
                .await
            {
                Ok(created) if created.is_rapid_upload() => {
                    info!("秒传成功，零字节传输: {}", from_to.remotepath);
                    if let Some(cb) = &progress {
                        cb(io_len);
                    }
                    return Ok(None);
                }
                Ok(created) => {
                    // 服务端未去重但给出了会话，直接复用
                    debug!("秒传未命中，复用返回的上传会话");
                    prepared = Some(created);
                }
                Err(AliPcsError::Api { code, message }) if code.starts_with("NotFound") => {
                    // 去重未命中是预期的否定结果，不是失败
                    debug!("秒传未命中: code={}, {}", code, message);
                }
                Err(err) => {
                    return Err(err).context(format!(
                        "秒传 `{}` 失败",
                        from_to.remotepath
                    ));
                }
            }
        } else {
            // 预创建已经建立了会话，分片上传直接用
            prepared = Some(probe);
        }
    }

    if opts.only_rapid_upload {
        bail!("仅允许秒传，但 `{}` 秒传未命中", from_to.remotepath);
    }

    // ---------- SLICE_UPLOAD ----------
    let prepared = match prepared {
        Some(p) if !p.upload_id.is_empty() => p,
        _ => {
            api.create_file(&filename, &dest_id, io_len, part_number, opts.check_name_mode)
                .await?
        }
    };

    if prepared.is_rapid_upload() {
        info!("创建会话时已秒传: {}", from_to.remotepath);
        if let Some(cb) = &progress {
            cb(io_len);
        }
        return Ok(None);
    }

    if prepared.file_id.is_empty() || prepared.upload_id.is_empty() {
        bail!("创建上传会话失败：响应缺少 file_id/upload_id");
    }
    if prepared.part_info_list.len() != part_number as usize {
        bail!(
            "上传会话地址数不符: {} != part_number {}",
            prepared.part_info_list.len(),
            part_number
        );
    }

    let file_id = prepared.file_id.clone();
    let upload_id = prepared.upload_id.clone();
    let urls = Arc::new(SliceUrls::new(api.clone(), &prepared, part_number));

    let mut hasher = Sha1::new();
    let completed = Arc::new(AtomicU64::new(0));

    if opts.slice_workers <= 1 {
        // 顺序模式：一个连接按偏移依次发送
        for (idx, range) in plan.ranges().enumerate() {
            pause.wait_ready().await;
            if cancel.is_cancelled() {
                bail!("上传已取消");
            }

            let size = (range.end - range.start) as usize;
            let data = source.read_chunk(size).await?;
            if data.len() != size {
                bail!("读取分片 #{} 不足: {} != {}", idx, data.len(), size);
            }
            hasher.update(&data);

            upload_one_slice(
                urls.clone(),
                idx,
                data,
                opts.max_slice_retries,
                pause.clone(),
                cancel.clone(),
            )
            .await?;

            completed.fetch_add(size as u64, Ordering::SeqCst);
            if let Some(cb) = &progress {
                cb(completed.load(Ordering::SeqCst));
            }
        }
    } else {
        // 单文件并发模式：读取仍严格按偏移顺序（哈希在读取时累积），
        // 发送由有界工作池乱序完成
        let semaphore = Arc::new(Semaphore::new(opts.slice_workers));
        let mut join_set: JoinSet<Result<u64>> = JoinSet::new();

        for (idx, range) in plan.ranges().enumerate() {
            pause.wait_ready().await;
            if cancel.is_cancelled() {
                join_set.abort_all();
                bail!("上传已取消");
            }

            let size = (range.end - range.start) as usize;
            let data = source.read_chunk(size).await?;
            if data.len() != size {
                bail!("读取分片 #{} 不足: {} != {}", idx, data.len(), size);
            }
            hasher.update(&data);

            let permit = semaphore.clone().acquire_owned().await?;
            let urls = urls.clone();
            let pause = pause.clone();
            let cancel = cancel.clone();
            let max_retries = opts.max_slice_retries;
            let completed = completed.clone();
            let progress = progress.clone();

            join_set.spawn(async move {
                let _permit = permit;
                let len = data.len() as u64;
                upload_one_slice(urls, idx, data, max_retries, pause, cancel).await?;
                let done = completed.fetch_add(len, Ordering::SeqCst) + len;
                if let Some(cb) = &progress {
                    cb(done);
                }
                Ok(len)
            });

            // 及时收割失败任务，避免继续读后续分片
            while let Some(result) = join_set.try_join_next() {
                result.context("分片任务异常")??;
            }
        }

        while let Some(result) = join_set.join_next().await {
            result.context("分片任务异常")??;
        }
    }

    // ---------- COMPLETE ----------
    let uploaded = api.upload_complete(&file_id, &upload_id).await?;

    let local_hash = hex::encode(hasher.finalize());
    let remote_hash = uploaded.content_hash.clone().unwrap_or_default();
    if !remote_hash.eq_ignore_ascii_case(&local_hash) {
        // 完整性校验失败是硬错误，绝不重试
        return Err(AliPcsError::HashMismatch {
            local: local_hash,
            remote: remote_hash,
        }
        .into());
    }

    info!(
        "上传完成并通过哈希校验: {} (sha1={})",
        from_to.remotepath, local_hash
    );
    Ok(Some(uploaded))
}

/// 批量上传的单文件结果
pub struct UploadOutcome {
    pub from_to: FromTo,
    pub result: Result<Option<RemoteFile>>,
}

/// 批量上传
///
/// 有界并发地上传多个文件；单个文件失败不影响其他文件，
/// 所有结果汇总返回。
pub async fn upload(
    api: Arc<AliPcsApi>,
    from_to_list: Vec<FromTo>,
    opts: UploadOptions,
    pause: PauseSwitch,
    cancel: CancellationToken,
) -> Vec<UploadOutcome> {
    info!("======== 开始批量上传: {} 个文件 ========", from_to_list.len());

    let semaphore = Arc::new(Semaphore::new(opts.max_workers.max(1)));
    let mut join_set: JoinSet<UploadOutcome> = JoinSet::new();

    for from_to in from_to_list {
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
            let result = upload_file(api, &from_to, &opts, pause, cancel, None).await;
            if let Err(err) = &result {
                warn!("上传失败: {:?} -> {}: {:#}", from_to.localpath, from_to.remotepath, err);
            }
            UploadOutcome { from_to, result }
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
        "======== 批量上传结束: {} 成功, {} 失败 ========",
        outcomes.len() - failed,
        failed
    );
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{FileDecryptor, HEADER_LEN};
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_rapid_probe_eligibility() {
        // 5 字节的 demo.txt 低于探测门槛，直接走 1 个分片的普通上传
        assert!(!rapid_probe_eligible(5, EncryptType::No));
        assert!(!rapid_probe_eligible(1023, EncryptType::No));
        assert!(rapid_probe_eligible(1024, EncryptType::No));
        assert!(rapid_probe_eligible(1 << 20, EncryptType::No));
        // 加密上传永远不探测
        assert!(!rapid_probe_eligible(1 << 20, EncryptType::ChaCha20));
    }

    #[test]
    fn test_small_file_single_slice_plan() {
        let plan = SlicePlan::new(5, DEFAULT_SLICE_SIZE);
        assert_eq!(plan.part_number(), 1);
    }

    #[tokio::test]
    async fn test_plain_source_sequential_read() {
        let mut f = NamedTempFile::new().unwrap();
        let content: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        f.write_all(&content).unwrap();
        f.flush().unwrap();

        let mut source = UploadSource::open(f.path(), EncryptType::No, b"").await.unwrap();
        assert_eq!(source.total_len(), 1000);

        let a = source.read_chunk(300).await.unwrap();
        let b = source.read_chunk(300).await.unwrap();
        let c = source.read_chunk(500).await.unwrap();
        assert_eq!(a, &content[..300]);
        assert_eq!(b, &content[300..600]);
        assert_eq!(c, &content[600..]); // 末尾不足 size
    }

    #[tokio::test]
    async fn test_hash_accumulation_matches_file_sha1() {
        let mut f = NamedTempFile::new().unwrap();
        let content = vec![0x5au8; 4096];
        f.write_all(&content).unwrap();
        f.flush().unwrap();

        let mut source = UploadSource::open(f.path(), EncryptType::No, b"").await.unwrap();
        let plan = SlicePlan::new(4096, 1000);

        // 按分片顺序读取并累积哈希，必须与整文件哈希一致
        let mut hasher = Sha1::new();
        for range in plan.ranges() {
            let data = source.read_chunk((range.end - range.start) as usize).await.unwrap();
            hasher.update(&data);
        }
        let accumulated = hex::encode(hasher.finalize());
        let whole = calc_file_sha1(f.path()).await.unwrap();
        assert_eq!(accumulated, whole);
    }

    #[tokio::test]
    async fn test_encrypted_source_roundtrip() {
        let mut f = NamedTempFile::new().unwrap();
        let content: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
        f.write_all(&content).unwrap();
        f.flush().unwrap();

        let mut source =
            UploadSource::open(f.path(), EncryptType::ChaCha20, b"pwd").await.unwrap();
        let total = source.total_len();
        assert!(total > content.len() as u64);

        // 以不对齐的尺寸顺序读出全部密文
        let mut sealed = Vec::new();
        loop {
            let chunk = source.read_chunk(12345).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            sealed.extend_from_slice(&chunk);
        }
        assert_eq!(sealed.len() as u64, total);

        // 产出的字节流可以被解密侧完整还原
        let cipher = FrameCipher::from_header(&sealed[..HEADER_LEN as usize], b"pwd").unwrap();
        let decryptor = FileDecryptor::new(cipher);
        let plain = decryptor
            .decrypt_range(&sealed[HEADER_LEN as usize..], 0, 0, content.len() as u64)
            .unwrap();
        assert_eq!(plain, content);
    }

    #[test]
    fn test_from_tos_flattens_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"b").unwrap();

        let fts = from_tos(&[dir.path().to_path_buf()], "/t");
        assert_eq!(fts.len(), 2);

        let dirname = dir.path().file_name().unwrap().to_string_lossy().to_string();
        let mut remotes: Vec<_> = fts.iter().map(|ft| ft.remotepath.clone()).collect();
        remotes.sort();
        assert_eq!(remotes[0], format!("/t/{}/a.txt", dirname));
        assert_eq!(remotes[1], format!("/t/{}/sub/b.txt", dirname));
    }

    #[test]
    fn test_from_tos_single_file() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"x").unwrap();
        let fts = from_tos(&[f.path().to_path_buf()], "/t");
        assert_eq!(fts.len(), 1);
        let name = f.path().file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(fts[0].remotepath, format!("/t/{}", name));
    }
}
