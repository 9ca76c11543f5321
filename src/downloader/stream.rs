// Range 请求下载流
//
// 把远程文件呈现为可 seek、可顺序读取的字节流：
// - 每次读取按服务端的 Range 上限切成若干 chunk，逐个发
//   `Range: bytes=start-end` 请求，chunk 之间相互独立重试
// - 总长在打开时通过一次探测请求确定，流的生命周期内不变
// - 可选的透明解密：密文按帧对齐抓取，重试的 chunk 直接由
//   偏移重建解密状态，不依赖任何流式密码器的内部进度

use crate::crypto::{FileDecryptor, FrameCipher, HEADER_LEN};
use crate::error::{AliPcsError, PcsResult};
use crate::pcs::client::PCS_UA;
use futures::StreamExt;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 单个 Range 请求的最大跨度: 50MB（服务端经验上限）
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 50 * 1024 * 1024;

/// chunk 级重试的默认上限
const DEFAULT_CHUNK_RETRIES: u32 = 3;

/// 下载 Referer（直链校验要求）
const DOWNLOAD_REFERER: &str = "https://www.alipan.com/";

/// 进度回调：参数为当前绝对偏移
pub type StreamProgressFn = Arc<dyn Fn(u64) + Send + Sync + 'static>;

/// 把 [start, end) 切成若干不超过 max 的连续子区间
pub(crate) fn split_ranges(start: u64, end: u64, max: u64) -> Vec<(u64, u64)> {
    debug_assert!(max > 0);
    let mut ranges = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = (cursor + max).min(end);
        ranges.push((cursor, next));
        cursor = next;
    }
    ranges
}

/// Range 请求字节流
pub struct RangeStream {
    client: reqwest::Client,
    url: String,
    /// 远端内容总长（加密时为密文总长）
    total_len: u64,
    /// 明文逻辑偏移（只通过 seek 与读取推进）
    offset: u64,
    max_chunk_size: u64,
    chunk_retries: u32,
    /// 探测响应头里的远端内容哈希（如有）
    content_hash: Option<String>,
    decryptor: Option<FileDecryptor>,
    callback: Option<StreamProgressFn>,
}

impl RangeStream {
    /// 打开下载流：发一次 2 字节探测请求确定总长与远端哈希，
    /// 口令非空时再抓文件头判断是否为加密容器
    pub async fn open(url: &str, encrypt_password: &[u8]) -> PcsResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(PCS_UA)
            .timeout(Duration::from_secs(60))
            .build()?;

        let mut stream = RangeStream {
            client,
            url: url.to_string(),
            total_len: 0,
            offset: 0,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            chunk_retries: DEFAULT_CHUNK_RETRIES,
            content_hash: None,
            decryptor: None,
            callback: None,
        };

        stream.probe().await?;

        if !encrypt_password.is_empty() && stream.total_len >= HEADER_LEN {
            let head = stream.fetch_range(0, HEADER_LEN).await?;
            if FrameCipher::is_encrypted_header(&head) {
                let cipher = FrameCipher::from_header(&head, encrypt_password)?;
                debug!("检测到加密容器: origin_len={}", cipher.origin_len());
                stream.decryptor = Some(FileDecryptor::new(cipher));
            }
        }

        Ok(stream)
    }

    /// 已知总长时直接构造（跳过探测请求，不做解密）
    pub fn with_known_length(url: &str, total_len: u64) -> PcsResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(PCS_UA)
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(RangeStream {
            client,
            url: url.to_string(),
            total_len,
            offset: 0,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            chunk_retries: DEFAULT_CHUNK_RETRIES,
            content_hash: None,
            decryptor: None,
            callback: None,
        })
    }

    pub fn with_max_chunk_size(mut self, max_chunk_size: u64) -> Self {
        self.max_chunk_size = max_chunk_size.max(1);
        self
    }

    pub fn with_callback(mut self, callback: StreamProgressFn) -> Self {
        self.callback = Some(callback);
        self
    }

    /// 明文总长（未加密即远端内容总长）
    pub fn len(&self) -> u64 {
        match &self.decryptor {
            Some(d) => d.plain_len(),
            None => self.total_len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 当前逻辑偏移
    pub fn tell(&self) -> u64 {
        self.offset
    }

    /// 探测响应头携带的远端内容哈希
    pub fn remote_content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    /// 探测请求：取总长与远端哈希
    async fn probe(&mut self) -> PcsResult<()> {
        let resp = self
            .client
            .get(&self.url)
            .header("Referer", DOWNLOAD_REFERER)
            .header("Range", "bytes=0-1")
            .send()
            .await?;

        let status = resp.status();
        // 416 说明远端是空文件（Content-Range: bytes */0）
        if status.as_u16() == 416 {
            self.total_len = 0;
            return Ok(());
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AliPcsError::api(
                format!("DownloadHttp{}", status.as_u16()),
                body.chars().take(500).collect::<String>(),
            ));
        }

        // Content-Range: bytes 0-1/12345
        self.total_len = resp
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| AliPcsError::Invalid("探测响应缺少 Content-Range".to_string()))?;

        self.content_hash = resp
            .headers()
            .get("x-oss-hash-value")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        debug!("下载流探测完成: total_len={}", self.total_len);
        Ok(())
    }

    /// 发一个 Range 请求取 [start, end) 的原始字节（带重试）
    async fn fetch_range(&self, start: u64, end: u64) -> PcsResult<Vec<u8>> {
        debug_assert!(start < end);
        let mut fails: u32 = 0;
        loop {
            match self.try_fetch(start, end).await {
                Ok(buf) => return Ok(buf),
                Err(err) => {
                    fails += 1;
                    warn!(
                        "Range 请求失败 bytes={}-{}（第 {} 次）: {}",
                        start,
                        end - 1,
                        fails,
                        err
                    );
                    if fails > self.chunk_retries {
                        return Err(err);
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    async fn try_fetch(&self, start: u64, end: u64) -> PcsResult<Vec<u8>> {
        let resp = self
            .client
            .get(&self.url)
            .header("Referer", DOWNLOAD_REFERER)
            .header("Range", format!("bytes={}-{}", start, end - 1))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() && status.as_u16() != 206 {
            return Err(AliPcsError::api(
                format!("DownloadHttp{}", status.as_u16()),
                format!("Range bytes={}-{}", start, end - 1),
            ));
        }

        let expected = (end - start) as usize;
        let mut buf = Vec::with_capacity(expected);
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }

        if buf.len() != expected {
            return Err(AliPcsError::Invalid(format!(
                "Range 响应长度不符: {} != {}",
                buf.len(),
                expected
            )));
        }
        Ok(buf)
    }

    /// 读取 [plain_start, plain_end) 的明文字节（不改变流偏移）
    async fn read_span(&self, plain_start: u64, plain_end: u64) -> PcsResult<Vec<u8>> {
        if plain_start >= plain_end {
            return Ok(Vec::new());
        }

        match &self.decryptor {
            None => {
                let mut out = Vec::with_capacity((plain_end - plain_start) as usize);
                for (s, e) in split_ranges(plain_start, plain_end, self.max_chunk_size) {
                    out.extend_from_slice(&self.fetch_range(s, e).await?);
                    if let Some(cb) = &self.callback {
                        cb(e);
                    }
                }
                Ok(out)
            }
            Some(decryptor) => {
                // 密文按帧对齐抓取；chunk 重试由偏移重建解密状态
                let mut out = Vec::with_capacity((plain_end - plain_start) as usize);
                for (s, e) in split_ranges(plain_start, plain_end, self.max_chunk_size) {
                    let (cs, ce, first_frame) = decryptor.cipher_range(s, e);
                    let cipher_chunk = self.fetch_range(cs, ce).await?;
                    out.extend_from_slice(&decryptor.decrypt_range(
                        &cipher_chunk,
                        first_frame,
                        s,
                        e,
                    )?);
                    if let Some(cb) = &self.callback {
                        cb(e);
                    }
                }
                Ok(out)
            }
        }
    }

    /// 从当前偏移读取至多 size 字节
    pub async fn read(&mut self, size: u64) -> PcsResult<Vec<u8>> {
        let start = self.offset;
        let end = (start + size).min(self.len());
        let buf = self.read_span(start, end).await?;
        self.offset = end;
        Ok(buf)
    }

    /// 顺序读取下一个 chunk（None 表示到达末尾）
    ///
    /// MeDownloader 的主循环就建在这上面
    pub async fn next_chunk(&mut self) -> PcsResult<Option<Vec<u8>>> {
        if self.offset >= self.len() {
            return Ok(None);
        }
        let buf = self.read(self.max_chunk_size).await?;
        Ok(Some(buf))
    }

    /// 调整逻辑偏移（越界收敛到 [0, len]）
    pub fn seek(&mut self, pos: SeekFrom) -> u64 {
        let len = self.len() as i64;
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(d) => self.offset as i64 + d,
            SeekFrom::End(d) => len + d,
        };
        self.offset = target.clamp(0, len) as u64;
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_ranges_exact_cover() {
        let ranges = split_ranges(0, 100, 30);
        assert_eq!(ranges, vec![(0, 30), (30, 60), (60, 90), (90, 100)]);

        // 子区间首尾相接，总长等于原区间
        let total: u64 = ranges.iter().map(|(s, e)| e - s).sum();
        assert_eq!(total, 100);
        for w in ranges.windows(2) {
            assert_eq!(w[0].1, w[1].0);
        }
    }

    #[test]
    fn test_split_ranges_single() {
        assert_eq!(split_ranges(10, 20, 100), vec![(10, 20)]);
        assert_eq!(split_ranges(5, 5, 100), Vec::<(u64, u64)>::new());
    }

    #[test]
    fn test_split_ranges_concat_identity() {
        // 任意切法拼起来都覆盖同一区间
        let one = split_ranges(7, 777, 1000);
        let many = split_ranges(7, 777, 13);
        let cover = |rs: &[(u64, u64)]| -> u64 { rs.iter().map(|(s, e)| e - s).sum() };
        assert_eq!(cover(&one), cover(&many));
        assert_eq!(many.first().unwrap().0, 7);
        assert_eq!(many.last().unwrap().1, 777);
    }

    #[test]
    fn test_seek_clamps() {
        let mut stream = RangeStream::with_known_length("https://example.com/f", 100).unwrap();
        assert_eq!(stream.len(), 100);

        assert_eq!(stream.seek(SeekFrom::Start(50)), 50);
        assert_eq!(stream.tell(), 50);

        assert_eq!(stream.seek(SeekFrom::Current(-10)), 40);
        assert_eq!(stream.seek(SeekFrom::End(-1)), 99);

        // 越界收敛
        assert_eq!(stream.seek(SeekFrom::Start(1000)), 100);
        assert_eq!(stream.seek(SeekFrom::Current(-9999)), 0);
    }
}
