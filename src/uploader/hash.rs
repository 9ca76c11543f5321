// 秒传哈希计算
//
// 秒传协议需要三个值：
// 1. pre_hash：文件前 1KiB 的 SHA1，预创建时发给服务端探测
// 2. content_hash：完整内容 SHA1
// 3. proof_code：从内容推导偏移处读出的 8 字节（base64），
//    证明确实持有这份字节而不只是知道哈希
//
// 文件 I/O 都放进阻塞线程池执行。

use crate::error::PcsResult;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

/// 秒传探测所需的最小文件长度
pub const ONE_K: u64 = 1024;

/// 计算字节串的 SHA1（十六进制小写）
pub fn calc_sha1(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// 文件前 1KiB 的 SHA1
pub async fn calc_pre_hash(path: &Path) -> PcsResult<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> PcsResult<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut buf = vec![0u8; ONE_K as usize];
        let mut read = 0usize;
        while read < buf.len() {
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(calc_sha1(&buf[..read]))
    })
    .await
    .map_err(|e| crate::error::AliPcsError::Invalid(format!("哈希任务执行失败: {}", e)))?
}

/// 完整文件内容的 SHA1
pub async fn calc_file_sha1(path: &Path) -> PcsResult<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> PcsResult<String> {
        let file = std::fs::File::open(&path)?;
        let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);
        let mut hasher = Sha1::new();
        let mut buffer = [0u8; 65536];

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| crate::error::AliPcsError::Invalid(format!("哈希任务执行失败: {}", e)))?
}

/// 持有证明偏移：md5(access_token) 十六进制前 16 位按 16 进制解析，对长度取模
pub fn proof_offset(access_token: &str, io_len: u64) -> u64 {
    let key_md5 = format!("{:x}", md5::compute(access_token.as_bytes()));
    let head = u64::from_str_radix(&key_md5[..16], 16).unwrap_or(0);
    head % io_len.max(1)
}

/// 计算持有证明：从推导偏移处读 8 字节并 base64 编码
///
/// 空文件返回空串（服务端对 0 长度内容不做证明校验）
pub async fn calc_proof_code(path: &Path, io_len: u64, access_token: &str) -> PcsResult<String> {
    if io_len == 0 {
        return Ok(String::new());
    }

    let offset = proof_offset(access_token, io_len);
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> PcsResult<String> {
        let mut file = std::fs::File::open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = [0u8; 8];
        let mut read = 0usize;
        while read < buf.len() {
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        debug!("持有证明: offset={}, bytes={}", offset, read);
        Ok(base64::engine::general_purpose::STANDARD.encode(&buf[..read]))
    })
    .await
    .map_err(|e| crate::error::AliPcsError::Invalid(format!("哈希任务执行失败: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_calc_sha1_known_value() {
        // SHA1("hello")
        assert_eq!(calc_sha1(b"hello"), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        // SHA1("")
        assert_eq!(calc_sha1(b""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[tokio::test]
    async fn test_pre_hash_small_file() {
        // 不足 1KiB 时只哈希实际内容
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"hello").unwrap();
        f.flush().unwrap();

        let pre = calc_pre_hash(f.path()).await.unwrap();
        assert_eq!(pre, calc_sha1(b"hello"));
    }

    #[tokio::test]
    async fn test_pre_hash_only_first_1k() {
        let mut f = NamedTempFile::new().unwrap();
        let content = vec![0xabu8; 4096];
        f.write_all(&content).unwrap();
        f.flush().unwrap();

        let pre = calc_pre_hash(f.path()).await.unwrap();
        assert_eq!(pre, calc_sha1(&content[..1024]));

        let full = calc_file_sha1(f.path()).await.unwrap();
        assert_ne!(pre, full);
    }

    #[test]
    fn test_proof_offset_stable() {
        let off1 = proof_offset("token-abc", 1000);
        let off2 = proof_offset("token-abc", 1000);
        assert_eq!(off1, off2);
        assert!(off1 < 1000);

        // 不同 token 推导出不同偏移（概率意义上）
        let off3 = proof_offset("token-xyz", 1000);
        assert!(off3 < 1000);
    }

    #[tokio::test]
    async fn test_proof_code_reads_8_bytes() {
        let mut f = NamedTempFile::new().unwrap();
        let content: Vec<u8> = (0..=255u8).cycle().take(2048).collect();
        f.write_all(&content).unwrap();
        f.flush().unwrap();

        let token = "some-access-token";
        let code = calc_proof_code(f.path(), 2048, token).await.unwrap();

        let offset = proof_offset(token, 2048) as usize;
        let end = (offset + 8).min(content.len());
        let expected = base64::engine::general_purpose::STANDARD.encode(&content[offset..end]);
        assert_eq!(code, expected);
    }

    #[tokio::test]
    async fn test_proof_code_empty_file() {
        let f = NamedTempFile::new().unwrap();
        let code = calc_proof_code(f.path(), 0, "tok").await.unwrap();
        assert!(code.is_empty());
    }
}
