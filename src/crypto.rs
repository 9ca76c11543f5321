// 内容加解密
//
// 容器格式：
//
//   magic(18) | version(1) | algo(1) | salt(16) | origin_len(8, BE)
//   帧0 | 帧1 | ...
//
// 明文按固定 64KiB 分帧，每帧独立用 AEAD 封装（ChaCha20-Poly1305 或
// AES-256-GCM），nonce 为帧序号，文件头作为 AAD 参与每帧认证。
// 帧与帧互不依赖，密文偏移与明文偏移可以互相换算：
// 下载流在任意 chunk 失败重试时，直接由偏移重建该帧的解密状态，
// 不存在需要续流的密码器内部状态。
//
// 密钥 = Argon2id(password, salt)，每个文件一个随机 salt。

use crate::error::{AliPcsError, PcsResult};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;

/// 容器魔数
pub const CRYPTO_MAGIC: &[u8; 18] = b"\x00@@#_ALIPCS_ENC#@@";

/// 容器版本
pub const CRYPTO_VERSION: u8 = 1;

/// 明文帧大小
pub const FRAME_SIZE: u64 = 64 * 1024;

/// AEAD 认证标签大小
pub const TAG_SIZE: u64 = 16;

/// 文件头长度：magic + version + algo + salt + origin_len
pub const HEADER_LEN: u64 = 18 + 1 + 1 + 16 + 8;

/// 加密算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptType {
    /// 不加密
    #[default]
    No,
    /// ChaCha20-Poly1305
    ChaCha20,
    /// AES-256-GCM
    AesGcm,
}

impl EncryptType {
    fn magic_code(&self) -> u8 {
        match self {
            EncryptType::No => 0,
            EncryptType::ChaCha20 => 1,
            EncryptType::AesGcm => 2,
        }
    }

    fn from_magic_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(EncryptType::ChaCha20),
            2 => Some(EncryptType::AesGcm),
            _ => None,
        }
    }
}

impl std::str::FromStr for EncryptType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "no" | "none" => Ok(EncryptType::No),
            "chacha20" => Ok(EncryptType::ChaCha20),
            "aes" | "aesgcm" | "aes256gcm" => Ok(EncryptType::AesGcm),
            other => Err(format!("未知加密算法: {}", other)),
        }
    }
}

/// 由口令与 salt 派生 32 字节密钥
fn derive_key(password: &[u8], salt: &[u8]) -> PcsResult<[u8; 32]> {
    let mut key = [0u8; 32];
    argon2::Argon2::default()
        .hash_password_into(password, salt, &mut key)
        .map_err(|e| AliPcsError::Crypto(format!("密钥派生失败: {}", e)))?;
    Ok(key)
}

/// 帧序号 -> 12 字节 nonce
fn frame_nonce(index: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&index.to_be_bytes());
    nonce
}

/// 帧加解密器（加密与解密共用，状态只有密钥与头部）
#[derive(Clone)]
pub struct FrameCipher {
    algo: EncryptType,
    key: [u8; 32],
    header: Vec<u8>,
    origin_len: u64,
}

impl FrameCipher {
    /// 新建加密器（随机 salt）
    pub fn new_encryptor(algo: EncryptType, password: &[u8], origin_len: u64) -> PcsResult<Self> {
        debug_assert!(algo != EncryptType::No);

        let mut salt = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Self::build(algo, password, &salt, origin_len)
    }

    fn build(algo: EncryptType, password: &[u8], salt: &[u8; 16], origin_len: u64) -> PcsResult<Self> {
        let key = derive_key(password, salt)?;

        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        header.extend_from_slice(CRYPTO_MAGIC);
        header.push(CRYPTO_VERSION);
        header.push(algo.magic_code());
        header.extend_from_slice(salt);
        header.extend_from_slice(&origin_len.to_be_bytes());

        Ok(FrameCipher {
            algo,
            key,
            header,
            origin_len,
        })
    }

    /// 解析文件头并重建解密器
    ///
    /// 头部不是密文，但参与每帧 AAD 认证，被篡改会导致所有帧解密失败
    pub fn from_header(head: &[u8], password: &[u8]) -> PcsResult<Self> {
        if head.len() < HEADER_LEN as usize {
            return Err(AliPcsError::Crypto("文件头长度不足".to_string()));
        }
        if &head[..18] != CRYPTO_MAGIC {
            return Err(AliPcsError::Crypto("魔数不匹配，不是加密容器".to_string()));
        }
        if head[18] != CRYPTO_VERSION {
            return Err(AliPcsError::Crypto(format!("不支持的容器版本: {}", head[18])));
        }
        let algo = EncryptType::from_magic_code(head[19])
            .ok_or_else(|| AliPcsError::Crypto(format!("未知算法编码: {}", head[19])))?;

        let mut salt = [0u8; 16];
        salt.copy_from_slice(&head[20..36]);
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&head[36..44]);
        let origin_len = u64::from_be_bytes(len_bytes);

        Self::build(algo, password, &salt, origin_len)
    }

    /// 判断头部是否为本容器格式
    pub fn is_encrypted_header(head: &[u8]) -> bool {
        head.len() >= 18 && &head[..18] == CRYPTO_MAGIC
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// 原始明文总长
    pub fn origin_len(&self) -> u64 {
        self.origin_len
    }

    /// 明文帧数
    pub fn frame_count(&self) -> u64 {
        self.origin_len.div_ceil(FRAME_SIZE)
    }

    /// 加密后的文件总长（头 + 各帧密文）
    pub fn encrypted_len(&self) -> u64 {
        HEADER_LEN + self.origin_len + self.frame_count() * TAG_SIZE
    }

    /// 第 `index` 帧的明文长度
    fn frame_plain_len(&self, index: u64) -> u64 {
        let start = index * FRAME_SIZE;
        FRAME_SIZE.min(self.origin_len - start)
    }

    /// 第 `index` 帧密文在文件中的起始偏移
    pub fn frame_cipher_offset(&self, index: u64) -> u64 {
        HEADER_LEN + index * (FRAME_SIZE + TAG_SIZE)
    }

    fn seal_open(&self, index: u64, data: &[u8], encrypt: bool) -> PcsResult<Vec<u8>> {
        let nonce = frame_nonce(index);
        let payload = Payload {
            msg: data,
            aad: &self.header,
        };
        let result = match self.algo {
            EncryptType::ChaCha20 => {
                let cipher = ChaCha20Poly1305::new((&self.key).into());
                if encrypt {
                    cipher.encrypt((&nonce).into(), payload)
                } else {
                    cipher.decrypt((&nonce).into(), payload)
                }
            }
            EncryptType::AesGcm => {
                let cipher = Aes256Gcm::new((&self.key).into());
                if encrypt {
                    cipher.encrypt((&nonce).into(), payload)
                } else {
                    cipher.decrypt((&nonce).into(), payload)
                }
            }
            EncryptType::No => return Ok(data.to_vec()),
        };
        result.map_err(|_| {
            AliPcsError::Crypto(format!("帧 {} 解封失败（口令错误或内容被篡改）", index))
        })
    }

    /// 封装一帧
    pub fn seal_frame(&self, index: u64, plaintext: &[u8]) -> PcsResult<Vec<u8>> {
        debug_assert!(plaintext.len() as u64 <= FRAME_SIZE);
        self.seal_open(index, plaintext, true)
    }

    /// 解开一帧
    pub fn open_frame(&self, index: u64, ciphertext: &[u8]) -> PcsResult<Vec<u8>> {
        self.seal_open(index, ciphertext, false)
    }
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCipher")
            .field("algo", &self.algo)
            .field("origin_len", &self.origin_len)
            .finish()
    }
}

/// 下载侧的透明解密过滤器
///
/// 负责明文区间与密文区间的换算：按帧对齐取密文、逐帧解开、
/// 再裁剪出调用方想要的明文区间。任何 chunk 重试都是纯函数重算。
pub struct FileDecryptor {
    cipher: FrameCipher,
}

impl FileDecryptor {
    pub fn new(cipher: FrameCipher) -> Self {
        FileDecryptor { cipher }
    }

    /// 明文总长
    pub fn plain_len(&self) -> u64 {
        self.cipher.origin_len()
    }

    /// 明文区间对应的密文区间（帧对齐，含头部偏移）
    ///
    /// 返回 (cipher_start, cipher_end, first_frame)
    pub fn cipher_range(&self, plain_start: u64, plain_end: u64) -> (u64, u64, u64) {
        debug_assert!(plain_start <= plain_end);
        let first_frame = plain_start / FRAME_SIZE;
        let last_frame = if plain_end == 0 {
            0
        } else {
            (plain_end - 1) / FRAME_SIZE
        };

        let start = self.cipher.frame_cipher_offset(first_frame);
        let end_frame_cipher_len = self.cipher.frame_plain_len(last_frame.min(
            self.cipher.frame_count().saturating_sub(1),
        )) + TAG_SIZE;
        let end = self.cipher.frame_cipher_offset(last_frame) + end_frame_cipher_len;
        (start, end.min(self.cipher.encrypted_len()), first_frame)
    }

    /// 解密一段帧对齐的密文并裁剪出明文区间
    ///
    /// `cipher_chunk` 必须从 `first_frame` 帧的密文起点开始
    pub fn decrypt_range(
        &self,
        cipher_chunk: &[u8],
        first_frame: u64,
        plain_start: u64,
        plain_end: u64,
    ) -> PcsResult<Vec<u8>> {
        let mut plain = Vec::with_capacity((plain_end - plain_start) as usize);
        let mut frame = first_frame;
        let mut offset = 0usize;

        while offset < cipher_chunk.len() && frame < self.cipher.frame_count() {
            let frame_len = (self.cipher.frame_plain_len(frame) + TAG_SIZE) as usize;
            if offset + frame_len > cipher_chunk.len() {
                return Err(AliPcsError::Crypto(format!(
                    "帧 {} 密文不完整: 需要 {} 字节，剩余 {}",
                    frame,
                    frame_len,
                    cipher_chunk.len() - offset
                )));
            }
            let opened = self.cipher.open_frame(frame, &cipher_chunk[offset..offset + frame_len])?;
            plain.extend_from_slice(&opened);
            offset += frame_len;
            frame += 1;
        }

        // 裁剪出调用方要的明文区间
        let base = first_frame * FRAME_SIZE;
        let lo = (plain_start - base) as usize;
        let hi = ((plain_end - base) as usize).min(plain.len());
        if lo > plain.len() {
            return Err(AliPcsError::Crypto("解密结果长度不足".to_string()));
        }
        Ok(plain[lo..hi].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seal_all(cipher: &FrameCipher, plaintext: &[u8]) -> Vec<u8> {
        let mut out = cipher.header().to_vec();
        for (i, chunk) in plaintext.chunks(FRAME_SIZE as usize).enumerate() {
            out.extend_from_slice(&cipher.seal_frame(i as u64, chunk).unwrap());
        }
        out
    }

    #[test]
    fn test_roundtrip_small() {
        let plaintext = b"hello alipan".to_vec();
        let cipher =
            FrameCipher::new_encryptor(EncryptType::ChaCha20, b"pwd", plaintext.len() as u64)
                .unwrap();
        let sealed = seal_all(&cipher, &plaintext);
        assert_eq!(sealed.len() as u64, cipher.encrypted_len());

        let decryptor =
            FileDecryptor::new(FrameCipher::from_header(&sealed[..HEADER_LEN as usize], b"pwd").unwrap());
        let plain = decryptor
            .decrypt_range(&sealed[HEADER_LEN as usize..], 0, 0, plaintext.len() as u64)
            .unwrap();
        assert_eq!(plain, plaintext);
    }

    #[test]
    fn test_roundtrip_across_frame_boundary() {
        // 跨帧内容 + 两种算法
        for algo in [EncryptType::ChaCha20, EncryptType::AesGcm] {
            let plaintext: Vec<u8> = (0..(FRAME_SIZE + 1000)).map(|i| (i % 251) as u8).collect();
            let cipher = FrameCipher::new_encryptor(algo, b"secret", plaintext.len() as u64).unwrap();
            let sealed = seal_all(&cipher, &plaintext);

            let decryptor = FileDecryptor::new(
                FrameCipher::from_header(&sealed[..HEADER_LEN as usize], b"secret").unwrap(),
            );

            // 取跨越帧边界的中间一段
            let (start, end) = (FRAME_SIZE - 100, FRAME_SIZE + 100);
            let (cs, ce, first_frame) = decryptor.cipher_range(start, end);
            let plain = decryptor
                .decrypt_range(&sealed[cs as usize..ce as usize], first_frame, start, end)
                .unwrap();
            assert_eq!(&plain[..], &plaintext[start as usize..end as usize]);
        }
    }

    #[test]
    fn test_wrong_password_fails() {
        let plaintext = b"content".to_vec();
        let cipher =
            FrameCipher::new_encryptor(EncryptType::AesGcm, b"right", plaintext.len() as u64)
                .unwrap();
        let sealed = seal_all(&cipher, &plaintext);

        let decryptor = FileDecryptor::new(
            FrameCipher::from_header(&sealed[..HEADER_LEN as usize], b"wrong").unwrap(),
        );
        assert!(decryptor
            .decrypt_range(&sealed[HEADER_LEN as usize..], 0, 0, plaintext.len() as u64)
            .is_err());
    }

    #[test]
    fn test_tampered_frame_detected() {
        let plaintext = vec![7u8; 1024];
        let cipher =
            FrameCipher::new_encryptor(EncryptType::ChaCha20, b"pwd", plaintext.len() as u64)
                .unwrap();
        let mut sealed = seal_all(&cipher, &plaintext);

        // 翻转一个密文字节
        let idx = HEADER_LEN as usize + 10;
        sealed[idx] ^= 0xff;

        let decryptor = FileDecryptor::new(
            FrameCipher::from_header(&sealed[..HEADER_LEN as usize], b"pwd").unwrap(),
        );
        assert!(decryptor
            .decrypt_range(&sealed[HEADER_LEN as usize..], 0, 0, plaintext.len() as u64)
            .is_err());
    }

    #[test]
    fn test_header_detection() {
        let cipher = FrameCipher::new_encryptor(EncryptType::ChaCha20, b"p", 10).unwrap();
        assert!(FrameCipher::is_encrypted_header(cipher.header()));
        assert!(!FrameCipher::is_encrypted_header(b"plain old bytes here......."));
    }

    #[test]
    fn test_cipher_range_math() {
        let origin_len = 3 * FRAME_SIZE + 17;
        let cipher = FrameCipher::new_encryptor(EncryptType::ChaCha20, b"p", origin_len).unwrap();
        assert_eq!(cipher.frame_count(), 4);
        assert_eq!(cipher.encrypted_len(), HEADER_LEN + origin_len + 4 * TAG_SIZE);

        let decryptor = FileDecryptor::new(cipher);

        // 第 0 帧内的区间
        let (cs, _ce, ff) = decryptor.cipher_range(10, 20);
        assert_eq!(ff, 0);
        assert_eq!(cs, HEADER_LEN);

        // 从第 1 帧开始的区间
        let (cs, _ce, ff) = decryptor.cipher_range(FRAME_SIZE, FRAME_SIZE + 5);
        assert_eq!(ff, 1);
        assert_eq!(cs, HEADER_LEN + FRAME_SIZE + TAG_SIZE);

        // 末帧收尾不越界
        let (_cs, ce, _ff) = decryptor.cipher_range(origin_len - 5, origin_len);
        assert_eq!(ce, decryptor.cipher.encrypted_len());
    }
}
