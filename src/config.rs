// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 名义分片大小 (MB)
    #[serde(default = "default_slice_size_mb")]
    pub slice_size_mb: u64,
    /// 文件并发数
    #[serde(default = "default_upload_workers")]
    pub max_workers: usize,
    /// 单文件分片并发数（1 = 顺序）
    #[serde(default = "default_slice_workers")]
    pub slice_workers: usize,
    /// 单个分片重试上限（0 = 无限）
    #[serde(default)]
    pub max_slice_retries: u32,
}

fn default_slice_size_mb() -> u64 {
    80
}

fn default_upload_workers() -> usize {
    4
}

fn default_slice_workers() -> usize {
    1
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            slice_size_mb: default_slice_size_mb(),
            max_workers: default_upload_workers(),
            slice_workers: default_slice_workers(),
            max_slice_retries: 0,
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 默认下载目录
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// 文件并发数
    #[serde(default = "default_download_workers")]
    pub max_workers: usize,
    /// 单个文件的整体重试次数
    #[serde(default = "default_download_retries")]
    pub max_retries: u32,
    /// Range 请求最大跨度 (MB)
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    /// 断点续传
    #[serde(rename = "continue", default = "default_continue")]
    pub continue_: bool,
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_download_workers() -> usize {
    4
}

fn default_download_retries() -> u32 {
    2
}

fn default_chunk_size_mb() -> u64 {
    50
}

fn default_continue() -> bool {
    true
}

impl Default for DownloadConfig {
    fn default() -> Self {
        DownloadConfig {
            download_dir: default_download_dir(),
            max_workers: default_download_workers(),
            max_retries: default_download_retries(),
            chunk_size_mb: default_chunk_size_mb(),
            continue_: default_continue(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否写日志文件
    #[serde(default)]
    pub enabled: bool,
    /// 日志目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_dir() -> PathBuf {
    data_dir().join("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            enabled: false,
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

/// 配置文件路径
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("alipcs-rust")
        .join("config.toml")
}

/// 数据目录（账户、分享收藏库、日志）
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("alipcs-rust")
}

impl AppConfig {
    /// 从磁盘加载；文件不存在时返回默认配置
    pub fn load(path: &std::path::Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).context("解析配置文件失败"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
            Err(err) => Err(err).context("读取配置文件失败"),
        }
    }

    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        std::fs::write(path, content).context("写入配置文件失败")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.upload.slice_size_mb, 80);
        assert_eq!(config.upload.slice_workers, 1);
        assert_eq!(config.download.chunk_size_mb, 50);
        assert!(config.download.continue_);
        assert!(!config.log.enabled);
    }

    #[test]
    fn test_load_missing_gives_default() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.upload.max_workers, 4);
    }

    #[test]
    fn test_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.upload.slice_size_mb = 16;
        config.download.max_workers = 8;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.upload.slice_size_mb, 16);
        assert_eq!(loaded.download.max_workers, 8);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[upload]\nslice_size_mb = 32\n").unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.upload.slice_size_mb, 32);
        // 未写的字段用默认值
        assert_eq!(config.upload.max_workers, 4);
        assert_eq!(config.download.chunk_size_mb, 50);
    }
}
