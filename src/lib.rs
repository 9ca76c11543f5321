// Alipan Drive Rust Library
// 阿里云盘 Rust 客户端核心库

// 公共工具模块
pub mod common;

// 配置管理模块
pub mod config;

// 内容加解密模块
pub mod crypto;

// 下载引擎模块
pub mod downloader;

// 错误类型
pub mod error;

// 日志模块
pub mod logging;

// 云盘 API 模块
pub mod pcs;

// 本地持久化模块
pub mod storage;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use common::control::PauseSwitch;
pub use config::AppConfig;
pub use crypto::EncryptType;
pub use downloader::{DownloadJob, DownloadOptions, RangeStream};
pub use error::{AliPcsError, PcsResult};
pub use pcs::{AliPcs, AliPcsApi, CheckNameMode, Credentials, PathTree, RemoteFile, ShareTokenCache};
pub use storage::{Account, AccountManager, SharedStore};
pub use uploader::{FromTo, UploadOptions};
