// 下载引擎模块

pub mod engine;
pub mod stream;

pub use engine::{download, download_file, DownloadJob, DownloadOptions, DownloadOutcome};
pub use stream::{RangeStream, StreamProgressFn, DEFAULT_MAX_CHUNK_SIZE};
