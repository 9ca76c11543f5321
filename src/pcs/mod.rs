// 云盘 API 模块

pub mod api;
pub mod client;
pub mod path_tree;
pub mod types;

pub use api::{AliPcsApi, LinkSource};
pub use client::{AliPcs, CheckNameMode, Credentials, ShareTokenCache, APP_ID, PCS_UA};
pub use path_tree::{ListDirectory, PathTree};
pub use types::{
    DownloadUrlInfo, FileListPage, PcsSpace, PcsUser, PreparedUpload, RemoteFile, SharedAuth,
    SharedLink, SharedLinkInfo, UploadUrl,
};
