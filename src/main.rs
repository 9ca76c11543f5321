//! 阿里云盘命令行客户端

use alipcs_rust::common::path::{path_basename, join_path};
use alipcs_rust::config::{config_path, data_dir};
use alipcs_rust::downloader::{download, DownloadJob, DownloadOptions};
use alipcs_rust::logging::init_logging;
use alipcs_rust::pcs::{AliPcs, AliPcsApi, CheckNameMode};
use alipcs_rust::storage::{Account, AccountManager, SharedStore};
use alipcs_rust::uploader::{from_tos, upload, UploadOptions};
use alipcs_rust::{AppConfig, Credentials, EncryptType, PauseSwitch, RemoteFile};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "alipcs", about = "阿里云盘命令行客户端", version)]
struct Cli {
    /// 使用指定账户（默认当前账户）
    #[arg(long, global = true)]
    account: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 添加账户（提供 refresh token）
    UserAdd {
        name: String,
        refresh_token: String,
    },
    /// 列出所有账户
    UserList,
    /// 切换当前账户
    UserUse { name: String },
    /// 删除账户
    UserDelete { name: String },
    /// 显示当前用户信息
    Who,
    /// 列目录
    Ls {
        #[arg(default_value = "/")]
        remotepath: String,
        /// 递归列出子目录
        #[arg(short, long)]
        recursive: bool,
    },
    /// 按关键字搜索文件
    Search { keyword: String },
    /// 创建目录（逐级创建）
    Mkdir { remotedir: String },
    /// 移动文件（最后一个参数为目标目录）
    Mv { remotepaths: Vec<String> },
    /// 重命名
    Rename {
        remotepath: String,
        new_name: String,
    },
    /// 删除（移入回收站）
    Rm { remotepaths: Vec<String> },
    /// 上传文件/目录
    Upload {
        localpaths: Vec<PathBuf>,
        /// 目标远程目录
        #[arg(short = 'd', long, default_value = "/")]
        remotedir: String,
        /// 单文件分片并发数（大文件可设 >1）
        #[arg(long)]
        slice_workers: Option<usize>,
        /// 仅允许秒传
        #[arg(long)]
        rapid_only: bool,
        /// 内容加密口令
        #[arg(long)]
        encrypt_password: Option<String>,
        /// 加密算法: no / chacha20 / aesgcm
        #[arg(long, default_value = "no")]
        encrypt_type: String,
    },
    /// 下载文件/目录
    Download {
        remotepaths: Vec<String>,
        /// 本地输出目录
        #[arg(short, long)]
        outdir: Option<PathBuf>,
        /// 禁用断点续传
        #[arg(long)]
        no_continue: bool,
        /// 递归下载目录
        #[arg(short, long)]
        recursive: bool,
        /// 解密口令
        #[arg(long)]
        encrypt_password: Option<String>,
    },
    /// 输出远程文件内容到标准输出
    Cat {
        remotepath: String,
        /// 解密口令
        #[arg(long)]
        encrypt_password: Option<String>,
    },
    /// 创建分享链接
    Share {
        remotepaths: Vec<String>,
        /// 提取码（4 位）
        #[arg(long, default_value = "")]
        password: String,
        /// 有效天数（0 = 永久）
        #[arg(long, default_value_t = 0)]
        period: u64,
    },
    /// 列出我创建的分享
    Shared,
    /// 取消分享
    CancelShared { share_ids: Vec<String> },
    /// 收藏他人的分享链接
    SaveShared {
        share_url: String,
        #[arg(long, default_value = "")]
        password: String,
    },
    /// 列出收藏的分享链接
    StoredShared {
        /// 模糊搜索关键字
        #[arg(long)]
        keyword: Option<String>,
    },
    /// 转存分享内容到自己网盘
    Transfer {
        share_url: String,
        #[arg(long, default_value = "")]
        password: String,
        /// 转存到的远程目录
        #[arg(short = 'd', long, default_value = "/")]
        remotedir: String,
    },
}

/// 从分享链接中提取 share_id；纯 ID 原样返回
fn parse_share_id(share_url: &str) -> Result<String> {
    let re = regex::Regex::new(r"/s/([0-9a-zA-Z_-]+)")?;
    if let Some(caps) = re.captures(share_url) {
        return Ok(caps[1].to_string());
    }
    if share_url.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Ok(share_url.to_string());
    }
    bail!("无法从 `{}` 中提取分享 ID", share_url)
}

fn human_size(size: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", size, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn print_files(files: &[RemoteFile]) {
    for f in files {
        let kind = if f.is_dir() { "d" } else { "-" };
        let shown = if f.path.is_empty() { &f.name } else { &f.path };
        println!("{} {:>10}  {}", kind, human_size(f.size), shown);
    }
}

/// 把远程路径解析为下载任务（目录按需递归展开）
async fn resolve_download_jobs(
    api: &AliPcsApi,
    remotepaths: &[String],
    outdir: &std::path::Path,
    recursive: bool,
) -> Result<Vec<DownloadJob>> {
    let mut jobs = Vec::new();
    for remotepath in remotepaths {
        let pf = api
            .get_file(remotepath)
            .await?
            .with_context(|| format!("`{}` 不存在", remotepath))?;

        if pf.is_file() {
            jobs.push(DownloadJob {
                localpath: outdir.join(path_basename(remotepath)),
                file: pf,
            });
        } else if recursive {
            let base_name = path_basename(remotepath);
            for sub in api.walk(&pf.file_id, remotepath).await? {
                if !sub.is_file() {
                    continue;
                }
                // 远程相对路径映射为本地子路径
                let relative = sub.path.strip_prefix(remotepath.as_str()).unwrap_or(sub.name.as_str());
                let relative = relative.trim_start_matches('/');
                jobs.push(DownloadJob {
                    localpath: outdir.join(&base_name).join(relative),
                    file: sub,
                });
            }
        } else {
            bail!("`{}` 是目录，递归下载请加 --recursive", remotepath);
        }
    }
    Ok(jobs)
}

async fn run(cli: Cli, config: AppConfig, accounts: AccountManager) -> Result<()> {
    // 账户管理命令不需要 API 客户端
    match &cli.command {
        Commands::UserAdd { name, refresh_token } => {
            accounts.upsert(Account {
                name: name.clone(),
                credentials: Credentials::from_refresh_token(refresh_token.clone()),
            });
            accounts.save()?;
            println!("已添加账户 `{}`", name);
            return Ok(());
        }
        Commands::UserList => {
            let current = accounts.current_name();
            for account in accounts.list() {
                let marker = if Some(&account.name) == current.as_ref() { "*" } else { " " };
                println!("{} {} ({})", marker, account.name, account.credentials.user_name);
            }
            return Ok(());
        }
        Commands::UserUse { name } => {
            if !accounts.use_account(name) {
                bail!("账户 `{}` 不存在", name);
            }
            accounts.save()?;
            println!("当前账户: {}", name);
            return Ok(());
        }
        Commands::UserDelete { name } => {
            if !accounts.remove(name) {
                bail!("账户 `{}` 不存在", name);
            }
            accounts.save()?;
            println!("已删除账户 `{}`", name);
            return Ok(());
        }
        Commands::StoredShared { keyword } => {
            let store = SharedStore::new(&data_dir().join("shared.db"))?;
            let records = match keyword {
                Some(kw) => store.search(kw)?,
                None => store.list()?,
            };
            for r in records {
                let pwd = if r.password.is_empty() { "-" } else { &r.password };
                println!("{}  pwd={}  {}  {}", r.share_id, pwd, r.share_url, r.name);
            }
            return Ok(());
        }
        _ => {}
    }

    // 其余命令需要登录态
    let account = match &cli.account {
        Some(name) => accounts
            .get(name)
            .with_context(|| format!("账户 `{}` 不存在", name))?,
        None => accounts
            .current()
            .context("没有可用账户，请先执行 `alipcs user-add <名称> <refresh_token>`")?,
    };
    let pcs = AliPcs::new(account.credentials.clone())?;
    let api = Arc::new(AliPcsApi::new(pcs.clone()));

    let pause = PauseSwitch::new();
    let cancel = CancellationToken::new();

    let result = dispatch(&cli.command, &api, &config, pause, cancel).await;

    // 刷新过的凭证回写磁盘，下次启动免重新刷新
    accounts.update_credentials(&account.name, pcs.credentials().await);
    accounts.save()?;

    result
}

async fn dispatch(
    command: &Commands,
    api: &Arc<AliPcsApi>,
    config: &AppConfig,
    pause: PauseSwitch,
    cancel: CancellationToken,
) -> Result<()> {
    match command {
        Commands::Who => {
            let user = api.user_info().await?;
            println!("user_id:   {}", user.user_id);
            println!("user_name: {}", user.user_name);
            println!("nick_name: {}", user.nick_name);
            println!("drive_id:  {}", user.default_drive_id);
            println!(
                "space:     {} / {}",
                human_size(user.personal_space_info.used_size),
                human_size(user.personal_space_info.total_size)
            );
        }

        Commands::Ls { remotepath, recursive } => {
            let pf = api
                .get_file(remotepath)
                .await?
                .with_context(|| format!("`{}` 不存在", remotepath))?;
            if pf.is_file() {
                print_files(std::slice::from_ref(&pf));
            } else if *recursive {
                let files = api.walk(&pf.file_id, remotepath).await?;
                print_files(&files);
            } else {
                let mut files = api.list_all(&pf.file_id, None).await?;
                for f in &mut files {
                    f.path = join_path(remotepath, &f.name);
                }
                print_files(&files);
            }
        }

        Commands::Search { keyword } => {
            let files = api.search_all(keyword).await?;
            print_files(&files);
            println!("共 {} 个结果", files.len());
        }

        Commands::Mkdir { remotedir } => {
            let pf = api.makedir_path(remotedir).await?;
            println!("已创建 {} (file_id={})", remotedir, pf.file_id);
        }

        Commands::Mv { remotepaths } => {
            if remotepaths.len() < 2 {
                bail!("用法: alipcs mv <源路径>... <目标目录>");
            }
            let (sources, dest) = remotepaths.split_at(remotepaths.len() - 1);
            let dest_dir = api
                .get_file(&dest[0])
                .await?
                .with_context(|| format!("目标目录 `{}` 不存在", dest[0]))?;

            let mut source_ids = Vec::new();
            for path in sources {
                let pf = api
                    .get_file(path)
                    .await?
                    .with_context(|| format!("`{}` 不存在", path))?;
                source_ids.push(pf.file_id);
            }

            let oks = api.move_files(&source_ids, &dest_dir.file_id).await?;
            for (path, ok) in sources.iter().zip(oks) {
                println!("{} {}", if ok { "已移动" } else { "移动失败" }, path);
            }
        }

        Commands::Rename { remotepath, new_name } => {
            let pf = api
                .get_file(remotepath)
                .await?
                .with_context(|| format!("`{}` 不存在", remotepath))?;
            api.rename(&pf.file_id, new_name).await?;
            println!("已重命名 {} -> {}", remotepath, new_name);
        }

        Commands::Rm { remotepaths } => {
            let mut ids = Vec::new();
            for path in remotepaths {
                let pf = api
                    .get_file(path)
                    .await?
                    .with_context(|| format!("`{}` 不存在", path))?;
                ids.push(pf.file_id);
            }
            api.remove(&ids).await?;
            println!("已删除 {} 项", ids.len());
        }

        Commands::Upload {
            localpaths,
            remotedir,
            slice_workers,
            rapid_only,
            encrypt_password,
            encrypt_type,
        } => {
            let opts = UploadOptions {
                check_name_mode: CheckNameMode::Overwrite,
                slice_size: config.upload.slice_size_mb * 1024 * 1024,
                max_workers: config.upload.max_workers,
                slice_workers: (*slice_workers).unwrap_or(config.upload.slice_workers),
                max_slice_retries: config.upload.max_slice_retries,
                only_rapid_upload: *rapid_only,
                encrypt_type: encrypt_type.parse::<EncryptType>().map_err(anyhow::Error::msg)?,
                encrypt_password: encrypt_password.clone().unwrap_or_default().into_bytes(),
            };

            let from_to_list = from_tos(localpaths, remotedir);
            if from_to_list.is_empty() {
                bail!("没有可上传的文件");
            }

            let outcomes = upload(api.clone(), from_to_list, opts, pause, cancel).await;
            let mut failed = 0;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(_) => println!("上传成功: {}", outcome.from_to.remotepath),
                    Err(err) => {
                        failed += 1;
                        eprintln!("上传失败: {}: {:#}", outcome.from_to.remotepath, err);
                    }
                }
            }
            if failed > 0 {
                bail!("{} 个文件上传失败", failed);
            }
        }

        Commands::Download {
            remotepaths,
            outdir,
            no_continue,
            recursive,
            encrypt_password,
        } => {
            let outdir = outdir.clone().unwrap_or_else(|| config.download.download_dir.clone());
            let opts = DownloadOptions {
                max_workers: config.download.max_workers,
                max_retries: config.download.max_retries,
                max_chunk_size: config.download.chunk_size_mb * 1024 * 1024,
                continue_: !*no_continue && config.download.continue_,
                encrypt_password: encrypt_password.clone().unwrap_or_default().into_bytes(),
            };

            let jobs = resolve_download_jobs(api, remotepaths, &outdir, *recursive).await?;
            if jobs.is_empty() {
                bail!("没有可下载的文件");
            }

            let outcomes = download(api.clone(), jobs, opts, pause, cancel).await;
            let mut failed = 0;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(()) => println!("下载成功: {:?}", outcome.job.localpath),
                    Err(err) => {
                        failed += 1;
                        eprintln!("下载失败: {:?}: {:#}", outcome.job.localpath, err);
                    }
                }
            }
            if failed > 0 {
                bail!("{} 个文件下载失败", failed);
            }
        }

        Commands::Cat { remotepath, encrypt_password } => {
            let pf = api
                .get_file(remotepath)
                .await?
                .with_context(|| format!("`{}` 不存在", remotepath))?;
            if !pf.is_file() {
                bail!("`{}` 不是文件", remotepath);
            }

            let password = encrypt_password.clone().unwrap_or_default().into_bytes();
            let mut stream = api.file_stream(&pf.file_id, &password).await?;

            let mut stdout = tokio::io::stdout();
            while let Some(buf) = stream.next_chunk().await? {
                stdout.write_all(&buf).await?;
            }
            stdout.flush().await?;
        }

        Commands::Share { remotepaths, password, period } => {
            let mut ids = Vec::new();
            for path in remotepaths {
                let pf = api
                    .get_file(path)
                    .await?
                    .with_context(|| format!("`{}` 不存在", path))?;
                ids.push(pf.file_id);
            }
            let link = api.share(&ids, password, *period, "").await?;
            println!("分享链接: {}", link.share_url);
            if link.has_password() {
                println!("提取码:   {}", link.share_pwd);
            }
        }

        Commands::Shared => {
            for link in api.list_shared_all().await? {
                let pwd = if link.share_pwd.is_empty() { "-" } else { &link.share_pwd };
                println!("{}  pwd={}  {}  {}", link.share_id, pwd, link.share_url, link.share_name);
            }
        }

        Commands::CancelShared { share_ids } => {
            let oks = api.cancel_shared(share_ids).await?;
            for (id, ok) in share_ids.iter().zip(oks) {
                println!("{} {}", if ok { "已取消" } else { "取消失败" }, id);
            }
        }

        Commands::SaveShared { share_url, password } => {
            let share_id = parse_share_id(share_url)?;
            let info = api.shared_info(&share_id).await?;
            let store = SharedStore::new(&data_dir().join("shared.db"))?;
            store.add(&share_id, &info.share_url(), password, &info.share_name)?;
            println!("已收藏分享: {} ({})", info.share_name, share_id);
        }

        Commands::Transfer { share_url, password, remotedir } => {
            let share_id = parse_share_id(share_url)?;
            api.get_share_token(&share_id, password).await?;

            let dest = api
                .get_file(remotedir)
                .await?
                .with_context(|| format!("目标目录 `{}` 不存在", remotedir))?;

            // 转存分享根下的全部条目
            let entries = api.list_all("root", Some(&share_id)).await?;
            if entries.is_empty() {
                bail!("分享内容为空");
            }
            let ids: Vec<String> = entries.iter().map(|f| f.file_id.clone()).collect();
            let saved = api.transfer_shared_files(&ids, &dest.file_id, &share_id).await?;
            println!("已转存 {} 项到 {}", saved.len(), remotedir);
        }

        // 账户与收藏命令在上层处理
        Commands::UserAdd { .. }
        | Commands::UserList
        | Commands::UserUse { .. }
        | Commands::UserDelete { .. }
        | Commands::StoredShared { .. } => unreachable!(),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(&config_path())?;
    let _log_guard = init_logging(&config.log);

    let accounts = AccountManager::load(&data_dir().join("accounts.json"))?;

    run(cli, config, accounts).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_share_id() {
        assert_eq!(
            parse_share_id("https://www.alipan.com/s/abc123XY").unwrap(),
            "abc123XY"
        );
        assert_eq!(
            parse_share_id("https://www.aliyundrive.com/s/xyz_9-b?pwd=1a2b").unwrap(),
            "xyz_9-b"
        );
        assert_eq!(parse_share_id("bareid42").unwrap(), "bareid42");
        assert!(parse_share_id("https://example.com/nothing").is_err());
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(5), "5 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MB");
    }
}
