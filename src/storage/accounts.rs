// 账户存储
//
// 多账户的鉴权凭证落盘为 JSON，进程重启后可恢复。
// 写入采用"写临时文件再改名"，避免中途断电留下半个文件。

use crate::error::PcsResult;
use crate::pcs::Credentials;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// 一个命名账户
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    pub credentials: Credentials,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AccountData {
    /// 账户名 -> 账户（BTreeMap 保证落盘顺序稳定）
    #[serde(default)]
    accounts: BTreeMap<String, Account>,
    /// 当前使用的账户名
    #[serde(default)]
    current: Option<String>,
}

/// 账户管理器
pub struct AccountManager {
    path: PathBuf,
    data: RwLock<AccountData>,
}

impl AccountManager {
    /// 从磁盘加载（文件不存在时得到空管理器）
    pub fn load(path: &Path) -> PcsResult<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => AccountData::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(AccountManager {
            path: path.to_path_buf(),
            data: RwLock::new(data),
        })
    }

    /// 落盘（临时文件 + 改名）
    pub fn save(&self) -> PcsResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&*self.data.read())?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// 新增或更新账户；第一个账户自动成为当前账户
    pub fn upsert(&self, account: Account) {
        let mut data = self.data.write();
        let name = account.name.clone();
        data.accounts.insert(name.clone(), account);
        if data.current.is_none() {
            data.current = Some(name);
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut data = self.data.write();
        let removed = data.accounts.remove(name).is_some();
        if data.current.as_deref() == Some(name) {
            data.current = data.accounts.keys().next().cloned();
        }
        removed
    }

    /// 切换当前账户
    pub fn use_account(&self, name: &str) -> bool {
        let mut data = self.data.write();
        if data.accounts.contains_key(name) {
            data.current = Some(name.to_string());
            info!("切换到账户: {}", name);
            true
        } else {
            false
        }
    }

    pub fn get(&self, name: &str) -> Option<Account> {
        self.data.read().accounts.get(name).cloned()
    }

    /// 当前账户
    pub fn current(&self) -> Option<Account> {
        let data = self.data.read();
        let name = data.current.as_ref()?;
        data.accounts.get(name).cloned()
    }

    pub fn current_name(&self) -> Option<String> {
        self.data.read().current.clone()
    }

    pub fn list(&self) -> Vec<Account> {
        self.data.read().accounts.values().cloned().collect()
    }

    /// 回写某账户刷新后的凭证
    pub fn update_credentials(&self, name: &str, credentials: Credentials) {
        let mut data = self.data.write();
        if let Some(account) = data.accounts.get_mut(name) {
            account.credentials = credentials;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn account(name: &str) -> Account {
        Account {
            name: name.to_string(),
            credentials: Credentials::from_refresh_token(format!("rt-{}", name)),
        }
    }

    #[test]
    fn test_roundtrip_survives_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("accounts.json");

        let manager = AccountManager::load(&path).unwrap();
        manager.upsert(account("alice"));
        manager.upsert(account("bob"));
        manager.save().unwrap();

        // 重新加载后账户与当前账户都还在
        let reloaded = AccountManager::load(&path).unwrap();
        assert_eq!(reloaded.list().len(), 2);
        assert_eq!(reloaded.current_name().as_deref(), Some("alice"));
        assert_eq!(
            reloaded.get("bob").unwrap().credentials.refresh_token,
            "rt-bob"
        );
    }

    #[test]
    fn test_first_account_becomes_current() {
        let dir = TempDir::new().unwrap();
        let manager = AccountManager::load(&dir.path().join("a.json")).unwrap();
        assert!(manager.current().is_none());

        manager.upsert(account("alice"));
        assert_eq!(manager.current_name().as_deref(), Some("alice"));

        manager.upsert(account("bob"));
        assert_eq!(manager.current_name().as_deref(), Some("alice"));
    }

    #[test]
    fn test_use_and_remove() {
        let dir = TempDir::new().unwrap();
        let manager = AccountManager::load(&dir.path().join("a.json")).unwrap();
        manager.upsert(account("alice"));
        manager.upsert(account("bob"));

        assert!(manager.use_account("bob"));
        assert!(!manager.use_account("nobody"));

        // 删除当前账户后自动切到剩余账户
        assert!(manager.remove("bob"));
        assert_eq!(manager.current_name().as_deref(), Some("alice"));
    }

    #[test]
    fn test_update_credentials() {
        let dir = TempDir::new().unwrap();
        let manager = AccountManager::load(&dir.path().join("a.json")).unwrap();
        manager.upsert(account("alice"));

        let mut creds = Credentials::from_refresh_token("rt-new");
        creds.access_token = "at".to_string();
        manager.update_credentials("alice", creds);

        assert_eq!(manager.get("alice").unwrap().credentials.refresh_token, "rt-new");
    }
}
