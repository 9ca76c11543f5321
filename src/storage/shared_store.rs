// 分享链接收藏库
//
// 把他人的分享链接（含提取码）存进 SQLite，方便之后转存/浏览。

use crate::common::date::now_timestamp;
use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// 一条收藏的分享链接
#[derive(Debug, Clone, PartialEq)]
pub struct SharedLinkRecord {
    pub share_id: String,
    pub share_url: String,
    /// 提取码（空串表示无密码）
    pub password: String,
    pub name: String,
    /// 收藏时间（Unix 秒）
    pub stored_at: i64,
}

/// 分享链接存储
pub struct SharedStore {
    conn: Mutex<Connection>,
}

impl SharedStore {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        Ok(store)
    }

    /// 内存库（测试用）
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_tables()?;
        Ok(store)
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS shared_links (
                share_id TEXT PRIMARY KEY,
                share_url TEXT NOT NULL,
                password TEXT NOT NULL DEFAULT '',
                name TEXT NOT NULL DEFAULT '',
                stored_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_shared_links_stored_at ON shared_links(stored_at)",
            [],
        )?;
        Ok(())
    }

    /// 收藏（同一 share_id 重复收藏时覆盖更新）
    pub fn add(&self, share_id: &str, share_url: &str, password: &str, name: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;
        conn.execute(
            r#"
            INSERT INTO shared_links (share_id, share_url, password, name, stored_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(share_id) DO UPDATE SET
                share_url = excluded.share_url,
                password = excluded.password,
                name = excluded.name
            "#,
            params![share_id, share_url, password, name, now_timestamp()],
        )?;
        debug!("收藏分享链接: {}", share_id);
        Ok(())
    }

    pub fn remove(&self, share_id: &str) -> Result<bool> {
        let conn = self.conn.lock().map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;
        let n = conn.execute("DELETE FROM shared_links WHERE share_id = ?1", params![share_id])?;
        Ok(n > 0)
    }

    pub fn get(&self, share_id: &str) -> Result<Option<SharedLinkRecord>> {
        let conn = self.conn.lock().map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;
        let mut stmt = conn.prepare(
            "SELECT share_id, share_url, password, name, stored_at FROM shared_links WHERE share_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![share_id], row_to_record)?;
        Ok(rows.next().transpose()?)
    }

    /// 按收藏时间倒序列出全部
    pub fn list(&self) -> Result<Vec<SharedLinkRecord>> {
        let conn = self.conn.lock().map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;
        let mut stmt = conn.prepare(
            "SELECT share_id, share_url, password, name, stored_at FROM shared_links ORDER BY stored_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// 名称/链接模糊搜索
    pub fn search(&self, keyword: &str) -> Result<Vec<SharedLinkRecord>> {
        let conn = self.conn.lock().map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;
        let pattern = format!("%{}%", keyword);
        let mut stmt = conn.prepare(
            r#"
            SELECT share_id, share_url, password, name, stored_at
            FROM shared_links
            WHERE name LIKE ?1 OR share_url LIKE ?1
            ORDER BY stored_at DESC
            "#,
        )?;
        let rows = stmt.query_map(params![pattern], row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SharedLinkRecord> {
    Ok(SharedLinkRecord {
        share_id: row.get(0)?,
        share_url: row.get(1)?,
        password: row.get(2)?,
        name: row.get(3)?,
        stored_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_get() {
        let store = SharedStore::in_memory().unwrap();
        store
            .add("s1", "https://www.alipan.com/s/abc", "1a2b", "电影合集")
            .unwrap();

        let record = store.get("s1").unwrap().unwrap();
        assert_eq!(record.password, "1a2b");
        assert_eq!(record.name, "电影合集");
        assert!(record.stored_at > 0);
    }

    #[test]
    fn test_upsert_overwrites() {
        let store = SharedStore::in_memory().unwrap();
        store.add("s1", "https://x/s/a", "", "旧名字").unwrap();
        store.add("s1", "https://x/s/a", "9z8y", "新名字").unwrap();

        let all = store.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "新名字");
        assert_eq!(all[0].password, "9z8y");
    }

    #[test]
    fn test_remove() {
        let store = SharedStore::in_memory().unwrap();
        store.add("s1", "u", "", "n").unwrap();
        assert!(store.remove("s1").unwrap());
        assert!(!store.remove("s1").unwrap());
        assert!(store.get("s1").unwrap().is_none());
    }

    #[test]
    fn test_search() {
        let store = SharedStore::in_memory().unwrap();
        store.add("s1", "https://x/s/a", "", "电影合集").unwrap();
        store.add("s2", "https://x/s/b", "", "电子书").unwrap();

        let hits = store.search("电影").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].share_id, "s1");

        let hits = store.search("电").unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_persists_to_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = dir.path().join("data/shared.db");

        {
            let store = SharedStore::new(&db_path).unwrap();
            store.add("s1", "u", "p", "n").unwrap();
        }

        let store = SharedStore::new(&db_path).unwrap();
        assert!(store.get("s1").unwrap().is_some());
    }
}
