// 远程路径解析缓存
//
// 服务端只认 file_id，路径是客户端在其上搭的一层便利抽象。
// PathTree 按需拉取目录列表，把"绝对路径 -> file_id"的解析结果
// 缓存成一棵懒加载树：
//
// - 节点出现在树里，意味着它的存在已经被一次列表调用确认过，
//   不做任何推测性预填
// - 整棵树共用一把互斥锁，并发解析同一目录时只会触发一次列表
// - 没有 TTL；过期只通过显式 invalidate 或查无此名来纠正

use crate::common::path::{join_path, split_path};
use crate::error::PcsResult;
use crate::pcs::types::RemoteFile;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// 目录列表数据源
///
/// PathTree 只依赖这一个口子，测试时用脚本化实现替代网络
#[async_trait]
pub trait ListDirectory: Send + Sync {
    /// 列目录一页，返回（条目，下一页标记）；标记为空串表示没有下一页
    async fn list_page(&self, file_id: &str, marker: &str) -> PcsResult<(Vec<RemoteFile>, String)>;
}

struct Node {
    file: RemoteFile,
    parent_id: String,
    /// 名称 -> 子节点 file_id
    children: HashMap<String, String>,
}

struct TreeInner {
    /// file_id -> 节点，同时充当反向索引
    nodes: HashMap<String, Node>,
}

impl TreeInner {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            "root".to_string(),
            Node {
                file: RemoteFile::root(),
                parent_id: "root".to_string(),
                children: HashMap::new(),
            },
        );
        TreeInner { nodes }
    }
}

/// 路径解析缓存树
pub struct PathTree {
    lister: Arc<dyn ListDirectory>,
    /// 整棵树一把锁：并发下钻同一目录时串行化 check-then-insert，
    /// 牺牲跨目录并发换取正确性（目录列表不在吞吐热路径上）
    inner: Mutex<TreeInner>,
}

impl PathTree {
    pub fn new(lister: Arc<dyn ListDirectory>) -> Self {
        PathTree {
            lister,
            inner: Mutex::new(TreeInner::new()),
        }
    }

    /// 解析绝对路径为远程文件
    ///
    /// 逐段下钻：段已缓存则零网络调用；未缓存则对当前目录发一次
    /// 列表调用，把返回的每个条目都写进缓存（摊薄同目录的后续查找），
    /// 一旦看到目标名字就提前停止扫描。
    /// 列表翻完仍未出现该名字时整个解析返回 None。
    pub async fn resolve(&self, remotepath: &str) -> PcsResult<Option<RemoteFile>> {
        let segments = split_path(remotepath);

        let mut inner = self.inner.lock().await;
        let mut current_id = "root".to_string();

        for segment in &segments {
            let cached_child = inner
                .nodes
                .get(&current_id)
                .and_then(|n| n.children.get(segment))
                .cloned();

            let next_id = match cached_child {
                Some(id) => id,
                None => {
                    self.expand(&mut inner, &current_id, segment).await?;
                    match inner
                        .nodes
                        .get(&current_id)
                        .and_then(|n| n.children.get(segment))
                        .cloned()
                    {
                        Some(id) => id,
                        None => {
                            debug!("路径解析失败: {} 下没有 {}", current_id, segment);
                            return Ok(None);
                        }
                    }
                }
            };
            current_id = next_id;
        }

        Ok(inner.nodes.get(&current_id).map(|n| n.file.clone()))
    }

    /// 拉取 `dir_id` 的列表并入缓存，发现 `wanted` 即提前返回
    ///
    /// 提前退出意味着同一页里排在目标之后的兄弟条目不会入缓存。
    /// TODO: 页已经拉回来了，剩余条目可以顺手缓存完再退出，待重写时评估
    async fn expand(&self, inner: &mut TreeInner, dir_id: &str, wanted: &str) -> PcsResult<()> {
        let dir_path = match inner.nodes.get(dir_id) {
            Some(n) => n.file.path.clone(),
            None => return Ok(()),
        };

        let mut marker = String::new();
        'pages: loop {
            let (entries, next_marker) = self.lister.list_page(dir_id, &marker).await?;

            for mut file in entries {
                let name = file.name.clone();
                let hit = name == wanted;

                let already_cached = inner
                    .nodes
                    .get(dir_id)
                    .map(|n| n.children.contains_key(&name))
                    .unwrap_or(false);
                if !already_cached {
                    // 服务端不返回完整路径，这里补写
                    file.path = join_path(&dir_path, &name);
                    let file_id = file.file_id.clone();
                    inner.nodes.insert(
                        file_id.clone(),
                        Node {
                            file,
                            parent_id: dir_id.to_string(),
                            children: HashMap::new(),
                        },
                    );
                    if let Some(parent) = inner.nodes.get_mut(dir_id) {
                        parent.children.insert(name, file_id);
                    }
                }

                if hit {
                    break 'pages;
                }
            }

            if next_marker.is_empty() {
                break;
            }
            marker = next_marker;
        }

        Ok(())
    }

    /// 使某个节点的缓存失效
    ///
    /// 重命名/移动/删除后必须调用，下一次解析该名字会重新列父目录。
    /// 根节点是哨兵，永远不会失效。
    pub async fn invalidate(&self, file_id: &str) -> Option<RemoteFile> {
        if file_id == "root" {
            return None;
        }

        let mut inner = self.inner.lock().await;

        let (name, parent_id, file) = {
            let node = inner.nodes.get(file_id)?;
            (node.file.name.clone(), node.parent_id.clone(), node.file.clone())
        };

        // 从父节点的名称表摘除
        if let Some(parent) = inner.nodes.get_mut(&parent_id) {
            parent.children.remove(&name);
        }

        // 连同子树一起移出反向索引（子树路径也随之作废）
        let mut pending = vec![file_id.to_string()];
        while let Some(id) = pending.pop() {
            if let Some(node) = inner.nodes.remove(&id) {
                pending.extend(node.children.into_values());
            }
        }

        Some(file)
    }

    /// 缓存的节点数量（不含根，测试与诊断用）
    pub async fn cached_count(&self) -> usize {
        self.inner.lock().await.nodes.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn file(id: &str, name: &str, parent: &str, is_dir: bool) -> RemoteFile {
        let mut f = RemoteFile::root();
        f.file_id = id.to_string();
        f.name = name.to_string();
        f.parent_file_id = parent.to_string();
        let kind = if is_dir { "folder" } else { "file" };
        f.file_type = kind.to_string();
        f.path = String::new();
        f
    }

    /// 脚本化目录数据源，记录列表调用次数
    struct ScriptedLister {
        /// dir_id -> 分页条目
        pages: HashMap<String, Vec<Vec<RemoteFile>>>,
        calls: AtomicUsize,
    }

    impl ScriptedLister {
        fn new(pages: HashMap<String, Vec<Vec<RemoteFile>>>) -> Self {
            ScriptedLister {
                pages,
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ListDirectory for ScriptedLister {
        async fn list_page(
            &self,
            file_id: &str,
            marker: &str,
        ) -> PcsResult<(Vec<RemoteFile>, String)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let pages = self.pages.get(file_id).cloned().unwrap_or_default();
            let idx: usize = if marker.is_empty() { 0 } else { marker.parse().unwrap() };
            let entries = pages.get(idx).cloned().unwrap_or_default();
            let next = if idx + 1 < pages.len() {
                (idx + 1).to_string()
            } else {
                String::new()
            };
            Ok((entries, next))
        }
    }

    fn demo_tree() -> (PathTree, Arc<ScriptedLister>) {
        let mut pages = HashMap::new();
        pages.insert(
            "root".to_string(),
            vec![vec![
                file("d1", "docs", "root", true),
                file("f1", "readme.txt", "root", false),
            ]],
        );
        pages.insert(
            "d1".to_string(),
            vec![vec![file("f2", "a.txt", "d1", false), file("f3", "b.txt", "d1", false)]],
        );
        let lister = Arc::new(ScriptedLister::new(pages));
        (PathTree::new(lister.clone() as Arc<dyn ListDirectory>), lister)
    }

    #[tokio::test]
    async fn test_resolve_walks_and_stamps_path() {
        let (tree, _) = demo_tree();
        let pf = tree.resolve("/docs/a.txt").await.unwrap().unwrap();
        assert_eq!(pf.file_id, "f2");
        assert_eq!(pf.path, "/docs/a.txt");
        assert!(pf.is_file());
    }

    #[tokio::test]
    async fn test_resolve_root() {
        let (tree, lister) = demo_tree();
        let root = tree.resolve("/").await.unwrap().unwrap();
        assert!(root.is_root());
        // 根目录解析不需要任何网络调用
        assert_eq!(lister.call_count(), 0);
    }

    #[tokio::test]
    async fn test_resolve_idempotent_second_hit_is_cached() {
        let (tree, lister) = demo_tree();

        tree.resolve("/docs/b.txt").await.unwrap().unwrap();
        let first = lister.call_count();
        assert_eq!(first, 2); // root 一次 + docs 一次

        // 第二次解析全程命中缓存，不再发起列表调用
        tree.resolve("/docs/b.txt").await.unwrap().unwrap();
        assert_eq!(lister.call_count(), first);
    }

    #[tokio::test]
    async fn test_sibling_amortization() {
        let (tree, lister) = demo_tree();

        // 解析 b.txt 时 a.txt 排在前面，顺带入了缓存
        tree.resolve("/docs/b.txt").await.unwrap().unwrap();
        let calls = lister.call_count();

        let pf = tree.resolve("/docs/a.txt").await.unwrap().unwrap();
        assert_eq!(pf.file_id, "f2");
        assert_eq!(lister.call_count(), calls);
    }

    #[tokio::test]
    async fn test_early_exit_skips_later_siblings() {
        // a.txt 在 b.txt 之前命中，扫描提前停止，b.txt 不会入缓存
        let (tree, lister) = demo_tree();

        tree.resolve("/docs/a.txt").await.unwrap().unwrap();
        let calls = lister.call_count();

        // 解析 b.txt 需要重新列一次 docs
        tree.resolve("/docs/b.txt").await.unwrap().unwrap();
        assert_eq!(lister.call_count(), calls + 1);
    }

    #[tokio::test]
    async fn test_resolve_missing_returns_none() {
        let (tree, _) = demo_tree();
        assert!(tree.resolve("/docs/missing.txt").await.unwrap().is_none());
        assert!(tree.resolve("/nope/whatever").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_forces_relist() {
        let (tree, lister) = demo_tree();

        let pf = tree.resolve("/docs/a.txt").await.unwrap().unwrap();
        let calls = lister.call_count();

        tree.invalidate(&pf.file_id).await.unwrap();

        // 失效后再次解析必须重新列父目录
        tree.resolve("/docs/a.txt").await.unwrap().unwrap();
        assert!(lister.call_count() > calls);
    }

    #[tokio::test]
    async fn test_invalidate_directory_drops_subtree() {
        let (tree, _) = demo_tree();

        // b.txt 在页内排第二，解析它时 a.txt 顺带入缓存
        tree.resolve("/docs/b.txt").await.unwrap().unwrap();
        assert_eq!(tree.cached_count().await, 3); // docs + a.txt + b.txt

        tree.invalidate("d1").await.unwrap();
        // docs 与其子节点一起被移出反向索引
        assert_eq!(tree.cached_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalidate_root_is_noop() {
        let (tree, _) = demo_tree();
        assert!(tree.invalidate("root").await.is_none());
        assert!(tree.resolve("/").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_multi_page_listing() {
        let mut pages = HashMap::new();
        pages.insert(
            "root".to_string(),
            vec![
                vec![file("f1", "page1.txt", "root", false)],
                vec![file("f2", "page2.txt", "root", false)],
            ],
        );
        let lister = Arc::new(ScriptedLister::new(pages));
        let tree = PathTree::new(lister.clone() as Arc<dyn ListDirectory>);

        // 目标在第二页，翻页直到命中
        let pf = tree.resolve("/page2.txt").await.unwrap().unwrap();
        assert_eq!(pf.file_id, "f2");
        assert_eq!(lister.call_count(), 2);
    }
}
