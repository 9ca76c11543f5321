// 远程 POSIX 路径工具
//
// 网盘侧的路径永远使用 `/` 分隔，与本地操作系统无关，
// 因此不走 std::path，全部按字符串处理。

/// 拆分绝对路径为路径段（忽略根与空段）
///
/// `"/a/b/c"` -> `["a", "b", "c"]`，`"/"` -> `[]`
pub fn split_path(remotepath: &str) -> Vec<String> {
    remotepath
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// 拼接远程路径，保证以 `/` 开头且不出现重复分隔符
pub fn join_path(base: &str, name: &str) -> String {
    let mut parts: Vec<&str> = base.split('/').filter(|s| !s.is_empty()).collect();
    parts.extend(name.split('/').filter(|s| !s.is_empty()));
    format!("/{}", parts.join("/"))
}

/// 取远程路径的目录部分
///
/// `"/a/b/c"` -> `"/a/b"`，`"/a"` -> `"/"`
pub fn path_dirname(remotepath: &str) -> String {
    let parts = split_path(remotepath);
    if parts.len() <= 1 {
        "/".to_string()
    } else {
        format!("/{}", parts[..parts.len() - 1].join("/"))
    }
}

/// 取远程路径的最后一段
pub fn path_basename(remotepath: &str) -> String {
    split_path(remotepath).pop().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/a/b/c"), vec!["a", "b", "c"]);
        assert_eq!(split_path("/"), Vec::<String>::new());
        assert_eq!(split_path("//a//b/"), vec!["a", "b"]);
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a/b", "c"), "/a/b/c");
        assert_eq!(join_path("/a/", "/b/c"), "/a/b/c");
    }

    #[test]
    fn test_dirname_basename() {
        assert_eq!(path_dirname("/a/b/c"), "/a/b");
        assert_eq!(path_dirname("/a"), "/");
        assert_eq!(path_dirname("/"), "/");
        assert_eq!(path_basename("/a/b/c"), "c");
        assert_eq!(path_basename("/"), "");
    }
}
