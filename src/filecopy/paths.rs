//! Lexical path helpers shared by the sync sources and the relocation.

use std::path::{Component, Path, PathBuf};

/// Place `path` under `root`, treating an absolute `path` as relative to the
/// filesystem root: `rebase_path("/shadow", "/home/u/p")` is
/// `/shadow/home/u/p`.
pub fn rebase_path(root: &Path, path: &Path) -> PathBuf {
    let mut out = root.to_path_buf();
    for component in clean_path(path).components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
    out
}

/// Lexically normalize `.` and `..` without touching the filesystem.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Go module cache directories contain `@`, which a replace target may not.
pub fn clean_go_fs_path(path: &Path) -> PathBuf {
    PathBuf::from(path.to_string_lossy().replace('@', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebase_absolute() {
        assert_eq!(
            rebase_path(Path::new("/shadow"), Path::new("/home/u/proj/main.go")),
            PathBuf::from("/shadow/home/u/proj/main.go")
        );
    }

    #[test]
    fn rebase_relative() {
        assert_eq!(
            rebase_path(Path::new("/shadow"), Path::new("a/./b/../c")),
            PathBuf::from("/shadow/a/c")
        );
    }

    #[test]
    fn clean_resolves_parents() {
        assert_eq!(clean_path(Path::new("/a/b/../../c")), PathBuf::from("/c"));
        assert_eq!(clean_path(Path::new("/../x")), PathBuf::from("/x"));
        assert_eq!(clean_path(Path::new("../x/./y")), PathBuf::from("../x/y"));
        assert_eq!(clean_path(Path::new("a/..")), PathBuf::from("."));
    }

    #[test]
    fn go_fs_path_drops_at_sign() {
        assert_eq!(
            clean_go_fs_path(Path::new("/go/pkg/mod/example.com/lib@v1.2.0")),
            PathBuf::from("/go/pkg/mod/example.com/lib/v1.2.0")
        );
    }
}
