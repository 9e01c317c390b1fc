use log::warn;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::core::part_count;
use crate::utils::{MeshError, Result};

/// Prefix of per-transfer scratch directories living alongside served files.
pub const SCRATCH_PREFIX: &str = "transfer_";

/// True when `name` is a glob pattern rather than a literal path.
pub fn is_pattern(name: &str) -> bool {
    name.contains(['*', '?', '['])
}

/// Local filesystem view rooted at the base path every node serves.
pub struct Inventory {
    base: PathBuf,
}

impl Inventory {
    pub async fn new(base: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base)
            .await
            .map_err(|e| MeshError::Io(format!("creating base {:?}: {}", base, e)))?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Absolute path for a relative name. Names must stay under the base:
    /// absolute paths and parent-directory components are refused.
    pub fn abs(&self, rel: &str) -> Result<PathBuf> {
        let path = Path::new(rel);
        if rel.is_empty() || path.is_absolute() {
            return Err(MeshError::Malformed(format!("bad filename {:?}", rel)));
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(MeshError::Malformed(format!(
                "filename {:?} escapes the base directory",
                rel
            )));
        }
        Ok(self.base.join(path))
    }

    /// Relative name of an absolute path under the base.
    pub fn rel(&self, path: &Path) -> String {
        path.strip_prefix(&self.base)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    /// Size and permission bits of a regular file.
    pub async fn stat_file(&self, rel: &str) -> Result<(u64, u32)> {
        let abs = self.abs(rel)?;
        let md = fs::metadata(&abs)
            .await
            .map_err(|_| MeshError::NotFound(rel.to_string()))?;
        if !md.is_file() {
            return Err(MeshError::NotFound(rel.to_string()));
        }
        Ok((md.len(), md.permissions().mode() & 0o777))
    }

    /// Resolve a name the way the inbound server does: an exact file, a
    /// directory (expanded recursively), or a glob pattern. Returns relative
    /// paths of matching regular files; no match is an empty list, not an
    /// error.
    pub async fn resolve(&self, name: &str) -> Result<Vec<String>> {
        if !is_pattern(name) {
            let abs = self.abs(name)?;
            return match fs::metadata(&abs).await {
                Ok(md) if md.is_file() => Ok(vec![self.rel(&abs)]),
                Ok(md) if md.is_dir() => self.walk_files(&abs).await,
                _ => Ok(Vec::new()),
            };
        }

        let joined = self.abs(name)?;
        let pattern = joined.to_string_lossy().into_owned();
        let mut out = Vec::new();
        let entries = glob::glob(&pattern)
            .map_err(|e| MeshError::Malformed(format!("bad pattern {}: {}", name, e)))?;
        for entry in entries {
            match entry {
                Ok(path) if path.is_file() => out.push(self.rel(&path)),
                Ok(path) if path.is_dir() => out.extend(self.walk_files(&path).await?),
                Ok(_) => {}
                Err(e) => warn!("glob {} skipped an entry: {}", name, e),
            }
        }
        Ok(out)
    }

    /// All regular files under `dir`, as relative paths. Scratch directories
    /// of in-progress transfers are skipped.
    pub async fn walk_files(&self, dir: &Path) -> Result<Vec<String>> {
        let mut files = Vec::new();
        let mut stack = vec![dir.to_path_buf()];

        while let Some(d) = stack.pop() {
            let mut entries = fs::read_dir(&d)
                .await
                .map_err(|e| MeshError::Io(format!("reading {:?}: {}", d, e)))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| MeshError::Io(format!("reading {:?}: {}", d, e)))?
            {
                let path = entry.path();
                let ftype = entry.file_type().await?;
                if ftype.is_dir() {
                    if entry.file_name().to_string_lossy().starts_with(SCRATCH_PREFIX) {
                        continue;
                    }
                    stack.push(path);
                } else if ftype.is_file() {
                    files.push(self.rel(&path));
                }
            }
        }

        Ok(files)
    }

    /// Bytes of one part of a file: `[part * part_size, min((part + 1) *
    /// part_size, size))`. A part outside the file's range is refused, which
    /// covers part 0 of an empty file.
    pub async fn read_part(&self, rel: &str, part: i64, part_size: u64) -> Result<Vec<u8>> {
        let (size, _) = self.stat_file(rel).await?;
        if part < 0 || part >= part_count(size, part_size) {
            return Err(MeshError::Malformed(format!(
                "part {} out of range for {} ({} bytes)",
                part, rel, size
            )));
        }

        let offset = part as u64 * part_size;
        let len = std::cmp::min(part_size, size - offset) as usize;

        let mut file = fs::File::open(self.abs(rel)?).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn inventory_with(files: &[(&str, &[u8])]) -> (tempfile::TempDir, Inventory) {
        let dir = tempfile::tempdir().unwrap();
        for (rel, content) in files {
            let path = dir.path().join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await.unwrap();
            }
            fs::write(&path, content).await.unwrap();
        }
        let inv = Inventory::new(dir.path().to_path_buf()).await.unwrap();
        (dir, inv)
    }

    #[tokio::test]
    async fn test_abs_refuses_escapes() {
        let (_dir, inv) = inventory_with(&[]).await;
        assert!(inv.abs("ok/name.txt").is_ok());
        assert!(matches!(inv.abs(""), Err(MeshError::Malformed(_))));
        assert!(matches!(inv.abs("/etc/passwd"), Err(MeshError::Malformed(_))));
        assert!(matches!(inv.abs("../up.txt"), Err(MeshError::Malformed(_))));
        assert!(matches!(inv.abs("a/../../up"), Err(MeshError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_resolve_exact_dir_and_glob() {
        let (_dir, inv) = inventory_with(&[
            ("hello.txt", b"hi"),
            ("dir/x", b"xxxxx"),
            ("dir/sub/y", b"yyy"),
            ("other.log", b"log"),
        ])
        .await;

        assert_eq!(inv.resolve("hello.txt").await.unwrap(), vec!["hello.txt"]);

        let mut dir_files = inv.resolve("dir").await.unwrap();
        dir_files.sort();
        assert_eq!(dir_files, vec!["dir/sub/y", "dir/x"]);

        let glob_files = inv.resolve("*.log").await.unwrap();
        assert_eq!(glob_files, vec!["other.log"]);

        assert!(inv.resolve("missing.bin").await.unwrap().is_empty());
        assert!(inv.resolve("*.iso").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_walk_skips_scratch_dirs() {
        let (dir, inv) = inventory_with(&[("kept.txt", b"k")]).await;
        let scratch = dir.path().join("transfer_abc123");
        fs::create_dir_all(&scratch).await.unwrap();
        fs::write(scratch.join("kept.txt.part_0"), b"partial")
            .await
            .unwrap();

        let files = inv.walk_files(inv.base()).await.unwrap();
        assert_eq!(files, vec!["kept.txt"]);
    }

    #[tokio::test]
    async fn test_read_part_boundaries() {
        let (_dir, inv) = inventory_with(&[("f", b"abcdefghij"), ("empty", b"")]).await;

        // 10 bytes at part size 4: "abcd" "efgh" "ij"
        assert_eq!(inv.read_part("f", 0, 4).await.unwrap(), b"abcd");
        assert_eq!(inv.read_part("f", 1, 4).await.unwrap(), b"efgh");
        assert_eq!(inv.read_part("f", 2, 4).await.unwrap(), b"ij");
        assert!(inv.read_part("f", 3, 4).await.is_err());
        assert!(inv.read_part("f", -1, 4).await.is_err());

        // an empty file has no parts at all
        assert!(inv.read_part("empty", 0, 4).await.is_err());

        // a file of exactly one part
        let (_d2, inv2) = inventory_with(&[("exact", b"abcd")]).await;
        assert_eq!(inv2.read_part("exact", 0, 4).await.unwrap(), b"abcd");
        assert!(inv2.read_part("exact", 1, 4).await.is_err());
    }

    #[tokio::test]
    async fn test_stat_file() {
        let (_dir, inv) = inventory_with(&[("f", b"12345")]).await;
        let (size, perm) = inv.stat_file("f").await.unwrap();
        assert_eq!(size, 5);
        assert!(perm > 0);
        assert!(matches!(
            inv.stat_file("nope").await,
            Err(MeshError::NotFound(_))
        ));
    }
}
