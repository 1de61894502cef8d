use std::path::{Path, PathBuf};

use crate::error::Result;

/// <root>/<shuffle_id>
pub fn shuffle_dir(root: &Path, shuffle_id: u32) -> PathBuf {
    root.join(shuffle_id.to_string())
}

/// <root>/<shuffle_id>/map-<map_partition>/reduce-<reduce_id>.data
pub fn map_output_path(root: &Path, shuffle_id: u32, map_partition: usize, reduce_id: u32) -> PathBuf {
    shuffle_dir(root, shuffle_id)
        .join(format!("map-{map_partition}"))
        .join(format!("reduce-{reduce_id}.data"))
}

/// 列出某 (shuffle_id, reduce_id) 的全部 map 输出，按 map 分区号排序
pub fn map_outputs_for_reduce(root: &Path, shuffle_id: u32, reduce_id: u32) -> Result<Vec<PathBuf>> {
    let dir = shuffle_dir(root, shuffle_id);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut maps: Vec<(usize, PathBuf)> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name();
            let map = name.to_str()?.strip_prefix("map-")?.parse::<usize>().ok()?;
            Some((map, e.path()))
        })
        .collect();
    maps.sort_by_key(|(m, _)| *m);

    Ok(maps
        .into_iter()
        .map(|(_, p)| p.join(format!("reduce-{reduce_id}.data")))
        .filter(|p| p.exists())
        .collect())
}

/// job 级临时 shuffle 目录的作用域守卫
///
/// 创建时删除一次（清掉上次残留），drop 时再删除一次（覆盖成功、失败与 panic 路径）。
pub struct ShuffleDirGuard {
    root: PathBuf,
}

impl ShuffleDirGuard {
    pub fn acquire(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        remove_dir_if_exists(&root)?;
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }
}

impl Drop for ShuffleDirGuard {
    fn drop(&mut self) {
        if let Err(e) = remove_dir_if_exists(&self.root) {
            tracing::error!("clear job tmp dir {:?} failed: {}", self.root, e);
        }
    }
}

fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
