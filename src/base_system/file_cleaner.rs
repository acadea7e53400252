//! 暂存缓存统计与清理。

use std::fs;
use std::io;
use std::path::Path;

use walkdir::WalkDir;

pub fn is_empty_dir(path: impl AsRef<Path>) -> io::Result<bool> {
    let path = path.as_ref();
    let mut entries = fs::read_dir(path)?;
    Ok(entries.next().is_none())
}

/// 递归统计目录下所有文件的字节数；目录不存在时返回 0。
pub fn dir_size(path: impl AsRef<Path>) -> io::Result<u64> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(0);
    }
    let mut total = 0u64;
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(io::Error::from)?.len();
        }
    }
    Ok(total)
}

/// 1024 进制的人类可读大小，例如 `12.3 MB`。
pub fn format_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0usize;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let unit = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {}B", bytes as f64 / div as f64, unit)
}

/// 删除整个暂存目录，返回删除前的大小。目录不存在不算错误。
pub fn clear_dir(path: impl AsRef<Path>) -> io::Result<u64> {
    let path = path.as_ref();
    let size = dir_size(path)?;
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(size),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err),
    }
}

/// 删除单章暂存目录；若其父目录（系列目录）因此变空，一并删除。
pub fn remove_staging_dir(staging: &Path) -> io::Result<()> {
    match fs::remove_dir_all(staging) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    }
    if let Some(parent) = staging.parent()
        && is_empty_dir(parent).unwrap_or(false)
    {
        let _ = fs::remove_dir(parent);
    }
    Ok(())
}
