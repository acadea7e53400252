use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::base_system::context::{Config, safe_fs_name};

pub fn series_folder_name(series: &str) -> String {
    safe_fs_name(series, "_", 120)
}

/// `<save>/<series>/<chapter>.pdf`
pub fn chapter_pdf_path(config: &Config, series: &str, chapter: &str) -> PathBuf {
    config
        .default_save_dir()
        .join(series_folder_name(series))
        .join(format!("{}.pdf", safe_fs_name(chapter, "_", 150)))
}

/// 单章图片暂存目录：`<cache>/<series>/chapter_<sha1 前 12 位>`。
///
/// 用标题哈希而非标题本身，避免不同章节清洗后同名。
pub fn chapter_staging_dir(config: &Config, series: &str, chapter: &str) -> PathBuf {
    let mut hasher = Sha1::new();
    hasher.update(series.as_bytes());
    hasher.update([0u8]);
    hasher.update(chapter.as_bytes());
    let digest = hex::encode(hasher.finalize());
    config
        .staging_root()
        .join(series_folder_name(series))
        .join(format!("chapter_{}", &digest[..12]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &std::path::Path) -> Config {
        Config {
            save_path: dir.join("out").display().to_string(),
            cache_dir: dir.join("cache").display().to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn pdf_path_is_sanitised() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = config_in(dir.path());
        let path = chapter_pdf_path(&cfg, "One: Piece", "Chapter 1/2?");
        assert_eq!(
            path,
            dir.path().join("out").join("One_ Piece").join("Chapter 1_2_.pdf")
        );
    }

    #[test]
    fn staging_dirs_differ_per_chapter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = config_in(dir.path());
        let a = chapter_staging_dir(&cfg, "S", "Ch: 1");
        let b = chapter_staging_dir(&cfg, "S", "Ch/ 1");
        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(dir.path().join("cache").join("S").as_path()));
        assert_eq!(a, chapter_staging_dir(&cfg, "S", "Ch: 1"));
    }
}
