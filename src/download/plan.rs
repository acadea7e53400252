//! 章节清单（manifest）读取与下载条目生成。
//!
//! 清单由上游的页面解析环节产出，这里只做校验、排序与镜像顺序调整。

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{debug, info};

use super::models::SourceItem;

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestItem {
    /// 缺省时使用其在列表中的位置
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub candidate_urls: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChapterManifest {
    pub series: String,
    pub chapter: String,
    #[serde(default)]
    pub items: Vec<ManifestItem>,
}

impl ChapterManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("read manifest {}", path.display()))?;
        let manifest: Self = serde_json::from_str(&text)
            .with_context(|| format!("parse manifest {}", path.display()))?;
        if manifest.series.trim().is_empty() || manifest.chapter.trim().is_empty() {
            bail!("manifest {} needs non-empty series and chapter", path.display());
        }
        info!(
            target: "download",
            "manifest: {} / {} ({} item(s))",
            manifest.series,
            manifest.chapter,
            manifest.items.len()
        );
        Ok(manifest)
    }

    /// 生成按 index 排序的下载条目；`prefer_secondary` 时反转每项的镜像顺序。
    pub fn source_items(&self, prefer_secondary: bool) -> Result<Vec<SourceItem>> {
        let mut seen = HashSet::new();
        let mut items = Vec::with_capacity(self.items.len());
        for (pos, raw) in self.items.iter().enumerate() {
            let index = raw.index.unwrap_or(pos);
            if !seen.insert(index) {
                bail!("duplicate item index {index} in manifest");
            }
            let mut urls: Vec<String> = raw
                .candidate_urls
                .iter()
                .map(|u| u.trim())
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect();
            if prefer_secondary {
                urls.reverse();
            }
            items.push(SourceItem::new(index, urls));
        }
        items.sort_by_key(|it| it.index);
        if prefer_secondary {
            debug!(target: "download", "mirror order reversed for this build");
        }
        Ok(items)
    }
}
