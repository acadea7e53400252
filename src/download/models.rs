//! 下载与构建相关的数据模型定义。
//!
//! 包含源条目、下载结果、错误分类、进度快照与构建报告。

use std::path::{Path, PathBuf};

use thiserror::Error;

/// 一张逻辑图片：最终位置 + 按优先级排列的候选地址（主镜像在前）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceItem {
    pub index: usize,
    pub candidate_urls: Vec<String>,
}

impl SourceItem {
    pub fn new(index: usize, candidate_urls: Vec<String>) -> Self {
        Self {
            index,
            candidate_urls,
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("item {index}: all {tried} mirror(s) failed")]
    ExhaustedMirrors { index: usize, tried: usize },
    #[error("transport error for {url}: {reason}")]
    Transport { url: String, reason: String },
    #[error("unreadable image {path}: {reason}")]
    UnreadableImage { path: PathBuf, reason: String },
    #[error("no images survived ({dropped} dropped)")]
    NoAssetsAvailable { dropped: usize },
    #[error("re-encode failed: {0}")]
    EncodeFailure(String),
    #[error("cannot lay out {path} ({width}x{height})")]
    LayoutImpossible {
        path: PathBuf,
        width: u32,
        height: u32,
    },
    #[error("item {index} cancelled")]
    Cancelled { index: usize },
    #[error("item {index}: fetch worker panicked")]
    WorkerPanicked { index: usize },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl BuildError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// 每个 SourceItem 恰好产生一次，之后不再修改。
#[derive(Debug)]
pub struct FetchOutcome {
    pub index: usize,
    pub result: Result<PathBuf, BuildError>,
}

impl FetchOutcome {
    pub fn ok(index: usize, path: PathBuf) -> Self {
        Self {
            index,
            result: Ok(path),
        }
    }

    pub fn failed(index: usize, error: BuildError) -> Self {
        Self {
            index,
            result: Err(error),
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        self.result.as_ref().ok().map(PathBuf::as_path)
    }

    pub fn error(&self) -> Option<&BuildError> {
        self.result.as_ref().err()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    ExhaustedMirrors,
    UnreadableImage,
    Cancelled,
    Other,
}

impl DropReason {
    pub fn of(err: &BuildError) -> Self {
        match err {
            BuildError::ExhaustedMirrors { .. } => Self::ExhaustedMirrors,
            BuildError::UnreadableImage { .. } => Self::UnreadableImage,
            BuildError::Cancelled { .. } => Self::Cancelled,
            _ => Self::Other,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::ExhaustedMirrors => "exhausted mirrors",
            Self::UnreadableImage => "unreadable",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub done: usize,
    pub total: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub output: PathBuf,
    /// PDF 已存在而跳过构建
    pub skipped_existing: bool,
    pub surviving: usize,
    pub pages: usize,
    pub dropped: Vec<(usize, DropReason)>,
    /// 归一化（转码 / 重新编码）节省的字节数
    pub bytes_saved: u64,
}

impl BuildReport {
    pub fn dropped_count(&self, reason: DropReason) -> usize {
        self.dropped.iter().filter(|(_, r)| *r == reason).count()
    }

    pub fn summary(&self) -> String {
        if self.skipped_existing {
            return format!("already exists: {}", self.output.display());
        }
        let mut line = format!(
            "{} images, {} pages, {} dropped",
            self.surviving,
            self.pages,
            self.dropped.len()
        );
        if !self.dropped.is_empty() {
            let parts: Vec<String> = [
                DropReason::ExhaustedMirrors,
                DropReason::UnreadableImage,
                DropReason::Cancelled,
                DropReason::Other,
            ]
            .into_iter()
            .filter_map(|r| {
                let n = self.dropped_count(r);
                (n > 0).then(|| format!("{n} {}", r.label()))
            })
            .collect();
            line.push_str(&format!(" ({})", parts.join(", ")));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_groups_drop_reasons() {
        let report = BuildReport {
            output: PathBuf::from("out.pdf"),
            surviving: 8,
            pages: 11,
            dropped: vec![
                (2, DropReason::ExhaustedMirrors),
                (5, DropReason::UnreadableImage),
                (7, DropReason::ExhaustedMirrors),
            ],
            ..BuildReport::default()
        };
        assert_eq!(
            report.summary(),
            "8 images, 11 pages, 3 dropped (2 exhausted mirrors, 1 unreadable)"
        );
    }

    #[test]
    fn drop_reason_classifies_errors() {
        let err = BuildError::ExhaustedMirrors { index: 1, tried: 2 };
        assert_eq!(DropReason::of(&err), DropReason::ExhaustedMirrors);
        let err = BuildError::UnreadableImage {
            path: PathBuf::from("x.jpg"),
            reason: "bad".into(),
        };
        assert_eq!(DropReason::of(&err), DropReason::UnreadableImage);
        assert_eq!(
            DropReason::of(&BuildError::EncodeFailure("x".into())),
            DropReason::Other
        );
    }
}
