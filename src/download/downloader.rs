//! 单章构建主流程：下载 -> 归一化 -> 排版 -> 生成 PDF -> 清理暂存。

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use super::fetcher::{AssetFetch, MirrorFetcher};
use super::models::{BuildError, BuildReport, DropReason, SourceItem};
use super::pool::{BoundedDownloadPool, surviving};
use super::progress::{ProgressCallback, make_reporter};
use crate::base_system::book_paths::{chapter_pdf_path, chapter_staging_dir};
use crate::base_system::context::{BuildOptions, Config};
use crate::base_system::file_cleaner::remove_staging_dir;
use crate::page_builder::image_utils::normalize;
use crate::page_builder::layout::{Placement, layout};
use crate::page_builder::pdf_writer::{LopdfWriter, PdfAssembler, execute_placements};
use crate::third_party::media_fetch::{BrowserIdentity, MediaClient};

/// 构建单章 PDF。目标文件已存在且不允许覆盖时直接跳过。
pub fn build_chapter(
    config: &Config,
    series: &str,
    chapter: &str,
    items: &[SourceItem],
    progress: Option<ProgressCallback>,
    cancel_flag: Option<Arc<AtomicBool>>,
) -> Result<BuildReport, BuildError> {
    let output = chapter_pdf_path(config, series, chapter);
    if output.exists() && !config.allow_overwrite_files {
        info!(target: "download", "PDF 已存在，跳过: {}", output.display());
        return Ok(BuildReport {
            output,
            skipped_existing: true,
            ..BuildReport::default()
        });
    }

    info!(target: "download", "开始构建: {series} / {chapter} ({} 张图片)", items.len());
    let staging = chapter_staging_dir(config, series, chapter);
    fs::create_dir_all(&staging).map_err(|e| BuildError::io(&staging, e))?;
    debug!(target: "download", "staging dir: {}", staging.display());

    let client = MediaClient::new(config, BrowserIdentity::from_config(config))?;
    let fetcher = MirrorFetcher::new(client, &staging);
    let built = assemble_chapter(
        &config.build_options(),
        items,
        &fetcher,
        &output,
        progress,
        cancel_flag.as_deref(),
        true,
    );

    // 成功或失败都清理暂存，避免残留 chapter_<hash>/
    if config.auto_clear_staging {
        if let Err(e) = remove_staging_dir(&staging) {
            warn!(target: "download", "清理暂存目录失败 {}: {e}", staging.display());
        } else {
            debug!(target: "download", "staging dir removed");
        }
    }
    let report = built?;

    info!(target: "download", "已保存: {} ({})", report.output.display(), report.summary());
    Ok(report)
}

/// 与网络无关的核心流程，下载器由调用方注入。
pub(crate) fn assemble_chapter<F: AssetFetch>(
    opts: &BuildOptions,
    items: &[SourceItem],
    fetcher: &F,
    output: &Path,
    progress: Option<ProgressCallback>,
    cancel: Option<&AtomicBool>,
    show_bar: bool,
) -> Result<BuildReport, BuildError> {
    let mut reporter = make_reporter(items.len(), progress, show_bar);
    let outcomes = BoundedDownloadPool::from_options(opts).run(items, fetcher, cancel, |o| {
        reporter.record(o.local_path().is_some())
    });
    reporter.finish();

    for outcome in &outcomes {
        if let Some(err) = outcome.error() {
            warn!(target: "download", "dropping item {}: {err}", outcome.index);
        }
    }
    if cancel.map(|c| c.load(Ordering::Relaxed)).unwrap_or(false)
        && let Some(index) = outcomes
            .iter()
            .find(|o| matches!(o.error(), Some(BuildError::Cancelled { .. })))
            .map(|o| o.index)
    {
        return Err(BuildError::Cancelled { index });
    }
    let (kept, mut dropped) = surviving(outcomes)?;

    let mut assets = Vec::with_capacity(kept.len());
    let mut bytes_saved = 0u64;
    for (index, path) in kept {
        let before = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        match normalize(&path, opts) {
            Ok(asset) => {
                debug!(
                    target: "download",
                    "item {index}: {}x{} {} bytes ({})",
                    asset.width,
                    asset.height,
                    asset.byte_size,
                    asset.format.name()
                );
                bytes_saved += before.saturating_sub(asset.byte_size);
                assets.push(asset);
            }
            Err(err) => {
                warn!(target: "download", "dropping item {index}: {err}");
                dropped.push((index, DropReason::of(&err)));
            }
        }
    }
    dropped.sort_by_key(|(index, _)| *index);

    if assets.is_empty() {
        return Err(BuildError::NoAssetsAvailable {
            dropped: dropped.len(),
        });
    }

    let placements = layout(
        &assets,
        opts.page_width,
        opts.page_height,
        opts.wide_split_enabled,
    )?;
    debug!(
        target: "download",
        "{} image(s) laid out on {} page(s)",
        assets.len(),
        placements.iter().map(Placement::page_count).sum::<usize>()
    );
    let mut writer = LopdfWriter::new_document(opts.page_width, opts.page_height);
    execute_placements(
        &mut writer,
        &assets,
        &placements,
        opts.page_width,
        opts.page_height,
    )?;
    let pages = writer.save(output)?;

    Ok(BuildReport {
        output: output.to_path_buf(),
        skipped_existing: false,
        surviving: assets.len(),
        pages,
        dropped,
        bytes_saved,
    })
}
