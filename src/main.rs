//! Manga PDF Downloader：把章节图片清单下载、归一化并排版为单个 PDF。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志/路径/缓存清理等基础设施
//! - `download`：下载流程编排（清单、并发下载池、镜像切换、进度）
//! - `page_builder`：图片归一化、页面排版与 PDF 组装
//! - `third_party`：HTTP 客户端与请求身份

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::{debug, info};

mod base_system;
mod download;
mod page_builder;
mod third_party;

use base_system::config::load_or_create;
use base_system::context::Config;
use base_system::file_cleaner::{clear_dir, dir_size, format_size};
use base_system::logging::{LogOptions, LogSystem};
use download::downloader::build_chapter;
use download::plan::ChapterManifest;

#[derive(Debug, Parser)]
#[command(name = "manga-pdf-downloader", version)]
#[command(about = "Download manga chapter images and assemble them into a PDF")]
struct Cli {
    /// 启用调试日志输出
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,

    /// 数据目录路径（用于存放 config.yml 和 logs）
    #[arg(long, global = true)]
    data_dir: Option<String>,

    /// 本次运行启用宽图横向切分
    #[arg(long, global = true, default_value_t = false)]
    wide_split: bool,

    /// 本次运行启用 JPEG 重新编码（仅在变小时保存）
    #[arg(long, global = true, default_value_t = false)]
    reencode: bool,

    /// 重新编码质量 (1-100)
    #[arg(long, global = true, value_parser = clap::value_parser!(u8).range(1..=100))]
    quality: Option<u8>,

    /// 使用标准 JPEG 解码器（关闭块边缘平滑）
    #[arg(long, global = true, default_value_t = false)]
    standard_decoder: bool,

    /// 本次运行优先使用备用镜像
    #[arg(long, global = true, default_value_t = false)]
    swap_mirrors: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 根据章节清单（JSON）下载图片并生成 PDF
    Build {
        manifest: PathBuf,
    },
    /// 显示暂存缓存占用
    CacheSize,
    /// 清空暂存缓存
    ClearCache {
        /// 确认删除
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.as_deref().map(Path::new);
    let _log = init_logging(cli.debug, data_dir)?;

    let loaded = load_or_create::<Config>(data_dir).context("load config")?;
    if loaded.created {
        info!(target: "startup", "已生成默认配置: {}", loaded.path.display());
    }
    let mut config = loaded.config;
    apply_overrides(&mut config, &cli);
    debug!(target: "startup", "effective options: {:?}", config.build_options());

    match &cli.command {
        Command::Build { manifest } => run_build(&config, manifest),
        Command::CacheSize => {
            let root = config.staging_root();
            let size = dir_size(&root).with_context(|| format!("scan {}", root.display()))?;
            println!("{} ({})", format_size(size), root.display());
            Ok(())
        }
        Command::ClearCache { yes } => {
            let root = config.staging_root();
            if !*yes {
                let size = dir_size(&root).unwrap_or(0);
                println!(
                    "cache at {} holds {}; rerun with --yes to delete it",
                    root.display(),
                    format_size(size)
                );
                return Ok(());
            }
            let freed = clear_dir(&root).with_context(|| format!("clear {}", root.display()))?;
            println!("cleared {}", format_size(freed));
            Ok(())
        }
    }
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if cli.wide_split {
        config.wide_split_enabled = true;
    }
    if cli.reencode {
        config.aggressive_reencode = true;
    }
    if let Some(q) = cli.quality {
        config.reencode_quality = q;
    }
    if cli.standard_decoder {
        config.use_enhanced_decoder = false;
    }
    if cli.swap_mirrors {
        config.prefer_secondary_mirror = !config.prefer_secondary_mirror;
    }
}

fn run_build(config: &Config, manifest_path: &Path) -> Result<()> {
    let manifest = ChapterManifest::load(manifest_path)?;
    let items = manifest.source_items(config.prefer_secondary_mirror)?;
    let report = build_chapter(
        config,
        &manifest.series,
        &manifest.chapter,
        &items,
        None,
        None,
    )
    .map_err(|e| anyhow!(e))
    .with_context(|| format!("build {} / {}", manifest.series, manifest.chapter))?;

    println!("{}", report.output.display());
    println!("{}", report.summary());
    if report.bytes_saved > 0 {
        println!("saved {}", format_size(report.bytes_saved));
    }
    Ok(())
}

fn init_logging(debug: bool, base_dir: Option<&Path>) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        use_color: true,
        archive_on_exit: true,
        console: true,
    };
    LogSystem::init_with_base(opts, base_dir).map_err(|e| anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_for_one_run() {
        let cli = Cli::try_parse_from([
            "manga-pdf-downloader",
            "--wide-split",
            "--reencode",
            "--quality",
            "70",
            "--standard-decoder",
            "build",
            "ch.json",
            "--swap-mirrors",
        ])
        .expect("parse");
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, &cli);
        assert!(cfg.wide_split_enabled);
        assert!(cfg.aggressive_reencode);
        assert_eq!(cfg.reencode_quality, 70);
        assert!(!cfg.use_enhanced_decoder);
        assert!(cfg.prefer_secondary_mirror);
        assert!(matches!(cli.command, Command::Build { .. }));
    }

    #[test]
    fn quality_out_of_range_is_rejected() {
        assert!(Cli::try_parse_from(["manga-pdf-downloader", "--quality", "0", "cache-size"]).is_err());
        assert!(Cli::try_parse_from(["manga-pdf-downloader", "clear-cache", "--yes"]).is_ok());
    }
}
