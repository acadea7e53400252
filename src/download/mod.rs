//! 下载流程模块入口。
//!
//! 子模块：
//! - `models`     ：数据模型（SourceItem / FetchOutcome / BuildError / BuildReport 等）
//! - `plan`       ：章节清单读取与条目生成
//! - `fetcher`    ：单张图片的镜像切换下载
//! - `pool`       ：有界并发下载池
//! - `progress`   ：进度上报与 CLI 进度条
//! - `downloader` ：单章构建主流程编排

pub mod downloader;
pub mod fetcher;
pub mod models;
pub mod plan;
pub mod pool;
pub mod progress;
