//! 进度上报与 CLI 进度条管理。

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::models::ProgressSnapshot;

pub type ProgressCallback = Box<dyn FnMut(ProgressSnapshot) + Send>;

pub(crate) struct ProgressReporter {
    pub(crate) snapshot: ProgressSnapshot,
    cb: Option<ProgressCallback>, // optional UI callback
    bar: Option<ProgressBar>,
}

impl ProgressReporter {
    fn emit(&mut self) {
        if let Some(cb) = self.cb.as_mut() {
            cb(self.snapshot);
        }
    }

    /// 一个下载任务结束（无论成败）。
    pub(crate) fn record(&mut self, ok: bool) {
        self.snapshot.done = (self.snapshot.done + 1).min(self.snapshot.total);
        if !ok {
            self.snapshot.failed += 1;
        }
        if let Some(bar) = self.bar.as_ref() {
            bar.inc(1);
            if self.snapshot.failed > 0 {
                bar.set_message(format!("{} failed", self.snapshot.failed));
            }
        }
        self.emit();
    }

    pub(crate) fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.finish();
    }
}

/// 有回调时交给调用方展示，否则在 stderr 绘制进度条。
pub(crate) fn make_reporter(
    total: usize,
    progress: Option<ProgressCallback>,
    show_bar: bool,
) -> ProgressReporter {
    let bar = if progress.is_none() && show_bar && total > 0 {
        let style = ProgressStyle::with_template(
            "{prefix} [{elapsed_precise}] {wide_bar} {pos}/{len} ({eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");
        let bar = ProgressBar::with_draw_target(Some(total as u64), ProgressDrawTarget::stderr());
        bar.set_style(style);
        bar.set_prefix("图片下载");
        Some(bar)
    } else {
        None
    };

    let mut reporter = ProgressReporter {
        snapshot: ProgressSnapshot {
            done: 0,
            total,
            failed: 0,
        },
        cb: progress,
        bar,
    };
    reporter.emit();
    reporter
}
