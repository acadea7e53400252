//! 有界并发下载池。
//!
//! 每个条目一个 scoped 线程；准入由预装 `max_concurrent` 个许可的有界通道控制，
//! 许可通过 drop guard 归还，成功、失败、取消或 panic 都不会泄漏。
//! 结果按原始位置写入预分配的缓冲区，输出顺序与输入一致。

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{self as channel, Receiver, Sender};
use tracing::{debug, warn};

use super::fetcher::AssetFetch;
use super::models::{BuildError, DropReason, FetchOutcome, SourceItem};
use crate::base_system::context::BuildOptions;

struct Permit<'a> {
    slots: &'a Sender<()>,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let _ = self.slots.send(());
    }
}

fn acquire<'a>(slots_rx: &Receiver<()>, slots_tx: &'a Sender<()>) -> Option<Permit<'a>> {
    slots_rx.recv().ok().map(|()| Permit { slots: slots_tx })
}

#[derive(Debug, Clone, Copy)]
pub struct BoundedDownloadPool {
    max_concurrent: usize,
    pacing_delay: Duration,
}

impl BoundedDownloadPool {
    pub fn new(max_concurrent: usize, pacing_delay: Duration) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            pacing_delay,
        }
    }

    pub fn from_options(opts: &BuildOptions) -> Self {
        Self::new(opts.max_concurrent, opts.pacing_delay)
    }

    /// 并发下载全部条目，等待所有任务结束后返回。
    ///
    /// `on_done` 在调用线程上按完成顺序回调，用于进度上报。
    pub fn run<F: AssetFetch>(
        &self,
        items: &[SourceItem],
        fetcher: &F,
        cancel: Option<&AtomicBool>,
        mut on_done: impl FnMut(&FetchOutcome),
    ) -> Vec<FetchOutcome> {
        let total = items.len();
        let (slots_tx, slots_rx) = channel::bounded::<()>(self.max_concurrent);
        for _ in 0..self.max_concurrent {
            let _ = slots_tx.send(());
        }
        let results: Mutex<Vec<Option<FetchOutcome>>> =
            Mutex::new((0..total).map(|_| None).collect());
        let (done_tx, done_rx) = channel::unbounded::<usize>();

        debug!(
            target: "pool",
            "fetching {total} item(s), max_concurrent={}, pacing={:?}",
            self.max_concurrent,
            self.pacing_delay
        );

        thread::scope(|s| {
            for (pos, item) in items.iter().enumerate() {
                let task = {
                    let slots_tx = &slots_tx;
                    let slots_rx = &slots_rx;
                    let results = &results;
                    let done_tx = done_tx.clone();
                    let pacing = self.pacing_delay;
                    move || {
                        let outcome = run_task(item, fetcher, slots_rx, slots_tx, pacing, cancel);
                        store(results, pos, outcome);
                        let _ = done_tx.send(pos);
                    }
                };
                let spawned = thread::Builder::new()
                    .name(format!("fetch-{}", item.index))
                    .spawn_scoped(s, task);
                if let Err(err) = spawned {
                    warn!("cannot spawn worker for item {}: {err}, running inline", item.index);
                    let outcome = run_task(
                        item,
                        fetcher,
                        &slots_rx,
                        &slots_tx,
                        self.pacing_delay,
                        cancel,
                    );
                    store(&results, pos, outcome);
                    let _ = done_tx.send(pos);
                }
            }
            drop(done_tx);

            for pos in done_rx.iter() {
                let guard = match results.lock() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(outcome) = guard[pos].as_ref() {
                    on_done(outcome);
                }
            }
        });

        let buffer = match results.into_inner() {
            Ok(v) => v,
            Err(poisoned) => poisoned.into_inner(),
        };
        buffer
            .into_iter()
            .zip(items)
            .map(|(slot, item)| {
                slot.unwrap_or_else(|| {
                    FetchOutcome::failed(item.index, BuildError::WorkerPanicked { index: item.index })
                })
            })
            .collect()
    }
}

fn store(results: &Mutex<Vec<Option<FetchOutcome>>>, pos: usize, outcome: FetchOutcome) {
    match results.lock() {
        Ok(mut g) => g[pos] = Some(outcome),
        Err(poisoned) => poisoned.into_inner()[pos] = Some(outcome),
    }
}

fn run_task<F: AssetFetch>(
    item: &SourceItem,
    fetcher: &F,
    slots_rx: &Receiver<()>,
    slots_tx: &Sender<()>,
    pacing: Duration,
    cancel: Option<&AtomicBool>,
) -> FetchOutcome {
    let cancelled = || cancel.map(|c| c.load(Ordering::Relaxed)).unwrap_or(false);
    let Some(_permit) = acquire(slots_rx, slots_tx) else {
        return FetchOutcome::failed(item.index, BuildError::Cancelled { index: item.index });
    };
    if cancelled() {
        return FetchOutcome::failed(item.index, BuildError::Cancelled { index: item.index });
    }
    if !pacing.is_zero() {
        thread::sleep(pacing);
    }
    if cancelled() {
        return FetchOutcome::failed(item.index, BuildError::Cancelled { index: item.index });
    }

    match panic::catch_unwind(AssertUnwindSafe(|| fetcher.fetch(item))) {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!("fetch worker for item {} panicked", item.index);
            FetchOutcome::failed(item.index, BuildError::WorkerPanicked { index: item.index })
        }
    }
}

/// 过滤掉失败项，保留成功项的相对顺序。
pub fn surviving(
    outcomes: Vec<FetchOutcome>,
) -> Result<(Vec<(usize, PathBuf)>, Vec<(usize, DropReason)>), BuildError> {
    let mut kept = Vec::with_capacity(outcomes.len());
    let mut dropped = Vec::new();
    for outcome in outcomes {
        match outcome.result {
            Ok(path) => kept.push((outcome.index, path)),
            Err(err) => dropped.push((outcome.index, DropReason::of(&err))),
        }
    }
    if kept.is_empty() {
        return Err(BuildError::NoAssetsAvailable {
            dropped: dropped.len(),
        });
    }
    Ok((kept, dropped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    /// 伪随机延迟 + 实时并发计数的假下载器。
    struct FakeFetch {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        failing: HashSet<usize>,
        panicking: HashSet<usize>,
    }

    impl FakeFetch {
        fn new(failing: &[usize]) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                failing: failing.iter().copied().collect(),
                panicking: HashSet::new(),
            }
        }

        fn latency(index: usize) -> Duration {
            let mut x = (index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
            x ^= x >> 29;
            Duration::from_millis(1 + x % 15)
        }
    }

    impl AssetFetch for FakeFetch {
        fn fetch(&self, item: &SourceItem) -> FetchOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Self::latency(item.index));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.panicking.contains(&item.index) {
                panic!("boom at {}", item.index);
            }
            if self.failing.contains(&item.index) {
                return FetchOutcome::failed(
                    item.index,
                    BuildError::ExhaustedMirrors {
                        index: item.index,
                        tried: item.candidate_urls.len(),
                    },
                );
            }
            FetchOutcome::ok(item.index, PathBuf::from(format!("{}.jpg", item.index + 1)))
        }
    }

    fn items(n: usize) -> Vec<SourceItem> {
        (0..n)
            .map(|i| SourceItem::new(i, vec![format!("https://a.example/{i}.jpg")]))
            .collect()
    }

    #[test]
    fn output_matches_input_order_under_random_latency() {
        let fake = FakeFetch::new(&[]);
        let input = items(24);
        let mut seen = 0;
        let out = BoundedDownloadPool::new(6, Duration::ZERO).run(&input, &fake, None, |_| {
            seen += 1
        });
        assert_eq!(out.len(), input.len());
        assert_eq!(seen, input.len());
        for (o, i) in out.iter().zip(&input) {
            assert_eq!(o.index, i.index);
        }
    }

    #[test]
    fn in_flight_never_exceeds_limit() {
        for limit in [1, 3, 5] {
            let fake = FakeFetch::new(&[]);
            BoundedDownloadPool::new(limit, Duration::from_millis(1)).run(
                &items(20),
                &fake,
                None,
                |_| {},
            );
            let peak = fake.peak.load(Ordering::SeqCst);
            assert!(peak <= limit, "peak {peak} > limit {limit}");
            assert!(peak >= 1);
        }
    }

    #[test]
    fn exhausted_items_are_dropped_and_order_kept() {
        let fake = FakeFetch::new(&[1, 4]);
        let out = BoundedDownloadPool::new(3, Duration::ZERO).run(&items(6), &fake, None, |_| {});
        let (kept, dropped) = surviving(out).expect("survivors");
        assert_eq!(
            kept.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![0, 2, 3, 5]
        );
        assert_eq!(
            dropped,
            vec![
                (1, DropReason::ExhaustedMirrors),
                (4, DropReason::ExhaustedMirrors)
            ]
        );
    }

    #[test]
    fn nothing_surviving_is_fatal() {
        let fake = FakeFetch::new(&[0, 1, 2]);
        let out = BoundedDownloadPool::new(2, Duration::ZERO).run(&items(3), &fake, None, |_| {});
        assert!(matches!(
            surviving(out),
            Err(BuildError::NoAssetsAvailable { dropped: 3 })
        ));
    }

    #[test]
    fn panicking_worker_releases_its_slot() {
        let mut fake = FakeFetch::new(&[]);
        fake.panicking.insert(0);
        let out = BoundedDownloadPool::new(1, Duration::ZERO).run(&items(4), &fake, None, |_| {});
        assert!(matches!(
            out[0].error(),
            Some(BuildError::WorkerPanicked { index: 0 })
        ));
        assert!(out[1..].iter().all(|o| o.local_path().is_some()));
    }

    #[test]
    fn pacing_delay_is_paid_once_per_task() {
        let fake = FakeFetch::new(&[]);
        let started = std::time::Instant::now();
        let out = BoundedDownloadPool::new(1, Duration::from_millis(20)).run(
            &items(5),
            &fake,
            None,
            |_| {},
        );
        // 单槽位串行执行，5 次间隔无法重叠
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 5);
        assert!(out.iter().all(|o| o.local_path().is_some()));
    }

    #[test]
    fn cancelled_pool_skips_fetching() {
        let fake = FakeFetch::new(&[]);
        let cancel = AtomicBool::new(true);
        let out =
            BoundedDownloadPool::new(2, Duration::ZERO).run(&items(5), &fake, Some(&cancel), |_| {});
        assert_eq!(out.len(), 5);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
        assert!(
            out.iter()
                .all(|o| matches!(o.error(), Some(BuildError::Cancelled { .. })))
        );
    }
}
