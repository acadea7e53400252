//! 单张图片的下载：按候选顺序依次尝试镜像，成功即写入暂存目录。

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use tracing::{debug, warn};

use super::models::{BuildError, FetchOutcome, SourceItem};
use crate::page_builder::image_utils::{ImageKind, verify_image_bytes, write_atomic};
use crate::third_party::media_fetch::MediaClient;

static RE_BASE64: OnceLock<Regex> = OnceLock::new();
static RE_DATA_URI: OnceLock<Regex> = OnceLock::new();

fn re_base64() -> &'static Regex {
    RE_BASE64.get_or_init(|| Regex::new(r"^[A-Za-z0-9+/=]+$").expect("compile RE_BASE64"))
}

fn re_data_uri() -> &'static Regex {
    RE_DATA_URI.get_or_init(|| {
        Regex::new(r"^data:image/[A-Za-z0-9.+-]+;base64,").expect("compile RE_DATA_URI")
    })
}

/// 下载接口：每个条目恰好返回一个结果。
pub trait AssetFetch: Sync {
    fn fetch(&self, item: &SourceItem) -> FetchOutcome;
}

pub fn looks_like_base64(s: &str) -> bool {
    !s.is_empty() && s.len() % 4 == 0 && re_base64().is_match(s)
}

/// 候选地址本身可能是 base64 编码的 URL。
pub fn decode_candidate_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if looks_like_base64(trimmed)
        && let Ok(bytes) = STANDARD.decode(trimmed)
        && let Ok(url) = String::from_utf8(bytes)
    {
        return url;
    }
    trimmed.to_string()
}

/// 响应体不是图片但是 base64 文本（可带 data URI 前缀）时解码。
pub fn decode_payload(body: Vec<u8>) -> Vec<u8> {
    if ImageKind::sniff(&body) != ImageKind::Unknown {
        return body;
    }
    let Ok(text) = std::str::from_utf8(&body) else {
        return body;
    };
    let text = text.trim();
    let text = match re_data_uri().find(text) {
        Some(m) => &text[m.end()..],
        None => text,
    };
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if !looks_like_base64(&compact) {
        return body;
    }
    match STANDARD.decode(&compact) {
        Ok(decoded) => decoded,
        Err(_) => body,
    }
}

pub struct MirrorFetcher {
    client: MediaClient,
    staging_dir: PathBuf,
}

impl MirrorFetcher {
    pub fn new(client: MediaClient, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            staging_dir: staging_dir.into(),
        }
    }

    pub fn staged_path(&self, index: usize) -> PathBuf {
        self.staging_dir.join(format!("{}.jpg", index + 1))
    }

    fn try_candidate(&self, url: &str, dest: &Path) -> Result<(), BuildError> {
        let body = self.client.get_bytes(url)?;
        let bytes = decode_payload(body);
        let (kind, w, h) =
            verify_image_bytes(&bytes).map_err(|reason| BuildError::UnreadableImage {
                path: dest.to_path_buf(),
                reason: format!("{url}: {reason}"),
            })?;
        write_atomic(dest, &bytes).map_err(|e| BuildError::io(dest, e))?;
        debug!(target: "fetch", "{} <- {url} ({}, {w}x{h})", dest.display(), kind.name());
        Ok(())
    }
}

impl AssetFetch for MirrorFetcher {
    fn fetch(&self, item: &SourceItem) -> FetchOutcome {
        let dest = self.staged_path(item.index);
        for (attempt, raw) in item.candidate_urls.iter().enumerate() {
            let url = decode_candidate_url(raw);
            match self.try_candidate(&url, &dest) {
                Ok(()) => return FetchOutcome::ok(item.index, dest),
                Err(err) => {
                    debug!(
                        target: "fetch",
                        "item {} candidate {}/{} failed: {err}",
                        item.index,
                        attempt + 1,
                        item.candidate_urls.len()
                    );
                }
            }
        }
        warn!(
            "item {}: all {} mirror(s) failed, dropping",
            item.index,
            item.candidate_urls.len()
        );
        FetchOutcome::failed(
            item.index,
            BuildError::ExhaustedMirrors {
                index: item.index,
                tried: item.candidate_urls.len(),
            },
        )
    }
}
