//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息，以及由配置派生的
//! 不可变构建参数（`BuildOptions`），后者会被显式传入下载池与图片归一化。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigSpec, FieldMeta};

pub const A4_WIDTH_MM: f64 = 210.0;
pub const A4_HEIGHT_MM: f64 = 297.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 网络配置
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_pacing_delay_ms")]
    pub pacing_delay_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub referer: String,
    #[serde(default)]
    pub cookies: Vec<String>,
    #[serde(default = "default_false")]
    pub prefer_secondary_mirror: bool,
    #[serde(default = "default_true")]
    pub use_system_proxy: bool,

    // 图片配置
    #[serde(default = "default_true")]
    pub use_enhanced_decoder: bool,
    #[serde(default = "default_false")]
    pub aggressive_reencode: bool,
    #[serde(default = "default_reencode_quality")]
    pub reencode_quality: u8,

    // 排版配置
    #[serde(default = "default_false")]
    pub wide_split_enabled: bool,
    #[serde(default = "default_page_width_mm")]
    pub page_width_mm: f64,
    #[serde(default = "default_page_height_mm")]
    pub page_height_mm: f64,

    // 路径配置
    #[serde(default)]
    pub save_path: String,
    #[serde(default)]
    pub cache_dir: String,
    #[serde(default = "default_true")]
    pub auto_clear_staging: bool,
    #[serde(default = "default_false")]
    pub allow_overwrite_files: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            pacing_delay_ms: default_pacing_delay_ms(),
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
            user_agent: default_user_agent(),
            referer: String::new(),
            cookies: Vec::new(),
            prefer_secondary_mirror: default_false(),
            use_system_proxy: default_true(),
            use_enhanced_decoder: default_true(),
            aggressive_reencode: default_false(),
            reencode_quality: default_reencode_quality(),
            wide_split_enabled: default_false(),
            page_width_mm: default_page_width_mm(),
            page_height_mm: default_page_height_mm(),
            save_path: String::new(),
            cache_dir: String::new(),
            auto_clear_staging: default_true(),
            allow_overwrite_files: default_false(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 19] = [
            FieldMeta {
                name: "max_concurrent",
                description: "同时进行的最大下载数",
            },
            FieldMeta {
                name: "pacing_delay_ms",
                description: "每个下载任务开始前的等待时间, 单位ms（降低被限流的概率）",
            },
            FieldMeta {
                name: "request_timeout",
                description: "请求超时时间（秒）",
            },
            FieldMeta {
                name: "connect_timeout",
                description: "连接超时时间（秒）, <=0 表示不单独限制",
            },
            FieldMeta {
                name: "user_agent",
                description: "请求使用的 User-Agent",
            },
            FieldMeta {
                name: "referer",
                description: "请求使用的 Referer（留空则不发送）",
            },
            FieldMeta {
                name: "cookies",
                description: "附加 Cookie 列表, 每项形如 name=value",
            },
            FieldMeta {
                name: "prefer_secondary_mirror",
                description: "是否优先使用备用图片服务器（反转镜像顺序）",
            },
            FieldMeta {
                name: "use_system_proxy",
                description: "是否使用系统代理（HTTP_PROXY 等环境变量）",
            },
            FieldMeta {
                name: "use_enhanced_decoder",
                description: "JPEG 解码时是否启用块边缘平滑",
            },
            FieldMeta {
                name: "aggressive_reencode",
                description: "是否尝试重新编码 JPEG（仅在体积变小时保存）",
            },
            FieldMeta {
                name: "reencode_quality",
                description: "重新编码质量 (1-100)",
            },
            FieldMeta {
                name: "wide_split_enabled",
                description: "是否将过宽图片横向切分到多页（否则缩放到单页）",
            },
            FieldMeta {
                name: "page_width_mm",
                description: "页面宽度（毫米）",
            },
            FieldMeta {
                name: "page_height_mm",
                description: "页面高度（毫米）",
            },
            FieldMeta {
                name: "save_path",
                description: "PDF 保存路径（留空为当前目录）",
            },
            FieldMeta {
                name: "cache_dir",
                description: "图片暂存目录（留空为系统临时目录下的 .cache/manga-pdf-downloader）",
            },
            FieldMeta {
                name: "auto_clear_staging",
                description: "生成 PDF 后是否自动删除暂存图片",
            },
            FieldMeta {
                name: "allow_overwrite_files",
                description: "PDF 已存在时是否重新生成",
            },
        ];
        &FIELDS
    }
}

/// 单次构建使用的不可变参数。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuildOptions {
    pub max_concurrent: usize,
    pub pacing_delay: Duration,
    pub use_enhanced_decoder: bool,
    pub aggressive_reencode: bool,
    pub reencode_quality: u8,
    pub wide_split_enabled: bool,
    pub page_width: f64,
    pub page_height: f64,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Config::default().build_options()
    }
}

impl Config {
    pub fn build_options(&self) -> BuildOptions {
        let (page_width, page_height) = self.page_size();
        BuildOptions {
            max_concurrent: self.max_concurrent.max(1),
            pacing_delay: Duration::from_millis(self.pacing_delay_ms),
            use_enhanced_decoder: self.use_enhanced_decoder,
            aggressive_reencode: self.aggressive_reencode,
            reencode_quality: self.reencode_quality.clamp(1, 100),
            wide_split_enabled: self.wide_split_enabled,
            page_width,
            page_height,
        }
    }

    /// 非法的页面尺寸回退到 A4。
    pub fn page_size(&self) -> (f64, f64) {
        let valid = |v: f64| v.is_finite() && v > 0.0;
        if valid(self.page_width_mm) && valid(self.page_height_mm) {
            (self.page_width_mm, self.page_height_mm)
        } else {
            (A4_WIDTH_MM, A4_HEIGHT_MM)
        }
    }

    pub fn default_save_dir(&self) -> PathBuf {
        if self.save_path.trim().is_empty() {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        } else {
            PathBuf::from(&self.save_path)
        }
    }

    pub fn staging_root(&self) -> PathBuf {
        if self.cache_dir.trim().is_empty() {
            std::env::temp_dir()
                .join(".cache")
                .join("manga-pdf-downloader")
        } else {
            PathBuf::from(&self.cache_dir)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout.max(1))
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        if self.connect_timeout.is_finite() && self.connect_timeout > 0.0 {
            Some(Duration::from_secs_f64(self.connect_timeout))
        } else {
            None
        }
    }
}

pub fn safe_fs_name(name: &str, replacement: &str, max_len: usize) -> String {
    let fill = replacement.chars().next().unwrap_or('_');
    let mut cleaned: String = name
        .trim()
        .chars()
        .map(|ch| match ch {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => fill,
            c if (c as u32) < 32 => fill,
            _ => ch,
        })
        .collect();

    while cleaned.ends_with(' ') || cleaned.ends_with('.') {
        cleaned.pop();
    }

    if cleaned.is_empty() {
        cleaned.push_str("unnamed");
    }

    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    let upper = cleaned.to_uppercase();
    if RESERVED.contains(&upper.as_str()) {
        cleaned = format!("_{}", cleaned);
    }

    if cleaned.len() > max_len {
        // 避免在多字节 UTF-8 字符中间截断导致 panic
        let mut end = max_len;
        while !cleaned.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        cleaned.truncate(end);
        while cleaned.ends_with(' ') || cleaned.ends_with('.') {
            cleaned.pop();
        }
        if cleaned.is_empty() {
            cleaned.push_str("unnamed");
        }
    }

    cleaned
}

fn default_max_concurrent() -> usize {
    1
}

fn default_pacing_delay_ms() -> u64 {
    100
}

fn default_request_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> f64 {
    10.0
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:128.0) Gecko/20100101 Firefox/128.0".to_string()
}

fn default_reencode_quality() -> u8 {
    85
}

fn default_page_width_mm() -> f64 {
    A4_WIDTH_MM
}

fn default_page_height_mm() -> f64 {
    A4_HEIGHT_MM
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_options_clamp_quality_and_workers() {
        let cfg = Config {
            max_concurrent: 0,
            reencode_quality: 0,
            ..Config::default()
        };
        let opts = cfg.build_options();
        assert_eq!(opts.max_concurrent, 1);
        assert_eq!(opts.reencode_quality, 1);
        assert_eq!(opts.pacing_delay, Duration::from_millis(100));
    }

    #[test]
    fn invalid_page_size_falls_back_to_a4() {
        let cfg = Config {
            page_width_mm: 0.0,
            page_height_mm: f64::NAN,
            ..Config::default()
        };
        assert_eq!(cfg.page_size(), (A4_WIDTH_MM, A4_HEIGHT_MM));
    }

    #[test]
    fn safe_fs_name_replaces_illegal_characters() {
        assert_eq!(
            safe_fs_name("Vol.1: Ch 3 <end>?", "_", 120),
            "Vol.1_ Ch 3 _end__"
        );
        assert_eq!(safe_fs_name("  ...  ", "_", 120), "unnamed");
        assert_eq!(safe_fs_name("con", "_", 120), "_con");
    }

    #[test]
    fn safe_fs_name_truncates_on_char_boundary() {
        let name = "漫画".repeat(10);
        let out = safe_fs_name(&name, "_", 7);
        assert_eq!(out, "漫画");
    }

    #[test]
    fn field_list_covers_every_serialized_key() {
        let value = serde_yaml::to_value(Config::default()).expect("serialize");
        let serde_yaml::Value::Mapping(map) = value else {
            panic!("config must be a mapping");
        };
        assert_eq!(map.len(), Config::fields().len());
        for field in Config::fields() {
            assert!(
                map.contains_key(serde_yaml::Value::String(field.name.to_string())),
                "missing {}",
                field.name
            );
        }
    }
}
