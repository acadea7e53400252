//! 图片格式识别、校验与归一化（统一转为 JPEG）。
//!
//! 归一化会原地改写文件：非 JPEG 栅格图先转成基线 JPEG；开启重新编码时，
//! 只有新结果严格更小才会覆盖（先比较、后写入）。

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, ImageReader};
use tracing::{debug, info, warn};

use crate::base_system::context::BuildOptions;
use crate::download::models::BuildError;

/// 格式转换时使用的固定 JPEG 质量。
pub const BASELINE_JPEG_QUALITY: u8 = 85;

const PROBE_LEN: usize = 12;
/// 块边缘两侧差值超过该阈值视为真实边缘，不做平滑。
const DEBLOCK_THRESHOLD: i16 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    Webp,
    Gif,
    Tiff,
    Bmp,
    Unknown,
}

impl ImageKind {
    /// 按文件头魔数识别，只看前 12 字节。
    pub fn sniff(bytes: &[u8]) -> Self {
        let head = &bytes[..bytes.len().min(PROBE_LEN)];
        if head.starts_with(b"\x89PNG") {
            Self::Png
        } else if head.starts_with(&[0xFF, 0xD8]) {
            Self::Jpeg
        } else if head.starts_with(b"II*\0") || head.starts_with(b"MM\0*") {
            Self::Tiff
        } else if head.starts_with(b"BM") || head.starts_with(b"MZ") {
            // "MZ" 兼容旧版探测规则，解码失败时按不可读处理
            Self::Bmp
        } else if head.len() >= 12 && &head[0..4] == b"RIFF" && &head[8..12] == b"WEBP" {
            Self::Webp
        } else if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
            Self::Gif
        } else {
            Self::Unknown
        }
    }

    pub fn sniff_file(path: &Path) -> Result<Self, BuildError> {
        let mut file = fs::File::open(path).map_err(|e| BuildError::io(path, e))?;
        let mut head = [0u8; PROBE_LEN];
        let mut filled = 0;
        while filled < PROBE_LEN {
            match file.read(&mut head[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Err(BuildError::io(path, e)),
            }
        }
        Ok(Self::sniff(&head[..filled]))
    }

    fn image_format(self) -> Option<image::ImageFormat> {
        match self {
            Self::Jpeg => Some(image::ImageFormat::Jpeg),
            Self::Png => Some(image::ImageFormat::Png),
            Self::Webp => Some(image::ImageFormat::WebP),
            Self::Gif => Some(image::ImageFormat::Gif),
            Self::Tiff => Some(image::ImageFormat::Tiff),
            Self::Bmp => Some(image::ImageFormat::Bmp),
            Self::Unknown => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Gif => "gif",
            Self::Tiff => "tiff",
            Self::Bmp => "bmp",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedAsset {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
    pub format: ImageKind,
}

/// 下载内容校验：必须能读出 jpeg/png/webp/gif 的有效图片头。
pub(crate) fn verify_image_bytes(bytes: &[u8]) -> Result<(ImageKind, u32, u32), String> {
    let kind = ImageKind::sniff(bytes);
    if !matches!(
        kind,
        ImageKind::Jpeg | ImageKind::Png | ImageKind::Webp | ImageKind::Gif
    ) {
        return Err(format!("unsupported content ({})", kind.name()));
    }
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| e.to_string())?;
    let (w, h) = reader.into_dimensions().map_err(|e| e.to_string())?;
    if w == 0 || h == 0 {
        return Err("zero-sized image".to_string());
    }
    Ok((kind, w, h))
}

/// JPEG 帧头（SOF）中与嵌入相关的信息。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct JpegFrame {
    pub width: u32,
    pub height: u32,
    pub components: u8,
    /// 带 Adobe APP14 段；这类 CMYK 数据按反相存储
    pub adobe: bool,
}

/// 顺序扫描标记段直到 SOS，读出帧头。只看文件头，不解码像素。
pub(crate) fn jpeg_frame(bytes: &[u8]) -> Option<JpegFrame> {
    if !bytes.starts_with(&[0xFF, 0xD8]) {
        return None;
    }
    let mut adobe = false;
    let mut frame = None;
    let mut i = 2;
    while i + 1 < bytes.len() {
        if bytes[i] != 0xFF {
            return None;
        }
        let marker = bytes[i + 1];
        match marker {
            // 填充字节
            0xFF => {
                i += 1;
                continue;
            }
            0x01 | 0xD0..=0xD7 => {
                i += 2;
                continue;
            }
            0xD9 | 0xDA => break,
            _ => {}
        }
        let len = usize::from(u16::from_be_bytes([*bytes.get(i + 2)?, *bytes.get(i + 3)?]));
        if len < 2 {
            return None;
        }
        let seg = bytes.get(i + 4..i + 2 + len)?;
        match marker {
            0xEE if seg.starts_with(b"Adobe") => adobe = true,
            0xC0..=0xCF if !matches!(marker, 0xC4 | 0xC8 | 0xCC) => {
                if seg.len() < 6 {
                    return None;
                }
                frame = Some((
                    u32::from(u16::from_be_bytes([seg[3], seg[4]])),
                    u32::from(u16::from_be_bytes([seg[1], seg[2]])),
                    seg[5],
                ));
            }
            _ => {}
        }
        i += 2 + len;
    }
    frame.map(|(width, height, components)| JpegFrame {
        width,
        height,
        components,
        adobe,
    })
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!(
        "{}part",
        path.extension().and_then(|s| s.to_str()).unwrap_or("")
    ));
    // rename 直接覆盖目标，失败时目标保持原样，只清理临时文件
    let written = fs::write(&tmp, bytes).and_then(|()| fs::rename(&tmp, path));
    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    written
}

// ── 解码 / 编码 ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JpegDecoderKind {
    Standard,
    /// 解码后对 8x8 块边界做平滑，像素布局与 Standard 相同
    Enhanced,
}

impl JpegDecoderKind {
    pub fn from_options(opts: &BuildOptions) -> Self {
        if opts.use_enhanced_decoder {
            Self::Enhanced
        } else {
            Self::Standard
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<DynamicImage, image::ImageError> {
        let img = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)?;
        Ok(match self {
            Self::Standard => img,
            Self::Enhanced => smooth_block_edges(img),
        })
    }
}

fn smooth_block_edges(img: DynamicImage) -> DynamicImage {
    match img {
        DynamicImage::ImageLuma8(mut buf) => {
            let (w, h) = buf.dimensions();
            deblock(&mut buf, w as usize, h as usize, 1);
            DynamicImage::ImageLuma8(buf)
        }
        DynamicImage::ImageRgb8(mut buf) => {
            let (w, h) = buf.dimensions();
            deblock(&mut buf, w as usize, h as usize, 3);
            DynamicImage::ImageRgb8(buf)
        }
        // JPEG 只会解出 L8 / RGB8（CMYK 已转换），其它类型原样返回
        other => other,
    }
}

fn deblock(px: &mut [u8], w: usize, h: usize, channels: usize) {
    let stride = w * channels;
    let blend = |a: usize, b: usize, px: &mut [u8]| {
        let (va, vb) = (px[a] as i16, px[b] as i16);
        if (va - vb).abs() <= DEBLOCK_THRESHOLD {
            px[a] = ((3 * va + vb + 2) / 4) as u8;
            px[b] = ((va + 3 * vb + 2) / 4) as u8;
        }
    };
    for x in (8..w).step_by(8) {
        for y in 0..h {
            for c in 0..channels {
                let right = y * stride + x * channels + c;
                blend(right - channels, right, px);
            }
        }
    }
    for y in (8..h).step_by(8) {
        for x in 0..w {
            for c in 0..channels {
                let below = y * stride + x * channels + c;
                blend(below - stride, below, px);
            }
        }
    }
}

/// 基线编码：统一 RGB。
fn encode_baseline_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode(
        &rgb,
        rgb.width(),
        rgb.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(out)
}

/// 增强编码：灰度内容（漫画常见）按单通道编码。
fn encode_enhanced_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let quality = quality.clamp(1, 100);
    let mut out = Vec::new();
    if is_grayscale(img) {
        let luma = img.to_luma8();
        JpegEncoder::new_with_quality(&mut out, quality).encode(
            &luma,
            luma.width(),
            luma.height(),
            ExtendedColorType::L8,
        )?;
    } else {
        let rgb = img.to_rgb8();
        JpegEncoder::new_with_quality(&mut out, quality).encode(
            &rgb,
            rgb.width(),
            rgb.height(),
            ExtendedColorType::Rgb8,
        )?;
    }
    Ok(out)
}

fn is_grayscale(img: &DynamicImage) -> bool {
    match img {
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageLuma16(_) => true,
        DynamicImage::ImageRgb8(buf) => buf.pixels().all(|p| p[0] == p[1] && p[1] == p[2]),
        _ => false,
    }
}

/// 只在候选结果严格更小时返回它。
pub fn keep_if_smaller(original: &[u8], candidate: Vec<u8>) -> Option<Vec<u8>> {
    (candidate.len() < original.len()).then_some(candidate)
}

fn percentage_change(before: u64, after: u64) -> f64 {
    if before == 0 {
        return 0.0;
    }
    (after as f64 - before as f64) / before as f64 * 100.0
}

// ── 归一化 ─────────────────────────────────────────────────────

fn unreadable(path: &Path, reason: impl ToString) -> BuildError {
    BuildError::UnreadableImage {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// 把已下载的图片就地归一化为 JPEG，返回最终尺寸与大小。
pub fn normalize(path: &Path, opts: &BuildOptions) -> Result<NormalizedAsset, BuildError> {
    let kind = ImageKind::sniff_file(path)?;
    debug!(target: "normalize", "{}: detected {}", path.display(), kind.name());

    let Some(format) = kind.image_format() else {
        return Err(unreadable(path, "unrecognised image signature"));
    };

    if kind != ImageKind::Jpeg {
        let bytes = fs::read(path).map_err(|e| BuildError::io(path, e))?;
        let img = image::load_from_memory_with_format(&bytes, format)
            .map_err(|e| unreadable(path, e))?;
        let jpeg = encode_baseline_jpeg(&img, BASELINE_JPEG_QUALITY)
            .map_err(|e| unreadable(path, format!("jpeg conversion failed: {e}")))?;
        write_atomic(path, &jpeg).map_err(|e| BuildError::io(path, e))?;
        debug!(target: "normalize", "{}: converted {} -> jpeg", path.display(), kind.name());
    }

    // 无论是否重新编码都完整解码一次，熵编码数据损坏的 JPEG 在这里被丢弃
    let original = fs::read(path).map_err(|e| BuildError::io(path, e))?;
    let img = JpegDecoderKind::from_options(opts)
        .decode(&original)
        .map_err(|e| unreadable(path, e))?;
    let (width, height) = (img.width(), img.height());
    if opts.aggressive_reencode {
        reencode_if_smaller(path, &original, &img, opts.reencode_quality);
    }

    let byte_size = fs::metadata(path)
        .map_err(|e| BuildError::io(path, e))?
        .len();

    Ok(NormalizedAsset {
        path: path.to_path_buf(),
        width,
        height,
        byte_size,
        format: ImageKind::Jpeg,
    })
}

/// 重新编码并仅在严格更小时覆盖；任何失败都保留原文件。
fn reencode_if_smaller(path: &Path, original: &[u8], img: &DynamicImage, quality: u8) {
    let candidate = match encode_enhanced_jpeg(img, quality) {
        Ok(bytes) => bytes,
        Err(e) => {
            let err = BuildError::EncodeFailure(e.to_string());
            warn!(target: "normalize", "{}: {err}, keeping original", path.display());
            return;
        }
    };

    let before = original.len() as u64;
    let after = candidate.len() as u64;
    match keep_if_smaller(original, candidate) {
        Some(smaller) => match write_atomic(path, &smaller) {
            Ok(()) => info!(
                target: "normalize",
                "{}: re-encoded {} -> {} bytes ({:.2}%)",
                path.display(),
                before,
                after,
                percentage_change(before, after)
            ),
            Err(e) => warn!(
                target: "normalize",
                "{}: cannot replace with re-encoded copy ({e}), keeping original",
                path.display()
            ),
        },
        None => {
            debug!(
                target: "normalize",
                "{}: re-encode not smaller ({} -> {} bytes), keeping original",
                path.display(),
                before,
                after
            );
        }
    }
}
