//! 页面排版：为每张图片决定单页 / 纵向切分 / 横向切分。
//!
//! 纯函数，不做任何 I/O；单位统一为毫米，原点在页面左上角。

use crate::download::models::BuildError;
use crate::page_builder::image_utils::NormalizedAsset;

/// 横向切分的触发阈值：图片像素宽度 / 页面宽度。
const WIDE_SPLIT_RATIO: f64 = 1.5;
/// 纵向切分的触发阈值：图片高宽比 > 该倍数 * 页面高宽比。
const TALL_SPLIT_FACTOR: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlacementKind {
    SinglePage {
        scale: f64,
        offset_x: f64,
        offset_y: f64,
    },
    TallSplit {
        page_count: usize,
        scale: f64,
    },
    WideSplit {
        slice_count: usize,
        scale: f64,
        slice_width: f64,
    },
}

/// 一条排版指令，`asset` 为其在归一化列表中的位置。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub asset: usize,
    pub kind: PlacementKind,
}

/// 图片在某一页上的绘制矩形（可能超出页面，由页面裁剪）。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Placement {
    pub fn page_count(&self) -> usize {
        match self.kind {
            PlacementKind::SinglePage { .. } => 1,
            PlacementKind::TallSplit { page_count, .. } => page_count,
            PlacementKind::WideSplit { slice_count, .. } => slice_count,
        }
    }

    /// 展开为逐页的绘制矩形。
    ///
    /// 纵向切分按整页高度步进，横向切分按切片宽度步进，两者刻意不同。
    pub fn page_rects(&self, width: u32, height: u32, page_w: f64, page_h: f64) -> Vec<ImageRect> {
        let (w, h) = (width as f64, height as f64);
        match self.kind {
            PlacementKind::SinglePage {
                scale,
                offset_x,
                offset_y,
            } => vec![ImageRect {
                x: offset_x,
                y: offset_y,
                width: w * scale,
                height: h * scale,
            }],
            PlacementKind::TallSplit { page_count, scale } => {
                let (sw, sh) = (w * scale, h * scale);
                let x = (page_w - sw) / 2.0;
                (0..page_count)
                    .map(|p| ImageRect {
                        x,
                        y: -(p as f64) * page_h,
                        width: sw,
                        height: sh,
                    })
                    .collect()
            }
            PlacementKind::WideSplit {
                slice_count,
                scale,
                slice_width,
            } => {
                let (sw, sh) = (w * scale, h * scale);
                let y = (page_h - sh) / 2.0;
                (0..slice_count)
                    .map(|s| ImageRect {
                        x: -(s as f64) * slice_width,
                        y,
                        width: sw,
                        height: sh,
                    })
                    .collect()
            }
        }
    }
}

fn place_one(width: u32, height: u32, page_w: f64, page_h: f64, wide_split: bool) -> PlacementKind {
    let (w, h) = (width as f64, height as f64);
    let image_ratio = h / w;
    let page_ratio = page_h / page_w;

    if image_ratio > TALL_SPLIT_FACTOR * page_ratio {
        let scale = page_w / w;
        let page_count = ((h * scale) / page_h).ceil().max(1.0) as usize;
        return PlacementKind::TallSplit { page_count, scale };
    }

    if wide_split && w / page_w > WIDE_SPLIT_RATIO {
        let scale = page_h / h;
        let scaled_width = w * scale;
        let slice_count = (scaled_width / page_w).ceil().max(1.0) as usize;
        return PlacementKind::WideSplit {
            slice_count,
            scale,
            slice_width: scaled_width / slice_count as f64,
        };
    }

    let scale = (page_w / w).min(page_h / h);
    PlacementKind::SinglePage {
        scale,
        offset_x: (page_w - w * scale) / 2.0,
        offset_y: (page_h - h * scale) / 2.0,
    }
}

/// 为有序的图片列表生成排版指令，顺序与输入一致。
pub fn layout(
    assets: &[NormalizedAsset],
    page_w: f64,
    page_h: f64,
    wide_split_enabled: bool,
) -> Result<Vec<Placement>, BuildError> {
    let page_ok = page_w.is_finite() && page_h.is_finite() && page_w > 0.0 && page_h > 0.0;
    assets
        .iter()
        .enumerate()
        .map(|(i, asset)| {
            if !page_ok || asset.width == 0 || asset.height == 0 {
                return Err(BuildError::LayoutImpossible {
                    path: asset.path.clone(),
                    width: asset.width,
                    height: asset.height,
                });
            }
            Ok(Placement {
                asset: i,
                kind: place_one(asset.width, asset.height, page_w, page_h, wide_split_enabled),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_builder::image_utils::ImageKind;
    use std::path::PathBuf;

    const A4: (f64, f64) = (210.0, 297.0);

    fn asset(name: &str, width: u32, height: u32) -> NormalizedAsset {
        NormalizedAsset {
            path: PathBuf::from(name),
            width,
            height,
            byte_size: 1,
            format: ImageKind::Jpeg,
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn tall_strip_is_split_vertically() {
        let kind = place_one(400, 2000, A4.0, A4.1, false);
        let PlacementKind::TallSplit { page_count, scale } = kind else {
            panic!("expected tall split, got {kind:?}");
        };
        assert_eq!(page_count, 4);
        assert!(approx(scale, 0.525));
    }

    #[test]
    fn wide_spread_is_sliced_when_enabled() {
        let kind = place_one(900, 300, A4.0, A4.1, true);
        let PlacementKind::WideSplit {
            slice_count,
            scale,
            slice_width,
        } = kind
        else {
            panic!("expected wide split, got {kind:?}");
        };
        assert_eq!(slice_count, 5);
        assert!(approx(scale, 0.99));
        assert!(approx(slice_width, 178.2));
    }

    #[test]
    fn wide_spread_is_letterboxed_when_disabled() {
        let kind = place_one(900, 300, A4.0, A4.1, false);
        assert!(matches!(kind, PlacementKind::SinglePage { .. }));
    }

    #[test]
    fn ordinary_image_fits_one_page() {
        let kind = place_one(800, 600, A4.0, A4.1, true);
        let PlacementKind::SinglePage {
            scale,
            offset_x,
            offset_y,
        } = kind
        else {
            panic!("expected single page, got {kind:?}");
        };
        assert!(approx(scale, 0.2625));
        assert!(approx(offset_x, 0.0));
        assert!(approx(offset_y, (297.0 - 600.0 * 0.2625) / 2.0));
    }

    #[test]
    fn thresholds_are_strict() {
        // 高宽比恰好等于 2 * 页面比例：不切分
        let kind = place_one(210, 594, A4.0, A4.1, false);
        assert!(matches!(kind, PlacementKind::SinglePage { .. }));
        // 宽度恰好 1.5 倍页宽：不切分
        let kind = place_one(315, 100, A4.0, A4.1, true);
        assert!(matches!(kind, PlacementKind::SinglePage { .. }));
    }

    #[test]
    fn tall_pages_step_by_page_height() {
        let placement = Placement {
            asset: 0,
            kind: place_one(400, 2000, A4.0, A4.1, false),
        };
        let rects = placement.page_rects(400, 2000, A4.0, A4.1);
        assert_eq!(rects.len(), 4);
        for (p, rect) in rects.iter().enumerate() {
            assert!(approx(rect.y, -(p as f64) * 297.0));
            assert!(approx(rect.x, 0.0));
            assert!(approx(rect.width, 210.0));
            assert!(approx(rect.height, 1050.0));
        }
    }

    #[test]
    fn wide_slices_step_by_slice_width() {
        let placement = Placement {
            asset: 0,
            kind: place_one(900, 300, A4.0, A4.1, true),
        };
        let rects = placement.page_rects(900, 300, A4.0, A4.1);
        assert_eq!(rects.len(), 5);
        assert!(approx(rects[1].x, -178.2));
        assert!(approx(rects[4].x, -4.0 * 178.2));
        assert!(rects.iter().all(|r| approx(r.y, 0.0)));
    }

    #[test]
    fn layout_keeps_order_and_rejects_degenerate_sizes() {
        let assets = vec![asset("1.jpg", 800, 600), asset("2.jpg", 400, 2000)];
        let placements = layout(&assets, A4.0, A4.1, false).expect("layout");
        assert_eq!(
            placements.iter().map(|p| p.asset).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(
            placements.iter().map(Placement::page_count).sum::<usize>(),
            5
        );

        let broken = vec![asset("3.jpg", 0, 600)];
        assert!(matches!(
            layout(&broken, A4.0, A4.1, false),
            Err(BuildError::LayoutImpossible { width: 0, .. })
        ));
        assert!(matches!(
            layout(&assets, f64::NAN, A4.1, false),
            Err(BuildError::LayoutImpossible { .. })
        ));
    }
}
