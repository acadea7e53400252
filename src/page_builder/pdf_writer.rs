//! 基于 lopdf 的 PDF 组装。
//!
//! JPEG 以 `/DCTDecode` 原样嵌入，不重新编码；同一张图片跨多页时只嵌入一次。

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use lopdf::{Document, Object, ObjectId, Stream, dictionary};
use tracing::debug;

use crate::download::models::BuildError;
use crate::page_builder::image_utils::{NormalizedAsset, jpeg_frame};
use crate::page_builder::layout::Placement;

const PT_PER_MM: f64 = 72.0 / 25.4;
pub const BLACK: [u8; 3] = [0, 0, 0];

/// 文档组装接口：单位为毫米，原点在页面左上角。
pub trait PdfAssembler {
    fn new_document(page_w: f64, page_h: f64) -> Self
    where
        Self: Sized;
    fn add_page(&mut self);
    fn fill_background(&mut self, rgb: [u8; 3]);
    fn place_image(&mut self, path: &Path, x: f64, y: f64, w: f64, h: f64)
    -> Result<(), BuildError>;
    /// 写出文件，返回页数。
    fn save(self, output: &Path) -> Result<usize, BuildError>
    where
        Self: Sized;
}

/// 按排版指令逐页绘制，返回本次添加的页数。
pub fn execute_placements<A: PdfAssembler>(
    assembler: &mut A,
    assets: &[NormalizedAsset],
    placements: &[Placement],
    page_w: f64,
    page_h: f64,
) -> Result<usize, BuildError> {
    let mut pages = 0;
    for placement in placements {
        let Some(asset) = assets.get(placement.asset) else {
            continue;
        };
        for rect in placement.page_rects(asset.width, asset.height, page_w, page_h) {
            assembler.add_page();
            assembler.fill_background(BLACK);
            assembler.place_image(&asset.path, rect.x, rect.y, rect.width, rect.height)?;
            pages += 1;
        }
    }
    Ok(pages)
}

struct EmbeddedImage {
    name: String,
    id: ObjectId,
}

#[derive(Default)]
struct PageDraft {
    ops: String,
    xobjects: Vec<(String, ObjectId)>,
}

pub struct LopdfWriter {
    doc: Document,
    pages_id: ObjectId,
    width_pt: f64,
    height_pt: f64,
    pages: Vec<PageDraft>,
    images: HashMap<PathBuf, EmbeddedImage>,
}

impl LopdfWriter {
    fn current_page(&mut self) -> &mut PageDraft {
        if self.pages.is_empty() {
            self.pages.push(PageDraft::default());
        }
        let last = self.pages.len() - 1;
        &mut self.pages[last]
    }

    fn embed_jpeg(&mut self, path: &Path) -> Result<(String, ObjectId), BuildError> {
        if let Some(img) = self.images.get(path) {
            return Ok((img.name.clone(), img.id));
        }

        let bytes = fs::read(path).map_err(|e| BuildError::io(path, e))?;
        let unreadable = |reason: String| BuildError::UnreadableImage {
            path: path.to_path_buf(),
            reason,
        };
        let frame =
            jpeg_frame(&bytes).ok_or_else(|| unreadable("missing JPEG frame header".to_string()))?;
        let (w, h) = (frame.width, frame.height);
        // DCT 数据原样嵌入，色彩空间必须与流内分量数一致
        let color_space = match frame.components {
            1 => "DeviceGray",
            4 => "DeviceCMYK",
            _ => "DeviceRGB",
        };

        let mut dict = dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => w as i64,
            "Height" => h as i64,
            "ColorSpace" => color_space,
            "BitsPerComponent" => 8,
            "Filter" => "DCTDecode",
        };
        if frame.components == 4 && frame.adobe {
            dict.set("Decode", [1, 0, 1, 0, 1, 0, 1, 0].map(Object::Integer).to_vec());
        }
        let stream = Stream::new(dict, bytes).with_compression(false);
        let id = self.doc.add_object(stream);
        let name = format!("Im{}", self.images.len() + 1);
        debug!(target: "pdf", "embedded {} as /{name} ({w}x{h}, {color_space})", path.display());
        self.images.insert(
            path.to_path_buf(),
            EmbeddedImage {
                name: name.clone(),
                id,
            },
        );
        Ok((name, id))
    }
}

fn real(v: f64) -> Object {
    Object::Real(v as f32)
}

impl PdfAssembler for LopdfWriter {
    fn new_document(page_w: f64, page_h: f64) -> Self {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        Self {
            doc,
            pages_id,
            width_pt: page_w * PT_PER_MM,
            height_pt: page_h * PT_PER_MM,
            pages: Vec::new(),
            images: HashMap::new(),
        }
    }

    fn add_page(&mut self) {
        self.pages.push(PageDraft::default());
    }

    fn fill_background(&mut self, rgb: [u8; 3]) {
        let (w, h) = (self.width_pt, self.height_pt);
        let [r, g, b] = rgb.map(|c| c as f64 / 255.0);
        self.current_page().ops.push_str(&format!(
            "q {r:.4} {g:.4} {b:.4} rg 0 0 {w:.4} {h:.4} re f Q\n"
        ));
    }

    fn place_image(
        &mut self,
        path: &Path,
        x: f64,
        y: f64,
        w: f64,
        h: f64,
    ) -> Result<(), BuildError> {
        let (name, id) = self.embed_jpeg(path)?;
        let page_h = self.height_pt;
        let (w_pt, h_pt) = (w * PT_PER_MM, h * PT_PER_MM);
        let x_pt = x * PT_PER_MM;
        // 左上角原点 -> PDF 左下角原点
        let y_pt = page_h - (y * PT_PER_MM + h_pt);

        let page = self.current_page();
        page.ops.push_str(&format!(
            "q {w_pt:.4} 0 0 {h_pt:.4} {x_pt:.4} {y_pt:.4} cm /{name} Do Q\n"
        ));
        if !page.xobjects.iter().any(|(n, _)| *n == name) {
            page.xobjects.push((name, id));
        }
        Ok(())
    }

    fn save(mut self, output: &Path) -> Result<usize, BuildError> {
        let media_box = vec![real(0.0), real(0.0), real(self.width_pt), real(self.height_pt)];
        let mut kids: Vec<Object> = Vec::with_capacity(self.pages.len());

        for draft in std::mem::take(&mut self.pages) {
            let content_id = self
                .doc
                .add_object(Stream::new(dictionary! {}, draft.ops.into_bytes()));
            let mut xobjects = lopdf::Dictionary::new();
            for (name, id) in draft.xobjects {
                xobjects.set(name.into_bytes(), Object::Reference(id));
            }
            let page_id = self.doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => self.pages_id,
                "Contents" => content_id,
                "Resources" => dictionary! {
                    "XObject" => xobjects,
                },
                "MediaBox" => media_box.clone(),
            });
            kids.push(Object::Reference(page_id));
        }

        let page_count = kids.len();
        self.doc.objects.insert(
            self.pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => page_count as i64,
            }),
        );
        let catalog_id = self.doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id,
        });
        self.doc.trailer.set("Root", catalog_id);
        self.doc.compress();

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
        }
        let tmp = output.with_extension("pdfpart");
        self.doc
            .save(&tmp)
            .map_err(|e| BuildError::io(&tmp, e))?;
        fs::rename(&tmp, output).map_err(|e| BuildError::io(output, e))?;
        Ok(page_count)
    }
}
