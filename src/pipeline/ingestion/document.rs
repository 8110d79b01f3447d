use pdf_extract::{MediaBox, OutputDev, OutputError, Transform};
use std::panic;
use std::path::Path;

use crate::error::{LabError, Result};

const FORM_FEED: char = '\u{000C}';

/// Glyphs whose baselines differ by less than this share of the font size sit on one line
const LINE_TOLERANCE: f64 = 0.5;
/// Horizontal gap, as a share of the font size, that separates two words
const WORD_GAP: f64 = 0.1;

/// Input formats recognised by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Text,
}

impl DocumentKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(DocumentKind::Pdf),
            "txt" => Some(DocumentKind::Text),
            _ => None,
        }
    }
}

/// Pages of one document, reflowed as they are pulled.
///
/// Decoding happens when the iterator is built, so a document that cannot be
/// decoded fails before any page is produced.
#[derive(Debug)]
pub struct Pages {
    raw: std::vec::IntoIter<String>,
}

impl Pages {
    pub fn decode(kind: DocumentKind, bytes: &[u8], path: &Path) -> Result<Self> {
        let raw = match kind {
            DocumentKind::Pdf => decode_pdf(bytes).map_err(|reason| LabError::DocumentRead {
                path: path.to_path_buf(),
                reason,
            })?,
            DocumentKind::Text => {
                let text = std::str::from_utf8(bytes).map_err(|e| LabError::DocumentRead {
                    path: path.to_path_buf(),
                    reason: format!("not valid UTF-8: {}", e),
                })?;
                text.split(FORM_FEED).map(str::to_string).collect()
            }
        };
        Ok(Self {
            raw: raw.into_iter(),
        })
    }

    /// Drain the remaining pages into one text, pages separated by a line break
    pub fn into_text(self) -> String {
        self.collect::<Vec<_>>().join("\n")
    }
}

impl Iterator for Pages {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        self.raw.next().map(|page| reflow_page(&page))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.raw.size_hint()
    }
}

/// Decode every page of a PDF into position-ordered text. The decoder can
/// panic on malformed content streams; a panic is reported as a read failure.
fn decode_pdf(bytes: &[u8]) -> std::result::Result<Vec<String>, String> {
    match panic::catch_unwind(|| layout_pdf(bytes)) {
        Ok(Ok(pages)) => Ok(pages),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown cause".to_string());
            Err(format!("PDF decoder failed: {}", detail))
        }
    }
}

fn layout_pdf(bytes: &[u8]) -> std::result::Result<Vec<String>, OutputError> {
    let mut doc = pdf_extract::Document::load_mem(bytes)?;
    if doc.is_encrypted() {
        doc.decrypt("")?;
    }
    let mut layout = PageLayout::default();
    pdf_extract::output_doc(&doc, &mut layout)?;
    Ok(layout.pages)
}

#[derive(Debug, Clone)]
struct Glyph {
    x: f64,
    /// Distance from the top of the page
    y: f64,
    end: f64,
    size: f64,
    text: String,
}

/// Collects positioned glyphs and lays each finished page out top-to-bottom,
/// left-to-right, whatever order the content stream drew them in.
#[derive(Debug, Default)]
struct PageLayout {
    page_height: f64,
    glyphs: Vec<Glyph>,
    pages: Vec<String>,
}

impl OutputDev for PageLayout {
    fn begin_page(
        &mut self,
        _page_num: u32,
        media_box: &MediaBox,
        _art_box: Option<(f64, f64, f64, f64)>,
    ) -> std::result::Result<(), OutputError> {
        self.page_height = media_box.ury - media_box.lly;
        self.glyphs.clear();
        Ok(())
    }

    fn end_page(&mut self) -> std::result::Result<(), OutputError> {
        let glyphs = std::mem::take(&mut self.glyphs);
        self.pages.push(layout_lines(glyphs));
        Ok(())
    }

    fn output_character(
        &mut self,
        trm: &Transform,
        width: f64,
        _spacing: f64,
        font_size: f64,
        text: &str,
    ) -> std::result::Result<(), OutputError> {
        let scale = (trm.m11 * trm.m22 - trm.m12 * trm.m21).abs().sqrt();
        let size = (font_size * scale).max(f64::EPSILON);
        let x = trm.m31;
        self.glyphs.push(Glyph {
            x,
            y: self.page_height - trm.m32,
            end: x + width * size,
            size,
            text: text.to_string(),
        });
        Ok(())
    }

    fn begin_word(&mut self) -> std::result::Result<(), OutputError> {
        Ok(())
    }

    fn end_word(&mut self) -> std::result::Result<(), OutputError> {
        Ok(())
    }

    fn end_line(&mut self) -> std::result::Result<(), OutputError> {
        Ok(())
    }
}

/// Group glyphs into lines by baseline, order lines top-down and glyphs
/// left-to-right, and insert a space wherever the horizontal gap is wide.
fn layout_lines(mut glyphs: Vec<Glyph>) -> String {
    glyphs.sort_by(|a, b| a.y.total_cmp(&b.y).then(a.x.total_cmp(&b.x)));

    let mut lines: Vec<Vec<Glyph>> = Vec::new();
    for glyph in glyphs {
        let same_line = lines.last().map_or(false, |line| {
            (glyph.y - line[0].y).abs() < line[0].size.max(glyph.size) * LINE_TOLERANCE
        });
        match lines.last_mut() {
            Some(line) if same_line => line.push(glyph),
            _ => lines.push(vec![glyph]),
        }
    }

    lines
        .into_iter()
        .map(|mut line| {
            line.sort_by(|a, b| a.x.total_cmp(&b.x));
            let mut text = String::new();
            let mut last_end: Option<f64> = None;
            for glyph in &line {
                if let Some(end) = last_end {
                    if glyph.x > end + glyph.size * WORD_GAP {
                        text.push(' ');
                    }
                }
                text.push_str(&glyph.text);
                last_end = Some(glyph.end);
            }
            text
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Collapse each line's whitespace runs to single spaces and drop blank lines
fn reflow_page(raw: &str) -> String {
    raw.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// One-page PDF drawing `content`; `F1` is Helvetica unless `with_font` is false
    pub(crate) fn pdf_with_content(content: &str, with_font: bool) -> Vec<u8> {
        use lopdf::dictionary;
        use lopdf::{Dictionary, Document, Object, Stream};

        let mut doc = Document::with_version("1.4");
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources = if with_font {
            dictionary! { "Font" => dictionary! { "F1" => font_id } }
        } else {
            Dictionary::new()
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.as_bytes().to_vec()));

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Contents" => content_id,
            "Resources" => resources,
        });
        let pages_id = doc.add_object(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        });
        if let Ok(Object::Dictionary(dict)) = doc.get_object_mut(page_id) {
            dict.set("Parent", pages_id);
        }
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut buf = Vec::new();
        doc.save_to(&mut buf).unwrap();
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::pdf_with_content;
    use super::*;
    use std::path::PathBuf;

    fn make_test_pdf(lines: &[&str]) -> Vec<u8> {
        let mut content = String::from("BT /F1 12 Tf 72 720 Td 14 TL ");
        for line in lines {
            content.push_str(&format!("({}) Tj T* ", line));
        }
        content.push_str("ET");
        pdf_with_content(&content, true)
    }

    fn pdf_text(bytes: &[u8]) -> String {
        Pages::decode(DocumentKind::Pdf, bytes, Path::new("a.pdf"))
            .unwrap()
            .into_text()
    }

    #[test]
    fn pdf_text_is_extracted() {
        let bytes = make_test_pdf(&["GLICOSE 95 mg/dL", "UREIA 30 mg/dL"]);
        assert_eq!(pdf_text(&bytes), "GLICOSE 95 mg/dL\nUREIA 30 mg/dL");
    }

    #[test]
    fn lines_follow_page_position_not_drawing_order() {
        let bytes = pdf_with_content(
            "BT /F1 12 Tf 72 600 Td (BOTTOMLINE) Tj ET BT /F1 12 Tf 72 700 Td (TOPLINE) Tj ET",
            true,
        );
        assert_eq!(pdf_text(&bytes), "TOPLINE\nBOTTOMLINE");
    }

    #[test]
    fn words_on_one_baseline_are_ordered_left_to_right() {
        let bytes = pdf_with_content(
            "BT /F1 12 Tf 300 700 Td (RIGHT) Tj ET BT /F1 12 Tf 72 700 Td (LEFT) Tj ET",
            true,
        );
        assert_eq!(pdf_text(&bytes), "LEFT RIGHT");
    }

    #[test]
    fn decoder_panic_becomes_read_error() {
        // the page selects a font its resources do not define
        let bytes = pdf_with_content("BT /F9 12 Tf 72 700 Td (LOST) Tj ET", false);
        let err = Pages::decode(DocumentKind::Pdf, &bytes, Path::new("bad.pdf")).unwrap_err();
        match err {
            LabError::DocumentRead { path, reason } => {
                assert_eq!(path, PathBuf::from("bad.pdf"));
                assert!(!reason.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn invalid_pdf_fails_before_any_page() {
        let err = Pages::decode(DocumentKind::Pdf, b"not a pdf", Path::new("bad.pdf")).unwrap_err();
        match err {
            LabError::DocumentRead { path, .. } => assert_eq!(path, PathBuf::from("bad.pdf")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn text_pages_split_on_form_feed() {
        let raw = "page   one\n\n  line two \u{000C}page two";
        let pages: Vec<String> = Pages::decode(DocumentKind::Text, raw.as_bytes(), Path::new("a.txt"))
            .unwrap()
            .collect();
        assert_eq!(pages, vec!["page one\nline two".to_string(), "page two".to_string()]);
    }

    #[test]
    fn invalid_utf8_text_is_a_read_error() {
        let err = Pages::decode(DocumentKind::Text, &[0xff, 0xfe, 0x00], Path::new("a.txt")).unwrap_err();
        assert!(matches!(err, LabError::DocumentRead { .. }));
    }

    #[test]
    fn kind_follows_extension() {
        assert_eq!(DocumentKind::from_path(Path::new("x/REPORT.PDF")), Some(DocumentKind::Pdf));
        assert_eq!(DocumentKind::from_path(Path::new("x/r.txt")), Some(DocumentKind::Text));
        assert_eq!(DocumentKind::from_path(Path::new("x/r.docx")), None);
    }
}
