//! Plain-text extraction for the file formats the file connector accepts.
//!
//! Dispatch is by lowercase file extension:
//!
//! | Extension | Extractor |
//! |-----------|-----------|
//! | `.pdf` | `pdf-extract` |
//! | `.docx`, `.doc` | `word/document.xml` `w:t` runs via `zip` + `quick-xml` |
//! | `.md` | markup stripping |
//! | `.txt` | UTF-8 passthrough (lossy) |
//!
//! Legacy binary `.doc` files are not OOXML archives; they go through the
//! DOCX path and surface as [`ExtractError::Ooxml`] when they cannot be read.

use std::io::Read;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    UnsupportedType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Ooxml(String),
}

/// Extract UTF-8 text from file bytes, choosing the parser by `extension`.
pub fn extract_text(bytes: &[u8], extension: &str) -> Result<String, ExtractError> {
    match extension.to_ascii_lowercase().as_str() {
        "pdf" => extract_pdf(bytes),
        "docx" | "doc" => extract_docx(bytes),
        "md" => Ok(markdown_to_text(&String::from_utf8_lossy(bytes))),
        "txt" => Ok(String::from_utf8_lossy(bytes).into_owned()),
        other => Err(ExtractError::UnsupportedType(other.to_string())),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Ooxml("word/document.xml not found".to_string()))?;

    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    extract_w_t_elements(&doc_xml)
}

/// Concatenate `w:t` runs, one line per `w:p` paragraph.
fn extract_w_t_elements(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" if !out.is_empty() && !out.ends_with('\n') => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

struct MarkdownPatterns {
    fence: Regex,
    image: Regex,
    link: Regex,
    html_tag: Regex,
    heading: Regex,
    blockquote: Regex,
    list_marker: Regex,
    emphasis: Regex,
    inline_code: Regex,
    blank_runs: Regex,
}

fn markdown_patterns() -> &'static MarkdownPatterns {
    static PATTERNS: OnceLock<MarkdownPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |p: &str| Regex::new(p).expect("markdown pattern is valid");
        MarkdownPatterns {
            fence: re(r"(?m)^\s*(```|~~~).*$"),
            image: re(r"!\[([^\]]*)\]\([^)]*\)"),
            link: re(r"\[([^\]]+)\]\([^)]*\)"),
            html_tag: re(r"</?[A-Za-z][^>]*>"),
            heading: re(r"(?m)^\s{0,3}#{1,6}\s+"),
            blockquote: re(r"(?m)^\s*>\s?"),
            list_marker: re(r"(?m)^\s*(?:[-*+]|\d+[.)])\s+"),
            emphasis: re(r"(\*\*|__|\*|_|~~)([^*_~\n]+)(\*\*|__|\*|_|~~)"),
            inline_code: re(r"`([^`]*)`"),
            blank_runs: re(r"\n{3,}"),
        }
    })
}

/// Render-free Markdown to plain text: drops markup, keeps the words.
pub fn markdown_to_text(markdown: &str) -> String {
    let p = markdown_patterns();
    let text = p.fence.replace_all(markdown, "");
    let text = p.image.replace_all(&text, "$1");
    let text = p.link.replace_all(&text, "$1");
    let text = p.html_tag.replace_all(&text, "");
    let text = p.heading.replace_all(&text, "");
    let text = p.blockquote.replace_all(&text, "");
    let text = p.list_marker.replace_all(&text, "");
    let text = p.emphasis.replace_all(&text, "$2");
    let text = p.inline_code.replace_all(&text, "$1");
    let text = decode_entities(&text);
    p.blank_runs.replace_all(text.trim(), "\n\n").into_owned()
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
