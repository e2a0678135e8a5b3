//! Plain-text-with-light-markdown to PDF.
//!
//! Output uses the base-14 Helvetica fonts with `WinAnsiEncoding`, so text is
//! first normalized to characters that encoding can show.

use lopdf::{dictionary, Document, Object, Stream};

const PAGE_WIDTH: f32 = 612.0;
const PAGE_HEIGHT: f32 = 792.0;
const MARGIN: f32 = 50.0;
const BODY_SIZE: f32 = 10.0;
const BOLD_SIZE: f32 = 11.0;
const HEADING_SIZE: f32 = 13.0;
const BULLET_INDENT: f32 = 14.0;
/// Average Helvetica glyph width as a fraction of the font size.
const GLYPH_WIDTH: f32 = 0.5;
const LEADING: f32 = 1.4;

/// Longest file name component, in characters.
pub const MAX_NAME_PART: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("nothing to render")]
    Empty,

    #[error("pdf serialization failed: {0}")]
    Pdf(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Cv,
    CoverLetter,
}

impl DocumentKind {
    fn prefix(&self) -> &'static str {
        match self {
            DocumentKind::Cv => "CV",
            DocumentKind::CoverLetter => "CoverLetter",
        }
    }

    /// `CV_<company>_<title>.pdf` or `CoverLetter_<company>_<title>.pdf`.
    pub fn file_name(&self, company: &str, title: &str) -> String {
        format!(
            "{}_{}_{}.pdf",
            self.prefix(),
            sanitize_file_part(company),
            sanitize_file_part(title)
        )
    }
}

pub fn sanitize_file_part(part: &str) -> String {
    part.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ' ' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .take(MAX_NAME_PART)
        .collect()
}

/// Map typographic punctuation to plain equivalents and anything outside
/// Latin-1 to `?`.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{2032}' => out.push('\''),
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{2033}' => out.push('"'),
            '\u{2010}'..='\u{2015}' | '\u{2212}' => out.push('-'),
            '\u{2026}' => out.push_str("..."),
            '\u{00A0}' | '\u{2002}'..='\u{200A}' => out.push(' '),
            '\u{200B}' | '\u{FEFF}' => {}
            '\u{2022}' | '\u{25CF}' | '\u{25AA}' | '\u{2023}' => out.push('\u{2022}'),
            '\t' => out.push_str("    "),
            '\r' => {}
            c if (c as u32) < 0x100 => out.push(c),
            _ => out.push('?'),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Block {
    Heading(String),
    Bold(String),
    Bullet(String),
    Text(String),
    Blank,
}

fn classify(line: &str) -> Block {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Block::Blank;
    }
    if let Some(heading) = trimmed.strip_prefix("### ").or_else(|| trimmed.strip_prefix("## ")) {
        return Block::Heading(strip_emphasis(heading));
    }
    if trimmed.len() > 4 && trimmed.starts_with("**") && trimmed.ends_with("**") {
        return Block::Bold(strip_emphasis(trimmed));
    }
    for marker in ["* ", "- ", "\u{2022} "] {
        if let Some(rest) = trimmed.strip_prefix(marker) {
            return Block::Bullet(strip_emphasis(rest));
        }
    }
    Block::Text(strip_emphasis(trimmed))
}

fn strip_emphasis(text: &str) -> String {
    text.replace("**", "").trim().to_string()
}

/// Greedy word wrap to at most `max_chars` characters per line.
fn wrap(text: &str, max_chars: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let mut word = word;
        // Words longer than a line are hard-split.
        while word.chars().count() > max_chars {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            let split = word.char_indices().nth(max_chars).map_or(word.len(), |(i, _)| i);
            lines.push(word[..split].to_string());
            word = &word[split..];
        }
        if word.is_empty() {
            continue;
        }
        let needed = if current.is_empty() { 0 } else { 1 } + word.chars().count();
        if current.chars().count() + needed > max_chars {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

fn chars_per_line(size: f32, width: f32) -> usize {
    ((width / (size * GLYPH_WIDTH)).floor() as usize).max(1)
}

/// WinAnsi literal string body; `normalize_text` guarantees Latin-1 input.
fn encode_literal(text: &str, out: &mut Vec<u8>) {
    for c in text.chars() {
        match c {
            '(' | ')' | '\\' => {
                out.push(b'\\');
                out.push(c as u8);
            }
            '\u{2022}' => out.push(0x95),
            c if (c as u32) < 0x100 => out.push(c as u8),
            _ => out.push(b'?'),
        }
    }
}

/// Accumulates positioned text runs into page content streams.
struct Layout {
    pages: Vec<Vec<u8>>,
    current: Vec<u8>,
    y: f32,
}

impl Layout {
    fn new() -> Self {
        Self {
            pages: Vec::new(),
            current: Vec::new(),
            y: PAGE_HEIGHT - MARGIN,
        }
    }

    fn advance(&mut self, height: f32) {
        if self.y - height < MARGIN {
            self.pages.push(std::mem::take(&mut self.current));
            self.y = PAGE_HEIGHT - MARGIN;
        }
        self.y -= height;
    }

    fn line(&mut self, font: &str, size: f32, x: f32, text: &str) {
        self.advance(size * LEADING);
        self.draw(font, size, x, text);
    }

    /// Show `text` on the current baseline without moving down.
    fn draw(&mut self, font: &str, size: f32, x: f32, text: &str) {
        self.current
            .extend_from_slice(format!("BT /{} {} Tf {:.2} {:.2} Td (", font, size, x, self.y).as_bytes());
        encode_literal(text, &mut self.current);
        self.current.extend_from_slice(b") Tj ET\n");
    }

    fn gap(&mut self, size: f32) {
        if !self.current.is_empty() {
            self.advance(size * LEADING * 0.6);
        }
    }

    fn push(&mut self, block: &Block) {
        let width = PAGE_WIDTH - 2.0 * MARGIN;
        match block {
            Block::Blank => self.gap(BODY_SIZE),
            Block::Heading(text) => {
                self.gap(HEADING_SIZE);
                for line in wrap(text, chars_per_line(HEADING_SIZE, width)) {
                    self.line("F2", HEADING_SIZE, MARGIN, &line);
                }
            }
            Block::Bold(text) => {
                for line in wrap(text, chars_per_line(BOLD_SIZE, width)) {
                    self.line("F2", BOLD_SIZE, MARGIN, &line);
                }
            }
            Block::Bullet(text) => {
                let lines = wrap(text, chars_per_line(BODY_SIZE, width - BULLET_INDENT));
                for (i, line) in lines.iter().enumerate() {
                    self.advance(BODY_SIZE * LEADING);
                    if i == 0 {
                        self.draw("F1", BODY_SIZE, MARGIN, "\u{2022}");
                    }
                    self.draw("F1", BODY_SIZE, MARGIN + BULLET_INDENT, line);
                }
            }
            Block::Text(text) => {
                for line in wrap(text, chars_per_line(BODY_SIZE, width)) {
                    self.line("F1", BODY_SIZE, MARGIN, &line);
                }
            }
        }
    }

    fn finish(mut self) -> Vec<Vec<u8>> {
        if !self.current.is_empty() {
            self.pages.push(self.current);
        }
        self.pages
    }
}

/// Render `text` to PDF bytes, one or more US Letter pages.
pub fn render_pdf(text: &str) -> Result<Vec<u8>, RenderError> {
    let normalized = normalize_text(text);
    let mut layout = Layout::new();
    for line in normalized.lines() {
        layout.push(&classify(line));
    }
    let pages = layout.finish();
    if pages.is_empty() {
        return Err(RenderError::Empty);
    }

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let regular_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let bold_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica-Bold",
        "Encoding" => "WinAnsiEncoding",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => regular_id,
            "F2" => bold_id,
        },
    });

    let mut kids = Vec::with_capacity(pages.len());
    for content in pages {
        let content_id = doc.add_object(Object::Stream(Stream::new(dictionary! {}, content)));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
            "Resources" => resources_id,
            "Contents" => content_id,
        });
        kids.push(Object::from(page_id));
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer).map_err(|e| RenderError::Pdf(e.to_string()))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn file_names_replace_unsafe_characters() {
        assert_eq!(
            DocumentKind::Cv.file_name("Acme/Corp", "Senior Engineer: Rust?"),
            "CV_Acme_Corp_Senior_Engineer__Rust_.pdf"
        );
        assert_eq!(
            DocumentKind::CoverLetter.file_name("Acme", "Dev"),
            "CoverLetter_Acme_Dev.pdf"
        );
    }

    #[test]
    fn markdown_lines_are_classified() {
        assert_eq!(classify("### Experience"), Block::Heading("Experience".into()));
        assert_eq!(classify("**Staff Engineer**"), Block::Bold("Staff Engineer".into()));
        assert_eq!(classify("* Built **things**"), Block::Bullet("Built things".into()));
        assert_eq!(classify("\u{2022} Shipped"), Block::Bullet("Shipped".into()));
        assert_eq!(classify("   "), Block::Blank);
        assert_eq!(classify("plain"), Block::Text("plain".into()));
    }

    #[test]
    fn bullet_at_page_end_moves_with_its_text() {
        let mut layout = Layout::new();
        while layout.y - BODY_SIZE * LEADING >= MARGIN {
            layout.push(&Block::Text("filler".into()));
        }
        layout.push(&Block::Bullet("Led the migration".into()));

        let pages = layout.finish();
        assert_eq!(pages.len(), 2);
        assert!(!pages[0].contains(&0x95));
        let second = String::from_utf8_lossy(&pages[1]);
        assert!(pages[1].contains(&0x95));
        assert!(second.contains("(Led the migration)"));
        // bullet glyph and first line share one baseline
        let top = format!("{:.2} Td", PAGE_HEIGHT - MARGIN - BODY_SIZE * LEADING);
        assert_eq!(second.matches(&top).count(), 2);
    }

    #[test]
    fn typographic_characters_are_normalized() {
        assert_eq!(
            normalize_text("\u{201C}it\u{2019}s\u{201D} \u{2014} done\u{2026}"),
            "\"it's\" - done..."
        );
        assert_eq!(normalize_text("caf\u{00E9} \u{4E16}"), "caf\u{00E9} ?");
    }

    #[test]
    fn wrap_respects_width_and_splits_long_words() {
        let lines = wrap("aaaa bbbb cccc", 9);
        assert_eq!(lines, vec!["aaaa bbbb", "cccc"]);
        let lines = wrap("abcdefghijkl", 5);
        assert_eq!(lines, vec!["abcde", "fghij", "kl"]);
    }

    #[test]
    fn literals_escape_delimiters() {
        let mut out = Vec::new();
        encode_literal("a(b)\\c \u{2022}", &mut out);
        assert_eq!(out, b"a\\(b\\)\\\\c \x95".to_vec());
    }

    #[test]
    fn long_text_paginates() {
        let text: String = (0..200).map(|i| format!("Line number {}\n", i)).collect();
        let bytes = render_pdf(&text).unwrap();
        assert!(bytes.starts_with(b"%PDF-1.5"));
        let doc = Document::load_mem(&bytes).unwrap();
        assert!(doc.get_pages().len() >= 3);
    }

    #[test]
    fn short_text_is_one_page() {
        let bytes = render_pdf("### Summary\nRust engineer.\n* One\n* Two").unwrap();
        let doc = Document::load_mem(&bytes).unwrap();
        assert_eq!(doc.get_pages().len(), 1);
    }

    #[test]
    fn blank_text_is_rejected() {
        assert!(matches!(render_pdf("\n  \n"), Err(RenderError::Empty)));
    }

    proptest! {
        #[test]
        fn sanitized_parts_are_bounded_and_safe(part in ".{0,120}") {
            let clean = sanitize_file_part(&part);
            prop_assert!(clean.chars().count() <= MAX_NAME_PART);
            prop_assert!(!clean.contains(['/', '\\', ':', '*', '?', '"', '<', '>', '|', ' ']));
        }
    }
}
