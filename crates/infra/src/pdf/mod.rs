//! PDF terminal sink: renders generated CVs and cover letters to files.

pub mod render;
pub mod sink;

pub use render::{render_pdf, sanitize_file_part, DocumentKind, RenderError};
pub use sink::{CoverLetterPdfHandler, CvPdfHandler, PdfSink};
