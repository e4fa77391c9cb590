use std::path::Path;

use anyhow::{Context, Result};

/// External PDF text extraction contract.
pub trait PdfExtractor: Send {
    fn load(&self, path: &Path) -> Result<Box<dyn PdfPages>>;
}

/// An opened PDF document: per-page text plus the information dictionary
/// fields the index stores alongside each chunk.
pub trait PdfPages {
    fn page_count(&self) -> usize;

    fn page_text(&self, page_index: usize) -> Result<String>;

    fn title(&self) -> String;
    fn author(&self) -> String;
    fn subject(&self) -> String;
    fn keywords(&self) -> String;
}

/// Default extractor backed by the `pdf-extract` crate.
///
/// The crate exposes the text layer per page but not the information
/// dictionary, so the metadata accessors return empty strings.
pub struct PdfExtractBackend;

impl PdfExtractor for PdfExtractBackend {
    fn load(&self, path: &Path) -> Result<Box<dyn PdfPages>> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read pdf {}", path.display()))?;
        let pages = pdf_extract::extract_text_from_mem_by_pages(&bytes)
            .with_context(|| format!("failed to extract text from pdf {}", path.display()))?;
        log::debug!("loaded pdf {} with {} pages", path.display(), pages.len());
        Ok(Box::new(ExtractedPdf { pages }))
    }
}

struct ExtractedPdf {
    pages: Vec<String>,
}

impl PdfPages for ExtractedPdf {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page_text(&self, page_index: usize) -> Result<String> {
        self.pages
            .get(page_index)
            .cloned()
            .with_context(|| format!("pdf has no page {page_index}"))
    }

    fn title(&self) -> String {
        String::new()
    }

    fn author(&self) -> String {
        String::new()
    }

    fn subject(&self) -> String {
        String::new()
    }

    fn keywords(&self) -> String {
        String::new()
    }
}
