//! Archive containers built from scraped chapter parts.

use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

/// One file inside an archive (usually a page image).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePart {
    pub name: String,
    pub data: Vec<u8>,
}

/// Descriptive fields written into the archive.
#[derive(Debug, Clone, Default)]
pub struct ArchiveMetadata {
    pub series: String,
    pub number: u32,
    pub source_url: String,
}

/// A container format the pipeline can build and the reader can open.
pub trait ArchiveFormat: Send + Sync {
    fn extension(&self) -> &'static str;

    /// # Errors
    ///
    /// Fails if the container cannot be written.
    fn build(&self, parts: &[ArchivePart], metadata: &ArchiveMetadata) -> Result<Vec<u8>>;

    /// Content parts, in archive order, without format bookkeeping files.
    ///
    /// # Errors
    ///
    /// Fails if `bytes` is not a valid container.
    fn extract(&self, bytes: &[u8]) -> Result<Vec<ArchivePart>>;
}

/// Build on the blocking pool; zipping a chapter of images is CPU-bound.
///
/// # Errors
///
/// Returns the format's error, or an error if the blocking task panicked.
pub async fn build_archive(
    format: Arc<dyn ArchiveFormat>,
    parts: Vec<ArchivePart>,
    metadata: ArchiveMetadata,
) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || format.build(&parts, &metadata))
        .await
        .context("Archive build task failed")?
}

const COMIC_INFO: &str = "ComicInfo.xml";

/// Comic book zip: stored (uncompressed) page images plus `ComicInfo.xml`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CbzFormat;

impl ArchiveFormat for CbzFormat {
    fn extension(&self) -> &'static str {
        "cbz"
    }

    fn build(&self, parts: &[ArchivePart], metadata: &ArchiveMetadata) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        let mut zip = ZipWriter::new(Cursor::new(&mut buffer));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);

        for part in parts {
            zip.start_file(part.name.as_str(), options)
                .with_context(|| format!("Failed to add {}", part.name))?;
            zip.write_all(&part.data)?;
        }

        zip.start_file(COMIC_INFO, options)?;
        zip.write_all(comic_info(metadata, parts.len()).as_bytes())?;
        zip.finish().context("Failed to finish archive")?;
        Ok(buffer)
    }

    fn extract(&self, bytes: &[u8]) -> Result<Vec<ArchivePart>> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).context("Not a zip archive")?;
        let mut parts = Vec::with_capacity(archive.len());

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            if entry.is_dir() || entry.name() == COMIC_INFO {
                continue;
            }
            let mut data = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
            entry
                .read_to_end(&mut data)
                .with_context(|| format!("Failed to read {}", entry.name()))?;
            parts.push(ArchivePart {
                name: entry.name().to_string(),
                data,
            });
        }
        Ok(parts)
    }
}

fn comic_info(metadata: &ArchiveMetadata, pages: usize) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<ComicInfo>\n  <Series>{}</Series>\n  <Number>{}</Number>\n  <PageCount>{pages}</PageCount>\n  <Web>{}</Web>\n</ComicInfo>\n",
        xml_escape(&metadata.series),
        metadata.number,
        xml_escape(&metadata.source_url),
    )
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Sanitize a name for use as a file or object key.
///
/// Problematic characters become underscores, runs of underscores collapse,
/// and the stem is capped at 200 bytes. The extension is kept.
#[must_use]
pub fn sanitize_filename(filename: &str) -> String {
    let (name, ext) = match filename.rfind('.') {
        Some(dot) if dot > 0 => filename.split_at(dot),
        _ => (filename, ""),
    };

    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '(' | ')' | '[' | ']' | '-' | '.' => c,
            c if c.is_alphanumeric() => c,
            _ => '_',
        })
        .collect();
    let cleaned = cleaned
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_");

    const MAX_STEM_BYTES: usize = 200;
    let mut end = cleaned.len().min(MAX_STEM_BYTES);
    while !cleaned.is_char_boundary(end) {
        end -= 1;
    }
    let stem = if cleaned.is_empty() { "untitled" } else { &cleaned[..end] };

    format!("{stem}{ext}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cbz_keeps_page_order_and_hides_comic_info() {
        let parts = vec![
            ArchivePart {
                name: "001.jpg".to_string(),
                data: vec![1, 2, 3],
            },
            ArchivePart {
                name: "002.png".to_string(),
                data: vec![4],
            },
        ];
        let metadata = ArchiveMetadata {
            series: "Tom & Jerry".to_string(),
            number: 4,
            source_url: "https://example.com/s/4".to_string(),
        };

        let bytes = CbzFormat.build(&parts, &metadata).unwrap();
        assert_eq!(CbzFormat.extract(&bytes).unwrap(), parts);
    }

    #[test]
    fn test_extract_rejects_garbage() {
        assert!(CbzFormat.extract(b"not a zip").is_err());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("My Series: Part 2?.cbz"), "My_Series_Part_2.cbz");
        assert_eq!(sanitize_filename("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_filename("???"), "untitled");
        assert_eq!(sanitize_filename(".hidden"), ".hidden");
    }

    #[test]
    fn test_sanitize_filename_truncates_on_char_boundary() {
        let long = "é".repeat(150);
        let out = sanitize_filename(&format!("{long}.jpg"));
        assert!(out.ends_with(".jpg"));
        assert!(out.len() <= 204);
    }
}
