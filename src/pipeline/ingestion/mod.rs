// Pipeline ingestion: input discovery and document text extraction

pub mod document;

use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{LabError, Result};

pub use document::{DocumentKind, Pages};

/// One input file: its bytes fingerprinted and its pages ready to pull
#[derive(Debug)]
pub struct Document {
    pub path: PathBuf,
    pub source_file: String,
    /// sha256 of the file contents, hex encoded
    pub fingerprint: String,
    pub pages: Pages,
}

pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn source_file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Read and decode one document. Fails with `DocumentRead` when the file
/// cannot be opened, has an unsupported extension or cannot be decoded.
pub fn open_document(path: &Path) -> Result<Document> {
    let kind = DocumentKind::from_path(path).ok_or_else(|| LabError::DocumentRead {
        path: path.to_path_buf(),
        reason: "unsupported file extension".to_string(),
    })?;

    let bytes = fs::read(path).map_err(|e| LabError::DocumentRead {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let fingerprint = fingerprint(&bytes);
    let pages = Pages::decode(kind, &bytes, path)?;
    debug!(path = %path.display(), pages = pages.size_hint().0, "Decoded document");

    Ok(Document {
        path: path.to_path_buf(),
        source_file: source_file_name(path),
        fingerprint,
        pages,
    })
}

/// Supported documents directly under `dir`, sorted by file name.
///
/// A missing directory, or one without any supported document, is an
/// `InputUnavailable` error.
pub fn discover_documents(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(LabError::InputUnavailable(format!(
            "'{}' is not a readable directory",
            dir.display()
        )));
    }

    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && DocumentKind::from_path(&path).is_some() {
            found.push(path);
        }
    }

    if found.is_empty() {
        return Err(LabError::InputUnavailable(format!(
            "no .pdf or .txt documents in '{}'",
            dir.display()
        )));
    }

    found.sort_by_key(|p| source_file_name(p));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn discovery_is_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        for name in ["b.txt", "a.PDF", "notes.md", "c.txt"] {
            fs::write(dir.path().join(name), "x").unwrap();
        }
        let found: Vec<String> = discover_documents(dir.path())
            .unwrap()
            .iter()
            .map(|p| source_file_name(p))
            .collect();
        assert_eq!(found, vec!["a.PDF", "b.txt", "c.txt"]);
    }

    #[test]
    fn empty_directory_is_input_unavailable() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("readme.md"), "x").unwrap();
        let err = discover_documents(dir.path()).unwrap_err();
        assert!(matches!(err, LabError::InputUnavailable(_)));
    }

    #[test]
    fn missing_directory_is_input_unavailable() {
        let err = discover_documents(Path::new("no/such/dir")).unwrap_err();
        assert!(matches!(err, LabError::InputUnavailable(_)));
    }

    #[test]
    fn text_document_opens_with_fingerprint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.txt");
        fs::write(&path, "GLICOSE   95").unwrap();

        let doc = open_document(&path).unwrap();
        assert_eq!(doc.source_file, "report.txt");
        assert_eq!(doc.fingerprint, fingerprint(b"GLICOSE   95"));
        assert_eq!(doc.fingerprint.len(), 64);
        assert_eq!(doc.pages.into_text(), "GLICOSE 95");
    }

    #[test]
    fn unreadable_document_is_read_error() {
        let err = open_document(Path::new("missing/report.pdf")).unwrap_err();
        assert!(matches!(err, LabError::DocumentRead { .. }));
    }
}
