//! Document merging: append a rendered page artefact to the destination PDF.
//!
//! The destination is rewritten wholesale on every merge. Both documents are
//! loaded with lopdf, their objects renumbered into one id space, and a fresh
//! flat page tree is built with the destination's pages first. Page
//! attributes that PDF lets a page inherit from its ancestors (`Resources`,
//! `MediaBox`, `CropBox`, `Rotate`) are copied onto each page before the old
//! tree is discarded, otherwise pages would lose their fonts and size.
//!
//! The combined document is written to a temp file next to the destination
//! and renamed over it, so a failure never leaves a half-written file. The
//! page artefact is removed afterwards whatever the outcome.
//!
//! All of this is blocking I/O; the worker calls [`PageMerger::merge`] from
//! `spawn_blocking`.

use crate::error::MergeError;
use lopdf::{dictionary, Document, Object, ObjectId};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

/// Guard against cyclic `Parent` chains in damaged files.
const MAX_TREE_DEPTH: usize = 32;

/// What a successful merge did to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The destination did not exist; the page artefact became it.
    Created { pages: usize },
    /// Pages were appended to an existing destination.
    Appended { added: usize, total: usize },
}

impl MergeOutcome {
    pub fn pages_added(&self) -> usize {
        match self {
            MergeOutcome::Created { pages } => *pages,
            MergeOutcome::Appended { added, .. } => *added,
        }
    }

    pub fn total_pages(&self) -> usize {
        match self {
            MergeOutcome::Created { pages } => *pages,
            MergeOutcome::Appended { total, .. } => *total,
        }
    }
}

/// Appends a page artefact to a destination document.
///
/// Implementations must remove `new_page` before returning, on success and
/// on failure.
pub trait PageMerger: Send + Sync {
    fn merge(&self, destination: &Path, new_page: &Path) -> Result<MergeOutcome, MergeError>;
}

/// lopdf-backed merger.
#[derive(Debug, Clone, Copy)]
pub struct PdfMerger {
    verify: bool,
}

impl Default for PdfMerger {
    fn default() -> Self {
        Self { verify: true }
    }
}

impl PdfMerger {
    /// `verify` re-reads the destination after each write and checks its
    /// page count.
    pub fn new(verify: bool) -> Self {
        Self { verify }
    }
}

impl PageMerger for PdfMerger {
    fn merge(&self, destination: &Path, new_page: &Path) -> Result<MergeOutcome, MergeError> {
        let result = if destination.exists() {
            self.append(destination, new_page)
        } else {
            self.create(destination, new_page)
        };
        remove_quietly(new_page);
        result
    }
}

impl PdfMerger {
    fn create(&self, destination: &Path, new_page: &Path) -> Result<MergeOutcome, MergeError> {
        let pages = load(new_page)?.get_pages().len();
        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| MergeError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        move_file(new_page, destination)?;
        debug!("Created {} with {} page(s)", destination.display(), pages);
        if self.verify {
            verify_page_count(destination, pages)?;
        }
        Ok(MergeOutcome::Created { pages })
    }

    fn append(&self, destination: &Path, new_page: &Path) -> Result<MergeOutcome, MergeError> {
        let base = load(destination)?;
        let extra = load(new_page)?;
        let existing = base.get_pages().len();
        let added = extra.get_pages().len();

        let mut merged = combine(vec![base, extra]);
        write_atomic(&mut merged, destination)?;

        let total = existing + added;
        debug!(
            "Appended {} page(s) to {} ({} total)",
            added,
            destination.display(),
            total
        );
        if self.verify {
            verify_page_count(destination, total)?;
        }
        Ok(MergeOutcome::Appended { added, total })
    }
}

/// Number of pages in a PDF file.
pub fn page_count(path: &Path) -> Result<usize, MergeError> {
    Ok(load(path)?.get_pages().len())
}

fn load(path: &Path) -> Result<Document, MergeError> {
    Document::load(path).map_err(|e| MergeError::CorruptPdf {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

fn verify_page_count(path: &Path, expected: usize) -> Result<(), MergeError> {
    let actual = page_count(path)?;
    if actual != expected {
        return Err(MergeError::VerificationFailed {
            path: path.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(())
}

// ── Page tree rebuild ────────────────────────────────────────────────────────

/// Concatenate the pages of `docs`, in order, under one flat page tree.
fn combine(docs: Vec<Document>) -> Document {
    let mut max_id = 1;
    let mut page_ids: Vec<ObjectId> = Vec::new();
    let mut objects: BTreeMap<ObjectId, Object> = BTreeMap::new();

    for mut doc in docs {
        doc.renumber_objects_with(max_id);
        max_id = doc.max_id + 1;
        materialise_inherited(&mut doc);
        page_ids.extend(doc.get_pages().into_values());
        objects.extend(doc.objects);
    }

    let pages_id: ObjectId = (max_id, 0);
    let catalog_id: ObjectId = (max_id + 1, 0);
    let mut out = Document::with_version("1.5");

    for (id, mut object) in objects {
        let type_name = object.type_name().ok();
        let is_tree_node = matches!(
            type_name,
            Some(b"Catalog" | b"Pages" | b"Outlines" | b"Outline")
        );
        let is_page = matches!(type_name, Some(b"Page"));
        if is_tree_node || (is_page && !page_ids.contains(&id)) {
            continue;
        }
        if is_page {
            if let Ok(dict) = object.as_dict_mut() {
                dict.set("Parent", pages_id);
            }
        }
        out.objects.insert(id, object);
    }

    let kids: Vec<Object> = page_ids.iter().map(|id| Object::Reference(*id)).collect();
    out.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => page_ids.len() as i64,
        }),
    );
    out.objects.insert(
        catalog_id,
        Object::Dictionary(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        }),
    );
    out.trailer.set("Root", catalog_id);
    out.max_id = catalog_id.0;
    out.compress();
    out
}

/// Copy inheritable attributes from ancestor nodes onto each page.
fn materialise_inherited(doc: &mut Document) {
    let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
    for page_id in page_ids {
        let inherited: Vec<(&[u8], Object)> = match doc.get_dictionary(page_id) {
            Ok(page) => INHERITABLE
                .iter()
                .filter(|key| !page.has(key))
                .filter_map(|key| inherited_value(doc, page, key).map(|v| (*key, v)))
                .collect(),
            Err(_) => continue,
        };
        if inherited.is_empty() {
            continue;
        }
        if let Ok(page) = doc.get_object_mut(page_id).and_then(Object::as_dict_mut) {
            for (key, value) in inherited {
                page.set(key.to_vec(), value);
            }
        }
    }
}

fn inherited_value(doc: &Document, page: &lopdf::Dictionary, key: &[u8]) -> Option<Object> {
    let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();
    for _ in 0..MAX_TREE_DEPTH {
        let node = doc.get_dictionary(parent?).ok()?;
        if let Ok(value) = node.get(key) {
            return Some(value.clone());
        }
        parent = node.get(b"Parent").and_then(Object::as_reference).ok();
    }
    None
}

// ── File handling ────────────────────────────────────────────────────────────

fn write_atomic(doc: &mut Document, destination: &Path) -> Result<(), MergeError> {
    let dir = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let io_err = |e: std::io::Error| MergeError::Io {
        path: destination.to_path_buf(),
        source: e,
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    doc.save_to(&mut tmp)
        .map_err(|e| MergeError::Internal(format!("serialising merged document: {e}")))?;
    tmp.persist(destination).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// Rename, falling back to copy + remove across filesystems.
fn move_file(from: &Path, to: &Path) -> Result<(), MergeError> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to).map_err(|e| MergeError::Io {
        path: to.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove page artefact {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::content::{Content, Operation};
    use lopdf::Stream;
    use std::path::PathBuf;

    /// Write a PDF whose pages carry a `Label` key; `Resources` and
    /// `MediaBox` live on the page tree root so they must be inherited.
    fn write_pdf(path: &Path, labels: &[&str]) {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let mut kids: Vec<Object> = Vec::new();
        for label in labels {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 24.into()]),
                    Operation::new("Td", vec![72.into(), 720.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*label)]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Label" => Object::string_literal(*label),
            });
            kids.push(page_id.into());
        }
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => labels.len() as i64,
                "Resources" => resources_id,
                "MediaBox" => vec![Object::Integer(0), Object::Integer(0), Object::Integer(595), Object::Integer(842)],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.save(path).unwrap();
    }

    fn page_labels(path: &Path) -> Vec<String> {
        let doc = Document::load(path).unwrap();
        doc.get_pages()
            .values()
            .map(|id| {
                let page = doc.get_dictionary(*id).unwrap();
                String::from_utf8_lossy(page.get(b"Label").unwrap().as_str().unwrap()).into_owned()
            })
            .collect()
    }

    fn scratch() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("archive.pdf");
        (dir, dest)
    }

    #[test]
    fn first_merge_moves_the_page() {
        let (dir, dest) = scratch();
        let page = dir.path().join("page.pdf");
        write_pdf(&page, &["P1", "P1b"]);

        let outcome = PdfMerger::default().merge(&dest, &page).unwrap();
        assert_eq!(outcome, MergeOutcome::Created { pages: 2 });
        assert_eq!(page_count(&dest).unwrap(), 2);
        assert!(!page.exists());
    }

    #[test]
    fn merges_keep_order() {
        let (dir, dest) = scratch();
        let merger = PdfMerger::default();
        for label in ["P1", "P2", "P3"] {
            let page = dir.path().join(format!("{label}.pdf"));
            write_pdf(&page, &[label]);
            merger.merge(&dest, &page).unwrap();
            assert!(!page.exists());
        }
        assert_eq!(page_labels(&dest), vec!["P1", "P2", "P3"]);
    }

    #[test]
    fn append_reports_counts_and_keeps_inherited_attributes() {
        let (dir, dest) = scratch();
        write_pdf(&dest, &["A", "B"]);
        let page = dir.path().join("new.pdf");
        write_pdf(&page, &["C"]);

        let outcome = PdfMerger::new(true).merge(&dest, &page).unwrap();
        assert_eq!(outcome, MergeOutcome::Appended { added: 1, total: 3 });
        assert_eq!(outcome.pages_added(), 1);

        let doc = Document::load(&dest).unwrap();
        for id in doc.get_pages().values() {
            let page = doc.get_dictionary(*id).unwrap();
            assert!(page.has(b"Resources"));
            assert!(page.has(b"MediaBox"));
        }
    }

    #[test]
    fn corrupt_page_leaves_destination_and_removes_artefact() {
        let (dir, dest) = scratch();
        write_pdf(&dest, &["A"]);
        let before = std::fs::read(&dest).unwrap();
        let page = dir.path().join("broken.pdf");
        std::fs::write(&page, b"%PDF-1.5 this is not really a pdf").unwrap();

        let err = PdfMerger::default().merge(&dest, &page).unwrap_err();
        assert!(matches!(err, MergeError::CorruptPdf { .. }));
        assert!(!page.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), before);
    }

    #[test]
    fn corrupt_first_page_does_not_become_destination() {
        let (dir, dest) = scratch();
        let page = dir.path().join("broken.pdf");
        std::fs::write(&page, b"garbage").unwrap();
        assert!(PdfMerger::default().merge(&dest, &page).is_err());
        assert!(!dest.exists());
        assert!(!page.exists());
    }

    #[test]
    fn destination_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested/out/archive.pdf");
        let page = dir.path().join("p.pdf");
        write_pdf(&page, &["only"]);
        PdfMerger::new(false).merge(&dest, &page).unwrap();
        assert_eq!(page_labels(&dest), vec!["only"]);
    }
}
