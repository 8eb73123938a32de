//! Supplemental image mappings.
//!
//! Some exports lose the images a model generated. The operator can pair a
//! screenshot with the text of the response it belongs to; those pairs are
//! saved as timestamped `mapping_YYYYMMDD_HHMMSS.json` artefacts and matched
//! against responses at build time ([`super::matcher`]).
//!
//! Three entry shapes exist on disk and are normalised on load:
//!
//! ```json
//! {"text_snippet": "…", "images": [{"path": "a.png", "desc": "chart"}]}
//! {"text_snippet": "…", "image_paths": ["a.png", "b.png"]}
//! {"text_snippet": "…", "image_path": "a.png"}
//! ```

use super::encode::extension_for;
use crate::error::ConfigError;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Conventional directory name for mapping artefacts.
pub const MAPPINGS_DIR: &str = "mappings";

/// Conventional directory name for cached supplemental images.
pub const SUPPLEMENTAL_IMAGES_DIR: &str = "supplemental_images";

/// One image associated with a snippet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedImage {
    pub path: PathBuf,
    pub description: Option<String>,
}

impl MappedImage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        let description = description.into();
        self.description = (!description.trim().is_empty()).then_some(description);
        self
    }
}

/// A response snippet and the images that belong to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    pub snippet: String,
    pub images: Vec<MappedImage>,
}

/// Immutable snapshot of the latest mapping artefact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupplementalMapping {
    entries: Vec<MappingEntry>,
    source: Option<PathBuf>,
}

// ── On-disk schema ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default)]
    text_snippet: String,
    #[serde(default)]
    images: Vec<RawImage>,
    #[serde(default)]
    image_paths: Vec<String>,
    #[serde(default)]
    image_path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawImage {
    Described {
        path: String,
        #[serde(default)]
        desc: Option<String>,
    },
    Bare(String),
}

#[derive(Debug, Serialize)]
struct StoredEntry<'a> {
    text_snippet: &'a str,
    images: Vec<StoredImage<'a>>,
}

#[derive(Debug, Serialize)]
struct StoredImage<'a> {
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    desc: Option<&'a str>,
}

impl RawEntry {
    fn normalise(self, base: &Path) -> MappingEntry {
        let resolve = |p: &str| {
            let path = PathBuf::from(p);
            if path.is_absolute() {
                path
            } else {
                base.join(path)
            }
        };
        let mut images: Vec<MappedImage> = self
            .images
            .into_iter()
            .map(|img| match img {
                RawImage::Described { path, desc } => MappedImage {
                    path: resolve(&path),
                    description: desc.filter(|d| !d.trim().is_empty()),
                },
                RawImage::Bare(path) => MappedImage::new(resolve(&path)),
            })
            .collect();
        images.extend(self.image_paths.iter().map(|p| MappedImage::new(resolve(p))));
        if let Some(p) = &self.image_path {
            images.push(MappedImage::new(resolve(p)));
        }
        MappingEntry {
            snippet: self.text_snippet.trim().to_string(),
            images,
        }
    }
}

impl SupplementalMapping {
    pub fn from_entries(entries: Vec<MappingEntry>) -> Self {
        Self {
            entries,
            source: None,
        }
    }

    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// File the snapshot was read from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Load the newest `*.json` artefact in `dir` (greatest file name).
    ///
    /// A missing directory or one without artefacts yields an empty mapping.
    /// Relative image paths resolve against the parent of `dir`.
    pub fn load_latest(dir: &Path) -> Result<Self, ConfigError> {
        match latest_mapping_file(dir)? {
            Some(path) => Self::load_file(&path, dir.parent().unwrap_or(Path::new(""))),
            None => {
                debug!("No mapping artefacts in {}", dir.display());
                Ok(Self::default())
            }
        }
    }

    /// Load one artefact, resolving relative image paths against `base`.
    pub fn load_file(path: &Path, base: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let entries: Vec<RawEntry> = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        let entries: Vec<MappingEntry> = entries.into_iter().map(|e| e.normalise(base)).collect();
        debug!("Loaded {} mapping entries from {}", entries.len(), path.display());
        Ok(Self {
            entries,
            source: Some(path.to_path_buf()),
        })
    }
}

fn latest_mapping_file(dir: &Path) -> Result<Option<PathBuf>, ConfigError> {
    let read_dir = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ConfigError::Read {
                path: dir.to_path_buf(),
                source: e,
            })
        }
    };
    let latest = read_dir
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .max_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(latest)
}

// ── Writing ──────────────────────────────────────────────────────────────────

/// One operator row: an optional image plus optional response text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingRow {
    pub image: Option<PathBuf>,
    pub text: Option<String>,
    pub description: Option<String>,
}

/// Groups operator rows and writes mapping artefacts.
#[derive(Debug, Clone)]
pub struct MappingWriter {
    dir: PathBuf,
}

impl MappingWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Group rows into entries.
    ///
    /// Rows without an image are ignored. A row with an image and text starts
    /// a new entry; a row with only an image joins the entry above it, or is
    /// dropped when there is none.
    pub fn group(rows: &[MappingRow]) -> Vec<MappingEntry> {
        let mut entries: Vec<MappingEntry> = Vec::new();
        for row in rows {
            let Some(image) = &row.image else { continue };
            let mut mapped = MappedImage::new(image.clone());
            if let Some(desc) = &row.description {
                mapped = mapped.with_description(desc.clone());
            }
            let text = row.text.as_deref().map(str::trim).unwrap_or("");
            if !text.is_empty() {
                entries.push(MappingEntry {
                    snippet: text.to_string(),
                    images: vec![mapped],
                });
            } else if let Some(current) = entries.last_mut() {
                current.images.push(mapped);
            }
        }
        entries
    }

    /// Group `rows` and write them as a new artefact.
    pub fn write(&self, rows: &[MappingRow]) -> Result<PathBuf, ConfigError> {
        self.write_entries(&Self::group(rows))
    }

    /// Write entries to `mapping_<local timestamp>.json` and return its path.
    pub fn write_entries(&self, entries: &[MappingEntry]) -> Result<PathBuf, ConfigError> {
        if entries.is_empty() {
            return Err(ConfigError::Invalid(
                "a mapping needs at least one image with its response text".into(),
            ));
        }
        std::fs::create_dir_all(&self.dir).map_err(|e| ConfigError::Write {
            path: self.dir.clone(),
            source: e,
        })?;

        let stored: Vec<StoredEntry<'_>> = entries
            .iter()
            .map(|e| StoredEntry {
                text_snippet: &e.snippet,
                images: e
                    .images
                    .iter()
                    .map(|img| StoredImage {
                        path: img.path.display().to_string(),
                        desc: img.description.as_deref(),
                    })
                    .collect(),
            })
            .collect();
        let json = serde_json::to_string_pretty(&stored)
            .map_err(|e| ConfigError::Invalid(format!("cannot serialise mapping: {e}")))?;

        let path = self.next_path();
        write_atomic(&self.dir, &path, json.as_bytes())?;
        info!("Wrote {} mapping entries to {}", entries.len(), path.display());
        Ok(path)
    }

    /// A fresh artefact name; a same-second collision gets a zero-padded
    /// suffix so names keep sorting in write order.
    fn next_path(&self) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut path = self.dir.join(format!("mapping_{stamp}.json"));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("mapping_{stamp}_{n:03}.json"));
            n += 1;
        }
        path
    }
}

/// Cache raw image bytes as `cached_img_<timestamp>.<ext>` under `dir`.
pub fn store_supplemental_image(dir: &Path, bytes: &[u8]) -> Result<PathBuf, ConfigError> {
    std::fs::create_dir_all(dir).map_err(|e| ConfigError::Write {
        path: dir.to_path_buf(),
        source: e,
    })?;
    let stamp = Local::now().format("%Y%m%d_%H%M%S_%6f");
    let ext = extension_for(bytes);
    let mut path = dir.join(format!("cached_img_{stamp}.{ext}"));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("cached_img_{stamp}_{n:03}.{ext}"));
        n += 1;
    }
    write_atomic(dir, &path, bytes)?;
    debug!("Cached {} image bytes at {}", bytes.len(), path.display());
    Ok(path)
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), ConfigError> {
    let write_err = |e: std::io::Error| ConfigError::Write {
        path: path.to_path_buf(),
        source: e,
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(bytes).map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}
