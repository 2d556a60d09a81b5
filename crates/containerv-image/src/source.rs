//! Layer source URI handlers.
//!
//! Daemons that receive layers as strings resolve them here:
//!
//! - `dir:///path` for a host directory,
//! - `image:///path` for image content,
//! - `pkg:///path/app.tar.gz` for a package archive,
//! - `files://HOST=DEST[,HOST=DEST...]` for a raw file list.

use std::path::PathBuf;
use std::sync::Arc;

use containerv_common::error::{ContainervError, Result};

use crate::layer::{FileEntry, LayerSource};
use crate::package::TarPackage;

/// Resolves a layer source URI into a [`LayerSource`].
///
/// # Errors
///
/// Returns `NotFound` if a referenced path does not exist and `InvalidSpec`
/// for an unknown scheme or malformed file list.
pub fn resolve_source(uri: &str) -> Result<LayerSource> {
    if let Some(path_str) = uri.strip_prefix("dir://") {
        let path = existing(path_str, "layer directory")?;
        tracing::debug!(path = %path.display(), "resolved dir:// source");
        Ok(LayerSource::Directory(path))
    } else if let Some(path_str) = uri.strip_prefix("image://") {
        let path = existing(path_str, "image")?;
        tracing::debug!(path = %path.display(), "resolved image:// source");
        Ok(LayerSource::Image(path))
    } else if let Some(path_str) = uri.strip_prefix("pkg://") {
        let package = TarPackage::open(path_str)?;
        tracing::debug!(path = path_str, "resolved pkg:// source");
        Ok(LayerSource::Package(Arc::new(package)))
    } else if let Some(list) = uri.strip_prefix("files://") {
        let entries = parse_file_list(list)?;
        tracing::debug!(entries = entries.len(), "resolved files:// source");
        Ok(LayerSource::Files(entries))
    } else {
        Err(ContainervError::invalid(format!(
            "unsupported layer source URI scheme: {uri}"
        )))
    }
}

fn existing(path_str: &str, kind: &'static str) -> Result<PathBuf> {
    let path = PathBuf::from(path_str);
    if !path.exists() {
        return Err(ContainervError::NotFound {
            kind,
            id: path_str.to_string(),
        });
    }
    Ok(path)
}

fn parse_file_list(list: &str) -> Result<Vec<FileEntry>> {
    list.split(',')
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (host, dest) = item.split_once('=').ok_or_else(|| {
                ContainervError::invalid(format!("file entry needs HOST=DEST: {item}"))
            })?;
            Ok(FileEntry {
                host: existing(host, "layer file")?,
                dest: PathBuf::from(dest),
            })
        })
        .collect()
}
