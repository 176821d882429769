//! Document and collection paths.
//!
//! Paths are slash-separated segments. A collection path has an odd number
//! of segments (`inv`, `stores/s1/inv`), a document path an even number
//! (`inv/123`, `stores/s1/inv/123`).

use crate::{error::Result, Error};

fn segments(path: &str) -> Result<Vec<&str>> {
    if path.is_empty() {
        return Err(Error::InvalidPath("path is empty".into()));
    }
    let parts: Vec<&str> = path.split('/').collect();
    if parts.iter().any(|s| s.is_empty() || s.trim() != *s) {
        return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(parts)
}

/// Validate a document path.
pub fn validate_document_path(path: &str) -> Result<()> {
    if segments(path)?.len() % 2 != 0 {
        return Err(Error::InvalidPath(format!("{path} is not a document path")));
    }
    Ok(())
}

/// Validate a collection path.
pub fn validate_collection_path(path: &str) -> Result<()> {
    if segments(path)?.len() % 2 != 1 {
        return Err(Error::InvalidPath(format!("{path} is not a collection path")));
    }
    Ok(())
}

/// Whether `path` addresses a document (as opposed to a collection).
pub fn is_document_path(path: &str) -> bool {
    validate_document_path(path).is_ok()
}

/// The collection containing a document path.
pub fn parent(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

/// The last segment of the collection path a document lives in.
///
/// This is the name schemas are keyed by.
pub fn collection_name(path: &str) -> &str {
    let collection = if is_document_path(path) { parent(path) } else { path };
    collection.rsplit('/').next().unwrap_or(collection)
}

/// Join a collection path and a document id.
pub fn join(collection: &str, id: &str) -> String {
    format!("{collection}/{id}")
}

/// Whether `path` is a document directly inside `collection`.
pub fn is_child_of(path: &str, collection: &str) -> bool {
    is_document_path(path) && parent(path) == collection
}
