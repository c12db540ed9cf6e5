use std::fs;
use std::io::{Read, Seek};
use std::path::Path;

use regex::Regex;
use zip::ZipArchive;

use crate::error::ImportError;

pub fn open_archive(zip_path: &Path) -> Result<ZipArchive<fs::File>, ImportError> {
    let file = fs::File::open(zip_path).map_err(|err| ImportError::CorruptArchive {
        path: zip_path.to_path_buf(),
        message: format!("open: {err}"),
    })?;
    ZipArchive::new(file).map_err(|err| ImportError::CorruptArchive {
        path: zip_path.to_path_buf(),
        message: err.to_string(),
    })
}

/// Names of the file entries matching `pattern`, sorted.
pub fn matching_entries<R: Read + Seek>(archive: &ZipArchive<R>, pattern: &Regex) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|name| !name.ends_with('/') && pattern.is_match(name))
        .map(str::to_string)
        .collect();
    names.sort();
    names
}
