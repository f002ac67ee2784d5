use std::path::Path;

use thiserror::Error;

pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["obj", "glb", "off", "ply"];

pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

// file stems silently skipped by the inference engine
pub const RESERVED_STEMS: [&str; 2] = ["car", "complex_car"];

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("File does not exist")]
    NotFound,

    #[error("Unsupported format: .{0}. Supported: .obj, .glb, .off, .ply")]
    UnsupportedFormat(String),

    #[error("File too large: {}MB (max 100MB)", mebibytes(.0))]
    TooLarge(u64),

    #[error("The filename '{0}' is reserved and will be skipped by the model. Please rename your file.")]
    ReservedName(String),
}

fn mebibytes(bytes: &u64) -> String {
    format!("{:.1}", *bytes as f64 / (1024.0 * 1024.0))
}

// pure inspection, no side effects; checks short-circuit in order
pub fn validate(path: &Path) -> Result<(), ValidationError> {
    if path.as_os_str().is_empty() || !path.is_file() {
        return Err(ValidationError::NotFound);
    }

    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(ValidationError::UnsupportedFormat(ext));
    }

    let size = path
        .metadata()
        .map(|m| m.len())
        .map_err(|_| ValidationError::NotFound)?;
    if size > MAX_FILE_SIZE {
        return Err(ValidationError::TooLarge(size));
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if RESERVED_STEMS.contains(&stem.as_str()) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(stem);
        return Err(ValidationError::ReservedName(name));
    }

    Ok(())
}
