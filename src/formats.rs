//! Input formats admitted for conversion.

use std::path::Path;

/// File extensions the engine is trusted to convert.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "csv", "doc", "doc6", "doc95", "docx", "met", "odd", "odg", "odp", "odt", "ott", "pct",
    "pot", "ppm", "ppsm", "ppsx", "ppt", "pptm", "pptx", "sldm", "sldx", "stc", "sti", "stp",
    "svg", "sxc", "sxd", "sxi", "wmf", "xls", "xls5", "xls95", "xlsx", "xlt", "xlt5", "xlt95",
];

pub fn is_supported(extension: &str) -> bool {
    SUPPORTED_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str())
}

/// Lower-cased extension of an uploaded file name, if it has one.
pub fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| ext.to_ascii_lowercase())
}
