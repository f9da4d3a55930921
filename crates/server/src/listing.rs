//! Example script directory listing.

use std::fs;
use std::io;
use std::path::Path;

/// Sorted names of the `*.lua` files directly inside `dir`.
pub fn list_examples(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.ends_with(".lua") {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}
