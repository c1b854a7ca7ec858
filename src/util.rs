//! Path helpers shared by configuration, metadata and artefact handling.

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If `HOME` is not set the input is returned unchanged.
///
/// # Examples
///
/// ```
/// # use node_e2e_runner::util::expand_tilde;
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Reads a UTF-8 file through a capability handle on its parent directory.
///
/// Relative paths are resolved against the process working directory.
///
/// # Errors
///
/// Returns the I/O error message when the directory cannot be opened or the
/// file cannot be read.
pub fn read_to_string_ambient(path: &Utf8Path) -> Result<String, String> {
    let (dir_path, file_path) = split_parent(path)?;
    let dir =
        Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(file_path).map_err(|err| err.to_string())
}

/// Writes `contents` to `path`, creating missing parent directories.
///
/// # Errors
///
/// Returns the I/O error message when a directory cannot be created or the
/// file cannot be written.
pub fn write_string_ambient(path: &Utf8Path, contents: &str) -> Result<(), String> {
    let (dir_path, file_path) = split_parent(path)?;
    std::fs::create_dir_all(dir_path).map_err(|err| err.to_string())?;
    let dir =
        Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.write(file_path, contents).map_err(|err| err.to_string())
}

fn split_parent(path: &Utf8Path) -> Result<(&Utf8Path, &Utf8Path), String> {
    let file_name = path
        .file_name()
        .ok_or_else(|| format!("path has no file name: {path}"))?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    Ok((parent, Utf8Path::new(file_name)))
}
