//! Path translation for a remote peer
//!
//! The local and the remote model directory share a common tail, e.g.
//! `C:\work\proj\model` and `/home/u/proj/model`. A local path below the
//! diverging prefix is rewritten to the remote prefix, with `/` separators.

use std::path::Path;

/// Local path does not live below the local model directory
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{path} is not below the model directory {model_dir}")]
pub struct RemotePathError {
    /// Path that could not be translated
    pub path: String,
    /// Local model directory
    pub model_dir: String,
}

#[inline]
fn is_separator(b: u8) -> bool {
    b == b'/' || b == b'\\'
}

fn unix_style(path: &str) -> String {
    path.replace('\\', "/")
}

/// Translate a local path into the path the remote peer sees
///
/// An empty `remote_model_dir` means no translation; only separators are
/// normalized.
///
/// # Errors
/// Returns [`RemotePathError`] if `local_path` does not start with the part
/// of `local_model_dir` that differs from the remote directory.
pub fn find_remote_path(
    local_path: &Path,
    local_model_dir: &Path,
    remote_model_dir: &str,
) -> Result<String, RemotePathError> {
    let local_path = local_path.to_string_lossy();
    if remote_model_dir.is_empty() {
        return Ok(unix_style(&local_path));
    }

    let local_dir = local_model_dir.to_string_lossy();
    let remote = remote_model_dir.as_bytes();
    let local = local_dir.as_bytes();
    let error = || RemotePathError {
        path: local_path.to_string(),
        model_dir: local_dir.to_string(),
    };

    // exclusive end positions, trailing separators skipped
    let mut ir = remote.len();
    let mut il = local.len();
    if ir > 0 && is_separator(remote[ir - 1]) {
        ir -= 1;
    }
    if il > 0 && is_separator(local[il - 1]) {
        il -= 1;
    }

    // walk back over the common tail, remembering the last shared separator
    let mut last_sep = ir;
    while ir > 0 && il > 0 {
        let r = remote[ir - 1];
        let l = local[il - 1];
        if is_separator(r) && is_separator(l) {
            last_sep = ir - 1;
        } else if r != l {
            break;
        }
        ir -= 1;
        il -= 1;
    }

    let remote_prefix = remote_model_dir
        .get(..last_sep)
        .ok_or_else(error)?;
    let local_start = il + (last_sep - ir);

    let path_bytes = local_path.as_bytes();
    if path_bytes.len() < local_start {
        return Err(error());
    }
    let same_prefix = path_bytes[..local_start]
        .iter()
        .zip(&local[..local_start.min(local.len())])
        .all(|(a, b)| a == b || (is_separator(*a) && is_separator(*b)));
    if !same_prefix || local.len() < local_start {
        return Err(error());
    }

    let tail = local_path.get(local_start..).ok_or_else(error)?;
    Ok(unix_style(&format!("{remote_prefix}{tail}")))
}
