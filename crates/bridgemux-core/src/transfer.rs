//! File payload transfer streams.
//!
//! Downloads ride on dedicated stream kinds rather than RPC calls: the
//! relay feeds file bytes as Data sub-frames until FIN. A single path
//! opens a raw `"download"` stream; several paths open an `"archive"`
//! stream whose output is a packed archive of all of them.

use crate::{Connection, OpenError, StreamHandle};

/// Kind for single-file downloads.
pub const DOWNLOAD_STREAM_KIND: &str = "download";

/// Kind for multi-file archive downloads.
pub const ARCHIVE_STREAM_KIND: &str = "archive";

/// Pick the stream kind a download of `paths` uses.
pub fn download_kind(paths: &[&str]) -> &'static str {
    if paths.len() == 1 {
        DOWNLOAD_STREAM_KIND
    } else {
        ARCHIVE_STREAM_KIND
    }
}

/// Open a download stream for the given paths. The open payload is the
/// NUL-joined path list; the relay answers with the file (or archive)
/// bytes followed by FIN.
pub fn download_payload(conn: &Connection, paths: &[&str]) -> Result<StreamHandle, OpenError> {
    let initial = paths.join("\0").into_bytes();
    conn.open_stream(download_kind(paths), &initial)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_path_selects_download() {
        assert_eq!(download_kind(&["/a.txt"]), DOWNLOAD_STREAM_KIND);
    }

    #[test]
    fn several_paths_select_archive() {
        assert_eq!(download_kind(&["/a.txt", "/b.txt"]), ARCHIVE_STREAM_KIND);
    }
}
