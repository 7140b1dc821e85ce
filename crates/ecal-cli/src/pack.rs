//! The `pack` tool and the self-extracting launch path.
//!
//! A packed binary is the interpreter binary itself, followed by an ASCII
//! marker line and a standard ZIP archive. The archive root contains the
//! entry script under `.ecalsrc-entry` plus arbitrary companion files which
//! become importable modules. At launch the binary scans itself for the
//! marker and, when an archive follows, runs the entry script instead of
//! the normal CLI.

use std::{
    io::{Cursor, Read, Write},
    path::{Path, PathBuf},
    process::ExitCode,
};

use zip::{ZipArchive, ZipWriter, write::SimpleFileOptions};

/// Archive member holding the entry script source.
pub const ENTRY_FILE: &str = ".ecalsrc-entry";

/// The marker core, built at runtime so the only contiguous occurrence in
/// a plain binary image is an actually appended marker.
fn marker() -> Vec<u8> {
    format!("####{}####", "ECALSRC").into_bytes()
}

/// An archive found appended to the running binary.
pub struct EmbeddedArchive {
    pub entry: String,
    pub files: Vec<(String, String)>,
}

/// Scans the running binary for an appended source archive.
///
/// Whitespace and control characters around the marker line are skipped.
/// A marker without a readable ZIP archive behind it is treated as not
/// packed.
pub fn find_embedded_archive() -> Result<Option<EmbeddedArchive>, String> {
    let exe = std::env::current_exe().map_err(|err| format!("cannot locate binary: {err}"))?;
    let bytes = std::fs::read(&exe).map_err(|err| format!("cannot read binary: {err}"))?;
    extract_archive(&bytes)
}

/// Scans a binary image for the marker and the archive behind it.
fn extract_archive(bytes: &[u8]) -> Result<Option<EmbeddedArchive>, String> {
    let marker = marker();
    let Some(pos) = bytes
        .windows(marker.len())
        .position(|window| window == marker)
    else {
        return Ok(None);
    };
    let mut start = pos + marker.len();
    while start < bytes.len() && bytes[start] <= 0x20 {
        start += 1;
    }
    if start >= bytes.len() {
        return Ok(None);
    }
    let Ok(mut archive) = ZipArchive::new(Cursor::new(&bytes[start..])) else {
        return Ok(None);
    };
    let names: Vec<String> = archive.file_names().map(String::from).collect();
    let mut entry = None;
    let mut files = Vec::new();
    for name in names {
        let mut file = archive
            .by_name(&name)
            .map_err(|err| format!("cannot read archive member {name}: {err}"))?;
        let mut text = String::new();
        if file.read_to_string(&mut text).is_err() {
            // Binary companion files are not importable source, skip them.
            continue;
        }
        if name == ENTRY_FILE {
            entry = Some(text);
        } else {
            files.push((name, text));
        }
    }
    let entry = entry.ok_or_else(|| format!("archive has no {ENTRY_FILE}"))?;
    Ok(Some(EmbeddedArchive { entry, files }))
}

/// Builds a self-contained binary: this binary plus marker plus a ZIP of
/// the source directory.
pub fn pack(source: &Path, target: &Path, entry: &str) -> ExitCode {
    match pack_inner(source, target, entry) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn pack_inner(source: &Path, target: &Path, entry: &str) -> Result<(), String> {
    let exe = std::env::current_exe().map_err(|err| format!("cannot locate binary: {err}"))?;
    let binary = std::fs::read(&exe).map_err(|err| format!("cannot read binary: {err}"))?;
    let out = build_packed_bytes(&binary, source, entry)?;
    std::fs::write(target, out).map_err(|err| format!("cannot write {}: {err}", target.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(target, perms)
            .map_err(|err| format!("cannot mark {} executable: {err}", target.display()))?;
    }
    Ok(())
}

/// The packed image: binary bytes, marker line, ZIP of the source
/// directory with the entry script stored under [`ENTRY_FILE`].
fn build_packed_bytes(binary: &[u8], source: &Path, entry: &str) -> Result<Vec<u8>, String> {
    let mut out = binary.to_vec();
    out.push(b'\n');
    out.extend_from_slice(&marker());
    out.push(b'\n');

    let entry_text = std::fs::read_to_string(source.join(entry))
        .map_err(|err| format!("cannot read entry script {entry}: {err}"))?;

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    writer
        .start_file(ENTRY_FILE, options)
        .and_then(|()| writer.write_all(entry_text.as_bytes()).map_err(Into::into))
        .map_err(|err| format!("cannot write archive: {err}"))?;

    let mut files = Vec::new();
    collect_files(source, source, &mut files);
    for (rel, path) in files {
        if rel == entry {
            continue;
        }
        let bytes =
            std::fs::read(&path).map_err(|err| format!("cannot read {}: {err}", path.display()))?;
        writer
            .start_file(rel, options)
            .and_then(|()| writer.write_all(&bytes).map_err(Into::into))
            .map_err(|err| format!("cannot write archive: {err}"))?;
    }
    let cursor = writer
        .finish()
        .map_err(|err| format!("cannot finish archive: {err}"))?;
    out.extend_from_slice(&cursor.into_inner());
    Ok(out)
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push((rel.to_string_lossy().replace('\\', "/"), path.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// A packed image round-trips: the marker is found, the archive opens
    /// and the entry script comes back unchanged.
    #[test]
    fn pack_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.ecal"), "return 5").unwrap();
        std::fs::write(dir.path().join("helper.ecal"), "x := 1").unwrap();
        let packed = build_packed_bytes(b"BINARYIMAGE", dir.path(), "main.ecal").unwrap();
        let archive = extract_archive(&packed).unwrap().expect("archive found");
        assert_eq!(archive.entry, "return 5");
        assert_eq!(
            archive.files,
            vec![(String::from("helper.ecal"), String::from("x := 1"))]
        );
    }

    /// A plain image without an appended archive is not packed.
    #[test]
    fn plain_binary_is_not_packed() {
        assert!(extract_archive(b"JUSTSOMEBYTES").unwrap().is_none());
    }

    /// Whitespace and control bytes around the marker line are skipped.
    #[test]
    fn marker_padding_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.ecal"), "1").unwrap();
        let mut packed = Vec::new();
        packed.extend_from_slice(b"BIN\n");
        packed.extend_from_slice(&marker());
        packed.extend_from_slice(b"\r\n\t ");
        let with_archive = build_packed_bytes(b"", dir.path(), "main.ecal").unwrap();
        // build_packed_bytes output starts with "\n<marker>\n", skip that
        // and keep only the archive bytes.
        let archive_start = {
            let m = marker();
            let pos = with_archive
                .windows(m.len())
                .position(|w| w == m)
                .expect("marker present");
            let mut start = pos + m.len();
            while with_archive[start] <= 0x20 {
                start += 1;
            }
            start
        };
        packed.extend_from_slice(&with_archive[archive_start..]);
        let archive = extract_archive(&packed).unwrap().expect("archive found");
        assert_eq!(archive.entry, "1");
    }
}
