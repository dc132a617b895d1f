use std::fs;
use std::io::{self, Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use zip::ZipArchive;

use crate::error::WekeoError;

/// Streams `reader` into `destination`, truncating any existing file.
/// Read failures are reported as transport errors, write failures as
/// filesystem errors.
pub fn write_stream(reader: &mut dyn Read, destination: &Utf8Path) -> Result<u64, WekeoError> {
    let mut file = fs::File::create(destination)
        .map_err(|err| WekeoError::Filesystem(format!("create {destination}: {err}")))?;
    let mut buffer = vec![0u8; 64 * 1024];
    let mut written = 0u64;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(WekeoError::BrokerHttp(format!("download interrupted: {err}"))),
        };
        file.write_all(&buffer[..read])
            .map_err(|err| WekeoError::Filesystem(format!("write {destination}: {err}")))?;
        written += read as u64;
    }
    file.flush()
        .map_err(|err| WekeoError::Filesystem(format!("flush {destination}: {err}")))?;
    Ok(written)
}

/// Extracts every file of a zip archive below `target_dir`.
pub fn extract_zip(
    zip_path: &Utf8Path,
    target_dir: &Utf8Path,
) -> Result<Vec<Utf8PathBuf>, WekeoError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| WekeoError::Filesystem(format!("open zip {zip_path}: {err}")))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| WekeoError::Decode(format!("zip {zip_path}: {err}")))?;

    let mut extracted = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| WekeoError::Decode(err.to_string()))?;
        let relative = entry
            .enclosed_name()
            .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
            .ok_or_else(|| {
                WekeoError::Decode(format!("zip entry {:?} escapes the target", entry.name()))
            })?;
        let entry_path = target_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| WekeoError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| WekeoError::Filesystem(err.to_string()))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| WekeoError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| WekeoError::Filesystem(err.to_string()))?;
        extracted.push(entry_path);
    }
    Ok(extracted)
}
