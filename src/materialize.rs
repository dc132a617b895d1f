use std::fs;
use std::io::Read;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use crate::broker::ContentFetcher;
use crate::domain::{MaterializeMode, ResultManifest};
use crate::error::WekeoError;
use crate::fs_util;
use crate::netcdf::Dataset;

#[derive(Debug)]
pub enum MaterializedDataset {
    InMemory(Dataset),
    File {
        path: Utf8PathBuf,
        dataset: Dataset,
    },
    Archive {
        path: Utf8PathBuf,
        extracted_to: Utf8PathBuf,
        files: Vec<Utf8PathBuf>,
    },
}

impl MaterializedDataset {
    pub fn dataset(&self) -> Option<&Dataset> {
        match self {
            MaterializedDataset::InMemory(dataset) | MaterializedDataset::File { dataset, .. } => {
                Some(dataset)
            }
            MaterializedDataset::Archive { .. } => None,
        }
    }

    pub fn location(&self) -> Option<&Utf8Path> {
        match self {
            MaterializedDataset::InMemory(_) => None,
            MaterializedDataset::File { path, .. } | MaterializedDataset::Archive { path, .. } => {
                Some(path)
            }
        }
    }
}

/// Downloads the primary manifest entry and turns it into a dataset.
pub struct Materializer<'a, F: ContentFetcher> {
    fetcher: &'a F,
    output_dir: Utf8PathBuf,
}

impl<'a, F: ContentFetcher> Materializer<'a, F> {
    /// Files are written relative to the current directory.
    pub fn new(fetcher: &'a F) -> Self {
        Self::with_output_dir(fetcher, Utf8PathBuf::from("."))
    }

    pub fn with_output_dir(fetcher: &'a F, output_dir: Utf8PathBuf) -> Self {
        Self {
            fetcher,
            output_dir,
        }
    }

    pub fn materialize(
        &self,
        manifest: &ResultManifest,
        mode: MaterializeMode,
    ) -> Result<MaterializedDataset, WekeoError> {
        let entry = manifest.primary();
        // Checked before any request so a bad manifest never touches storage.
        let filename = checked_filename(&entry.filename)?;
        debug!(url = %entry.url, %mode, "fetching result content");
        let mut reader = self.fetcher.open(&entry.url)?;

        match mode {
            MaterializeMode::InMemory => {
                let mut bytes = Vec::new();
                reader
                    .read_to_end(&mut bytes)
                    .map_err(|err| WekeoError::BrokerHttp(format!("download interrupted: {err}")))?;
                info!(bytes = bytes.len(), "decoding dataset in memory");
                Ok(MaterializedDataset::InMemory(Dataset::from_bytes(bytes)?))
            }
            MaterializeMode::ToFile => {
                let path = self.write(reader.as_mut(), filename)?;
                let dataset = Dataset::open(path.as_std_path())?;
                Ok(MaterializedDataset::File { path, dataset })
            }
            MaterializeMode::Archive => {
                let path = self.write(reader.as_mut(), filename)?;
                let extracted_to = self.output_dir.join(extraction_dir_name(filename));
                fs::create_dir_all(&extracted_to)
                    .map_err(|err| WekeoError::Filesystem(format!("{extracted_to}: {err}")))?;
                let files = fs_util::extract_zip(&path, &extracted_to)?;
                info!(archive = %path, files = files.len(), "archive extracted");
                Ok(MaterializedDataset::Archive {
                    path,
                    extracted_to,
                    files,
                })
            }
        }
    }

    fn write(&self, reader: &mut dyn Read, filename: &str) -> Result<Utf8PathBuf, WekeoError> {
        fs::create_dir_all(&self.output_dir)
            .map_err(|err| WekeoError::Filesystem(format!("{}: {err}", self.output_dir)))?;
        let path = self.output_dir.join(filename);
        let written = fs_util::write_stream(reader, &path)?;
        info!(path = %path, bytes = written, "result written");
        Ok(path)
    }
}

/// Sibling directory for an archive's contents; never the archive path itself.
fn extraction_dir_name(filename: &str) -> String {
    match Utf8Path::new(filename).file_stem() {
        Some(stem) if stem != filename => stem.to_string(),
        _ => format!("{filename}.d"),
    }
}

/// The manifest filename must name a single file in the output directory.
fn checked_filename(filename: &str) -> Result<&str, WekeoError> {
    let name = filename.trim();
    let is_plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.contains('\0');
    if !is_plain {
        return Err(WekeoError::Manifest(format!(
            "filename {filename:?} is not a plain file name"
        )));
    }
    Ok(name)
}
