use crate::error::{BoxError, SegError};

use dicom::object::DefaultDicomObject;
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};
use tracing::info;

pub struct ContainerWriter;

impl ContainerWriter {
    /// Write a DICOM file object at `path`.
    ///
    /// The file appears at `path` only once it has been written completely.
    pub fn write(dataset: &DefaultDicomObject, path: impl AsRef<Path>) -> Result<(), SegError> {
        let path = path.as_ref();
        Self::write_with(path, |file| {
            let mut out = BufWriter::new(file);
            dataset.write_all(&mut out)?;
            out.flush()?;
            Ok(())
        })?;

        let sop_class = dataset.meta().media_storage_sop_class_uid();
        info!(
            path = %path.display(),
            sop_class = sop_class.trim_end_matches('\0'),
            "wrote DICOM file"
        );
        Ok(())
    }

    /// Run `write` against a temporary file next to `path`, then move it over
    /// `path`.
    ///
    /// If any step fails the temporary file is removed and `path` keeps its
    /// previous state, whether absent or holding older content.
    pub fn write_with<F>(path: &Path, write: F) -> Result<(), SegError>
    where
        F: FnOnce(&mut File) -> Result<(), BoxError>,
    {
        let failed = |source: BoxError| SegError::ContainerWrite {
            path: path.to_path_buf(),
            source,
        };

        let dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let mut temp = tempfile::Builder::new()
            .prefix(".seg-")
            .suffix(".partial")
            .tempfile_in(dir)
            .map_err(|e| failed(e.into()))?;

        write(temp.as_file_mut()).map_err(failed)?;
        temp.as_file().sync_all().map_err(|e| failed(e.into()))?;
        temp.persist(path).map_err(|e| failed(e.error.into()))?;
        Ok(())
    }
}
