//! Contracts of the external programs this crate drives, with adapters that
//! call them as subprocesses.

use crate::{
    catalog::LabelCatalog,
    enums::{Device, Task},
    error::SegError,
    volume::LabelVolume,
};

use std::{
    collections::HashSet,
    fs::File,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};
use tracing::{debug, info, warn};

/// What to ask the segmentation engine for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineRequest {
    pub task: Task,
    /// Only keep these classes, in this order.
    pub roi_subset: Option<Vec<String>>,
    pub device: Device,
    /// 3mm model.
    pub fast: bool,
    /// 6mm model.
    pub fastest: bool,
}

impl EngineRequest {
    /// Check the request before any engine is started.
    pub fn validate(&self) -> Result<(), SegError> {
        if self.fast && self.fastest {
            return Err(SegError::InvalidConfig(
                "fast and fastest are mutually exclusive".to_string(),
            ));
        }

        if let Some(subset) = &self.roi_subset {
            if subset.is_empty() {
                return Err(SegError::InvalidConfig("roi subset is empty".to_string()));
            }
            let mut seen = HashSet::new();
            for name in subset {
                if name.trim().is_empty() {
                    return Err(SegError::InvalidConfig(
                        "roi subset contains an empty class name".to_string(),
                    ));
                }
                if !seen.insert(name.as_str()) {
                    return Err(SegError::InvalidConfig(format!(
                        "roi subset lists '{name}' twice"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Turns an image volume into a label volume.
pub trait SegmentationEngine {
    /// Labels and class names that `segment` produces for `request`.
    ///
    /// Callers resolve the catalog before any conversion starts, so an
    /// unknown task fails without running external programs.
    fn catalog(&self, request: &EngineRequest) -> Result<LabelCatalog, SegError>;

    fn segment(
        &self,
        volume: &Path,
        request: &EngineRequest,
        scratch: &Path,
    ) -> Result<LabelVolume, SegError>;
}

/// Converts a DICOM series into a single volume file.
pub trait VolumeConverter {
    fn convert(&self, input: &Path, output: &Path, scratch: &Path) -> Result<(), SegError>;
}

/// Runs the `TotalSegmentator` command line program with multilabel output.
#[derive(Debug, Clone)]
pub struct TotalSegmentatorCommand {
    pub program: PathBuf,
    /// Class names of the task, label 1 first.
    pub class_names: Vec<String>,
    pub verbose: bool,
}

impl TotalSegmentatorCommand {
    pub fn new(class_names: Vec<String>) -> Self {
        Self {
            program: PathBuf::from("TotalSegmentator"),
            class_names,
            verbose: false,
        }
    }

    fn arguments(&self, volume: &Path, output: &Path, request: &EngineRequest) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            volume.display().to_string(),
            "-o".to_string(),
            output.display().to_string(),
            "--ml".to_string(),
            "-ta".to_string(),
            request.task.to_string(),
            "-d".to_string(),
            request.device.to_string(),
        ];
        if request.fast {
            args.push("--fast".to_string());
        }
        if request.fastest {
            args.push("--fastest".to_string());
        }
        if let Some(subset) = &request.roi_subset {
            args.push("--roi_subset".to_string());
            args.extend(subset.iter().cloned());
        }
        if !self.verbose {
            args.push("--quiet".to_string());
        }
        args
    }
}

impl SegmentationEngine for TotalSegmentatorCommand {
    fn catalog(&self, request: &EngineRequest) -> Result<LabelCatalog, SegError> {
        match &request.roi_subset {
            Some(subset) => Ok(LabelCatalog::from_class_names(subset.iter().cloned())),
            None if self.class_names.is_empty() => Err(SegError::InvalidConfig(format!(
                "no class names known for task '{}', pass a class map or a roi subset",
                request.task
            ))),
            None => Ok(LabelCatalog::from_class_names(self.class_names.iter().cloned())),
        }
    }

    fn segment(
        &self,
        volume: &Path,
        request: &EngineRequest,
        scratch: &Path,
    ) -> Result<LabelVolume, SegError> {
        request.validate()?;
        let output = scratch.join("segmentations.nii.gz");

        info!(task = %request.task, device = %request.device, "running segmentation engine");
        let status = Command::new(&self.program)
            .args(self.arguments(volume, &output, request))
            .stdout(if self.verbose { Stdio::inherit() } else { Stdio::null() })
            .status()?;
        if !status.success() {
            return Err(SegError::Engine(format!(
                "{} exited with {status}",
                self.program.display()
            )));
        }
        if !output.exists() {
            return Err(SegError::Engine(format!(
                "{} did not produce {}",
                self.program.display(),
                output.display()
            )));
        }

        LabelVolume::from_nifti(&output)
    }
}

/// Runs `dcm2niix` to turn a DICOM directory or zip archive into a
/// gzipped NIfTI file.
#[derive(Debug, Clone)]
pub struct Dcm2NiixCommand {
    pub program: PathBuf,
}

impl Default for Dcm2NiixCommand {
    fn default() -> Self {
        Self {
            program: PathBuf::from("dcm2niix"),
        }
    }
}

impl VolumeConverter for Dcm2NiixCommand {
    fn convert(&self, input: &Path, output: &Path, scratch: &Path) -> Result<(), SegError> {
        let input = prepare_dicom_input(input, scratch)?;
        let out_dir = output.parent().unwrap_or(scratch);
        let stem = output
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.trim_end_matches(".nii.gz"))
            .ok_or_else(|| {
                SegError::Conversion(format!("invalid output path {}", output.display()))
            })?;

        debug!(input = %input.display(), output = %output.display(), "converting DICOM to NIfTI");
        let result = Command::new(&self.program)
            .arg("-o")
            .arg(out_dir)
            .args(["-z", "y", "-f", stem])
            .arg(&input)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()?;

        if !output.exists() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(SegError::Conversion(format!(
                "{} failed to convert {}: {}",
                self.program.display(),
                input.display(),
                stderr.trim()
            )));
        }

        let sidecar = out_dir.join(format!("{stem}.json"));
        if sidecar.exists() {
            if let Err(e) = std::fs::remove_file(&sidecar) {
                warn!(path = %sidecar.display(), "could not remove sidecar: {e}");
            }
        }
        Ok(())
    }
}

/// Return a directory holding the DICOM input.
///
/// Zip archives are extracted into `<scratch>/extracted_dcm`; directories
/// are returned unchanged.
pub fn prepare_dicom_input(input: &Path, scratch: &Path) -> Result<PathBuf, SegError> {
    if !input.is_file() {
        return Ok(input.to_path_buf());
    }

    let mut archive = zip::ZipArchive::new(File::open(input)?)?;
    let target = scratch.join("extracted_dcm");
    if !target.exists() {
        debug!(archive = %input.display(), files = archive.len(), "extracting zip input");
        archive.extract(&target)?;
    }
    Ok(target)
}
