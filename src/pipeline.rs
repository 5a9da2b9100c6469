use crate::{
    assembler::{SegOptions, SegmentationAssembler},
    catalog::{LabelCatalog, build_present_segments},
    engine::{EngineRequest, SegmentationEngine, VolumeConverter, prepare_dicom_input},
    enums::OutputFormat,
    error::SegError,
    rtstruct::StructureSetAssembler,
    series_loader::{ImageSeries, SeriesLoader},
    volume::{FrameStack, LabelVolume},
    writer::ContainerWriter,
};

use std::path::Path;
use tracing::{error, info};

/// Check that a label volume (X, Y, Z) covers the series
/// (columns, rows, slices).
pub fn check_extents(labels: &LabelVolume, series: &ImageSeries) -> Result<(), SegError> {
    let expected = series.dim();
    let actual = labels.dim();
    if actual != expected {
        return Err(SegError::ShapeMismatch { expected, actual });
    }
    Ok(())
}

/// Write the present segments of `labels` as a DICOM segmentation or RT
/// Structure Set of the series found in `dicom_dir`.
///
/// Nothing is written unless every step before the write succeeds.
pub fn export_segmentation(
    labels: &LabelVolume,
    catalog: &LabelCatalog,
    dicom_dir: &Path,
    output: &Path,
    options: &SegOptions,
) -> Result<(), SegError> {
    let series = SeriesLoader::load_from_directory(dicom_dir)?;
    info!(
        slices = series.len(),
        modality = ?series.modality(),
        "loaded reference series"
    );
    export_with_series(labels, catalog, &series, output, options)
}

/// Same as [`export_segmentation`] with an already loaded series.
pub fn export_with_series(
    labels: &LabelVolume,
    catalog: &LabelCatalog,
    series: &ImageSeries,
    output: &Path,
    options: &SegOptions,
) -> Result<(), SegError> {
    check_extents(labels, series)?;

    let rotated = labels.rotated();
    let segments = build_present_segments(catalog, rotated.view(), options.property_type)?;
    info!(
        present = segments.len(),
        catalog = catalog.len(),
        "selected segments"
    );

    let frames = FrameStack::from_rotated(rotated.view());
    let dataset = match options.output_format {
        OutputFormat::Seg => {
            SegmentationAssembler::assemble(&segments, &frames, series, options)
                .inspect_err(|e| error!("Error creating DICOM SEG: {e}"))?
                .dataset
        }
        OutputFormat::RtStruct => {
            StructureSetAssembler::assemble(&segments, &frames, series, options)
                .inspect_err(|e| error!("Error creating RT Structure Set: {e}"))?
                .dataset
        }
    };

    ContainerWriter::write(&dataset, output)
}

/// Segment a DICOM series end to end: convert it to a volume, run the
/// engine on it and write the result next to the source references.
///
/// The request and the engine's catalog are checked before the converter
/// runs.
pub fn segment_dicom_series(
    input: &Path,
    output: &Path,
    request: &EngineRequest,
    converter: &dyn VolumeConverter,
    engine: &dyn SegmentationEngine,
    options: &SegOptions,
) -> Result<(), SegError> {
    request.validate()?;
    let catalog = engine.catalog(request)?;

    let scratch = tempfile::tempdir()?;
    let dicom_dir = prepare_dicom_input(input, scratch.path())?;
    let volume = scratch.path().join("input.nii.gz");
    converter.convert(&dicom_dir, &volume, scratch.path())?;

    let labels = engine.segment(&volume, request, scratch.path())?;
    export_segmentation(&labels, &catalog, &dicom_dir, output, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TotalSegmentatorCommand;
    use std::cell::Cell;

    #[derive(Default)]
    struct CountingConverter {
        calls: Cell<usize>,
    }

    impl VolumeConverter for CountingConverter {
        fn convert(&self, _input: &Path, _output: &Path, _scratch: &Path) -> Result<(), SegError> {
            self.calls.set(self.calls.get() + 1);
            Err(SegError::Conversion("not available in tests".to_string()))
        }
    }

    #[test]
    fn unknown_task_classes_fail_before_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let converter = CountingConverter::default();
        let engine = TotalSegmentatorCommand::new(vec![]);

        let err = segment_dicom_series(
            dir.path(),
            &dir.path().join("seg.dcm"),
            &EngineRequest::default(),
            &converter,
            &engine,
            &SegOptions::default(),
        )
        .unwrap_err();

        assert!(matches!(err, SegError::InvalidConfig(_)));
        assert_eq!(converter.calls.get(), 0);
    }

    #[test]
    fn invalid_request_fails_before_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let converter = CountingConverter::default();
        let engine = TotalSegmentatorCommand::new(vec!["Liver".to_string()]);
        let request = EngineRequest {
            fast: true,
            fastest: true,
            ..EngineRequest::default()
        };

        let err = segment_dicom_series(
            dir.path(),
            &dir.path().join("seg.dcm"),
            &request,
            &converter,
            &engine,
            &SegOptions::default(),
        )
        .unwrap_err();

        assert!(matches!(err, SegError::InvalidConfig(_)));
        assert_eq!(converter.calls.get(), 0);
    }

    #[test]
    fn known_classes_reach_the_converter() {
        let dir = tempfile::tempdir().unwrap();
        let converter = CountingConverter::default();
        let engine = TotalSegmentatorCommand::new(vec!["Liver".to_string()]);

        let err = segment_dicom_series(
            dir.path(),
            &dir.path().join("seg.dcm"),
            &EngineRequest::default(),
            &converter,
            &engine,
            &SegOptions::default(),
        )
        .unwrap_err();

        assert!(matches!(err, SegError::Conversion(_)));
        assert_eq!(converter.calls.get(), 1);
    }
}
