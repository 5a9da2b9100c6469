use crate::{enums::Modality, error::SegError};

use dicom::object::{DefaultDicomObject, InMemDicomObject, OpenFileOptions, mem::InMemElement};
use dicom_dictionary_std::tags;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// One slice of the reference series, reduced to what the segmentation
/// object needs to reference it.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub instance_number: i32,
    pub rows: usize,
    pub columns: usize,
    pub modality: Modality,
    /// Image Position (Patient), copied verbatim into plane position groups.
    pub image_position: Option<InMemElement>,
    /// Parsed plane geometry, `None` if any of position, orientation or
    /// pixel spacing is missing or malformed.
    pub plane: Option<ImagePlane>,
}

/// Placement of an image in the patient coordinate system.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImagePlane {
    /// Center of the first transmitted pixel, in mm.
    pub position: [f64; 3],
    /// Direction cosine along a row (increasing column index).
    pub row_direction: [f64; 3],
    /// Direction cosine along a column (increasing row index).
    pub column_direction: [f64; 3],
    /// Distance between rows and between columns, in mm.
    pub pixel_spacing: [f64; 2],
}

impl ImagePlane {
    fn from_header(object: &InMemDicomObject) -> Option<Self> {
        let floats = |tag| {
            object
                .element(tag)
                .ok()
                .and_then(|e| e.to_multi_float64().ok())
        };
        let position = floats(tags::IMAGE_POSITION_PATIENT)?;
        let orientation = floats(tags::IMAGE_ORIENTATION_PATIENT)?;
        let spacing = floats(tags::PIXEL_SPACING)?;

        Some(Self {
            position: position.get(..3)?.try_into().ok()?,
            row_direction: orientation.get(..3)?.try_into().ok()?,
            column_direction: orientation.get(3..6)?.try_into().ok()?,
            pixel_spacing: spacing.get(..2)?.try_into().ok()?,
        })
    }

    /// Patient coordinates of the pixel center at (`row`, `column`).
    pub fn to_patient(&self, row: f64, column: f64) -> [f64; 3] {
        let [row_spacing, column_spacing] = self.pixel_spacing;
        std::array::from_fn(|i| {
            self.position[i]
                + self.row_direction[i] * column_spacing * column
                + self.column_direction[i] * row_spacing * row
        })
    }
}

/// Reference series sorted by instance number.
#[derive(Debug, Clone)]
pub struct ImageSeries {
    images: Vec<SourceImage>,
    /// Header of the first slice, without pixel data.
    reference: InMemDicomObject,
}

impl ImageSeries {
    /// Build a series from already parsed slices.
    ///
    /// # Errors
    ///
    /// Returns [`SegError::InconsistentDimensions`] if the slices disagree on
    /// rows or columns.
    pub fn new(
        mut slices: Vec<(SourceImage, InMemDicomObject)>,
        dir: &Path,
    ) -> Result<Self, SegError> {
        if slices.is_empty() {
            return Err(SegError::NoSeriesFound {
                dir: dir.to_path_buf(),
            });
        }

        // stable, so equal instance numbers keep encounter order
        slices.sort_by_key(|(image, _)| image.instance_number);

        let first = (slices[0].0.rows, slices[0].0.columns);
        if slices
            .iter()
            .any(|(image, _)| (image.rows, image.columns) != first)
        {
            return Err(SegError::InconsistentDimensions);
        }

        let mut slices = slices.into_iter();
        let (first_image, reference) = slices.next().ok_or(SegError::NoSeriesFound {
            dir: dir.to_path_buf(),
        })?;
        let images = std::iter::once(first_image)
            .chain(slices.map(|(image, _)| image))
            .collect();

        Ok(Self { images, reference })
    }

    pub fn images(&self) -> &[SourceImage] {
        &self.images
    }

    pub fn reference(&self) -> &InMemDicomObject {
        &self.reference
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Get the extents of the series as (columns, rows, slices)
    pub fn dim(&self) -> (usize, usize, usize) {
        let first = &self.images[0];
        (first.columns, first.rows, self.images.len())
    }

    pub fn modality(&self) -> Modality {
        self.images[0].modality
    }
}

pub struct SeriesLoader;

impl SeriesLoader {
    /// Load the reference series from a directory, recursing into
    /// subdirectories.
    ///
    /// Files that are not DICOM or are not CT, MR, PET or NM images are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns [`SegError::NoSeriesFound`] if no file could be read as DICOM,
    /// [`SegError::UnsupportedModality`] if every readable file had an
    /// unsupported SOP class and [`SegError::UnidentifiedImages`] if all
    /// supported images lacked identifying attributes.
    pub fn load_from_directory(path: impl AsRef<Path>) -> Result<ImageSeries, SegError> {
        let dir = path.as_ref();
        let objects: Vec<_> = WalkDir::new(dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| Self::read_header(entry.path()))
            .collect();

        debug!(dir = %dir.display(), parsed = objects.len(), "scanned reference directory");
        Self::load_from_dicom_objects(objects, dir)
    }

    /// Build a series from DICOM objects that were read elsewhere.
    pub fn load_from_dicom_objects(
        objects: Vec<DefaultDicomObject>,
        dir: &Path,
    ) -> Result<ImageSeries, SegError> {
        let parsed = objects.len();
        let mut supported = 0;
        let slices: Vec<_> = objects
            .into_iter()
            .filter_map(|object| {
                let object = object.into_inner();
                let modality = Self::get_uid(&object, tags::SOP_CLASS_UID)
                    .and_then(|uid| Modality::from_sop_class_uid(&uid))?;
                supported += 1;
                Self::extract_source_image(&object, modality).map(|image| (image, object))
            })
            .collect();

        if slices.is_empty() {
            let dir = dir.to_path_buf();
            return Err(match (parsed, supported) {
                (0, _) => SegError::NoSeriesFound { dir },
                (rejected, 0) => SegError::UnsupportedModality { dir, rejected },
                (_, skipped) => SegError::UnidentifiedImages { dir, skipped },
            });
        }

        ImageSeries::new(slices, dir)
    }

    fn read_header(path: &Path) -> Option<DefaultDicomObject> {
        OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(path)
            .ok()
    }

    fn extract_source_image(object: &InMemDicomObject, modality: Modality) -> Option<SourceImage> {
        let sop_class_uid = Self::get_uid(object, tags::SOP_CLASS_UID)?;

        let Some(sop_instance_uid) = Self::get_uid(object, tags::SOP_INSTANCE_UID) else {
            warn!("skipping image without SOP Instance UID");
            return None;
        };
        let Some(instance_number) = object
            .element(tags::INSTANCE_NUMBER)
            .ok()
            .and_then(|e| e.to_int::<i32>().ok())
        else {
            warn!(%sop_instance_uid, "skipping image without Instance Number");
            return None;
        };

        let rows = object.element(tags::ROWS).ok()?.to_int::<u16>().ok()?;
        let columns = object.element(tags::COLUMNS).ok()?.to_int::<u16>().ok()?;

        Some(SourceImage {
            sop_class_uid,
            sop_instance_uid,
            instance_number,
            rows: usize::from(rows),
            columns: usize::from(columns),
            modality,
            image_position: object.element(tags::IMAGE_POSITION_PATIENT).ok().cloned(),
            plane: ImagePlane::from_header(object),
        })
    }

    fn get_uid(object: &InMemDicomObject, tag: dicom::core::Tag) -> Option<String> {
        object
            .element(tag)
            .ok()?
            .to_str()
            .ok()
            .map(|uid| uid.trim_end_matches(['\0', ' ']).to_string())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use dicom::core::{DataElement, PrimitiveValue, VR, dicom_value};
    use dicom::object::FileMetaTableBuilder;
    use dicom_dictionary_std::uids;
    use std::path::PathBuf;

    pub(crate) fn slice_object(
        sop_class_uid: &str,
        instance_number: i32,
        rows: u16,
        columns: u16,
    ) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(sop_class_uid)),
            DataElement::new(
                tags::SOP_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(format!("1.2.826.0.1.3680043.2.1125.{instance_number}")),
            ),
            DataElement::new(
                tags::INSTANCE_NUMBER,
                VR::IS,
                PrimitiveValue::from(instance_number.to_string()),
            ),
            DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(rows)),
            DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(columns)),
            DataElement::new(tags::SERIES_NUMBER, VR::IS, PrimitiveValue::from("4")),
        ])
    }

    fn file_object(object: InMemDicomObject) -> DefaultDicomObject {
        object
            .with_meta(FileMetaTableBuilder::new().transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN))
            .unwrap()
    }

    #[test]
    fn sorts_by_instance_number() {
        let objects = [3, 1, 2]
            .into_iter()
            .map(|n| file_object(slice_object(uids::CT_IMAGE_STORAGE, n, 4, 4)))
            .collect();

        let series = SeriesLoader::load_from_dicom_objects(objects, &PathBuf::from("ct")).unwrap();
        let order: Vec<_> = series.images().iter().map(|i| i.instance_number).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(
            series
                .reference()
                .element(tags::INSTANCE_NUMBER)
                .unwrap()
                .to_int::<i32>()
                .unwrap(),
            1
        );
        assert_eq!(series.dim(), (4, 4, 3));
    }

    #[test]
    fn rejects_unsupported_modalities() {
        let objects = vec![file_object(slice_object(uids::SEGMENTATION_STORAGE, 1, 4, 4))];
        let err = SeriesLoader::load_from_dicom_objects(objects, &PathBuf::from("seg")).unwrap_err();
        assert!(matches!(err, SegError::UnsupportedModality { rejected: 1, .. }));
    }

    #[test]
    fn images_without_instance_number_are_not_a_modality_problem() {
        let objects = [1, 2]
            .into_iter()
            .map(|n| {
                let mut object = slice_object(uids::CT_IMAGE_STORAGE, n, 4, 4);
                object.remove_element(tags::INSTANCE_NUMBER);
                file_object(object)
            })
            .collect();

        let err = SeriesLoader::load_from_dicom_objects(objects, &PathBuf::from("ct")).unwrap_err();
        assert!(matches!(err, SegError::UnidentifiedImages { skipped: 2, .. }));
    }

    #[test]
    fn plane_geometry_maps_pixels_to_patient_space() {
        let mut object = slice_object(uids::CT_IMAGE_STORAGE, 1, 4, 4);
        object.put(DataElement::new(
            tags::IMAGE_POSITION_PATIENT,
            VR::DS,
            dicom_value!(Strs, ["-100", "-50", "20"]),
        ));
        object.put(DataElement::new(
            tags::IMAGE_ORIENTATION_PATIENT,
            VR::DS,
            dicom_value!(Strs, ["1", "0", "0", "0", "1", "0"]),
        ));
        object.put(DataElement::new(
            tags::PIXEL_SPACING,
            VR::DS,
            dicom_value!(Strs, ["0.5", "0.25"]),
        ));

        let series =
            SeriesLoader::load_from_dicom_objects(vec![file_object(object)], &PathBuf::from("ct"))
                .unwrap();
        let plane = series.images()[0].plane.unwrap();
        assert_eq!(plane.pixel_spacing, [0.5, 0.25]);
        // column 10 moves along x by the column spacing, row 4 along y by the row spacing
        assert_eq!(plane.to_patient(4.0, 10.0), [-97.5, -48.0, 20.0]);
    }

    #[test]
    fn missing_geometry_leaves_plane_empty() {
        let series = SeriesLoader::load_from_dicom_objects(
            vec![file_object(slice_object(uids::CT_IMAGE_STORAGE, 1, 4, 4))],
            &PathBuf::from("ct"),
        )
        .unwrap();
        assert!(series.images()[0].plane.is_none());
    }

    #[test]
    fn empty_directory_has_no_series() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not dicom").unwrap();
        let err = SeriesLoader::load_from_directory(dir.path()).unwrap_err();
        assert!(matches!(err, SegError::NoSeriesFound { .. }));
    }

    #[test]
    fn inconsistent_dimensions_are_rejected() {
        let objects = vec![
            file_object(slice_object(uids::MR_IMAGE_STORAGE, 1, 4, 4)),
            file_object(slice_object(uids::MR_IMAGE_STORAGE, 2, 8, 4)),
        ];
        let err = SeriesLoader::load_from_dicom_objects(objects, &PathBuf::from("mr")).unwrap_err();
        assert!(matches!(err, SegError::InconsistentDimensions));
    }
}
