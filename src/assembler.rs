use crate::{
    catalog::{Code, PresentSegment},
    enums::{OutputFormat, PropertyTypeCoding, SegmentationFlavor, SeriesNumbering},
    error::SegError,
    series_loader::{ImageSeries, SourceImage},
    volume::FrameStack,
};

use chrono::Local;
use dicom::{
    core::{DataElement, PrimitiveValue, Tag, VR, dicom_value, value::DataSetSequence},
    object::{DefaultDicomObject, FileMetaTableBuilder, InMemDicomObject, mem::InMemElement},
};
use dicom_dictionary_std::{tags, uids};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Label Map Segmentation Storage
pub const LABELMAP_SEGMENTATION_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.66.7";

/// Attributes copied unchanged from the first slice of the reference series.
const COPIED_FROM_REFERENCE: &[Tag] = &[
    tags::SPECIFIC_CHARACTER_SET,
    tags::PATIENT_NAME,
    tags::PATIENT_ID,
    tags::PATIENT_BIRTH_DATE,
    tags::PATIENT_SEX,
    tags::STUDY_INSTANCE_UID,
    tags::STUDY_ID,
    tags::STUDY_DATE,
    tags::STUDY_TIME,
    tags::ACCESSION_NUMBER,
    tags::REFERRING_PHYSICIAN_NAME,
    tags::FRAME_OF_REFERENCE_UID,
    tags::POSITION_REFERENCE_INDICATOR,
];

/// Generate a fresh UID under the `2.25` UUID root.
pub fn generate_uid() -> String {
    format!("2.25.{}", Uuid::new_v4().as_u128())
}

/// Options of the derived object.
#[derive(Debug, Clone)]
pub struct SegOptions {
    pub output_format: OutputFormat,
    pub flavor: SegmentationFlavor,
    pub series_numbering: SeriesNumbering,
    pub property_type: PropertyTypeCoding,
    /// Used as manufacturer, model name, algorithm name and tracking id.
    pub algorithm_name: String,
    pub software_version: String,
}

impl Default for SegOptions {
    fn default() -> Self {
        Self {
            output_format: OutputFormat::default(),
            flavor: SegmentationFlavor::default(),
            series_numbering: SeriesNumbering::default(),
            property_type: PropertyTypeCoding::default(),
            algorithm_name: "TotalSegmentator".to_string(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// An assembled segmentation instance, ready to be written.
#[derive(Debug, Clone)]
pub struct SegmentationObject {
    pub dataset: DefaultDicomObject,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    pub number_of_frames: usize,
}

/// Patient, study, series and equipment attributes shared by every object
/// derived from a reference series.
pub(crate) struct DerivedSeries {
    pub dataset: InMemDicomObject,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    pub series_number: i32,
}

impl DerivedSeries {
    pub fn new(
        series: &ImageSeries,
        options: &SegOptions,
        sop_class_uid: &str,
        modality: &str,
        description_suffix: &str,
    ) -> Result<Self, SegError> {
        let reference = series.reference();
        let series_instance_uid = generate_uid();
        let sop_instance_uid = generate_uid();

        let source_series_number = reference
            .element(tags::SERIES_NUMBER)
            .ok()
            .and_then(|e| e.to_int::<i32>().ok())
            .unwrap_or(0);
        let series_number = options
            .series_numbering
            .apply(source_series_number)
            .ok_or_else(|| {
                SegError::InvalidConfig(format!(
                    "series number {source_series_number} with {:?} exceeds the IS range",
                    options.series_numbering
                ))
            })?;
        let source_description = reference
            .element(tags::SERIES_DESCRIPTION)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|d| d.trim().to_string())
            .unwrap_or_default();

        let mut dataset = InMemDicomObject::new_empty();
        for tag in COPIED_FROM_REFERENCE {
            if let Ok(element) = reference.element(*tag) {
                dataset.put(element.clone());
            }
        }

        dataset.put(uid(tags::SOP_CLASS_UID, sop_class_uid));
        dataset.put(uid(tags::SOP_INSTANCE_UID, &sop_instance_uid));
        dataset.put(text(tags::MODALITY, VR::CS, modality));
        dataset.put(uid(tags::SERIES_INSTANCE_UID, &series_instance_uid));
        dataset.put(text(tags::SERIES_NUMBER, VR::IS, series_number.to_string()));
        dataset.put(text(
            tags::SERIES_DESCRIPTION,
            VR::LO,
            format!("{source_description} {description_suffix}"),
        ));
        dataset.put(text(tags::INSTANCE_NUMBER, VR::IS, "1"));
        dataset.put(text(tags::MANUFACTURER, VR::LO, &options.algorithm_name));
        dataset.put(text(tags::MANUFACTURER_MODEL_NAME, VR::LO, &options.algorithm_name));
        dataset.put(text(tags::SOFTWARE_VERSIONS, VR::LO, &options.software_version));
        dataset.put(text(tags::DEVICE_SERIAL_NUMBER, VR::LO, "1"));

        Ok(Self {
            dataset,
            series_instance_uid,
            sop_instance_uid,
            series_number,
        })
    }
}

pub struct SegmentationAssembler;

impl SegmentationAssembler {
    /// Build a multi-frame segmentation object from the frame stack.
    ///
    /// Frame `f` of the stack is derived from the `f`-th image of `series`.
    /// `segments` must be non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`SegError::ShapeMismatch`] if the stack does not match the
    /// series, [`SegError::InvalidConfig`] if the series number offset
    /// overflows and [`SegError::Assembly`] if the object cannot be built.
    pub fn assemble(
        segments: &[PresentSegment],
        frames: &FrameStack,
        series: &ImageSeries,
        options: &SegOptions,
    ) -> Result<SegmentationObject, SegError> {
        if segments.is_empty() {
            return Err(SegError::EmptySegmentation);
        }

        let (slices, rows, columns) = frames.dim();
        let expected = series.dim();
        if (columns, rows, slices) != expected {
            return Err(SegError::ShapeMismatch {
                expected,
                actual: (columns, rows, slices),
            });
        }

        let sop_class_uid = match options.flavor {
            SegmentationFlavor::Binary => uids::SEGMENTATION_STORAGE,
            SegmentationFlavor::Labelmap => LABELMAP_SEGMENTATION_STORAGE,
        };
        let DerivedSeries {
            mut dataset,
            series_instance_uid,
            sop_instance_uid,
            series_number,
        } = DerivedSeries::new(series, options, sop_class_uid, "SEG", "Seg")?;
        let reference = series.reference();
        let now = Local::now();

        dataset.put(text(tags::CONTENT_DATE, VR::DA, now.format("%Y%m%d").to_string()));
        dataset.put(text(tags::CONTENT_TIME, VR::TM, now.format("%H%M%S%.3f").to_string()));
        dataset.put(text(tags::CONTENT_LABEL, VR::CS, "SEGMENTATION"));
        dataset.put(DataElement::new(
            tags::IMAGE_TYPE,
            VR::CS,
            dicom_value!(Strs, ["DERIVED", "PRIMARY"]),
        ));

        dataset.put(seq(
            tags::SEGMENT_SEQUENCE,
            segments
                .iter()
                .map(|segment| Self::segment_item(segment, options))
                .collect(),
        ));
        dataset.put(seq(
            tags::REFERENCED_SERIES_SEQUENCE,
            vec![Self::referenced_series_item(series)],
        ));
        dataset.put(seq(
            tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE,
            vec![Self::shared_functional_groups(reference)],
        ));

        let dimension_organization_uid = generate_uid();
        dataset.put(seq(
            tags::DIMENSION_ORGANIZATION_SEQUENCE,
            vec![InMemDicomObject::from_element_iter([uid(
                tags::DIMENSION_ORGANIZATION_UID,
                &dimension_organization_uid,
            )])],
        ));
        dataset.put(seq(
            tags::DIMENSION_INDEX_SEQUENCE,
            Self::dimension_indices(options.flavor, &dimension_organization_uid),
        ));

        let (per_frame, pixel_data, bits_allocated) = match options.flavor {
            SegmentationFlavor::Binary => {
                let per_frame = segments
                    .iter()
                    .flat_map(|segment| {
                        series.images().iter().enumerate().map(move |(frame, image)| {
                            Self::frame_groups(image, frame, Some(segment.number))
                        })
                    })
                    .collect::<Vec<_>>();
                (per_frame, Self::binary_pixel_data(segments, frames), 1u16)
            }
            SegmentationFlavor::Labelmap => {
                let per_frame = series
                    .images()
                    .iter()
                    .enumerate()
                    .map(|(frame, image)| Self::frame_groups(image, frame, None))
                    .collect::<Vec<_>>();
                let (pixel_data, bits) = Self::labelmap_pixel_data(segments, frames);
                (per_frame, pixel_data, bits)
            }
        };
        let number_of_frames = per_frame.len();

        dataset.put(text(tags::SEGMENTATION_TYPE, VR::CS, match options.flavor {
            SegmentationFlavor::Binary => "BINARY",
            SegmentationFlavor::Labelmap => "LABELMAP",
        }));
        dataset.put(text(tags::NUMBER_OF_FRAMES, VR::IS, number_of_frames.to_string()));
        dataset.put(seq(tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE, per_frame));

        Self::put_image_pixel(&mut dataset, rows, columns, bits_allocated)?;
        dataset.put(DataElement::new(
            tags::PIXEL_DATA,
            if bits_allocated > 8 { VR::OW } else { VR::OB },
            PrimitiveValue::from(pixel_data),
        ));

        debug!(
            segments = segments.len(),
            frames = number_of_frames,
            series_number,
            "assembled segmentation object"
        );

        let dataset = with_file_meta(dataset)?;

        Ok(SegmentationObject {
            dataset,
            series_instance_uid,
            sop_instance_uid,
            number_of_frames,
        })
    }

    fn segment_item(segment: &PresentSegment, options: &SegOptions) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::SEGMENT_NUMBER, VR::US, PrimitiveValue::from(segment.number)),
            text(tags::SEGMENT_LABEL, VR::LO, &segment.name),
            text(tags::SEGMENT_ALGORITHM_TYPE, VR::CS, "AUTOMATIC"),
            text(tags::SEGMENT_ALGORITHM_NAME, VR::LO, &options.algorithm_name),
            seq(
                tags::SEGMENTED_PROPERTY_CATEGORY_CODE_SEQUENCE,
                vec![code_item(&segment.category)],
            ),
            seq(
                tags::SEGMENTED_PROPERTY_TYPE_CODE_SEQUENCE,
                vec![code_item(&segment.property_type)],
            ),
            text(tags::TRACKING_ID, VR::UT, &options.algorithm_name),
            uid(tags::TRACKING_UID, &generate_uid()),
        ])
    }

    fn referenced_series_item(series: &ImageSeries) -> InMemDicomObject {
        let instances = series
            .images()
            .iter()
            .map(|image| {
                InMemDicomObject::from_element_iter([
                    uid(tags::REFERENCED_SOP_CLASS_UID, &image.sop_class_uid),
                    uid(tags::REFERENCED_SOP_INSTANCE_UID, &image.sop_instance_uid),
                ])
            })
            .collect();

        let mut item = InMemDicomObject::new_empty();
        if let Ok(element) = series.reference().element(tags::SERIES_INSTANCE_UID) {
            item.put(element.clone());
        }
        item.put(seq(tags::REFERENCED_INSTANCE_SEQUENCE, instances));
        item
    }

    fn shared_functional_groups(reference: &InMemDicomObject) -> InMemDicomObject {
        let mut groups = InMemDicomObject::new_empty();

        if let Ok(orientation) = reference.element(tags::IMAGE_ORIENTATION_PATIENT) {
            groups.put(seq(
                tags::PLANE_ORIENTATION_SEQUENCE,
                vec![InMemDicomObject::from_element_iter([orientation.clone()])],
            ));
        }

        let measures: Vec<_> = [
            tags::PIXEL_SPACING,
            tags::SLICE_THICKNESS,
            tags::SPACING_BETWEEN_SLICES,
        ]
        .into_iter()
        .filter_map(|tag| reference.element(tag).ok().cloned())
        .collect();
        if !measures.is_empty() {
            groups.put(seq(
                tags::PIXEL_MEASURES_SEQUENCE,
                vec![InMemDicomObject::from_element_iter(measures)],
            ));
        }

        groups
    }

    fn dimension_indices(
        flavor: SegmentationFlavor,
        organization_uid: &str,
    ) -> Vec<InMemDicomObject> {
        let index = |pointer: Tag, group: Tag, label: &str| {
            InMemDicomObject::from_element_iter([
                DataElement::new(tags::DIMENSION_INDEX_POINTER, VR::AT, dicom_value!(Tags, [pointer])),
                DataElement::new(tags::FUNCTIONAL_GROUP_POINTER, VR::AT, dicom_value!(Tags, [group])),
                uid(tags::DIMENSION_ORGANIZATION_UID, organization_uid),
                text(tags::DIMENSION_DESCRIPTION_LABEL, VR::LO, label),
            ])
        };

        let position = index(
            tags::IMAGE_POSITION_PATIENT,
            tags::PLANE_POSITION_SEQUENCE,
            "Image Position Patient",
        );
        match flavor {
            SegmentationFlavor::Binary => vec![
                index(
                    tags::REFERENCED_SEGMENT_NUMBER,
                    tags::SEGMENT_IDENTIFICATION_SEQUENCE,
                    "Segment Number",
                ),
                position,
            ],
            SegmentationFlavor::Labelmap => vec![position],
        }
    }

    /// Functional groups of one output frame derived from `image`.
    fn frame_groups(image: &SourceImage, frame: usize, segment: Option<u16>) -> InMemDicomObject {
        let position_index = frame as u32 + 1;
        let index_values = match segment {
            Some(number) => dicom_value!(U32, [u32::from(number), position_index]),
            None => dicom_value!(U32, [position_index]),
        };

        let mut groups = InMemDicomObject::from_element_iter([
            seq(
                tags::FRAME_CONTENT_SEQUENCE,
                vec![InMemDicomObject::from_element_iter([DataElement::new(
                    tags::DIMENSION_INDEX_VALUES,
                    VR::UL,
                    index_values,
                )])],
            ),
            seq(tags::DERIVATION_IMAGE_SEQUENCE, vec![Self::derivation_item(image)]),
        ]);

        if let Some(number) = segment {
            groups.put(seq(
                tags::SEGMENT_IDENTIFICATION_SEQUENCE,
                vec![InMemDicomObject::from_element_iter([DataElement::new(
                    tags::REFERENCED_SEGMENT_NUMBER,
                    VR::US,
                    PrimitiveValue::from(number),
                )])],
            ));
        }
        if let Some(position) = &image.image_position {
            groups.put(seq(
                tags::PLANE_POSITION_SEQUENCE,
                vec![InMemDicomObject::from_element_iter([position.clone()])],
            ));
        }
        groups
    }

    fn derivation_item(image: &SourceImage) -> InMemDicomObject {
        let source = InMemDicomObject::from_element_iter([
            uid(tags::REFERENCED_SOP_CLASS_UID, &image.sop_class_uid),
            uid(tags::REFERENCED_SOP_INSTANCE_UID, &image.sop_instance_uid),
            seq(
                tags::PURPOSE_OF_REFERENCE_CODE_SEQUENCE,
                vec![code_item(&Code::new(
                    "121322",
                    "DCM",
                    "Source image for image processing operation",
                ))],
            ),
        ]);

        InMemDicomObject::from_element_iter([
            seq(
                tags::DERIVATION_CODE_SEQUENCE,
                vec![code_item(&Code::new("113076", "DCM", "Segmentation"))],
            ),
            seq(tags::SOURCE_IMAGE_SEQUENCE, vec![source]),
        ])
    }

    /// One bit per pixel, segment-major, frames packed back to back with the
    /// first pixel in the least significant bit.
    fn binary_pixel_data(segments: &[PresentSegment], frames: &FrameStack) -> Vec<u8> {
        let total = segments.len() * frames.data.len();
        let mut packed = vec![0u8; total.div_ceil(8)];

        let mut i = 0;
        for segment in segments {
            for &bit in frames.mask(segment.label).iter() {
                packed[i / 8] |= bit << (i % 8);
                i += 1;
            }
        }

        pad_even(packed)
    }

    /// Segment numbers per pixel, 8 bit unless more than 255 segments.
    fn labelmap_pixel_data(segments: &[PresentSegment], frames: &FrameStack) -> (Vec<u8>, u16) {
        let numbers: HashMap<u16, u16> = segments.iter().map(|s| (s.label, s.number)).collect();
        let values = frames
            .data
            .iter()
            .map(|v| numbers.get(v).copied().unwrap_or(0));

        if segments.len() <= usize::from(u8::MAX) {
            (pad_even(values.map(|v| v as u8).collect()), 8)
        } else {
            (pad_even(values.flat_map(u16::to_le_bytes).collect()), 16)
        }
    }

    fn put_image_pixel(
        dataset: &mut InMemDicomObject,
        rows: usize,
        columns: usize,
        bits_allocated: u16,
    ) -> Result<(), SegError> {
        let rows = u16::try_from(rows)
            .map_err(|_| SegError::Assembly(format!("{rows} rows exceed the DICOM limit")))?;
        let columns = u16::try_from(columns)
            .map_err(|_| SegError::Assembly(format!("{columns} columns exceed the DICOM limit")))?;

        dataset.put(DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1u16)));
        dataset.put(text(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "MONOCHROME2"));
        dataset.put(DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(rows)));
        dataset.put(DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(columns)));
        dataset.put(DataElement::new(
            tags::BITS_ALLOCATED,
            VR::US,
            PrimitiveValue::from(bits_allocated),
        ));
        dataset.put(DataElement::new(
            tags::BITS_STORED,
            VR::US,
            PrimitiveValue::from(bits_allocated),
        ));
        dataset.put(DataElement::new(
            tags::HIGH_BIT,
            VR::US,
            PrimitiveValue::from(bits_allocated - 1),
        ));
        dataset.put(DataElement::new(
            tags::PIXEL_REPRESENTATION,
            VR::US,
            PrimitiveValue::from(0u16),
        ));
        dataset.put(text(tags::LOSSY_IMAGE_COMPRESSION, VR::CS, "00"));
        Ok(())
    }
}

/// Attach an Explicit VR Little Endian file meta group.
pub(crate) fn with_file_meta(dataset: InMemDicomObject) -> Result<DefaultDicomObject, SegError> {
    dataset
        .with_meta(FileMetaTableBuilder::new().transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN))
        .map_err(|e| SegError::Assembly(e.to_string()))
}

pub(crate) fn text(tag: Tag, vr: VR, value: impl Into<String>) -> InMemElement {
    DataElement::new(tag, vr, PrimitiveValue::from(value.into()))
}

pub(crate) fn uid(tag: Tag, value: &str) -> InMemElement {
    text(tag, VR::UI, value)
}

pub(crate) fn seq(tag: Tag, items: Vec<InMemDicomObject>) -> InMemElement {
    DataElement::new(tag, VR::SQ, DataSetSequence::from(items))
}

pub(crate) fn code_item(code: &Code) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        text(tags::CODE_VALUE, VR::SH, &code.value),
        text(tags::CODING_SCHEME_DESIGNATOR, VR::SH, &code.scheme),
        text(tags::CODE_MEANING, VR::LO, &code.meaning),
    ])
}

fn pad_even(mut bytes: Vec<u8>) -> Vec<u8> {
    if bytes.len() % 2 == 1 {
        bytes.push(0);
    }
    bytes
}
