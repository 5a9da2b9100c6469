//! RT Structure Set output: the present segments as contour-based ROIs.

use crate::{
    assembler::{DerivedSeries, SegOptions, seq, text, uid, with_file_meta},
    catalog::PresentSegment,
    error::SegError,
    series_loader::{ImagePlane, ImageSeries, SourceImage},
    volume::FrameStack,
};

use chrono::Local;
use dicom::{
    core::{DataElement, PrimitiveValue, VR},
    object::{DefaultDicomObject, InMemDicomObject},
};
use dicom_dictionary_std::{tags, uids};
use image::{GrayImage, Luma};
use imageproc::contours::{Contour, find_contours};
use ndarray::{ArrayView2, Axis};
use tracing::debug;

/// ROI display colors, assigned in segment order and repeated.
const ROI_COLORS: [[u8; 3]; 8] = [
    [255, 0, 0],
    [0, 255, 0],
    [0, 0, 255],
    [255, 255, 0],
    [0, 255, 255],
    [255, 0, 255],
    [255, 128, 0],
    [128, 0, 255],
];

/// An assembled structure set instance, ready to be written.
#[derive(Debug, Clone)]
pub struct StructureSetObject {
    pub dataset: DefaultDicomObject,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    pub number_of_contours: usize,
}

pub struct StructureSetAssembler;

impl StructureSetAssembler {
    /// Build an RT Structure Set with one ROI per segment.
    ///
    /// Every connected region of a segment in frame `f` becomes a contour on
    /// the `f`-th image of `series`, the same pairing the segmentation object
    /// uses. Contour points are the centers of the region's border pixels.
    ///
    /// # Errors
    ///
    /// Returns [`SegError::ShapeMismatch`] if the stack does not match the
    /// series and [`SegError::Assembly`] if the series lacks the Frame of
    /// Reference or the plane geometry needed to place contours.
    pub fn assemble(
        segments: &[PresentSegment],
        frames: &FrameStack,
        series: &ImageSeries,
        options: &SegOptions,
    ) -> Result<StructureSetObject, SegError> {
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

        let reference = series.reference();
        let frame_of_reference = reference
            .element(tags::FRAME_OF_REFERENCE_UID)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|value| value.trim_end_matches(['\0', ' ']).to_string())
            .ok_or_else(|| {
                SegError::Assembly("reference series has no Frame of Reference UID".to_string())
            })?;
        let planes = series
            .images()
            .iter()
            .map(|image| {
                image.plane.ok_or_else(|| {
                    SegError::Assembly(format!(
                        "image {} lacks position, orientation or pixel spacing",
                        image.sop_instance_uid
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let DerivedSeries {
            mut dataset,
            series_instance_uid,
            sop_instance_uid,
            series_number,
        } = DerivedSeries::new(
            series,
            options,
            uids::RT_STRUCTURE_SET_STORAGE,
            "RTSTRUCT",
            "Struct",
        )?;
        let now = Local::now();

        let label: String = options.algorithm_name.chars().take(16).collect();
        dataset.put(text(tags::STRUCTURE_SET_LABEL, VR::SH, label));
        dataset.put(text(tags::STRUCTURE_SET_DATE, VR::DA, now.format("%Y%m%d").to_string()));
        dataset.put(text(tags::STRUCTURE_SET_TIME, VR::TM, now.format("%H%M%S%.3f").to_string()));
        dataset.put(seq(
            tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE,
            vec![Self::referenced_frame_of_reference(series, &frame_of_reference)],
        ));
        dataset.put(seq(
            tags::STRUCTURE_SET_ROI_SEQUENCE,
            segments
                .iter()
                .map(|segment| {
                    InMemDicomObject::from_element_iter([
                        text(tags::ROI_NUMBER, VR::IS, segment.number.to_string()),
                        uid(tags::REFERENCED_FRAME_OF_REFERENCE_UID, &frame_of_reference),
                        text(tags::ROI_NAME, VR::LO, &segment.name),
                        text(tags::ROI_GENERATION_ALGORITHM, VR::CS, "AUTOMATIC"),
                    ])
                })
                .collect(),
        ));

        let mut number_of_contours = 0;
        let mut roi_contours = Vec::with_capacity(segments.len());
        for (index, segment) in segments.iter().enumerate() {
            let contours = Self::segment_contours(segment, frames, series, &planes)?;
            number_of_contours += contours.len();

            let color = ROI_COLORS[index % ROI_COLORS.len()];
            roi_contours.push(InMemDicomObject::from_element_iter([
                DataElement::new(
                    tags::ROI_DISPLAY_COLOR,
                    VR::IS,
                    PrimitiveValue::Strs(color.iter().map(u8::to_string).collect()),
                ),
                seq(tags::CONTOUR_SEQUENCE, contours),
                text(tags::REFERENCED_ROI_NUMBER, VR::IS, segment.number.to_string()),
            ]));
        }
        dataset.put(seq(tags::ROI_CONTOUR_SEQUENCE, roi_contours));

        dataset.put(seq(
            tags::RTROI_OBSERVATIONS_SEQUENCE,
            segments
                .iter()
                .map(|segment| {
                    InMemDicomObject::from_element_iter([
                        text(tags::OBSERVATION_NUMBER, VR::IS, segment.number.to_string()),
                        text(tags::REFERENCED_ROI_NUMBER, VR::IS, segment.number.to_string()),
                        text(tags::RTROI_INTERPRETED_TYPE, VR::CS, "ORGAN"),
                        text(tags::ROI_INTERPRETER, VR::PN, ""),
                    ])
                })
                .collect(),
        ));
        dataset.put(text(tags::APPROVAL_STATUS, VR::CS, "UNAPPROVED"));

        debug!(
            rois = segments.len(),
            contours = number_of_contours,
            series_number,
            "assembled structure set"
        );

        Ok(StructureSetObject {
            dataset: with_file_meta(dataset)?,
            series_instance_uid,
            sop_instance_uid,
            number_of_contours,
        })
    }

    fn referenced_frame_of_reference(
        series: &ImageSeries,
        frame_of_reference: &str,
    ) -> InMemDicomObject {
        let reference = series.reference();

        let mut referenced_series = InMemDicomObject::new_empty();
        if let Ok(element) = reference.element(tags::SERIES_INSTANCE_UID) {
            referenced_series.put(element.clone());
        }
        referenced_series.put(seq(
            tags::CONTOUR_IMAGE_SEQUENCE,
            series.images().iter().map(image_reference).collect(),
        ));

        let mut study = InMemDicomObject::new_empty();
        study.put(uid(tags::REFERENCED_SOP_CLASS_UID, uids::DETACHED_STUDY_MANAGEMENT));
        if let Some(study_uid) = reference
            .element(tags::STUDY_INSTANCE_UID)
            .ok()
            .and_then(|e| e.to_str().ok())
        {
            study.put(uid(
                tags::REFERENCED_SOP_INSTANCE_UID,
                study_uid.trim_end_matches(['\0', ' ']),
            ));
        }
        study.put(seq(tags::RT_REFERENCED_SERIES_SEQUENCE, vec![referenced_series]));

        InMemDicomObject::from_element_iter([
            uid(tags::FRAME_OF_REFERENCE_UID, frame_of_reference),
            seq(tags::RT_REFERENCED_STUDY_SEQUENCE, vec![study]),
        ])
    }

    /// Contour items of one segment over all frames.
    fn segment_contours(
        segment: &PresentSegment,
        frames: &FrameStack,
        series: &ImageSeries,
        planes: &[ImagePlane],
    ) -> Result<Vec<InMemDicomObject>, SegError> {
        let mask = frames.mask(segment.label);
        let mut items = Vec::new();
        for ((plane_mask, image), plane) in mask
            .axis_iter(Axis(0))
            .zip(series.images())
            .zip(planes)
        {
            for contour in trace_outlines(plane_mask)? {
                items.push(contour_item(image, plane, &contour));
            }
        }
        Ok(items)
    }
}

/// Border pixels of every region in a binary frame.
fn trace_outlines(mask: ArrayView2<'_, u8>) -> Result<Vec<Contour<u32>>, SegError> {
    if mask.iter().all(|&v| v == 0) {
        return Ok(Vec::new());
    }

    let (rows, columns) = mask.dim();
    let width = u32::try_from(columns)
        .map_err(|_| SegError::Assembly(format!("{columns} columns exceed the image limit")))?;
    let height = u32::try_from(rows)
        .map_err(|_| SegError::Assembly(format!("{rows} rows exceed the image limit")))?;

    let image = GrayImage::from_fn(width, height, |x, y| {
        Luma([mask[[y as usize, x as usize]].saturating_mul(u8::MAX)])
    });
    Ok(find_contours::<u32>(&image))
}

fn contour_item(
    image: &SourceImage,
    plane: &ImagePlane,
    contour: &Contour<u32>,
) -> InMemDicomObject {
    let points = contour.points.len();
    let data = contour
        .points
        .iter()
        .flat_map(|point| plane.to_patient(f64::from(point.y), f64::from(point.x)))
        .map(decimal_string)
        .collect();

    InMemDicomObject::from_element_iter([
        seq(tags::CONTOUR_IMAGE_SEQUENCE, vec![image_reference(image)]),
        text(
            tags::CONTOUR_GEOMETRIC_TYPE,
            VR::CS,
            if points == 1 { "POINT" } else { "CLOSED_PLANAR" },
        ),
        text(tags::NUMBER_OF_CONTOUR_POINTS, VR::IS, points.to_string()),
        DataElement::new(tags::CONTOUR_DATA, VR::DS, PrimitiveValue::Strs(data)),
    ])
}

fn image_reference(image: &SourceImage) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        uid(tags::REFERENCED_SOP_CLASS_UID, &image.sop_class_uid),
        uid(tags::REFERENCED_SOP_INSTANCE_UID, &image.sop_instance_uid),
    ])
}

/// DS value with at most four decimals and no trailing zeros.
fn decimal_string(value: f64) -> String {
    let formatted = format!("{value:.4}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    match trimmed {
        "-0" => "0".to_string(),
        other => other.to_string(),
    }
}
