use dicom::core::{DataElement, PrimitiveValue, VR, dicom_value};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject, open_file};
use dicom_dictionary_std::{tags, uids};
use dicom_seg::{
    LabelCatalog, LabelVolume, OutputFormat, SegError, SegOptions, SegmentationFlavor,
    SeriesNumbering, export_segmentation,
};
use ndarray::Array3;
use std::path::Path;

const ROWS: u16 = 4;
const COLUMNS: u16 = 6;

fn write_ct_slice(dir: &Path, file_name: &str, instance_number: i32) {
    let object = InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(uids::CT_IMAGE_STORAGE),
        ),
        DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(format!("1.2.826.0.1.3680043.8.498.{instance_number}")),
        ),
        DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from("Doe^Jane")),
        DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("P-001")),
        DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from("1.2.826.0.1.3680043.8.498.100"),
        ),
        DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from("1.2.826.0.1.3680043.8.498.200"),
        ),
        DataElement::new(
            tags::FRAME_OF_REFERENCE_UID,
            VR::UI,
            PrimitiveValue::from("1.2.826.0.1.3680043.8.498.300"),
        ),
        DataElement::new(tags::SERIES_NUMBER, VR::IS, PrimitiveValue::from("3")),
        DataElement::new(tags::SERIES_DESCRIPTION, VR::LO, PrimitiveValue::from("Abdomen")),
        DataElement::new(
            tags::INSTANCE_NUMBER,
            VR::IS,
            PrimitiveValue::from(instance_number.to_string()),
        ),
        DataElement::new(
            tags::IMAGE_POSITION_PATIENT,
            VR::DS,
            PrimitiveValue::from(format!("0\\0\\{}", instance_number * 5)),
        ),
        DataElement::new(
            tags::IMAGE_ORIENTATION_PATIENT,
            VR::DS,
            dicom_value!(Strs, ["1", "0", "0", "0", "1", "0"]),
        ),
        DataElement::new(tags::PIXEL_SPACING, VR::DS, dicom_value!(Strs, ["0.8", "0.8"])),
        DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(ROWS)),
        DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(COLUMNS)),
    ]);

    object
        .with_meta(FileMetaTableBuilder::new().transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN))
        .unwrap()
        .write_to_file(dir.join(file_name))
        .unwrap();
}

/// Three CT slices written out of order, one in a subdirectory, plus a
/// non-DICOM sidecar file.
fn ct_series_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    write_ct_slice(dir.path(), "c.dcm", 3);
    write_ct_slice(dir.path(), "a.dcm", 1);
    write_ct_slice(&dir.path().join("sub"), "b", 2);
    std::fs::write(dir.path().join("DICOMDIR.txt"), "sidecar").unwrap();
    dir
}

/// Labels in engine layout (X = columns, Y = rows, Z = slices).
fn labels() -> LabelVolume {
    let mut data = Array3::<u16>::zeros((COLUMNS as usize, ROWS as usize, 3));
    data[[0, 0, 0]] = 1;
    data[[5, 3, 2]] = 5;
    data[[2, 1, 1]] = 7;
    LabelVolume::new(data)
}

fn catalog() -> LabelCatalog {
    [(0, "background"), (1, "Liver"), (5, "spleen_internal"), (7, "Kidney")]
        .into_iter()
        .collect()
}

#[test]
fn writes_binary_segmentation_for_present_segments() {
    let series = ct_series_dir();
    let out = tempfile::tempdir().unwrap();
    let output = out.path().join("seg.dcm");

    export_segmentation(&labels(), &catalog(), series.path(), &output, &SegOptions::default())
        .unwrap();

    let seg = open_file(&output).unwrap();
    assert_eq!(
        seg.meta().media_storage_sop_class_uid().trim_end_matches('\0'),
        uids::SEGMENTATION_STORAGE
    );
    let str_of = |tag| {
        seg.element(tag)
            .unwrap()
            .to_str()
            .unwrap()
            .trim_end_matches(['\0', ' '])
            .to_string()
    };
    assert_eq!(str_of(tags::MODALITY), "SEG");
    assert_eq!(str_of(tags::SERIES_DESCRIPTION), "Abdomen Seg");
    assert_eq!(str_of(tags::PATIENT_ID), "P-001");
    assert_eq!(str_of(tags::STUDY_INSTANCE_UID), "1.2.826.0.1.3680043.8.498.100");
    assert_ne!(str_of(tags::SERIES_INSTANCE_UID), "1.2.826.0.1.3680043.8.498.200");
    assert_eq!(
        seg.element(tags::SERIES_NUMBER).unwrap().to_int::<i32>().unwrap(),
        3
    );

    let segments = seg.element(tags::SEGMENT_SEQUENCE).unwrap().items().unwrap();
    let numbered: Vec<_> = segments
        .iter()
        .map(|item| {
            (
                item.element(tags::SEGMENT_NUMBER).unwrap().to_int::<u16>().unwrap(),
                item.element(tags::SEGMENT_LABEL)
                    .unwrap()
                    .to_str()
                    .unwrap()
                    .trim()
                    .to_string(),
            )
        })
        .collect();
    assert_eq!(numbered, vec![(1, "Liver".to_string()), (2, "Kidney".to_string())]);

    // 2 segments x 3 slices
    assert_eq!(
        seg.element(tags::NUMBER_OF_FRAMES).unwrap().to_int::<u32>().unwrap(),
        6
    );

    let referenced: Vec<_> = seg
        .element(tags::REFERENCED_SERIES_SEQUENCE)
        .unwrap()
        .items()
        .unwrap()[0]
        .element(tags::REFERENCED_INSTANCE_SEQUENCE)
        .unwrap()
        .items()
        .unwrap()
        .iter()
        .map(|item| {
            item.element(tags::REFERENCED_SOP_INSTANCE_UID)
                .unwrap()
                .to_str()
                .unwrap()
                .trim_end_matches('\0')
                .to_string()
        })
        .collect();
    assert_eq!(
        referenced,
        vec![
            "1.2.826.0.1.3680043.8.498.1",
            "1.2.826.0.1.3680043.8.498.2",
            "1.2.826.0.1.3680043.8.498.3",
        ]
    );
}

#[test]
fn labelmap_with_series_offset() {
    let series = ct_series_dir();
    let out = tempfile::tempdir().unwrap();
    let output = out.path().join("seg.dcm");
    let options = SegOptions {
        flavor: SegmentationFlavor::Labelmap,
        series_numbering: SeriesNumbering::Offset(1000),
        ..SegOptions::default()
    };

    export_segmentation(&labels(), &catalog(), series.path(), &output, &options).unwrap();

    let seg = open_file(&output).unwrap();
    assert_eq!(
        seg.element(tags::SERIES_NUMBER).unwrap().to_int::<i32>().unwrap(),
        1003
    );
    assert_eq!(
        seg.element(tags::NUMBER_OF_FRAMES).unwrap().to_int::<u32>().unwrap(),
        3
    );

    // Liver at engine (x=0, y=0, z=0): rotated (row 3, col 0, slice 0),
    // which is frame 2. Kidney at (x=2, y=1, z=1): rotated (row 2, col 2),
    // frame 1.
    let pixels = seg.element(tags::PIXEL_DATA).unwrap().to_bytes().unwrap();
    let frame_len = usize::from(ROWS) * usize::from(COLUMNS);
    assert_eq!(pixels.len(), 3 * frame_len);
    assert_eq!(pixels[2 * frame_len + 3 * usize::from(COLUMNS)], 1);
    assert_eq!(pixels[frame_len + 2 * usize::from(COLUMNS) + 2], 2);
    assert_eq!(pixels.iter().filter(|&&v| v != 0).count(), 2);
}

#[test]
fn writes_rt_structure_set_for_present_segments() {
    let series = ct_series_dir();
    let out = tempfile::tempdir().unwrap();
    let output = out.path().join("rtstruct.dcm");
    let options = SegOptions {
        output_format: OutputFormat::RtStruct,
        ..SegOptions::default()
    };

    export_segmentation(&labels(), &catalog(), series.path(), &output, &options).unwrap();

    let rt = open_file(&output).unwrap();
    assert_eq!(
        rt.meta().media_storage_sop_class_uid().trim_end_matches('\0'),
        uids::RT_STRUCTURE_SET_STORAGE
    );
    assert_eq!(
        rt.element(tags::MODALITY).unwrap().to_str().unwrap().trim(),
        "RTSTRUCT"
    );

    let names: Vec<_> = rt
        .element(tags::STRUCTURE_SET_ROI_SEQUENCE)
        .unwrap()
        .items()
        .unwrap()
        .iter()
        .map(|roi| roi.element(tags::ROI_NAME).unwrap().to_str().unwrap().trim().to_string())
        .collect();
    assert_eq!(names, ["Liver", "Kidney"]);

    // Liver is a single voxel in frame 2, the image with instance number 3 at z = 15
    let liver = &rt.element(tags::ROI_CONTOUR_SEQUENCE).unwrap().items().unwrap()[0];
    let contours = liver.element(tags::CONTOUR_SEQUENCE).unwrap().items().unwrap();
    assert_eq!(contours.len(), 1);
    let data = contours[0]
        .element(tags::CONTOUR_DATA)
        .unwrap()
        .to_multi_float64()
        .unwrap();
    assert_eq!(data.len(), 3);
    assert_eq!(data[2], 15.0);
    let image = &contours[0]
        .element(tags::CONTOUR_IMAGE_SEQUENCE)
        .unwrap()
        .items()
        .unwrap()[0];
    assert_eq!(
        image
            .element(tags::REFERENCED_SOP_INSTANCE_UID)
            .unwrap()
            .to_str()
            .unwrap()
            .trim_end_matches('\0'),
        "1.2.826.0.1.3680043.8.498.3"
    );
}

#[test]
fn empty_segmentation_writes_nothing() {
    let series = ct_series_dir();
    let out = tempfile::tempdir().unwrap();
    let output = out.path().join("seg.dcm");
    let catalog: LabelCatalog = [(5, "spleen_internal"), (9, "Pancreas")]
        .into_iter()
        .collect();

    let err = export_segmentation(&labels(), &catalog, series.path(), &output, &SegOptions::default())
        .unwrap_err();

    assert!(matches!(err, SegError::EmptySegmentation));
    assert!(!output.exists());
}

#[test]
fn slice_count_mismatch_writes_nothing() {
    let series = ct_series_dir();
    let out = tempfile::tempdir().unwrap();
    let output = out.path().join("seg.dcm");
    let labels = LabelVolume::new(Array3::<u16>::ones((COLUMNS as usize, ROWS as usize, 4)));

    let err = export_segmentation(&labels, &catalog(), series.path(), &output, &SegOptions::default())
        .unwrap_err();

    assert!(matches!(
        err,
        SegError::ShapeMismatch {
            expected: (6, 4, 3),
            actual: (6, 4, 4)
        }
    ));
    assert!(!output.exists());
}

#[test]
fn directory_without_images_has_no_series() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("readme.txt"), "nothing here").unwrap();
    let output = dir.path().join("seg.dcm");

    let err = export_segmentation(&labels(), &catalog(), dir.path(), &output, &SegOptions::default())
        .unwrap_err();

    assert!(matches!(err, SegError::NoSeriesFound { .. }));
    assert!(!output.exists());
}
