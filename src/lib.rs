//! # DICOM segmentation library
//!
//! This crate turns the label volume produced by TotalSegmentator into a
//! DICOM Segmentation object that references the series it was computed
//! from.
//!
//! The reference series is read with the dicom-rs ecosystem. Only CT, MR,
//! PET and SPECT images are accepted and they are ordered by Instance
//! Number. The label volume is expected in the engine's (X, Y, Z) layout
//! and is brought into DICOM row/column and frame order by a fixed
//! transform:
//!  - a quarter turn in-plane
//!  - slices moved to the leading axis
//!  - frame order reversed
//!
//! Only catalog entries that occur in the volume and whose name does not
//! start with a lowercase letter become segments. They are numbered 1..K
//! in catalog order.
//!
//! Two encodings of the pixel data are available, see
//! [`SegmentationFlavor`]. The same segments can instead be written as an
//! RT Structure Set with one contour-based ROI each, see [`OutputFormat`].
//! Output files are written atomically: either the
//! complete object ends up at the requested path, or the path keeps its
//! previous state.
//!
//! # Examples
//!
//! ## Writing a segmentation for an existing label volume
//!
//! ```no_run
//! # use dicom_seg::{LabelCatalog, LabelVolume, SegOptions, export_segmentation};
//! # use std::path::Path;
//! let labels = LabelVolume::from_nifti("segmentations.nii.gz")
//!     .expect("should have read the label volume");
//! let catalog = LabelCatalog::from_class_names(["Spleen", "Kidney right", "Liver"]);
//! export_segmentation(
//!     &labels,
//!     &catalog,
//!     Path::new("dicom"),
//!     Path::new("seg.dcm"),
//!     &SegOptions::default(),
//! )
//! .expect("should have written the segmentation");
//! ```

pub mod assembler;
pub mod catalog;
pub mod engine;
pub mod enums;
pub mod error;
pub mod pipeline;
pub mod rtstruct;
pub mod series_loader;
pub mod volume;
pub mod writer;

pub use assembler::{SegOptions, SegmentationAssembler, SegmentationObject};
pub use catalog::{LabelCatalog, PresentSegment};
pub use enums::{
    Device, OutputFormat, PropertyTypeCoding, SegmentationFlavor, SeriesNumbering, Task,
};
pub use error::SegError;
pub use pipeline::{export_segmentation, segment_dicom_series};
pub use rtstruct::{StructureSetAssembler, StructureSetObject};
pub use series_loader::{ImagePlane, ImageSeries, SeriesLoader};
pub use volume::{FrameStack, LabelVolume};
pub use writer::ContainerWriter;
