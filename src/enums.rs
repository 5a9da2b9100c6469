use std::{fmt, str::FromStr};

use dicom_dictionary_std::uids;
use thiserror::Error;

/// Source image storage classes accepted as a reference series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Ct,
    Mr,
    Pet,
    /// Nuclear medicine, used for SPECT.
    Nm,
}

impl Modality {
    pub fn from_sop_class_uid(uid: &str) -> Option<Self> {
        match uid.trim_end_matches(['\0', ' ']) {
            uids::CT_IMAGE_STORAGE => Some(Modality::Ct),
            uids::MR_IMAGE_STORAGE => Some(Modality::Mr),
            uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE => Some(Modality::Pet),
            uids::NUCLEAR_MEDICINE_IMAGE_STORAGE => Some(Modality::Nm),
            _ => None,
        }
    }
}

/// Kind of DICOM object written for the present segments.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-frame Segmentation object.
    #[default]
    Seg,
    /// RT Structure Set with one contour-based ROI per segment.
    RtStruct,
}

/// How segments are encoded in the pixel data of the output object.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SegmentationFlavor {
    /// One 1-bit frame per segment and slice.
    #[default]
    Binary,
    /// One frame per slice holding the output segment number of each pixel.
    Labelmap,
}

/// Series number given to the segmentation series.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SeriesNumbering {
    #[default]
    CopySource,
    Offset(i32),
}

impl SeriesNumbering {
    pub const DEFAULT_OFFSET: i32 = 1000;

    /// Series number of the derived series, `None` if the offset pushes it
    /// out of the IS range.
    pub fn apply(self, source: i32) -> Option<i32> {
        match self {
            SeriesNumbering::CopySource => Some(source),
            SeriesNumbering::Offset(offset) => source.checked_add(offset),
        }
    }
}

/// Coding used for the Segmented Property Type of every segment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PropertyTypeCoding {
    /// Fixed SNOMED CT "Connective tissue".
    #[default]
    Generic,
    /// Legacy SRT code whose meaning is the segment label.
    FromName,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    #[default]
    Gpu,
    Cpu,
    Mps,
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Device::Gpu => "gpu",
            Device::Cpu => "cpu",
            Device::Mps => "mps",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl FromStr for Device {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gpu" => Ok(Device::Gpu),
            "cpu" => Ok(Device::Cpu),
            "mps" => Ok(Device::Mps),
            _ => Err(ParseEnumError {
                kind: "device",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! tasks {
    ($($variant:ident => $name:literal),* $(,)?) => {
        /// Segmentation tasks the engine knows how to run.
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        pub enum Task {
            #[default]
            $($variant),*
        }

        impl Task {
            pub const ALL: &'static [Task] = &[$(Task::$variant),*];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(Task::$variant => $name),*
                }
            }
        }

        impl FromStr for Task {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Task::$variant),)*
                    _ => Err(ParseEnumError {
                        kind: "task",
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

tasks! {
    Total => "total",
    Body => "body",
    BodyMr => "body_mr",
    VertebraeMr => "vertebrae_mr",
    LungVessels => "lung_vessels",
    CerebralBleed => "cerebral_bleed",
    HipImplant => "hip_implant",
    CoronaryArteries => "coronary_arteries",
    PleuralPericardEffusion => "pleural_pericard_effusion",
    Test => "test",
    AppendicularBones => "appendicular_bones",
    AppendicularBonesMr => "appendicular_bones_mr",
    TissueTypes => "tissue_types",
    HeartchambersHighres => "heartchambers_highres",
    Face => "face",
    VertebraeBody => "vertebrae_body",
    TotalMr => "total_mr",
    TissueTypesMr => "tissue_types_mr",
    Tissue4Types => "tissue_4_types",
    FaceMr => "face_mr",
    HeadGlandsCavities => "head_glands_cavities",
    HeadMuscles => "head_muscles",
    HeadneckBonesVessels => "headneck_bones_vessels",
    HeadneckMuscles => "headneck_muscles",
    BrainStructures => "brain_structures",
    LiverVessels => "liver_vessels",
    OculomotorMuscles => "oculomotor_muscles",
    ThighShoulderMuscles => "thigh_shoulder_muscles",
    ThighShoulderMusclesMr => "thigh_shoulder_muscles_mr",
    LungNodules => "lung_nodules",
    KidneyCysts => "kidney_cysts",
    Breasts => "breasts",
    VentricleParts => "ventricle_parts",
    AorticSinuses => "aortic_sinuses",
    LiverSegments => "liver_segments",
    LiverSegmentsMr => "liver_segments_mr",
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_names_round_trip() {
        assert_eq!(Task::ALL.len(), 36);
        for task in Task::ALL {
            assert_eq!(task.as_str().parse::<Task>(), Ok(*task));
        }
        assert!("liver".parse::<Task>().is_err());
    }

    #[test]
    fn series_numbering_policies() {
        assert_eq!(SeriesNumbering::CopySource.apply(7), Some(7));
        assert_eq!(
            SeriesNumbering::Offset(SeriesNumbering::DEFAULT_OFFSET).apply(7),
            Some(1007)
        );
        assert_eq!(SeriesNumbering::Offset(-10).apply(4), Some(-6));
    }

    #[test]
    fn series_number_offset_does_not_overflow() {
        assert_eq!(
            SeriesNumbering::Offset(SeriesNumbering::DEFAULT_OFFSET).apply(2_147_483_000),
            None
        );
        assert_eq!(SeriesNumbering::CopySource.apply(i32::MAX), Some(i32::MAX));
    }

    #[test]
    fn modality_from_uid_ignores_padding() {
        assert_eq!(
            Modality::from_sop_class_uid("1.2.840.10008.5.1.4.1.1.2\0"),
            Some(Modality::Ct)
        );
        assert_eq!(
            Modality::from_sop_class_uid(uids::SEGMENTATION_STORAGE),
            None
        );
    }
}
