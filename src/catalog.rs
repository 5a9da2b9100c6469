//! Label catalogs and the selection of segments that end up in the output.

use crate::{enums::PropertyTypeCoding, error::SegError};

use ndarray::ArrayView3;
use std::collections::HashSet;

/// Ordered label → name mapping of a segmentation task.
///
/// Iteration follows insertion order, which fixes the output segment
/// numbering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelCatalog {
    entries: Vec<(u16, String)>,
}

impl LabelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, replacing the name of an existing label in place.
    pub fn insert(&mut self, label: u16, name: impl Into<String>) {
        let name = name.into();
        match self.entries.iter_mut().find(|(l, _)| *l == label) {
            Some(entry) => entry.1 = name,
            None => self.entries.push((label, name)),
        }
    }

    /// Catalog of a task's class list, numbered from 1 in list order.
    pub fn from_class_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names
            .into_iter()
            .zip(1u16..)
            .map(|(name, label)| (label, name.into()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &str)> {
        self.entries.iter().map(|(label, name)| (*label, name.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(u16, S)> for LabelCatalog {
    fn from_iter<T: IntoIterator<Item = (u16, S)>>(iter: T) -> Self {
        let mut catalog = LabelCatalog::new();
        for (label, name) in iter {
            catalog.insert(label, name);
        }
        catalog
    }
}

/// A coded concept as carried in DICOM code sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Code {
    pub value: String,
    pub scheme: String,
    pub meaning: String,
}

impl Code {
    pub fn new(value: &str, scheme: &str, meaning: &str) -> Self {
        Self {
            value: value.to_string(),
            scheme: scheme.to_string(),
            meaning: meaning.to_string(),
        }
    }

    pub fn tissue() -> Self {
        Code::new("85756007", "SCT", "Tissue")
    }

    pub fn connective_tissue() -> Self {
        Code::new("181769001", "SCT", "Connective tissue")
    }

    /// Legacy SRT tissue code carrying a free-text meaning.
    pub fn named_tissue(meaning: &str) -> Self {
        Code::new("T-D0050", "SRT", meaning)
    }
}

/// A catalog entry that made it into the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentSegment {
    /// Segment number in the output object, 1-based and contiguous.
    pub number: u16,
    /// Label value in the label volume.
    pub label: u16,
    pub name: String,
    pub category: Code,
    pub property_type: Code,
}

/// Whether a catalog name marks an auxiliary class that is never exported.
fn is_auxiliary(name: &str) -> bool {
    name.chars().next().is_none_or(char::is_lowercase)
}

/// Select the catalog entries that occur in `labels` and number them 1..K.
///
/// Background (label 0) and names starting with a lowercase character are
/// skipped. `labels` is the in-plane rotated label volume.
///
/// # Errors
///
/// Returns [`SegError::EmptySegmentation`] if nothing is left.
pub fn build_present_segments(
    catalog: &LabelCatalog,
    labels: ArrayView3<'_, u16>,
    coding: PropertyTypeCoding,
) -> Result<Vec<PresentSegment>, SegError> {
    let occurring: HashSet<u16> = labels.iter().copied().collect();

    let segments: Vec<_> = catalog
        .iter()
        .filter(|&(label, name)| label != 0 && !is_auxiliary(name))
        .filter(|(label, _)| occurring.contains(label))
        .zip(1u16..)
        .map(|((label, name), number)| PresentSegment {
            number,
            label,
            name: name.to_string(),
            category: Code::tissue(),
            property_type: match coding {
                PropertyTypeCoding::Generic => Code::connective_tissue(),
                PropertyTypeCoding::FromName => Code::named_tissue(name),
            },
        })
        .collect();

    if segments.is_empty() {
        return Err(SegError::EmptySegmentation);
    }
    Ok(segments)
}
