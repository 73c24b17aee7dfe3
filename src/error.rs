use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Resource not found: {}", .0.display())]
    MissingResource(PathBuf),

    #[error("Segmentation mapping {} does not conform to the mapping schema: {reason}", .path.display())]
    SchemaViolation { path: PathBuf, reason: String },

    #[error("Found {slices} source slices but the volume has {planes} planes")]
    CardinalityMismatch { slices: usize, planes: usize },

    #[error("Source slices cannot be ordered, folder has multiple series: {0}")]
    HeterogeneousSeries(String),

    #[error("Label {0} present in the volume has no segment definition")]
    MissingSegmentDefinition(u8),

    #[error("Mapping declares {declared} segments but the volume holds {present} distinct labels")]
    CapacityMismatch { declared: usize, present: usize },

    #[error("Not implemented: {0}")]
    Unimplemented(&'static str),

    #[error("Encoding failed: {0}")]
    EncodeFailure(String),

    #[error("No DICOM files found in {}", .0.display())]
    NoSourceSlices(PathBuf),

    #[error("Invalid label volume: {0}")]
    InvalidVolume(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),

    #[error("DICOM write error: {0}")]
    DicomWrite(#[from] dicom::object::WriteError),

    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),
}

pub type Result<T> = std::result::Result<T, ConversionError>;
