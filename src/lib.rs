//! # nii2seg
//!
//! This crate converts a NIfTI label volume (a segmentation derived from a
//! medical scan) into DICOM-SEG objects that stay linked to the DICOM slices
//! the segmentation was derived from.
//!
//! A conversion run:
//!  - loads a dcmqi-style segment mapping and validates it against the
//!    mapping schema
//!  - reads the label volume; its last axis is the plane index
//!  - sorts the source slices by an ordering key (InstanceNumber by default)
//!    so that sorted slice `i` corresponds to plane `i`
//!  - checks that every label in the volume has a segment definition
//!  - encodes either one object per labelled plane (single-layer) or one
//!    object for the whole volume (multi-layer) into `<volume dir>/dicomseg/`
//!
//! The schema validator and the encoder sit behind the [`MappingValidator`]
//! and [`SegmentationEncoder`] traits. [`DcmqiSchema`] and [`SegWriter`] are
//! the defaults.
//!
//! Known limitations:
//!   - Slices from more than one series are rejected, not separated
//!   - Overlapping-class (multi-label) segmentations are not supported
//!   - Files written before a failure are not cleaned up
//!
//! # Examples
//!
//! ```no_run
//! # use nii2seg::Converter;
//! let written = Converter::default()
//!     .convert_directory("case/segmentation.nii.gz", "case/mapping.json", "case/dicom", false)
//!     .expect("should have converted the segmentation");
//! for path in written {
//!     println!("{}", path.display());
//! }
//! ```

pub mod converter;
pub mod encoder;
pub mod enums;
pub mod error;
pub mod labels;
pub mod mapping;
pub mod seg_writer;
pub mod source;
pub mod volume;

pub use converter::{Converter, ConverterOptions, OUTPUT_DIR_NAME};
pub use encoder::{OutputObject, PlaneEncoder, SegmentationEncoder};
pub use enums::{OutputStrategy, SegmentationType, SortBy};
pub use error::{ConversionError, Result};
pub use labels::check_labels;
pub use mapping::{DcmqiSchema, MappingValidator, SegmentDefinition, SegmentTemplate, load_template};
pub use seg_writer::SegWriter;
pub use source::{SliceResolver, SortedSliceSequence, SourceSlice, collect_dicom_files};
pub use volume::LabelVolume;
