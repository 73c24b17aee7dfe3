use crate::{
    encoder::{OutputObject, PlaneEncoder, SegmentationEncoder},
    enums::{OutputStrategy, SegmentationType, SortBy},
    error::{ConversionError, Result},
    labels::check_labels,
    mapping::{DcmqiSchema, MappingValidator, SegmentTemplate, load_template},
    seg_writer::SegWriter,
    source::{SliceResolver, SortedSliceSequence, SourceSlice, collect_dicom_files},
    volume::LabelVolume,
};

use dicom::object::InMemDicomObject;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// Name of the directory created next to the volume for the outputs
pub const OUTPUT_DIR_NAME: &str = "dicomseg";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConverterOptions {
    pub sort_by: SortBy,
    pub segmentation_type: SegmentationType,
}

/// Converts NIfTI label volumes into DICOM-SEG objects
pub struct Converter<E = SegWriter, V = DcmqiSchema> {
    encoder: PlaneEncoder<E>,
    validator: V,
    options: ConverterOptions,
}

impl Default for Converter {
    fn default() -> Self {
        Self::new(SegWriter::default(), DcmqiSchema)
    }
}

impl<E: SegmentationEncoder, V: MappingValidator> Converter<E, V> {
    pub fn new(encoder: E, validator: V) -> Self {
        Self {
            encoder: PlaneEncoder::new(encoder),
            validator,
            options: ConverterOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ConverterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ConverterOptions {
        &self.options
    }

    pub fn encoder(&self) -> &PlaneEncoder<E> {
        &self.encoder
    }

    /// Convert a label volume into DICOM-SEG files
    ///
    /// # Arguments
    ///
    /// * `volume_path` - NIfTI label volume
    /// * `mapping_path` - Segment mapping `.json`
    /// * `slice_paths` - Source DICOM slices, one per volume plane
    /// * `multi_layer` - Write one object for the whole volume instead of
    ///   one per labelled plane
    ///
    /// # Errors
    ///
    /// Any failed step aborts the conversion. Files written before the
    /// failure are left in place.
    pub fn convert(
        &self,
        volume_path: impl AsRef<Path>,
        mapping_path: impl AsRef<Path>,
        slice_paths: &[impl AsRef<Path>],
        multi_layer: bool,
    ) -> Result<Vec<PathBuf>> {
        self.convert_with_strategy(
            volume_path,
            mapping_path,
            slice_paths,
            OutputStrategy::from(multi_layer),
        )
    }

    /// Convert using every DICOM file found directly inside `dicom_dir`
    pub fn convert_directory(
        &self,
        volume_path: impl AsRef<Path>,
        mapping_path: impl AsRef<Path>,
        dicom_dir: impl AsRef<Path>,
        multi_layer: bool,
    ) -> Result<Vec<PathBuf>> {
        let slice_paths = collect_dicom_files(dicom_dir)?;
        self.convert(volume_path, mapping_path, &slice_paths, multi_layer)
    }

    pub fn convert_with_strategy(
        &self,
        volume_path: impl AsRef<Path>,
        mapping_path: impl AsRef<Path>,
        slice_paths: &[impl AsRef<Path>],
        strategy: OutputStrategy,
    ) -> Result<Vec<PathBuf>> {
        let volume_path = volume_path.as_ref();

        let template = load_template(mapping_path, &self.validator)?;
        let volume = LabelVolume::load(volume_path)?;
        let sorted = SliceResolver::resolve(slice_paths, &volume, self.options.sort_by)?;
        check_labels(&template, &volume)?;
        if self.options.segmentation_type == SegmentationType::MultiLabel {
            self.encoder.encode_multilabel(&template, volume.view(), &[])?;
        }

        let output_dir = Self::output_dir(volume_path);
        fs::create_dir_all(&output_dir)?;
        info!(
            volume = %volume_path.display(),
            planes = volume.plane_count(),
            ?strategy,
            "converting segmentation"
        );

        let written = match strategy {
            OutputStrategy::SingleLayer => {
                self.write_single_layer(&template, &volume, &sorted, &output_dir)?
            }
            OutputStrategy::MultiLayer => {
                self.write_multi_layer(&template, &volume, &sorted, &output_dir)?
            }
        };

        info!(outputs = written.len(), dir = %output_dir.display(), "conversion finished");
        Ok(written)
    }

    /// `<parent of volume>/dicomseg`
    pub fn output_dir(volume_path: &Path) -> PathBuf {
        volume_path
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(OUTPUT_DIR_NAME)
    }

    fn write_single_layer(
        &self,
        template: &SegmentTemplate,
        volume: &LabelVolume,
        sorted: &SortedSliceSequence,
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for (index, plane) in volume.planes().enumerate() {
            if !volume.is_plane_labelled(index) {
                debug!(plane = index, "skipping empty plane");
                continue;
            }
            let slice = sorted.get(index).ok_or(ConversionError::CardinalityMismatch {
                slices: sorted.len(),
                planes: volume.plane_count(),
            })?;
            let source = slice.read_metadata()?;
            let output = self.encoder.encode_plane(template, plane, &source)?;
            let path = Self::persist(&output, slice, output_dir)?;
            debug!(plane = index, path = %path.display(), "wrote plane");
            written.push(path);
        }
        Ok(written)
    }

    fn write_multi_layer(
        &self,
        template: &SegmentTemplate,
        volume: &LabelVolume,
        sorted: &SortedSliceSequence,
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let first = sorted
            .first()
            .ok_or_else(|| ConversionError::InvalidVolume("volume has no planes".to_string()))?;
        let sources = Self::read_all_metadata(sorted)?;
        let output = self
            .encoder
            .encode_volume(template, volume.view(), &sources)?;
        Ok(vec![Self::persist(&output, first, output_dir)?])
    }

    fn read_all_metadata(sorted: &SortedSliceSequence) -> Result<Vec<InMemDicomObject>> {
        sorted.slices().iter().map(SourceSlice::read_metadata).collect()
    }

    fn persist(output: &OutputObject, slice: &SourceSlice, output_dir: &Path) -> Result<PathBuf> {
        let name = slice.file_name().ok_or_else(|| {
            ConversionError::MissingResource(slice.path.clone())
        })?;
        let path = output_dir.join(name);
        output.write_to_file(&path)?;
        Ok(path)
    }
}
