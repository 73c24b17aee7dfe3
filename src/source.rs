use crate::{
    enums::SortBy,
    error::{ConversionError, Result},
    volume::LabelVolume,
};

use dicom::object::{DefaultDicomObject, InMemDicomObject, OpenFileOptions};
use dicom_dictionary_std::tags;
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

/// One source scan slice and its ordering key
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSlice {
    pub path: PathBuf,
    pub ordering_key: f64,
}

impl SourceSlice {
    /// Read the slice's header, skipping pixel data
    pub fn read_metadata(&self) -> Result<InMemDicomObject> {
        Ok(open_header(&self.path)?.into_inner())
    }

    pub fn file_name(&self) -> Option<&std::ffi::OsStr> {
        self.path.file_name()
    }
}

/// Source slices in ascending ordering key, one per volume plane
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortedSliceSequence {
    slices: Vec<SourceSlice>,
}

impl SortedSliceSequence {
    pub fn slices(&self) -> &[SourceSlice] {
        &self.slices
    }

    pub fn get(&self, plane: usize) -> Option<&SourceSlice> {
        self.slices.get(plane)
    }

    pub fn first(&self) -> Option<&SourceSlice> {
        self.slices.first()
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.slices.iter().map(|slice| slice.path.as_path())
    }
}

pub struct SliceResolver;

impl SliceResolver {
    /// Match source slices to the planes of a label volume
    ///
    /// # Arguments
    ///
    /// * `paths` - Source DICOM slices, in any order
    /// * `volume` - Volume whose last axis the slices must cover
    /// * `sort_by` - Field holding the ordering key
    ///
    /// # Errors
    ///
    /// Returns `CardinalityMismatch` if the slice count differs from the
    /// plane count, `MissingResource` for absent files and
    /// `HeterogeneousSeries` if the slices cannot be put in one order.
    pub fn resolve(
        paths: &[impl AsRef<Path>],
        volume: &LabelVolume,
        sort_by: SortBy,
    ) -> Result<SortedSliceSequence> {
        let planes = volume.plane_count();
        if paths.len() != planes {
            return Err(ConversionError::CardinalityMismatch {
                slices: paths.len(),
                planes,
            });
        }

        let mut series = BTreeSet::new();
        let mut keyed = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let header = open_header(path)?;
            if let Some(uid) = header
                .element(tags::SERIES_INSTANCE_UID)
                .ok()
                .and_then(|e| e.to_str().ok())
            {
                series.insert(uid.trim_end_matches('\0').trim().to_string());
            }
            let key = Self::get_sort_order(&header, sort_by).ok_or_else(|| {
                ConversionError::HeterogeneousSeries(format!(
                    "{} has no usable {sort_by:?}",
                    path.display()
                ))
            })?;
            keyed.push((key, path.to_path_buf()));
        }

        if series.len() > 1 {
            return Err(ConversionError::HeterogeneousSeries(format!(
                "{} series instance UIDs",
                series.len()
            )));
        }

        let sequence = Self::order_slices(keyed);
        debug!(slices = sequence.len(), ?sort_by, "resolved slice order");
        Ok(sequence)
    }

    /// Stable sort by ordering key; equal keys keep their input order
    pub fn order_slices(keyed: Vec<(f64, PathBuf)>) -> SortedSliceSequence {
        let mut slices: Vec<_> = keyed
            .into_iter()
            .map(|(ordering_key, path)| SourceSlice { path, ordering_key })
            .collect();
        slices.sort_by(|a, b| a.ordering_key.total_cmp(&b.ordering_key));
        SortedSliceSequence { slices }
    }

    fn get_sort_order(dicom_object: &InMemDicomObject, sort_by: SortBy) -> Option<f64> {
        let key = match sort_by {
            SortBy::ImagePositionPatient => dicom_object
                .element(tags::IMAGE_POSITION_PATIENT)
                .ok()?
                .to_multi_float64()
                .ok()?
                .get(2)
                .copied(),
            SortBy::TablePosition => dicom_object
                .element(tags::TABLE_POSITION)
                .ok()?
                .to_float64()
                .ok(),
            SortBy::InstanceNumber => dicom_object
                .element(tags::INSTANCE_NUMBER)
                .ok()?
                .to_int::<i64>()
                .ok()
                .map(|n| n as f64),
            SortBy::AcquisitionNumber => dicom_object
                .element(tags::ACQUISITION_NUMBER)
                .ok()?
                .to_int::<i64>()
                .ok()
                .map(|n| n as f64),
        }?;
        key.is_finite().then_some(key)
    }
}

fn open_header(path: &Path) -> Result<DefaultDicomObject> {
    if !path.is_file() {
        return Err(ConversionError::MissingResource(path.to_path_buf()));
    }
    Ok(OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(path)?)
}

/// Check whether a file parses as DICOM
pub fn is_dicom_file(path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    path.is_file() && open_header(path).is_ok()
}

/// Collect every DICOM file directly inside `directory`, sorted by path
pub fn collect_dicom_files(directory: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let directory = directory.as_ref();
    if !directory.is_dir() {
        return Err(ConversionError::MissingResource(directory.to_path_buf()));
    }

    let mut paths: Vec<_> = fs::read_dir(directory)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| is_dicom_file(path))
        .collect();

    if paths.is_empty() {
        return Err(ConversionError::NoSourceSlices(directory.to_path_buf()));
    }
    paths.sort();
    Ok(paths)
}

/// Whether the slices declare more than one distinct slice thickness
pub fn has_variable_slice_thickness(paths: &[impl AsRef<Path>]) -> Result<bool> {
    let mut thicknesses = BTreeSet::new();
    for path in paths {
        let header = open_header(path.as_ref())?;
        let thickness = header
            .element(tags::SLICE_THICKNESS)
            .ok()
            .and_then(|e| e.to_float64().ok())
            .map(f64::to_bits);
        thicknesses.insert(thickness);
    }
    Ok(thicknesses.len() > 1)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use dicom::core::{DataElement, PrimitiveValue, VR, dicom_value};
    use dicom::object::FileMetaTableBuilder;
    use ndarray::Array3;
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

    pub(crate) const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

    #[derive(Clone, Default)]
    pub(crate) struct SliceFixture {
        pub instance_number: Option<i32>,
        pub position_z: Option<f64>,
        pub acquisition_time: Option<&'static str>,
        pub series_uid: &'static str,
        pub slice_thickness: Option<&'static str>,
    }

    impl SliceFixture {
        pub(crate) fn numbered(instance_number: i32) -> Self {
            Self {
                instance_number: Some(instance_number),
                series_uid: "1.2.3.4",
                ..Default::default()
            }
        }

        pub(crate) fn write(&self, path: &Path) {
            let sop_instance = format!("1.2.3.4.{}", NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed));
            let mut obj = InMemDicomObject::from_element_iter([
                DataElement::new(
                    tags::SOP_CLASS_UID,
                    VR::UI,
                    PrimitiveValue::from(CT_IMAGE_STORAGE),
                ),
                DataElement::new(
                    tags::SOP_INSTANCE_UID,
                    VR::UI,
                    PrimitiveValue::from(sop_instance.as_str()),
                ),
                DataElement::new(
                    tags::SERIES_INSTANCE_UID,
                    VR::UI,
                    PrimitiveValue::from(self.series_uid),
                ),
                DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3")),
                DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("PAT-1")),
                DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")),
            ]);
            if let Some(n) = self.instance_number {
                obj.put(DataElement::new(
                    tags::INSTANCE_NUMBER,
                    VR::IS,
                    PrimitiveValue::from(n.to_string()),
                ));
            }
            if let Some(z) = self.position_z {
                obj.put(DataElement::new(
                    tags::IMAGE_POSITION_PATIENT,
                    VR::DS,
                    dicom_value!(Strs, ["-100".to_string(), "-100".to_string(), z.to_string()]),
                ));
            }
            if let Some(time) = self.acquisition_time {
                obj.put(DataElement::new(
                    tags::ACQUISITION_TIME,
                    VR::TM,
                    PrimitiveValue::from(time),
                ));
            }
            if let Some(thickness) = self.slice_thickness {
                obj.put(DataElement::new(
                    tags::SLICE_THICKNESS,
                    VR::DS,
                    PrimitiveValue::from(thickness),
                ));
            }
            let file = obj
                .with_meta(
                    FileMetaTableBuilder::new()
                        .media_storage_sop_class_uid(CT_IMAGE_STORAGE)
                        .media_storage_sop_instance_uid(sop_instance.as_str())
                        .transfer_syntax("1.2.840.10008.1.2.1"),
                )
                .expect("file meta");
            file.write_to_file(path).expect("write slice");
        }
    }

    fn volume(planes: usize) -> LabelVolume {
        LabelVolume::new(Array3::zeros((2, 2, planes)))
    }

    fn write_numbered(dir: &Path, names: &[&str], numbers: &[i32]) -> Vec<PathBuf> {
        names
            .iter()
            .zip(numbers)
            .map(|(name, &n)| {
                let path = dir.join(name);
                SliceFixture::numbered(n).write(&path);
                path
            })
            .collect()
    }

    #[test]
    fn stable_order_keeps_ties_in_input_order() {
        let keyed = vec![
            (5.0, PathBuf::from("a")),
            (3.0, PathBuf::from("b")),
            (3.0, PathBuf::from("c")),
            (1.0, PathBuf::from("d")),
        ];
        let sorted = SliceResolver::order_slices(keyed);
        let names: Vec<_> = sorted.paths().map(|p| p.to_str().unwrap_or_default()).collect();
        assert_eq!(names, vec!["d", "b", "c", "a"]);
        assert!(!sorted.is_empty());
        assert_eq!(sorted.get(1).map(|s| s.path.as_path()), Some(Path::new("b")));
        assert!(sorted.get(4).is_none());

        assert!(SliceResolver::order_slices(Vec::new()).is_empty());
    }

    #[test]
    fn resolves_by_instance_number() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = write_numbered(dir.path(), &["a.dcm", "b.dcm", "c.dcm", "d.dcm"], &[5, 3, 3, 1]);

        let sorted = SliceResolver::resolve(&paths, &volume(4), SortBy::InstanceNumber)
            .expect("resolved");
        let names: Vec<_> = sorted
            .slices()
            .iter()
            .map(|s| s.file_name().and_then(|n| n.to_str()).unwrap_or_default())
            .collect();
        assert_eq!(names, vec!["d.dcm", "b.dcm", "c.dcm", "a.dcm"]);
        assert_eq!(sorted.first().map(|s| s.ordering_key), Some(1.0));
    }

    #[test]
    fn cardinality_must_match_plane_axis() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = write_numbered(dir.path(), &["a.dcm", "b.dcm", "c.dcm"], &[1, 2, 3]);

        assert!(SliceResolver::resolve(&paths, &volume(3), SortBy::InstanceNumber).is_ok());
        let err = SliceResolver::resolve(&paths[1..], &volume(3), SortBy::InstanceNumber)
            .unwrap_err();
        assert!(matches!(
            err,
            ConversionError::CardinalityMismatch { slices: 2, planes: 3 }
        ));

        // a count matching another axis is still a mismatch
        let other_axis = LabelVolume::new(Array3::zeros((3, 3, 2)));
        assert!(matches!(
            SliceResolver::resolve(&paths, &other_axis, SortBy::InstanceNumber),
            Err(ConversionError::CardinalityMismatch { slices: 3, planes: 2 })
        ));
    }

    #[test]
    fn resolves_by_position() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut paths = Vec::new();
        for (name, z) in [("a.dcm", 10.0), ("b.dcm", -2.5), ("c.dcm", 4.0)] {
            let path = dir.path().join(name);
            SliceFixture {
                position_z: Some(z),
                series_uid: "1.2.3.4",
                ..Default::default()
            }
            .write(&path);
            paths.push(path);
        }
        let sorted = SliceResolver::resolve(&paths, &volume(3), SortBy::ImagePositionPatient)
            .expect("resolved");
        let keys: Vec<_> = sorted.slices().iter().map(|s| s.ordering_key).collect();
        assert_eq!(keys, vec![-2.5, 4.0, 10.0]);
    }

    #[test]
    fn missing_key_is_heterogeneous() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut paths = write_numbered(dir.path(), &["a.dcm"], &[1]);
        let unnumbered = dir.path().join("b.dcm");
        SliceFixture {
            series_uid: "1.2.3.4",
            ..Default::default()
        }
        .write(&unnumbered);
        paths.push(unnumbered);

        assert!(matches!(
            SliceResolver::resolve(&paths, &volume(2), SortBy::InstanceNumber),
            Err(ConversionError::HeterogeneousSeries(_))
        ));
    }

    #[test]
    fn mixed_series_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut paths = write_numbered(dir.path(), &["a.dcm"], &[1]);
        let other = dir.path().join("b.dcm");
        SliceFixture {
            series_uid: "9.9.9",
            ..SliceFixture::numbered(2)
        }
        .write(&other);
        paths.push(other);

        assert!(matches!(
            SliceResolver::resolve(&paths, &volume(2), SortBy::InstanceNumber),
            Err(ConversionError::HeterogeneousSeries(_))
        ));
    }

    #[test]
    fn missing_slice_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = vec![dir.path().join("gone.dcm")];
        assert!(matches!(
            SliceResolver::resolve(&paths, &volume(1), SortBy::InstanceNumber),
            Err(ConversionError::MissingResource(_))
        ));
    }

    #[test]
    fn collects_dicoms_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_numbered(dir.path(), &["IM0002", "IM0001"], &[2, 1]);
        fs::write(dir.path().join("notes.json"), "{}").expect("write");

        let found = collect_dicom_files(dir.path()).expect("dicoms");
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().and_then(|n| n.to_str()).unwrap_or_default())
            .collect();
        assert_eq!(names, vec!["IM0001", "IM0002"]);
        assert!(!is_dicom_file(dir.path().join("notes.json")));
    }

    #[test]
    fn collect_reports_missing_and_empty_directories() {
        assert!(matches!(
            collect_dicom_files("./non-existant-dir"),
            Err(ConversionError::MissingResource(_))
        ));
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("readme.txt"), "hi").expect("write");
        assert!(matches!(
            collect_dicom_files(dir.path()),
            Err(ConversionError::NoSourceSlices(_))
        ));
    }

    #[test]
    fn detects_variable_slice_thickness() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut paths = Vec::new();
        for (name, thickness) in [("a.dcm", "2.5"), ("b.dcm", "2.5"), ("c.dcm", "5.0")] {
            let path = dir.path().join(name);
            SliceFixture {
                slice_thickness: Some(thickness),
                ..SliceFixture::numbered(1)
            }
            .write(&path);
            paths.push(path);
        }
        assert!(!has_variable_slice_thickness(&paths[..2]).expect("uniform"));
        assert!(has_variable_slice_thickness(&paths).expect("variable"));
    }

    #[test]
    fn reads_metadata_without_pixels() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.dcm");
        SliceFixture {
            acquisition_time: Some("101500"),
            ..SliceFixture::numbered(1)
        }
        .write(&path);
        let slice = SourceSlice {
            path,
            ordering_key: 1.0,
        };
        let metadata = slice.read_metadata().expect("metadata");
        let time = metadata
            .element(tags::ACQUISITION_TIME)
            .expect("acquisition time")
            .to_str()
            .expect("string")
            .to_string();
        assert_eq!(time, "101500");
    }
}
