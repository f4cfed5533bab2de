//! Shard artifacts on disk
//!
//! A model is persisted as a small JSON descriptor plus one weight blob next
//! to it (`<descriptor>.data`). Every initializer payload lives in the blob at
//! an aligned offset; the descriptor only carries offset/length/checksum.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{GraphError, Result};
use crate::model::{ExternalData, GraphModel, Initializer, TensorData};

/// Payload offsets inside a blob are multiples of this
pub const BLOB_ALIGNMENT: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Keep external references as they are
    DescriptorOnly,
    /// Resolve every external reference into inline bytes
    WithData,
}

/// Blob file name used for a descriptor path
pub fn blob_file_name(descriptor: &Path) -> String {
    let file_name = descriptor
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string());
    format!("{}.data", file_name)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Load a descriptor. With [`LoadMode::WithData`] every external payload is
/// read (relative to the descriptor's directory) and verified.
pub fn load_model(path: impl AsRef<Path>, mode: LoadMode) -> Result<GraphModel> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut model: GraphModel = serde_json::from_reader(std::io::BufReader::new(file))?;

    if mode == LoadMode::WithData {
        let dir = parent_dir(path);
        for init in model.initializers.iter_mut() {
            if init.is_external() {
                let bytes = read_initializer(&dir, init)?;
                init.data = TensorData::Inline(bytes);
            }
        }
    }

    debug!(
        "Loaded {} ({} nodes, {} initializers, {:?})",
        path.display(),
        model.nodes.len(),
        model.initializers.len(),
        mode
    );
    Ok(model)
}

/// Read the payload of one initializer. External payloads are resolved
/// relative to `model_dir`.
pub fn read_initializer(model_dir: &Path, init: &Initializer) -> Result<Vec<u8>> {
    match &init.data {
        TensorData::Inline(bytes) => Ok(bytes.clone()),
        TensorData::External(ext) => {
            let blob_path = model_dir.join(&ext.location);
            let mut file = File::open(&blob_path)?;
            let file_len = file.metadata()?.len();
            if ext.offset.saturating_add(ext.length) > file_len {
                return Err(GraphError::ExternalDataOutOfBounds {
                    name: init.name.clone(),
                    offset: ext.offset,
                    length: ext.length,
                    file_len,
                });
            }

            file.seek(SeekFrom::Start(ext.offset))?;
            let mut bytes = vec![0u8; ext.length as usize];
            file.read_exact(&mut bytes)?;

            if let Some(expected) = &ext.checksum {
                if blake3::hash(&bytes).to_hex().as_str() != expected {
                    return Err(GraphError::ChecksumMismatch(init.name.clone()));
                }
            }
            Ok(bytes)
        }
    }
}

/// Persist `model` at `descriptor`, externalizing every initializer payload
/// into `<descriptor>.data`.
///
/// External payloads already present on `model` are read from `source_dir`.
/// Returns the model as written (all initializers external).
pub fn save_model(
    model: &GraphModel,
    source_dir: Option<&Path>,
    descriptor: impl AsRef<Path>,
) -> Result<GraphModel> {
    let descriptor = descriptor.as_ref();
    let dir = parent_dir(descriptor);
    fs::create_dir_all(&dir)?;

    let location = blob_file_name(descriptor);
    let blob_path = dir.join(&location);
    // The source blob may be the one we are replacing
    let staging_path = dir.join(format!("{}.partial", location));

    let mut saved = model.clone();
    let offset = match write_blob(&mut saved, source_dir, &staging_path, &location) {
        Ok(offset) => offset,
        Err(e) => {
            let _ = fs::remove_file(&staging_path);
            return Err(e);
        }
    };
    fs::rename(&staging_path, &blob_path)?;

    let json = serde_json::to_vec_pretty(&saved)?;
    fs::write(descriptor, json)?;

    info!(
        "💾 Saved {} ({} initializers, {} bytes in {})",
        descriptor.display(),
        saved.initializers.len(),
        offset,
        location
    );
    Ok(saved)
}

/// Write every payload of `model` into `path`, rewriting initializers to
/// point at `location`. Returns the blob length.
fn write_blob(model: &mut GraphModel, source_dir: Option<&Path>, path: &Path, location: &str) -> Result<u64> {
    let mut writer = BufWriter::new(File::create(path)?);
    let mut offset = 0u64;
    for init in model.initializers.iter_mut() {
        let bytes = match (&init.data, source_dir) {
            (TensorData::Inline(bytes), _) => bytes.clone(),
            (TensorData::External(_), Some(src)) => read_initializer(src, init)?,
            (TensorData::External(_), None) => return Err(GraphError::MissingData(init.name.clone())),
        };

        if let Some(expected) = init.expected_len() {
            if expected != bytes.len() {
                return Err(GraphError::InvalidData {
                    name: init.name.clone(),
                    reason: format!("expected {} bytes, found {}", expected, bytes.len()),
                });
            }
        }

        let padding = (BLOB_ALIGNMENT - offset % BLOB_ALIGNMENT) % BLOB_ALIGNMENT;
        writer.write_all(&vec![0u8; padding as usize])?;
        offset += padding;
        writer.write_all(&bytes)?;

        init.data = TensorData::External(ExternalData {
            location: location.to_string(),
            offset,
            length: bytes.len() as u64,
            checksum: Some(blake3::hash(&bytes).to_hex().to_string()),
        });
        offset += bytes.len() as u64;
    }
    writer.flush()?;
    Ok(offset)
}

/// Point every external reference at `location`. Returns how many were changed.
pub fn relocate_external_data(model: &mut GraphModel, location: &str) -> usize {
    let mut changed = 0;
    for init in model.initializers.iter_mut() {
        if let TensorData::External(ext) = &mut init.data {
            if ext.location != location {
                ext.location = location.to_string();
                changed += 1;
            }
        }
    }
    changed
}

/// Rewrite a descriptor in place without touching its blob.
pub fn write_descriptor(model: &GraphModel, descriptor: impl AsRef<Path>) -> Result<()> {
    fs::write(descriptor.as_ref(), serde_json::to_vec_pretty(model)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ElementType, OpNode, ValueInfo};

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("duoshard-artifact-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sample_model() -> GraphModel {
        GraphModel::new("sample")
            .with_input(ValueInfo::unknown("x"))
            .with_initializer(Initializer::from_f32("w", vec![3], &[1.0, 2.0, 3.0]))
            .with_initializer(Initializer::from_i64("idx", vec![2], &[4, 5]))
            .with_node(OpNode::new("Mul", ["x", "w"], ["y"]))
    }

    #[test]
    fn test_save_externalizes_every_payload() {
        let dir = scratch_dir();
        let path = dir.join("sample.graph.json");
        let saved = save_model(&sample_model(), None, &path).unwrap();

        assert!(saved.initializers.iter().all(Initializer::is_external));
        let descriptor = fs::read_to_string(&path).unwrap();
        assert!(descriptor.contains("sample.graph.json.data"));
        assert!(!descriptor.contains("\"inline\""));

        for init in &saved.initializers {
            if let TensorData::External(ext) = &init.data {
                assert_eq!(ext.offset % BLOB_ALIGNMENT, 0);
            }
        }

        let reloaded = load_model(&path, LoadMode::WithData).unwrap();
        assert_eq!(reloaded.initializers, sample_model().initializers);
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_descriptor_only_keeps_references() {
        let dir = scratch_dir();
        let path = dir.join("m.graph.json");
        save_model(&sample_model(), None, &path).unwrap();

        let model = load_model(&path, LoadMode::DescriptorOnly).unwrap();
        assert!(model.initializers.iter().all(Initializer::is_external));

        let w = model.initializer("w").unwrap();
        let bytes = read_initializer(&dir, w).unwrap();
        assert_eq!(bytes.len(), 12);
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_corrupted_blob_is_detected() {
        let dir = scratch_dir();
        let path = dir.join("m.graph.json");
        save_model(&sample_model(), None, &path).unwrap();

        let blob = dir.join("m.graph.json.data");
        let mut bytes = fs::read(&blob).unwrap();
        bytes[0] ^= 0xff;
        fs::write(&blob, bytes).unwrap();

        assert!(matches!(
            load_model(&path, LoadMode::WithData),
            Err(GraphError::ChecksumMismatch(_))
        ));
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_truncated_blob_is_out_of_bounds() {
        let dir = scratch_dir();
        let path = dir.join("m.graph.json");
        save_model(&sample_model(), None, &path).unwrap();
        fs::write(dir.join("m.graph.json.data"), [0u8; 4]).unwrap();

        assert!(matches!(
            load_model(&path, LoadMode::WithData),
            Err(GraphError::ExternalDataOutOfBounds { .. })
        ));
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_resave_from_external_source() {
        let dir = scratch_dir();
        let first = dir.join("a.graph.json");
        let saved = save_model(&sample_model(), None, &first).unwrap();

        // Saving over the same path reads the old blob before replacing it
        save_model(&saved, Some(&dir), &first).unwrap();
        let reloaded = load_model(&first, LoadMode::WithData).unwrap();
        assert_eq!(reloaded.initializers, sample_model().initializers);

        assert!(matches!(
            save_model(&saved, None, dir.join("b.graph.json")),
            Err(GraphError::MissingData(_))
        ));
        assert!(!dir.join("b.graph.json.data.partial").exists());
        assert!(!dir.join("b.graph.json.data").exists());
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_wrong_payload_size_rejected() {
        let dir = scratch_dir();
        let model = GraphModel::new("bad").with_initializer(Initializer::inline(
            "w",
            ElementType::Float,
            vec![2],
            vec![0u8; 4],
        ));
        assert!(matches!(
            save_model(&model, None, dir.join("bad.graph.json")),
            Err(GraphError::InvalidData { .. })
        ));
        // Nothing is left behind by a failed save
        let leftovers: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_relocate() {
        let dir = scratch_dir();
        let path = dir.join("m.graph.json");
        let mut saved = save_model(&sample_model(), None, &path).unwrap();

        assert_eq!(relocate_external_data(&mut saved, "model.data"), 2);
        assert_eq!(relocate_external_data(&mut saved, "model.data"), 0);
        fs::remove_dir_all(dir).ok();
    }
}
