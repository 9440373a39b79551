//! Unit checkpoint save/load
//!
//! A checkpoint is a single SafeTensors file. The weights are stored as
//! little-endian `F32` tensors and the unit header (format version plus the
//! full [`UnitConfig`]) travels in the file's `__metadata__` block, so a unit
//! can be rebuilt from the file alone.
//!
//! Files are written to a temporary sibling and renamed into place: a crash
//! mid-save leaves the previous checkpoint intact.

use crate::stability::validate_parameters;
use crate::{BagUnit, TrainableUnit, UnitConfig, UnitError};
use anyhow::{Context, Result};
use safetensors::tensor::TensorView;
use safetensors::{serialize_to_file, Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Checkpoint format version for compatibility checking
pub const CHECKPOINT_VERSION: &str = "1.0.0";

const HEADER_KEY: &str = "unit";

#[derive(Debug, Serialize, Deserialize)]
struct UnitHeader {
    version: String,
    config: UnitConfig,
}

/// Save a unit to `path`
///
/// # Arguments
/// * `unit` - The unit to save
/// * `path` - Target file; parent directories are created if needed
///
/// # Errors
/// Returns an error if a parameter holds NaN/Inf, the directory cannot be
/// created, or the file cannot be written.
pub fn save_unit(unit: &dyn TrainableUnit, path: &Path) -> Result<()> {
    let params = unit.parameters();
    validate_parameters(&params)
        .with_context(|| format!("Refusing to checkpoint {} unit", unit.kind()))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create checkpoint directory: {}", parent.display())
        })?;
    }

    let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = params
        .iter()
        .map(|p| {
            let (rows, cols) = p.shape();
            let bytes = p.value.iter().flat_map(|x| x.to_le_bytes()).collect();
            (p.name.clone(), vec![rows, cols], bytes)
        })
        .collect();

    let views = buffers
        .iter()
        .map(|(name, shape, bytes)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes)
                .map(|view| (name.clone(), view))
                .map_err(|e| anyhow::anyhow!("Invalid tensor '{}': {:?}", name, e))
        })
        .collect::<Result<Vec<_>>>()?;

    let header = UnitHeader {
        version: CHECKPOINT_VERSION.to_string(),
        config: unit.config().clone(),
    };
    let metadata = Some(HashMap::from([(
        HEADER_KEY.to_string(),
        serde_json::to_string(&header).context("Failed to serialize unit header")?,
    )]));

    let tmp_path = path.with_extension("safetensors.tmp");
    serialize_to_file(views, &metadata, &tmp_path)
        .map_err(|e| anyhow::anyhow!("Failed to write {}: {:?}", tmp_path.display(), e))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to move checkpoint into place: {}", path.display()))?;
    debug!(path = %path.display(), kind = %unit.kind(), "saved unit");

    Ok(())
}

fn read_header(bytes: &[u8]) -> Result<UnitHeader> {
    let (_, metadata) = SafeTensors::read_metadata(bytes)
        .map_err(|e| anyhow::anyhow!("Failed to parse checkpoint header: {:?}", e))?;
    let raw = metadata
        .metadata()
        .as_ref()
        .and_then(|m| m.get(HEADER_KEY))
        .ok_or_else(|| UnitError::CorruptState("missing unit header".to_string()))?;
    let header: UnitHeader =
        serde_json::from_str(raw).context("Failed to parse unit header from metadata")?;

    if header.version != CHECKPOINT_VERSION {
        anyhow::bail!(
            "Checkpoint version mismatch: expected {}, got {}",
            CHECKPOINT_VERSION,
            header.version
        );
    }
    Ok(header)
}

/// Load a unit saved by [`save_unit`]
///
/// # Errors
/// Returns an error if the file cannot be read, the header is missing or of
/// another version, or a tensor is missing or of the wrong type or size.
pub fn load_unit(path: &Path) -> Result<BagUnit> {
    let bytes = fs::read(path)
        .with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;
    let header = read_header(&bytes)?;
    let tensors = SafeTensors::deserialize(&bytes)
        .map_err(|e| anyhow::anyhow!("Failed to parse checkpoint {}: {:?}", path.display(), e))?;

    let mut unit = BagUnit::new(header.config)?;
    for param in unit.parameters_mut() {
        let view = tensors
            .tensor(&param.name)
            .map_err(|_| UnitError::UnknownParameter(param.name.clone()))?;
        if view.dtype() != Dtype::F32 {
            return Err(UnitError::CorruptState(format!(
                "tensor '{}' has dtype {:?}, expected F32",
                param.name,
                view.dtype()
            ))
            .into());
        }
        let data = view.data();
        if data.len() != param.numel() * 4 {
            return Err(UnitError::CorruptState(format!(
                "tensor '{}' holds {} bytes, expected {}",
                param.name,
                data.len(),
                param.numel() * 4
            ))
            .into());
        }
        for (dst, chunk) in param.value.iter_mut().zip(data.chunks_exact(4)) {
            *dst = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
    }
    debug!(path = %path.display(), kind = %unit.kind(), "loaded unit");

    Ok(unit)
}
