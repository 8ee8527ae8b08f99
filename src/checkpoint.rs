//! Parameter-map and whole-model snapshots on disk.
//!
//! A parameter map is a safetensors file keyed by `VarMap` names. A whole
//! model is the same file plus a JSON sidecar holding the architecture, so it
//! can be rebuilt without knowing its configuration up front.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::discriminator::{Discriminator, DiscriminatorConfig};
use crate::error::{Error, Result};
use crate::generator::{Generator, GeneratorConfig};

pub const GENERATOR: &str = "generator";
pub const DISCRIMINATOR: &str = "discriminator";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pretrain,
    Final,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pretrain => "pretrain",
            Phase::Final => "final",
        }
    }
}

/// `generator_pretrain_dict`, `discriminator_final_dict`, ...
pub fn dict_name(model: &str, phase: Phase) -> String {
    format!("{model}_{}_dict", phase.as_str())
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot<C> {
    model: String,
    config: C,
}

fn lock_err<T>(e: std::sync::PoisonError<T>) -> Error {
    Error::Candle(candle_core::Error::Msg(format!("parameter map lock poisoned: {e}")))
}

/// Copies every parameter of `varmap` from `tensors`, after checking that all
/// names exist with the expected shapes. Nothing is written on failure.
pub fn assign_params(varmap: &VarMap, tensors: &HashMap<String, Tensor>) -> Result<()> {
    let data = varmap.data().lock().map_err(lock_err)?;
    for (name, var) in data.iter() {
        let found = tensors
            .get(name)
            .ok_or_else(|| Error::MissingParameter(name.clone()))?;
        if found.shape() != var.shape() {
            return Err(Error::ShapeMismatch {
                name: name.clone(),
                expected: var.shape().clone(),
                found: found.shape().clone(),
            });
        }
    }
    for (name, var) in data.iter() {
        let tensor = &tensors[name];
        var.set(&tensor.to_dtype(var.dtype())?.to_device(var.device())?)?;
    }
    Ok(())
}

/// Loads a safetensors parameter map into an already constructed model.
pub fn load_params(varmap: &VarMap, path: impl AsRef<Path>, device: &Device) -> Result<()> {
    let tensors = candle_core::safetensors::load(path.as_ref(), device)?;
    assign_params(varmap, &tensors)?;
    tracing::debug!(path = %path.as_ref().display(), "loaded {} parameters", tensors.len());
    Ok(())
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Creates the directory if needed; an existing directory is fine.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn params_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.safetensors"))
    }

    pub fn config_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn save_params(&self, name: &str, varmap: &VarMap) -> Result<PathBuf> {
        let path = self.params_path(name);
        varmap.save(&path)?;
        Ok(path)
    }

    /// Parameters plus architecture.
    pub fn save_model<C: Serialize>(&self, name: &str, varmap: &VarMap, config: &C) -> Result<()> {
        self.save_params(name, varmap)?;
        let snapshot = Snapshot {
            model: name.to_string(),
            config,
        };
        std::fs::write(self.config_path(name), serde_json::to_string_pretty(&snapshot)?)?;
        Ok(())
    }

    fn read_config<C: DeserializeOwned>(&self, name: &str) -> Result<Option<C>> {
        let path = self.config_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let snapshot: Snapshot<C> = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        if snapshot.model != name {
            return Err(Error::Config(format!(
                "{} describes a {}, expected {name}",
                path.display(),
                snapshot.model
            )));
        }
        Ok(Some(snapshot.config))
    }

    /// Rebuilds a generator saved with [`Self::save_model`]. Without a sidecar
    /// the architecture is inferred from the parameter names and shapes.
    pub fn load_generator(&self, name: &str, device: &Device) -> Result<(VarMap, Generator)> {
        let tensors = candle_core::safetensors::load(self.params_path(name), device)?;
        let config = match self.read_config::<GeneratorConfig>(name)? {
            Some(config) => config,
            None => GeneratorConfig::infer(&tensors)?,
        };
        let varmap = VarMap::new();
        let generator = Generator::load(VarBuilder::from_varmap(&varmap, DType::F32, device), config)?;
        assign_params(&varmap, &tensors)?;
        Ok((varmap, generator))
    }

    pub fn load_discriminator(&self, name: &str, device: &Device) -> Result<(VarMap, Discriminator)> {
        let config = self
            .read_config::<DiscriminatorConfig>(name)?
            .ok_or_else(|| {
                Error::Config(format!("missing {}", self.config_path(name).display()))
            })?;
        let varmap = VarMap::new();
        let discriminator =
            Discriminator::load(VarBuilder::from_varmap(&varmap, DType::F32, device), config)?;
        load_params(&varmap, self.params_path(name), device)?;
        Ok((varmap, discriminator))
    }
}
