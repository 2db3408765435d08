//! JSON state files and the liveness heartbeat.
//!
//! Layout mirrors the operator surface: `grid_state_<SYMBOL>_<COHORT>.json`
//! and `hybrid_state_<COHORT>.json` under the state directory, plus an
//! mtime-only heartbeat file. Every write goes through write-temp-then-
//! rename so a crash can never leave a half-written snapshot behind.

use crate::domain::grid::GridState;
use crate::domain::hybrid::HybridState;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct StateFileStore {
    state_dir: PathBuf,
    heartbeat_path: PathBuf,
}

impl StateFileStore {
    pub fn new(state_dir: impl Into<PathBuf>, heartbeat_path: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            heartbeat_path: heartbeat_path.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn hybrid_path(&self, cohort: &str) -> PathBuf {
        self.state_dir.join(format!("hybrid_state_{}.json", cohort))
    }

    fn grid_path(&self, symbol: &str, cohort: &str) -> PathBuf {
        self.state_dir
            .join(format!("grid_state_{}_{}.json", symbol, cohort))
    }

    fn write_atomic(&self, path: &Path, contents: &str) -> Result<()> {
        fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("Failed to create state dir {:?}", self.state_dir))?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents).with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, path).with_context(|| format!("Failed to move {:?} into place", tmp))?;
        Ok(())
    }

    pub fn save_hybrid(&self, cohort: &str, state: &HybridState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        self.write_atomic(&self.hybrid_path(cohort), &json)
    }

    pub fn load_hybrid(&self, cohort: &str) -> Result<Option<HybridState>> {
        let path = self.hybrid_path(cohort);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        Ok(Some(serde_json::from_str(&contents).with_context(|| {
            format!("Failed to parse hybrid state {:?}", path)
        })?))
    }

    pub fn save_grid(&self, cohort: &str, state: &GridState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        self.write_atomic(&self.grid_path(&state.symbol, cohort), &json)
    }

    pub fn load_grid(&self, symbol: &str, cohort: &str) -> Result<Option<GridState>> {
        let path = self.grid_path(symbol, cohort);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        Ok(Some(serde_json::from_str(&contents).with_context(|| {
            format!("Failed to parse grid state {:?}", path)
        })?))
    }

    pub fn remove_grid(&self, symbol: &str, cohort: &str) -> Result<()> {
        let path = self.grid_path(symbol, cohort);
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("Failed to remove {:?}", path))?;
        }
        Ok(())
    }

    /// All grid state files, keyed `"cohort:SYMBOL"`. Unparseable files are
    /// skipped with a warning so one corrupt snapshot cannot blind the
    /// monitoring tasks.
    pub fn load_all_grids(&self) -> BTreeMap<String, GridState> {
        let mut states = BTreeMap::new();
        let Ok(entries) = fs::read_dir(&self.state_dir) else {
            return states;
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name
                .strip_prefix("grid_state_")
                .and_then(|s| s.strip_suffix(".json"))
            else {
                continue;
            };
            // Filename: grid_state_<SYMBOL>_<COHORT>.json
            let Some((symbol, cohort)) = stem.rsplit_once('_') else {
                continue;
            };

            match fs::read_to_string(entry.path())
                .map_err(anyhow::Error::from)
                .and_then(|c| serde_json::from_str::<GridState>(&c).map_err(Into::into))
            {
                Ok(state) => {
                    states.insert(format!("{}:{}", cohort, symbol), state);
                }
                Err(e) => warn!("StateFileStore: could not load {}: {}", name, e),
            }
        }
        states
    }

    /// All hybrid state files, keyed by cohort name.
    pub fn load_all_hybrids(&self) -> BTreeMap<String, HybridState> {
        let mut states = BTreeMap::new();
        let Ok(entries) = fs::read_dir(&self.state_dir) else {
            return states;
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(cohort) = name
                .strip_prefix("hybrid_state_")
                .and_then(|s| s.strip_suffix(".json"))
            else {
                continue;
            };

            match fs::read_to_string(entry.path())
                .map_err(anyhow::Error::from)
                .and_then(|c| serde_json::from_str::<HybridState>(&c).map_err(Into::into))
            {
                Ok(state) => {
                    states.insert(cohort.to_string(), state);
                }
                Err(e) => warn!("StateFileStore: could not load {}: {}", name, e),
            }
        }
        states
    }

    /// Touch the heartbeat file; only its mtime carries meaning.
    pub fn touch_heartbeat(&self) -> Result<()> {
        if let Some(parent) = self.heartbeat_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        fs::write(&self.heartbeat_path, b"")
            .with_context(|| format!("Failed to touch heartbeat {:?}", self.heartbeat_path))?;
        Ok(())
    }
}
