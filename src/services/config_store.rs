// Configuration Storage Service
// Preference port plus the JSON-file store with version backups

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use crate::models::AnnotationMode;
use crate::services::annotation::RenderConfig;
use crate::services::detection::sensitivity::{DetectionSensitivity, KindThresholds, ThresholdPolicy};
use crate::services::result_cache::EvictionPolicy;
use crate::services::unit::RefinementPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("failed to serialize config: {0}")]
    Serialize(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: AnnotationMode,
    #[serde(default)]
    pub show_certainty: bool,
    #[serde(default)]
    pub sensitivity: DetectionSensitivity,
    #[serde(default)]
    pub thresholds: KindThresholds,
    /// Hosts of pages that publish generated content on purpose.
    #[serde(default = "default_allowlist")]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub refinement: RefinementConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub filters: FilterConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            enabled: true,
            mode: AnnotationMode::default(),
            show_certainty: false,
            sensitivity: DetectionSensitivity::default(),
            thresholds: KindThresholds::default(),
            allowlist: default_allowlist(),
            remote: RemoteConfig::default(),
            refinement: RefinementConfig::default(),
            cache: CacheConfig::default(),
            filters: FilterConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn render_config(&self) -> RenderConfig {
        RenderConfig {
            mode: self.mode,
            show_certainty: self.show_certainty,
            ..RenderConfig::default()
        }
    }

    pub fn threshold_policy(&self) -> ThresholdPolicy {
        ThresholdPolicy::new(self.thresholds, self.sensitivity, self.allowlist.clone())
    }

    pub fn refinement_policy(&self) -> RefinementPolicy {
        RefinementPolicy {
            tolerance: self.refinement.tolerance.clamp(0.0, 1.0),
            min_confidence: self.refinement.min_confidence.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefinementConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Also refine suppressed units to catch false negatives.
    #[serde(default)]
    pub refine_suppressed: bool,
    /// Yield to the runtime after this many image refinements in a row.
    #[serde(default = "default_yield_every")]
    pub yield_every: usize,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_in_flight: default_max_in_flight(),
            tolerance: default_tolerance(),
            min_confidence: default_min_confidence(),
            refine_suppressed: false,
            yield_every: default_yield_every(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(default = "default_text_capacity")]
    pub text_capacity: usize,
    #[serde(default = "default_image_capacity")]
    pub image_capacity: usize,
    #[serde(default)]
    pub policy: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            text_capacity: default_text_capacity(),
            image_capacity: default_image_capacity(),
            policy: EvictionPolicy::Fifo,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,
    #[serde(default = "default_min_image_dimension")]
    pub min_image_dimension: u32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_text_chars: default_min_text_chars(),
            min_image_dimension: default_min_image_dimension(),
        }
    }
}

fn default_version() -> String { "1.0.0".to_string() }
fn default_true() -> bool { true }
fn default_timeout_ms() -> u64 { 3000 }
fn default_max_in_flight() -> usize { 6 }
fn default_tolerance() -> f64 { 0.15 }
fn default_min_confidence() -> f64 { 0.55 }
fn default_yield_every() -> usize { 4 }
fn default_text_capacity() -> usize { 1000 }
fn default_image_capacity() -> usize { 500 }
fn default_min_text_chars() -> usize { 40 }
fn default_min_image_dimension() -> u32 { 64 }

fn default_allowlist() -> Vec<String> {
    ["midjourney.com", "lexica.art", "civitai.com", "nightcafe.studio", "leonardo.ai"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Key-value preference port. Read once per discovery batch.
pub trait PreferenceStore: Send + Sync {
    fn load(&self) -> Result<AppConfig, ConfigError>;
    fn save(&self, config: &AppConfig) -> Result<(), ConfigError>;
}

/// In-process preferences for host shells that own persistence themselves.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    config: Mutex<AppConfig>,
}

impl MemoryPreferences {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }

    /// Mutate the stored preferences in place.
    pub fn update(&self, f: impl FnOnce(&mut AppConfig)) {
        let mut guard = self.config.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard);
    }
}

impl PreferenceStore for MemoryPreferences {
    fn load(&self) -> Result<AppConfig, ConfigError> {
        let guard = self.config.lock().unwrap_or_else(|p| p.into_inner());
        Ok(guard.clone())
    }

    fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        self.update(|c| *c = config.clone());
        Ok(())
    }
}

pub struct ConfigStore {
    config_dir: PathBuf,
    config_file: PathBuf,
}

impl ConfigStore {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_file = config_dir.join("config.json");
        Self { config_dir, config_file }
    }

    /// Get default config directory
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("closeai"))
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// Ensure config directory exists
    pub fn ensure_dir(&self) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.config_dir)?;
        Ok(())
    }

    /// Create a backup of current config
    fn create_backup(&self) -> Result<(), ConfigError> {
        let backup_dir = self.config_dir.join("backups");
        fs::create_dir_all(&backup_dir)?;

        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let backup_file = backup_dir.join(format!("config_{}.json", timestamp));
        fs::copy(&self.config_file, &backup_file)?;

        // Keep only last 10 backups
        self.cleanup_old_backups(&backup_dir, 10)
    }

    /// Remove old backups, keeping only the most recent N
    fn cleanup_old_backups(&self, backup_dir: &Path, keep: usize) -> Result<(), ConfigError> {
        let mut entries: Vec<_> = fs::read_dir(backup_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map_or(false, |ext| ext == "json"))
            .collect();

        if entries.len() <= keep {
            return Ok(());
        }

        // Timestamped names sort chronologically
        entries.sort_by_key(|e| e.file_name());

        for entry in entries.iter().take(entries.len() - keep) {
            let _ = fs::remove_file(entry.path());
        }

        Ok(())
    }
}

impl PreferenceStore for ConfigStore {
    /// Missing file means defaults.
    fn load(&self) -> Result<AppConfig, ConfigError> {
        if !self.config_file.exists() {
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&self.config_file)?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        self.ensure_dir()?;

        if self.config_file.exists() {
            self.create_backup()?;
        }

        let content = serde_json::to_string_pretty(config)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        fs::write(&self.config_file, content)?;
        tracing::info!("[CONFIG] saved {}", self.config_file.display());
        Ok(())
    }
}
