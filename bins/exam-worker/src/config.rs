// Execution template registry for the judge
use anyhow::{bail, Context, Result};
use exam_common::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: Language,
    pub version: String,
    pub image: String,
    pub dockerfile_path: String,
    /// File name the submission is written to under `/sandbox/src`
    pub source_file: String,
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    pub pids_limit: i64,
}

impl LanguageConfig {
    pub fn memory_limit_bytes(&self) -> i64 {
        i64::from(self.memory_limit_mb) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (f64::from(self.cpu_limit) * 1_000_000_000.0) as i64
    }

    fn validate(&self) -> Result<()> {
        if self.run.is_empty() {
            bail!("Language {} has an empty run command", self.name);
        }
        if matches!(&self.compile, Some(cmd) if cmd.is_empty()) {
            bail!("Language {} has an empty compile command", self.name);
        }
        if self.source_file.is_empty() || self.source_file.contains('/') {
            bail!("Language {} has an invalid source file name", self.name);
        }
        if self.memory_limit_mb == 0 || self.pids_limit <= 0 || self.cpu_limit <= 0.0 {
            bail!("Language {} has a non-positive resource limit", self.name);
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson =
            serde_json::from_str(content).context("Failed to parse languages.json")?;

        let mut configs = HashMap::new();
        for lang in languages_json.languages {
            lang.validate()?;
            if configs.insert(lang.name, lang.clone()).is_some() {
                bail!("Language {} is configured twice", lang.name);
            }
        }

        let missing: Vec<_> = Language::ALL
            .iter()
            .filter(|l| !configs.contains_key(*l))
            .map(|l| l.as_str())
            .collect();
        if !missing.is_empty() {
            bail!("No execution template configured for: {}", missing.join(", "));
        }

        Ok(Self { configs })
    }

    pub fn get_config(&self, language: Language) -> Result<&LanguageConfig> {
        self.configs
            .get(&language)
            .ok_or_else(|| anyhow::anyhow!("No configuration found for language: {}", language))
    }

    /// All configured templates, in a stable order
    pub fn configs(&self) -> Vec<&LanguageConfig> {
        let mut configs: Vec<_> = self.configs.values().collect();
        configs.sort_by_key(|c| c.name);
        configs
    }

    pub fn list_languages(&self) -> Vec<Language> {
        self.configs().into_iter().map(|c| c.name).collect()
    }
}
