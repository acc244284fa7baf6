//! YAML run configuration.
//!
//! ```yaml
//! url: https://es.example.com:9200
//! params:
//!   json_file: projects.json
//!   out_index: gitee_metrics
//!   community: oss
//!   level: project
//!   from_date: 2022-01-03
//!   end_date: 2022-03-28
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::backend::{HttpOptions, RetryPolicy};
use crate::engine::{EngineOptions, RunRequest};
use crate::error::{Error, Result};
use crate::grouping::{GroupingDocument, Level, ScopeFilter};
use crate::metrics::{ActivityModel, ModelSources};
use crate::window::{Frequency, TimeWindow};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Base URL of the search backend.
    pub url: String,
    pub params: RunParams,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunParams {
    /// Grouping document (projects, sources, repositories).
    pub json_file: PathBuf,
    pub out_index: String,
    pub community: String,
    pub level: String,
    pub from_date: String,
    pub end_date: String,
    #[serde(default = "default_frequency")]
    pub frequency: String,
    #[serde(default = "default_issue_index")]
    pub issue_index: String,
    #[serde(default = "default_git_index")]
    pub git_index: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    /// Author-domain prefixes for organization contributor counts.
    #[serde(default)]
    pub companies: Vec<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_true")]
    pub verify_certs: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
}

fn default_frequency() -> String {
    Frequency::default().to_key()
}

fn default_issue_index() -> String {
    "issues".to_string()
}

fn default_git_index() -> String {
    "git".to_string()
}

fn default_model() -> String {
    ActivityModel::NAME.to_string()
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    8
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_batch_size() -> usize {
    100
}

fn default_max_error_rate() -> f64 {
    0.5
}

impl RunConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read config {}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    /// Parse and validate a configuration document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: RunConfig = serde_yaml::from_str(text)
            .map_err(|e| Error::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        url::Url::parse(&self.url)
            .map_err(|e| Error::Config(format!("invalid url '{}': {e}", self.url)))?;
        let p = &self.params;
        for (name, value) in [
            ("out_index", &p.out_index),
            ("issue_index", &p.issue_index),
            ("git_index", &p.git_index),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{name} must not be empty")));
            }
        }
        if self.level()? == Level::Community {
            if p.community.trim().is_empty() {
                return Err(Error::Config(
                    "community must be named for community-level runs".into(),
                ));
            }
            if p.project.is_some() {
                return Err(Error::Config(
                    "project cannot be combined with community-level runs".into(),
                ));
            }
        }
        self.window()?;
        self.frequency()?;
        if p.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if p.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if p.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&p.max_error_rate) {
            return Err(Error::Config(format!(
                "max_error_rate must be between 0 and 1, got {}",
                p.max_error_rate
            )));
        }
        Ok(())
    }

    pub fn level(&self) -> Result<Level> {
        self.params.level.parse()
    }

    /// The overall window, `[from_date, end_date)`.
    pub fn window(&self) -> Result<TimeWindow> {
        TimeWindow::parse(self.params.from_date.as_str(), self.params.end_date.as_str())
            .map_err(|e| Error::Config(format!("invalid date range: {e}")))
    }

    pub fn frequency(&self) -> Result<Frequency> {
        Frequency::parse(&self.params.frequency)
    }

    pub fn filter(&self) -> ScopeFilter {
        ScopeFilter {
            community: self.params.community.clone(),
            project: self.params.project.clone(),
            source: self.params.source.clone(),
            index_source: ScopeFilter::source_of_index(&self.params.issue_index),
        }
    }

    pub fn request(&self) -> Result<RunRequest> {
        Ok(RunRequest {
            level: self.level()?,
            window: self.window()?,
            frequency: self.frequency()?,
            out_index: self.params.out_index.clone(),
            filter: self.filter(),
        })
    }

    pub fn model_sources(&self) -> ModelSources {
        ModelSources {
            issue_index: self.params.issue_index.clone(),
            git_index: self.params.git_index.clone(),
            companies: self.params.companies.clone(),
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            concurrency: self.params.concurrency,
            retry: RetryPolicy {
                max_attempts: self.params.max_attempts,
                timeout: self.timeout(),
                ..RetryPolicy::default()
            },
            batch_size: self.params.batch_size,
            max_error_rate: self.params.max_error_rate,
            ..EngineOptions::default()
        }
    }

    pub fn http_options(&self) -> HttpOptions {
        HttpOptions {
            timeout: self.timeout(),
            verify_certs: self.params.verify_certs,
            max_connections: self.params.concurrency,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.params.timeout_secs)
    }

    /// Load the grouping document. Relative paths resolve against `base_dir`
    /// when given (typically the config file's directory).
    pub fn load_grouping(&self, base_dir: Option<&Path>) -> Result<GroupingDocument> {
        let path = match base_dir {
            Some(dir) if self.params.json_file.is_relative() => dir.join(&self.params.json_file),
            _ => self.params.json_file.clone(),
        };
        GroupingDocument::load(path)
    }
}
