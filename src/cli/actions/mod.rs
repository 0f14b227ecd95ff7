pub mod analyze;
pub mod backends;
pub mod render;

use secrecy::SecretString;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug)]
pub struct AnalyzeOptions {
    pub dsn: SecretString,
    pub id: Option<String>,
    pub window: Duration,
    pub format: OutputFormat,
    pub watch: Option<Duration>,
    pub metrics: bool,
    pub policy: Option<PathBuf>,
    pub report_file: Option<PathBuf>,
    pub cache_dsn: Option<SecretString>,
    pub strategies: Vec<String>,
}

#[derive(Debug)]
pub enum Action {
    Analyze(Box<AnalyzeOptions>),
    Backends,
}
