//! Configuração do lessonforge carregada a partir de `lessonforge.toml`.
//!
//! A struct [`ForgeConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `ANTHROPIC_API_KEY` e `LESSONFORGE_DATABASE_URL`
//! têm precedência sobre o arquivo.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use crate::dispatcher::DispatcherConfig;
use crate::state_machine::RetryPolicy;
use crate::workflow::{DEFAULT_MAX_TRANSITIONS, Engine};
use crate::workflows::WorkflowLimits;

/// Arquivo procurado no diretório atual quando `--config` não é informado.
pub const DEFAULT_CONFIG_FILE: &str = "lessonforge.toml";

/// Configuração de nível superior carregada de `lessonforge.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// URL do banco SQLite que guarda jobs e conteúdo.
    pub database_url: String,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub engine: EngineConfig,
    pub model: ModelConfig,
    pub workflows: WorkflowLimits,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://lessonforge.db".to_string(),
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            engine: EngineConfig::default(),
            model: ModelConfig::default(),
            workflows: WorkflowLimits::default(),
        }
    }
}

/// Parâmetros do pool de workers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Intervalo entre consultas à fila vazia, em milissegundos.
    pub poll_interval_ms: u64,
    /// Número de workers concorrentes.
    pub workers: usize,
    /// Tempo após o qual um job em processamento é considerado abandonado.
    pub processing_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub metrics_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            workers: 4,
            processing_timeout_secs: 3600,
            sweep_interval_secs: 60,
            metrics_interval_secs: 900,
        }
    }
}

/// Backoff exponencial entre tentativas.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Máximo de execuções antes de marcar um job como falho.
    pub max_attempts: u32,
    /// Atraso antes da segunda tentativa, em segundos.
    pub base_delay_secs: u64,
    pub multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 300,
            multiplier: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Teto de transições por execução de workflow.
    pub max_transitions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_transitions: DEFAULT_MAX_TRANSITIONS,
        }
    }
}

/// Acesso à API Anthropic.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Chave da API Anthropic.
    pub api_key: String,
    /// Modelo usado para classificação e respostas curtas.
    pub fast_model: String,
    /// Modelo usado para gerar syllabi e conteúdo de lições.
    pub large_model: String,
    pub max_tokens: u32,
    /// URL alternativa da API (útil para testes e proxies).
    pub base_url: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            fast_model: "claude-haiku-4-5-20251001".to_string(),
            large_model: "claude-sonnet-4-5-20250929".to_string(),
            max_tokens: 4096,
            base_url: None,
        }
    }
}

impl ForgeConfig {
    /// Carrega a configuração de `path`, ou de `lessonforge.toml` no
    /// diretório atual. Um arquivo explícito ausente é erro; o arquivo
    /// padrão ausente resulta nos defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() { Self::from_file(path)? } else { Self::default() }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Rejeita combinações que o engine não conseguiria executar: o teto de
    /// transições precisa comportar a última regeneração permitida.
    pub fn validate(&self) -> Result<()> {
        let ceiling = self.engine.max_transitions;
        ensure!(ceiling > 0, "engine.max_transitions must be greater than zero");
        let required = self.workflows.required_transitions();
        ensure!(
            required <= ceiling,
            "engine.max_transitions = {ceiling} is below the {required} transitions needed for \
             workflows.max_generation_attempts = {}",
            self.workflows.max_generation_attempts
        );
        Ok(())
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Variáveis de ambiente têm precedência sobre o arquivo de configuração.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("ANTHROPIC_API_KEY").filter(|k| !k.is_empty()) {
            self.model.api_key = key;
        }
        if let Some(url) = lookup("LESSONFORGE_DATABASE_URL").filter(|u| !u.is_empty()) {
            self.database_url = url;
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            base_delay: Duration::from_secs(self.retry.base_delay_secs),
            multiplier: self.retry.multiplier,
        }
    }

    pub fn engine(&self) -> Engine {
        Engine::new(self.engine.max_transitions)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            workers: self.worker.workers.max(1),
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
            processing_timeout: Duration::from_secs(self.worker.processing_timeout_secs),
            sweep_interval: Duration::from_secs(self.worker.sweep_interval_secs.max(1)),
            metrics_interval: Duration::from_secs(self.worker.metrics_interval_secs.max(1)),
            worker_prefix: format!("worker-{}", std::process::id()),
        }
    }
}
