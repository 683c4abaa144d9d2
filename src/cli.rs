//! Interface de linha de comando do lessonforge baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (worker, enqueue,
//! status, metrics, sweep) e flags globais (--config, --verbose,
//! --json-logs, --database-url).

use std::path::PathBuf;

use clap::{ArgGroup, Parser, Subcommand};

/// lessonforge: fila durável de jobs e motor de workflows para conteúdo de
/// aprendizagem gerado por IA.
#[derive(Debug, Parser)]
#[command(name = "lessonforge", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./lessonforge.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Emite logs em JSON estruturado.
    #[arg(long, global = true, default_value_t = false)]
    pub json_logs: bool,

    /// URL do banco SQLite; sobrepõe o arquivo de configuração.
    #[arg(long, global = true)]
    pub database_url: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa o pool de workers até Ctrl-C.
    Worker {
        /// Intervalo entre consultas à fila vazia.
        #[arg(long)]
        poll_interval_ms: Option<u64>,

        /// Número máximo de execuções por job.
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Número de workers concorrentes.
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Cria um job e imprime seu id.
    #[command(group(ArgGroup::new("payload").required(true).args(["input", "input_file"])))]
    Enqueue {
        /// Tipo de workflow (syllabus_generation, lesson_content, ...).
        kind: String,

        /// Entrada do job como objeto JSON.
        #[arg(long)]
        input: Option<String>,

        /// Arquivo contendo a entrada do job em JSON.
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// Usuário dono do job.
        #[arg(long)]
        user: Option<String>,

        /// Aguarda o job terminar, mostrando um spinner.
        #[arg(long, default_value_t = false)]
        wait: bool,
    },

    /// Mostra o status de um job em JSON.
    Status {
        /// Id do job.
        job_id: String,

        /// Acompanha o job até um estado terminal.
        #[arg(long, default_value_t = false)]
        watch: bool,
    },

    /// Mostra as métricas da fila em JSON.
    Metrics {
        /// Janela considerada para jobs concluídos e falhos.
        #[arg(long, default_value_t = 24)]
        window_hours: u32,
    },

    /// Devolve à fila jobs com lease expirado, uma única vez.
    Sweep,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_enqueue_subcommand() {
        let cli = Cli::parse_from([
            "lessonforge",
            "enqueue",
            "syllabus_generation",
            "--input",
            r#"{"topic": "Graph Theory"}"#,
            "--user",
            "u-1",
            "--wait",
        ]);
        match cli.command {
            Command::Enqueue {
                kind,
                input,
                input_file,
                user,
                wait,
            } => {
                assert_eq!(kind, "syllabus_generation");
                assert_eq!(input.unwrap(), r#"{"topic": "Graph Theory"}"#);
                assert!(input_file.is_none());
                assert_eq!(user.as_deref(), Some("u-1"));
                assert!(wait);
            }
            _ => panic!("expected Enqueue command"),
        }
    }

    #[test]
    fn enqueue_requires_exactly_one_payload() {
        assert!(Cli::try_parse_from(["lessonforge", "enqueue", "lesson_content"]).is_err());
        assert!(
            Cli::try_parse_from([
                "lessonforge",
                "enqueue",
                "lesson_content",
                "--input",
                "{}",
                "--input-file",
                "job.json",
            ])
            .is_err()
        );
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "lessonforge",
            "--config",
            "custom.toml",
            "--database-url",
            "sqlite::memory:",
            "--json-logs",
            "--verbose",
            "sweep",
        ]);
        assert!(cli.verbose);
        assert!(cli.json_logs);
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        assert_eq!(cli.database_url.as_deref(), Some("sqlite::memory:"));
        assert!(matches!(cli.command, Command::Sweep));
    }

    #[test]
    fn cli_parses_worker_overrides() {
        let cli = Cli::parse_from(["lessonforge", "worker", "--workers", "2", "--max-attempts", "5"]);
        match cli.command {
            Command::Worker {
                poll_interval_ms,
                max_attempts,
                workers,
            } => {
                assert!(poll_interval_ms.is_none());
                assert_eq!(max_attempts, Some(5));
                assert_eq!(workers, Some(2));
            }
            _ => panic!("expected Worker command"),
        }
    }

    #[test]
    fn metrics_window_defaults_to_a_day() {
        let cli = Cli::parse_from(["lessonforge", "metrics"]);
        assert!(matches!(cli.command, Command::Metrics { window_hours: 24 }));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
