//! Interface de terminal do lessonforge: spinners e saída colorida.
//!
//! Usa `indicatif` para spinners de progresso e `console` para estilização
//! com cores. O [`JobProgress`] acompanha um job enquanto `--wait` ou
//! `--watch` consultam seu status.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::state_machine::JobStatus;
use crate::status::JobStatusView;

/// Indicador visual de progresso para um job acompanhado no terminal.
///
/// Exibe um spinner enquanto o job não termina e mensagens coloridas para
/// sucesso (verde), falha (vermelho) e retentativa (amarelo).
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    /// Inicia o spinner para o job identificado por `label`.
    pub fn start(label: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {elapsed:>4} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("waiting for {label}"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Atualiza a mensagem do spinner com o status atual.
    pub fn update(&self, view: &JobStatusView) {
        let mut message = format!("{} {} (attempt {})", view.kind, view.status, view.attempt_count);
        if let (JobStatus::Pending, Some(error)) = (view.status, &view.error) {
            message.push_str(&format!(
                " {}",
                self.yellow.apply_to(format!("retrying after: {error}"))
            ));
        }
        self.pb.set_message(message);
    }

    /// Finaliza o spinner e mostra o desfecho do job.
    pub fn finish(&self, view: &JobStatusView) {
        self.pb.finish_and_clear();
        match view.status {
            JobStatus::Completed => {
                eprintln!("  {} {} completed", self.green.apply_to("✓"), view.id);
            }
            JobStatus::Failed => {
                let error = view.error.as_deref().unwrap_or("unknown error");
                eprintln!("  {} {} failed: {error}", self.red.apply_to("✗"), view.id);
            }
            _ => {
                eprintln!("  {} {} is {}", self.yellow.apply_to("…"), view.id, view.status);
            }
        }
    }
}

/// Imprime um valor serializável como JSON formatado no stdout.
pub fn print_json<T: Serialize>(value: &T) -> serde_json::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
