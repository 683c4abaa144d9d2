//! Inicialização de tracing/logging.

use tracing_subscriber::EnvFilter;

/// Instala o subscriber global. `RUST_LOG` tem precedência; sem ele o nível
/// é `info`, ou `debug` com `verbose`.
///
/// Chamadas repetidas não têm efeito.
pub fn init(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Logs vão para stderr; stdout fica livre para a saída JSON dos comandos.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose);

    let _ = if json {
        builder.json().with_timer(tracing_subscriber::fmt::time::SystemTime).try_init()
    } else {
        builder.try_init()
    };
}
