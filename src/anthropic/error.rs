//! Tipos de erro para o cliente da API Anthropic.
//!
//! [`AnthropicError`] cobre rate limiting, erros da API, erros de rede e
//! respostas sem texto. Os passos de workflow nunca veem este tipo
//! diretamente: ele é convertido em `CollaboratorError::Model`.

use thiserror::Error;

/// Erros que podem ocorrer ao interagir com a API da Anthropic.
///
/// Todas as variantes são tratadas como transitórias pelo dispatcher.
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// O servidor retornou HTTP 429 (rate limit).
    /// O campo `retry_after_ms` indica quantos milissegundos esperar antes de retentar.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Erro retornado pela API (ex.: 401 chave inválida, 500 erro interno).
    /// Contém o código de status HTTP e a mensagem de erro do corpo da resposta.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    /// Encapsula o erro original do `reqwest` via `#[from]`.
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// A resposta não trouxe nenhum bloco de texto.
    #[error("model returned no text (stop reason: {stop_reason})")]
    EmptyResponse { stop_reason: String },
}
