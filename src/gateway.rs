//! Execution gateway: the only path from a placeholder-bearing script to a
//! sandbox run.
//!
//! A run validates the code, resolves every placeholder it contains (all of
//! them, before anything executes), substitutes the plaintext values and
//! hands the result to the sandbox. Whatever comes back to the caller has
//! those values replaced by their tokens again.

use std::collections::HashMap;
use std::sync::Arc;

use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::placeholder::{self, PlaceholderToken, SubstituteError};
use crate::sandbox::{Sandbox, SandboxError};
use crate::secrets::{SecretError, SecretStore};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Substitute(#[from] SubstituteError),
}

/// The caller-facing outcome of a failed run: the error kind plus a
/// message that carries no secret plaintext.
#[derive(Debug)]
pub struct RunFailure {
    pub error: GatewayError,
    pub message: String,
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RunFailure {}

impl From<GatewayError> for RunFailure {
    fn from(error: GatewayError) -> Self {
        let message = error.to_string();
        Self { error, message }
    }
}

pub struct ExecutionGateway {
    store: Arc<SecretStore>,
    sandbox: Sandbox,
}

impl ExecutionGateway {
    pub fn new(store: Arc<SecretStore>, sandbox: Sandbox) -> Self {
        Self { store, sandbox }
    }

    pub fn store_secret(&self, value: SecretString, read_once: bool) -> Result<String, GatewayError> {
        Ok(self.store.store(&value, read_once)?)
    }

    /// Runs `code` and returns its textual result.
    pub async fn run(&self, code: &str) -> Result<String, RunFailure> {
        let form = self.sandbox.validate(code).map_err(GatewayError::from)?;

        let tokens = placeholder::extract_tokens(code);
        debug!("Script ({form:?}) references {} placeholder(s)", tokens.len());

        let values = self.resolve_all(&tokens).map_err(GatewayError::from)?;
        let resolved = placeholder::substitute(code, &values).map_err(GatewayError::from)?;

        match self.sandbox.execute(resolved).await {
            Ok(output) => Ok(placeholder::redact(&output, &values)),
            Err(e) => {
                let error = GatewayError::from(e);
                let message = placeholder::redact(&error.to_string(), &values);
                warn!("Script run failed: {message}");
                Err(RunFailure { error, message })
            }
        }
    }

    /// Resolves every token, stopping at the first failure. Read-once
    /// secrets retrieved before that failure stay consumed.
    fn resolve_all(
        &self,
        tokens: &[PlaceholderToken],
    ) -> Result<HashMap<PlaceholderToken, SecretString>, SecretError> {
        let mut values = HashMap::with_capacity(tokens.len());
        for token in tokens {
            let value = self.store.retrieve(&token.secret_id()).inspect_err(|e| {
                info!("Placeholder {token} not resolved: {e}");
            })?;
            values.insert(token.clone(), value);
        }
        Ok(values)
    }
}
