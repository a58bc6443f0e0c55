//! Requirements document loading with schema validation.
//!
//! The document is never cached or locked: every call re-reads the file and
//! returns a fresh snapshot.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::Validator;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::prd::Prd;

const PRD_SCHEMA: &str = include_str!("../../schemas/prd.schema.json");

static PRD_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(PRD_SCHEMA).map_err(|err| err.to_string())?;
    jsonschema::validator_for(&schema).map_err(|err| err.to_string())
});

/// The document is missing, unreadable, or malformed.
#[derive(Debug, Error)]
#[error("requirements document {} unreadable: {reason}", .path.display())]
pub struct DocumentUnreadable {
    pub path: PathBuf,
    pub reason: String,
}

/// Load and validate the document at `path`.
///
/// Every failure is reported as [`DocumentUnreadable`].
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load(path: &Path) -> Result<Prd> {
    let prd = read_and_parse(path).map_err(|err| DocumentUnreadable {
        path: path.to_path_buf(),
        reason: format!("{err:#}"),
    })?;
    debug!(stories = prd.stories.len(), "requirements document loaded");
    Ok(prd)
}

fn read_and_parse(path: &Path) -> Result<Prd> {
    let contents = fs::read_to_string(path).context("read file")?;
    let value: Value = serde_json::from_str(&contents).context("parse json")?;
    validate_schema(&value)?;
    let prd: Prd = serde_json::from_value(value).context("deserialize document")?;
    Ok(prd)
}

fn validate_schema(value: &Value) -> Result<()> {
    let validator = PRD_VALIDATOR
        .as_ref()
        .map_err(|err| anyhow!("invalid embedded schema: {err}"))?;
    if validator.is_valid(value) {
        return Ok(());
    }
    let messages = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect::<Vec<_>>();
    Err(anyhow!("schema validation failed: {}", messages.join("; ")))
}
