//! Event channel writer.
//!
//! # Channels
//!
//! - **Events (this module)**: one JSON record per line on the output channel
//!   (stdout by default). Each record is written whole and flushed immediately.
//! - **Diagnostics**: human-readable `tracing` output on stderr. Not ordered
//!   against the event channel; never carries protocol state.

use std::fmt;
use std::io::{self, Write};

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, info};

use crate::core::events::RunEvent;

/// Writing to the event channel failed. Fatal for the run.
#[derive(Debug, Error)]
#[error("write event: {source}")]
pub struct EmitError {
    #[source]
    pub source: io::Error,
}

pub struct Emitter<W: Write> {
    out: W,
}

impl<W: Write> Emitter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Serialize `event` as one line and flush it.
    pub fn emit(&mut self, event: &RunEvent) -> Result<()> {
        let mut line = serde_json::to_string(event).map_err(|err| EmitError {
            source: io::Error::other(err),
        })?;
        line.push('\n');
        write_line(&mut self.out, line.as_bytes()).map_err(|source| EmitError { source })?;
        debug!(kind = event.kind(), "event emitted");
        Ok(())
    }

    /// Write a human-readable line to the diagnostic channel.
    pub fn log(&self, message: impl fmt::Display) {
        info!("{message}");
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn write_line<W: Write>(out: &mut W, line: &[u8]) -> io::Result<()> {
    out.write_all(line)?;
    out.flush()
}
