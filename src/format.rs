//! Formatter registry.
//!
//! The response pipeline dispatches buffered payloads to a formatter
//! function keyed by content kind. Formatters are opaque plug-ins: the
//! pipeline only knows that a formatter either produced terminal-ready
//! bytes or failed, in which case the raw payload is emitted unchanged.
//! JSON ships built-in because the gRPC streaming path depends on it.

use crate::sniff::ContentKind;
use std::collections::HashMap;

/// A buffered formatter: payload in, terminal-ready bytes out.
/// An `Err` means "emit the raw bytes instead".
pub type BufferedFormatter = fn(&[u8]) -> Result<Vec<u8>, String>;

/// Registry of buffered formatters. Streaming kinds (gRPC, NDJSON, SSE)
/// never reach this table; the pipeline handles them inline.
pub struct Registry {
    formatters: HashMap<ContentKind, BufferedFormatter>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            formatters: HashMap::new(),
        }
    }

    /// The built-in table. JSON is implemented here; the other kinds are
    /// registered by the binary when their renderers are linked in.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(ContentKind::Json, format_json);
        registry
    }

    pub fn register(&mut self, kind: ContentKind, f: BufferedFormatter) {
        self.formatters.insert(kind, f);
    }

    /// Format a payload, or `None` when no formatter is registered for the
    /// kind.
    pub fn format(&self, kind: ContentKind, data: &[u8]) -> Option<Result<Vec<u8>, String>> {
        self.formatters.get(&kind).map(|f| f(data))
    }
}

/// Pretty-print JSON with two-space indentation. Invalid JSON is an error
/// so the pipeline falls back to the raw bytes.
pub fn format_json(data: &[u8]) -> Result<Vec<u8>, String> {
    let value: serde_json::Value =
        serde_json::from_slice(data).map_err(|e| format!("invalid json: {e}"))?;
    let mut out = serde_json::to_vec_pretty(&value).map_err(|e| e.to_string())?;
    out.push(b'\n');
    Ok(out)
}
