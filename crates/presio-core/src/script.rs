//! The expression adapter.
//!
//! [`Scripts`] wraps the template language behind a never-fails surface:
//! parse and runtime failures degrade to [`Value::Null`] with a structured
//! diagnostic, so callers can evaluate user-authored text without guards.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::expr::{EvalContext, Template};
use crate::registry::Registry;
use crate::value::{Producer, Value};

/// A replacement pair: token plus a supplier resolved once at compile time.
pub type Replacement = (String, Producer);

/// Compiles and evaluates template text against the registry.
///
/// Cloning shares the underlying registry and decompile sink.
#[derive(Clone)]
pub struct Scripts {
    registry: Arc<Registry>,
    sink: Option<Arc<Mutex<String>>>,
}

impl Scripts {
    /// Create an adapter over the given registry.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            sink: None,
        }
    }

    /// Attach a decompilation sink.
    ///
    /// Every successful compile writes a readable reconstruction of the
    /// compiled template into the sink, for preview tooling.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<Mutex<String>>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// The registry this adapter evaluates against.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Compile template text into a lazy producer.
    ///
    /// With `plain` set, the text is returned as a literal `String`
    /// producer and no parsing occurs. Otherwise each replacement
    /// `(token, supplier)` is resolved once: a supplied value naming a
    /// live registry path rebinds the token's variable node to that path,
    /// anything else substitutes the token textually with a quoted
    /// literal (or `null` when empty).
    ///
    /// Failures never propagate: parse errors are logged and yield a
    /// Null-producer, runtime errors are caught per evaluation.
    #[must_use]
    pub fn compile(
        &self,
        text: &str,
        override_target: &str,
        plain: bool,
        replacements: &[Replacement],
    ) -> Producer {
        if plain {
            let literal = text.to_string();
            return Arc::new(move || Value::String(literal.clone()));
        }

        // Resolve each supplier once, splitting replacements into live
        // path rebinds and textual literal substitutions.
        let mut source = text.to_string();
        let mut rebinds = Vec::new();
        for (token, supplier) in replacements {
            let resolved = supplier().to_string();
            if self.registry.contains(&resolved) {
                rebinds.push((token.clone(), resolved));
            } else if resolved.is_empty() {
                source = source.replace(token.as_str(), "null");
            } else {
                source = source.replace(token.as_str(), &format!("{resolved:?}"));
            }
        }

        let mut template = match Template::parse(&source) {
            Ok(template) => template,
            Err(diagnostics) => {
                error!(text = %source, "Failed to parse template");
                for diagnostic in &diagnostics {
                    error!("  {diagnostic}");
                }
                return Arc::new(|| Value::Null);
            }
        };
        for (token, path) in &rebinds {
            template.rebind_variable(token, path);
        }

        if let Some(sink) = &self.sink {
            *sink.lock().expect("decompile sink lock poisoned") = template.to_string();
        }

        let registry = Arc::clone(&self.registry);
        let target = override_target.to_string();
        Arc::new(move || {
            let mut ctx = EvalContext::new(&registry);
            if !target.is_empty() {
                ctx.locals
                    .insert("target".to_string(), Value::String(target.clone()));
            }
            match template.eval(&ctx) {
                Ok(value) => value,
                Err(err) => {
                    debug!(template = %template, %err, "Template evaluation failed");
                    Value::Null
                }
            }
        })
    }

    /// Evaluate text to a display string; `Null` becomes empty.
    #[must_use]
    pub fn get_result(
        &self,
        text: &str,
        override_target: &str,
        replacements: &[Replacement],
    ) -> String {
        self.compile(text, override_target, false, replacements)().to_string()
    }

    /// Snapshot of every placeholder matching the filters, rendered for
    /// preview output.
    #[must_use]
    pub fn placeholder_preview(&self, filters: &[&str]) -> BTreeMap<String, String> {
        self.registry
            .query(filters)
            .into_iter()
            .map(|(path, producer)| (path, producer().to_string()))
            .collect()
    }
}

/// Capitalize the first letter of every word, `passes` times.
///
/// Zero passes disables formatting. Extra passes only matter when a prior
/// pass exposes new word boundaries, matching the configurable pass count
/// of the word-casing step.
#[must_use]
pub fn format_words(text: &str, passes: u32) -> String {
    let mut out = text.to_string();
    for _ in 0..passes {
        let mut formatted = String::with_capacity(out.len());
        let mut at_word_start = true;
        for ch in out.chars() {
            if ch.is_whitespace() || ch == '_' {
                at_word_start = true;
                formatted.push(ch);
            } else if at_word_start {
                formatted.extend(ch.to_uppercase());
                at_word_start = false;
            } else {
                formatted.push(ch);
            }
        }
        if formatted == out {
            break;
        }
        out = formatted;
    }
    out
}
