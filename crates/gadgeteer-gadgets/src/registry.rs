//! Gadget registry: one writer at build time, many readers at run time.

use crate::gadget::Gadget;
use gadgeteer_core::SchemaError;
use std::collections::HashMap;
use std::sync::Arc;

pub struct GadgetRegistry {
    gadgets: HashMap<String, Arc<dyn Gadget>>,
}

impl Default for GadgetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GadgetRegistry {
    pub fn new() -> Self {
        Self {
            gadgets: HashMap::new(),
        }
    }

    /// Register a gadget. The declared schema is checked here so a bad
    /// descriptor fails at build time, not mid-run. Replaces any existing
    /// gadget with the same name.
    pub fn register(&mut self, gadget: impl Gadget + 'static) -> Result<(), SchemaError> {
        gadget.schema().check()?;
        let name = gadget.name().to_string();
        self.gadgets.insert(name, Arc::new(gadget));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Gadget>> {
        self.gadgets.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.gadgets.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.gadgets.is_empty()
    }

    /// Registered names, sorted for stable output.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.gadgets.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Error body for a lookup miss: name every registered gadget so the
    /// LLM can self-correct on the next turn.
    pub fn unknown_gadget_message(&self, name: &str) -> String {
        if self.gadgets.is_empty() {
            return format!("Unknown gadget '{}'. No gadgets are registered.", name);
        }
        format!(
            "Unknown gadget '{}'. Registered gadgets: {}",
            name,
            self.list().join(", ")
        )
    }

    /// Schema-derived usage text for one gadget, with worked examples.
    pub fn usage_text(&self, name: &str) -> Option<String> {
        let gadget = self.gadgets.get(name)?;
        let mut out = format!(
            "Gadget Usage: {}\n{}\n\nParameters (JSON Schema):\n{}",
            gadget.name(),
            gadget.description(),
            serde_json::to_string_pretty(&gadget.schema().to_json_schema())
                .unwrap_or_else(|_| "{}".to_string()),
        );
        let examples = gadget.examples();
        if !examples.is_empty() {
            out.push_str("\n\nExamples:");
            for example in examples {
                out.push_str(&format!(
                    "\n- {}\n  {}",
                    example.description,
                    serde_json::to_string(&example.parameters).unwrap_or_default()
                ));
            }
        }
        Some(out)
    }

    /// Render every registered gadget for inclusion in a system prompt.
    pub fn definitions_prompt(&self) -> String {
        let mut sections = Vec::new();
        for name in self.list() {
            if let Some(usage) = self.usage_text(name) {
                sections.push(usage);
            }
        }
        sections.join("\n\n")
    }
}
