//! Agent descriptors and hot-reloadable settings

use serde::{Deserialize, Serialize};

use crate::capability::Capability;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionSettings {
    #[serde(default = "default_reflection_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_min_quality")]
    pub min_quality_threshold: f64,
}

fn default_reflection_enabled() -> bool {
    true
}

fn default_max_retries() -> u32 {
    2
}

fn default_min_quality() -> f64 {
    60.0
}

impl Default for ReflectionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 2,
            min_quality_threshold: 60.0,
        }
    }
}

/// Per-agent configuration. Created at registry init; the fields marked
/// hot-swappable may change via `AgentOverrides` without a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub thinking_mode: bool,
    #[serde(default)]
    pub reflection: ReflectionSettings,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

fn default_enabled() -> bool {
    true
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_iterations() -> u32 {
    10
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>, capabilities: Vec<Capability>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            default_model: None,
            temperature: 0.7,
            max_iterations: 10,
            thinking_mode: false,
            reflection: ReflectionSettings::default(),
            capabilities,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_thinking_mode(mut self, thinking_mode: bool) -> Self {
        self.thinking_mode = thinking_mode;
        self
    }

    pub fn with_reflection(mut self, reflection: ReflectionSettings) -> Self {
        self.reflection = reflection;
        self
    }

    pub fn offers(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Apply a hot-reload patch. Returns the names of the fields changed.
    pub fn apply(&mut self, overrides: &AgentOverrides) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if let Some(t) = overrides.temperature {
            if (t - self.temperature).abs() > f32::EPSILON {
                self.temperature = t;
                changed.push("temperature");
            }
        }
        if let Some(m) = overrides.max_iterations {
            if m != self.max_iterations {
                self.max_iterations = m;
                changed.push("max_iterations");
            }
        }
        if let Some(tm) = overrides.thinking_mode {
            if tm != self.thinking_mode {
                self.thinking_mode = tm;
                changed.push("thinking_mode");
            }
        }
        if let Some(ref r) = overrides.reflection {
            if *r != self.reflection {
                self.reflection = r.clone();
                changed.push("reflection");
            }
        }
        if let Some(ref model) = overrides.default_model {
            if self.default_model.as_deref() != Some(model.as_str()) {
                self.default_model = Some(model.clone());
                changed.push("default_model");
            }
        }
        changed
    }
}

/// Fields that are safe to hot-swap on a live agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOverrides {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub thinking_mode: Option<bool>,
    #[serde(default)]
    pub reflection: Option<ReflectionSettings>,
    #[serde(default)]
    pub default_model: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_reports_changed_fields() {
        let mut desc = AgentDescriptor::new("code_writer", vec![Capability::CodeGeneration]);
        let overrides = AgentOverrides {
            temperature: Some(0.2),
            max_iterations: Some(5),
            ..Default::default()
        };
        let changed = desc.apply(&overrides);
        assert_eq!(changed, vec!["temperature", "max_iterations"]);
        assert_eq!(desc.temperature, 0.2);
        assert_eq!(desc.max_iterations, 5);
    }

    #[test]
    fn apply_is_a_noop_for_equal_values() {
        let mut desc = AgentDescriptor::new("react", vec![Capability::Reasoning]);
        let overrides = AgentOverrides {
            max_iterations: Some(desc.max_iterations),
            ..Default::default()
        };
        assert!(desc.apply(&overrides).is_empty());
    }

    #[test]
    fn offers_checks_capability_set() {
        let desc = AgentDescriptor::new(
            "research",
            vec![Capability::WebSearch, Capability::Research],
        );
        assert!(desc.offers(Capability::WebSearch));
        assert!(!desc.offers(Capability::Workflow));
    }
}
