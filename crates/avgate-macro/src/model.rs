use avgate_proto::{EncodeMode, Suffix};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::MacroError;

pub const DEFAULT_NAME: &str = "Unnamed Macro";
pub const DEFAULT_ICON: &str = "▶";
pub const DEFAULT_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Tcp,
    Udp,
    Rs232,
    Delay,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Tcp => "tcp",
            StepKind::Udp => "udp",
            StepKind::Rs232 => "rs232",
            StepKind::Delay => "delay",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_delay_ms() -> u64 {
    DEFAULT_DELAY_MS
}

fn default_name() -> String {
    DEFAULT_NAME.into()
}

fn default_icon() -> String {
    DEFAULT_ICON.into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MacroStep {
    #[serde(alias = "type")]
    pub kind: StepKind,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub mode: EncodeMode,
    #[serde(default)]
    pub suffix: Suffix,
    /// Pause after the step; for a Delay step, the whole step.
    #[serde(default = "default_delay_ms", alias = "delay")]
    pub delay_ms: u64,
}

impl MacroStep {
    pub fn delay(ms: u64) -> Self {
        Self {
            kind: StepKind::Delay,
            target: String::new(),
            port: 0,
            payload: String::new(),
            mode: EncodeMode::Ascii,
            suffix: Suffix::None,
            delay_ms: ms,
        }
    }

    fn validate(&self, index: usize) -> Result<(), MacroError> {
        if matches!(self.kind, StepKind::Tcp | StepKind::Udp) {
            if self.target.trim().is_empty() {
                return Err(MacroError::Validation(format!("step {}: {} step needs a target", index + 1, self.kind)));
            }
            if self.port == 0 {
                return Err(MacroError::Validation(format!("step {}: {} step needs a port", index + 1, self.kind)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Macro {
    pub id: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_icon")]
    pub icon: String,
    #[serde(default)]
    pub steps: Vec<MacroStep>,
}

/// Incoming save request; `id` absent or empty means "create".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub steps: Vec<MacroStep>,
}

impl MacroRecord {
    pub fn parse(json: &str) -> Result<Self, MacroError> {
        serde_json::from_str(json).map_err(|e| MacroError::Validation(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), MacroError> {
        for (i, step) in self.steps.iter().enumerate() {
            step.validate(i)?;
        }
        Ok(())
    }

    pub(crate) fn into_macro(self, id: String) -> Macro {
        Macro {
            id,
            name: self.name.filter(|n| !n.is_empty()).unwrap_or_else(default_name),
            icon: self.icon.filter(|i| !i.is_empty()).unwrap_or_else(default_icon),
            steps: self.steps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MacroSummary {
    pub id: String,
    pub name: String,
    pub icon: String,
    pub step_count: usize,
}

impl From<&Macro> for MacroSummary {
    fn from(m: &Macro) -> Self {
        Self { id: m.id.clone(), name: m.name.clone(), icon: m.icon.clone(), step_count: m.steps.len() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_field_names_are_accepted() {
        let step: MacroStep =
            serde_json::from_str(r#"{"type":"tcp","target":"10.0.0.5","port":23,"payload":"PWR ON","suffix":"\\r","delay":250}"#)
                .unwrap();
        assert_eq!(step.kind, StepKind::Tcp);
        assert_eq!(step.suffix, Suffix::Cr);
        assert_eq!(step.delay_ms, 250);
        assert_eq!(step.mode, EncodeMode::Ascii);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let step: MacroStep = serde_json::from_str(r#"{"kind":"rs232","payload":"Q"}"#).unwrap();
        assert_eq!(step.delay_ms, DEFAULT_DELAY_MS);
        assert_eq!(step.suffix, Suffix::None);

        let m: Macro = serde_json::from_str(r#"{"id":"a1"}"#).unwrap();
        assert_eq!(m.name, DEFAULT_NAME);
        assert_eq!(m.icon, DEFAULT_ICON);
        assert!(m.steps.is_empty());
    }

    #[test]
    fn unknown_kind_is_a_validation_error() {
        let err = MacroRecord::parse(r#"{"name":"x","steps":[{"kind":"pjlink","target":"a","port":1}]}"#).unwrap_err();
        assert!(matches!(err, MacroError::Validation(_)));
    }

    #[test]
    fn network_steps_need_target_and_port() {
        let rec = MacroRecord::parse(r#"{"steps":[{"kind":"udp","target":"10.0.0.9"}]}"#).unwrap();
        assert!(matches!(rec.validate(), Err(MacroError::Validation(msg)) if msg.contains("port")));

        let rec = MacroRecord::parse(r#"{"steps":[{"kind":"delay","delayMs":100},{"kind":"rs232","payload":"1*"}]}"#).unwrap();
        assert!(rec.validate().is_ok());
    }

    #[test]
    fn step_serializes_with_camel_case() {
        let v = serde_json::to_value(MacroStep::delay(100)).unwrap();
        assert_eq!(v["kind"], "delay");
        assert_eq!(v["delayMs"], 100);
        assert_eq!(v["suffix"], "none");
    }
}
