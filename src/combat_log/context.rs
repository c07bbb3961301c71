pub(crate) const UNKNOWN: &str = "Unknown";

/// Parse state owned by one monitor: the configured character and the last
/// system announced by a `Listener:` line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParserContext {
    character_name: String,
    system_name: Option<String>,
    system_security: Option<String>,
}

impl ParserContext {
    pub fn new(character_name: impl Into<String>) -> Self {
        Self {
            character_name: character_name.into(),
            system_name: None,
            system_security: None,
        }
    }

    pub fn character_name(&self) -> &str {
        &self.character_name
    }

    pub(crate) fn character_or_unknown(&self) -> &str {
        if self.character_name.trim().is_empty() {
            UNKNOWN
        } else {
            &self.character_name
        }
    }

    pub fn system_name(&self) -> &str {
        self.system_name.as_deref().unwrap_or(UNKNOWN)
    }

    pub fn system_security(&self) -> &str {
        self.system_security.as_deref().unwrap_or(UNKNOWN)
    }

    pub fn observe_system(&mut self, name: &str, security: &str) {
        self.system_name = Some(name.to_string());
        self.system_security = Some(security.to_string());
    }

    /// Drops the observed system and switches to `character_name`.
    pub fn reset(&mut self, character_name: impl Into<String>) {
        *self = Self::new(character_name);
    }
}
