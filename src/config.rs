//! Runtime configuration

/// Configuration for the orchestration core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    /// Failed attempts before a queued message is given up
    pub max_retries: u32,
    /// Context window given to newly created sessions
    pub max_context_tokens: u64,
    pub event_bus_capacity: usize,
    pub inbox_capacity: usize,
    /// Agent type used when the caller does not pick one
    pub default_agent_type: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_context_tokens: 128_000,
            event_bus_capacity: 256,
            inbox_capacity: 64,
            default_agent_type: "agentic".to_string(),
        }
    }
}

impl CoreConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset or unparseable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            max_retries: parsed(&lookup, "FLOWCHAT_MAX_RETRIES").unwrap_or(defaults.max_retries),
            max_context_tokens: parsed(&lookup, "FLOWCHAT_MAX_CONTEXT_TOKENS")
                .unwrap_or(defaults.max_context_tokens),
            event_bus_capacity: parsed(&lookup, "FLOWCHAT_EVENT_BUS_CAPACITY")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.event_bus_capacity),
            inbox_capacity: parsed(&lookup, "FLOWCHAT_INBOX_CAPACITY")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.inbox_capacity),
            default_agent_type: lookup("FLOWCHAT_DEFAULT_AGENT")
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(defaults.default_agent_type),
        }
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable config value");
            None
        }
    }
}
