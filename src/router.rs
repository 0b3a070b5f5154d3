use crate::config::Config;

/// Default upstream targets for each Claude tier when no env override is set.
pub const DEFAULT_OPUS_MODEL: &str = "gpt-5";
pub const DEFAULT_SONNET_MODEL: &str = "gpt-5";
pub const DEFAULT_HAIKU_MODEL: &str = "gpt-5-mini";

/// Map a client-facing model name to the upstream model name.
///
/// Tier keywords are matched on a lowercased copy, haiku before sonnet before
/// opus; non-Claude identifiers pass through unchanged so clients can address
/// upstream models directly.
pub fn map_model(client_model: &str, config: &Config) -> String {
    let lowered = client_model.to_lowercase();

    if lowered.contains("haiku") {
        return config
            .haiku_override
            .clone()
            .unwrap_or_else(|| DEFAULT_HAIKU_MODEL.to_string());
    }
    if lowered.contains("sonnet") {
        return config
            .sonnet_override
            .clone()
            .unwrap_or_else(|| DEFAULT_SONNET_MODEL.to_string());
    }
    if lowered.contains("opus") {
        return config
            .opus_override
            .clone()
            .unwrap_or_else(|| DEFAULT_OPUS_MODEL.to_string());
    }

    client_model.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::new("https://api.openai.com/v1", Some("sk-test".to_string())).expect("config")
    }

    #[test]
    fn routes_tiers_to_defaults() {
        let config = test_config();
        assert_eq!(map_model("claude-3-5-haiku-20241022", &config), "gpt-5-mini");
        assert_eq!(map_model("claude-sonnet-4-20250514", &config), "gpt-5");
        assert_eq!(map_model("claude-opus-4-20250514", &config), "gpt-5");
    }

    #[test]
    fn overrides_win_over_defaults() {
        let mut config = test_config();
        config.haiku_override = Some("qwen2.5-coder".to_string());
        config.sonnet_override = Some("deepseek-chat".to_string());
        config.opus_override = Some("grok-4".to_string());
        assert_eq!(map_model("claude-3-5-haiku", &config), "qwen2.5-coder");
        assert_eq!(map_model("CLAUDE-SONNET-4", &config), "deepseek-chat");
        assert_eq!(map_model("claude-opus-4", &config), "grok-4");
    }

    #[test]
    fn non_claude_names_pass_through() {
        let config = test_config();
        assert_eq!(map_model("gpt-4o", &config), "gpt-4o");
        assert_eq!(map_model("llama3.3:70b", &config), "llama3.3:70b");
    }

    #[test]
    fn routing_is_idempotent_once_resolved() {
        let config = test_config();
        let routed = map_model("claude-sonnet-4-20250514", &config);
        assert_eq!(map_model(&routed, &config), routed);
    }
}
