//! Canonical v3 config hash.
//!
//! The hash is the idempotency and change-detection key for the whole
//! deployment pipeline: it is computed once per invocation, carried
//! through deploy/confirm-mint/update, and compared by the backend to
//! detect config drift. It covers the behavior-relevant fields only:
//! `image` and capability descriptions are deliberately excluded, and the
//! array-order independence below keeps JSON reshuffles from minting
//! twice.

use sha2::{Digest, Sha256};
use teneo_types::AgentConfig;

/// Compute the v3 config hash as a 64-char lowercase hex string.
///
/// Canonical serialization, segments joined by `|`:
/// `v3 | agent_id | name | description | agent_type | caps | nlp_fallback
/// | categories [| commands]` where `caps` is the sorted, deduplicated
/// capability names joined by `,`, `categories` is sorted and joined by
/// `,`, and `commands` (present only when non-empty) is `trigger:price`
/// pairs sorted by trigger, price in shortest lossless decimal form.
pub fn config_hash(config: &AgentConfig) -> String {
    let mut cap_names: Vec<&str> = config.capabilities.iter().map(|c| c.name.as_str()).collect();
    cap_names.sort_unstable();
    cap_names.dedup();

    let mut categories: Vec<&str> = config.categories.iter().map(|c| c.as_str()).collect();
    categories.sort_unstable();

    let mut parts = vec![
        "v3".to_string(),
        config.agent_id.clone(),
        config.name.clone(),
        config.description.clone(),
        config.agent_type.as_str().to_string(),
        cap_names.join(","),
        config.nlp_fallback.to_string(),
        categories.join(","),
    ];

    if !config.commands.is_empty() {
        let mut entries: Vec<(String, String)> = config
            .commands
            .iter()
            .map(|cmd| {
                (
                    cmd.trigger.clone(),
                    format_price(cmd.price_per_unit.unwrap_or(0.0)),
                )
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let cmd_parts: Vec<String> = entries
            .iter()
            .map(|(trigger, price)| format!("{trigger}:{price}"))
            .collect();
        parts.push(cmd_parts.join(","));
    }

    let data = parts.join("|");
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// Shortest decimal representation that round-trips the value, never in
/// exponent notation. `1.0` renders as `1`, `0.5` as `0.5`.
fn format_price(price: f64) -> String {
    let rendered = format!("{price}");
    // Rust prints integral floats with a trailing ".0"; strip it so the
    // segment matches the backend's canonical form.
    match rendered.strip_suffix(".0") {
        Some(integral) if !integral.is_empty() => integral.to_string(),
        _ => rendered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teneo_types::{AgentType, Capability, Command};

    fn make_config() -> AgentConfig {
        AgentConfig {
            name: "Test Agent".into(),
            agent_id: "test-agent".into(),
            description: "A config-hash fixture agent".into(),
            image: None,
            agent_type: AgentType::Command,
            categories: vec!["AI".into()],
            capabilities: vec![Capability::new("cap1")],
            commands: vec![],
            nlp_fallback: false,
            mcp_manifest: None,
            metadata_version: None,
        }
    }

    fn make_command(trigger: &str, price: Option<f64>) -> Command {
        Command {
            trigger: trigger.into(),
            description: None,
            price_per_unit: price,
            price_type: None,
            task_unit: None,
        }
    }

    /// Pinned digest for a known config. If this changes, minted agents
    /// would be flagged UPDATE_REQUIRED on every restart.
    #[test]
    fn test_fixture_vector() {
        let config = make_config();
        let expected = {
            let data =
                "v3|test-agent|Test Agent|A config-hash fixture agent|command|cap1|false|AI";
            hex::encode(Sha256::digest(data.as_bytes()))
        };
        assert_eq!(config_hash(&config), expected);
    }

    #[test]
    fn test_deterministic() {
        let config = make_config();
        let first = config_hash(&config);
        for _ in 0..1000 {
            assert_eq!(config_hash(&config), first);
        }
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn test_order_independence() {
        let mut a = make_config();
        a.capabilities = vec![Capability::new("alpha"), Capability::new("beta")];
        a.categories = vec!["DeFi".into(), "AI".into()];

        let mut b = make_config();
        b.capabilities = vec![Capability::new("beta"), Capability::new("alpha")];
        b.categories = vec!["AI".into(), "DeFi".into()];

        assert_eq!(config_hash(&a), config_hash(&b));
    }

    #[test]
    fn test_capability_description_does_not_affect_hash() {
        let a = make_config();
        let mut b = make_config();
        b.capabilities[0].description = Some("purely cosmetic".into());
        assert_eq!(config_hash(&a), config_hash(&b));
    }

    #[test]
    fn test_image_does_not_affect_hash() {
        let a = make_config();
        let mut b = make_config();
        b.image = Some("https://example.com/logo.png".into());
        assert_eq!(config_hash(&a), config_hash(&b));
    }

    #[test]
    fn test_behavior_fields_change_hash() {
        let base = config_hash(&make_config());

        let mut c = make_config();
        c.name = "Other Agent".into();
        assert_ne!(config_hash(&c), base);

        let mut c = make_config();
        c.description = "A different description entirely".into();
        assert_ne!(config_hash(&c), base);

        let mut c = make_config();
        c.capabilities[0].name = "cap2".into();
        assert_ne!(config_hash(&c), base);

        let mut c = make_config();
        c.nlp_fallback = true;
        assert_ne!(config_hash(&c), base);
    }

    #[test]
    fn test_command_trigger_and_price_change_hash() {
        let mut with_cmd = make_config();
        with_cmd.commands = vec![make_command("swap", Some(0.5))];
        let base = config_hash(&with_cmd);

        let mut c = with_cmd.clone();
        c.commands[0].trigger = "trade".into();
        assert_ne!(config_hash(&c), base);

        let mut c = with_cmd.clone();
        c.commands[0].price_per_unit = Some(0.75);
        assert_ne!(config_hash(&c), base);

        // Command order must not matter
        let mut a = make_config();
        a.commands = vec![make_command("a", Some(1.0)), make_command("b", Some(2.0))];
        let mut b = make_config();
        b.commands = vec![make_command("b", Some(2.0)), make_command("a", Some(1.0))];
        assert_eq!(config_hash(&a), config_hash(&b));
    }

    #[test]
    fn test_price_formatting() {
        assert_eq!(format_price(0.0), "0");
        assert_eq!(format_price(1.0), "1");
        assert_eq!(format_price(0.5), "0.5");
        assert_eq!(format_price(0.1), "0.1");
        assert_eq!(format_price(2.25), "2.25");
    }
}
