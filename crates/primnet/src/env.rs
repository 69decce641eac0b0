use std::env;
use std::sync::OnceLock;

static PRIMNET_FORCE_DEFAULT_LAYOUT: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// When `PRIMNET_FORCE_DEFAULT_LAYOUT` is set, the builders skip the
/// optimistic caller-layout instantiation and go straight to the fixed
/// default layout. Debug aid for tracking down layout negotiation issues.
pub(crate) fn force_default_layout() -> bool {
    *PRIMNET_FORCE_DEFAULT_LAYOUT.get_or_init(|| {
        match env::var("PRIMNET_FORCE_DEFAULT_LAYOUT") {
            Ok(value) if !value.trim().is_empty() => parse_bool(&value),
            _ => false,
        }
    })
}
