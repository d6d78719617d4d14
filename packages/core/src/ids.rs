// ABOUTME: Entity id generation - short uuid hex with entity prefixes

/// `prefix-<12 hex chars>`, e.g. `sandbox-3f2a9c81d04e`.
pub fn new_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &hex[..12])
}
