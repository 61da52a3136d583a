pub const TOPIC_STATUS: &str = "status";
pub const TOPIC_RSSI: &str = "rssi";
pub const TOPIC_COMMAND: &str = "command";

/// Joins the configured topic root and a suffix. The root carries its own
/// trailing separator.
pub fn topic(root: &str, suffix: &str) -> String {
    format!("{root}{suffix}")
}
