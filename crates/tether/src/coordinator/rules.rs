//! Seed visibility rules, as JSON lines.

use anyhow::{Context, Result};
use std::path::Path;

use tether_common::{RuleInfo, TetherError};

/// Rules installed into an empty registry when no rules file is configured.
///
/// Steward and Reeve see each other in every horde; the remaining rules
/// cover the fleet's built-in services.
pub const BASE_RULES: &str = r#"
{"rule":"1", "horde":"sharks", "from":"Pastiche", "to":"Pastiche", "owner":"fleetadmin"}
{"rule":"2", "horde":"jets", "from":"Pastiche", "to":"Pastiche", "owner":"fleetadmin"}
{"rule":"3", "horde":"sharks", "from":"Steward", "to":"Reeve", "owner":"fleetadmin"}
{"rule":"3", "horde":"jets", "from":"Steward", "to":"Reeve", "owner":"fleetadmin"}
{"rule":"4", "horde":"sharks", "from":"Reeve", "to":"Steward", "owner":"fleetadmin"}
{"rule":"4", "horde":"jets", "from":"Reeve", "to":"Steward", "owner":"fleetadmin"}
{"rule":"5", "horde":"sharks", "from":"Heartbeat", "to":"HealthCheck", "owner":"fleetadmin"}
{"rule":"6", "horde":"jets", "from":"Heartbeat", "to":"HealthCheck", "owner":"fleetadmin"}
{"rule":"7", "horde":"jets", "from":"Proctor", "to":"HealthCheck", "owner":"fleetadmin"}
{"rule":"8", "horde":"sharks", "from":"Proctor", "to":"HealthCheck", "owner":"fleetadmin"}
{"rule":"9", "horde":"jets", "from":"Proctor", "to":"Picket", "owner":"fleetadmin"}
{"rule":"10", "horde":"sharks", "from":"Proctor", "to":"Picket", "owner":"fleetadmin"}
{"rule":"11", "horde":"jets", "from":"Flock", "to":"Genghis", "owner":"fleetadmin"}
{"rule":"11", "horde":"sharks", "from":"Flock", "to":"Genghis", "owner":"fleetadmin"}
{"rule":"12", "horde":"Admin", "from":"Pastiche", "to":"Pastiche", "owner":"fleetadmin"}
{"rule":"13", "horde":"Admin", "from":"Steward", "to":"Reeve", "owner":"fleetadmin"}
{"rule":"14", "horde":"Admin", "from":"Reeve", "to":"Steward", "owner":"fleetadmin"}
{"rule":"15", "horde":"Admin", "from":"Heartbeat", "to":"HealthCheck", "owner":"fleetadmin"}
{"rule":"16", "horde":"Admin", "from":"Proctor", "to":"HealthCheck", "owner":"fleetadmin"}
{"rule":"17", "horde":"Admin", "from":"Proctor", "to":"Picket", "owner":"fleetadmin"}
"#;

/// Parse one rule per non-blank line
pub fn parse_rules(text: &str) -> Result<Vec<RuleInfo>, TetherError> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(n, line)| {
            serde_json::from_str::<RuleInfo>(line)
                .map_err(|e| TetherError::InvalidArgument(format!("rule {}: {}", n + 1, e)))
        })
        .collect()
}

/// Rules from `path`, or the base rules when no file is given
pub async fn load_rules(path: Option<&Path>) -> Result<Vec<RuleInfo>> {
    let Some(path) = path else {
        return Ok(parse_rules(BASE_RULES)?);
    };
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading rules file {}", path.display()))?;
    Ok(parse_rules(&text)?)
}
