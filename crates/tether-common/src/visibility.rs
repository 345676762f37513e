//! Visibility rules: which catalog entries a viewer is allowed to reach.
//!
//! An entry is visible iff some rule has the viewer's horde, the viewer's
//! service as `from`, and the entry's service as `to`. Partial matches are
//! tracked only to explain an empty result.

use crate::ids::NodeId;
use crate::types::RuleInfo;

/// Partial match classes seen while evaluating rules
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Source and target matched but the horde did not
    pub horde_only_miss: bool,
    /// Horde and target matched but the source did not
    pub source_miss: bool,
    /// Horde and source matched but the target did not
    pub target_miss: bool,
}

impl Diagnostics {
    pub fn merge(&mut self, other: Diagnostics) {
        self.horde_only_miss |= other.horde_only_miss;
        self.source_miss |= other.source_miss;
        self.target_miss |= other.target_miss;
    }

    /// Explain why nothing was visible to `viewer`
    pub fn message(&self, what: &str, viewer: &NodeId) -> String {
        let reason = if self.target_miss {
            format!(
                "rules match horde and source, but not target for {}",
                viewer.service_name
            )
        } else if self.source_miss {
            format!(
                "rules match horde and target, but not source {}",
                viewer.service_name
            )
        } else if self.horde_only_miss {
            format!("rules match source and target, but not horde {}", viewer.horde)
        } else {
            format!(
                "no matching rules for horde={} source={}",
                viewer.horde, viewer.service_name
            )
        };
        format!("{} empty: {}", what, reason)
    }
}

/// Outcome of a single visibility check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Visibility {
    pub visible: bool,
    pub diagnostics: Diagnostics,
}

/// Can `viewer` see an entry whose service is `entry_service`?
pub fn can_see(viewer: &NodeId, entry_service: &str, rules: &[RuleInfo]) -> Visibility {
    let mut diagnostics = Diagnostics::default();
    for rule in rules {
        let horde = viewer.horde == rule.horde;
        let from = viewer.service_name == rule.from;
        let to = entry_service == rule.to;
        if horde && from && to {
            return Visibility {
                visible: true,
                diagnostics,
            };
        }
        if !horde && from && to {
            diagnostics.horde_only_miss = true;
        }
        if horde && to {
            diagnostics.source_miss = true;
        }
        if horde && from {
            diagnostics.target_miss = true;
        }
    }
    Visibility {
        visible: false,
        diagnostics,
    }
}
