//! Linux capability sets around the privilege drop
//!
//! # Capability Sets (Important!)
//!
//! ```text
//! ┌───────────────────┬─────────────────────────────────────────────┐
//! │  Permitted (P)    │ Maximum caps this process CAN have          │
//! ├───────────────────┼─────────────────────────────────────────────┤
//! │  Effective (E)    │ Caps currently ACTIVE right now             │
//! ├───────────────────┼─────────────────────────────────────────────┤
//! │  Inheritable (I)  │ Caps that may survive exec                  │
//! ├───────────────────┼─────────────────────────────────────────────┤
//! │  Ambient (A)      │ Caps granted to non-setuid programs on exec │
//! ├───────────────────┼─────────────────────────────────────────────┤
//! │  Bounding (B)     │ Ceiling for anything gained through exec    │
//! └───────────────────┴─────────────────────────────────────────────┘
//! ```
//!
//! When a root process calls `setuid()` to a non-zero uid without
//! `PR_SET_KEEPCAPS`, the kernel empties P, E and A. B and I are left
//! alone, so a file with `cap_net_raw+ei` could still hand a capability
//! back to the application after exec. We clear those before the drop
//! and check P and E afterwards.

use caps::{CapSet, Capability};

// ═══════════════════════════════════════════════════════════════════════════
// CapabilityReset
// ═══════════════════════════════════════════════════════════════════════════
// WHAT IT IS:
//   Outcome of clearing the exec-time capability sets while still root.
//
// BEST EFFORT:
//   Dropping from the bounding set needs CAP_SETPCAP, which a container
//   runtime may have removed already. In that case the runtime's own
//   bounding set is what we get; the drop itself still proceeds.
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CapabilityReset {
    /// Capabilities removed from the bounding set
    pub bounding_dropped: usize,
    /// Capabilities that could not be removed from the bounding set
    pub bounding_failed: Vec<String>,
    pub inheritable_cleared: bool,
    pub ambient_cleared: bool,
}

impl CapabilityReset {
    // ═══════════════════════════════════════════════════════════════════════
    // apply() - Clear bounding, inheritable and ambient sets
    // ═══════════════════════════════════════════════════════════════════════
    // Must run BEFORE setuid(): afterwards CAP_SETPCAP is gone and the
    // bounding set can no longer shrink.
    // ═══════════════════════════════════════════════════════════════════════
    pub fn apply() -> Self {
        let mut reset = Self::default();

        let bounding = caps::read(None, CapSet::Bounding).unwrap_or_default();
        let mut names: Vec<Capability> = bounding.into_iter().collect();
        names.sort_by_key(|cap| cap.index());

        for cap in names {
            match caps::drop(None, CapSet::Bounding, cap) {
                Ok(()) => reset.bounding_dropped += 1,
                Err(_) => reset.bounding_failed.push(cap.to_string()),
            }
        }

        reset.inheritable_cleared = caps::clear(None, CapSet::Inheritable).is_ok();
        reset.ambient_cleared = caps::clear(None, CapSet::Ambient).is_ok();

        reset
    }

    /// True when every exec-time set was emptied
    pub fn is_complete(&self) -> bool {
        self.bounding_failed.is_empty() && self.inheritable_cleared && self.ambient_cleared
    }
}

/// Capabilities still present in the permitted or effective set
pub fn retained() -> Result<Vec<String>, caps::errors::CapsError> {
    let mut held: Vec<Capability> = caps::read(None, CapSet::Permitted)?
        .union(&caps::read(None, CapSet::Effective)?)
        .copied()
        .collect();
    held.sort_by_key(|cap| cap.index());
    Ok(held.into_iter().map(|cap| cap.to_string()).collect())
}

/// Get the current capabilities of this process (for debugging)
pub fn describe_current_caps() -> String {
    let mut output = String::new();

    for (name, set) in [
        ("effective", CapSet::Effective),
        ("permitted", CapSet::Permitted),
        ("inheritable", CapSet::Inheritable),
        ("ambient", CapSet::Ambient),
    ] {
        if !output.is_empty() {
            output.push(' ');
        }
        match caps::read(None, set) {
            Ok(held) if held.is_empty() => output.push_str(&format!("{}=(none)", name)),
            Ok(held) => {
                let mut held: Vec<Capability> = held.into_iter().collect();
                held.sort_by_key(|cap| cap.index());
                let list: Vec<String> = held.iter().map(|cap| cap.to_string()).collect();
                output.push_str(&format!("{}={}", name, list.join(",")));
            }
            Err(_) => output.push_str(&format!("{}=(unreadable)", name)),
        }
    }

    output
}
