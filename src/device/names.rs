//! Device name space
//!
//! Names are two letters, `ba..bz` then `ca..cz`, exposed as `/dev/xvd<name>`.
//! Mappings reported by the provider may use either the `/dev/sd` or the
//! `/dev/xvd` spelling of the same name.

use std::collections::BTreeSet;

pub const DEVICE_PREFIX: &str = "/dev/xvd";

const ALTERNATE_PREFIX: &str = "/dev/sd";

/// Every allocatable name in allocation order
pub(crate) fn candidates() -> impl Iterator<Item = String> {
    ['b', 'c']
        .into_iter()
        .flat_map(|first| ('a'..='z').map(move |second| format!("{}{}", first, second)))
}

/// First candidate not in `in_use`
pub(crate) fn next_free(in_use: &BTreeSet<String>) -> Option<String> {
    candidates().find(|name| !in_use.contains(name))
}

/// Short name of a device path, e.g. `/dev/sdba` -> `ba`
pub(crate) fn short_name(device: &str) -> &str {
    device
        .strip_prefix(DEVICE_PREFIX)
        .or_else(|| device.strip_prefix(ALTERNATE_PREFIX))
        .unwrap_or(device)
}

pub(crate) fn device_path(name: &str) -> String {
    format!("{}{}", DEVICE_PREFIX, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_order() {
        let all: Vec<String> = candidates().collect();
        assert_eq!(all.len(), 52);
        assert_eq!(all[0], "ba");
        assert_eq!(all[25], "bz");
        assert_eq!(all[26], "ca");
        assert_eq!(all[51], "cz");
    }

    #[test]
    fn test_next_free_skips_used() {
        let in_use: BTreeSet<String> = ["ba", "bb", "bd"].iter().map(|s| s.to_string()).collect();
        assert_eq!(next_free(&in_use).as_deref(), Some("bc"));

        let full: BTreeSet<String> = candidates().collect();
        assert_eq!(next_free(&full), None);
    }

    #[test]
    fn test_short_name() {
        assert_eq!(short_name("/dev/xvdba"), "ba");
        assert_eq!(short_name("/dev/sdbc"), "bc");
        assert_eq!(short_name("/dev/nvme1n1"), "/dev/nvme1n1");
        assert_eq!(device_path("ca"), "/dev/xvdca");
    }
}
