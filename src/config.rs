//! Static slot configuration.
//!
//! The slot file maps stable USB topology identifiers to reserved TCP ports
//! and optional board-control pins:
//!
//! ```json
//! { "slots": [ { "slot_key": "platform-...-usb-0:1.1.2:1.0",
//!                "label": "esp32-a", "tcp_port": 4001,
//!                "gpio_boot": 5, "gpio_en": 6 } ] }
//! ```
//!
//! A missing file is not fatal; the supervisor starts with an empty
//! registry. A malformed entry is skipped, the remaining entries still load.

use std::path::Path;

use serde::Deserialize;
use tracing::{error, warn};

/// One configured slot record.
#[derive(Debug, Clone, Deserialize)]
pub struct SlotConfig {
    /// Stable topological identifier of the physical USB position.
    pub slot_key: String,
    /// Human-readable name.
    #[serde(default)]
    pub label: Option<String>,
    /// Reserved localhost port for the RFC2217 proxy. Absent means the slot
    /// is tracked but never serviced.
    #[serde(default)]
    pub tcp_port: Option<u16>,
    /// Board-control pin forcing the device into its ROM loader.
    #[serde(default)]
    pub gpio_boot: Option<u8>,
    /// Board-control pin wired to the device reset/enable line.
    #[serde(default)]
    pub gpio_en: Option<u8>,
    /// Overrides the device-node open-probe heuristic. `Some(false)` never
    /// opens the node during the settle probe, `Some(true)` always does.
    #[serde(default)]
    pub probe_open: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct SlotFile {
    #[serde(default)]
    slots: Vec<serde_json::Value>,
}

/// Load slot records from `path`.
///
/// Entries that fail to deserialize are dropped individually so one typo
/// does not take the whole rack offline.
pub fn load_slots(path: &Path) -> Vec<SlotConfig> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("No slot configuration at {}: {e}", path.display());
            return Vec::new();
        }
    };

    let file: SlotFile = match serde_json::from_str(&raw) {
        Ok(file) => file,
        Err(e) => {
            error!("Unreadable slot configuration {}: {e}", path.display());
            return Vec::new();
        }
    };

    let mut slots = Vec::with_capacity(file.slots.len());
    for entry in file.slots {
        match serde_json::from_value::<SlotConfig>(entry.clone()) {
            Ok(slot) => slots.push(slot),
            Err(e) => error!("Skipping malformed slot entry {entry}: {e}"),
        }
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_file_yields_empty_registry() {
        let slots = load_slots(Path::new("/nonexistent/slots.json"));
        assert!(slots.is_empty());
    }

    #[test]
    fn loads_full_and_minimal_entries() {
        let file = write_config(
            r#"{ "slots": [
                 { "slot_key": "a", "label": "esp32-a", "tcp_port": 4001,
                   "gpio_boot": 5, "gpio_en": 6 },
                 { "slot_key": "b" }
               ] }"#,
        );
        let slots = load_slots(file.path());
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].tcp_port, Some(4001));
        assert_eq!(slots[0].gpio_boot, Some(5));
        assert_eq!(slots[1].label, None);
        assert_eq!(slots[1].tcp_port, None);
    }

    #[test]
    fn malformed_entry_is_skipped_not_fatal() {
        let file = write_config(
            r#"{ "slots": [
                 { "tcp_port": 4001 },
                 { "slot_key": "ok", "tcp_port": "not a number" },
                 { "slot_key": "good", "tcp_port": 4002 }
               ] }"#,
        );
        let slots = load_slots(file.path());
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].slot_key, "good");
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let file = write_config(
            r#"{ "slots": [ { "slot_key": "a", "tcp_port": 4001, "color": "red" } ] }"#,
        );
        assert_eq!(load_slots(file.path()).len(), 1);
    }
}
