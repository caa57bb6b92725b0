//! Console protocol helpers: instance listings, device addresses and
//! text escaping for `input text`

use std::collections::HashMap;

/// First device-bridge port handed out by the emulator
pub const BASE_DEVICE_PORT: u16 = 5555;

/// One instance as reported by the console `list2` command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedInstance {
    pub name: String,
    pub index: u32,
    pub address: Option<String>,
    pub is_running: bool,
}

/// Parse a blank-line-delimited listing of `key=value` / `key:value` blocks.
/// Blocks without a name are skipped.
pub fn parse_instance_listing(output: &str) -> Vec<ListedInstance> {
    let mut instances = Vec::new();
    for block in split_blocks(output) {
        let fields = parse_block(&block);
        let Some(name) = fields.get("name").map(|n| n.trim()).filter(|n| !n.is_empty()) else {
            continue;
        };

        let index = fields
            .get("index")
            .and_then(|i| i.parse::<u32>().ok())
            .unwrap_or(instances.len() as u32);
        let is_running = fields
            .get("status")
            .is_some_and(|s| s == "1" || s.eq_ignore_ascii_case("running"));

        instances.push(ListedInstance {
            name: name.to_string(),
            index,
            address: resolve_device_address(&fields, index),
            is_running,
        });
    }
    instances
}

/// Device address for an instance: explicit id, explicit port, or the
/// default port derived from the instance index. `None` when the index is
/// too large to map onto a port.
pub fn resolve_device_address(fields: &HashMap<String, String>, index: u32) -> Option<String> {
    for key in ["adb_id", "adb"] {
        if let Some(id) = fields.get(key).filter(|v| !v.is_empty()) {
            return Some(id.clone());
        }
    }
    if let Some(port) = fields.get("port").and_then(|p| p.parse::<u16>().ok()) {
        return Some(format!("127.0.0.1:{}", port));
    }
    default_device_address(index)
}

pub fn default_device_address(index: u32) -> Option<String> {
    let port = u16::try_from(index)
        .ok()
        .and_then(|index| BASE_DEVICE_PORT.checked_add(index))?;
    Some(format!("127.0.0.1:{}", port))
}

fn split_blocks(text: &str) -> Vec<Vec<&str>> {
    let mut blocks = Vec::new();
    let mut current = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
        } else if !line.starts_with("--------") {
            current.push(line);
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

/// Keys are lower-cased; the first `=` wins, `:` is the fallback separator
fn parse_block(lines: &[&str]) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for line in lines {
        let Some(idx) = line.find('=').or_else(|| line.find(':')) else {
            continue;
        };
        if idx == 0 {
            continue;
        }
        let key = line[..idx].trim().to_ascii_lowercase();
        let value = line[idx + 1..].trim().to_string();
        fields.insert(key, value);
    }
    fields
}

/// Escape text for `input text`: spaces become `%s`, letters and digits pass
/// through, anything else becomes a `\uXXXX` escape per UTF-16 unit.
pub fn encode_input_text(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch == ' ' {
            encoded.push_str("%s");
        } else if ch.is_alphanumeric() {
            encoded.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                encoded.push_str(&format!("\\u{:04X}", unit));
            }
        }
    }
    encoded
}
