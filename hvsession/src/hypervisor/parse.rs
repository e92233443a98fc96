use std::collections::BTreeMap;

/// Parse one block of `key: value` lines.
///
/// Splits on the first colon and trims both sides. Lines without a colon
/// are ignored; a repeated key keeps its last value.
pub fn parse_properties<S: AsRef<str>>(lines: &[S]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in lines {
        if let Some((key, value)) = line.as_ref().split_once(':') {
            let key = key.trim();
            if !key.is_empty() {
                map.insert(key.to_string(), value.trim().to_string());
            }
        }
    }
    map
}

/// Parse blank-line separated blocks, as printed by `list hdds` and friends.
pub fn parse_blocks<S: AsRef<str>>(lines: &[S]) -> Vec<BTreeMap<String, String>> {
    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in lines {
        let line = line.as_ref();
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(parse_properties(&current));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        blocks.push(parse_properties(&current));
    }
    blocks
}

/// Split a storage attachment value of the form `path (UUID: id)`.
///
/// Returns the path and, if present, the UUID.
pub fn parse_attachment(value: &str) -> (String, Option<String>) {
    match value.rfind(" (UUID: ") {
        Some(pos) => {
            let path = value[..pos].to_string();
            let uuid = value[pos + 8..].trim_end_matches(')').trim().to_string();
            (path, Some(uuid))
        }
        None => (value.trim().to_string(), None),
    }
}

/// Find the UUID that `createvm` prints on success.
pub fn parse_created_uuid<S: AsRef<str>>(lines: &[S]) -> Option<String> {
    parse_properties(lines)
        .get("UUID")
        .filter(|uuid| !uuid.is_empty())
        .cloned()
}

/// Pull the options out of a `VRDE` line such as
/// `enabled (Address 0.0.0.0, Ports 5000, MultiConn: off, Authentication type: null)`.
pub fn parse_vrde(value: &str) -> BTreeMap<String, String> {
    let mut options = BTreeMap::new();
    let (Some(open), Some(close)) = (value.find('('), value.rfind(')')) else {
        return options;
    };
    if close <= open {
        return options;
    }
    for item in value[open + 1..close].split(", ") {
        let pair = item.split_once(':').or_else(|| item.split_once(' '));
        if let Some((key, val)) = pair {
            options.insert(key.trim().to_string(), val.trim().to_string());
        }
    }
    options
}

/// Leading integer of a value like `1024MB`; zero when absent.
pub fn parse_leading_number(value: &str) -> u64 {
    let digits: String = value
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}
