use std::time::{SystemTime, UNIX_EPOCH};

pub fn get_current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// File name of the JSON report written for a range
pub fn report_file_name(cidr: &str) -> String {
    let slug: String = cidr
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("cycle-{}-{}.json", slug, get_current_timestamp())
}

/// Names handed to nft/tc: letters, digits, `_`, `-` and `.` only.
pub fn is_valid_object_name(name: &str, max_len: usize) -> bool {
    !name.is_empty()
        && name.len() <= max_len
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}
