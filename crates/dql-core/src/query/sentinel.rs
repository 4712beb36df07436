//! Result record a query script emits to name the dataset it produced.
//!
//! Format: `__ds__<name>__ds__<crc32 of name, 8 lowercase hex digits>`.
//! The checksum keeps ordinary output that happens to contain the
//! delimiter from being mistaken for a record.

use std::sync::LazyLock;

use regex::Regex;

const DELIMITER: &str = "__ds__";

static RECORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^__ds__(?P<name>.+)__ds__(?P<crc>[0-9a-f]{8})$").expect("valid regex")
});

pub fn encode_record(name: &str) -> String {
    format!("{DELIMITER}{name}{DELIMITER}{:08x}", crc32fast::hash(name.as_bytes()))
}

/// Dataset name carried by `line`, if it is a well-formed record.
pub fn decode_record(line: &str) -> Option<String> {
    let caps = RECORD_RE.captures(line.trim_end_matches(['\r', '\n']))?;
    let name = &caps["name"];
    let crc = u32::from_str_radix(&caps["crc"], 16).ok()?;
    (crc32fast::hash(name.as_bytes()) == crc).then(|| name.to_string())
}

/// Split captured output into the last produced dataset name and the
/// remaining diagnostic lines.
pub fn split_output(output: &str) -> (Option<String>, String) {
    let mut name = None;
    let mut kept = String::with_capacity(output.len());
    for line in output.split_inclusive('\n') {
        match decode_record(line) {
            Some(found) => name = Some(found),
            None => kept.push_str(line),
        }
    }
    (name, kept)
}

/// Last record in a result file's contents.
pub fn last_record(contents: &str) -> Option<String> {
    contents.lines().filter_map(decode_record).last()
}
