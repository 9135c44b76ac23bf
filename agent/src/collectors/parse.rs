//! Host-utility output parsing helpers shared across collectors (§4.6.1,
//! §6.4).
//!
//! Most of the utilities collectors shell out to (`dladm`, `ipadm`, `zfs`,
//! `zpool iostat -H`) support a "parseable" mode: one record per line,
//! fields separated by `:`, with a literal colon inside a field (a MAC
//! address) escaped as `\:`. A few (`netstat -rn`, `mpstat`, `swap -l`)
//! don't, and fall back to whitespace-delimited columns with a header row
//! that has to be recognised and skipped rather than parsed as data.

/// Split a parseable-mode line on unescaped `:`, unescaping `\:` back to a
/// literal colon within a field (the MAC address case).
pub fn split_escaped_colons(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&':') => {
                current.push(':');
                chars.next();
            }
            ':' => {
                fields.push(std::mem::take(&mut current));
            }
            other => current.push(other),
        }
    }
    fields.push(current);
    fields
}

/// Split a whitespace-delimited line (the non-parseable-mode fallback)
/// into its fields.
pub fn split_whitespace_fields(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

/// True if any field case-insensitively matches a known header keyword —
/// the header-contamination half of the parser robustness contract. A
/// header row in a column mode a utility doesn't actually honour (or a
/// repeated header `dladm`/`ipadm` sometimes emits on a wide terminal) gets
/// rejected the same way a malformed data row would, rather than parsed as
/// if it were a record.
pub fn looks_like_header(fields: &[&str]) -> bool {
    const HEADER_KEYWORDS: &[&str] = &[
        "LINK", "CLASS", "STATE", "OVER", "SPEED", "MTU", "MAC",
        "IPACKETS", "OPACKETS", "RBYTES", "OBYTES", "IERRORS", "OERRORS",
        "ADDROBJ", "TYPE", "ADDR",
        "DESTINATION", "GATEWAY", "FLAGS", "INTERFACE", "REF", "USE",
        "DEVICE", "SWAPFILE", "BLOCKS", "FREE",
        "POOL", "NAME", "USED", "AVAIL", "AVAILABLE", "MOUNTPOINT",
        "CPU", "MINF", "MJF", "XCAL", "USR", "SYS", "IDL",
        "KR/S", "KW/S", "R/S", "W/S", "%B", "%W",
    ];
    fields.iter().any(|f| HEADER_KEYWORDS.contains(&f.to_ascii_uppercase().as_str()))
}

/// Parse a field as a non-negative integer, rejecting anything that isn't
/// (including the empty string) — the "reject rows with non-numeric
/// supposedly-numeric fields" half of the contract.
pub fn parse_non_negative_int(field: &str) -> Option<u64> {
    field.trim().parse::<u64>().ok()
}

/// Parse a field as a float, treating `--` (the host utilities' sentinel
/// for "not applicable") as a clean `None` rather than a parse failure.
pub fn parse_optional_float(field: &str) -> Option<f64> {
    let trimmed = field.trim();
    if trimmed.is_empty() || trimmed == "--" {
        return None;
    }
    trimmed.parse::<f64>().ok()
}

/// Parse a field as an unsigned integer, treating `--` as `None`.
pub fn parse_optional_int(field: &str) -> Option<u64> {
    let trimmed = field.trim();
    if trimmed.is_empty() || trimmed == "--" {
        return None;
    }
    trimmed.parse::<u64>().ok()
}

/// `--` or empty becomes `None`; anything else is returned as an owned
/// string.
pub fn parse_optional_string(field: &str) -> Option<String> {
    let trimmed = field.trim();
    if trimmed.is_empty() || trimmed == "--" {
        None
    } else {
        Some(trimmed.to_string())
    }
}
