use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

/// Parse a port expression into a deduplicated list of TCP ports (1..=65535), in order of
/// first appearance.
///
/// Entries are separated by commas or newlines:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - comments: everything after `#` on a line is ignored
/// - whitespace and empty entries are ignored
pub fn parse_ports_str(s: &str) -> Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().unwrap_or("");
        for entry in line.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if let Some((a, b)) = entry.split_once('-') {
                let start = parse_port_str(a.trim())
                    .with_context(|| format!("line {line_no}: invalid start in range: {entry}"))?;
                let end = parse_port_str(b.trim())
                    .with_context(|| format!("line {line_no}: invalid end in range: {entry}"))?;
                if start > end {
                    bail!("line {line_no}: invalid range {start}-{end} (start > end)");
                }
                for p in start..=end {
                    if seen.insert(p) {
                        out.push(p);
                    }
                }
                continue;
            }

            let p = parse_port_str(entry)
                .with_context(|| format!("line {line_no}: invalid port value: {entry}"))?;
            if seen.insert(p) {
                out.push(p);
            }
        }
    }

    Ok(out)
}

/// Validate a port expression and render it in canonical form: ascending, deduplicated,
/// consecutive runs compressed into ranges (`22,80,8000-8002`).
///
/// Errors if the expression is malformed or selects no ports.
pub fn normalize_ports(s: &str) -> Result<String> {
    let ports: BTreeSet<u16> = parse_ports_str(s)?.into_iter().collect();
    if ports.is_empty() {
        bail!("no ports given");
    }

    let mut runs: Vec<(u16, u16)> = Vec::new();
    for p in ports {
        match runs.last_mut() {
            Some((_, end)) if u32::from(*end) + 1 == u32::from(p) => *end = p,
            _ => runs.push((p, p)),
        }
    }
    let parts: Vec<String> = runs
        .into_iter()
        .map(|(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{start}-{end}")
            }
        })
        .collect();
    Ok(parts.join(","))
}

/// Read a port expression from a file.
pub fn load_ports_from_path(path: impl AsRef<Path>) -> Result<String> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read ports file: {}", path.as_ref().display()))?;
    normalize_ports(&content)
        .with_context(|| format!("invalid ports file: {}", path.as_ref().display()))
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_comma_separated() {
        let ports = parse_ports_str("80, 22 ,443").unwrap();
        assert_eq!(ports, vec![80, 22, 443]);
    }

    #[test]
    fn parse_ranges_and_dedup() {
        let input = "8000-8002\n80,8001\n";
        let ports = parse_ports_str(input).unwrap();
        assert_eq!(ports, vec![8000, 8001, 8002, 80]);
    }

    #[test]
    fn normalize_compresses_runs() {
        assert_eq!(normalize_ports("443,22,23,24,80").unwrap(), "22-24,80,443");
        assert_eq!(normalize_ports("8002,8000-8001").unwrap(), "8000-8002");
        assert_eq!(normalize_ports("65535,65534").unwrap(), "65534-65535");
    }

    #[test]
    fn normalize_rejects_empty_and_bad_ranges() {
        assert!(normalize_ports("  # nothing\n").is_err());
        assert!(normalize_ports("90-80").is_err());
        assert!(normalize_ports("http").is_err());
    }

    #[test]
    fn invalid_values_error() {
        assert!(parse_ports_str("70000\n").is_err());
    }
}
