//! Duration strings such as `2h45m`, `50m` or `90s`.
//!
//! Used by the manifest `forge.cacheTtl` directive and by the YAML
//! configuration (`forge.cache_ttl`).

use std::time::Duration;

/// Parse a compound duration string.
///
/// The input is a sequence of `<number><unit>` segments with no separators,
/// e.g. `1h30m`, `2h45m10s` or `1.5h`. A bare `0` is accepted as zero.
/// Valid units: `ms`, `s`, `m`, `h`, `d`, `w`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim().to_lowercase();

    if input.is_empty() {
        return Err("duration string cannot be empty".to_string());
    }
    if input == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_ms: f64 = 0.0;
    let mut rest = input.as_str();

    while !rest.is_empty() {
        // Find the split point between number and unit
        let unit_start = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing unit in duration '{}'", input))?;
        if unit_start == 0 {
            return Err(format!("duration '{}' must start with a number", input));
        }
        let number_str = &rest[..unit_start];
        let after_number = &rest[unit_start..];
        let unit_len = after_number
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after_number.len());
        let unit_str = &after_number[..unit_len];

        let number: f64 = number_str
            .parse()
            .map_err(|_| format!("invalid number '{}' in duration '{}'", number_str, input))?;

        let multiplier = match unit_str {
            "ms" => 1.0,
            "s" => 1_000.0,
            "m" => 60_000.0,
            "h" => 3_600_000.0,
            "d" => 86_400_000.0,
            "w" => 604_800_000.0,
            _ => {
                return Err(format!(
                    "invalid duration unit '{}' in '{}'. Valid units: ms, s, m, h, d, w",
                    unit_str, input
                ));
            }
        };

        total_ms += number * multiplier;
        rest = &after_number[unit_len..];
    }

    Ok(Duration::from_millis(total_ms as u64))
}
