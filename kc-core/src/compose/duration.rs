use std::time::Duration;

use crate::errors::*;

// Parses docker-compose duration strings like "1m30s", "2.5s" or "500ms".
// The grammar matches Go's time.ParseDuration, minus negative durations
// (which make no sense for healthcheck intervals).
pub fn parse_compose_duration(input: &str) -> anyhow::Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        bail!("invalid duration: {input:?}");
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(rest.len());
        let (number, after_number) = rest.split_at(number_len);
        let value: f64 = number.parse().map_err(|_| anyhow!("invalid duration: {input:?}"))?;

        let unit_len = after_number
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after_number.len());
        let (unit, after_unit) = after_number.split_at(unit_len);
        let scale = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => bail!("invalid duration: {input:?}"),
        };

        total += value * scale;
        rest = after_unit;
    }
    Ok(Duration::from_secs_f64(total))
}
