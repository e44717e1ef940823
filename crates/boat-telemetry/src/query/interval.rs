//! Bucket width parsing: `"5 minutes"`, `"1 hour 30 minutes"`, `"90s"`.

use std::time::Duration;

fn unit_secs(unit: &str) -> Option<u64> {
    let secs = match unit.to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600,
        "d" | "day" | "days" => 86_400,
        "w" | "week" | "weeks" => 604_800,
        _ => return None,
    };
    Some(secs)
}

/// Parse a sequence of `<count> <unit>` terms into a positive duration.
pub fn parse_interval(input: &str) -> Result<Duration, String> {
    let mut rest = input.trim();
    if rest.is_empty() {
        return Err("interval is empty".into());
    }

    let mut total: u64 = 0;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("expected a number at {:?}", rest));
        }
        let count: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("number too large in {:?}", input))?;
        rest = rest[digits..].trim_start();

        let letters = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        let unit = &rest[..letters];
        let secs = unit_secs(unit).ok_or_else(|| format!("unknown unit {:?}", unit))?;
        rest = rest[letters..].trim_start();

        total = count
            .checked_mul(secs)
            .and_then(|s| total.checked_add(s))
            .ok_or_else(|| format!("interval {:?} is too long", input))?;
    }

    if total == 0 {
        return Err("interval must be positive".into());
    }
    Ok(Duration::from_secs(total))
}
