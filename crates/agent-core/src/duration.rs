//! The duration grammar used by job configs (`lookback`, `timing`).
//!
//! Bare digits are seconds; a single trailing unit scales them:
//! `s` seconds, `m` minutes, `h` hours, `d` days, `w` weeks.

/// Parses a duration expression into whole seconds.
pub fn parse_duration(input: &str) -> anyhow::Result<u64> {
    let s = input.trim();
    if s.is_empty() {
        anyhow::bail!("duration must not be empty");
    }

    let (num, scale) = if let Some(raw) = s.strip_suffix('s') {
        (raw, 1u64)
    } else if let Some(raw) = s.strip_suffix('m') {
        (raw, 60)
    } else if let Some(raw) = s.strip_suffix('h') {
        (raw, 3_600)
    } else if let Some(raw) = s.strip_suffix('d') {
        (raw, 86_400)
    } else if let Some(raw) = s.strip_suffix('w') {
        (raw, 604_800)
    } else {
        (s, 1u64)
    };

    let num = num.trim();
    if num.is_empty() || !num.chars().all(|c| c.is_ascii_digit()) {
        anyhow::bail!("invalid duration: {input:?}");
    }

    let value: u64 = num
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid duration number: {input:?}"))?;

    value
        .checked_mul(scale)
        .ok_or_else(|| anyhow::anyhow!("duration too large: {input:?}"))
}
