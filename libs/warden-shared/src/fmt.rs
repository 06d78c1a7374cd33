//! Human-readable units for log lines and CLI output.

const SIZE_PREFIXES: [&str; 6] = ["B", "kB", "MB", "GB", "TB", "PB"];

/// Formats a byte count with a decimal unit prefix.
pub fn human_size(size: i64) -> String {
    if size <= 0 {
        return "0B".to_owned();
    }
    let magnitude = (((size as f64).ln() / 1000_f64.ln()).floor() as usize).min(SIZE_PREFIXES.len() - 1);
    let scaled = size as f64 / 1000_f64.powi(magnitude as i32);
    format!("{}{}", (scaled * 100.0).round() / 100.0, SIZE_PREFIXES[magnitude])
}

/// Formats a duration in seconds as the largest fitting unit.
pub fn human_duration(seconds: i64) -> String {
    match seconds {
        s if s >= 86_400 && s % 86_400 == 0 => format!("{}d", s / 86_400),
        s if s >= 3_600 && s % 3_600 == 0 => format!("{}h", s / 3_600),
        s if s >= 60 && s % 60 == 0 => format!("{}m", s / 60),
        s => format!("{s}s"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(human_size(0), "0B");
        assert_eq!(human_size(999), "999B");
        assert_eq!(human_size(1_000), "1kB");
        assert_eq!(human_size(1_500_000), "1.5MB");
        assert_eq!(human_size(2_000_000_000), "2GB");
    }

    #[test]
    fn durations() {
        assert_eq!(human_duration(59), "59s");
        assert_eq!(human_duration(60), "1m");
        assert_eq!(human_duration(3_600), "1h");
        assert_eq!(human_duration(86_400 * 30), "30d");
        assert_eq!(human_duration(90), "90s");
    }
}
