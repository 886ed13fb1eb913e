use serde::{Deserialize, Serialize};

/// One OHLCV candle. Field names mirror the downstream wire shape.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    /// Open time, ms epoch.
    pub t: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed: Option<bool>,
}

/// Millisecond length of an exchange interval token.
///
/// Accepts every token style the connected exchanges use: bare minutes
/// (`1`, `15`, `720`), suffixed minutes/hours (`1m`, `60min`, `4h`, `2H`),
/// and day/week/month forms (`D`, `1d`, `1day`, `W`, `1w`, `1week`, `M`,
/// `1M`, `1month`).
pub fn interval_ms(token: &str) -> Option<i64> {
    const MINUTE: i64 = 60_000;
    const HOUR: i64 = 60 * MINUTE;
    const DAY: i64 = 24 * HOUR;

    match token {
        "D" | "1d" | "1D" | "1day" => return Some(DAY),
        "W" | "1w" | "1W" | "1week" => return Some(7 * DAY),
        "M" | "1M" | "1month" => return Some(30 * DAY),
        _ => {}
    }

    if let Ok(minutes) = token.parse::<i64>() {
        return Some(minutes * MINUTE);
    }

    let (digits, unit): (String, String) = token.chars().partition(|c| c.is_ascii_digit());
    let n: i64 = digits.parse().ok()?;
    match unit.as_str() {
        "m" | "min" => Some(n * MINUTE),
        "h" | "H" => Some(n * HOUR),
        _ => None,
    }
}

/// Round a timestamp down to the open of its interval.
pub fn align_open_time(ts_ms: i64, token: &str) -> i64 {
    match interval_ms(token) {
        Some(ms) if ms > 0 => ts_ms - ts_ms.rem_euclid(ms),
        _ => ts_ms,
    }
}

/// The one-minute interval token in each exchange's dialect, used for hot
/// kline warmup.
pub fn one_minute_token(exchange: &str) -> &'static str {
    match exchange {
        "bybit" => "1",
        "bitunix" => "1min",
        _ => "1m",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_ms_covers_exchange_dialects() {
        // Bybit bare-minute tokens
        for (token, minutes) in [
            ("1", 1),
            ("3", 3),
            ("5", 5),
            ("15", 15),
            ("30", 30),
            ("60", 60),
            ("120", 120),
            ("240", 240),
            ("360", 360),
            ("720", 720),
        ] {
            assert_eq!(interval_ms(token), Some(minutes * 60_000), "{token}");
        }
        // Blofin / Hyperliquid / Binance
        assert_eq!(interval_ms("1m"), Some(60_000));
        assert_eq!(interval_ms("4h"), Some(4 * 3_600_000));
        assert_eq!(interval_ms("2H"), Some(2 * 3_600_000));
        assert_eq!(interval_ms("1d"), Some(86_400_000));
        // Bitunix
        assert_eq!(interval_ms("15min"), Some(15 * 60_000));
        assert_eq!(interval_ms("1day"), Some(86_400_000));
        assert_eq!(interval_ms("1week"), Some(7 * 86_400_000));
        // Day/week/month letters
        assert_eq!(interval_ms("D"), Some(86_400_000));
        assert_eq!(interval_ms("W"), Some(7 * 86_400_000));
        assert_eq!(interval_ms("M"), Some(30 * 86_400_000));
        assert_eq!(interval_ms("nonsense"), None);
    }

    #[test]
    fn test_align_open_time() {
        // 2024-01-01T00:07:31.500Z down to the 5-minute boundary
        let ts = 1_704_067_651_500i64;
        let aligned = align_open_time(ts, "5min");
        assert_eq!(aligned % 300_000, 0);
        assert!(aligned <= ts && ts - aligned < 300_000);
    }
}
