//! Display formatting shared by the event journal and the dashboard.

pub fn fmt_usd(v: f64) -> String {
    if !v.is_finite() {
        return "$0.00".to_string();
    }
    if v < 0.0 {
        format!("-${:.2}", -v)
    } else {
        format!("${v:.2}")
    }
}

pub fn fmt_inj(v: f64, dp: usize) -> String {
    if !v.is_finite() {
        return "0".to_string();
    }
    format!("{v:.dp$}")
}

/// `+1.250000` / `-0.500000`.
pub fn fmt_signed(v: f64, dp: usize) -> String {
    if !v.is_finite() {
        return "0".to_string();
    }
    format!("{v:+.dp$}")
}

pub fn fmt_signed_inj(v: f64, dp: usize) -> String {
    format!("{} INJ", fmt_signed(v, dp))
}

pub fn fmt_pct(v: f64) -> String {
    format!("{}%", fmt_signed(v, 2))
}

pub fn short_identity(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    if chars.len() <= 14 {
        return raw.to_string();
    }
    let head: String = chars[..7].iter().collect();
    let tail: String = chars[chars.len() - 6..].iter().collect();
    format!("{head}…{tail}")
}
