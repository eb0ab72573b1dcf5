//! Volume-to-dB conversion, shared by the BGM and voiceover/global-volume
//! code paths (the original repeats this formula at four call sites in
//! `ffmpeg_utils.py`; here it is a single function).

/// Convert a percent-based volume (0-100+, project/segment/track volume
/// fields) into a decibel gain for an FFmpeg `volume=` filter argument.
///
/// `percent == 0` is mute and returns a literal `0` gain factor rather than
/// computing `20 * log10(0)` (negative infinity).
pub fn percent_to_db(percent: f64) -> f64 {
    if percent <= 0.0 {
        return f64::NEG_INFINITY;
    }
    20.0 * (percent / 100.0).log10()
}

/// Build the `volume=` filter argument for a percent-based volume. Mute
/// uses the literal `volume=0` filter, not a `-inf dB` expression.
pub fn volume_filter_arg(percent: f64) -> String {
    if percent <= 0.0 {
        "volume=0".to_string()
    } else {
        format!("volume={:.4}dB", percent_to_db(percent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unity_volume_is_zero_db() {
        assert!((percent_to_db(100.0)).abs() < 1e-9);
    }

    #[test]
    fn half_volume_is_about_minus_six_db() {
        assert!((percent_to_db(50.0) - (-6.0206)).abs() < 1e-3);
    }

    #[test]
    fn mute_is_negative_infinity_not_an_expression() {
        assert_eq!(percent_to_db(0.0), f64::NEG_INFINITY);
    }

    #[test]
    fn mute_filter_uses_literal_zero() {
        assert_eq!(volume_filter_arg(0.0), "volume=0");
    }

    #[test]
    fn nonzero_filter_uses_db_expression() {
        assert_eq!(volume_filter_arg(100.0), "volume=0.0000dB");
    }
}
