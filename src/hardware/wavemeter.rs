//! Wavemeter reading classification.
//!
//! The wavemeter reports failures in-band: a non-positive "wavelength" is a
//! status code rather than a measurement.

use serde::{Deserialize, Serialize};

/// Why a raw reading is not a wavelength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WavemeterStatus {
    /// 0: no value measured yet
    NoValue,
    /// -1: no signal detected
    NoSignal,
    /// -2: signal could not be evaluated
    BadSignal,
    /// -3: signal too weak
    LowSignal,
    /// -4: signal saturates the detector
    BigSignal,
    /// -5: wavemeter not present
    WavemeterMissing,
    /// -6: function not available
    NotAvailable,
    /// -8: pulsed measurement saw no pulse
    NoPulse,
    /// any other non-positive code
    Unknown(i32),
}

impl WavemeterStatus {
    /// Split a raw reading into a wavelength (nm) or a status.
    pub fn classify(raw: f64) -> Result<f64, WavemeterStatus> {
        if raw > 0.0 && raw.is_finite() {
            return Ok(raw);
        }
        if !raw.is_finite() {
            return Err(Self::Unknown(i32::MIN));
        }
        Err(match raw.round() as i32 {
            0 => Self::NoValue,
            -1 => Self::NoSignal,
            -2 => Self::BadSignal,
            -3 => Self::LowSignal,
            -4 => Self::BigSignal,
            -5 => Self::WavemeterMissing,
            -6 => Self::NotAvailable,
            -8 => Self::NoPulse,
            other => Self::Unknown(other),
        })
    }
}

impl std::fmt::Display for WavemeterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoValue => write!(f, "no value"),
            Self::NoSignal => write!(f, "no signal"),
            Self::BadSignal => write!(f, "bad signal"),
            Self::LowSignal => write!(f, "signal too low"),
            Self::BigSignal => write!(f, "signal too big"),
            Self::WavemeterMissing => write!(f, "wavemeter missing"),
            Self::NotAvailable => write!(f, "not available"),
            Self::NoPulse => write!(f, "no pulse"),
            Self::Unknown(code) => write!(f, "status code {code}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_reading_is_wavelength() {
        assert_eq!(WavemeterStatus::classify(1550.1234), Ok(1550.1234));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(WavemeterStatus::classify(0.0), Err(WavemeterStatus::NoValue));
        assert_eq!(WavemeterStatus::classify(-3.0), Err(WavemeterStatus::LowSignal));
        assert_eq!(WavemeterStatus::classify(-8.0), Err(WavemeterStatus::NoPulse));
        assert_eq!(WavemeterStatus::classify(-7.0), Err(WavemeterStatus::Unknown(-7)));
    }

    #[test]
    fn test_nan_is_rejected() {
        assert!(WavemeterStatus::classify(f64::NAN).is_err());
    }
}
