//! Wavelength and frequency conversions.
//!
//! Wavelengths are vacuum wavelengths in nanometres, detunings are in GHz and
//! deviations in MHz.

/// Speed of light in vacuum (m/s).
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Optical frequency of a wavelength, in GHz.
pub fn nm_to_ghz(wavelength_nm: f64) -> f64 {
    SPEED_OF_LIGHT / (wavelength_nm * 1e-9) / 1e9
}

/// Frequency deviation of `actual_nm` from `setpoint_nm`, in MHz.
///
/// Positive when the actual frequency is below the setpoint frequency, i.e.
/// when the laser sits on the red side of its target.
pub fn freq_diff_mhz(actual_nm: f64, setpoint_nm: f64) -> f64 {
    -(SPEED_OF_LIGHT / (actual_nm * 1e-9) - SPEED_OF_LIGHT / (setpoint_nm * 1e-9)) / 1e6
}

/// Wavelength shift equivalent to a frequency shift of `delta_mhz` at
/// `wavelength_nm`, in nm (first order).
pub fn mhz_to_nm(delta_mhz: f64, wavelength_nm: f64) -> f64 {
    wavelength_nm * wavelength_nm * 1e-9 * delta_mhz * 1e6 / SPEED_OF_LIGHT
}

/// Wavelength reached by detuning `base_nm` by `detuning_ghz`.
///
/// `1/λ = 1/λ_base + Δν/c`, evaluated in nm and GHz.
pub fn detuned_setpoint(base_nm: f64, detuning_ghz: f64) -> f64 {
    1.0 / (1.0 / base_nm + detuning_ghz / SPEED_OF_LIGHT)
}

/// Round to 5 decimals (10 fm), the display precision of the wavemeter.
pub fn round5(value: f64) -> f64 {
    (value * 1e5).round() / 1e5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_deviation() {
        assert_eq!(freq_diff_mhz(1550.0, 1550.0), 0.0);
    }

    #[test]
    fn test_deviation_sign_and_magnitude() {
        // 1 pm at 1550 nm is about 125 MHz.
        let diff = freq_diff_mhz(1550.001, 1550.0);
        assert!(diff > 124.0 && diff < 125.5, "{diff}");
        assert!(freq_diff_mhz(1549.999, 1550.0) < 0.0);
    }

    #[test]
    fn test_mhz_to_nm_inverts_freq_diff() {
        let shift = mhz_to_nm(100.0, 1550.0);
        let back = freq_diff_mhz(1550.0 + shift, 1550.0);
        assert!((back - 100.0).abs() < 0.01, "{back}");
    }

    #[test]
    fn test_zero_detuning_is_identity() {
        assert!((detuned_setpoint(1550.12345, 0.0) - 1550.12345).abs() < 1e-12);
    }

    #[test]
    fn test_detuning_shifts_frequency() {
        let base = 1550.0;
        let shifted = detuned_setpoint(base, 1.0);
        // Positive detuning moves to higher frequency and shorter wavelength.
        assert!(shifted < base);
        let delta_ghz = nm_to_ghz(shifted) - nm_to_ghz(base);
        assert!((delta_ghz - 1.0).abs() < 1e-6, "{delta_ghz}");
    }

    #[test]
    fn test_round5() {
        assert_eq!(round5(1550.123456), 1550.12346);
        assert_eq!(round5(1550.0), 1550.0);
    }
}
