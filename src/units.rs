//! Unit normalization for extracted numeric values.
//!
//! Papers report the same property in a spread of units (S/cm vs mS/cm,
//! Kelvin vs Celsius, eV vs meV). The standardizer normalizes every value to
//! its canonical unit before schema mapping so that rows persisted for the
//! same property are directly comparable.

/// Converts raw (value, unit) pairs into canonical units.
///
/// Implementations must be deterministic: the same input always yields the
/// same output, since reruns of a batch must converge to identical
/// standardized records.
pub trait UnitConverter: Send + Sync {
    /// Returns the value converted to its canonical unit, or `None` when the
    /// unit is not recognized. Unrecognized units are kept as-is by the
    /// caller and logged, never dropped.
    fn convert(&self, value: f64, unit: &str) -> Option<(f64, String)>;
}

/// Table-driven converter covering the units seen in solid-electrolyte
/// literature.
///
/// Canonical units: mS/cm for ionic conductivity, eV for activation energy,
/// degrees Celsius for temperatures, MPa for pressures. Dimensionless and
/// already-canonical units pass through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct SiUnitConverter;

impl SiUnitConverter {
    /// Creates a new converter.
    pub fn new() -> Self {
        Self
    }
}

impl UnitConverter for SiUnitConverter {
    fn convert(&self, value: f64, unit: &str) -> Option<(f64, String)> {
        let normalized = unit.trim();
        let converted = match normalized {
            // Conductivity -> mS/cm
            "S/cm" => (value * 1_000.0, "mS/cm"),
            "mS/cm" => (value, "mS/cm"),
            "uS/cm" | "\u{3bc}S/cm" | "\u{b5}S/cm" => (value / 1_000.0, "mS/cm"),
            "S/m" => (value * 10.0, "mS/cm"),

            // Energy -> eV
            "eV" => (value, "eV"),
            "meV" => (value / 1_000.0, "eV"),
            "kJ/mol" => (value / 96.485, "eV"),

            // Temperature -> C
            "C" | "\u{b0}C" | "degC" => (value, "C"),
            "K" => (value - 273.15, "C"),

            // Pressure -> MPa
            "MPa" => (value, "MPa"),
            "GPa" => (value * 1_000.0, "MPa"),

            // Pass-through units
            "rpm" => (value, "rpm"),
            "um" | "\u{3bc}m" | "\u{b5}m" => (value, "um"),
            "nm" => (value / 1_000.0, "um"),
            "%" => (value, "%"),
            "h" | "hr" | "hours" => (value, "h"),
            "" => (value, ""),

            _ => return None,
        };

        Some((converted.0, converted.1.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conductivity_to_ms_cm() {
        let converter = SiUnitConverter::new();

        let (value, unit) = converter.convert(3.6e-3, "S/cm").unwrap();
        assert!((value - 3.6).abs() < 1e-9);
        assert_eq!(unit, "mS/cm");

        let (value, unit) = converter.convert(1.2, "mS/cm").unwrap();
        assert!((value - 1.2).abs() < 1e-9);
        assert_eq!(unit, "mS/cm");

        let (value, _) = converter.convert(500.0, "uS/cm").unwrap();
        assert!((value - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_kelvin_to_celsius() {
        let converter = SiUnitConverter::new();
        let (value, unit) = converter.convert(823.15, "K").unwrap();
        assert!((value - 550.0).abs() < 1e-9);
        assert_eq!(unit, "C");
    }

    #[test]
    fn test_milli_ev() {
        let converter = SiUnitConverter::new();
        let (value, unit) = converter.convert(300.0, "meV").unwrap();
        assert!((value - 0.3).abs() < 1e-9);
        assert_eq!(unit, "eV");
    }

    #[test]
    fn test_unknown_unit_is_none() {
        let converter = SiUnitConverter::new();
        assert!(converter.convert(1.0, "furlongs").is_none());
    }

    #[test]
    fn test_pass_through_units() {
        let converter = SiUnitConverter::new();
        let (value, unit) = converter.convert(500.0, "rpm").unwrap();
        assert!((value - 500.0).abs() < 1e-9);
        assert_eq!(unit, "rpm");
    }
}
