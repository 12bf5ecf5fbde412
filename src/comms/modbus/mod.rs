//! Modbus adapter: a server exposing coils, discrete inputs, and holding/
//! input registers over TCP (MBAP) or serial RTU, and a client polling one
//! or more remote servers into local register mirrors.

pub mod client;
pub mod codec;
pub mod server;

pub use client::{ModbusClient, ModbusConnection};
pub use server::ModbusServer;

/// Default engineering range applied to registers configured without
/// explicit min/max values.
pub const DEFAULT_RANGE: (f64, f64) = (-1000.0, 2000.0);

const WIRE_SPAN: f64 = 65535.0;

/// Linear mapping between an engineering range `[min, max]` and the 16 bit
/// wire range `[0, 65535]`.
#[derive(Debug, Clone, Copy)]
pub struct ScaledValue {
    slope: f64,
    intercept: f64,
    pub range: (f64, f64),
}

impl ScaledValue {
    pub fn new(min: f64, max: f64) -> Self {
        let slope = WIRE_SPAN / (max - min);
        Self {
            slope,
            intercept: -(slope * min),
            range: (min, max),
        }
    }

    pub fn to_wire(&self, value: f64) -> u16 {
        (self.slope * value + self.intercept).round().clamp(0.0, WIRE_SPAN) as u16
    }

    pub fn to_engineering(&self, wire: u16) -> f64 {
        (wire as f64 - self.intercept) / self.slope
    }
}

impl Default for ScaledValue {
    fn default() -> Self {
        Self::new(DEFAULT_RANGE.0, DEFAULT_RANGE.1)
    }
}

#[cfg(test)]
mod test {
    use super::ScaledValue;

    #[test]
    fn test_scaling_endpoints() {
        let scale = ScaledValue::new(0.0, 100.0);
        assert_eq!(scale.to_wire(0.0), 0);
        assert_eq!(scale.to_wire(100.0), 65535);
        assert!((scale.to_engineering(0) - 0.0).abs() < 1e-9);
        assert!((scale.to_engineering(65535) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_scaling_round_trip_within_one_lsb() {
        use rand::Rng;

        let scale = ScaledValue::new(-50.0, 50.0);
        let mut rng = rand::thread_rng();
        let mut values = vec![-50.0, -12.5, 0.0, 31.25, 50.0];
        values.extend((0..100).map(|_| rng.gen_range(-50.0..=50.0)));
        for value in values {
            let wire = scale.to_wire(value);
            let back = scale.to_engineering(wire);
            assert!((back - value).abs() <= 100.0 / 65535.0);
        }
    }

    #[test]
    fn test_midpoint() {
        let scale = ScaledValue::new(0.0, 100.0);
        let value = scale.to_engineering(32768);
        assert!((value - 50.0).abs() < 0.01);
    }
}
