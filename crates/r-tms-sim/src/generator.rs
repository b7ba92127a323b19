//! ---
//! ems_section: "11-simulation-test-harness"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Temperature signal generator with fault injection."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use rand::prelude::*;
use r_tms_common::GeneratorConfig;
use serde_json::Value as JsonValue;

/// Values a faulty probe reports instead of a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptValue {
    SensorFault,
    Error,
    Null,
    NotANumber,
}

impl CorruptValue {
    const ALL: [CorruptValue; 4] = [
        CorruptValue::SensorFault,
        CorruptValue::Error,
        CorruptValue::Null,
        CorruptValue::NotANumber,
    ];

    pub fn to_json(self) -> JsonValue {
        match self {
            CorruptValue::SensorFault => JsonValue::from("SENSOR_FAULT"),
            CorruptValue::Error => JsonValue::from("ERROR"),
            CorruptValue::Null => JsonValue::Null,
            CorruptValue::NotANumber => JsonValue::from("NaN"),
        }
    }
}

/// One generated sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    Normal(f64),
    Wild(f64),
    Corrupt(CorruptValue),
}

impl Sample {
    /// Value as it appears in `sensor_data.value`.
    pub fn to_json(self) -> JsonValue {
        match self {
            Sample::Normal(value) | Sample::Wild(value) => JsonValue::from(value),
            Sample::Corrupt(corrupt) => corrupt.to_json(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Sample::Normal(_) => "normal",
            Sample::Wild(_) => "wild",
            Sample::Corrupt(_) => "corrupt",
        }
    }
}

/// `base + amplitude * sin(frequency * x) + noise`, with optional spikes and faults.
///
/// A single roll decides injection per sample: corrupt wins below
/// `corrupt_rate`, wild below `corrupt_rate + wild_rate`.
#[derive(Debug)]
pub struct SignalGenerator {
    config: GeneratorConfig,
    rng: StdRng,
    x: u64,
}

impl SignalGenerator {
    pub fn new(config: GeneratorConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            x: 0,
        }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn set_wild_enabled(&mut self, enabled: bool) {
        self.config.allow_wild = enabled;
    }

    pub fn set_corrupt_enabled(&mut self, enabled: bool) {
        self.config.allow_corrupt = enabled;
    }

    /// Rates are clamped to `0.0..=1.0`; `None` leaves a rate unchanged.
    pub fn set_injection_rates(&mut self, wild_rate: Option<f64>, corrupt_rate: Option<f64>) {
        if let Some(rate) = wild_rate {
            self.config.wild_rate = rate.clamp(0.0, 1.0);
        }
        if let Some(rate) = corrupt_rate {
            self.config.corrupt_rate = rate.clamp(0.0, 1.0);
        }
    }

    /// Replace the waveform parameters, keeping the injection settings.
    pub fn update_waveform(&mut self, base: f64, amplitude: f64, frequency: f64, noise: f64) {
        self.config.base = base;
        self.config.amplitude = amplitude;
        self.config.frequency = frequency;
        self.config.noise = noise;
    }

    pub fn next_sample(&mut self) -> Sample {
        self.x += 1;
        let roll: f64 = self.rng.gen();
        if self.config.allow_corrupt && roll < self.config.corrupt_rate {
            return Sample::Corrupt(self.corrupt_value());
        }
        if self.config.allow_wild && roll < self.config.corrupt_rate + self.config.wild_rate {
            return Sample::Wild(self.wild_value());
        }
        Sample::Normal(self.normal_value())
    }

    fn normal_value(&mut self) -> f64 {
        let wave = self.config.amplitude * (self.config.frequency * self.x as f64).sin();
        let spread = self.config.noise.abs();
        let jitter = self.rng.gen_range(-spread..=spread);
        round2(self.config.base + wave + jitter)
    }

    fn wild_value(&mut self) -> f64 {
        let value = if self.rng.gen_bool(0.5) {
            self.rng.gen_range(-50.0..=-1.0)
        } else {
            self.rng.gen_range(51.0..=100.0)
        };
        round2(value)
    }

    fn corrupt_value(&mut self) -> CorruptValue {
        CorruptValue::ALL
            .choose(&mut self.rng)
            .copied()
            .unwrap_or(CorruptValue::SensorFault)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GeneratorConfig {
        GeneratorConfig::default()
    }

    #[test]
    fn normal_samples_follow_the_waveform() {
        let mut generator = SignalGenerator::new(config(), 42);
        for _ in 0..200 {
            match generator.next_sample() {
                Sample::Normal(value) => {
                    assert!((16.2..=22.8).contains(&value), "{value} outside envelope");
                    assert_eq!(value, round2(value));
                }
                other => panic!("unexpected {other:?} with injection disabled"),
            }
        }
    }

    #[test]
    fn noiseless_signal_is_deterministic() {
        let mut cfg = config();
        cfg.noise = 0.0;
        cfg.amplitude = 0.0;
        let mut generator = SignalGenerator::new(cfg, 7);
        assert_eq!(generator.next_sample(), Sample::Normal(19.5));
    }

    #[test]
    fn wild_values_land_outside_the_allowed_range() {
        let mut generator = SignalGenerator::new(config(), 3);
        generator.set_wild_enabled(true);
        generator.set_injection_rates(Some(1.0), Some(0.0));
        for _ in 0..100 {
            let Sample::Wild(value) = generator.next_sample() else {
                panic!("expected wild sample");
            };
            assert!((-50.0..=-1.0).contains(&value) || (51.0..=100.0).contains(&value));
        }
    }

    #[test]
    fn corrupt_takes_precedence_over_wild() {
        let mut generator = SignalGenerator::new(config(), 11);
        generator.set_wild_enabled(true);
        generator.set_corrupt_enabled(true);
        generator.set_injection_rates(Some(1.0), Some(1.0));
        for _ in 0..20 {
            assert!(matches!(generator.next_sample(), Sample::Corrupt(_)));
        }
    }

    #[test]
    fn rates_are_clamped() {
        let mut generator = SignalGenerator::new(config(), 1);
        generator.set_injection_rates(Some(4.0), Some(-1.0));
        assert_eq!(generator.config().wild_rate, 1.0);
        assert_eq!(generator.config().corrupt_rate, 0.0);
    }

    #[test]
    fn corrupt_values_encode_like_faulty_probes() {
        assert_eq!(CorruptValue::SensorFault.to_json(), JsonValue::from("SENSOR_FAULT"));
        assert_eq!(CorruptValue::Null.to_json(), JsonValue::Null);
        assert_eq!(Sample::Corrupt(CorruptValue::NotANumber).to_json(), JsonValue::from("NaN"));
    }
}
