// measure.rs - derived readings for one session

use crate::*;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CalculatedData {
    /// Meter readings, m3
    pub channel0: f64,
    pub channel1: f64,
    /// Pulses since the previous transmitting session
    pub delta0: u32,
    pub delta1: u32,
}

fn reading(start: f32, impulses: u32, impulses_start: u32, factor: u16) -> f64 {
    let litres = impulses.saturating_sub(impulses_start) as f64 * factor as f64;
    start as f64 + litres / 1000.0
}

impl CalculatedData {
    pub fn compute(settings: &Settings, data: &AttinyData) -> Self {
        let cdata = Self {
            channel0: reading(
                settings.channel0_start,
                data.impulses0,
                settings.impulses0_start,
                settings.factor0,
            ),
            channel1: reading(
                settings.channel1_start,
                data.impulses1,
                settings.impulses1_start,
                settings.factor1,
            ),
            delta0: data.impulses0.saturating_sub(settings.impulses0_previous),
            delta1: data.impulses1.saturating_sub(settings.impulses1_previous),
        };
        info!(
            "Readings: ch0={:.3} ch1={:.3} delta0={} delta1={}",
            cdata.channel0, cdata.channel1, cdata.delta0, cdata.delta1
        );
        cdata
    }

    pub fn has_consumption(&self) -> bool {
        self.delta0 > 0 || self.delta1 > 0
    }

    /// Litres consumed since the previous transmitting session.
    pub fn delta_litres(&self, settings: &Settings) -> (u32, u32) {
        (
            self.delta0.saturating_mul(settings.factor0 as u32),
            self.delta1.saturating_mul(settings.factor1 as u32),
        )
    }
}

/// Advance the delta baselines so the next session measures from this snapshot.
pub fn update_baselines(settings: &mut Settings, data: &AttinyData) {
    settings.impulses0_previous = data.impulses0;
    settings.impulses1_previous = data.impulses1;
}

/// Round to 3 decimals the way readings are reported.
pub fn round_m3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readings_follow_start_value_and_factor() {
        let settings = Settings {
            channel0_start: 12.5,
            impulses0_start: 100,
            impulses0_previous: 140,
            factor0: 10,
            channel1_start: 3.0,
            impulses1_start: 50,
            impulses1_previous: 50,
            factor1: 1,
            ..Settings::default()
        };
        let data = AttinyData { impulses0: 150, impulses1: 50, ..AttinyData::default() };
        let cdata = CalculatedData::compute(&settings, &data);
        assert_eq!(round_m3(cdata.channel0), 13.0);
        assert_eq!(round_m3(cdata.channel1), 3.0);
        assert_eq!((cdata.delta0, cdata.delta1), (10, 0));
        assert_eq!(cdata.delta_litres(&settings), (100, 0));
        assert!(cdata.has_consumption());
    }

    #[test]
    fn controller_reset_does_not_underflow() {
        let settings = Settings { impulses0_previous: 500, impulses0_start: 400, ..Settings::default() };
        let data = AttinyData { impulses0: 3, ..AttinyData::default() };
        let cdata = CalculatedData::compute(&settings, &data);
        assert_eq!(cdata.delta0, 0);
        assert_eq!(cdata.channel0, 0.0);
    }

    #[test]
    fn baselines_move_to_snapshot() {
        let mut settings = Settings::default();
        let data = AttinyData { impulses0: 7, impulses1: 9, ..AttinyData::default() };
        update_baselines(&mut settings, &data);
        assert_eq!((settings.impulses0_previous, settings.impulses1_previous), (7, 9));
        assert!(!CalculatedData::compute(&settings, &data).has_consumption());
    }
}

// EOF
