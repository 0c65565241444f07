use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

const FIRMWARE_VERSION: &str = "1.4.2";
/// Readings between two location reports.
const LOCATION_EVERY: u64 = 50;

#[derive(Debug, Clone, Serialize)]
pub struct Location {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub coordinates: [f64; 2],
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub fill_percent: f64,
    pub ultrasonic_distance_cm: f64,
    pub infrared_flag1: bool,
    pub infrared_flag2: bool,
    pub battery_voltage: f64,
    pub battery_percent: f64,
    pub signal_strength: f64,
    pub firmware_version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

/// One simulated bin: fill creeps up until a collection empties it, battery drains until swapped.
#[derive(Debug, Clone)]
pub struct Bin {
    pub id: String,
    fill: f64,
    fill_rate: f64,
    battery: f64,
    depth_cm: f64,
    position: [f64; 2],
    ticks: u64,
}

impl Bin {
    pub fn new(id: String, rng: &mut impl Rng) -> Self {
        Self {
            id,
            fill: rng.gen_range(0.0..60.0),
            fill_rate: rng.gen_range(0.2..2.5),
            battery: rng.gen_range(20.0..100.0),
            depth_cm: 120.0,
            // Scattered around Porto
            position: [
                -8.61 + rng.gen_range(-0.05..0.05),
                41.15 + rng.gen_range(-0.05..0.05),
            ],
            ticks: 0,
        }
    }

    pub fn tick(&mut self, rng: &mut impl Rng) -> Reading {
        self.fill = (self.fill + self.fill_rate + rng.gen_range(-0.3..0.6)).clamp(0.0, 100.0);
        // Full bins get collected sooner or later
        if self.fill >= 100.0 || (self.fill > 90.0 && rng.gen_bool(0.1)) {
            self.fill = rng.gen_range(0.0..5.0);
        }

        self.battery -= rng.gen_range(0.01..0.08);
        if self.battery <= 3.0 {
            self.battery = 100.0;
        }

        let location = (self.ticks % LOCATION_EVERY == 0).then(|| Location {
            kind: "Point",
            coordinates: self.position,
        });
        self.ticks += 1;

        Reading {
            timestamp: Utc::now(),
            fill_percent: round1(self.fill),
            ultrasonic_distance_cm: round1(self.depth_cm * (1.0 - self.fill / 100.0)),
            infrared_flag1: self.fill > 75.0,
            infrared_flag2: self.fill > 90.0,
            battery_voltage: round1(3.3 + 0.9 * self.battery / 100.0),
            battery_percent: round1(self.battery),
            signal_strength: rng.gen_range(-115.0..-60.0_f64).round(),
            firmware_version: FIRMWARE_VERSION,
            location,
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readings_stay_in_range() {
        let mut rng = rand::thread_rng();
        let mut bin = Bin::new("bin-1".to_string(), &mut rng);

        for _ in 0..1000 {
            let r = bin.tick(&mut rng);
            assert!((0.0..=100.0).contains(&r.fill_percent));
            assert!((0.0..=100.0).contains(&r.battery_percent));
            assert!(r.ultrasonic_distance_cm >= 0.0);
        }
    }

    #[test]
    fn test_location_sent_on_first_reading() {
        let mut rng = rand::thread_rng();
        let mut bin = Bin::new("bin-1".to_string(), &mut rng);

        assert!(bin.tick(&mut rng).location.is_some());
        assert!(bin.tick(&mut rng).location.is_none());
    }

    #[test]
    fn test_wire_shape() {
        let mut rng = rand::thread_rng();
        let reading = Bin::new("bin-1".to_string(), &mut rng).tick(&mut rng);
        let value = serde_json::to_value(&reading).unwrap();

        assert!(value["fillPercent"].is_number());
        assert_eq!(value["location"]["type"], "Point");
        assert_eq!(value["firmwareVersion"], FIRMWARE_VERSION);
    }
}
