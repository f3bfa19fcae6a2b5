use anyhow::Result;

use crate::models::{Reading, ReadingData, SensorWindow, StreamKind};

use super::config::{stream_width, WindowConfig};

/// Deterministic window-to-vector transform.
///
/// Layout: for each stream in [`StreamKind::ALL`] order, `slots` sub-vectors holding
/// the stream's most recent readings in arrival order, zero-padded when short. The
/// concatenation is L2-normalized unless it is all zeros.
#[derive(Debug, Clone)]
pub struct VectorEncoder {
    slots: usize,
    dimension: usize,
}

impl VectorEncoder {
    pub fn new(config: &WindowConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            slots: config.slots_per_stream,
            dimension: config.dimension,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn encode(&self, window: &SensorWindow) -> Vec<f32> {
        let mut values = Vec::with_capacity(self.dimension);

        for stream in StreamKind::ALL {
            let width = stream_width(stream);
            let readings = window.readings(stream);
            let recent = &readings[readings.len().saturating_sub(self.slots)..];

            for reading in recent {
                extract(stream, reading, width, &mut values);
            }
            values.resize(values.len() + (self.slots - recent.len()) * width, 0.0);
        }

        // Scaled by the largest magnitude first so the sum of squares cannot overflow.
        let scale = values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        if scale > 0.0 && scale.is_finite() {
            for value in &mut values {
                *value /= scale;
            }
            let norm = values.iter().map(|v| v * v).sum::<f64>().sqrt();
            for value in &mut values {
                *value /= norm;
            }
        }

        values.into_iter().map(|value| value as f32).collect()
    }
}

/// Append exactly `width` values for one reading. Anything missing is 0.0.
fn extract(stream: StreamKind, reading: &Reading, width: usize, out: &mut Vec<f64>) {
    let start = out.len();
    match (stream, &reading.data) {
        (StreamKind::Foot, ReadingData::Foot(foot)) => {
            out.extend(foot.values.iter().take(width).copied());
        }
        (StreamKind::Inertial, ReadingData::Inertial(inertial)) => {
            out.extend(inertial.channels());
        }
        _ => {}
    }
    out.resize(start + width, 0.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Axis3, FootData, FootSide, InertialData, Orientation};

    fn foot(seed: f64) -> Reading {
        Reading::foot(
            "2024-05-01T10:00:00Z",
            "LEFT_FOOT",
            FootData {
                foot: FootSide::Left,
                max: seed,
                avg: seed,
                active_count: 18,
                values: (0..18).map(|i| seed + i as f64).collect(),
            },
        )
    }

    fn inertial(seed: f64) -> Reading {
        Reading::inertial(
            "2024-05-01T10:00:00Z",
            "ACCELEROMETER",
            InertialData {
                acc: Axis3 { x: seed, y: seed + 1.0, z: seed + 2.0 },
                gyro: Axis3 { x: 0.5, y: 0.5, z: 0.5 },
                angle: Orientation { roll: 1.0, pitch: 2.0, yaw: 3.0 },
            },
        )
    }

    fn window_with(foot_count: usize, inertial_count: usize) -> SensorWindow {
        let mut window = SensorWindow::new("s1", "LEFT_FOOT", 0);
        for i in 0..foot_count {
            window.push(foot(i as f64 + 1.0), i as i64 * 10);
        }
        for i in 0..inertial_count {
            window.push(inertial(i as f64 + 1.0), i as i64 * 10);
        }
        window
    }

    fn encoder() -> VectorEncoder {
        VectorEncoder::new(&WindowConfig::default()).unwrap()
    }

    fn norm(vector: &[f32]) -> f64 {
        vector.iter().map(|v| f64::from(*v).powi(2)).sum::<f64>().sqrt()
    }

    #[test]
    fn output_length_is_fixed() {
        let encoder = encoder();
        for (f, i) in [(0, 0), (1, 0), (0, 3), (10, 10), (25, 40)] {
            assert_eq!(encoder.encode(&window_with(f, i)).len(), 270);
        }
    }

    #[test]
    fn huge_readings_still_normalize() {
        let mut window = SensorWindow::new("s1", "LEFT_FOOT", 0);
        window.push(foot(1e200), 0);
        window.push(foot(2e200), 10);

        let vector = encoder().encode(&window);
        assert!(vector.iter().all(|v| v.is_finite()));
        assert!((norm(&vector) - 1.0).abs() < 1e-5);
        assert!(vector.iter().any(|v| *v > 0.0));
    }

    #[test]
    fn encoding_is_deterministic_and_unit_length() {
        let encoder = encoder();
        let window = window_with(7, 4);
        let a = encoder.encode(&window);
        let b = encoder.encode(&window);
        assert_eq!(
            a.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
            b.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
        assert!((norm(&a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn empty_window_stays_zero() {
        let vector = encoder().encode(&window_with(0, 0));
        assert!(vector.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn missing_stream_segment_is_zero_padded() {
        let encoder = encoder();
        let window = window_with(3, 0);
        let vector = encoder.encode(&window);

        // Inertial segment: final 90 values.
        assert!(vector[180..].iter().all(|v| *v == 0.0));
        // Foot slots 4..10 are empty.
        assert!(vector[54..180].iter().all(|v| *v == 0.0));

        // First 54 slots hold the three readings in arrival order, scaled by the norm.
        let raw: Vec<f64> = (0..3)
            .flat_map(|r| (0..18).map(move |i| r as f64 + 1.0 + i as f64))
            .collect();
        let scale = raw.iter().map(|v| v * v).sum::<f64>().sqrt();
        for (got, want) in vector[..54].iter().zip(&raw) {
            assert!((f64::from(*got) - want / scale).abs() < 1e-6);
        }
    }

    #[test]
    fn keeps_only_the_most_recent_slots() {
        let encoder = encoder();
        let window = window_with(12, 0);
        let vector = encoder.encode(&window);

        // Readings 3..=12 survive; the first slot starts at seed 3.
        let first_slot_ratio = vector[1] / vector[0];
        assert!((f64::from(first_slot_ratio) - 4.0 / 3.0).abs() < 1e-5);
        let last_slot = &vector[9 * 18..10 * 18];
        assert!((f64::from(last_slot[1] / last_slot[0]) - 13.0 / 12.0).abs() < 1e-5);
    }

    #[test]
    fn inertial_segment_uses_channel_order() {
        let encoder = encoder();
        let vector = encoder.encode(&window_with(0, 1));
        let segment = &vector[180..189];
        let channels = [1.0, 2.0, 3.0, 0.5, 0.5, 0.5, 1.0, 2.0, 3.0];
        let scale = channels.iter().map(|v: &f64| v * v).sum::<f64>().sqrt();
        for (got, want) in segment.iter().zip(channels) {
            assert!((f64::from(*got) - want / scale).abs() < 1e-6);
        }
        assert!(vector[189..].iter().all(|v| *v == 0.0));
    }
}
