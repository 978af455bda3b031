use serde::{Deserialize, Serialize};

/**
 * Lowest allowed value for the configurable maximum motor speed.
 */
pub const MIN_MAX_SPEED: i32 = 10;

/**
 * Highest allowed value for the configurable maximum motor speed.
 */
pub const MAX_MAX_SPEED: i32 = 1000;

pub const DEFAULT_MAX_SPEED: i32 = 500;

/// Upper bound for the absolute value of a single motor speed, always within
/// [MIN_MAX_SPEED, MAX_MAX_SPEED].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub struct MaxSpeed(i32);

impl MaxSpeed {
    pub fn new(value: i32) -> Self {
        MaxSpeed(value.clamp(MIN_MAX_SPEED, MAX_MAX_SPEED))
    }

    pub fn get(self) -> i32 {
        self.0
    }

    pub fn clamp(self, speed: i32) -> i32 {
        speed.clamp(-self.0, self.0)
    }
}

impl Default for MaxSpeed {
    fn default() -> Self {
        MaxSpeed(DEFAULT_MAX_SPEED)
    }
}

impl From<i32> for MaxSpeed {
    fn from(value: i32) -> Self {
        MaxSpeed::new(value)
    }
}

impl From<MaxSpeed> for i32 {
    fn from(value: MaxSpeed) -> Self {
        value.0
    }
}

impl std::fmt::Display for MaxSpeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Clamp a raw input axis to [-1, 1]. NaN is treated as a centered stick.
pub fn clamp_input(value: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(-1.0, 1.0)
}

/// Convert a 2D input vector into (left, right) motor speeds using tank steering.
///
/// `y` is forward/back (up is positive) and `x` biases the turn. The output is
/// clamped to the max speed even when the inputs were not.
pub fn map(x: f32, y: f32, max_speed: MaxSpeed) -> (i32, i32) {
    let max = max_speed.get() as f32;
    let base = y * max;
    let turn = x * max;

    // `as` saturates and maps NaN to 0, the clamp keeps the rest in range
    let left = (base + turn).round() as i32;
    let right = (base - turn).round() as i32;

    (max_speed.clamp(left), max_speed.clamp(right))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cardinal_directions() {
        let max = MaxSpeed::new(500);
        assert_eq!(map(0.0, 1.0, max), (500, 500));
        assert_eq!(map(0.0, -1.0, max), (-500, -500));
        assert_eq!(map(1.0, 0.0, max), (500, -500));
        assert_eq!(map(-1.0, 0.0, max), (-500, 500));
        assert_eq!(map(0.0, 0.0, max), (0, 0));
    }

    #[test]
    fn test_output_never_exceeds_max_speed() {
        for max in [MIN_MAX_SPEED, 77, DEFAULT_MAX_SPEED, MAX_MAX_SPEED] {
            let max_speed = MaxSpeed::new(max);
            for xi in -10..=10 {
                for yi in -10..=10 {
                    let (left, right) = map(xi as f32 / 10.0, yi as f32 / 10.0, max_speed);
                    assert!(left.abs() <= max, "left {} out of range for max {}", left, max);
                    assert!(right.abs() <= max, "right {} out of range for max {}", right, max);
                }
            }
        }
    }

    #[test]
    fn test_diagonal_saturates() {
        // full forward plus full right would be 2 * max on the left side
        assert_eq!(map(1.0, 1.0, MaxSpeed::new(300)), (300, 0));
        assert_eq!(map(-1.0, 1.0, MaxSpeed::new(300)), (0, 300));
    }

    #[test]
    fn test_unvalidated_input_is_still_bounded() {
        let (left, right) = map(5.0, -7.5, MaxSpeed::new(100));
        assert_eq!((left, right), (-100, -100));

        let (left, right) = map(f32::NAN, f32::INFINITY, MaxSpeed::new(100));
        assert!(left.abs() <= 100 && right.abs() <= 100);
    }

    #[test]
    fn test_max_speed_is_clamped() {
        assert_eq!(MaxSpeed::new(1).get(), MIN_MAX_SPEED);
        assert_eq!(MaxSpeed::new(50_000).get(), MAX_MAX_SPEED);
        assert_eq!(MaxSpeed::new(250).get(), 250);
    }

    #[test]
    fn test_clamp_input() {
        assert_eq!(clamp_input(1.5), 1.0);
        assert_eq!(clamp_input(-3.0), -1.0);
        assert_eq!(clamp_input(0.25), 0.25);
        assert_eq!(clamp_input(f32::NAN), 0.0);
    }
}
