//! Turn geometry for a two-wheel differential car.
//!
//! Positive angles turn left (counter-clockwise seen from above). The wheel on
//! the outside of the turn is the right one for positive angles and the left
//! one for negative angles.

use serde::{Deserialize, Serialize};

use crate::utils::motor::Direction;

/// Wheel travel per degree of car rotation for a 2WD chassis with casters.
pub const FACTOR_DEGREE_TO_MILLIMETER_2WD: f32 = 2.2777;
/// Four wheel drive slips during turns and needs more wheel travel.
pub const FACTOR_DEGREE_TO_MILLIMETER_4WD: f32 = 4.1;

/// Which wheels move during a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnMode {
    /// Only the outer wheel drives forward.
    Forward,
    /// Only the inner wheel drives backward.
    Backward,
    /// Both wheels drive half the distance in opposite directions.
    InPlace,
}

/// Chassis geometry relevant for turning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Chassis {
    pub degree_to_millimeter: f32,
}

impl Chassis {
    pub const TWO_WHEEL_DRIVE: Chassis = Chassis {
        degree_to_millimeter: FACTOR_DEGREE_TO_MILLIMETER_2WD,
    };
    pub const FOUR_WHEEL_DRIVE: Chassis = Chassis {
        degree_to_millimeter: FACTOR_DEGREE_TO_MILLIMETER_4WD,
    };

    pub fn with_factor(degree_to_millimeter: f32) -> Self {
        Self { degree_to_millimeter }
    }

    /// Split a turn of `degrees` into one move per wheel.
    pub fn plan_turn(
        &self,
        degrees: i16,
        mode: TurnMode,
    ) -> TurnPlan {
        let distance = libm::roundf(degrees.unsigned_abs() as f32 * self.degree_to_millimeter) as u32;
        let (outer, inner) = match mode {
            TurnMode::Forward => (
                WheelMove::new(distance, Direction::Forward),
                WheelMove::new(0, Direction::Forward),
            ),
            TurnMode::Backward => (
                WheelMove::new(0, Direction::Backward),
                WheelMove::new(distance, Direction::Backward),
            ),
            TurnMode::InPlace => (
                WheelMove::new(distance / 2, Direction::Forward),
                WheelMove::new(distance / 2, Direction::Backward),
            ),
        };

        if degrees >= 0 {
            TurnPlan {
                left: inner,
                right: outer,
            }
        } else {
            TurnPlan {
                left: outer,
                right: inner,
            }
        }
    }
}

impl Default for Chassis {
    fn default() -> Self {
        Self::TWO_WHEEL_DRIVE
    }
}

/// Distance and direction one wheel covers during a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WheelMove {
    pub distance_mm: u32,
    pub direction: Direction,
}

impl WheelMove {
    fn new(
        distance_mm: u32,
        direction: Direction,
    ) -> Self {
        Self {
            distance_mm,
            direction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnPlan {
    pub left: WheelMove,
    pub right: WheelMove,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_place_splits_distance() {
        let plan = Chassis::with_factor(4.0).plan_turn(90, TurnMode::InPlace);
        assert_eq!(plan.right, WheelMove::new(180, Direction::Forward));
        assert_eq!(plan.left, WheelMove::new(180, Direction::Backward));
    }

    #[test]
    fn test_forward_turn_moves_outer_wheel_only() {
        let plan = Chassis::TWO_WHEEL_DRIVE.plan_turn(90, TurnMode::Forward);
        // 90 * 2.2777 = 204.99
        assert_eq!(plan.right.distance_mm, 205);
        assert_eq!(plan.right.direction, Direction::Forward);
        assert_eq!(plan.left.distance_mm, 0);
    }

    #[test]
    fn test_negative_angle_swaps_wheels() {
        let chassis = Chassis::with_factor(2.0);
        let left_turn = chassis.plan_turn(45, TurnMode::Backward);
        let right_turn = chassis.plan_turn(-45, TurnMode::Backward);
        assert_eq!(left_turn.left, right_turn.right);
        assert_eq!(left_turn.right, right_turn.left);
        assert_eq!(right_turn.right, WheelMove::new(90, Direction::Backward));
    }

    #[test]
    fn test_zero_angle_moves_nothing() {
        let plan = Chassis::FOUR_WHEEL_DRIVE.plan_turn(0, TurnMode::InPlace);
        assert_eq!(plan.left.distance_mm, 0);
        assert_eq!(plan.right.distance_mm, 0);
    }
}
