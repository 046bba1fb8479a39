// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Fan tables and the duty decision.
//!
//! A table is an ordered list of temperature breakpoints, each carrying the
//! duty (0-100%) the fan should run at from that temperature up. Heating
//! steps the duty up as soon as a breakpoint is crossed; cooling steps it
//! down only once the temperature has fallen past the midpoint between two
//! breakpoints, so the fan does not oscillate around a threshold.

use serde::{Deserialize, Serialize};

/// A single breakpoint on a fan table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CurvePoint {
    /// Temperature threshold in degrees Celsius
    pub temp: i32,
    /// Fan duty in percent (0-100)
    pub duty: i32,
}

/// An ordered list of temperature-to-duty breakpoints for one thermal zone.
///
/// Built once at startup, immutable afterwards. Temperatures must be
/// strictly increasing; duties may dip and rise freely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanTable {
    points: Vec<CurvePoint>,
}

impl FanTable {
    /// Validate and take ownership of a breakpoint list.
    pub fn new(points: Vec<CurvePoint>) -> Result<Self, String> {
        if points.is_empty() {
            return Err("fan table must have at least one breakpoint".to_string());
        }
        for (i, p) in points.iter().enumerate() {
            if !(0..=100).contains(&p.duty) {
                return Err(format!("duty {}% out of range 0-100 (breakpoint {i})", p.duty));
            }
            if i > 0 && p.temp <= points[i - 1].temp {
                return Err(format!(
                    "breakpoint temperatures must be strictly increasing (breakpoint {i})"
                ));
            }
        }
        Ok(Self { points })
    }

    /// Decide the next duty for a zone; `0` means "leave the fan alone".
    ///
    /// Heating: the highest breakpoint at or below `temp` becomes the
    /// candidate and is returned as soon as it exceeds `current_duty`, so
    /// spinning up never waits. Cooling: the previous breakpoint's duty is
    /// returned only once `temp` has dropped to the midpoint between two
    /// adjacent breakpoints, making half the breakpoint spacing the
    /// hysteresis band. With a single breakpoint there is no pair to derive
    /// a midpoint from and the duty never steps down.
    pub fn target_duty(&self, temp: i32, current_duty: i32) -> i32 {
        let mut candidate = 0;
        for p in self.points.iter().rev() {
            if temp >= p.temp {
                candidate = p.duty;
                break;
            }
        }
        if candidate > current_duty {
            return candidate;
        }

        for pair in self.points.windows(2) {
            let midpoint = (pair[0].temp + pair[1].temp) / 2;
            if temp <= midpoint && current_duty > pair[0].duty {
                return pair[0].duty;
            }
        }

        0
    }
}

/// The per-zone tables the automatic algorithm runs.
#[derive(Debug, Clone)]
pub struct FanTables {
    pub cpu: FanTable,
    pub gpu: FanTable,
}

impl FanTables {
    /// Built-in tables for both zones.
    pub fn defaults() -> Self {
        Self {
            cpu: default_cpu_table(),
            gpu: default_gpu_table(),
        }
    }
}

/// Built-in CPU table, used when no usable table is configured.
pub fn default_cpu_table() -> FanTable {
    FanTable {
        points: vec![
            CurvePoint { temp: 10, duty: 0 },
            CurvePoint { temp: 20, duty: 20 },
            CurvePoint { temp: 30, duty: 25 },
            CurvePoint { temp: 40, duty: 35 },
            CurvePoint { temp: 50, duty: 45 },
            CurvePoint { temp: 60, duty: 60 },
            CurvePoint { temp: 70, duty: 75 },
            CurvePoint { temp: 80, duty: 85 },
            CurvePoint { temp: 90, duty: 100 },
        ],
    }
}

/// Built-in GPU table, a little shallower than the CPU one.
pub fn default_gpu_table() -> FanTable {
    FanTable {
        points: vec![
            CurvePoint { temp: 10, duty: 0 },
            CurvePoint { temp: 20, duty: 20 },
            CurvePoint { temp: 30, duty: 25 },
            CurvePoint { temp: 40, duty: 30 },
            CurvePoint { temp: 50, duty: 35 },
            CurvePoint { temp: 60, duty: 45 },
            CurvePoint { temp: 70, duty: 60 },
            CurvePoint { temp: 80, duty: 75 },
            CurvePoint { temp: 90, duty: 90 },
            CurvePoint { temp: 95, duty: 100 },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(points: &[(i32, i32)]) -> FanTable {
        let points = points
            .iter()
            .map(|&(temp, duty)| CurvePoint { temp, duty })
            .collect();
        FanTable::new(points).unwrap()
    }

    #[test]
    fn heating_saturates_at_the_top_breakpoint() {
        let t = default_cpu_table();
        assert_eq!(t.target_duty(95, 60), 100);
        // Once the fan runs at the top duty, nothing asks for more.
        assert_eq!(t.target_duty(95, 100), 0);
    }

    #[test]
    fn heating_spins_up_without_delay() {
        let t = table(&[(30, 25), (40, 35)]);
        assert_eq!(t.target_duty(40, 25), 35);
        // The lowest breakpoint counts on the way up too.
        assert_eq!(t.target_duty(31, 10), 25);
    }

    #[test]
    fn cooling_waits_for_the_midpoint() {
        let t = table(&[(30, 25), (40, 35)]);
        // Midpoint between 30 and 40 is 35.
        assert_eq!(t.target_duty(36, 35), 0);
        assert_eq!(t.target_duty(34, 35), 25);
    }

    #[test]
    fn cooling_steps_down_one_band_at_a_time() {
        let t = table(&[(10, 0), (20, 20), (30, 25), (40, 35)]);
        // From 35% the fan first settles on the 30°C band's duty.
        assert_eq!(t.target_duty(27, 35), 25);
        assert_eq!(t.target_duty(16, 25), 20);
    }

    #[test]
    fn heating_is_monotonic_in_temperature() {
        let t = default_gpu_table();
        let mut last = 0;
        for temp in 0..=110 {
            let target = t.target_duty(temp, 0);
            if target != 0 {
                assert!(
                    target >= last,
                    "target dropped from {last}% to {target}% at {temp}°C"
                );
                last = target;
            }
        }
    }

    #[test]
    fn single_breakpoint_never_steps_down() {
        let t = table(&[(50, 60)]);
        assert_eq!(t.target_duty(80, 40), 60);
        assert_eq!(t.target_duty(10, 90), 0);
    }

    #[test]
    fn rejects_empty_table() {
        assert!(FanTable::new(Vec::new()).is_err());
    }

    #[test]
    fn rejects_non_increasing_temperatures() {
        let points = vec![
            CurvePoint { temp: 40, duty: 30 },
            CurvePoint { temp: 40, duty: 50 },
        ];
        assert!(FanTable::new(points).is_err());
    }

    #[test]
    fn rejects_out_of_range_duty() {
        let points = vec![CurvePoint { temp: 40, duty: 130 }];
        assert!(FanTable::new(points).is_err());
    }

    #[test]
    fn default_tables_pass_validation() {
        assert!(FanTable::new(default_cpu_table().points).is_ok());
        assert!(FanTable::new(default_gpu_table().points).is_ok());
    }
}
