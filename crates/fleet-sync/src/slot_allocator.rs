//! Computes desired server-slot count from active instance count (§4.4).

use crate::config::{GrowthType, ServerSlotsConfig};

/// Desired slot count for `n` active instances under `config`. Never returns
/// less than `config.base`. The reconciler is responsible for combining this
/// with the backend's current slot count to enforce non-shrinkage.
pub fn desired_slots(n: u32, config: &ServerSlotsConfig) -> u32 {
    if n <= config.base {
        return config.base;
    }
    match config.growth_type {
        GrowthType::Linear => {
            let extra = (n - config.base) as f64 * config.growth_factor;
            config.base + extra.ceil() as u32
        }
        GrowthType::Exponential => {
            let mut k = 0u32;
            loop {
                let candidate = (config.base as f64 * config.growth_factor.powi(k as i32)).ceil() as u32;
                if candidate >= n {
                    return candidate;
                }
                k += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: u32, growth_factor: f64, growth_type: GrowthType) -> ServerSlotsConfig {
        ServerSlotsConfig { base, growth_factor, growth_type }
    }

    #[test]
    fn at_or_below_base_returns_base() {
        let cfg = config(10, 1.5, GrowthType::Linear);
        assert_eq!(desired_slots(0, &cfg), 10);
        assert_eq!(desired_slots(10, &cfg), 10);
    }

    #[test]
    fn linear_growth_rounds_up() {
        let cfg = config(10, 1.5, GrowthType::Linear);
        assert_eq!(desired_slots(11, &cfg), 12);
    }

    #[test]
    fn linear_growth_scale_up_example() {
        let cfg = config(10, 1.5, GrowthType::Linear);
        assert_eq!(desired_slots(12, &cfg), 13);
    }

    #[test]
    fn exponential_growth_finds_smallest_k() {
        let cfg = config(10, 2.0, GrowthType::Exponential);
        assert_eq!(desired_slots(15, &cfg), 20);
        assert_eq!(desired_slots(20, &cfg), 20);
        assert_eq!(desired_slots(21, &cfg), 40);
    }
}
