//! IEC 61851-1 Table A.7/A.8 duty↔current mapping. Grounded on
//! `examples/original_source/src/iec61851.c`
//! (`iec61851_duty_to_milliampere`/`iec61851_milliampere_to_duty`).

/// duty(%) → available current (mA), reproduced exactly per spec §4.1.
pub fn duty_to_milliampere(duty_percent: u8) -> u32 {
    if duty_percent > 97 {
        0
    } else if duty_percent == 97 {
        80_000
    } else if duty_percent > 85 {
        (duty_percent as u32 - 64) * 2_500
    } else if duty_percent >= 10 {
        duty_percent as u32 * 600
    } else if duty_percent >= 8 {
        6_000
    } else {
        0
    }
}

/// Inverse mapping, rounding toward the conservative (lower current) side.
pub fn milliampere_to_duty(milliamp: u32) -> u8 {
    if milliamp > 80_000 {
        96
    } else if milliamp >= 55_000 {
        (milliamp / 2_500 + 64) as u8
    } else if milliamp >= 6_000 {
        (milliamp / 600) as u8
    } else {
        100
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn boundary_values_from_spec() {
        assert_eq!(duty_to_milliampere(97), 80_000);
        assert_eq!(duty_to_milliampere(98), 0);
        assert_eq!(duty_to_milliampere(100), 0);
        assert_eq!(duty_to_milliampere(7), 0);
        assert_eq!(duty_to_milliampere(8), 6_000);
    }

    #[test]
    fn mid_range_linear_scaling() {
        assert_eq!(duty_to_milliampere(50), 30_000);
        assert_eq!(duty_to_milliampere(86), (86 - 64) * 2_500);
    }

    proptest! {
        /// Round-trip law from spec §8: duty_to_mA ∘ mA_to_duty never
        /// overstates the available current versus the original duty.
        #[test]
        fn round_trip_is_conservative(duty in 0u8..=100u8) {
            let ma = duty_to_milliampere(duty);
            if ma > 0 {
                let back = milliampere_to_duty(ma);
                let reconstructed_ma = duty_to_milliampere(back);
                prop_assert!(reconstructed_ma <= ma);
            }
        }
    }
}
