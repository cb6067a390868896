//! Synthetic reference population used to train the default model.
//!
//! Profiles imitate ordinary token and vault contracts: a few dozen members,
//! mostly balanced read/write surfaces, occasional ownership or mint hooks,
//! and practically no self-destruct or delegated-call surface.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::pipeline::features::FEATURE_COUNT;

pub const REFERENCE_SAMPLES: usize = 1000;

/// Generates `count` benign profiles in feature layout order.
pub fn benign_profiles(count: usize, seed: u64) -> Vec<Vec<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count).map(|_| benign_profile(&mut rng)).collect()
}

fn benign_profile(rng: &mut StdRng) -> Vec<f64> {
    let members = f64::from(rng.gen_range(8u32..=40));
    let payable = f64::from(rng.gen_range(0u32..=2)).min(members);
    let flags = [
        flag(rng, 0.35), // ownership_transfer
        0.0,             // self_destruct
        flag(rng, 0.02), // delegated_call
        flag(rng, 0.15), // mint_capability
        flag(rng, 0.10), // pause_capability
        flag(rng, 0.10), // withdraw_capability
    ];
    let has_code = rng.gen_bool(0.9);

    let mut profile = Vec::with_capacity(FEATURE_COUNT);
    profile.push(members);
    profile.push(rng.gen_range(0.3..0.65));
    profile.push(payable / members);
    profile.extend_from_slice(&flags);
    profile.push(flags.iter().sum());
    profile.push(f64::from(rng.gen_range(2u32..=5)));
    profile.push(f64::from(rng.gen_range(1u32..=4)));
    if has_code {
        profile.push(rng.gen_range(2.0..14.0));
        profile.push(rng.gen_range(0.0005..0.008));
    } else {
        profile.push(0.0);
        profile.push(0.0);
    }
    profile
}

fn flag(rng: &mut StdRng, probability: f64) -> f64 {
    if rng.gen_bool(probability) {
        1.0
    } else {
        0.0
    }
}
