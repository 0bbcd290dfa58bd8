//! Parameter Perturbation Engine.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::config::PerturbationConfig;
use crate::params::{DistributionKind, ParameterDescriptor};
use crate::TmcError;

/// One sampled value, with the draw and default that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerturbedValue {
    pub name: String,
    pub default: f64,
    /// Raw random draw, or the scaling factor for max-min sampling.
    pub random_value: f64,
    /// Value handed to the generator, rounded to nine decimals.
    pub value: f64,
}

#[derive(Debug, Clone)]
pub struct Perturber {
    config: PerturbationConfig,
}

impl Perturber {
    pub fn new(config: PerturbationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PerturbationConfig {
        &self.config
    }

    pub fn perturb<R: Rng + ?Sized>(
        &self,
        descriptor: &ParameterDescriptor,
        rng: &mut R,
    ) -> Result<PerturbedValue, TmcError> {
        let d = descriptor.default;
        let w = descriptor.width;

        let (random_value, value) = match (descriptor.special_case, descriptor.effective_distribution()) {
            (false, DistributionKind::Uniform) => {
                let magnitude = d.abs();
                let draw = rng.gen_range(magnitude * (1.0 - w)..=magnitude * (1.0 + w));
                (draw, d.signum() * draw)
            }
            (false, DistributionKind::Normal) => {
                let draw = sample_normal(&descriptor.name, d, d.abs() * w, rng)?;
                (draw, draw)
            }
            (true, DistributionKind::Uniform) => {
                let draw = rng.gen_range(-w..=w);
                (draw, draw)
            }
            (true, DistributionKind::Normal) => {
                let draw = sample_normal(&descriptor.name, 0.0, w, rng)?;
                (draw, draw)
            }
        };

        Ok(PerturbedValue {
            name: descriptor.name.clone(),
            default: d,
            random_value,
            value: round9(value),
        })
    }

    /// Deterministic max-min value: `d·f` for ordinary parameters, `f − 1`
    /// for special-case ones.
    pub fn scale(&self, descriptor: &ParameterDescriptor, factor: f64) -> PerturbedValue {
        let value = if descriptor.special_case {
            factor - 1.0
        } else {
            descriptor.default * factor
        };
        PerturbedValue {
            name: descriptor.name.clone(),
            default: descriptor.default,
            random_value: factor,
            value: round9(value),
        }
    }

    /// Max-min factor for a draw index; indices past the list wrap around.
    pub fn factor_for_draw(&self, draw: usize) -> Option<f64> {
        let factors = &self.config.max_min_factors;
        if factors.is_empty() {
            None
        } else {
            Some(factors[draw % factors.len()])
        }
    }
}

fn sample_normal<R: Rng + ?Sized>(
    name: &str,
    mean: f64,
    std_dev: f64,
    rng: &mut R,
) -> Result<f64, TmcError> {
    let normal = Normal::new(mean, std_dev).map_err(|err| {
        TmcError::InvalidConfig(format!("parameter {name}: invalid normal distribution: {err}"))
    })?;
    Ok(normal.sample(rng))
}

fn round9(value: f64) -> f64 {
    (value * 1e9).round() / 1e9
}

/// Independent stream for one unit of work, fixed by the campaign seed, the
/// group and the draw index.
pub fn unit_rng(seed: u64, group: usize, draw: usize) -> ChaCha8Rng {
    let mut rng =
        ChaCha8Rng::seed_from_u64(seed ^ 0x7AC0_0000_u64 ^ (group as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    rng.set_stream(draw as u64);
    rng
}
