use std::sync::Arc;

use parking_lot::Mutex;
use rand::{rngs::OsRng, Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use thiserror::Error;
use tracing::debug;

/// Draws between reseeds of the production generator from the OS.
const RESEED_INTERVAL: u64 = 1 << 16;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NoiseError {
    #[error("epsilon must be finite and > 0 (got {0})")]
    InvalidEpsilon(f64),
    #[error("delta must be within [0, 1) (got {0})")]
    InvalidDelta(f64),
    #[error("sensitivity must be finite and > 0 (got {0})")]
    InvalidSensitivity(f64),
    #[error("noise scale must be finite and > 0 (got {0})")]
    InvalidScale(f64),
    #[error("entropy source failed: {0}")]
    Entropy(String),
}

/// Randomness capability behind every release. Production code uses
/// [`SecureNoise`]; deterministic doubles exist for tests only.
pub trait NoiseSource: Send + Sync {
    fn laplace(&self, scale: f64) -> Result<f64, NoiseError>;
    fn gaussian(&self, sigma: f64) -> Result<f64, NoiseError>;
}

fn check_scale(scale: f64) -> Result<(), NoiseError> {
    if scale.is_finite() && scale > 0.0 {
        Ok(())
    } else {
        Err(NoiseError::InvalidScale(scale))
    }
}

/// Inverse-CDF draw from Laplace(0, scale).
fn draw_laplace<R: Rng + ?Sized>(rng: &mut R, scale: f64) -> f64 {
    loop {
        let u: f64 = rng.gen::<f64>() - 0.5;
        // u == -0.5 would put ln(0) in the tail.
        if u.abs() < 0.5 {
            return -scale * u.signum() * (1.0 - 2.0 * u.abs()).ln();
        }
    }
}

fn draw_gaussian<R: Rng + ?Sized>(rng: &mut R, sigma: f64) -> Result<f64, NoiseError> {
    let normal = Normal::new(0.0, sigma).map_err(|_| NoiseError::InvalidScale(sigma))?;
    Ok(normal.sample(rng))
}

struct SecureState {
    rng: ChaCha20Rng,
    draws: u64,
}

/// ChaCha20 stream seeded from the operating system and periodically reseeded.
pub struct SecureNoise {
    state: Mutex<SecureState>,
}

impl SecureNoise {
    pub fn new() -> Result<Self, NoiseError> {
        Ok(Self {
            state: Mutex::new(SecureState {
                rng: os_seeded()?,
                draws: 0,
            }),
        })
    }

    fn with_rng<T>(&self, draw: impl FnOnce(&mut ChaCha20Rng) -> T) -> Result<T, NoiseError> {
        let mut state = self.state.lock();
        if state.draws >= RESEED_INTERVAL {
            state.rng = os_seeded()?;
            state.draws = 0;
        }
        state.draws += 1;
        Ok(draw(&mut state.rng))
    }
}

fn os_seeded() -> Result<ChaCha20Rng, NoiseError> {
    ChaCha20Rng::from_rng(OsRng).map_err(|err| NoiseError::Entropy(err.to_string()))
}

impl NoiseSource for SecureNoise {
    fn laplace(&self, scale: f64) -> Result<f64, NoiseError> {
        check_scale(scale)?;
        self.with_rng(|rng| draw_laplace(rng, scale))
    }

    fn gaussian(&self, sigma: f64) -> Result<f64, NoiseError> {
        check_scale(sigma)?;
        self.with_rng(|rng| draw_gaussian(rng, sigma))?
    }
}

/// Reproducible noise for tests and simulations. Offers no privacy.
pub struct SeededNoise {
    rng: Mutex<ChaCha20Rng>,
}

impl SeededNoise {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)),
        }
    }
}

impl NoiseSource for SeededNoise {
    fn laplace(&self, scale: f64) -> Result<f64, NoiseError> {
        check_scale(scale)?;
        Ok(draw_laplace(&mut *self.rng.lock(), scale))
    }

    fn gaussian(&self, sigma: f64) -> Result<f64, NoiseError> {
        check_scale(sigma)?;
        draw_gaussian(&mut *self.rng.lock(), sigma)
    }
}

/// Adds the same offset to every release. Offers no privacy.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConstantNoise(pub f64);

impl NoiseSource for ConstantNoise {
    fn laplace(&self, scale: f64) -> Result<f64, NoiseError> {
        check_scale(scale)?;
        Ok(self.0)
    }

    fn gaussian(&self, sigma: f64) -> Result<f64, NoiseError> {
        check_scale(sigma)?;
        Ok(self.0)
    }
}

/// Distribution and width chosen for one release.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Calibration {
    Laplace { scale: f64 },
    Gaussian { sigma: f64 },
}

impl Calibration {
    /// Laplace when `delta == 0`, the classic Gaussian mechanism otherwise.
    pub fn for_release(sensitivity: f64, epsilon: f64, delta: f64) -> Result<Self, NoiseError> {
        if !sensitivity.is_finite() || sensitivity <= 0.0 {
            return Err(NoiseError::InvalidSensitivity(sensitivity));
        }
        if !epsilon.is_finite() || epsilon <= 0.0 {
            return Err(NoiseError::InvalidEpsilon(epsilon));
        }
        if !(0.0..1.0).contains(&delta) {
            return Err(NoiseError::InvalidDelta(delta));
        }
        if delta == 0.0 {
            Ok(Calibration::Laplace {
                scale: laplace_scale(sensitivity, epsilon),
            })
        } else {
            Ok(Calibration::Gaussian {
                sigma: gaussian_sigma(sensitivity, epsilon, delta),
            })
        }
    }

    pub fn width(&self) -> f64 {
        match *self {
            Calibration::Laplace { scale } => scale,
            Calibration::Gaussian { sigma } => sigma,
        }
    }
}

pub fn laplace_scale(sensitivity: f64, epsilon: f64) -> f64 {
    sensitivity / epsilon
}

pub fn gaussian_sigma(sensitivity: f64, epsilon: f64, delta: f64) -> f64 {
    sensitivity * (2.0 * (1.25 / delta).ln()).sqrt() / epsilon
}

#[derive(Clone)]
pub struct NoiseMechanism {
    source: Arc<dyn NoiseSource>,
}

impl NoiseMechanism {
    pub fn new(source: Arc<dyn NoiseSource>) -> Self {
        Self { source }
    }

    pub fn secure() -> Result<Self, NoiseError> {
        Ok(Self::new(Arc::new(SecureNoise::new()?)))
    }

    pub fn sample(&self, sensitivity: f64, epsilon: f64, delta: f64) -> Result<f64, NoiseError> {
        let calibration = Calibration::for_release(sensitivity, epsilon, delta)?;
        debug!(?calibration, sensitivity, epsilon, delta, "sampling release noise");
        self.draw(calibration)
    }

    /// One independent draw per group, each calibrated to the per-group budget.
    pub fn sample_independent(
        &self,
        count: usize,
        sensitivity: f64,
        epsilon: f64,
        delta: f64,
    ) -> Result<Vec<f64>, NoiseError> {
        let calibration = Calibration::for_release(sensitivity, epsilon, delta)?;
        debug!(?calibration, groups = count, "sampling grouped release noise");
        (0..count).map(|_| self.draw(calibration)).collect()
    }

    fn draw(&self, calibration: Calibration) -> Result<f64, NoiseError> {
        match calibration {
            Calibration::Laplace { scale } => self.source.laplace(scale),
            Calibration::Gaussian { sigma } => self.source.gaussian(sigma),
        }
    }
}
