//! Desktop stabilization: deciding from screenshots whether an action had a
//! visible effect.

use std::time::Duration;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use log::{debug, info, warn};

use crate::action_schema::ActionKind;
use crate::controller::CancelToken;
use crate::error::{EngineError, EngineResult};
use crate::visual_driver::Desktop;

const WINDOW: u32 = 8;
const C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
const C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    /// Structural similarity in `[-1, 1]`.
    pub ssim: f64,
    /// Mean squared error in `[0, inf)`.
    pub mse: f64,
}

/// Compares two screenshots in grayscale. `after` is resized to `before`'s
/// dimensions when they differ.
pub fn compare_images(before: &DynamicImage, after: &DynamicImage) -> Similarity {
    compare_gray(&before.to_luma8(), &after.to_luma8())
}

fn compare_gray(a: &GrayImage, b: &GrayImage) -> Similarity {
    let resized;
    let b = if a.dimensions() != b.dimensions() {
        resized = image::imageops::resize(b, a.width(), a.height(), FilterType::Triangle);
        &resized
    } else {
        b
    };

    Similarity {
        ssim: mean_ssim(a, b),
        mse: mean_squared_error(a, b),
    }
}

fn mean_squared_error(a: &GrayImage, b: &GrayImage) -> f64 {
    let total = (a.width() as u64 * a.height() as u64).max(1) as f64;
    let sum: f64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(&p, &q)| {
            let d = p as f64 - q as f64;
            d * d
        })
        .sum();
    sum / total
}

fn window_ssim(a: &GrayImage, b: &GrayImage, x0: u32, y0: u32, w: u32, h: u32) -> f64 {
    let n = (w * h) as f64;
    let (mut sum_a, mut sum_b) = (0.0, 0.0);
    for y in y0..y0 + h {
        for x in x0..x0 + w {
            sum_a += a.get_pixel(x, y)[0] as f64;
            sum_b += b.get_pixel(x, y)[0] as f64;
        }
    }
    let (mu_a, mu_b) = (sum_a / n, sum_b / n);

    let (mut var_a, mut var_b, mut cov) = (0.0, 0.0, 0.0);
    for y in y0..y0 + h {
        for x in x0..x0 + w {
            let da = a.get_pixel(x, y)[0] as f64 - mu_a;
            let db = b.get_pixel(x, y)[0] as f64 - mu_b;
            var_a += da * da;
            var_b += db * db;
            cov += da * db;
        }
    }
    var_a /= n;
    var_b /= n;
    cov /= n;

    ((2.0 * mu_a * mu_b + C1) * (2.0 * cov + C2))
        / ((mu_a * mu_a + mu_b * mu_b + C1) * (var_a + var_b + C2))
}

fn mean_ssim(a: &GrayImage, b: &GrayImage) -> f64 {
    let (width, height) = a.dimensions();
    if width == 0 || height == 0 {
        return 1.0;
    }

    let mut total = 0.0;
    let mut windows = 0u32;
    let mut y = 0;
    while y < height {
        let h = WINDOW.min(height - y);
        let mut x = 0;
        while x < width {
            let w = WINDOW.min(width - x);
            total += window_ssim(a, b, x, y, w, h);
            windows += 1;
            x += WINDOW;
        }
        y += WINDOW;
    }
    total / windows as f64
}

/// Both metrics have to agree before a difference counts as a change, which
/// keeps anti-aliasing and cursor blinks from passing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChangeThresholds {
    pub ssim_below: f64,
    pub mse_above: f64,
}

impl Default for ChangeThresholds {
    fn default() -> Self {
        Self {
            ssim_below: 0.98,
            mse_above: 1000.0,
        }
    }
}

impl ChangeThresholds {
    pub fn is_change(&self, similarity: &Similarity) -> bool {
        similarity.ssim < self.ssim_below && similarity.mse > self.mse_above
    }
}

/// Fixed-interval bounded retry schedule. It only describes the waits; the
/// caller decides how to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            interval: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// `(attempt, wait before it)` for every attempt; the first never waits.
    pub fn schedule(&self) -> impl Iterator<Item = (u32, Duration)> {
        let interval = self.interval;
        (1..=self.max_attempts).map(move |attempt| {
            let wait = if attempt == 1 { Duration::ZERO } else { interval };
            (attempt, wait)
        })
    }
}

/// Confirms that state-changing actions visibly changed the desktop.
pub struct StabilizationMonitor {
    thresholds: ChangeThresholds,
    policy: RetryPolicy,
    baseline: Option<GrayImage>,
}

impl StabilizationMonitor {
    pub fn new(thresholds: ChangeThresholds, policy: RetryPolicy) -> Self {
        Self {
            thresholds,
            policy,
            baseline: None,
        }
    }

    pub fn set_baseline(&mut self, image: &DynamicImage) {
        self.baseline = Some(image.to_luma8());
    }

    /// Captures the desktop as the "before" image for the next action.
    pub fn capture_baseline(&mut self, desktop: &dyn Desktop) -> EngineResult<()> {
        let image = desktop
            .capture()
            .map_err(|e| EngineError::Capture(e.to_string()))?;
        self.set_baseline(&image);
        Ok(())
    }

    /// Waits for the desktop to differ from the baseline after `kind` ran.
    ///
    /// Returns the number of captures it took (0 when `kind` needs no check).
    /// On success the changed image becomes the new baseline.
    pub async fn confirm_change(
        &mut self,
        kind: ActionKind,
        desktop: &dyn Desktop,
        cancel: &CancelToken,
    ) -> EngineResult<u32> {
        if !kind.needs_stabilization() {
            return Ok(0);
        }

        let baseline = self.baseline.as_ref().ok_or_else(|| {
            warn!("No baseline screenshot; cannot confirm {} took effect", kind);
            EngineError::MissingBaseline
        })?;

        let mut changed = None;
        for (attempt, wait) in self.policy.schedule() {
            cancel.sleep(wait).await?;

            let current = desktop
                .capture()
                .map_err(|e| EngineError::Capture(e.to_string()))?
                .to_luma8();
            let similarity = compare_gray(baseline, &current);
            debug!(
                "Stabilization attempt {}/{}: ssim={:.4} mse={:.1}",
                attempt, self.policy.max_attempts, similarity.ssim, similarity.mse
            );

            if self.thresholds.is_change(&similarity) {
                changed = Some((attempt, current));
                break;
            }
        }

        match changed {
            Some((attempt, current)) => {
                info!("Desktop changed after {} ({} capture(s))", kind, attempt);
                self.baseline = Some(current);
                Ok(attempt)
            }
            None => {
                warn!(
                    "Desktop did not change within {} attempt(s) after {}",
                    self.policy.max_attempts, kind
                );
                Err(EngineError::StabilizationTimeout {
                    attempts: self.policy.max_attempts,
                })
            }
        }
    }
}
