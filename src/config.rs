use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::visual_verification::{ChangeThresholds, RetryPolicy};

/// Runtime settings, read once from the environment (and `.env` if present).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub settle_delay: Duration,
    pub thresholds: ChangeThresholds,
    pub stabilization: RetryPolicy,
    pub max_iterations: u32,
    pub recovery_iterations: u32,
    pub step_pause: Duration,
    pub replay_pause: Duration,
    pub history_dir: PathBuf,
    pub recordings_dir: PathBuf,
    pub vision_url: String,
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_api_key: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let base = base_dir();
        Self {
            settle_delay: Duration::from_millis(1000),
            thresholds: ChangeThresholds::default(),
            stabilization: RetryPolicy::default(),
            max_iterations: 30,
            recovery_iterations: 3,
            step_pause: Duration::from_millis(1000),
            replay_pause: Duration::from_millis(500),
            history_dir: base.join("actions"),
            recordings_dir: base.join("recordings"),
            vision_url: "http://localhost:1145".to_string(),
            llm_base_url: "https://api.openai.com/v1".to_string(),
            llm_model: "gpt-4o".to_string(),
            llm_api_key: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        Self {
            settle_delay: env_millis("PILOT_SETTLE_DELAY_MS", defaults.settle_delay),
            thresholds: ChangeThresholds {
                ssim_below: env_f64("PILOT_SSIM_THRESHOLD", defaults.thresholds.ssim_below),
                mse_above: env_f64("PILOT_MSE_THRESHOLD", defaults.thresholds.mse_above),
            },
            stabilization: RetryPolicy {
                max_attempts: env_u64("PILOT_STABILIZE_ATTEMPTS", defaults.stabilization.max_attempts as u64)
                    .max(1) as u32,
                interval: env_millis("PILOT_STABILIZE_INTERVAL_MS", defaults.stabilization.interval),
            },
            max_iterations: env_u64("PILOT_MAX_ITERATIONS", defaults.max_iterations as u64) as u32,
            recovery_iterations: env_u64("PILOT_RECOVERY_ITERATIONS", defaults.recovery_iterations as u64) as u32,
            step_pause: env_millis("PILOT_STEP_PAUSE_MS", defaults.step_pause),
            replay_pause: env_millis("PILOT_REPLAY_PAUSE_MS", defaults.replay_pause),
            history_dir: env_path("PILOT_HISTORY_DIR", defaults.history_dir),
            recordings_dir: env_path("PILOT_RECORDINGS_DIR", defaults.recordings_dir),
            vision_url: env_string("PILOT_VISION_URL", &defaults.vision_url),
            llm_base_url: env_string("PILOT_LLM_BASE_URL", &defaults.llm_base_url),
            llm_model: env_string("PILOT_LLM_MODEL", &defaults.llm_model),
            llm_api_key: env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty()),
        }
    }
}

fn base_dir() -> PathBuf {
    let mut dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    dir.push(".desktop_pilot");
    dir
}

fn env_u64(key: &str, default_val: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default_val)
}

fn env_f64(key: &str, default_val: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default_val)
}

fn env_millis(key: &str, default_val: Duration) -> Duration {
    Duration::from_millis(env_u64(key, default_val.as_millis() as u64))
}

fn env_string(key: &str, default_val: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default_val.to_string())
}

fn env_path(key: &str, default_val: PathBuf) -> PathBuf {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or(default_val)
}
