use std::collections::HashSet;
use std::io::Cursor;

use anyhow::{Context, Result};
use image::DynamicImage;
use log::{info, warn};

use crate::coordinates::ScreenSize;

/// The parts of the live desktop the engine observes: pixels and windows.
pub trait Desktop: Send + Sync {
    fn capture(&self) -> Result<DynamicImage>;

    fn screen_size(&self) -> Result<ScreenSize>;

    fn window_titles(&self) -> Result<Vec<String>>;

    fn maximize_window(&self, title: &str) -> Result<()>;
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    img.write_to(&mut buffer, image::ImageOutputFormat::Png)
        .context("Failed to encode screenshot as PNG")?;
    Ok(buffer.into_inner())
}

/// Titles present in `after` but not in `before`, in `after` order.
pub fn new_windows(before: &[String], after: &[String]) -> Vec<String> {
    let known: HashSet<&str> = before.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    after
        .iter()
        .filter(|t| !t.trim().is_empty() && !known.contains(t.as_str()))
        .filter(|t| seen.insert(t.as_str()))
        .cloned()
        .collect()
}

/// Snapshot of window titles taken before an action, used to spot windows the
/// action opened.
pub struct WindowWatch {
    before: Vec<String>,
}

impl WindowWatch {
    pub fn start(desktop: &dyn Desktop) -> Self {
        let before = desktop.window_titles().unwrap_or_else(|e| {
            warn!("Could not list windows: {}", e);
            Vec::new()
        });
        Self { before }
    }

    /// Maximizes the first window that appeared since `start`. Failures are
    /// logged and swallowed.
    pub fn focus_new_window(&self, desktop: &dyn Desktop) -> Option<String> {
        let after = match desktop.window_titles() {
            Ok(titles) => titles,
            Err(e) => {
                warn!("Could not list windows: {}", e);
                return None;
            }
        };
        let title = new_windows(&self.before, &after).into_iter().next()?;
        match desktop.maximize_window(&title) {
            Ok(()) => info!("Maximized new window '{}'", title),
            Err(e) => warn!("Failed to maximize window '{}': {}", title, e),
        }
        Some(title)
    }
}
