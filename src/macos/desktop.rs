use std::fs;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use core_graphics::display::CGDisplay;
use image::DynamicImage;

use super::script;
use crate::coordinates::ScreenSize;
use crate::visual_driver::Desktop;

const LIST_WINDOWS: &[&str] = &[
    "set out to \"\"",
    "tell application \"System Events\"",
    "repeat with p in (every process whose visible is true)",
    "repeat with w in (every window of p)",
    "try",
    "set out to out & (name of w) & linefeed",
    "end try",
    "end repeat",
    "end repeat",
    "end tell",
    "return out",
];

const MAXIMIZE_WINDOW: &[&str] = &[
    "on run argv",
    "set wanted to item 1 of argv",
    "set w_width to (item 2 of argv) as integer",
    "set w_height to (item 3 of argv) as integer",
    "tell application \"System Events\"",
    "repeat with p in (every process whose visible is true)",
    "repeat with w in (every window of p)",
    "if name of w is wanted then",
    "set frontmost of p to true",
    "set position of w to {0, 25}",
    "set size of w to {w_width, w_height - 25}",
    "return \"ok\"",
    "end if",
    "end repeat",
    "end repeat",
    "end tell",
    "return \"missing\"",
    "end run",
];

/// The main display, read with `screencapture` and driven through System Events.
#[derive(Debug, Default)]
pub struct MacDesktop;

impl MacDesktop {
    pub fn new() -> Self {
        Self
    }
}

impl Desktop for MacDesktop {
    fn capture(&self) -> Result<DynamicImage> {
        let output_path = std::env::temp_dir().join(format!("desktop_pilot_{}.png", uuid::Uuid::new_v4()));

        let status = Command::new("screencapture")
            .arg("-x")
            .arg("-t")
            .arg("png")
            .arg(&output_path)
            .status()
            .context("Failed to run screencapture")?;
        if !status.success() {
            return Err(anyhow!("screencapture failed"));
        }

        let image_data = fs::read(&output_path).context("Failed to read screenshot")?;
        let _ = fs::remove_file(&output_path);

        image::load_from_memory(&image_data).context("Failed to decode screenshot")
    }

    /// Logical size in points, the space mouse events are posted in.
    fn screen_size(&self) -> Result<ScreenSize> {
        let bounds = CGDisplay::main().bounds();
        if bounds.size.width <= 0.0 || bounds.size.height <= 0.0 {
            return Err(anyhow!("main display reports an empty size"));
        }
        Ok(ScreenSize::new(bounds.size.width as u32, bounds.size.height as u32))
    }

    fn window_titles(&self) -> Result<Vec<String>> {
        let output = script::run_lines_with_args(LIST_WINDOWS, &[])?;
        Ok(output
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty() && line != "missing value")
            .collect())
    }

    fn maximize_window(&self, title: &str) -> Result<()> {
        let size = self.screen_size()?;
        let args = [title.to_string(), size.width.to_string(), size.height.to_string()];
        match script::run_lines_with_args(MAXIMIZE_WINDOW, &args)?.as_str() {
            "ok" => Ok(()),
            _ => Err(anyhow!("window '{}' not found", title)),
        }
    }
}
