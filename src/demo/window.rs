//! Full-screen borderless demo window

use std::thread;
use std::time::{Duration, Instant};

use image::RgbImage;
use minifb::{Key, Window, WindowOptions};
use tracing::info;

use super::FrameSink;
use crate::config::DisplayConfig;
use crate::utils::error::{AnomalyError, Result};
use crate::visualize::{self, Padding, WHITE};

const POLL_INTERVAL: Duration = Duration::from_millis(15);

/// Shows each frame for `frame_interval_ms`, stops on Esc or window close
pub struct WindowSink {
    window: Window,
    buffer: Vec<u32>,
    width: u32,
    height: u32,
    frame_interval: Duration,
}

impl WindowSink {
    pub fn open(title: &str, display: &DisplayConfig) -> Result<Self> {
        let options = WindowOptions {
            borderless: true,
            topmost: true,
            resize: false,
            ..WindowOptions::default()
        };
        let window = Window::new(title, display.width as usize, display.height as usize, options)
            .map_err(|e| AnomalyError::Display(format!("Failed to open window: {e}")))?;

        Ok(Self {
            window,
            buffer: vec![0; (display.width * display.height) as usize],
            width: display.width,
            height: display.height,
            frame_interval: Duration::from_millis(display.frame_interval_ms),
        })
    }

    fn stop_requested(&self) -> bool {
        !self.window.is_open() || self.window.is_key_down(Key::Escape)
    }
}

impl FrameSink for WindowSink {
    fn show(&mut self, frame: &RgbImage) -> Result<bool> {
        let padded;
        let frame = if frame.dimensions() != (self.width, self.height) {
            padded = visualize::resize_with_padding(frame, self.width, self.height, WHITE, Padding::Centered);
            &padded
        } else {
            frame
        };

        for (dst, p) in self.buffer.iter_mut().zip(frame.pixels()) {
            *dst = (p[0] as u32) << 16 | (p[1] as u32) << 8 | p[2] as u32;
        }

        let deadline = Instant::now() + self.frame_interval;
        loop {
            self.window
                .update_with_buffer(&self.buffer, self.width as usize, self.height as usize)
                .map_err(|e| AnomalyError::Display(e.to_string()))?;

            if self.stop_requested() {
                info!("Detected Esc, stopping");
                return Ok(false);
            }
            if Instant::now() >= deadline {
                return Ok(true);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}
