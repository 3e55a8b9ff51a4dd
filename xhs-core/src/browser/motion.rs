use std::time::Duration;

use chromiumoxide::element::Element;
use chromiumoxide::layout::Point;
use chromiumoxide::page::Page;
use rand::distributions::Uniform;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::time::sleep;

use crate::config::MotionSection;

use super::error::{BrowserError, BrowserResult};

#[derive(Debug, Clone, Copy)]
pub struct MouseStep {
    pub point: Point,
    pub delay: Duration,
}

/// Moves the pointer along an eased path before clicks.
#[derive(Debug)]
pub struct HumanMotion {
    config: MotionSection,
    last_point: Option<Point>,
    rng: ChaCha8Rng,
}

impl HumanMotion {
    pub fn new(config: MotionSection) -> Self {
        Self::with_rng(config, ChaCha8Rng::from_entropy())
    }

    pub fn with_rng(config: MotionSection, rng: ChaCha8Rng) -> Self {
        Self {
            config,
            last_point: None,
            rng,
        }
    }

    pub async fn click_element(&mut self, page: &Page, element: &Element) -> BrowserResult<()> {
        match element.bounding_box().await {
            Ok(bbox) => {
                let target_x = bbox.x + self.rng.gen_range(0.3..0.7) * bbox.width;
                let target_y = bbox.y + self.rng.gen_range(0.25..0.6) * bbox.height;
                let jitter = self.config.mouse_jitter_px as f64;
                let target = Point::new(
                    target_x + self.random_offset(jitter),
                    target_y + self.random_offset(jitter),
                );
                for step in self.plan_path(target) {
                    page.move_mouse(step.point).await.map_err(|err| {
                        BrowserError::Unexpected(format!("failed to move mouse: {err}"))
                    })?;
                    sleep(step.delay).await;
                }
                self.last_point = Some(target);
            }
            // Off-screen or detached nodes have no box; click without a path.
            Err(err) => tracing::trace!(error = %err, "no bounding box for click target"),
        }
        sleep(self.random_duration(self.config.click_hesitation_ms)).await;
        element
            .click()
            .await
            .map_err(|err| BrowserError::Unexpected(format!("failed to click element: {err}")))?;
        Ok(())
    }

    /// Splits a vertical scroll into human-sized steps.
    pub fn scroll_steps(&mut self, delta_y: f64) -> Vec<f64> {
        let [low, high] = self.config.scroll_step_px;
        let (low, high) = (low.min(high).max(1), low.max(high).max(1));
        let mut remaining = delta_y.abs();
        let sign = delta_y.signum();
        let mut steps = Vec::new();
        while remaining > 0.0 {
            let step = (self.rng.gen_range(low..=high) as f64).min(remaining);
            steps.push(step * sign);
            remaining -= step;
        }
        steps
    }

    pub fn plan_path(&mut self, target: Point) -> Vec<MouseStep> {
        let start = self.last_point.unwrap_or_else(|| Point::new(0.0, 0.0));
        let distance = ((target.x - start.x).powi(2) + (target.y - start.y).powi(2)).sqrt();
        let [low, high] = self.config.mouse_speed_px_s;
        let speed = self.rng.gen_range(low.min(high).max(1)..=high.max(low).max(1)) as f64;
        let duration_secs = (distance / speed).max(0.08);
        let steps = (duration_secs * 60.0).clamp(12.0, 48.0) as usize;
        let delay = Duration::from_secs_f64(duration_secs / steps as f64);
        let mut path = Vec::with_capacity(steps + 1);
        for idx in 1..=steps {
            let eased = ease_in_out_cubic(idx as f64 / steps as f64);
            let point = if idx == steps {
                target
            } else {
                Point::new(
                    start.x + (target.x - start.x) * eased + self.random_offset(1.2),
                    start.y + (target.y - start.y) * eased + self.random_offset(1.2),
                )
            };
            path.push(MouseStep { point, delay });
        }
        path
    }

    fn random_duration(&mut self, bounds: [u32; 2]) -> Duration {
        let (low, high) = (bounds[0].min(bounds[1]), bounds[0].max(bounds[1]));
        Duration::from_millis(self.rng.gen_range(low..=high) as u64)
    }

    fn random_offset(&mut self, max: f64) -> f64 {
        if max <= 0.0 {
            return 0.0;
        }
        self.rng.sample(Uniform::new_inclusive(-max, max))
    }
}

fn ease_in_out_cubic(t: f64) -> f64 {
    if t < 0.5 {
        4.0 * t * t * t
    } else {
        1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn motion() -> HumanMotion {
        HumanMotion::with_rng(MotionSection::default(), ChaCha8Rng::seed_from_u64(7))
    }

    #[test]
    fn path_ends_on_target() {
        let mut motion = motion();
        let target = Point::new(640.0, 360.0);
        let path = motion.plan_path(target);
        assert!((12..=48).contains(&path.len()));
        let last = path.last().unwrap().point;
        assert_eq!((last.x, last.y), (target.x, target.y));
    }

    #[test]
    fn scroll_steps_cover_the_full_distance() {
        let mut motion = motion();
        let steps = motion.scroll_steps(-2500.0);
        let total: f64 = steps.iter().sum();
        assert!((total + 2500.0).abs() < 1e-6);
        assert!(steps.iter().all(|step| *step < 0.0 && step.abs() <= 1_400.0));
    }

    #[test]
    fn easing_is_monotonic() {
        let samples: Vec<f64> = (0..=10).map(|i| ease_in_out_cubic(i as f64 / 10.0)).collect();
        assert!(samples.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(samples[0], 0.0);
        assert_eq!(samples[10], 1.0);
    }
}
