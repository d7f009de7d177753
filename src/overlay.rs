use anyhow::Result;
use log::*;
use nalgebra_glm as glm;
use vulkanalia::prelude::v1_0::*;

use crate::frame_graph::PolygonMode;
use crate::model::Model;

const FPS_WINDOW_SECONDS: f32 = 1.0;

/// Frame timing, with FPS averaged over roughly one second.
#[derive(Copy, Clone, Debug, Default)]
pub struct FrameStats {
    delta: f32,
    fps: f32,
    frames: u64,
    elapsed: f32,
    window_frames: u32,
    window_time: f32,
}

impl FrameStats {
    pub fn tick(&mut self, delta: f32) {
        let delta = delta.max(0.0);
        self.delta = delta;
        self.frames += 1;
        self.elapsed += delta;
        self.window_frames += 1;
        self.window_time += delta;
        if self.window_time >= FPS_WINDOW_SECONDS {
            self.fps = self.window_frames as f32 / self.window_time;
            self.window_frames = 0;
            self.window_time = 0.0;
        }
    }

    pub fn delta(&self) -> f32 {
        self.delta
    }

    /// Zero until the first averaging window has elapsed.
    pub fn fps(&self) -> f32 {
        self.fps
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn elapsed(&self) -> f32 {
        self.elapsed
    }
}

/// What an overlay may use while the overlay render pass is active.
pub struct OverlayContext<'a> {
    pub device: &'a Device,
    pub command_buffer: vk::CommandBuffer,
    pub extent: vk::Extent2D,
    /// Frame slot being recorded.
    pub slot: usize,
    /// Shared pool with slack reserved for overlay sets.
    pub descriptor_pool: vk::DescriptorPool,
    pub stats: &'a FrameStats,
    pub models: &'a [Model],
    pub polygon_mode: PolygonMode,
}

/// Draws into the overlay pass, after the scene and before the command buffer ends.
pub trait Overlay {
    /// The shared descriptor pool was rebuilt; sets from the old pool are gone.
    fn pool_replaced(&mut self, pool: vk::DescriptorPool);

    fn record(&mut self, ctx: &OverlayContext) -> Result<()>;
}

/// Rows of a model matrix, formatted to two decimals.
pub fn matrix_rows(matrix: &glm::Mat4) -> [String; 4] {
    // Adding zero prints -0.0 as 0.00.
    let cell = |r: usize, c: usize| matrix[(r, c)] + 0.0;
    let row = |r: usize| {
        format!(
            "[ {:.2}, {:.2}, {:.2}, {:.2} ]",
            cell(r, 0),
            cell(r, 1),
            cell(r, 2),
            cell(r, 3)
        )
    };
    [row(0), row(1), row(2), row(3)]
}

/// Reports frame statistics and model matrices to the log once per second.
#[derive(Debug, Default)]
pub struct StatsOverlay {
    next_report: f32,
    pool: vk::DescriptorPool,
    pool_rebuilds: u32,
}

impl StatsOverlay {
    fn due(&mut self, elapsed: f32) -> bool {
        if elapsed < self.next_report {
            return false;
        }
        self.next_report = elapsed.floor() + 1.0;
        true
    }
}

impl Overlay for StatsOverlay {
    fn pool_replaced(&mut self, pool: vk::DescriptorPool) {
        self.pool = pool;
        self.pool_rebuilds += 1;
        trace!("Overlay bound to descriptor pool {:?} (rebuild {}).", pool, self.pool_rebuilds);
    }

    fn record(&mut self, ctx: &OverlayContext) -> Result<()> {
        if !self.due(ctx.stats.elapsed()) {
            return Ok(());
        }
        info!(
            "{:.1} fps ({:.2} ms), frame {}, {:.1}s, {} models, {:?}, slot {}",
            ctx.stats.fps(),
            ctx.stats.delta() * 1000.0,
            ctx.stats.frames(),
            ctx.stats.elapsed(),
            ctx.models.len(),
            ctx.polygon_mode,
            ctx.slot,
        );
        if ctx.descriptor_pool != self.pool {
            warn!("Overlay was not told about the current descriptor pool.");
            self.pool_replaced(ctx.descriptor_pool);
        }
        if log_enabled!(Level::Debug) {
            for (i, model) in ctx.models.iter().enumerate() {
                debug!("Model {} (`{}`) matrix:", i + 1, model.name);
                for row in matrix_rows(&model.transform.matrix()) {
                    debug!("  {}", row);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use vulkanalia::vk::Handle;

    use super::*;
    use crate::model::Transform;

    #[test]
    fn fps_is_averaged_over_a_second() {
        let mut stats = FrameStats::default();
        for _ in 0..59 {
            stats.tick(1.0 / 60.0);
        }
        assert_eq!(stats.fps(), 0.0);
        stats.tick(1.0 / 60.0 + 1e-4);
        assert_relative_eq!(stats.fps(), 60.0, epsilon = 0.1);
        assert_eq!(stats.frames(), 60);
        assert_relative_eq!(stats.elapsed(), 1.0, epsilon = 1e-3);
    }

    #[test]
    fn slow_frames_close_the_window_early() {
        let mut stats = FrameStats::default();
        stats.tick(0.5);
        stats.tick(0.75);
        assert_relative_eq!(stats.fps(), 2.0 / 1.25);
        assert_relative_eq!(stats.delta(), 0.75);
    }

    #[test]
    fn negative_deltas_are_ignored() {
        let mut stats = FrameStats::default();
        stats.tick(-1.0);
        assert_eq!(stats.elapsed(), 0.0);
        assert_eq!(stats.frames(), 1);
    }

    #[test]
    fn matrix_rows_put_translation_in_the_last_column() {
        let matrix = Transform::at(glm::vec3(2.5, 0.0, -1.0)).matrix();
        let rows = matrix_rows(&matrix);
        assert_eq!(rows[0], "[ 1.00, 0.00, 0.00, 2.50 ]");
        assert_eq!(rows[2], "[ 0.00, 0.00, 1.00, -1.00 ]");
        assert_eq!(rows[3], "[ 0.00, 0.00, 0.00, 1.00 ]");
    }

    #[test]
    fn stats_overlay_follows_pool_rebuilds() {
        let mut overlay = StatsOverlay::default();
        overlay.pool_replaced(vk::DescriptorPool::from_raw(7));
        overlay.pool_replaced(vk::DescriptorPool::from_raw(9));
        assert_eq!(overlay.pool, vk::DescriptorPool::from_raw(9));
        assert_eq!(overlay.pool_rebuilds, 2);
    }

    #[test]
    fn stats_overlay_reports_once_per_second() {
        let mut overlay = StatsOverlay::default();
        assert!(overlay.due(0.0));
        assert!(!overlay.due(0.4));
        assert!(!overlay.due(0.99));
        assert!(overlay.due(1.01));
        assert!(!overlay.due(1.5));
        assert!(overlay.due(3.2));
        assert!(!overlay.due(3.9));
    }
}
