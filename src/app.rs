use std::time::Instant;

use anyhow::Result;
use log::*;
use nalgebra_glm as glm;
use vulkanalia::prelude::v1_0::*;
use winit::event::{DeviceEvent, KeyboardInput, WindowEvent};
use winit::window::{CursorGrabMode, Window};

use crate::camera::Camera;
use crate::config::{Settings, MAX_FRAMES_IN_FLIGHT, MODEL_SPACING};
use crate::input::{Action, InputState};
use crate::instance::VulkanInstance;
use crate::model::Transform;
use crate::overlay::{FrameStats, StatsOverlay};
use crate::renderer::Renderer;
use crate::scheduler::{FrameOutcome, FrameScheduler, ResizeSignal};

/// Our Vulkan app: the renderer plus camera, input and frame pacing.
pub struct App {
    renderer: Renderer,
    scheduler: FrameScheduler,
    camera: Camera,
    input: InputState,
    stats: FrameStats,
    last_frame: Instant,
    cursor_locked: bool,
    minimized: bool,
    quit_requested: bool,
}

impl App {
    /// Creates our Vulkan app.
    pub unsafe fn create(window: &Window, settings: &Settings) -> Result<Self> {
        let instance = VulkanInstance::create(window)?;
        let size = window.inner_size();
        let framebuffer = vk::Extent2D { width: size.width, height: size.height };
        let renderer =
            Renderer::create(instance, settings, framebuffer, Box::new(StatsOverlay::default()))?;
        info!("Renderer ready with {} model(s).", renderer.model_count());
        Ok(Self {
            renderer,
            scheduler: FrameScheduler::new(MAX_FRAMES_IN_FLIGHT, ResizeSignal::default()),
            camera: Camera::default(),
            input: InputState::default(),
            stats: FrameStats::default(),
            last_frame: Instant::now(),
            cursor_locked: false,
            minimized: size.width == 0 || size.height == 0,
            quit_requested: false,
        })
    }

    /// While minimized there is nothing to present.
    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    pub fn should_quit(&self) -> bool {
        self.quit_requested
    }

    pub fn handle_window_event(&mut self, window: &Window, event: &WindowEvent) {
        match event {
            WindowEvent::Resized(size) => {
                self.minimized = size.width == 0 || size.height == 0;
                self.renderer.resize(size.width, size.height);
                self.scheduler.resize_signal().raise();
            }
            WindowEvent::KeyboardInput {
                input: KeyboardInput { virtual_keycode: Some(key), state, .. },
                ..
            } => self.input.key(*key, *state),
            WindowEvent::Focused(false) => {
                self.input.release_all();
                if self.cursor_locked {
                    self.set_cursor_lock(window, false);
                }
            }
            _ => {}
        }
    }

    pub fn handle_device_event(&mut self, event: &DeviceEvent) {
        if let DeviceEvent::MouseMotion { delta: (dx, dy) } = event {
            if self.cursor_locked {
                self.input.mouse_moved(*dx, *dy);
            }
        }
    }

    /// Renders a frame for our Vulkan app.
    pub unsafe fn render(&mut self, window: &Window) -> Result<()> {
        let now = Instant::now();
        let delta = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;
        self.stats.tick(delta);

        for action in self.input.take_actions() {
            self.apply(window, action)?;
        }
        for movement in self.input.movements() {
            self.camera.process_keyboard(movement, delta);
        }
        let (dx, dy) = self.input.take_mouse_delta();
        if self.cursor_locked && (dx != 0.0 || dy != 0.0) {
            // Screen y grows downward; camera pitch grows upward.
            self.camera.process_mouse_movement(dx, -dy);
        }

        self.renderer.prepare(self.camera.view_matrix(), self.stats);
        match self.scheduler.draw_frame(&mut self.renderer)? {
            FrameOutcome::Presented => {}
            outcome => debug!("Frame {}: {:?}", self.stats.frames(), outcome),
        }
        Ok(())
    }

    unsafe fn apply(&mut self, window: &Window, action: Action) -> Result<()> {
        match action {
            Action::ToggleCursorLock => self.set_cursor_lock(window, !self.cursor_locked),
            Action::TogglePolygonMode => {
                let mode = self.renderer.toggle_polygon_mode();
                info!("Polygon mode: {:?}", mode);
            }
            Action::AddModel => {
                let offset = MODEL_SPACING * self.renderer.model_count() as f32;
                let transform = Transform::at(glm::vec3(offset, 0.0, 0.0));
                let settings = self.renderer.settings().clone();
                match self.renderer.add_model(&settings.model, &settings.texture, transform) {
                    Ok(model) => info!("Added model `{}` at x = {}.", model.name, offset),
                    Err(error) => error!("Failed to add model: {:#}", error),
                }
                debug!("{} descriptor sets live.", self.renderer.descriptor_sets());
            }
            Action::Quit => {
                info!("Quit requested.");
                self.quit_requested = true;
            }
            Action::RemoveModel => match self.renderer.remove_model()? {
                Some(name) => info!(
                    "Removed model `{}`; {} descriptor sets live.",
                    name,
                    self.renderer.descriptor_sets()
                ),
                None => debug!("No model left to remove."),
            },
        }
        Ok(())
    }

    fn set_cursor_lock(&mut self, window: &Window, locked: bool) {
        let result = if locked {
            window
                .set_cursor_grab(CursorGrabMode::Confined)
                .or_else(|_| window.set_cursor_grab(CursorGrabMode::Locked))
        } else {
            window.set_cursor_grab(CursorGrabMode::None)
        };
        if let Err(error) = result {
            warn!("Cursor grab not available: {}", error);
        }
        window.set_cursor_visible(!locked);
        self.cursor_locked = locked;
        self.input.take_mouse_delta();
        debug!("Cursor {}.", if locked { "locked" } else { "released" });
    }
}
