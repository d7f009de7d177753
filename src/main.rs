#![allow(clippy::too_many_arguments, clippy::missing_safety_doc)]
pub mod app;
pub mod callback;
pub mod camera;
pub mod config;
pub mod debug;
pub mod descriptors;
pub mod device;
pub mod dynamic_state;
pub mod error;
pub mod frame_graph;
pub mod input;
pub mod instance;
pub mod model;
pub mod overlay;
pub mod renderer;
pub mod resources;
pub mod scheduler;
pub mod swapchain;

use std::process;

use anyhow::Result;
use log::*;
use winit::dpi::LogicalSize;
use winit::event::{Event, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::window::WindowBuilder;

use crate::app::App;
use crate::config::{Settings, WINDOW_TITLE};

fn main() -> Result<()> {
    pretty_env_logger::init();
    let settings = Settings::from_env();
    debug!("{:?}", settings);

    // Window

    let event_loop = EventLoop::new();
    let window = WindowBuilder::new()
        .with_title(WINDOW_TITLE)
        .with_inner_size(LogicalSize::new(settings.width, settings.height))
        .with_visible(false)
        .build(&event_loop)?;

    // App

    let mut app = match unsafe { App::create(&window, &settings) } {
        Ok(app) => Some(app),
        Err(error) => {
            eprintln!("Failed to initialize the renderer: {:#}", error);
            process::exit(1);
        }
    };
    window.set_visible(true);

    event_loop.run(move |event, _, control_flow| {
        match event {
            Event::MainEventsCleared => {
                if let Some(current) = app.as_mut() {
                    if current.is_minimized() {
                        *control_flow = ControlFlow::Wait;
                    } else {
                        *control_flow = ControlFlow::Poll;
                        if let Err(error) = unsafe { current.render(&window) } {
                            eprintln!("Rendering failed: {:#}", error);
                            app.take();
                            *control_flow = ControlFlow::ExitWithCode(1);
                        } else if current.should_quit() {
                            app.take();
                            *control_flow = ControlFlow::Exit;
                        }
                    }
                }
            }
            // Destroy our Vulkan app.
            Event::WindowEvent { event: WindowEvent::CloseRequested, .. } => {
                *control_flow = ControlFlow::Exit;
                app.take();
            }
            Event::WindowEvent { event, .. } => {
                if let Some(current) = app.as_mut() {
                    current.handle_window_event(&window, &event);
                }
            }
            Event::DeviceEvent { event, .. } => {
                if let Some(current) = app.as_mut() {
                    current.handle_device_event(&event);
                }
            }
            Event::LoopDestroyed => {
                app.take();
            }
            _ => {}
        }
    });
}
