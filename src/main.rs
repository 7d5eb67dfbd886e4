// =============================================================================
// TEXTURED QUAD - Vulkan renderer with frames in flight
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (winit event loop, input, FPS)                             │
// │    └── FrameLoop (slot cycling, stale-swapchain recovery)       │
// │          └── Renderer (FrameBackend)                            │
// │                └── Device + Swapchain + Pipeline + Resources    │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for this slot's fence
// 2. Acquire swapchain image
// 3. Update uniforms, record, submit
// 4. Present (recreate the swapchain afterwards if it went stale)
// 5. Advance to the next slot
//
// =============================================================================

mod assets;
mod backend;
mod config;
mod error;
mod frame;
mod mesh;
mod renderer;

use anyhow::Result;
use assets::Assets;
use backend::diagnostics::LogSink;
use config::Config;
use frame::{FrameLoop, FrameStatus, ResizeSignal};
use renderer::Renderer;
use std::sync::Arc;
use std::time::{Duration, Instant};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    init_logging();

    // Load configuration from config.toml
    let config = Config::load();
    log::info!("Starting Vulkan renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    app.finish()
}

/// Info by default, overridable through RUST_LOG
fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

// =============================================================================
// FPS TRACKING
// =============================================================================

/// Frames counted over (at least) one-second windows
struct FpsCounter {
    frame_count: u32,
    last_update: Instant,
    last_frame: Instant,
}

impl FpsCounter {
    fn new(now: Instant) -> Self {
        Self {
            frame_count: 0,
            last_update: now,
            last_frame: now,
        }
    }

    /// Record a presented frame. Returns (fps, last frame time in ms) once a
    /// second has passed since the previous report.
    fn tick(&mut self, now: Instant) -> Option<(f32, f32)> {
        let frame_time = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;
        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_update);
        if elapsed < Duration::from_secs(1) {
            return None;
        }

        let fps = self.frame_count as f32 / elapsed.as_secs_f32();
        self.frame_count = 0;
        self.last_update = now;
        Some((fps, frame_time * 1000.0))
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,

    // Renderer first: it must be dropped before the window it draws into
    renderer: Option<Renderer>,
    frame_loop: Option<FrameLoop>,
    window: Option<Arc<Window>>,

    resize: ResizeSignal,
    is_fullscreen: bool,
    fps: FpsCounter,

    /// First fatal error; returned from `main` after the loop exits
    error: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        Self {
            config,
            renderer: None,
            frame_loop: None,
            window: None,
            resize: ResizeSignal::new(),
            is_fullscreen,
            fps: FpsCounter::new(Instant::now()),
            error: None,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_renderer(&mut self, window: Arc<Window>) -> Result<()> {
        let assets = Assets::load(&self.config.assets)?;
        let sink = Arc::new(LogSink::new(self.config.log_file())?);

        let renderer = Renderer::new(window, &self.config, &assets, sink)?;
        let mut frame_loop = FrameLoop::new(self.config.frames_in_flight(), self.resize.clone());
        if !renderer.has_swapchain() {
            frame_loop.request_recreate();
        }

        self.renderer = Some(renderer);
        self.frame_loop = Some(frame_loop);
        Ok(())
    }

    /// Log, remember and stop. Resources are released as `App` drops.
    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        if self.error.is_none() {
            self.error = Some(error);
        }
        // No more frames once something went wrong
        self.frame_loop = None;
        event_loop.exit();
    }

    fn finish(mut self) -> Result<()> {
        // Tear the renderer down before reporting
        self.frame_loop = None;
        self.renderer = None;
        match self.error.take() {
            Some(error) => Err(error),
            None => {
                log::info!("Cleanup complete");
                Ok(())
            }
        }
    }

    fn is_suspended(&self) -> bool {
        self.frame_loop.as_ref().is_some_and(FrameLoop::is_suspended)
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let (Some(renderer), Some(frame_loop)) = (self.renderer.as_mut(), self.frame_loop.as_mut()) else {
            return;
        };

        match frame_loop.draw_frame(renderer) {
            Ok(FrameStatus::Presented) => self.update_fps(),
            Ok(FrameStatus::Skipped) => {}
            Ok(FrameStatus::Suspended) => {
                // Sleep until the next window event instead of spinning
                event_loop.set_control_flow(ControlFlow::Wait);
            }
            Err(e) => self.fail(event_loop, e.context("Render loop failed")),
        }
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            self.resize.raise();
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        if let (Some((fps, frame_ms)), Some(window)) = (self.fps.tick(Instant::now()), &self.window) {
            let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
            window.set_title(&format!(
                "{} - {:.0} FPS ({:.2}ms) [{}]",
                self.config.window.title, fps, frame_ms, mode
            ));
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };
        self.window = Some(window.clone());

        if let Err(e) = self.init_renderer(window) {
            self.fail(event_loop, e.context("Failed to initialize renderer"));
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: winit::window::WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.resize.raise();
                if let Some(ref window) = self.window {
                    window.request_redraw();
                }
            }

            WindowEvent::RedrawRequested => self.redraw(event_loop),

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    match event.physical_key {
                        PhysicalKey::Code(KeyCode::Escape) => {
                            log::info!("ESC pressed, exiting...");
                            event_loop.exit();
                        }
                        PhysicalKey::Code(KeyCode::F11) => self.toggle_fullscreen(),
                        _ => {}
                    }
                }
            }

            _ => {}
        }
    }

    /// Redraw continuously, except while waiting for a usable window size.
    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.is_suspended() {
            event_loop.set_control_flow(ControlFlow::Wait);
            return;
        }

        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_reported_once_per_second() {
        let start = Instant::now();
        let mut fps = FpsCounter::new(start);

        for i in 1..60 {
            assert_eq!(fps.tick(start + Duration::from_millis(i * 16)), None);
        }

        let (rate, frame_ms) = fps.tick(start + Duration::from_millis(1000)).unwrap();
        assert!((rate - 60.0).abs() < 0.01, "got {rate}");
        assert!((frame_ms - 56.0).abs() < 0.01, "got {frame_ms}");

        // Counter restarts after a report
        assert_eq!(fps.tick(start + Duration::from_millis(1016)), None);
    }
}
