// Surface - connection between the Vulkan instance and a native window
//
// Creation is platform specific (Win32 / Xlib / Xcb / Wayland), queries are not.

use super::instance::Instance;
use crate::error::RendererError;
use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

/// Everything the surface advertises for one physical device
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    /// A swapchain needs at least one format and one present mode
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

pub struct Surface {
    pub surface: vk::SurfaceKHR,
    pub loader: khr::Surface,
    // Keeps the instance alive until the surface is destroyed
    _instance: Arc<Instance>,
}

impl Surface {
    /// # Safety contract
    /// The window behind `window` must outlive the returned surface.
    pub fn new(instance: Arc<Instance>, display: RawDisplayHandle, window: RawWindowHandle) -> Result<Self> {
        let entry = &instance.entry;
        let raw = &instance.instance;

        let surface = unsafe {
            match (display, window) {
                (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
                    let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
                    let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
                    let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                        .hinstance(hinstance)
                        .hwnd(hwnd);
                    khr::Win32Surface::new(entry, raw).create_win32_surface(&create_info, None)
                }
                (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
                    let dpy = display.display.map(|d| d.as_ptr()).unwrap_or(std::ptr::null_mut());
                    let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                        .dpy(dpy as *mut _)
                        .window(handle.window);
                    khr::XlibSurface::new(entry, raw).create_xlib_surface(&create_info, None)
                }
                (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(handle)) => {
                    let connection = display.connection.map(|c| c.as_ptr()).unwrap_or(std::ptr::null_mut());
                    let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                        .connection(connection as *mut _)
                        .window(handle.window.get());
                    khr::XcbSurface::new(entry, raw).create_xcb_surface(&create_info, None)
                }
                (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
                    let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                        .display(display.display.as_ptr() as *mut _)
                        .surface(handle.surface.as_ptr() as *mut _);
                    khr::WaylandSurface::new(entry, raw).create_wayland_surface(&create_info, None)
                }
                _ => return Err(RendererError::UnsupportedWindow.into()),
            }
        }
        .context("Failed to create window surface")?;

        let loader = khr::Surface::new(entry, raw);
        log::info!("Window surface created");

        Ok(Self {
            surface,
            loader,
            _instance: instance,
        })
    }

    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, queue_family: u32) -> Result<bool> {
        let supported = unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, queue_family, self.surface)
        }?;
        Ok(supported)
    }

    /// Query current capabilities, formats and present modes
    pub fn support(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        unsafe {
            Ok(SurfaceSupport {
                capabilities: self
                    .loader
                    .get_physical_device_surface_capabilities(physical_device, self.surface)
                    .context("Failed to query surface capabilities")?,
                formats: self
                    .loader
                    .get_physical_device_surface_formats(physical_device, self.surface)
                    .context("Failed to query surface formats")?,
                present_modes: self
                    .loader
                    .get_physical_device_surface_present_modes(physical_device, self.surface)
                    .context("Failed to query surface present modes")?,
            })
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.surface, None);
        }
    }
}
