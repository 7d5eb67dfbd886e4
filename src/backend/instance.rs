// Vulkan Instance - capability probing and instance creation
//
// Responsibilities:
// - Probe available instance layers/extensions
// - Decide which are required (surface + platform surface) and which are
//   optional (debug utils)
// - Create the instance and, if enabled, the debug messenger

use super::diagnostics::{debug_callback, DiagnosticsSink};
use crate::error::RendererError;
use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use std::collections::HashSet;
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

pub const VALIDATION_LAYERS: &[&CStr] = &[c"VK_LAYER_KHRONOS_validation"];

/// Snapshot of what the Vulkan loader offers
#[derive(Debug, Default)]
pub struct InstanceCapabilities {
    layers: HashSet<CString>,
    extensions: HashSet<CString>,
}

impl InstanceCapabilities {
    pub fn probe(entry: &Entry) -> Result<Self> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .context("Failed to enumerate instance layers")?
            .iter()
            .map(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) }.to_owned())
            .collect();

        let extensions = entry
            .enumerate_instance_extension_properties(None)
            .context("Failed to enumerate instance extensions")?
            .iter()
            .map(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }.to_owned())
            .collect();

        Ok(Self { layers, extensions })
    }

    #[cfg(test)]
    pub fn from_names(layers: &[&CStr], extensions: &[&CStr]) -> Self {
        Self {
            layers: layers.iter().map(|&l| l.to_owned()).collect(),
            extensions: extensions.iter().map(|&e| e.to_owned()).collect(),
        }
    }

    pub fn has_layer(&self, name: &CStr) -> bool {
        self.layers.contains(name)
    }

    pub fn has_extension(&self, name: &CStr) -> bool {
        self.extensions.contains(name)
    }

    /// Fails with `ValidationUnavailable` listing every missing layer.
    pub fn require_layers(&self, required: &[&CStr]) -> Result<(), RendererError> {
        let missing: Vec<String> = required
            .iter()
            .filter(|&&layer| !self.has_layer(layer))
            .map(|layer| layer.to_string_lossy().into_owned())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(RendererError::ValidationUnavailable { missing })
        }
    }
}

/// Instance extensions needed to present to a window with this display handle
pub fn surface_extensions(display: RawDisplayHandle) -> Result<Vec<&'static CStr>, RendererError> {
    let platform = match display {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        _ => return Err(RendererError::UnsupportedWindow),
    };
    Ok(vec![khr::Surface::name(), platform])
}

/// Which instance extensions to enable
#[derive(Debug, PartialEq, Eq)]
pub struct ExtensionPlan {
    pub extensions: Vec<&'static CStr>,
    pub debug_utils: bool,
}

impl ExtensionPlan {
    /// Required extensions must exist; debug utils is dropped if unavailable.
    pub fn new(
        caps: &InstanceCapabilities,
        required: &[&'static CStr],
        want_debug_utils: bool,
    ) -> Result<Self, RendererError> {
        if let Some(missing) = required.iter().find(|&&ext| !caps.has_extension(ext)) {
            return Err(RendererError::MissingInstanceExtension(
                missing.to_string_lossy().into_owned(),
            ));
        }

        let mut extensions = required.to_vec();
        let debug_utils = want_debug_utils && caps.has_extension(DebugUtils::name());
        if want_debug_utils && !debug_utils {
            log::warn!("VK_EXT_debug_utils not available, diagnostics disabled");
        }
        if debug_utils {
            extensions.push(DebugUtils::name());
        }

        Ok(Self { extensions, debug_utils })
    }
}

/// Instance wrapper with automatic cleanup.
///
/// Shared (`Arc`) by the surface and the device so it is always destroyed last.
pub struct Instance {
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    // Boxed so the callback's user-data pointer stays valid
    _sink: Option<Box<Arc<dyn DiagnosticsSink>>>,
    pub instance: ash::Instance,
    pub entry: Entry,
}

impl Instance {
    /// Create the Vulkan instance
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `display` - Display handle of the target window, `None` for headless use
    /// * `enable_validation` - Require validation layers and route their output to `sink`
    pub fn new(
        app_name: &str,
        display: Option<RawDisplayHandle>,
        enable_validation: bool,
        sink: Arc<dyn DiagnosticsSink>,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan instance: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let caps = InstanceCapabilities::probe(&entry)?;
        if enable_validation {
            caps.require_layers(VALIDATION_LAYERS)?;
        }

        let required = match display {
            Some(display) => surface_extensions(display)?,
            None => Vec::new(),
        };
        let plan = ExtensionPlan::new(&caps, &required, enable_validation)?;

        let app_name_cstr = CString::new(app_name)?;
        let engine_name = c"No Engine";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let extension_ptrs: Vec<*const c_char> = plan.extensions.iter().map(|e| e.as_ptr()).collect();
        let layer_ptrs: Vec<*const c_char> = if enable_validation {
            VALIDATION_LAYERS.iter().map(|l| l.as_ptr()).collect()
        } else {
            Vec::new()
        };

        let sink = plan.debug_utils.then(|| Box::new(sink));
        let user_data = sink
            .as_ref()
            .map(|s| &**s as *const Arc<dyn DiagnosticsSink> as *mut std::ffi::c_void)
            .unwrap_or(std::ptr::null_mut());

        let mut debug_info = messenger_create_info(user_data);

        let mut create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);

        // Also catch messages emitted while the instance itself is created
        if plan.debug_utils {
            create_info = create_info.push_next(&mut debug_info);
        }

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        let debug_utils = if plan.debug_utils {
            let loader = DebugUtils::new(&entry, &instance);
            match unsafe { loader.create_debug_utils_messenger(&debug_info, None) } {
                Ok(messenger) => Some((loader, messenger)),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e).context("Failed to create debug messenger");
                }
            }
        } else {
            None
        };

        log::info!(
            "Instance created (validation: {}, diagnostics: {})",
            enable_validation,
            debug_utils.is_some()
        );

        Ok(Arc::new(Self {
            debug_utils,
            _sink: sink,
            instance,
            entry,
        }))
    }
}

fn messenger_create_info(user_data: *mut std::ffi::c_void) -> vk::DebugUtilsMessengerCreateInfoEXT {
    vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
        .user_data(user_data)
        .build()
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
