// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device enumeration into immutable candidate snapshots
// - Suitability filtering (queues, extensions, surface support, features)
// - First-fit selection (no ranking)
// - Logical device + queue creation

use super::instance::Instance;
use super::surface::{Surface, SurfaceSupport};
use crate::error::RendererError;
use anyhow::{Context, Result};
use ash::vk;
use std::collections::{BTreeSet, HashSet};
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

/// Device extensions required to present
pub const SWAPCHAIN_EXTENSIONS: &[&CStr] = &[c"VK_KHR_swapchain"];

/// Required Vulkan device features for our renderer
fn required_features() -> vk::PhysicalDeviceFeatures {
    vk::PhysicalDeviceFeatures {
        sampler_anisotropy: vk::TRUE,
        ..Default::default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Scan queue families for graphics and (independently) present support,
    /// stopping as soon as both are found.
    pub fn find(
        families: &[vk::QueueFamilyProperties],
        mut supports_present: impl FnMut(u32) -> Result<bool>,
    ) -> Result<Self> {
        let mut indices = Self::default();

        for (i, family) in families.iter().enumerate() {
            let i = i as u32;
            if indices.graphics.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                indices.graphics = Some(i);
            }
            if indices.present.is_none() && supports_present(i)? {
                indices.present = Some(i);
            }
            if indices.is_complete() {
                break;
            }
        }

        Ok(indices)
    }

    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// (graphics, present) once both are known
    pub fn resolved(&self) -> Option<(u32, u32)> {
        Some((self.graphics?, self.present?))
    }

    /// Distinct family indices, one queue is created per entry
    pub fn unique(&self) -> Vec<u32> {
        self.graphics
            .into_iter()
            .chain(self.present)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// What a device must offer to be picked
#[derive(Debug, Clone)]
pub struct DeviceRequirements {
    pub extensions: Vec<&'static CStr>,
    /// Needs a surface with at least one format and present mode
    pub presentation: bool,
    pub sampler_anisotropy: bool,
}

impl DeviceRequirements {
    pub fn presentation() -> Self {
        Self {
            extensions: SWAPCHAIN_EXTENSIONS.to_vec(),
            presentation: true,
            sampler_anisotropy: true,
        }
    }

    /// Off-screen use (tests, uploads); present queue aliases graphics
    pub fn headless() -> Self {
        Self {
            extensions: Vec::new(),
            presentation: false,
            sampler_anisotropy: true,
        }
    }
}

/// Immutable snapshot of one GPU, produced by enumeration and consumed by selection
#[derive(Debug, Clone)]
pub struct PhysicalDeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub queue_families: QueueFamilyIndices,
    pub extensions: HashSet<CString>,
    pub surface: Option<SurfaceSupport>,
    pub features: vk::PhysicalDeviceFeatures,
}

impl PhysicalDeviceCandidate {
    pub fn probe(instance: &ash::Instance, handle: vk::PhysicalDevice, surface: Option<&Surface>) -> Result<Self> {
        let properties = unsafe { instance.get_physical_device_properties(handle) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let families = unsafe { instance.get_physical_device_queue_family_properties(handle) };
        let queue_families = match surface {
            Some(surface) => QueueFamilyIndices::find(&families, |i| surface.supports_present(handle, i))?,
            None => QueueFamilyIndices::find(&families, |i| {
                Ok(families[i as usize].queue_flags.contains(vk::QueueFlags::GRAPHICS))
            })?,
        };

        let extensions = unsafe { instance.enumerate_device_extension_properties(handle) }
            .context("Failed to enumerate device extensions")?
            .iter()
            .map(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }.to_owned())
            .collect();

        let surface = surface.map(|s| s.support(handle)).transpose()?;
        let features = unsafe { instance.get_physical_device_features(handle) };

        Ok(Self {
            handle,
            name,
            device_type: properties.device_type,
            queue_families,
            extensions,
            surface,
            features,
        })
    }

    /// Why this device can't be used, or `None` if it can
    pub fn unsuitability(&self, requirements: &DeviceRequirements) -> Option<String> {
        if !self.queue_families.is_complete() {
            return Some("missing graphics or present queue family".to_string());
        }

        if let Some(ext) = requirements
            .extensions
            .iter()
            .find(|&&ext| !self.extensions.contains(ext))
        {
            return Some(format!("missing device extension {}", ext.to_string_lossy()));
        }

        if requirements.presentation && !self.surface.as_ref().is_some_and(SurfaceSupport::is_adequate) {
            return Some("insufficient swapchain support".to_string());
        }

        if requirements.sampler_anisotropy && self.features.sampler_anisotropy != vk::TRUE {
            return Some("sampler anisotropy not supported".to_string());
        }

        None
    }

    #[cfg(test)]
    pub fn is_suitable(&self, requirements: &DeviceRequirements) -> bool {
        self.unsuitability(requirements).is_none()
    }
}

/// First suitable candidate in enumeration order.
pub fn select_first_suitable(
    candidates: impl IntoIterator<Item = PhysicalDeviceCandidate>,
    requirements: &DeviceRequirements,
) -> Result<PhysicalDeviceCandidate, RendererError> {
    for candidate in candidates {
        match candidate.unsuitability(requirements) {
            None => {
                log::info!("Selected physical device `{}` ({:?})", candidate.name, candidate.device_type);
                return Ok(candidate);
            }
            Some(reason) => log::warn!("Skipping physical device `{}`: {}", candidate.name, reason),
        }
    }
    Err(RendererError::NoSuitableDevice)
}

/// Logical device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,

    // Queue handles (may alias)
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub present_queue: vk::Queue,
    pub present_queue_family: u32,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,

    instance: Arc<Instance>,
}

impl VulkanDevice {
    /// Pick a GPU and open it. `surface` is `None` for headless use.
    pub fn new(instance: Arc<Instance>, surface: Option<&Surface>) -> Result<Arc<Self>> {
        let raw = &instance.instance;
        let requirements = match surface {
            Some(_) => DeviceRequirements::presentation(),
            None => DeviceRequirements::headless(),
        };

        let handles = unsafe { raw.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;
        if handles.is_empty() {
            log::error!("No Vulkan-capable GPU found");
        }

        let candidates = handles
            .into_iter()
            .map(|handle| PhysicalDeviceCandidate::probe(raw, handle, surface))
            .collect::<Result<Vec<_>>>()?;
        let chosen = select_first_suitable(candidates, &requirements)?;

        let (graphics_queue_family, present_queue_family) = chosen
            .queue_families
            .resolved()
            .ok_or(RendererError::NoSuitableDevice)?;

        let device = Self::create_logical_device(raw, &chosen, &requirements)?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_queue_family, 0) };

        let properties = unsafe { raw.get_physical_device_properties(chosen.handle) };
        let memory_properties = unsafe { raw.get_physical_device_memory_properties(chosen.handle) };

        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics={}, present={}",
            graphics_queue_family,
            present_queue_family
        );

        Ok(Arc::new(Self {
            device,
            physical_device: chosen.handle,
            graphics_queue,
            graphics_queue_family,
            present_queue,
            present_queue_family,
            properties,
            memory_properties,
            instance,
        }))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        candidate: &PhysicalDeviceCandidate,
        requirements: &DeviceRequirements,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = candidate
            .queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions: Vec<*const c_char> = requirements.extensions.iter().map(|e| e.as_ptr()).collect();

        let features = required_features();
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(candidate.handle, &create_info, None) }
            .context("Failed to create logical device")?;

        Ok(device)
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();
        unsafe {
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn adequate_surface() -> SurfaceSupport {
        SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR::default(),
            formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        }
    }

    fn good_candidate(name: &str) -> PhysicalDeviceCandidate {
        PhysicalDeviceCandidate {
            handle: vk::PhysicalDevice::null(),
            name: name.to_string(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            queue_families: QueueFamilyIndices { graphics: Some(0), present: Some(0) },
            extensions: SWAPCHAIN_EXTENSIONS.iter().map(|&e| e.to_owned()).collect(),
            surface: Some(adequate_surface()),
            features: required_features(),
        }
    }

    #[test]
    fn finds_separate_graphics_and_present_families() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::COMPUTE),
        ];
        let indices = QueueFamilyIndices::find(&families, |i| Ok(i == 2)).unwrap();
        assert_eq!(indices, QueueFamilyIndices { graphics: Some(1), present: Some(2) });
        assert_eq!(indices.unique(), vec![1, 2]);
    }

    #[test]
    fn stops_scanning_once_complete() {
        let families = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::GRAPHICS)];
        let mut queried = Vec::new();
        let indices = QueueFamilyIndices::find(&families, |i| {
            queried.push(i);
            Ok(true)
        })
        .unwrap();

        assert_eq!(indices.resolved(), Some((0, 0)));
        assert_eq!(indices.unique(), vec![0]);
        assert_eq!(queried, vec![0]);
    }

    #[test]
    fn incomplete_without_present_support() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let indices = QueueFamilyIndices::find(&families, |_| Ok(false)).unwrap();
        assert!(!indices.is_complete());
        assert_eq!(indices.resolved(), None);
    }

    #[test]
    fn no_present_family_is_never_suitable() {
        let requirements = DeviceRequirements::presentation();
        let mut candidate = good_candidate("gpu");
        assert!(candidate.is_suitable(&requirements));

        candidate.queue_families.present = None;
        assert!(!candidate.is_suitable(&requirements));

        // Nothing else can make up for it
        candidate.extensions.insert(c"VK_KHR_anything".to_owned());
        candidate.device_type = vk::PhysicalDeviceType::DISCRETE_GPU;
        assert!(!candidate.is_suitable(&requirements));
    }

    #[test]
    fn missing_swapchain_extension_is_unsuitable() {
        let mut candidate = good_candidate("gpu");
        candidate.extensions.clear();
        let reason = candidate.unsuitability(&DeviceRequirements::presentation()).unwrap();
        assert!(reason.contains("VK_KHR_swapchain"));
    }

    #[test]
    fn empty_surface_formats_are_unsuitable() {
        let mut candidate = good_candidate("gpu");
        candidate.surface.as_mut().unwrap().formats.clear();
        assert!(!candidate.is_suitable(&DeviceRequirements::presentation()));
        // ...but irrelevant without presentation
        candidate.surface = None;
        assert!(candidate.is_suitable(&DeviceRequirements::headless()));
    }

    #[test]
    fn anisotropy_is_required() {
        let mut candidate = good_candidate("gpu");
        candidate.features.sampler_anisotropy = vk::FALSE;
        assert!(!candidate.is_suitable(&DeviceRequirements::presentation()));
    }

    #[test]
    fn selects_first_suitable_in_enumeration_order() {
        let mut broken = good_candidate("broken");
        broken.queue_families.graphics = None;
        let mut integrated = good_candidate("integrated");
        integrated.device_type = vk::PhysicalDeviceType::INTEGRATED_GPU;
        let discrete = good_candidate("discrete");

        let chosen = select_first_suitable(vec![broken, integrated, discrete], &DeviceRequirements::presentation())
            .unwrap();
        assert_eq!(chosen.name, "integrated");
    }

    #[test]
    fn no_suitable_device_error() {
        let mut candidate = good_candidate("gpu");
        candidate.surface = None;
        let err = select_first_suitable(vec![candidate], &DeviceRequirements::presentation()).unwrap_err();
        assert!(matches!(err, RendererError::NoSuitableDevice));

        let err = select_first_suitable(Vec::new(), &DeviceRequirements::presentation()).unwrap_err();
        assert!(matches!(err, RendererError::NoSuitableDevice));
    }
}
