// SPDX-License-Identifier: CEPL-1.0
use anyhow::{anyhow, Context, Result};
use ash::ext::debug_utils;
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use chopper_core::FatalError;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, error, info, trace, warn};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub const DEPTH_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

#[derive(Clone, Debug)]
pub struct ContextConfig {
    pub app_name: String,
    /// Enables the Khronos validation layer and routes its output to tracing.
    pub validation: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            app_name: "Chopper".to_owned(),
            validation: cfg!(debug_assertions),
        }
    }
}

pub struct SurfaceBinding {
    pub loader: surface::Instance,
    pub surface: vk::SurfaceKHR,
}

struct DebugMessenger {
    loader: debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

/// What a physical device offers, reduced to what the engine requires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceCaps {
    pub api_version: u32,
    pub dynamic_rendering: bool,
    pub synchronization2: bool,
    pub sampler_anisotropy: bool,
    pub swapchain_ext: bool,
    pub queue_family: Option<u32>,
}

impl DeviceCaps {
    /// Names of every unmet requirement; empty means the device is usable.
    pub fn missing(&self, needs_present: bool) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.api_version < vk::API_VERSION_1_3 {
            out.push("Vulkan 1.3");
        }
        if !self.dynamic_rendering {
            out.push("dynamicRendering");
        }
        if !self.synchronization2 {
            out.push("synchronization2");
        }
        if !self.sampler_anisotropy {
            out.push("samplerAnisotropy");
        }
        if needs_present && !self.swapchain_ext {
            out.push("VK_KHR_swapchain");
        }
        if self.queue_family.is_none() {
            out.push(if needs_present {
                "graphics+present queue"
            } else {
                "graphics queue"
            });
        }
        out
    }
}

/// Highest count in `supported` that does not exceed `requested`.
pub fn clamp_sample_count(requested: u32, supported: vk::SampleCountFlags) -> vk::SampleCountFlags {
    [
        (64, vk::SampleCountFlags::TYPE_64),
        (32, vk::SampleCountFlags::TYPE_32),
        (16, vk::SampleCountFlags::TYPE_16),
        (8, vk::SampleCountFlags::TYPE_8),
        (4, vk::SampleCountFlags::TYPE_4),
        (2, vk::SampleCountFlags::TYPE_2),
    ]
    .into_iter()
    .find(|&(n, flag)| n <= requested && supported.contains(flag))
    .map(|(_, flag)| flag)
    .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

/// First candidate whose optimal-tiling features include `feature`.
pub fn first_supported_format(
    candidates: &[vk::Format],
    feature: vk::FormatFeatureFlags,
    props: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    candidates
        .iter()
        .copied()
        .find(|&f| props(f).optimal_tiling_features.contains(feature))
}

pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT
    )
}

static LIVE_INSTANCES: AtomicUsize = AtomicUsize::new(0);

/// Vulkan instances created by this crate that have not been destroyed yet.
pub fn live_instances() -> usize {
    LIVE_INSTANCES.load(Ordering::Relaxed)
}

/// Instance-level objects. Owned from the moment the instance exists, so a
/// failure anywhere later in context creation still tears them down.
struct InstanceObjects {
    instance: Instance,
    surface: Option<SurfaceBinding>,
    debug: Option<DebugMessenger>,
    // Keeps the loader library mapped until the instance is gone.
    entry: Entry,
}

impl InstanceObjects {
    unsafe fn new(entry: Entry, cfg: &ContextConfig, wsi_exts: &[*const c_char]) -> Result<Self> {
        let (instance, validation) = create_instance(&entry, cfg, wsi_exts)?;
        LIVE_INSTANCES.fetch_add(1, Ordering::Relaxed);
        let mut out = Self {
            instance,
            surface: None,
            debug: None,
            entry,
        };
        if validation {
            out.debug = Some(create_debug_messenger(&out.entry, &out.instance)?);
        }
        Ok(out)
    }
}

// STRICT TEARDOWN ORDER: surface, then messenger, instance last.
impl Drop for InstanceObjects {
    fn drop(&mut self) {
        unsafe {
            if let Some(s) = self.surface.take() {
                s.loader.destroy_surface(s.surface, None);
            }
            if let Some(d) = self.debug.take() {
                d.loader.destroy_debug_utils_messenger(d.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        LIVE_INSTANCES.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Instance, optional surface, the chosen physical device, the logical device
/// and its single graphics(+present) queue. Everything else borrows from here.
pub struct DeviceContext {
    pub instance: Instance,
    pub phys: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub queue_family: u32,
    pub properties: vk::PhysicalDeviceProperties,
    pub depth_format: vk::Format,
    // Dropped after `Drop::drop` destroyed the device.
    base: InstanceObjects,
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if data.is_null() || unsafe { (*data).p_message.is_null() } {
        return vk::FALSE;
    }
    let msg = unsafe { CStr::from_ptr((*data).p_message) }.to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", ?types, "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", ?types, "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        debug!(target: "vulkan", ?types, "{msg}");
    } else {
        trace!(target: "vulkan", ?types, "{msg}");
    }
    vk::FALSE
}

unsafe fn layer_available(entry: &Entry, name: &CStr) -> bool {
    entry
        .enumerate_instance_layer_properties()
        .unwrap_or_default()
        .iter()
        .any(|l| l.layer_name_as_c_str().is_ok_and(|n| n == name))
}

unsafe fn create_instance(
    entry: &Entry,
    cfg: &ContextConfig,
    wsi_exts: &[*const c_char],
) -> Result<(Instance, bool)> {
    let version = entry
        .try_enumerate_instance_version()
        .context("vkEnumerateInstanceVersion")?
        .unwrap_or(vk::API_VERSION_1_0);
    if version < vk::API_VERSION_1_3 {
        return Err(FatalError::MissingCapability(format!(
            "Vulkan 1.3 instance (loader reports {}.{})",
            vk::api_version_major(version),
            vk::api_version_minor(version)
        ))
        .into());
    }

    let app = CString::new(cfg.app_name.as_str()).context("app name contains NUL")?;
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app.as_ptr(),
        application_version: 0,
        p_engine_name: c"Chopper".as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_3,
        ..Default::default()
    };

    let mut exts = wsi_exts.to_vec();
    let mut layers: Vec<*const c_char> = Vec::new();
    let validation = cfg.validation && layer_available(entry, VALIDATION_LAYER);
    if cfg.validation && !validation {
        warn!("validation requested but VK_LAYER_KHRONOS_validation is not installed");
    }
    if validation {
        exts.push(debug_utils::NAME.as_ptr());
        layers.push(VALIDATION_LAYER.as_ptr());
    }

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: exts.len() as u32,
        pp_enabled_extension_names: exts.as_ptr(),
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };
    let instance = entry
        .create_instance(&create_info, None)
        .context("vkCreateInstance")?;
    Ok((instance, validation))
}

unsafe fn create_debug_messenger(entry: &Entry, instance: &Instance) -> Result<DebugMessenger> {
    let loader = debug_utils::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    let messenger = loader
        .create_debug_utils_messenger(&ci, None)
        .context("vkCreateDebugUtilsMessengerEXT")?;
    Ok(DebugMessenger { loader, messenger })
}

unsafe fn query_caps(
    instance: &Instance,
    phys: vk::PhysicalDevice,
    surface: Option<&SurfaceBinding>,
) -> Result<DeviceCaps> {
    let props = instance.get_physical_device_properties(phys);

    let mut feats13 = vk::PhysicalDeviceVulkan13Features {
        s_type: vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_3_FEATURES,
        ..Default::default()
    };
    let mut feats2 = vk::PhysicalDeviceFeatures2 {
        s_type: vk::StructureType::PHYSICAL_DEVICE_FEATURES_2,
        p_next: (&mut feats13) as *mut _ as *mut _,
        ..Default::default()
    };
    if props.api_version >= vk::API_VERSION_1_3 {
        instance.get_physical_device_features2(phys, &mut feats2);
    }

    let swapchain_ext = instance
        .enumerate_device_extension_properties(phys)
        .context("vkEnumerateDeviceExtensionProperties")?
        .iter()
        .any(|e| e.extension_name_as_c_str().is_ok_and(|n| n == swapchain::NAME));

    let mut queue_family = None;
    for (i, q) in instance
        .get_physical_device_queue_family_properties(phys)
        .iter()
        .enumerate()
    {
        if !q.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            continue;
        }
        let presents = match surface {
            Some(s) => s
                .loader
                .get_physical_device_surface_support(phys, i as u32, s.surface)
                .unwrap_or(false),
            None => true,
        };
        if presents {
            queue_family = Some(i as u32);
            break;
        }
    }

    Ok(DeviceCaps {
        api_version: props.api_version,
        dynamic_rendering: feats13.dynamic_rendering == vk::TRUE,
        synchronization2: feats13.synchronization2 == vk::TRUE,
        sampler_anisotropy: feats2.features.sampler_anisotropy == vk::TRUE,
        swapchain_ext,
        queue_family,
    })
}

fn device_name(props: &vk::PhysicalDeviceProperties) -> String {
    props
        .device_name_as_c_str()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "<unnamed>".to_owned())
}

unsafe fn pick_physical_device(
    instance: &Instance,
    surface: Option<&SurfaceBinding>,
) -> Result<(vk::PhysicalDevice, u32)> {
    let devices = instance
        .enumerate_physical_devices()
        .context("vkEnumeratePhysicalDevices")?;
    for phys in devices {
        let name = device_name(&instance.get_physical_device_properties(phys));
        let caps = query_caps(instance, phys, surface)?;
        let missing = caps.missing(surface.is_some());
        match caps.queue_family {
            Some(family) if missing.is_empty() => {
                info!("vk: using device {name} (queue family {family})");
                return Ok((phys, family));
            }
            _ => debug!("vk: skipping {name}: missing {}", missing.join(", ")),
        }
    }
    Err(FatalError::NoSuitableDevice.into())
}

unsafe fn create_logical_device(
    instance: &Instance,
    phys: vk::PhysicalDevice,
    queue_family: u32,
    with_swapchain: bool,
) -> Result<ash::Device> {
    // STRICT ORDER (feature pNext chain): feats2 -> feats13. Core 1.3 only.
    let priorities = [1.0_f32];
    let qinfo = vk::DeviceQueueCreateInfo {
        s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
        queue_family_index: queue_family,
        queue_count: 1,
        p_queue_priorities: priorities.as_ptr(),
        ..Default::default()
    };

    let mut feats13 = vk::PhysicalDeviceVulkan13Features {
        s_type: vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_3_FEATURES,
        dynamic_rendering: vk::TRUE,
        synchronization2: vk::TRUE,
        ..Default::default()
    };
    let feats2 = vk::PhysicalDeviceFeatures2 {
        s_type: vk::StructureType::PHYSICAL_DEVICE_FEATURES_2,
        p_next: (&mut feats13) as *mut _ as *mut _,
        features: vk::PhysicalDeviceFeatures {
            sampler_anisotropy: vk::TRUE,
            ..Default::default()
        },
        ..Default::default()
    };

    let exts: Vec<*const c_char> = if with_swapchain {
        vec![swapchain::NAME.as_ptr()]
    } else {
        Vec::new()
    };

    let dinfo = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        p_next: (&feats2) as *const _ as *const _,
        queue_create_info_count: 1,
        p_queue_create_infos: &qinfo,
        enabled_extension_count: exts.len() as u32,
        pp_enabled_extension_names: exts.as_ptr(),
        ..Default::default()
    };
    Ok(instance
        .create_device(phys, &dinfo, None)
        .context("vkCreateDevice")?)
}

unsafe fn pick_depth_format(instance: &Instance, phys: vk::PhysicalDevice) -> Result<vk::Format> {
    first_supported_format(
        &DEPTH_CANDIDATES,
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        |f| instance.get_physical_device_format_properties(phys, f),
    )
    .ok_or_else(|| {
        FatalError::UnsupportedFormat {
            what: "depth attachment",
            candidates: format!("{DEPTH_CANDIDATES:?}"),
        }
        .into()
    })
}

impl DeviceContext {
    /// STRICT ORDER:
    /// 1) instance (WSI extensions for this display)
    /// 2) surface from THIS instance
    /// 3) physical device + queue family checked AGAINST this surface
    /// 4) logical device with the 1.3 feature chain
    pub fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        cfg: &ContextConfig,
    ) -> Result<Self> {
        let dh = display
            .display_handle()
            .map_err(|e| anyhow!("display handle: {e}"))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| anyhow!("window handle: {e}"))?
            .as_raw();

        unsafe {
            let entry = Entry::load().context("load Vulkan loader")?;
            let wsi = ash_window::enumerate_required_extensions(dh)
                .context("ash_window::enumerate_required_extensions")?;
            let mut base = InstanceObjects::new(entry, cfg, wsi)?;
            let raw = ash_window::create_surface(&base.entry, &base.instance, dh, wh, None)
                .context("ash_window::create_surface")?;
            base.surface = Some(SurfaceBinding {
                loader: surface::Instance::new(&base.entry, &base.instance),
                surface: raw,
            });
            Self::finish(base)
        }
    }

    /// Device without a surface or swapchain, for offscreen work and tests.
    pub fn headless(cfg: &ContextConfig) -> Result<Self> {
        unsafe {
            let entry = Entry::load().context("load Vulkan loader")?;
            Self::finish(InstanceObjects::new(entry, cfg, &[])?)
        }
    }

    // `base` drops on every early return, taking the instance with it.
    unsafe fn finish(base: InstanceObjects) -> Result<Self> {
        let instance = base.instance.clone();
        let (phys, queue_family) = pick_physical_device(&instance, base.surface.as_ref())?;
        let depth_format = pick_depth_format(&instance, phys)?;
        let device = create_logical_device(&instance, phys, queue_family, base.surface.is_some())?;
        let queue = device.get_device_queue(queue_family, 0);
        let properties = instance.get_physical_device_properties(phys);
        info!(
            "vk: device ready (api {}.{}, depth {:?}, max anisotropy {})",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            depth_format,
            properties.limits.max_sampler_anisotropy
        );
        Ok(Self {
            instance,
            phys,
            device,
            queue,
            queue_family,
            properties,
            depth_format,
            base,
        })
    }

    pub fn surface(&self) -> Option<&SurfaceBinding> {
        self.base.surface.as_ref()
    }

    pub fn device_name(&self) -> String {
        device_name(&self.properties)
    }

    /// Sample counts usable for both the color and the depth attachment.
    pub fn supported_sample_counts(&self) -> vk::SampleCountFlags {
        let l = &self.properties.limits;
        l.framebuffer_color_sample_counts & l.framebuffer_depth_sample_counts
    }

    pub fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        unsafe { self.instance.get_physical_device_memory_properties(self.phys) }
    }

    pub fn wait_idle(&self) {
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            warn!("vkDeviceWaitIdle: {e:?}");
        }
    }
}

// STRICT TEARDOWN ORDER: device here, then `base` drops the surface,
// messenger and instance. Every object created from `device` must already be gone.
impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
        }
        debug!("vk: device context destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> DeviceCaps {
        DeviceCaps {
            api_version: vk::API_VERSION_1_3,
            dynamic_rendering: true,
            synchronization2: true,
            sampler_anisotropy: true,
            swapchain_ext: true,
            queue_family: Some(0),
        }
    }

    #[test]
    fn complete_device_has_nothing_missing() {
        assert!(complete().missing(true).is_empty());
    }

    #[test]
    fn missing_requirements_are_named() {
        let caps = DeviceCaps {
            api_version: vk::make_api_version(0, 1, 2, 0),
            sampler_anisotropy: false,
            ..complete()
        };
        assert_eq!(caps.missing(true), vec!["Vulkan 1.3", "samplerAnisotropy"]);

        let caps = DeviceCaps {
            swapchain_ext: false,
            queue_family: None,
            ..complete()
        };
        assert_eq!(caps.missing(false), vec!["graphics queue"]);
        assert_eq!(
            caps.missing(true),
            vec!["VK_KHR_swapchain", "graphics+present queue"]
        );
    }

    #[test]
    fn sample_count_clamps_to_supported() {
        let supported = vk::SampleCountFlags::TYPE_1
            | vk::SampleCountFlags::TYPE_2
            | vk::SampleCountFlags::TYPE_4;
        assert_eq!(clamp_sample_count(8, supported), vk::SampleCountFlags::TYPE_4);
        assert_eq!(clamp_sample_count(4, supported), vk::SampleCountFlags::TYPE_4);
        assert_eq!(clamp_sample_count(3, supported), vk::SampleCountFlags::TYPE_2);
        assert_eq!(clamp_sample_count(1, supported), vk::SampleCountFlags::TYPE_1);
        assert_eq!(clamp_sample_count(0, supported), vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn depth_format_follows_candidate_order() {
        let only_d24 = |f: vk::Format| vk::FormatProperties {
            optimal_tiling_features: if f == vk::Format::D24_UNORM_S8_UINT {
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::FormatFeatureFlags::empty()
            },
            ..Default::default()
        };
        let picked = first_supported_format(
            &DEPTH_CANDIDATES,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            only_d24,
        );
        assert_eq!(picked, Some(vk::Format::D24_UNORM_S8_UINT));
        assert!(has_stencil(vk::Format::D24_UNORM_S8_UINT));
        assert!(!has_stencil(vk::Format::D32_SFLOAT));

        let none = first_supported_format(
            &DEPTH_CANDIDATES,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |_| vk::FormatProperties::default(),
        );
        assert_eq!(none, None);
    }
}
