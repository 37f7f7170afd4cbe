use {
    crate::{config::PresentModePreference, logging::PrettyList},
    ash::vk,
};

/// Choose the number of images for the swapchain to manage.
///
/// One more than the minimum so the application never waits on the driver
/// to release an image, clamped when the surface has a maximum.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let proposed_image_count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        proposed_image_count.min(capabilities.max_image_count)
    } else {
        proposed_image_count
    }
}

/// Prefer 8-bit BGRA sRGB, otherwise take whatever the surface lists first.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> Option<vk::SurfaceFormatKHR> {
    log::debug!("available formats: {:#?}", PrettyList(formats));

    let format = formats
        .iter()
        .copied()
        .find(|format| {
            format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                && format.format == vk::Format::B8G8R8A8_SRGB
        })
        .or_else(|| formats.first().copied());

    log::debug!("chosen format {:#?}", format);

    format
}

/// Use the preferred present mode when the surface supports it. FIFO is
/// always available and is the fallback.
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preference: PresentModePreference,
) -> vk::PresentModeKHR {
    log::debug!("available presentation modes: {:?}", PrettyList(modes));

    let preferred = preference.present_mode();
    let mode = if modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    };

    log::debug!("chosen presentation mode {:?}", mode);

    mode
}

/// Choose the swap extent for the swapchain.
///
/// Surfaces which report a current extent must be matched exactly. A width of
/// `u32::MAX` means the surface takes its size from the swapchain, so the
/// requested size is clamped to the allowed range instead.
pub fn choose_swap_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    requested: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        log::debug!("use current extent {:?}", capabilities.current_extent);
        capabilities.current_extent
    } else {
        let extent = vk::Extent2D {
            width: requested.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: requested.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        };
        log::debug!("use computed extent {:?}", extent);
        extent
    }
}
