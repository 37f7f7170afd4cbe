use {
    super::{selection, SwapchainError, SwapchainState},
    crate::{
        config::PresentModePreference,
        device::{timeout_ns, GpuDevice},
        sync::SyncManager,
    },
    ash::vk::{self, Handle},
    std::{sync::Arc, time::Duration},
};

/// Owns the swapchain, its images and views, and drives recreation.
pub struct SwapchainCoordinator {
    state: SwapchainState,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,

    /// The drawable size last reported by the window.
    requested_extent: vk::Extent2D,

    /// The last acquire reported a suboptimal swapchain. It is rebuilt once
    /// the acquired image has been presented.
    suboptimal: bool,

    preference: PresentModePreference,
    acquire_timeout: Duration,
    device: Arc<dyn GpuDevice>,
}

// Public API
// ----------

impl SwapchainCoordinator {
    /// Create the swapchain for a surface of the given size.
    ///
    /// A zero-area surface (a minimized window) yields a Stale coordinator
    /// with no swapchain. It becomes Valid after a successful
    /// [SwapchainCoordinator::recreate].
    pub fn new(
        device: Arc<dyn GpuDevice>,
        extent: vk::Extent2D,
        preference: PresentModePreference,
        acquire_timeout: Duration,
    ) -> Result<Self, SwapchainError> {
        let mut coordinator = Self {
            state: SwapchainState::Stale,
            swapchain: vk::SwapchainKHR::null(),
            images: vec![],
            image_views: vec![],
            format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            requested_extent: extent,
            suboptimal: false,
            preference,
            acquire_timeout,
            device,
        };
        let extent = coordinator.choose_extent(extent)?;
        if is_zero_area(extent) {
            log::debug!("Surface has zero area, swapchain creation deferred");
        } else {
            coordinator.rebuild(extent)?;
            coordinator.state = SwapchainState::Valid;
        }
        Ok(coordinator)
    }

    pub fn state(&self) -> SwapchainState {
        self.state
    }

    pub fn is_stale(&self) -> bool {
        self.state == SwapchainState::Stale
    }

    /// The extent the current images were created with.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn raw(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Called by the window when the drawable size changes. The swapchain is
    /// marked Stale when the new size differs from its images.
    pub fn notify_resized(&mut self, extent: vk::Extent2D) {
        self.requested_extent = extent;
        if self.state == SwapchainState::Valid && extent != self.extent {
            log::debug!(
                "Surface resized from {:?} to {:?}, swapchain is stale",
                self.extent,
                extent
            );
            self.state = SwapchainState::Stale;
        }
    }

    /// The size the next swapchain should have, according to the surface.
    pub fn current_surface_extent(
        &self,
    ) -> Result<vk::Extent2D, SwapchainError> {
        self.choose_extent(self.requested_extent)
    }

    /// Acquire the next presentable image.
    ///
    /// Fails with [SwapchainError::SwapchainStale] unless the coordinator is
    /// Valid, and moves to Stale when the presentation engine reports the
    /// swapchain out of date. A suboptimal swapchain still yields a usable
    /// image and is marked Stale after that image is presented.
    pub fn acquire_image(
        &mut self,
        semaphore: vk::Semaphore,
    ) -> Result<u32, SwapchainError> {
        if self.state != SwapchainState::Valid {
            return Err(SwapchainError::SwapchainStale);
        }

        let result = unsafe {
            self.device.acquire_next_image(
                self.swapchain,
                timeout_ns(self.acquire_timeout),
                semaphore,
            )
        };
        match result {
            // index acquired and the swapchain is optimal
            Ok((index, false)) => Ok(index),

            // index acquired but the swapchain is suboptimal for the surface
            Ok((index, true)) => {
                log::debug!(
                    "Acquire Image: Swapchain suboptimal, rebuild after present"
                );
                self.suboptimal = true;
                Ok(index)
            }

            // the swapchain no longer matches the surface
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Acquire Image: Swapchain out of date");
                self.state = SwapchainState::Stale;
                Err(SwapchainError::SwapchainStale)
            }

            Err(source) => Err(SwapchainError::classify(
                source,
                SwapchainError::UnableToAcquireImage,
            )),
        }
    }

    /// Queue an acquired image for presentation once every wait semaphore
    /// signals.
    ///
    /// Out-of-date and suboptimal results mark the coordinator Stale and are
    /// not errors. Presenting to a swapchain marked Stale by
    /// [SwapchainCoordinator::notify_resized] is allowed, since the image was
    /// acquired while it was Valid.
    pub fn present(
        &mut self,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<(), SwapchainError> {
        if self.swapchain == vk::SwapchainKHR::null()
            || self.state == SwapchainState::Recreating
        {
            return Err(SwapchainError::SwapchainStale);
        }

        let result = unsafe {
            self.device
                .queue_present(self.swapchain, image_index, wait_semaphores)
        };
        let needs_rebuild = match result {
            // presentation succeeded and the swapchain is still optimal
            Ok(false) => self.suboptimal,

            // presentation succeeded but the swapchain is suboptimal
            Ok(true) => {
                log::debug!("Present Image: Swapchain is suboptimal");
                true
            }

            // the swapchain no longer matches the surface
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Present Image: Swapchain out of date");
                true
            }

            Err(source) => {
                return Err(SwapchainError::classify(
                    source,
                    SwapchainError::UnableToPresent,
                ))
            }
        };
        if needs_rebuild {
            self.suboptimal = false;
            self.state = SwapchainState::Stale;
        }
        Ok(())
    }

    /// Replace the swapchain with one sized for `new_extent`.
    ///
    /// Waits for every in-flight frame to retire before the old images are
    /// destroyed. A zero-area extent leaves the coordinator Stale without
    /// touching the swapchain. Fails with [SwapchainError::SurfaceLost] when
    /// the surface can no longer be presented to.
    pub fn recreate(
        &mut self,
        new_extent: vk::Extent2D,
        sync: &SyncManager,
    ) -> Result<(), SwapchainError> {
        self.requested_extent = new_extent;
        if is_zero_area(new_extent) {
            log::debug!("Surface has zero area, swapchain stays stale");
            self.state = SwapchainState::Stale;
            return Ok(());
        }
        let extent = self.choose_extent(new_extent)?;
        if is_zero_area(extent) {
            log::debug!("Surface has zero area, swapchain stays stale");
            self.state = SwapchainState::Stale;
            return Ok(());
        }

        self.state = SwapchainState::Recreating;
        let result = sync
            .wait_for_all_frames()
            .map_err(SwapchainError::from)
            .and_then(|()| self.rebuild(extent));
        self.state = match result {
            Ok(()) => SwapchainState::Valid,
            Err(_) => SwapchainState::Stale,
        };
        result
    }

    /// Destroy the image views and the swapchain.
    ///
    /// # Safety
    ///
    /// No GPU work may reference the swapchain images.
    pub unsafe fn destroy(&mut self) {
        self.destroy_image_views();
        if self.swapchain != vk::SwapchainKHR::null() {
            self.device.destroy_swapchain(self.swapchain);
            self.swapchain = vk::SwapchainKHR::null();
        }
        self.images.clear();
        self.state = SwapchainState::Stale;
    }
}

// Private API
// -----------

impl SwapchainCoordinator {
    fn choose_extent(
        &self,
        requested: vk::Extent2D,
    ) -> Result<vk::Extent2D, SwapchainError> {
        let capabilities = self.device.surface_capabilities().map_err(|err| {
            SwapchainError::classify(err, SwapchainError::UnableToQuerySurface)
        })?;
        Ok(selection::choose_swap_extent(&capabilities, requested))
    }

    /// Build a new swapchain, passing the old one along, then destroy the old
    /// swapchain and its views.
    fn rebuild(&mut self, extent: vk::Extent2D) -> Result<(), SwapchainError> {
        let query_failed = |err| {
            SwapchainError::classify(err, SwapchainError::UnableToQuerySurface)
        };
        let capabilities =
            self.device.surface_capabilities().map_err(query_failed)?;
        let formats = self.device.surface_formats().map_err(query_failed)?;
        let modes = self.device.surface_present_modes().map_err(query_failed)?;

        let format = selection::choose_surface_format(&formats)
            .ok_or(SwapchainError::NoSurfaceFormats)?;
        let present_mode =
            selection::choose_present_mode(&modes, self.preference);
        let image_count = selection::choose_image_count(&capabilities);
        let indices = self.device.swapchain_queue_family_indices();

        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(self.swapchain);
        create_info = if indices.len() > 1 {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&indices)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let swapchain = unsafe {
            self.device.create_swapchain(&create_info).map_err(|err| {
                SwapchainError::classify(
                    err,
                    SwapchainError::UnableToCreateSwapchain,
                )
            })?
        };

        // the old swapchain is retired by the create call and can go now
        unsafe { self.destroy() };
        self.swapchain = swapchain;
        self.device.set_debug_name(
            vk::ObjectType::SWAPCHAIN_KHR,
            swapchain.as_raw(),
            "Swapchain",
        );

        self.images = self
            .device
            .swapchain_images(swapchain)
            .map_err(SwapchainError::UnableToGetSwapchainImages)?;
        for (index, &image) in self.images.iter().enumerate() {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe {
                self.device
                    .create_image_view(&view_info)
                    .map_err(SwapchainError::UnableToCreateImageView)?
            };
            self.device.set_debug_name(
                vk::ObjectType::IMAGE_VIEW,
                view.as_raw(),
                &format!("Swapchain Image View {}", index),
            );
            self.image_views.push(view);
        }

        self.format = format;
        self.extent = extent;
        self.present_mode = present_mode;
        self.suboptimal = false;

        log::info!(
            "Created swapchain {}x{} with {} images ({:?}, {:?})",
            extent.width,
            extent.height,
            self.images.len(),
            format.format,
            present_mode
        );
        Ok(())
    }

    fn destroy_image_views(&mut self) {
        for view in self.image_views.drain(..) {
            unsafe { self.device.destroy_image_view(view) };
        }
    }
}

fn is_zero_area(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

impl Drop for SwapchainCoordinator {
    /// # DANGER
    ///
    /// The application must ensure that all usage of the swapchain is
    /// complete before dropping.
    fn drop(&mut self) {
        unsafe { self.destroy() }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::device::HeadlessDevice};

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn coordinator(
        device: &Arc<HeadlessDevice>,
    ) -> (SyncManager, SwapchainCoordinator) {
        let sync =
            SyncManager::new(device.clone(), 2, Duration::from_millis(20))
                .unwrap();
        let swapchain = SwapchainCoordinator::new(
            device.clone(),
            extent(800, 600),
            PresentModePreference::Mailbox,
            Duration::from_secs(1),
        )
        .unwrap();
        (sync, swapchain)
    }

    #[test]
    fn new_swapchain_is_valid_with_views_for_every_image() {
        let device = Arc::new(HeadlessDevice::builder().build());
        let (_sync, swapchain) = coordinator(&device);

        assert_eq!(swapchain.state(), SwapchainState::Valid);
        assert_eq!(swapchain.extent(), extent(800, 600));
        assert_eq!(swapchain.image_count(), 3);
        assert_eq!(swapchain.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(swapchain.format().format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(device.live_swapchains(), 1);
        assert_eq!(device.live_image_views(), 3);
    }

    #[test]
    fn extent_change_makes_acquire_stale_until_recreated() {
        let device = Arc::new(HeadlessDevice::builder().build());
        let (sync, mut swapchain) = coordinator(&device);
        device.set_surface_extent(1024, 768);

        assert!(matches!(
            swapchain.acquire_image(vk::Semaphore::null()),
            Err(SwapchainError::SwapchainStale)
        ));
        assert!(swapchain.is_stale());

        swapchain.recreate(extent(1024, 768), &sync).unwrap();

        assert_eq!(swapchain.state(), SwapchainState::Valid);
        assert_eq!(swapchain.extent(), extent(1024, 768));
        swapchain.acquire_image(vk::Semaphore::null()).unwrap();
        assert_eq!(device.live_swapchains(), 1);
        assert_eq!(device.live_image_views(), 3);
    }

    #[test]
    fn zero_area_surfaces_stay_stale() {
        let device = Arc::new(HeadlessDevice::builder().build());
        let (sync, mut swapchain) = coordinator(&device);
        device.set_surface_extent(0, 0);
        swapchain.notify_resized(extent(0, 0));
        assert!(swapchain.is_stale());

        swapchain.recreate(extent(0, 0), &sync).unwrap();
        assert!(swapchain.is_stale());
        assert!(matches!(
            swapchain.acquire_image(vk::Semaphore::null()),
            Err(SwapchainError::SwapchainStale)
        ));

        device.set_surface_extent(640, 480);
        swapchain.notify_resized(extent(640, 480));
        let surface_extent = swapchain.current_surface_extent().unwrap();
        swapchain.recreate(surface_extent, &sync).unwrap();
        assert_eq!(swapchain.state(), SwapchainState::Valid);
        assert_eq!(swapchain.extent(), extent(640, 480));
    }

    #[test]
    fn minimized_at_creation_defers_the_swapchain() {
        let device = Arc::new(
            HeadlessDevice::builder().surface_extent(0, 0).build(),
        );

        let swapchain = SwapchainCoordinator::new(
            device.clone(),
            extent(0, 0),
            PresentModePreference::Fifo,
            Duration::from_secs(1),
        )
        .unwrap();

        assert!(swapchain.is_stale());
        assert_eq!(device.live_swapchains(), 0);
    }

    #[test]
    fn recreate_waits_for_frames_in_flight() {
        let device = Arc::new(HeadlessDevice::builder().build());
        let (mut sync, mut swapchain) = coordinator(&device);
        let slot = sync.acquire_frame_slot().unwrap();
        sync.signal_on_submit(&slot, &[], 0).unwrap();
        device.set_surface_extent(320, 200);

        let result = swapchain.recreate(extent(320, 200), &sync);

        assert!(matches!(result, Err(SwapchainError::FramesInFlight(_))));
        assert!(swapchain.is_stale());
        assert_eq!(swapchain.extent(), extent(800, 600));

        device.complete_all_submissions();
        swapchain.recreate(extent(320, 200), &sync).unwrap();
        assert_eq!(swapchain.extent(), extent(320, 200));
    }

    #[test]
    fn lost_surfaces_are_fatal() {
        let device = Arc::new(HeadlessDevice::builder().build());
        let (sync, mut swapchain) = coordinator(&device);
        device.lose_surface();

        let acquire = swapchain.acquire_image(vk::Semaphore::null());
        let recreate = swapchain.recreate(extent(800, 600), &sync);

        assert!(matches!(acquire, Err(SwapchainError::SurfaceLost(_))));
        assert!(matches!(recreate, Err(SwapchainError::SurfaceLost(_))));
        assert!(recreate.unwrap_err().is_fatal());
    }

    #[test]
    fn resize_notifications_only_stale_on_change() {
        let device = Arc::new(HeadlessDevice::builder().build());
        let (_sync, mut swapchain) = coordinator(&device);

        swapchain.notify_resized(extent(800, 600));
        assert_eq!(swapchain.state(), SwapchainState::Valid);

        swapchain.notify_resized(extent(801, 600));
        assert!(swapchain.is_stale());
    }

    #[test]
    fn out_of_date_presentation_marks_the_swapchain_stale() {
        let device = Arc::new(HeadlessDevice::builder().build());
        let (_sync, mut swapchain) = coordinator(&device);
        let index = swapchain.acquire_image(vk::Semaphore::null()).unwrap();
        device.set_surface_extent(400, 300);

        swapchain.present(index, &[]).unwrap();

        assert!(swapchain.is_stale());
        assert_eq!(device.present_count(), 0);
    }

    #[test]
    fn presentation_counts_successful_presents() {
        let device = Arc::new(HeadlessDevice::builder().build());
        let (mut sync, mut swapchain) = coordinator(&device);
        let slot = sync.acquire_frame_slot().unwrap();
        let index = swapchain.acquire_image(slot.image_available()).unwrap();

        swapchain.present(index, &[slot.render_finished()]).unwrap();

        assert_eq!(swapchain.state(), SwapchainState::Valid);
        assert_eq!(device.present_count(), 1);
    }
}
