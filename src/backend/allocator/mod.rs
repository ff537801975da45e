//! Allocation of presentable images.
//!
//! Swapchain images are allocated through the [`Device`] of the swapchain and exported in a form the
//! display consumer can import. Three strategies exist:
//!
//! - [`create_native_image`]: the image lives in exportable device-local memory and is handed out as
//!   a [`Dmabuf`]. An explicit modifier is negotiated if the consumer offered candidate lists.
//! - [`create_prime_image`]: the consumer cannot import the device's memory (a different GPU, or
//!   no modifier support on one side). The image is rendered in its optimal layout and copied into a
//!   linear, exportable buffer before every present.
//! - [`create_shm_image`]: a linear image in host memory exported as shared memory file, for
//!   MIT-SHM and `wl_shm`. [`create_host_image`] is the same without export, for consumers that copy
//!   the pixels on the presenting thread.
//!
//! Allocation never silently falls back to a different strategy: if the device and the consumer share
//! no handle type, or no requested modifier is supported, [`Error::OutOfHostMemory`] is returned.
//! Every resource created before a failure is released again.
//!
//! Buffer types:
//! - [Dmabufs](dmabuf::Dmabuf)
//! - [Shared memory buffers](shm::ShmBuffer)
//! - [`WsiImage`], owning the device objects of one swapchain image

pub mod dmabuf;
pub mod format;
mod modifier;
pub mod shm;

use std::{fmt, ptr::NonNull, sync::Arc};

use scopeguard::ScopeGuard;
use smallvec::SmallVec;
use tracing::{debug, instrument, warn};

pub use drm_fourcc::{
    DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier, DrmVendor as Vendor,
    UnrecognizedFourcc, UnrecognizedVendor,
};
pub use modifier::{negotiate_modifiers, usable_modifiers};

use self::{
    dmabuf::{Dmabuf, MAX_PLANES},
    format::ColorFormat,
    shm::ShmBuffer,
};
use crate::{
    device::{
        BufferHandle, CommandBufferHandle, CopyRegion, Device, ExternalMemoryTypes, FenceHandle,
        FormatFeatures, ImageDescriptor, ImageHandle, ImageTiling, ImageUsage, MemoryAllocation, MemoryFlags,
        MemoryHandle, PlaneLayout,
    },
    timeout::Timeout,
    utils::{align, Extent},
    Error,
};

/// Row alignment of linear buffers written by the prime blit
pub const PRIME_ROW_ALIGNMENT: u64 = 256;

/// Common trait describing common properties of most types of buffers.
pub trait Buffer {
    /// Width of the two-dimensional buffer
    fn width(&self) -> u32;
    /// Height of the two-dimensional buffer
    fn height(&self) -> u32;
    /// Size (w x h) of the two-dimensional buffer
    fn size(&self) -> (u32, u32) {
        (self.width(), self.height())
    }
    /// Pixel format of the buffer
    fn format(&self) -> Format;
}

/// Parameters of a swapchain image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageParams {
    /// Size of the image
    pub extent: Extent,
    /// Pixel format
    pub format: ColorFormat,
    /// Usage requested by the application
    pub usage: ImageUsage,
    /// Candidate modifier lists in order of preference, empty for implicit modifiers
    pub modifiers: Vec<Vec<Modifier>>,
    /// Handle types the consumer can import
    pub handle_types: ExternalMemoryTypes,
}

impl ImageParams {
    /// Parameters for an image with implicit modifier, importable as dmabuf
    pub fn new(extent: Extent, format: ColorFormat, usage: ImageUsage) -> ImageParams {
        ImageParams {
            extent,
            format,
            usage,
            modifiers: Vec::new(),
            handle_types: ExternalMemoryTypes::DMA_BUF,
        }
    }

    /// Sets the candidate modifier lists
    pub fn with_modifiers(mut self, modifiers: Vec<Vec<Modifier>>) -> ImageParams {
        self.modifiers = modifiers;
        self
    }

    /// Sets the handle types the consumer can import
    pub fn with_handle_types(mut self, handle_types: ExternalMemoryTypes) -> ImageParams {
        self.handle_types = handle_types;
        self
    }

    fn wants_modifiers(&self) -> bool {
        self.modifiers.iter().any(|list| !list.is_empty())
    }
}

/// Handles a swapchain image was exported as
#[derive(Debug, Clone)]
pub enum ImageExport {
    /// Not exported, the pixels are copied out of the mapped image
    None,
    /// Exported as dmabuf, one fd per plane
    Dmabuf(Dmabuf),
    /// Exported as shared memory file
    Shm(ShmBuffer),
}

#[derive(Debug)]
struct PrimeBuffer {
    buffer: BufferHandle,
    memory: MemoryHandle,
    blits: Vec<CommandBufferHandle>,
    fence: Option<FenceHandle>,
}

/// One swapchain image and every device object belonging to it
pub struct WsiImage {
    device: Arc<dyn Device>,
    image: ImageHandle,
    memory: MemoryHandle,
    memory_flags: MemoryFlags,
    extent: Extent,
    format: ColorFormat,
    modifier: Modifier,
    planes: SmallVec<[PlaneLayout; MAX_PLANES]>,
    prime: Option<PrimeBuffer>,
    export: ImageExport,
}

impl fmt::Debug for WsiImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsiImage")
            .field("image", &self.image)
            .field("extent", &self.extent)
            .field("format", &self.format)
            .field("modifier", &self.modifier)
            .field("planes", &self.planes)
            .field("prime", &self.prime.is_some())
            .field("export", &self.export)
            .finish()
    }
}

impl Buffer for WsiImage {
    fn width(&self) -> u32 {
        self.extent.width
    }

    fn height(&self) -> u32 {
        self.extent.height
    }

    fn format(&self) -> Format {
        Format {
            code: self.format.fourcc(),
            modifier: self.modifier,
        }
    }
}

impl WsiImage {
    /// Device image the application renders to
    pub fn image_handle(&self) -> ImageHandle {
        self.image
    }

    /// Memory bound to the image
    pub fn memory_handle(&self) -> MemoryHandle {
        self.memory
    }

    /// Size of the image
    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// Color format of the image
    pub fn color_format(&self) -> ColorFormat {
        self.format
    }

    /// Modifier of the presented buffer
    pub fn modifier(&self) -> Modifier {
        self.modifier
    }

    /// Memory layout of the presented buffer
    pub fn planes(&self) -> &[PlaneLayout] {
        &self.planes
    }

    /// Exported handles of the presented buffer
    pub fn export(&self) -> &ImageExport {
        &self.export
    }

    /// The dmabuf, if exported as one
    pub fn dmabuf(&self) -> Option<&Dmabuf> {
        match &self.export {
            ImageExport::Dmabuf(dmabuf) => Some(dmabuf),
            _ => None,
        }
    }

    /// The shared memory buffer, if exported as one
    pub fn shm(&self) -> Option<&ShmBuffer> {
        match &self.export {
            ImageExport::Shm(shm) => Some(shm),
            _ => None,
        }
    }

    /// Returns true if the image is copied into a linear buffer before presentation
    pub fn is_prime(&self) -> bool {
        self.prime.is_some()
    }

    /// Copies the rendered image into the presented linear buffer and waits for the copy.
    ///
    /// Does nothing for images that are presented directly.
    #[profiling::function]
    pub fn blit(&self, queue_family: u32) -> Result<(), Error> {
        let Some(prime) = &self.prime else {
            return Ok(());
        };
        let commands = *prime.blits.get(queue_family as usize).ok_or_else(|| {
            warn!(queue_family, "Present from unknown queue family");
            Error::Unknown
        })?;
        let fence = prime.fence.ok_or(Error::Unknown)?;
        self.device.reset_fence(fence)?;
        self.device.queue_submit(queue_family, &[commands], Some(fence))?;
        self.device.wait_for_fence(fence, &Timeout::Infinite)?;
        Ok(())
    }

    /// Maps the presented pixels for reading.
    ///
    /// Only possible for host visible memory, which is the case for prime, shm and host images.
    pub fn map(&self) -> Result<MappedImage<'_>, Error> {
        let (memory, flags) = match &self.prime {
            Some(prime) => (prime.memory, MemoryFlags::HOST_VISIBLE),
            None => (self.memory, self.memory_flags),
        };
        if !flags.contains(MemoryFlags::HOST_VISIBLE) {
            return Err(Error::FeatureNotPresent);
        }
        let layout = self.planes.first().copied().ok_or(Error::Unknown)?;
        let ptr = self.device.map_memory(memory)?;
        Ok(MappedImage {
            image: self,
            memory,
            ptr,
            layout,
        })
    }
}

impl Drop for WsiImage {
    fn drop(&mut self) {
        if let Some(prime) = self.prime.take() {
            for commands in prime.blits {
                self.device.free_command_buffer(commands);
            }
            if let Some(fence) = prime.fence {
                self.device.destroy_fence(fence);
            }
            self.device.destroy_buffer(prime.buffer);
            self.device.free_memory(prime.memory);
        }
        self.device.destroy_image(self.image);
        self.device.free_memory(self.memory);
    }
}

/// Host mapping of the pixels of a [`WsiImage`], unmapped on drop
pub struct MappedImage<'a> {
    image: &'a WsiImage,
    memory: MemoryHandle,
    ptr: NonNull<u8>,
    layout: PlaneLayout,
}

impl fmt::Debug for MappedImage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedImage")
            .field("memory", &self.memory)
            .field("layout", &self.layout)
            .finish()
    }
}

impl MappedImage<'_> {
    /// Bytes per row
    pub fn row_pitch(&self) -> usize {
        self.layout.row_pitch as usize
    }

    /// Size of the image
    pub fn extent(&self) -> Extent {
        self.image.extent
    }

    /// Color format of the pixels
    pub fn color_format(&self) -> ColorFormat {
        self.image.format
    }

    /// All rows of the image, including row padding
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the layout was reported by the device for the mapped memory, which stays mapped
        // until self is dropped
        unsafe {
            std::slice::from_raw_parts(
                self.ptr.as_ptr().add(self.layout.offset as usize),
                self.layout.size as usize,
            )
        }
    }

    /// Mutable view of all rows, for writing into host images
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: see as_bytes, the exclusive borrow of self prevents aliasing through this mapping
        unsafe {
            std::slice::from_raw_parts_mut(
                self.ptr.as_ptr().add(self.layout.offset as usize),
                self.layout.size as usize,
            )
        }
    }

    /// One row of pixels without padding
    ///
    /// # Panics
    ///
    /// Panics if `y` is not below the height of the image.
    pub fn row(&self, y: u32) -> &[u8] {
        assert!(
            y < self.image.extent.height,
            "row {} out of bounds of a {} image",
            y,
            self.image.extent
        );
        let start = y as usize * self.row_pitch();
        let len = self.image.extent.width as usize * self.image.format.bytes_per_pixel() as usize;
        &self.as_bytes()[start..start + len]
    }
}

impl Drop for MappedImage<'_> {
    fn drop(&mut self) {
        self.image.device.unmap_memory(self.memory);
    }
}

fn select_handle_type(
    device: &dyn Device,
    wanted: ExternalMemoryTypes,
) -> Result<ExternalMemoryTypes, Error> {
    let common = device.info().external_memory & wanted;
    [
        ExternalMemoryTypes::DMA_BUF,
        ExternalMemoryTypes::OPAQUE_FD,
        ExternalMemoryTypes::SHM,
    ]
    .into_iter()
    .find(|ty| common.contains(*ty))
    .ok_or_else(|| {
        warn!(supported = ?device.info().external_memory, ?wanted, "No common external memory handle type");
        Error::OutOfHostMemory
    })
}

/// Creates the device image and binds fresh memory to it.
///
/// The returned image owns both objects, so every later failure releases them by dropping it.
fn allocate_image(
    device: &Arc<dyn Device>,
    desc: &ImageDescriptor,
    required: MemoryFlags,
    export: ExternalMemoryTypes,
) -> Result<WsiImage, Error> {
    let image = scopeguard::guard(device.create_image(desc)?, |image| device.destroy_image(image));
    let reqs = device.image_memory_requirements(*image)?;
    let memory_type = device
        .info()
        .find_memory_type(reqs.memory_type_bits, required)
        .ok_or(Error::OutOfDeviceMemory)?;
    let memory = device.allocate_memory(&MemoryAllocation {
        size: reqs.size,
        memory_type,
        export,
        dedicated: Some(*image),
    })?;
    let memory_flags = device.info().memory_types[memory_type as usize].flags;

    let image = WsiImage {
        device: device.clone(),
        image: ScopeGuard::into_inner(image),
        memory,
        memory_flags,
        extent: desc.extent,
        format: desc.format,
        modifier: Modifier::Invalid,
        planes: SmallVec::new(),
        prime: None,
        export: ImageExport::None,
    };
    device.bind_image_memory(image.image, image.memory, 0)?;
    Ok(image)
}

fn dmabuf_from_planes(
    device: &dyn Device,
    memory: MemoryHandle,
    handle_type: ExternalMemoryTypes,
    extent: Extent,
    format: ColorFormat,
    modifier: Modifier,
    planes: &[PlaneLayout],
) -> Result<Dmabuf, Error> {
    let fd = device.export_memory_fd(memory, handle_type)?;
    let mut builder = Dmabuf::builder(extent, format.fourcc(), modifier);
    for (idx, plane) in planes.iter().enumerate() {
        // every plane lives in the same allocation
        let plane_fd = fd
            .try_clone()
            .map_err(|err| Error::from_io(&err, Error::OutOfHostMemory))?;
        if !builder.add_plane(plane_fd, idx as u32, plane.offset as u32, plane.row_pitch as u32) {
            return Err(Error::OutOfHostMemory);
        }
    }
    builder.build().ok_or(Error::OutOfHostMemory)
}

/// Allocates an image in exportable device-local memory and exports it as [`Dmabuf`].
#[instrument(level = "debug", skip(device), fields(extent = %params.extent, format = ?params.format))]
pub fn create_native_image(device: &Arc<dyn Device>, params: &ImageParams) -> Result<WsiImage, Error> {
    let handle_type = select_handle_type(&**device, params.handle_types & ExternalMemoryTypes::DMA_BUF)?;

    let (tiling, plane_counts) = if params.wants_modifiers() {
        let properties = device.format_modifier_properties(params.format.fourcc());
        let usable = usable_modifiers(&properties, FormatFeatures::required_for(params.usage))
            .map(|props| (props.modifier, props.plane_count))
            .collect::<Vec<_>>();
        let supported = usable.iter().map(|(modifier, _)| *modifier).collect::<Vec<_>>();
        let Some(modifiers) = negotiate_modifiers(&params.modifiers, &supported) else {
            warn!(
                candidates = ?params.modifiers,
                ?supported,
                "None of the requested modifiers is supported"
            );
            return Err(Error::OutOfHostMemory);
        };
        (ImageTiling::Modifiers(modifiers), usable)
    } else {
        (ImageTiling::Optimal, Vec::new())
    };
    let explicit = matches!(tiling, ImageTiling::Modifiers(_));

    let desc = ImageDescriptor {
        extent: params.extent,
        format: params.format,
        usage: params.usage,
        scanout: !explicit,
        tiling,
        external: handle_type,
    };
    let mut image = allocate_image(device, &desc, MemoryFlags::DEVICE_LOCAL, handle_type)?;

    let plane_count = if explicit {
        image.modifier = device.image_modifier(image.image)?;
        plane_counts
            .iter()
            .find(|(modifier, _)| *modifier == image.modifier)
            .map(|(_, count)| *count)
            .unwrap_or(1)
    } else {
        1
    };
    image.planes = (0..plane_count)
        .map(|plane| device.image_plane_layout(image.image, plane))
        .collect::<Result<_, _>>()?;

    let dmabuf = dmabuf_from_planes(
        &**device,
        image.memory,
        handle_type,
        image.extent,
        image.format,
        image.modifier,
        &image.planes,
    )?;
    image.export = ImageExport::Dmabuf(dmabuf);
    debug!(modifier = ?image.modifier, planes = image.planes.len(), "Native image allocated");
    Ok(image)
}

/// Allocates an optimal render image plus a linear, exportable copy target.
///
/// One copy command buffer is recorded per queue family of the device, see [`WsiImage::blit`].
#[instrument(level = "debug", skip(device), fields(extent = %params.extent, format = ?params.format))]
pub fn create_prime_image(device: &Arc<dyn Device>, params: &ImageParams) -> Result<WsiImage, Error> {
    let handle_type = select_handle_type(&**device, params.handle_types & ExternalMemoryTypes::DMA_BUF)?;

    let desc = ImageDescriptor {
        extent: params.extent,
        format: params.format,
        usage: params.usage | ImageUsage::TRANSFER_SRC,
        tiling: ImageTiling::Optimal,
        external: ExternalMemoryTypes::empty(),
        scanout: false,
    };
    let mut image = allocate_image(device, &desc, MemoryFlags::DEVICE_LOCAL, ExternalMemoryTypes::empty())?;

    let row_pitch = align(
        params.extent.width as u64 * params.format.bytes_per_pixel() as u64,
        PRIME_ROW_ALIGNMENT,
    );
    let size = row_pitch * params.extent.height as u64;

    let buffer = scopeguard::guard(device.create_buffer(size, handle_type)?, |buffer| {
        device.destroy_buffer(buffer)
    });
    let reqs = device.buffer_memory_requirements(*buffer)?;
    let memory_type = device
        .info()
        .find_memory_type(reqs.memory_type_bits, MemoryFlags::HOST_VISIBLE)
        .ok_or(Error::OutOfDeviceMemory)?;
    let memory = device.allocate_memory(&MemoryAllocation {
        size: reqs.size,
        memory_type,
        export: handle_type,
        dedicated: None,
    })?;
    let prime = image.prime.insert(PrimeBuffer {
        buffer: ScopeGuard::into_inner(buffer),
        memory,
        blits: Vec::new(),
        fence: None,
    });
    device.bind_buffer_memory(prime.buffer, prime.memory, 0)?;

    let region = CopyRegion {
        extent: params.extent,
        buffer_row_pitch: row_pitch,
    };
    for queue_family in 0..device.info().queue_family_count {
        let commands = device.record_copy(queue_family, image.image, prime.buffer, &region)?;
        prime.blits.push(commands);
    }
    prime.fence = Some(device.create_fence()?);
    let prime_memory = prime.memory;

    image.modifier = Modifier::Linear;
    image.planes = SmallVec::from_slice(&[PlaneLayout {
        offset: 0,
        size,
        row_pitch,
    }]);
    let dmabuf = dmabuf_from_planes(
        &**device,
        prime_memory,
        handle_type,
        image.extent,
        image.format,
        Modifier::Linear,
        &image.planes,
    )?;
    image.export = ImageExport::Dmabuf(dmabuf);
    debug!(row_pitch, "Prime image allocated");
    Ok(image)
}

/// Allocates a linear host visible image exported as shared memory file.
#[instrument(level = "debug", skip(device), fields(extent = %params.extent, format = ?params.format))]
pub fn create_shm_image(device: &Arc<dyn Device>, params: &ImageParams) -> Result<WsiImage, Error> {
    let handle_type = select_handle_type(&**device, ExternalMemoryTypes::SHM)?;
    let mut image = allocate_host_visible(device, params, handle_type)?;
    let layout = image.planes[0];

    let fd = device.export_memory_fd(image.memory, handle_type)?;
    let pool_size = device.image_memory_requirements(image.image)?.size;
    image.export = ImageExport::Shm(ShmBuffer::new(
        fd,
        image.extent,
        image.format,
        layout.offset,
        layout.row_pitch as u32,
        pool_size,
    ));
    Ok(image)
}

/// Allocates a linear host visible image that is not exported.
#[instrument(level = "debug", skip(device), fields(extent = %params.extent, format = ?params.format))]
pub fn create_host_image(device: &Arc<dyn Device>, params: &ImageParams) -> Result<WsiImage, Error> {
    allocate_host_visible(device, params, ExternalMemoryTypes::empty())
}

fn allocate_host_visible(
    device: &Arc<dyn Device>,
    params: &ImageParams,
    export: ExternalMemoryTypes,
) -> Result<WsiImage, Error> {
    let desc = ImageDescriptor {
        extent: params.extent,
        format: params.format,
        usage: params.usage,
        tiling: ImageTiling::Linear,
        external: export,
        scanout: false,
    };
    let mut image = allocate_image(device, &desc, MemoryFlags::HOST_VISIBLE, export)?;
    image.modifier = Modifier::Linear;
    image.planes = SmallVec::from_slice(&[device.image_plane_layout(image.image, 0)?]);
    Ok(image)
}
