//! Graphics device interface.
//!
//! The presentation engine never records rendering work itself. Everything it needs from the graphics
//! device (image and memory management, exporting memory to other processes, copying images into
//! linear buffers and waiting for that copy) is described by the object safe [`Device`] trait.
//!
//! A device is immutable after creation from the point of view of this crate: [`DeviceInfo`] is read
//! once and never changes. All methods take `&self`, implementations synchronize internally.
//!
//! [`host::HostDevice`] implements this trait on top of shared memory and is used for software
//! presentation and testing.

use std::{fmt, io, os::unix::io::OwnedFd, ptr::NonNull};

use crate::{
    backend::allocator::{format::ColorFormat, Fourcc, Modifier},
    timeout::Timeout,
    utils::Extent,
    Error,
};

pub mod host;

bitflags::bitflags! {
    /// Properties of a memory type
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryFlags: u32 {
        /// Fast memory local to the device
        const DEVICE_LOCAL = 1;
        /// Memory the host can map
        const HOST_VISIBLE = 2;
        /// Host writes are visible without explicit flushes
        const HOST_COHERENT = 4;
        /// Host reads are cached
        const HOST_CACHED = 8;
    }
}

bitflags::bitflags! {
    /// Handle types memory can be exported as
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExternalMemoryTypes: u32 {
        /// Linux dma-buf file descriptor
        const DMA_BUF = 1;
        /// Opaque file descriptor only importable by the same driver
        const OPAQUE_FD = 2;
        /// Shared memory file descriptor, mappable by other processes
        const SHM = 4;
    }
}

bitflags::bitflags! {
    /// How an image is going to be used
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        /// Rendered to
        const COLOR_ATTACHMENT = 1;
        /// Source of copies
        const TRANSFER_SRC = 2;
        /// Destination of copies
        const TRANSFER_DST = 4;
        /// Sampled in shaders
        const SAMPLED = 8;
        /// Used as storage image
        const STORAGE = 16;
    }
}

bitflags::bitflags! {
    /// Features a format supports with a given modifier
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FormatFeatures: u32 {
        /// Can be rendered to
        const COLOR_ATTACHMENT = 1;
        /// Can be the source of a copy
        const TRANSFER_SRC = 2;
        /// Can be sampled
        const SAMPLED = 4;
        /// Can be scanned out or imported by a display server
        const SCANOUT = 8;
    }
}

impl FormatFeatures {
    /// Features required for images with the given usage
    pub fn required_for(usage: ImageUsage) -> FormatFeatures {
        let mut features = FormatFeatures::empty();
        if usage.contains(ImageUsage::COLOR_ATTACHMENT) {
            features |= FormatFeatures::COLOR_ATTACHMENT;
        }
        if usage.contains(ImageUsage::TRANSFER_SRC) {
            features |= FormatFeatures::TRANSFER_SRC;
        }
        if usage.contains(ImageUsage::SAMPLED) {
            features |= FormatFeatures::SAMPLED;
        }
        features
    }
}

/// A memory type of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    /// Properties of the memory type
    pub flags: MemoryFlags,
}

/// Static information about a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Memory types, indexed by the bits of [`MemoryRequirements::memory_type_bits`]
    pub memory_types: Vec<MemoryType>,
    /// Number of queue families, each one gets its own copy commands
    pub queue_family_count: u32,
    /// Largest supported width or height of a 2D image
    pub max_image_dimension: u32,
    /// Handle types memory can be exported as
    pub external_memory: ExternalMemoryTypes,
    /// Whether explicit DRM format modifiers are supported
    pub supports_modifiers: bool,
    /// `dev_t` of the DRM node the device renders on, if any
    pub render_node: Option<u64>,
}

impl DeviceInfo {
    /// Finds the first memory type allowed by `type_bits` that has all of `required`.
    pub fn find_memory_type(&self, type_bits: u32, required: MemoryFlags) -> Option<u32> {
        self.memory_types
            .iter()
            .enumerate()
            .find(|(index, ty)| type_bits & (1 << index) != 0 && ty.flags.contains(required))
            .map(|(index, _)| index as u32)
    }
}

/// Memory layout of an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageTiling {
    /// Driver chosen layout, not exportable with an explicit modifier
    Optimal,
    /// Row-major layout
    Linear,
    /// Driver picks one of the listed modifiers
    Modifiers(Vec<Modifier>),
}

/// Parameters of [`Device::create_image`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    /// Size of the image
    pub extent: Extent,
    /// Pixel format
    pub format: ColorFormat,
    /// Intended usage
    pub usage: ImageUsage,
    /// Memory layout
    pub tiling: ImageTiling,
    /// Handle types the bound memory is going to be exported as
    pub external: ExternalMemoryTypes,
    /// Hint that the image is going to be scanned out with an implicit modifier
    pub scanout: bool,
}

/// Memory requirements of an image or buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    /// Size in bytes
    pub size: u64,
    /// Required alignment of the bind offset
    pub alignment: u64,
    /// Bitmask of allowed memory types
    pub memory_type_bits: u32,
}

/// Layout of one plane of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneLayout {
    /// Offset of the plane inside the bound memory
    pub offset: u64,
    /// Size of the plane in bytes
    pub size: u64,
    /// Bytes per row
    pub row_pitch: u64,
}

/// Support of a format with one specific modifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModifierProperties {
    /// The modifier
    pub modifier: Modifier,
    /// Number of memory planes
    pub plane_count: u32,
    /// Supported features
    pub features: FormatFeatures,
}

/// Parameters of [`Device::allocate_memory`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAllocation {
    /// Size in bytes
    pub size: u64,
    /// Index into [`DeviceInfo::memory_types`]
    pub memory_type: u32,
    /// Handle types the memory can be exported as
    pub export: ExternalMemoryTypes,
    /// Image the allocation is dedicated to
    pub dedicated: Option<ImageHandle>,
}

/// Image to buffer copy recorded by [`Device::record_copy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    /// Size of the copied area
    pub extent: Extent,
    /// Row pitch of the destination buffer in bytes
    pub buffer_row_pitch: u64,
}

macro_rules! handles {
    ($($(#[$attr:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$attr])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);
        )*
    };
}

handles! {
    /// Device image
    ImageHandle,
    /// Device memory allocation
    MemoryHandle,
    /// Device buffer
    BufferHandle,
    /// Recorded command buffer
    CommandBufferHandle,
    /// Fence signaled by [`Device::queue_submit`]
    FenceHandle,
}

/// Errors reported by a [`Device`]
#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    /// Host allocation failed
    #[error("Out of host memory")]
    OutOfHostMemory,
    /// Device allocation failed
    #[error("Out of device memory")]
    OutOfDeviceMemory,
    /// The device stopped working
    #[error("The device was lost")]
    DeviceLost,
    /// Waiting for a fence timed out
    #[error("Timed out waiting for a fence")]
    Timeout,
    /// The handle type cannot be exported
    #[error("Memory cannot be exported as {0:?}")]
    UnsupportedHandleType(ExternalMemoryTypes),
    /// The format cannot be used as requested
    #[error("Format {0} is not supported with the requested tiling")]
    FormatNotSupported(Fourcc),
    /// A handle does not refer to a live object
    #[error("Invalid {kind} handle {id}")]
    InvalidHandle {
        /// Kind of object
        kind: &'static str,
        /// Raw handle value
        id: u64,
    },
    /// An os call failed
    #[error("Os error: {0}")]
    Io(#[from] io::Error),
}

impl From<DeviceError> for Error {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::OutOfHostMemory => Error::OutOfHostMemory,
            DeviceError::UnsupportedHandleType(_) | DeviceError::FormatNotSupported(_) => {
                Error::OutOfHostMemory
            }
            DeviceError::OutOfDeviceMemory => Error::OutOfDeviceMemory,
            DeviceError::DeviceLost => Error::DeviceLost,
            DeviceError::Timeout => Error::Timeout,
            DeviceError::InvalidHandle { .. } => Error::Unknown,
            DeviceError::Io(err) => Error::from_io(&err, Error::OutOfHostMemory),
        }
    }
}

/// Capability table of a graphics device
pub trait Device: Send + Sync + fmt::Debug {
    /// Static device information
    fn info(&self) -> &DeviceInfo;

    /// Modifiers supported for `format`, empty if modifiers are not supported at all
    fn format_modifier_properties(&self, format: Fourcc) -> Vec<ModifierProperties>;

    /// Creates an image without memory bound to it
    fn create_image(&self, desc: &ImageDescriptor) -> Result<ImageHandle, DeviceError>;
    /// Destroys an image
    fn destroy_image(&self, image: ImageHandle);
    /// Memory requirements of an image
    fn image_memory_requirements(&self, image: ImageHandle) -> Result<MemoryRequirements, DeviceError>;
    /// Layout of a memory plane of a linear or modifier-tiled image
    fn image_plane_layout(&self, image: ImageHandle, plane: u32) -> Result<PlaneLayout, DeviceError>;
    /// Modifier the driver selected for an image created with [`ImageTiling::Modifiers`]
    fn image_modifier(&self, image: ImageHandle) -> Result<Modifier, DeviceError>;

    /// Allocates device memory
    fn allocate_memory(&self, info: &MemoryAllocation) -> Result<MemoryHandle, DeviceError>;
    /// Frees device memory
    fn free_memory(&self, memory: MemoryHandle);
    /// Binds memory to an image
    fn bind_image_memory(
        &self,
        image: ImageHandle,
        memory: MemoryHandle,
        offset: u64,
    ) -> Result<(), DeviceError>;
    /// Maps host visible memory
    fn map_memory(&self, memory: MemoryHandle) -> Result<NonNull<u8>, DeviceError>;
    /// Unmaps memory mapped with [`Device::map_memory`]
    fn unmap_memory(&self, memory: MemoryHandle);
    /// Exports memory as a new file descriptor of the given handle type
    fn export_memory_fd(
        &self,
        memory: MemoryHandle,
        handle_type: ExternalMemoryTypes,
    ) -> Result<OwnedFd, DeviceError>;

    /// Creates a buffer without memory bound to it
    fn create_buffer(&self, size: u64, external: ExternalMemoryTypes) -> Result<BufferHandle, DeviceError>;
    /// Destroys a buffer
    fn destroy_buffer(&self, buffer: BufferHandle);
    /// Memory requirements of a buffer
    fn buffer_memory_requirements(&self, buffer: BufferHandle) -> Result<MemoryRequirements, DeviceError>;
    /// Binds memory to a buffer
    fn bind_buffer_memory(
        &self,
        buffer: BufferHandle,
        memory: MemoryHandle,
        offset: u64,
    ) -> Result<(), DeviceError>;

    /// Records a copy of `src` into `dst` for submission on `queue_family`
    fn record_copy(
        &self,
        queue_family: u32,
        src: ImageHandle,
        dst: BufferHandle,
        region: &CopyRegion,
    ) -> Result<CommandBufferHandle, DeviceError>;
    /// Frees a recorded command buffer
    fn free_command_buffer(&self, commands: CommandBufferHandle);
    /// Submits recorded commands, signaling `fence` once they completed
    fn queue_submit(
        &self,
        queue_family: u32,
        commands: &[CommandBufferHandle],
        fence: Option<FenceHandle>,
    ) -> Result<(), DeviceError>;

    /// Creates an unsignaled fence
    fn create_fence(&self) -> Result<FenceHandle, DeviceError>;
    /// Destroys a fence
    fn destroy_fence(&self, fence: FenceHandle);
    /// Resets a fence to the unsignaled state
    fn reset_fence(&self, fence: FenceHandle) -> Result<(), DeviceError>;
    /// Waits for a fence to be signaled
    fn wait_for_fence(&self, fence: FenceHandle, timeout: &Timeout) -> Result<(), DeviceError>;
}
