//! Shared memory backed [`Device`].
//!
//! Every allocation of a [`HostDevice`] is a `memfd`, mapped for its whole lifetime. Images use a
//! row-major layout with rows aligned to 64 bytes, whatever tiling or modifier was requested, so
//! their memory can be handed to a display server as is. Copies are executed on the submitting
//! thread, fences are signaled before [`Device::queue_submit`] returns.
//!
//! ```
//! use wsi::device::{host::HostDevice, Device, ExternalMemoryTypes};
//! use wsi::backend::allocator::{Fourcc, Modifier};
//!
//! let device = HostDevice::builder()
//!     .external_memory(ExternalMemoryTypes::DMA_BUF | ExternalMemoryTypes::SHM)
//!     .modifier(Fourcc::Argb8888, Modifier::Linear, 1)
//!     .build();
//! assert!(device.info().supports_modifiers);
//! assert_eq!(device.format_modifier_properties(Fourcc::Argb8888).len(), 1);
//! ```

use std::{
    collections::HashMap,
    os::unix::io::OwnedFd,
    ptr::{self, NonNull},
    sync::{Condvar, Mutex},
};

use rustix::{
    fs::{ftruncate, memfd_create, MemfdFlags},
    mm::{mmap, munmap, MapFlags, ProtFlags},
};
use tracing::{trace, warn};

use super::{
    BufferHandle, CommandBufferHandle, CopyRegion, Device, DeviceError, DeviceInfo, ExternalMemoryTypes,
    FenceHandle, FormatFeatures, ImageDescriptor, ImageHandle, ImageTiling, MemoryAllocation, MemoryFlags,
    MemoryHandle, MemoryRequirements, MemoryType, ModifierProperties, PlaneLayout,
};
use crate::{
    backend::allocator::{Fourcc, Modifier},
    timeout::Timeout,
    utils::align,
};

const ROW_ALIGNMENT: u64 = 64;
const PAGE_SIZE: u64 = 4096;

#[derive(Debug)]
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is only accessed while holding the objects lock, or through pointers handed
// out by `map_memory` whose synchronization is up to the caller.
unsafe impl Send for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr and len describe a mapping created by `mmap` that is not referenced anymore
        if let Err(err) = unsafe { munmap(self.ptr.as_ptr().cast(), self.len) } {
            warn!(?err, "Failed to unmap host memory");
        }
    }
}

#[derive(Debug)]
struct HostMemory {
    fd: OwnedFd,
    mapping: Mapping,
    export: ExternalMemoryTypes,
    map_count: u32,
}

#[derive(Debug)]
struct HostImage {
    modifier: Modifier,
    plane_count: u32,
    layout: PlaneLayout,
    bound: Option<(MemoryHandle, u64)>,
}

#[derive(Debug)]
struct HostBuffer {
    size: u64,
    bound: Option<(MemoryHandle, u64)>,
}

#[derive(Debug)]
struct RecordedCopy {
    queue_family: u32,
    src: ImageHandle,
    dst: BufferHandle,
    region: CopyRegion,
}

#[derive(Debug, Default)]
struct Objects {
    next_id: u64,
    images: HashMap<u64, HostImage>,
    memories: HashMap<u64, HostMemory>,
    buffers: HashMap<u64, HostBuffer>,
    commands: HashMap<u64, RecordedCopy>,
    fences: HashMap<u64, bool>,
    submissions: u64,
}

impl Objects {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn memory_ptr(
        &self,
        bound: Option<(MemoryHandle, u64)>,
        kind: &'static str,
        id: u64,
    ) -> Result<(*mut u8, usize), DeviceError> {
        let (memory, offset) = bound.ok_or(DeviceError::InvalidHandle { kind, id })?;
        let memory = self.memories.get(&memory.0).ok_or(DeviceError::InvalidHandle {
            kind: "memory",
            id: memory.0,
        })?;
        let len = memory.mapping.len.saturating_sub(offset as usize);
        // SAFETY: bind validated that offset lies inside the mapping
        Ok((unsafe { memory.mapping.ptr.as_ptr().add(offset as usize) }, len))
    }
}

fn invalid(kind: &'static str, id: u64) -> DeviceError {
    DeviceError::InvalidHandle { kind, id }
}

/// A [`Device`] allocating shared memory on the host
#[derive(Debug)]
pub struct HostDevice {
    info: DeviceInfo,
    modifiers: HashMap<Fourcc, Vec<ModifierProperties>>,
    objects: Mutex<Objects>,
    fence_signaled: Condvar,
}

/// Builder for [`HostDevice`]
#[derive(Debug, Clone)]
pub struct HostDeviceBuilder {
    external_memory: ExternalMemoryTypes,
    modifiers: HashMap<Fourcc, Vec<ModifierProperties>>,
    render_node: Option<u64>,
    queue_family_count: u32,
    max_image_dimension: u32,
}

impl Default for HostDeviceBuilder {
    fn default() -> Self {
        HostDeviceBuilder {
            external_memory: ExternalMemoryTypes::OPAQUE_FD | ExternalMemoryTypes::SHM,
            modifiers: HashMap::new(),
            render_node: None,
            queue_family_count: 1,
            max_image_dimension: 16384,
        }
    }
}

impl HostDeviceBuilder {
    /// Handle types memory can be exported as
    pub fn external_memory(mut self, types: ExternalMemoryTypes) -> Self {
        self.external_memory = types;
        self
    }

    /// Advertises `modifier` for `format` with every format feature
    pub fn modifier(self, format: Fourcc, modifier: Modifier, plane_count: u32) -> Self {
        self.modifier_with_features(format, modifier, plane_count, FormatFeatures::all())
    }

    /// Advertises `modifier` for `format` with the given features
    pub fn modifier_with_features(
        mut self,
        format: Fourcc,
        modifier: Modifier,
        plane_count: u32,
        features: FormatFeatures,
    ) -> Self {
        self.modifiers.entry(format).or_default().push(ModifierProperties {
            modifier,
            plane_count,
            features,
        });
        self
    }

    /// DRM node the device pretends to render on
    pub fn render_node(mut self, dev: u64) -> Self {
        self.render_node = Some(dev);
        self
    }

    /// Number of queue families
    pub fn queue_families(mut self, count: u32) -> Self {
        self.queue_family_count = count.max(1);
        self
    }

    /// Largest image width or height
    pub fn max_image_dimension(mut self, max: u32) -> Self {
        self.max_image_dimension = max;
        self
    }

    /// Creates the device
    pub fn build(self) -> HostDevice {
        HostDevice {
            info: DeviceInfo {
                memory_types: vec![
                    MemoryType {
                        flags: MemoryFlags::DEVICE_LOCAL | MemoryFlags::HOST_VISIBLE | MemoryFlags::HOST_COHERENT,
                    },
                    MemoryType {
                        flags: MemoryFlags::HOST_VISIBLE | MemoryFlags::HOST_COHERENT | MemoryFlags::HOST_CACHED,
                    },
                ],
                queue_family_count: self.queue_family_count,
                max_image_dimension: self.max_image_dimension,
                external_memory: self.external_memory,
                supports_modifiers: !self.modifiers.is_empty(),
                render_node: self.render_node,
            },
            modifiers: self.modifiers,
            objects: Mutex::new(Objects::default()),
            fence_signaled: Condvar::new(),
        }
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        HostDevice::builder().build()
    }
}

impl HostDevice {
    /// Creates a device with default capabilities
    pub fn new() -> HostDevice {
        HostDevice::default()
    }

    /// Creates a builder to configure capabilities
    pub fn builder() -> HostDeviceBuilder {
        HostDeviceBuilder::default()
    }

    /// Number of `queue_submit` calls so far
    pub fn submission_count(&self) -> u64 {
        self.objects.lock().unwrap().submissions
    }

    /// Number of live device objects, used to detect leaks
    pub fn live_objects(&self) -> usize {
        let objects = self.objects.lock().unwrap();
        objects.images.len()
            + objects.memories.len()
            + objects.buffers.len()
            + objects.commands.len()
            + objects.fences.len()
    }

    fn select_modifier(&self, desc: &ImageDescriptor) -> Result<(Modifier, u32), DeviceError> {
        let fourcc = desc.format.fourcc();
        match &desc.tiling {
            ImageTiling::Optimal => Ok((Modifier::Invalid, 1)),
            ImageTiling::Linear => Ok((Modifier::Linear, 1)),
            ImageTiling::Modifiers(list) => {
                let supported = self.modifiers.get(&fourcc).map(Vec::as_slice).unwrap_or(&[]);
                list.iter()
                    .find_map(|modifier| supported.iter().find(|props| props.modifier == *modifier))
                    .map(|props| (props.modifier, props.plane_count.max(1)))
                    .ok_or(DeviceError::FormatNotSupported(fourcc))
            }
        }
    }

    fn copy(&self, objects: &Objects, copy: &RecordedCopy) -> Result<(), DeviceError> {
        let image = objects
            .images
            .get(&copy.src.0)
            .ok_or_else(|| invalid("image", copy.src.0))?;
        let buffer = objects
            .buffers
            .get(&copy.dst.0)
            .ok_or_else(|| invalid("buffer", copy.dst.0))?;
        let (src, src_len) = objects.memory_ptr(image.bound, "image", copy.src.0)?;
        let (dst, dst_len) = objects.memory_ptr(buffer.bound, "buffer", copy.dst.0)?;
        let dst_len = dst_len.min(buffer.size as usize);

        let row_bytes = (copy.region.buffer_row_pitch.min(image.layout.row_pitch)) as usize;
        for row in 0..copy.region.extent.height as usize {
            let src_offset = image.layout.offset as usize + row * image.layout.row_pitch as usize;
            let dst_offset = row * copy.region.buffer_row_pitch as usize;
            if src_offset + row_bytes > src_len || dst_offset + row_bytes > dst_len {
                break;
            }
            // SAFETY: both ranges were bounds checked against their mappings, which stay alive
            // while the objects lock is held
            unsafe { ptr::copy(src.add(src_offset), dst.add(dst_offset), row_bytes) };
        }
        Ok(())
    }
}

impl Device for HostDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn format_modifier_properties(&self, format: Fourcc) -> Vec<ModifierProperties> {
        self.modifiers.get(&format).cloned().unwrap_or_default()
    }

    fn create_image(&self, desc: &ImageDescriptor) -> Result<ImageHandle, DeviceError> {
        let fourcc = desc.format.fourcc();
        if desc.extent.is_empty()
            || desc.extent.width > self.info.max_image_dimension
            || desc.extent.height > self.info.max_image_dimension
        {
            return Err(DeviceError::FormatNotSupported(fourcc));
        }
        if !self.info.external_memory.contains(desc.external) {
            return Err(DeviceError::UnsupportedHandleType(desc.external));
        }
        let (modifier, plane_count) = self.select_modifier(desc)?;
        let row_pitch = align(
            desc.extent.width as u64 * desc.format.bytes_per_pixel() as u64,
            ROW_ALIGNMENT,
        );
        let layout = PlaneLayout {
            offset: 0,
            size: row_pitch * desc.extent.height as u64,
            row_pitch,
        };

        let mut objects = self.objects.lock().unwrap();
        let id = objects.next_id();
        objects.images.insert(
            id,
            HostImage {
                modifier,
                plane_count,
                layout,
                bound: None,
            },
        );
        trace!(id, ?modifier, extent = %desc.extent, "Host image created");
        Ok(ImageHandle(id))
    }

    fn destroy_image(&self, image: ImageHandle) {
        self.objects.lock().unwrap().images.remove(&image.0);
    }

    fn image_memory_requirements(&self, image: ImageHandle) -> Result<MemoryRequirements, DeviceError> {
        let objects = self.objects.lock().unwrap();
        let image = objects
            .images
            .get(&image.0)
            .ok_or_else(|| invalid("image", image.0))?;
        Ok(MemoryRequirements {
            size: image.layout.size * image.plane_count as u64,
            alignment: PAGE_SIZE,
            memory_type_bits: 0b11,
        })
    }

    fn image_plane_layout(&self, image: ImageHandle, plane: u32) -> Result<PlaneLayout, DeviceError> {
        let objects = self.objects.lock().unwrap();
        let image = objects
            .images
            .get(&image.0)
            .ok_or_else(|| invalid("image", image.0))?;
        if plane >= image.plane_count {
            return Err(invalid("plane", plane as u64));
        }
        Ok(PlaneLayout {
            offset: image.layout.offset + plane as u64 * image.layout.size,
            ..image.layout
        })
    }

    fn image_modifier(&self, image: ImageHandle) -> Result<Modifier, DeviceError> {
        let objects = self.objects.lock().unwrap();
        objects
            .images
            .get(&image.0)
            .map(|image| image.modifier)
            .ok_or_else(|| invalid("image", image.0))
    }

    fn allocate_memory(&self, info: &MemoryAllocation) -> Result<MemoryHandle, DeviceError> {
        if info.memory_type as usize >= self.info.memory_types.len() {
            return Err(DeviceError::OutOfDeviceMemory);
        }
        if !self.info.external_memory.contains(info.export) {
            return Err(DeviceError::UnsupportedHandleType(info.export));
        }
        let len = align(info.size.max(1), PAGE_SIZE);
        let fd = memfd_create("wsi-host-memory", MemfdFlags::CLOEXEC).map_err(|err| {
            warn!(?err, "memfd_create failed");
            DeviceError::OutOfHostMemory
        })?;
        ftruncate(&fd, len).map_err(|_| DeviceError::OutOfDeviceMemory)?;
        // SAFETY: maps a fresh memfd of `len` bytes at an address chosen by the kernel
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                len as usize,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(|_| DeviceError::OutOfHostMemory)?;
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(DeviceError::OutOfHostMemory)?;

        let mut objects = self.objects.lock().unwrap();
        let id = objects.next_id();
        objects.memories.insert(
            id,
            HostMemory {
                fd,
                mapping: Mapping {
                    ptr,
                    len: len as usize,
                },
                export: info.export,
                map_count: 0,
            },
        );
        trace!(id, size = len, "Host memory allocated");
        Ok(MemoryHandle(id))
    }

    fn free_memory(&self, memory: MemoryHandle) {
        let mut objects = self.objects.lock().unwrap();
        if let Some(memory) = objects.memories.remove(&memory.0) {
            if memory.map_count > 0 {
                warn!(count = memory.map_count, "Freeing memory that is still mapped");
            }
        }
    }

    fn bind_image_memory(&self, image: ImageHandle, memory: MemoryHandle, offset: u64) -> Result<(), DeviceError> {
        let mut objects = self.objects.lock().unwrap();
        let len = objects
            .memories
            .get(&memory.0)
            .map(|memory| memory.mapping.len as u64)
            .ok_or_else(|| invalid("memory", memory.0))?;
        let image_entry = objects
            .images
            .get_mut(&image.0)
            .ok_or_else(|| invalid("image", image.0))?;
        if offset + image_entry.layout.size * image_entry.plane_count as u64 > len {
            return Err(DeviceError::OutOfDeviceMemory);
        }
        image_entry.bound = Some((memory, offset));
        Ok(())
    }

    fn map_memory(&self, memory: MemoryHandle) -> Result<NonNull<u8>, DeviceError> {
        let mut objects = self.objects.lock().unwrap();
        let memory = objects
            .memories
            .get_mut(&memory.0)
            .ok_or_else(|| invalid("memory", memory.0))?;
        memory.map_count += 1;
        Ok(memory.mapping.ptr)
    }

    fn unmap_memory(&self, memory: MemoryHandle) {
        let mut objects = self.objects.lock().unwrap();
        if let Some(memory) = objects.memories.get_mut(&memory.0) {
            memory.map_count = memory.map_count.saturating_sub(1);
        }
    }

    fn export_memory_fd(&self, memory: MemoryHandle, handle_type: ExternalMemoryTypes) -> Result<OwnedFd, DeviceError> {
        let objects = self.objects.lock().unwrap();
        let memory = objects
            .memories
            .get(&memory.0)
            .ok_or_else(|| invalid("memory", memory.0))?;
        if handle_type.bits().count_ones() != 1 || !memory.export.contains(handle_type) {
            return Err(DeviceError::UnsupportedHandleType(handle_type));
        }
        Ok(rustix::io::fcntl_dupfd_cloexec(&memory.fd, 3).map_err(std::io::Error::from)?)
    }

    fn create_buffer(&self, size: u64, external: ExternalMemoryTypes) -> Result<BufferHandle, DeviceError> {
        if !self.info.external_memory.contains(external) {
            return Err(DeviceError::UnsupportedHandleType(external));
        }
        let mut objects = self.objects.lock().unwrap();
        let id = objects.next_id();
        objects.buffers.insert(id, HostBuffer { size, bound: None });
        Ok(BufferHandle(id))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        self.objects.lock().unwrap().buffers.remove(&buffer.0);
    }

    fn buffer_memory_requirements(&self, buffer: BufferHandle) -> Result<MemoryRequirements, DeviceError> {
        let objects = self.objects.lock().unwrap();
        let buffer = objects
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| invalid("buffer", buffer.0))?;
        Ok(MemoryRequirements {
            size: buffer.size,
            alignment: PAGE_SIZE,
            memory_type_bits: 0b11,
        })
    }

    fn bind_buffer_memory(&self, buffer: BufferHandle, memory: MemoryHandle, offset: u64) -> Result<(), DeviceError> {
        let mut objects = self.objects.lock().unwrap();
        let len = objects
            .memories
            .get(&memory.0)
            .map(|memory| memory.mapping.len as u64)
            .ok_or_else(|| invalid("memory", memory.0))?;
        let buffer_entry = objects
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| invalid("buffer", buffer.0))?;
        if offset + buffer_entry.size > len {
            return Err(DeviceError::OutOfDeviceMemory);
        }
        buffer_entry.bound = Some((memory, offset));
        Ok(())
    }

    fn record_copy(
        &self,
        queue_family: u32,
        src: ImageHandle,
        dst: BufferHandle,
        region: &CopyRegion,
    ) -> Result<CommandBufferHandle, DeviceError> {
        if queue_family >= self.info.queue_family_count {
            return Err(invalid("queue family", queue_family as u64));
        }
        let mut objects = self.objects.lock().unwrap();
        if !objects.images.contains_key(&src.0) {
            return Err(invalid("image", src.0));
        }
        if !objects.buffers.contains_key(&dst.0) {
            return Err(invalid("buffer", dst.0));
        }
        let id = objects.next_id();
        objects.commands.insert(
            id,
            RecordedCopy {
                queue_family,
                src,
                dst,
                region: *region,
            },
        );
        Ok(CommandBufferHandle(id))
    }

    fn free_command_buffer(&self, commands: CommandBufferHandle) {
        self.objects.lock().unwrap().commands.remove(&commands.0);
    }

    #[profiling::function]
    fn queue_submit(
        &self,
        queue_family: u32,
        commands: &[CommandBufferHandle],
        fence: Option<FenceHandle>,
    ) -> Result<(), DeviceError> {
        let mut objects = self.objects.lock().unwrap();
        for handle in commands {
            let copy = objects
                .commands
                .get(&handle.0)
                .ok_or_else(|| invalid("command buffer", handle.0))?;
            if copy.queue_family != queue_family {
                return Err(invalid("command buffer", handle.0));
            }
            self.copy(&objects, copy)?;
        }
        objects.submissions += 1;
        if let Some(fence) = fence {
            let signaled = objects
                .fences
                .get_mut(&fence.0)
                .ok_or_else(|| invalid("fence", fence.0))?;
            *signaled = true;
            self.fence_signaled.notify_all();
        }
        Ok(())
    }

    fn create_fence(&self) -> Result<FenceHandle, DeviceError> {
        let mut objects = self.objects.lock().unwrap();
        let id = objects.next_id();
        objects.fences.insert(id, false);
        Ok(FenceHandle(id))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.objects.lock().unwrap().fences.remove(&fence.0);
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<(), DeviceError> {
        let mut objects = self.objects.lock().unwrap();
        let signaled = objects
            .fences
            .get_mut(&fence.0)
            .ok_or_else(|| invalid("fence", fence.0))?;
        *signaled = false;
        Ok(())
    }

    fn wait_for_fence(&self, fence: FenceHandle, timeout: &Timeout) -> Result<(), DeviceError> {
        let mut objects = self.objects.lock().unwrap();
        loop {
            match objects.fences.get(&fence.0) {
                Some(true) => return Ok(()),
                Some(false) => {}
                None => return Err(invalid("fence", fence.0)),
            }
            objects = timeout
                .wait(&self.fence_signaled, objects)
                .map_err(|_| DeviceError::Timeout)?;
        }
    }
}
