use std::{
    fs::OpenOptions,
    io,
    os::unix::{
        fs::OpenOptionsExt,
        io::{AsFd, BorrowedFd, OwnedFd},
    },
    path::{Path, PathBuf},
    time::Duration,
};

use drm::{
    buffer::{self, PlanarBuffer},
    control::{
        self, connector, crtc, encoder, framebuffer, property, Device as ControlDevice, Event, FbCmd2Flags,
        PageFlipFlags,
    },
    Device as BasicDevice, VblankWaitFlags, VblankWaitTarget,
};
use rustix::{
    event::{poll, PollFd, PollFlags},
    io::Errno,
};
use tracing::{trace, warn};

use super::{
    kms::{
        ConnectorId, ConnectorInfo, ConnectorState, CrtcId, CrtcInfo, EncoderId, EncoderInfo, FramebufferId,
        KmsDevice, KmsEvent, ModeInfo, PropertyId, Resources,
    },
    AccessError, DisplayError,
};
use crate::{
    backend::allocator::{dmabuf::Dmabuf, Buffer, Fourcc, Modifier},
    utils::{DevPath, DeviceFd},
};

/// An open DRM card node
#[derive(Debug, Clone)]
pub struct DrmCard {
    fd: DeviceFd,
    dev_path: Option<PathBuf>,
}

impl AsFd for DrmCard {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl BasicDevice for DrmCard {}
impl ControlDevice for DrmCard {}

impl DrmCard {
    /// Wraps an already opened card node
    pub fn new(fd: DeviceFd) -> DrmCard {
        let dev_path = fd.dev_path();
        DrmCard { fd, dev_path }
    }

    /// Opens the card node at `path`
    pub fn open(path: impl AsRef<Path>) -> io::Result<DrmCard> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path.as_ref())?;
        Ok(DrmCard {
            fd: DeviceFd::from(OwnedFd::from(file)),
            dev_path: Some(path.as_ref().to_path_buf()),
        })
    }

    fn access(&self, errmsg: &'static str) -> impl FnOnce(io::Error) -> DisplayError + '_ {
        move |source| {
            DisplayError::Access(AccessError {
                errmsg,
                dev: self.dev_path.clone(),
                source,
            })
        }
    }

    fn pipe(&self, crtc: crtc::Handle) -> Result<u32, DisplayError> {
        let resources = self
            .resource_handles()
            .map_err(self.access("Error loading resource handles"))?;
        resources
            .crtcs()
            .iter()
            .position(|handle| *handle == crtc)
            .map(|pipe| pipe as u32)
            .ok_or_else(|| self.access("Unknown crtc")(Errno::NOENT.into()))
    }
}

fn handle<H: control::ResourceHandle>(raw: u32) -> Result<H, DisplayError> {
    control::from_u32(raw).ok_or_else(|| {
        DisplayError::Access(AccessError {
            errmsg: "Invalid object id",
            dev: None,
            source: Errno::INVAL.into(),
        })
    })
}

fn mode_info(mode: control::Mode) -> ModeInfo {
    let raw: drm_ffi::drm_mode_modeinfo = mode.into();
    ModeInfo {
        clock: raw.clock,
        hdisplay: raw.hdisplay,
        hsync_start: raw.hsync_start,
        hsync_end: raw.hsync_end,
        htotal: raw.htotal,
        hskew: raw.hskew,
        vdisplay: raw.vdisplay,
        vsync_start: raw.vsync_start,
        vsync_end: raw.vsync_end,
        vtotal: raw.vtotal,
        vscan: raw.vscan,
        vrefresh: raw.vrefresh,
        flags: raw.flags,
        mode_type: raw.type_,
        name: mode.name().to_string_lossy().into_owned(),
    }
}

fn drm_mode(info: &ModeInfo) -> control::Mode {
    let mut name = [0; 32];
    for (dst, src) in name.iter_mut().zip(info.name.bytes().take(31)) {
        *dst = src as _;
    }
    control::Mode::from(drm_ffi::drm_mode_modeinfo {
        clock: info.clock,
        hdisplay: info.hdisplay,
        hsync_start: info.hsync_start,
        hsync_end: info.hsync_end,
        htotal: info.htotal,
        hskew: info.hskew,
        vdisplay: info.vdisplay,
        vsync_start: info.vsync_start,
        vsync_end: info.vsync_end,
        vtotal: info.vtotal,
        vscan: info.vscan,
        vrefresh: info.vrefresh,
        flags: info.flags,
        type_: info.mode_type,
        name,
    })
}

/// Planes of a dmabuf imported as gem handles
struct DmabufPlanes {
    size: (u32, u32),
    format: Fourcc,
    modifier: Modifier,
    handles: [Option<buffer::Handle>; 4],
    pitches: [u32; 4],
    offsets: [u32; 4],
}

impl PlanarBuffer for DmabufPlanes {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn format(&self) -> Fourcc {
        self.format
    }

    fn modifier(&self) -> Option<Modifier> {
        match self.modifier {
            Modifier::Invalid => None,
            modifier => Some(modifier),
        }
    }

    fn pitches(&self) -> [u32; 4] {
        self.pitches
    }

    fn handles(&self) -> [Option<buffer::Handle>; 4] {
        self.handles
    }

    fn offsets(&self) -> [u32; 4] {
        self.offsets
    }
}

impl KmsDevice for DrmCard {
    fn is_master(&self) -> bool {
        // only the master may authenticate, any other error means we got past the permission check
        match drm_ffi::auth::auth_magic_token(self.as_fd(), 0) {
            Err(err) => Errno::from_io_error(&err) != Some(Errno::ACCESS),
            Ok(_) => true,
        }
    }

    fn dev_id(&self) -> Option<u64> {
        self.fd.dev_id().ok()
    }

    fn resources(&self) -> Result<Resources, DisplayError> {
        let res = self
            .resource_handles()
            .map_err(self.access("Error loading resource handles"))?;
        Ok(Resources {
            connectors: res.connectors().iter().map(|h| ConnectorId(u32::from(*h))).collect(),
            encoders: res.encoders().iter().map(|h| EncoderId(u32::from(*h))).collect(),
            crtcs: res.crtcs().iter().map(|h| CrtcId(u32::from(*h))).collect(),
        })
    }

    fn connector(&self, id: ConnectorId, rescan: bool) -> Result<ConnectorInfo, DisplayError> {
        let conn: connector::Handle = handle(id.0)?;
        let info = self
            .get_connector(conn, rescan)
            .map_err(self.access("Error loading connector info"))?;

        let mut dpms_property = None;
        let props = self
            .get_properties(conn)
            .map_err(self.access("Error loading connector properties"))?;
        let (ids, _) = props.as_props_and_values();
        for id in ids {
            let Ok(prop) = self.get_property(*id) else {
                continue;
            };
            if prop.name().to_str().map(|name| name == "DPMS").unwrap_or(false) {
                dpms_property = Some(PropertyId(u32::from(*id)));
                break;
            }
        }

        Ok(ConnectorInfo {
            id,
            name: format!("{:?}-{}", info.interface(), info.interface_id()),
            state: match info.state() {
                connector::State::Connected => ConnectorState::Connected,
                connector::State::Disconnected => ConnectorState::Disconnected,
                _ => ConnectorState::Unknown,
            },
            encoder: info.current_encoder().map(|h| EncoderId(u32::from(h))),
            modes: info.modes().iter().copied().map(mode_info).collect(),
            dpms_property,
        })
    }

    fn encoder(&self, id: EncoderId) -> Result<EncoderInfo, DisplayError> {
        let enc: encoder::Handle = handle(id.0)?;
        let info = self
            .get_encoder(enc)
            .map_err(self.access("Error loading encoder info"))?;
        Ok(EncoderInfo {
            id,
            crtc: info.crtc().map(|h| CrtcId(u32::from(h))),
        })
    }

    fn crtc(&self, id: CrtcId) -> Result<CrtcInfo, DisplayError> {
        let crtc: crtc::Handle = handle(id.0)?;
        let info = self.get_crtc(crtc).map_err(self.access("Error loading crtc info"))?;
        Ok(CrtcInfo {
            id,
            framebuffer: info.framebuffer().map(|h| FramebufferId(u32::from(h))),
        })
    }

    fn add_framebuffer(&self, dmabuf: &Dmabuf, format: Fourcc) -> Result<FramebufferId, DisplayError> {
        let mut handles = [None; 4];
        for (idx, fd) in dmabuf.handles().enumerate().take(4) {
            let handle = self
                .prime_fd_to_buffer(fd)
                .map_err(self.access("Failed to import dmabuf"))?;
            handles[idx] = Some(handle);
        }
        let close = scopeguard::guard(handles, |handles| {
            let mut closed: Vec<buffer::Handle> = Vec::new();
            for handle in handles.into_iter().flatten() {
                if !closed.contains(&handle) {
                    let _ = self.close_buffer(handle);
                    closed.push(handle);
                }
            }
        });

        let mut pitches = [0; 4];
        let mut offsets = [0; 4];
        for (idx, (pitch, offset)) in dmabuf.strides().zip(dmabuf.offsets()).enumerate().take(4) {
            pitches[idx] = pitch;
            offsets[idx] = offset;
        }
        let planes = DmabufPlanes {
            size: dmabuf.size(),
            format,
            modifier: dmabuf.modifier(),
            handles: *close,
            pitches,
            offsets,
        };
        let flags = if dmabuf.has_modifier() {
            FbCmd2Flags::MODIFIERS
        } else {
            FbCmd2Flags::empty()
        };

        let fb = self
            .add_planar_framebuffer(&planes, flags)
            .map_err(self.access("Failed to create framebuffer"))?;
        trace!(?fb, ?format, "Framebuffer created");
        Ok(FramebufferId(u32::from(fb)))
    }

    fn remove_framebuffer(&self, framebuffer: FramebufferId) -> Result<(), DisplayError> {
        let fb: framebuffer::Handle = handle(framebuffer.0)?;
        self.destroy_framebuffer(fb)
            .map_err(self.access("Failed to destroy framebuffer"))
    }

    fn page_flip(&self, crtc: CrtcId, framebuffer: FramebufferId) -> Result<(), DisplayError> {
        ControlDevice::page_flip(self, handle(crtc.0)?, handle(framebuffer.0)?, PageFlipFlags::EVENT, None)
            .map_err(self.access("Failed to queue page flip"))
    }

    fn set_crtc(
        &self,
        crtc: CrtcId,
        framebuffer: FramebufferId,
        connector: ConnectorId,
        mode: &ModeInfo,
    ) -> Result<(), DisplayError> {
        ControlDevice::set_crtc(
            self,
            handle(crtc.0)?,
            Some(handle(framebuffer.0)?),
            (0, 0),
            &[handle(connector.0)?],
            Some(drm_mode(mode)),
        )
        .map_err(self.access("Error setting crtc"))
    }

    fn hide_cursor(&self, crtc: CrtcId) -> Result<(), DisplayError> {
        #[allow(deprecated)]
        self.set_cursor(handle(crtc.0)?, Option::<&control::dumbbuffer::DumbBuffer>::None)
            .map_err(self.access("Failed to hide the cursor"))
    }

    fn set_connector_property(
        &self,
        connector: ConnectorId,
        property: PropertyId,
        value: u64,
    ) -> Result<(), DisplayError> {
        let conn: connector::Handle = handle(connector.0)?;
        let prop: property::Handle = handle(property.0)?;
        self.set_property(conn, prop, value)
            .map_err(self.access("Failed to set connector property"))
    }

    fn crtc_sequence(&self, crtc: CrtcId) -> Result<u64, DisplayError> {
        let pipe = self.pipe(handle(crtc.0)?)?;
        let reply = BasicDevice::wait_vblank(self, VblankWaitTarget::Relative(0), VblankWaitFlags::empty(), pipe, 0)
            .map_err(self.access("Failed to read vblank counter"))?;
        Ok(reply.frame() as u64)
    }

    fn queue_vblank_event(&self, crtc: CrtcId, user_data: u64) -> Result<(), DisplayError> {
        let pipe = self.pipe(handle(crtc.0)?)?;
        BasicDevice::wait_vblank(
            self,
            VblankWaitTarget::Relative(1),
            VblankWaitFlags::EVENT,
            pipe,
            user_data as usize,
        )
        .map_err(self.access("Failed to queue vblank event"))?;
        Ok(())
    }

    fn wait_events(&self, timeout: Duration) -> Result<Vec<KmsEvent>, DisplayError> {
        let mut fds = [PollFd::new(&self.fd, PollFlags::IN)];
        match poll(&mut fds, timeout.as_millis().min(i32::MAX as u128) as i32) {
            Ok(0) | Err(Errno::INTR) => return Ok(Vec::new()),
            Ok(_) => {}
            Err(err) => return Err(self.access("Failed to poll device")(err.into())),
        }

        let events = self
            .receive_events()
            .map_err(self.access("Failed to read events"))?;
        Ok(events
            .filter_map(|event| match event {
                Event::PageFlip(event) => Some(KmsEvent::PageFlip {
                    crtc: CrtcId(u32::from(event.crtc)),
                    sequence: event.frame,
                    time: event.duration,
                }),
                Event::Vblank(event) => Some(KmsEvent::Vblank {
                    crtc: CrtcId(u32::from(event.crtc)),
                    sequence: event.frame,
                    user_data: event.user_data as u64,
                }),
                _ => {
                    warn!("Ignoring unexpected display event");
                    None
                }
            })
            .collect())
    }
}
