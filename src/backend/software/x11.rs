//! [`ImageSink`] drawing to an X11 window with core `PutImage` requests.

use std::sync::Arc;

use tracing::{debug, trace};
use x11rb::{
    connection::{Connection, RequestConnection},
    protocol::xproto::{ConnectionExt as _, CreateGCAux, ImageFormat},
};

use super::{split_rows, ImageSink, SinkError};
use crate::{
    backend::{
        allocator::{Fourcc, MappedImage},
        x11::{visual_formats, PresentConnection, X11Error, XcbConnection, Xid},
    },
    utils::{Extent, Rect},
};

/// Size of the `PutImage` request without pixel data
const PUT_IMAGE_HEADER: usize = 24;

/// A window of an X server, drawn to without any extension
#[derive(Debug)]
pub struct X11ImageSink {
    conn: Arc<XcbConnection>,
    window: Xid,
    gc: Xid,
    depth: u8,
}

impl X11ImageSink {
    /// Creates a sink for `window`
    pub fn new(conn: Arc<XcbConnection>, window: Xid) -> Result<X11ImageSink, X11Error> {
        let geometry = conn.window_geometry(window)?;
        let raw = conn.connection();
        let gc = raw.generate_id()?;
        raw.create_gc(gc, window, &CreateGCAux::new())?;
        raw.flush()?;
        debug!(window, depth = geometry.depth, "Created image sink");
        Ok(X11ImageSink {
            depth: geometry.depth,
            conn,
            window,
            gc,
        })
    }

    /// The window
    pub fn window(&self) -> Xid {
        self.window
    }

    fn put_region(&self, image: &MappedImage<'_>, region: Rect, data: &mut Vec<u8>) -> Result<(), X11Error> {
        let raw = self.conn.connection();
        let bpp = image.color_format().bytes_per_pixel();
        let max_bytes = raw.maximum_request_bytes().saturating_sub(PUT_IMAGE_HEADER);

        for chunk in split_rows(region, bpp, max_bytes) {
            let start = chunk.offset.x as usize * bpp as usize;
            let len = chunk.extent.width as usize * bpp as usize;
            // rows are padded to 32 bits on the wire
            let padded = (len + 3) & !3;
            data.clear();
            for y in chunk.offset.y as u32..chunk.offset.y as u32 + chunk.extent.height {
                data.extend_from_slice(&image.row(y)[start..start + len]);
                data.resize(data.len() + padded - len, 0);
            }
            raw.put_image(
                ImageFormat::Z_PIXMAP,
                self.window,
                self.gc,
                chunk.extent.width as u16,
                chunk.extent.height as u16,
                chunk.offset.x as i16,
                chunk.offset.y as i16,
                0,
                self.depth,
                &data[..],
            )?;
        }
        Ok(())
    }
}

impl ImageSink for X11ImageSink {
    fn extent(&self) -> Result<Extent, SinkError> {
        Ok(self.conn.window_geometry(self.window)?.extent)
    }

    fn formats(&self) -> Result<Vec<Fourcc>, SinkError> {
        let geometry = self.conn.window_geometry(self.window)?;
        Ok(geometry
            .visual
            .map(|visual| visual_formats(geometry.depth, &visual))
            .unwrap_or_default()
            .into_iter()
            .map(|format| format.drm_format)
            .collect())
    }

    #[profiling::function]
    fn put_image(&self, image: &MappedImage<'_>, damage: &[Rect]) -> Result<(), SinkError> {
        let full = [Rect::from_extent(image.extent())];
        let regions = if damage.is_empty() { &full[..] } else { damage };

        let mut data = Vec::new();
        for region in regions {
            self.put_region(image, *region, &mut data)?;
        }
        self.conn.connection().flush().map_err(X11Error::from)?;
        trace!(window = self.window, regions = regions.len(), "Image put");
        Ok(())
    }
}

impl Drop for X11ImageSink {
    fn drop(&mut self) {
        let raw = self.conn.connection();
        if let Err(err) = raw.free_gc(self.gc).map(|_| ()).and_then(|()| raw.flush()) {
            debug!(%err, "Failed to free the graphics context");
        }
    }
}
