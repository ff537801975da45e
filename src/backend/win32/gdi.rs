//! [`GdiTarget`] on top of the `windows` crate.

use std::{
    collections::HashMap,
    ffi::c_void,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
};

use tracing::{trace, warn};
use windows::Win32::{
    Foundation::{HANDLE, HWND, RECT},
    Graphics::Gdi::{
        CreateCompatibleDC, CreateDIBSection, DeleteDC, DeleteObject, GetDC, ReleaseDC, SelectObject,
        SetStretchBltMode, StretchBlt, BITMAPINFO, BITMAPINFOHEADER, BI_RGB, COLORONCOLOR, DIB_RGB_COLORS,
        HBITMAP, HDC, HGDIOBJ, SRCCOPY,
    },
    UI::WindowsAndMessaging::GetClientRect,
};

use super::{DibId, GdiTarget, Win32Error};
use crate::{backend::allocator::MappedImage, utils::Extent};

#[derive(Debug)]
struct Dib {
    dc: HDC,
    bitmap: HBITMAP,
    previous: HGDIOBJ,
    bits: *mut c_void,
    extent: Extent,
}

/// A window identified by its `HWND`
#[derive(Debug)]
pub struct GdiWindow {
    hwnd: HWND,
    dibs: Mutex<HashMap<DibId, Dib>>,
    next_id: AtomicU32,
}

// SAFETY: GDI objects are not bound to the creating thread, all access to the DIB sections goes
// through the mutex
unsafe impl Send for GdiWindow {}
unsafe impl Sync for GdiWindow {}

fn gdi_error(call: &'static str) -> Win32Error {
    Win32Error::Gdi {
        call,
        message: windows::core::Error::from_win32().message().to_string(),
    }
}

fn unknown_dib(call: &'static str) -> Win32Error {
    Win32Error::Gdi {
        call,
        message: "unknown DIB section".into(),
    }
}

impl GdiWindow {
    /// Draws to the window `hwnd`.
    ///
    /// # Safety
    ///
    /// `hwnd` must be a window handle owned by this process. Destroying the window is allowed,
    /// presents fail with [`Win32Error::WindowDestroyed`] afterwards.
    pub unsafe fn new(hwnd: HWND) -> GdiWindow {
        GdiWindow {
            hwnd,
            dibs: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }
}

impl GdiTarget for GdiWindow {
    fn client_extent(&self) -> Result<Extent, Win32Error> {
        let mut rect = RECT::default();
        // SAFETY: rect is a valid out pointer
        unsafe { GetClientRect(self.hwnd, &mut rect) }.map_err(|_| Win32Error::WindowDestroyed)?;
        Ok(Extent::new(
            (rect.right - rect.left).max(0) as u32,
            (rect.bottom - rect.top).max(0) as u32,
        ))
    }

    fn create_dib(&self, extent: Extent) -> Result<DibId, Win32Error> {
        let info = BITMAPINFO {
            bmiHeader: BITMAPINFOHEADER {
                biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
                biWidth: extent.width as i32,
                // negative height is a top-down bitmap
                biHeight: -(extent.height as i32),
                biPlanes: 1,
                biBitCount: 32,
                biCompression: BI_RGB.0,
                ..Default::default()
            },
            ..Default::default()
        };

        // SAFETY: the window dc is released before returning, the memory dc and bitmap are owned by
        // the returned Dib and destroyed in destroy_dib
        unsafe {
            let window_dc = GetDC(self.hwnd);
            let dc = CreateCompatibleDC(window_dc);
            ReleaseDC(self.hwnd, window_dc);
            if dc.0 == 0 {
                return Err(Win32Error::OutOfResources("CreateCompatibleDC"));
            }

            let mut bits = std::ptr::null_mut();
            let bitmap = match CreateDIBSection(dc, &info, DIB_RGB_COLORS, &mut bits, HANDLE::default(), 0) {
                Ok(bitmap) if !bits.is_null() => bitmap,
                _ => {
                    let _ = DeleteDC(dc);
                    return Err(Win32Error::OutOfResources("CreateDIBSection"));
                }
            };
            let previous = SelectObject(dc, bitmap);

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            trace!(id, %extent, "DIB section created");
            self.dibs.lock().unwrap().insert(
                id,
                Dib {
                    dc,
                    bitmap,
                    previous,
                    bits,
                    extent,
                },
            );
            Ok(id)
        }
    }

    fn upload(&self, dib: DibId, image: &MappedImage<'_>) -> Result<(), Win32Error> {
        let dibs = self.dibs.lock().unwrap();
        let dib = dibs.get(&dib).ok_or_else(|| unknown_dib("upload"))?;
        let extent = image.extent();
        if extent != dib.extent {
            return Err(Win32Error::Gdi {
                call: "upload",
                message: format!("image of {} does not fit a DIB section of {}", extent, dib.extent),
            });
        }
        let stride = extent.width as usize * 4;
        for y in 0..extent.height {
            let row = image.row(y);
            // SAFETY: the DIB section has extent.height rows of stride bytes, row has exactly stride bytes
            unsafe {
                std::ptr::copy_nonoverlapping(
                    row.as_ptr(),
                    (dib.bits as *mut u8).add(y as usize * stride),
                    stride.min(row.len()),
                );
            }
        }
        Ok(())
    }

    fn stretch_blt(&self, dib: DibId, src: Extent, dst: Extent) -> Result<(), Win32Error> {
        let dibs = self.dibs.lock().unwrap();
        let dib = dibs.get(&dib).ok_or_else(|| unknown_dib("StretchBlt"))?;
        // SAFETY: the memory dc is alive while it is in the map, the window dc is released again
        unsafe {
            let window_dc = GetDC(self.hwnd);
            if window_dc.0 == 0 {
                return Err(Win32Error::WindowDestroyed);
            }
            SetStretchBltMode(window_dc, COLORONCOLOR);
            let done = StretchBlt(
                window_dc,
                0,
                0,
                dst.width as i32,
                dst.height as i32,
                dib.dc,
                0,
                0,
                src.width as i32,
                src.height as i32,
                SRCCOPY,
            )
            .as_bool();
            ReleaseDC(self.hwnd, window_dc);
            if !done {
                return Err(gdi_error("StretchBlt"));
            }
        }
        Ok(())
    }

    fn destroy_dib(&self, dib: DibId) {
        let Some(dib) = self.dibs.lock().unwrap().remove(&dib) else {
            return;
        };
        // SAFETY: the dib was removed from the map, nothing uses its handles anymore
        unsafe {
            SelectObject(dib.dc, dib.previous);
            if !DeleteObject(dib.bitmap).as_bool() {
                warn!("Failed to delete a DIB section");
            }
            let _ = DeleteDC(dib.dc);
        }
    }
}

impl Drop for GdiWindow {
    fn drop(&mut self) {
        let ids = self.dibs.lock().unwrap().keys().copied().collect::<Vec<_>>();
        for id in ids {
            self.destroy_dib(id);
        }
    }
}
