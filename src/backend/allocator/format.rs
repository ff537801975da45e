//! Format info tables for presentable color formats.
//!
//! Every [`ColorFormat`] a swapchain can be created with maps to a DRM [`Fourcc`] describing the
//! same memory layout, which is what the kernel, the X server and the Wayland compositor understand.
//!
//! ```
//! # use wsi::backend::allocator::{Fourcc, format::{ColorFormat, get_opaque}};
//! assert_eq!(ColorFormat::B8g8r8a8Srgb.fourcc(), Fourcc::Argb8888);
//! assert_eq!(ColorFormat::B8g8r8a8Srgb.opaque_fourcc(), Fourcc::Xrgb8888);
//! assert_eq!(Some(Fourcc::Xrgb8888), get_opaque(Fourcc::Argb8888));
//! assert_eq!(ColorFormat::R5g6b5Unorm.bpp(), 16);
//! ```

use super::Fourcc;

/// Macro to generate the color format enum and its lookup functions.
///
/// `fourcc` is the layout with alpha, `opaque` the variant ignoring the alpha channel,
/// `depth` the number of used bits per pixel without alpha.
macro_rules! format_tables {
    (
        $($format: ident {
            fourcc: $fourcc: ident,
            $(opaque: $opaque: ident,)?
            srgb: $srgb: expr,
            bpp: $bpp: expr,
            depth: $depth: expr $(,)?
        }),* $(,)?
    ) => {
        /// Color format of swapchain images
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ColorFormat {
            $(
                #[doc = concat!(" Stored as [`Fourcc::", stringify!($fourcc), "`]")]
                $format,
            )*
        }

        impl ColorFormat {
            /// All known formats
            pub const ALL: &'static [ColorFormat] = &[$(ColorFormat::$format,)*];

            /// DRM format describing the memory layout
            pub const fn fourcc(&self) -> Fourcc {
                match self {
                    $(ColorFormat::$format => Fourcc::$fourcc,)*
                }
            }

            /// DRM format ignoring the alpha channel.
            ///
            /// Formats without alpha channel return their regular fourcc.
            pub const fn opaque_fourcc(&self) -> Fourcc {
                match get_opaque(self.fourcc()) {
                    Some(opaque) => opaque,
                    None => self.fourcc(),
                }
            }

            /// Returns true if color values are sRGB encoded
            pub const fn is_srgb(&self) -> bool {
                match self {
                    $(ColorFormat::$format => $srgb,)*
                }
            }

            /// Bits per pixel
            pub const fn bpp(&self) -> u32 {
                match self {
                    $(ColorFormat::$format => $bpp,)*
                }
            }

            /// Color bits per pixel, excluding alpha and padding
            pub const fn depth(&self) -> u32 {
                match self {
                    $(ColorFormat::$format => $depth,)*
                }
            }

            /// Returns true if the format has an alpha channel
            pub const fn has_alpha(&self) -> bool {
                get_opaque(self.fourcc()).is_some()
            }
        }

        /// Returns the opaque alternative of the specified format.
        ///
        /// Unknown formats and formats without alpha channel return [`None`].
        #[allow(unreachable_patterns)]
        pub const fn get_opaque(fourcc: Fourcc) -> Option<Fourcc> {
            match fourcc {
                $($(
                    Fourcc::$fourcc => Some(Fourcc::$opaque),
                )?)*
                _ => None,
            }
        }

        /// Returns the format with alpha channel of an opaque format.
        ///
        /// Unknown formats will always return [`None`].
        #[allow(unreachable_patterns)]
        pub const fn get_transparent(fourcc: Fourcc) -> Option<Fourcc> {
            match fourcc {
                $($(
                    Fourcc::$opaque => Some(Fourcc::$fourcc),
                )?)*
                _ => None,
            }
        }
    };
}

format_tables! {
    // 32-bit bpp, 8 bits per channel
    B8g8r8a8Unorm { fourcc: Argb8888, opaque: Xrgb8888, srgb: false, bpp: 32, depth: 24 },
    B8g8r8a8Srgb { fourcc: Argb8888, opaque: Xrgb8888, srgb: true, bpp: 32, depth: 24 },
    R8g8b8a8Unorm { fourcc: Abgr8888, opaque: Xbgr8888, srgb: false, bpp: 32, depth: 24 },
    R8g8b8a8Srgb { fourcc: Abgr8888, opaque: Xbgr8888, srgb: true, bpp: 32, depth: 24 },

    // 32-bit bpp, 10 bits per color channel
    A2r10g10b10Unorm { fourcc: Argb2101010, opaque: Xrgb2101010, srgb: false, bpp: 32, depth: 30 },
    A2b10g10r10Unorm { fourcc: Abgr2101010, opaque: Xbgr2101010, srgb: false, bpp: 32, depth: 30 },

    // 16-bit bpp, no alpha
    R5g6b5Unorm { fourcc: Rgb565, srgb: false, bpp: 16, depth: 16 },

    // half float
    R16g16b16a16Sfloat { fourcc: Abgr16161616f, opaque: Xbgr16161616f, srgb: false, bpp: 64, depth: 48 },
}

impl ColorFormat {
    /// Bytes per pixel
    pub const fn bytes_per_pixel(&self) -> u32 {
        self.bpp() / 8
    }

    /// Formats that can be displayed by an X11 visual or DRM plane with `depth` color bits.
    pub fn for_depth(depth: u32) -> impl Iterator<Item = ColorFormat> {
        ColorFormat::ALL
            .iter()
            .copied()
            .filter(move |format| format.depth() == depth || (depth == 32 && format.depth() == 24))
    }
}
