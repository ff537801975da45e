//! Modifier negotiation between the display consumer and the device.

use super::{dmabuf::MAX_PLANES, Modifier};
use crate::device::{FormatFeatures, ModifierProperties};

/// Drops modifiers the allocator cannot export or that lack `required` features
pub fn usable_modifiers(
    properties: &[ModifierProperties],
    required: FormatFeatures,
) -> impl Iterator<Item = &ModifierProperties> {
    properties.iter().filter(move |props| {
        props.plane_count >= 1 && props.plane_count as usize <= MAX_PLANES && props.features.contains(required)
    })
}

/// Intersects candidate lists with the device supported modifiers.
///
/// `candidates` is ordered by preference of the consumer, usually window specific modifiers before
/// screen wide ones. The first list leaving a non-empty intersection wins, and its order is kept.
/// Returns `None` if no list shares a modifier with the device.
pub fn negotiate_modifiers(candidates: &[Vec<Modifier>], supported: &[Modifier]) -> Option<Vec<Modifier>> {
    candidates.iter().find_map(|list| {
        let intersection = list
            .iter()
            .copied()
            .filter(|modifier| supported.contains(modifier))
            .collect::<Vec<_>>();
        (!intersection.is_empty()).then_some(intersection)
    })
}
