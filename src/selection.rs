//! Picks the next image for the slideshow.
//!
//! Rules:
//! - `random`: uniform choice among enabled images, no memory of history.
//! - `added` / `custom`: images never shown come first, then the least
//!   recently shown. Ties fall back to creation time (`added`) or the
//!   explicit sort order (`custom`).
//! - Selection is pure; recording that an image was shown happens only once
//!   it actually reaches the display.

use std::cmp::Ordering;

use rand::Rng;
use rand::seq::IndexedRandom;

use crate::model::{Image, OrderMode};

/// Choose the next image to display, or `None` if nothing is enabled.
pub fn select_next<'a, R>(images: &'a [Image], mode: OrderMode, rng: &mut R) -> Option<&'a Image>
where
    R: Rng + ?Sized,
{
    match mode {
        OrderMode::Random => {
            let enabled: Vec<&Image> = images.iter().filter(|img| img.enabled).collect();
            enabled.choose(rng).copied()
        }
        OrderMode::Added | OrderMode::Custom => images
            .iter()
            .filter(|img| img.enabled)
            .min_by(|a, b| rotation_cmp(a, b, mode)),
    }
}

fn rotation_cmp(a: &Image, b: &Image, mode: OrderMode) -> Ordering {
    // `None < Some(_)`: never-shown first, then oldest display first
    a.last_shown_at
        .cmp(&b.last_shown_at)
        .then_with(|| match mode {
            OrderMode::Custom => a
                .sort_order
                .cmp(&b.sort_order)
                .then_with(|| a.created_at.cmp(&b.created_at)),
            OrderMode::Added | OrderMode::Random => a
                .created_at
                .cmp(&b.created_at)
                .then_with(|| a.sort_order.cmp(&b.sort_order)),
        })
        .then_with(|| a.id.cmp(&b.id))
}
