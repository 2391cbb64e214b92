// Copyright 2025 The rfbserver Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Helpers shared across the RRE-family and tile-based encodings.
//!
//! Everything here works on client-format pixel values, so the same
//! routines serve 8, 16 and 32 bit clients.

use std::collections::HashMap;

/// A uniformly coloured subrectangle found inside a larger rectangle.
#[derive(Debug)]
pub struct Subrect {
    /// The pixel value of this subrectangle.
    pub color: u32,
    /// X offset within the parent rectangle.
    pub x: u16,
    /// Y offset within the parent rectangle.
    pub y: u16,
    /// Width in pixels.
    pub w: u16,
    /// Height in pixels.
    pub h: u16,
}

/// Most frequent pixel value, used as the background colour.
#[must_use]
pub fn get_background_color(pixels: &[u32]) -> u32 {
    if pixels.is_empty() {
        return 0;
    }

    let mut counts: HashMap<u32, usize> = HashMap::new();
    for &pixel in pixels {
        *counts.entry(pixel).or_insert(0) += 1;
    }

    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(color, _)| color)
        .unwrap_or(pixels[0])
}

/// Greedy subrectangle discovery over non-background pixels.
///
/// For each unvisited pixel that differs from the background, grow the
/// largest uniform rectangle anchored there (the better of
/// horizontal-run-then-down and vertical-run-then-right), emit it, and
/// mark its pixels visited.
#[must_use]
pub fn find_subrects(pixels: &[u32], width: usize, height: usize, bg_color: u32) -> Vec<Subrect> {
    let mut subrects = Vec::new();
    let mut marked = vec![false; pixels.len()];

    for y in 0..height {
        for x in 0..width {
            let idx = y * width + x;
            if marked[idx] || pixels[idx] == bg_color {
                continue;
            }

            let color = pixels[idx];

            // Horizontal run, then grow downwards.
            let mut max_w = 0;
            for test_x in x..width {
                let test_idx = y * width + test_x;
                if marked[test_idx] || pixels[test_idx] != color {
                    break;
                }
                max_w = test_x - x + 1;
            }

            let mut h = 1;
            'down: for test_y in (y + 1)..height {
                for test_x in x..(x + max_w) {
                    let test_idx = test_y * width + test_x;
                    if marked[test_idx] || pixels[test_idx] != color {
                        break 'down;
                    }
                }
                h = test_y - y + 1;
            }

            let mut best_w = max_w;
            let mut best_h = h;

            // Vertical run, then grow rightwards.
            let mut max_h = 0;
            for test_y in y..height {
                let test_idx = test_y * width + x;
                if marked[test_idx] || pixels[test_idx] != color {
                    break;
                }
                max_h = test_y - y + 1;
            }

            let mut w2 = 1;
            'right: for test_x in (x + 1)..width {
                for test_y in y..(y + max_h) {
                    let test_idx = test_y * width + test_x;
                    if marked[test_idx] || pixels[test_idx] != color {
                        break 'right;
                    }
                }
                w2 = test_x - x + 1;
            }

            if w2 * max_h > best_w * best_h {
                best_w = w2;
                best_h = max_h;
            }

            for dy in 0..best_h {
                for dx in 0..best_w {
                    marked[(y + dy) * width + (x + dx)] = true;
                }
            }

            subrects.push(Subrect {
                color,
                x: x as u16,
                y: y as u16,
                w: best_w as u16,
                h: best_h as u16,
            });
        }
    }

    subrects
}

/// Copies a tile out of a row-major pixel array.
#[must_use]
pub fn extract_tile(
    pixels: &[u32],
    width: usize,
    x: usize,
    y: usize,
    tw: usize,
    th: usize,
) -> Vec<u32> {
    let mut tile = Vec::with_capacity(tw * th);
    for dy in 0..th {
        let start = (y + dy) * width + x;
        tile.extend_from_slice(&pixels[start..start + tw]);
    }
    tile
}

/// Classifies a tile's colours.
///
/// Returns `(is_solid, is_mono, bg, fg)`: solid tiles have one colour,
/// mono tiles exactly two (majority first).
#[must_use]
pub fn analyze_tile_colors(pixels: &[u32]) -> (bool, bool, u32, u32) {
    if pixels.is_empty() {
        return (true, true, 0, 0);
    }

    let mut colors: HashMap<u32, usize> = HashMap::new();
    for &pixel in pixels {
        *colors.entry(pixel).or_insert(0) += 1;
    }

    if colors.len() == 1 {
        return (true, true, pixels[0], 0);
    }

    if colors.len() == 2 {
        let mut sorted: Vec<_> = colors.into_iter().collect();
        sorted.sort_by_key(|(_, count)| std::cmp::Reverse(*count));
        return (false, true, sorted[0].0, sorted[1].0);
    }

    let bg = get_background_color(pixels);
    (false, false, bg, 0)
}

/// Distinct colours in first-appearance order, up to `limit`.
///
/// Returns `None` when the pixel data has more than `limit` colours.
#[must_use]
pub fn build_palette(pixels: &[u32], limit: usize) -> Option<Vec<u32>> {
    let mut palette = Vec::new();
    let mut seen: HashMap<u32, ()> = HashMap::new();
    for &pixel in pixels {
        if seen.insert(pixel, ()).is_none() {
            palette.push(pixel);
            if palette.len() > limit {
                return None;
            }
        }
    }
    Some(palette)
}

/// The single colour of the pixels, if they are all equal.
#[must_use]
pub fn check_solid_color(pixels: &[u32]) -> Option<u32> {
    let (&first, rest) = pixels.split_first()?;
    rest.iter().all(|&p| p == first).then_some(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_is_majority() {
        assert_eq!(get_background_color(&[7, 7, 9, 7]), 7);
    }

    #[test]
    fn subrects_cover_non_background() {
        // 4x2: background 0 with a 2x2 block of 5 at (1,0).
        let pixels = [0, 5, 5, 0, 0, 5, 5, 0];
        let subrects = find_subrects(&pixels, 4, 2, 0);
        assert_eq!(subrects.len(), 1);
        let sr = &subrects[0];
        assert_eq!((sr.x, sr.y, sr.w, sr.h, sr.color), (1, 0, 2, 2, 5));
    }

    #[test]
    fn palette_respects_limit_and_order() {
        let pixels = [3, 1, 3, 2, 1];
        assert_eq!(build_palette(&pixels, 4), Some(vec![3, 1, 2]));
        assert_eq!(build_palette(&pixels, 2), None);
    }

    #[test]
    fn tile_analysis() {
        assert_eq!(analyze_tile_colors(&[4, 4, 4]), (true, true, 4, 0));
        let (solid, mono, bg, fg) = analyze_tile_colors(&[4, 4, 9]);
        assert!(!solid && mono);
        assert_eq!((bg, fg), (4, 9));
        let (solid, mono, _, _) = analyze_tile_colors(&[1, 2, 3]);
        assert!(!solid && !mono);
    }

    #[test]
    fn solid_check() {
        assert_eq!(check_solid_color(&[2, 2, 2]), Some(2));
        assert_eq!(check_solid_color(&[2, 3]), None);
        assert_eq!(check_solid_color(&[]), None);
    }
}
