//! Damage-trust policy and scan-request coalescing. Pure, display-agnostic
//! logic so it is testable without an X11 connection.

use x11bridge_proto::{DamageTrust, Rect, ScanRequest};

/// Tracks consecutive full-screen damage events under the `auto` policy.
pub struct DamageTrustState {
    policy: DamageTrust,
    consecutive_fullscreen: u32,
}

const AUTO_TRUST_THRESHOLD: u32 = 2;

impl DamageTrustState {
    pub fn new(policy: DamageTrust) -> Self {
        Self {
            policy,
            consecutive_fullscreen: 0,
        }
    }

    /// Decide whether a damage event of the given "is fullscreen" shape
    /// should be trusted as-is, or converted into a full rescan request.
    /// Returns `true` to trust (forward rectangles as reported).
    pub fn decide(&mut self, is_fullscreen: bool) -> bool {
        match self.policy {
            DamageTrust::AlwaysTrust => true,
            DamageTrust::NeverTrust => false,
            DamageTrust::Auto => {
                if is_fullscreen {
                    self.consecutive_fullscreen += 1;
                } else {
                    self.consecutive_fullscreen = 0;
                }
                self.consecutive_fullscreen <= AUTO_TRUST_THRESHOLD
            }
        }
    }
}

/// Coalesce a scanline report followed immediately by a fullscreen request
/// covering the same area: the scanline entry is redundant and dropped.
/// Disabled via `scan.scanline_coalescing = false`.
pub fn coalesce(pending: &[ScanRequest], enabled: bool) -> Vec<ScanRequest> {
    if !enabled {
        return pending.to_vec();
    }

    let mut out = Vec::with_capacity(pending.len());
    let mut i = 0;
    while i < pending.len() {
        let drop_scanline = matches!(pending[i], ScanRequest::ScanlineReport(_))
            && matches!(pending.get(i + 1), Some(ScanRequest::FullscreenRequest));
        if !drop_scanline {
            out.push(pending[i]);
        }
        i += 1;
    }
    out
}

/// Horizontal tile band boundaries for a row of `width` pixels split into
/// `tile_count` bands. The integer math `(tile * width) / tile_count`
/// handles remainders correctly; the last band absorbs what's left.
pub fn tile_bounds(width: u16, tile_count: u32) -> Vec<(u16, u16)> {
    let width = width as u32;
    let tile_count = tile_count.max(1);
    let mut bounds = Vec::with_capacity(tile_count as usize);
    for tile in 0..tile_count {
        let start = (tile * width) / tile_count;
        let end = if tile + 1 == tile_count {
            width
        } else {
            ((tile + 1) * width) / tile_count
        };
        bounds.push((start as u16, end as u16));
    }
    bounds
}

/// Diff two equal-dimension full-frame buffers over a V x H tile grid,
/// mirroring `display_scan_whole_screen`: for each vertical band, walk its
/// rows and short-circuit on an exact row match; the first differing row in
/// a band checks each horizontal band it hasn't already marked. A changed
/// tile's rect spans the *whole* band (full row range x full column range),
/// not just the row that first revealed the difference, since the original
/// never resets `tiles[v][h]` once set within a band.
///
/// `old` and `new` are row-major, tightly packed (`stride = width *
/// bytes_per_pixel`) buffers of the same `width`/`height`.
pub fn diff_tiles_2d(
    old: &[u8],
    new: &[u8],
    width: u16,
    height: u16,
    bytes_per_pixel: usize,
    vertical_tiles: u32,
    horizontal_tiles: u32,
) -> Vec<Rect> {
    let stride = width as usize * bytes_per_pixel;
    let row_bounds = tile_bounds(height, vertical_tiles);
    let col_bounds = tile_bounds(width, horizontal_tiles);
    let mut rects = Vec::new();

    for &(y_start, y_end) in &row_bounds {
        let mut band_changed = vec![false; col_bounds.len()];
        for y in y_start..y_end {
            let row_start = y as usize * stride;
            let old_row = &old[row_start..row_start + stride];
            let new_row = &new[row_start..row_start + stride];
            if old_row == new_row {
                continue;
            }
            for (tile, &(x_start, x_end)) in col_bounds.iter().enumerate() {
                if band_changed[tile] {
                    continue;
                }
                let byte_start = x_start as usize * bytes_per_pixel;
                let byte_end = x_end as usize * bytes_per_pixel;
                if old_row[byte_start..byte_end] != new_row[byte_start..byte_end] {
                    band_changed[tile] = true;
                }
            }
        }
        for (tile, &changed) in band_changed.iter().enumerate() {
            if changed {
                let (x_start, x_end) = col_bounds[tile];
                rects.push(Rect::new(
                    x_start as i16,
                    y_start as i16,
                    x_end - x_start,
                    y_end - y_start,
                ));
            }
        }
    }
    rects
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_trust_never_converts() {
        let mut state = DamageTrustState::new(DamageTrust::AlwaysTrust);
        for _ in 0..10 {
            assert!(state.decide(true));
        }
    }

    #[test]
    fn never_trust_always_converts() {
        let mut state = DamageTrustState::new(DamageTrust::NeverTrust);
        assert!(!state.decide(false));
        assert!(!state.decide(true));
    }

    #[test]
    fn property_6_damage_trust_monotonicity() {
        let mut state = DamageTrustState::new(DamageTrust::Auto);
        assert!(state.decide(true)); // count=1, trusted
        assert!(state.decide(true)); // count=2, trusted
        assert!(!state.decide(true)); // count=3, exceeds threshold
        assert!(!state.decide(true)); // stays distrusted
        assert!(state.decide(false)); // sub-full event resets counter
        assert!(state.decide(true)); // count=1 again, trusted
    }

    #[test]
    fn coalesce_drops_scanline_before_fullscreen_request() {
        let pending = vec![
            ScanRequest::ScanlineReport(Rect::new(0, 0, 10, 1)),
            ScanRequest::FullscreenRequest,
        ];
        let result = coalesce(&pending, true);
        assert_eq!(result.len(), 1);
        assert!(matches!(result[0], ScanRequest::FullscreenRequest));
    }

    #[test]
    fn coalesce_keeps_scanline_before_damage_report() {
        let pending = vec![
            ScanRequest::ScanlineReport(Rect::new(0, 0, 10, 1)),
            ScanRequest::DamageReport(Rect::new(0, 0, 10, 10)),
        ];
        let result = coalesce(&pending, true);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn coalesce_disabled_keeps_everything() {
        let pending = vec![
            ScanRequest::ScanlineReport(Rect::new(0, 0, 10, 1)),
            ScanRequest::FullscreenRequest,
        ];
        let result = coalesce(&pending, false);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn tile_bounds_cover_width_without_gaps() {
        let bounds = tile_bounds(100, 32);
        assert_eq!(bounds.len(), 32);
        assert_eq!(bounds[0].0, 0);
        assert_eq!(bounds.last().unwrap().1, 100);
        for w in bounds.windows(2) {
            assert_eq!(w[0].1, w[1].0);
        }
    }

    #[test]
    fn tile_bounds_last_band_absorbs_remainder() {
        // 100 / 32 does not divide evenly.
        let bounds = tile_bounds(100, 32);
        let last = *bounds.last().unwrap();
        assert!(last.1 - last.0 >= 100 / 32);
    }

    #[test]
    fn property_7_tile_diff_correctness() {
        let bytes_per_pixel = 4;
        let width = 64u16;
        let height = 64u16;
        let stride = width as usize * bytes_per_pixel;
        let mut old = vec![0u8; stride * height as usize];
        let mut new = old.clone();

        let col_bounds = tile_bounds(width, 8);
        let row_bounds = tile_bounds(height, 8);
        let (x_start, _) = col_bounds[2];
        let (y_start, _) = row_bounds[3];
        let byte = y_start as usize * stride + x_start as usize * bytes_per_pixel;
        new[byte] ^= 0xFF;

        let changed = diff_tiles_2d(&old, &new, width, height, bytes_per_pixel, 8, 8);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].x, col_bounds[2].0 as i16);
        assert_eq!(changed[0].y, row_bounds[3].0 as i16);

        // Identical frames produce no changed tiles.
        old.copy_from_slice(&new);
        let changed = diff_tiles_2d(&old, &new, width, height, bytes_per_pixel, 8, 8);
        assert!(changed.is_empty());
    }

    #[test]
    fn s4_single_band_change_yields_one_tile() {
        // S4: fullscreen and fresh frame identical -> 0 tiles; any difference
        // in a single 32x32 band -> exactly one tile changed for that band.
        let bytes_per_pixel = 4;
        let width = 320u16;
        let height = 320u16;
        let stride = width as usize * bytes_per_pixel;
        let old = vec![0u8; stride * height as usize];
        let mut new = old.clone();

        let no_change = diff_tiles_2d(&old, &new, width, height, bytes_per_pixel, 32, 32);
        assert!(no_change.is_empty());

        let col_bounds = tile_bounds(width, 32);
        let row_bounds = tile_bounds(height, 32);
        let (x_start, _) = col_bounds[10];
        let (y_start, _) = row_bounds[5];
        let byte = y_start as usize * stride + x_start as usize * bytes_per_pixel;
        new[byte] ^= 0xFF;

        let changed = diff_tiles_2d(&old, &new, width, height, bytes_per_pixel, 32, 32);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].x, col_bounds[10].0 as i16);
        assert_eq!(changed[0].y, row_bounds[5].0 as i16);
        assert_eq!(changed[0].width, col_bounds[10].1 - col_bounds[10].0);
        assert_eq!(changed[0].height, row_bounds[5].1 - row_bounds[5].0);
    }
}
