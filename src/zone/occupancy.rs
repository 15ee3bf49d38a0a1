//! Per-frame zone evaluation.
//!
//! `update_depth` projects every sampled depth pixel into world space and
//! accumulates population and center-of-gravity sums for each zone whose box
//! contains the sample, then runs the occupancy debounce. `update_video`
//! accumulates a coarse brightness per zone from the color stream. Both hold
//! the catalog lock for the whole pass; zone mutations from the server are
//! rare on that timescale.

use crate::lut::{self, DEPTH_OUT_OF_RANGE};
use crate::zone::catalog::{CatalogState, DepthRange};
use crate::zone::{xworld, yworld, Param, ZoneCatalog};
use crate::{FRAME_H, FRAME_W, VIDEO_SIZE};

/// Rebuilds the per-pixel raw-depth envelope of all zones.
fn update_zone_map(state: &mut CatalogState) {
    let CatalogState { zones, depth_map, xskip, yskip, .. } = state;
    let (w, h) = (FRAME_W as usize, FRAME_H as usize);

    for y in (0..h).step_by(*yskip) {
        for x in (0..w).step_by(*xskip) {
            let px = y * w + x;
            let mut range = DepthRange::EMPTY;

            for zone in zones.iter() {
                if zone.px_xmin <= x as i32
                    && zone.px_xmax >= x as i32
                    && zone.px_ymin <= y as i32
                    && zone.px_ymax >= y as i32
                {
                    if (zone.px_zmin as u16) < range.min {
                        range.min = zone.px_zmin as u16;
                    }
                    if (zone.px_zmax as u16) > range.max {
                        range.max = zone.px_zmax as u16;
                    }
                }
            }

            depth_map[px] = range;
        }
    }

    state.map_dirty = false;
}

impl ZoneCatalog {
    /// Evaluates all zones against a packed 11-bit depth frame.
    pub fn update_depth(&self, depthbuf: &[u8]) {
        let mut state = self.lock();

        if state.map_dirty {
            update_zone_map(&mut state);
        }

        let CatalogState {
            zones,
            depth_map,
            xskip,
            yskip,
            max_zone,
            occupied,
            oor_total,
            ..
        } = &mut *state;

        *max_zone = -1;
        *occupied = 0;
        *oor_total = 0;
        let skip = (*xskip * *yskip) as i32;

        for zone in zones.iter_mut() {
            zone.pop = 0;
            zone.xsum = 0;
            zone.ysum = 0;
            zone.zsum = 0;
        }

        let (w, h) = (FRAME_W as usize, FRAME_H as usize);
        for y in (0..h).step_by(*yskip) {
            for x in (0..w).step_by(*xskip) {
                let px = y * w + x;
                let z = lut::pxval_11(depthbuf, px);
                if z == DEPTH_OUT_OF_RANGE {
                    *oor_total += skip;
                    continue;
                }

                // Skip pixels whose covering zones cannot match this depth.
                let range = depth_map[px];
                if z < range.min || z > range.max {
                    continue;
                }

                let zw = lut::depth_mm(z as usize);
                let xw = xworld(x as i32, zw);
                let yw = yworld(y as i32, zw);

                for zone in zones.iter_mut() {
                    if xw >= zone.xmin
                        && xw <= zone.xmax
                        && yw >= zone.ymin
                        && yw <= zone.ymax
                        && zw >= zone.zmin
                        && zw <= zone.zmax
                    {
                        zone.pop += skip;
                        zone.xsum += (skip * xw) as i64;
                        zone.ysum += (skip * yw) as i64;
                        zone.zsum += (skip * zw) as i64;
                    }
                }
            }
        }

        let mut maxsa = 0;
        for (i, zone) in zones.iter_mut().enumerate() {
            let sa = zone.sa();
            let threshold = if zone.occupied {
                zone.falling_threshold
            } else {
                zone.rising_threshold
            };
            let mut allow_occupied = zone.pop > 0;

            let param = match zone.param {
                Param::Pop => zone.pop,
                Param::Sa => sa,
                Param::Bright => {
                    // Brightness comes from video, not depth, so an empty
                    // depth population must not veto it.
                    allow_occupied = true;
                    zone.bright()
                }
                Param::Xc => zone.xc(),
                Param::Yc => zone.yc(),
                Param::Zc => zone.zc(),
            };

            let now_occupied = allow_occupied && param >= threshold;

            if zone.occupied != now_occupied {
                zone.count += 1;
            } else {
                zone.count = 0;
            }

            if !zone.occupied && zone.count > zone.rising_delay {
                zone.occupied = true;
                zone.count = 0;
            } else if zone.occupied && zone.count > zone.falling_delay {
                zone.occupied = false;
                zone.count = 0;
            }

            *occupied += zone.occupied as i32;

            if sa > maxsa {
                *max_zone = i as i32;
                maxsa = sa;
            }
        }
    }

    /// Accumulates per-zone brightness from a single-channel video frame.
    /// Samples a sparse grid of the green-ish Bayer cells; containment is
    /// tested in screen space only.
    pub fn update_video(&self, videobuf: &[u8]) {
        debug_assert!(videobuf.len() >= VIDEO_SIZE);

        let mut state = self.lock();

        if state.map_dirty {
            update_zone_map(&mut state);
        }

        for zone in state.zones.iter_mut() {
            zone.bsum = 0;
        }

        let CatalogState { zones, .. } = &mut *state;
        let (w, h) = (FRAME_W as usize, FRAME_H as usize);

        for y in (0..h).step_by(8) {
            let mut px = y * w;
            let mut x = 1;
            while x < w {
                let b = videobuf[px] as i64;

                for zone in zones.iter_mut() {
                    if x as i32 >= zone.px_xmin
                        && x as i32 <= zone.px_xmax
                        && y as i32 >= zone.px_ymin
                        && y as i32 <= zone.px_ymax
                    {
                        zone.bsum += b;
                    }
                }

                x += 8;
                px += 8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lut::pack_11;
    use crate::{DEPTH_SIZE, FRAME_PIX};

    /// Packs a full frame where every pixel carries the same raw depth.
    fn uniform_frame(raw: u16) -> Vec<u8> {
        if raw == DEPTH_OUT_OF_RANGE {
            return vec![0xff; DEPTH_SIZE];
        }
        pack_11(&vec![raw; FRAME_PIX])
    }

    fn catalog() -> ZoneCatalog {
        crate::lut::init();
        ZoneCatalog::new(2, 2)
    }

    #[test]
    fn test_all_out_of_range() {
        let c = catalog();
        c.add("Z", [-500, -500, 500, 500, 500, 1500]).unwrap();
        c.set_attr("Z", "on_level", "0").unwrap();
        let frame = uniform_frame(DEPTH_OUT_OF_RANGE);
        for _ in 0..5 {
            c.update_depth(&frame);
        }
        // Every sampled pixel contributes its stride weight to the
        // out-of-range total and nothing else.
        assert_eq!(c.oor_total(), FRAME_PIX as i32);
        c.for_each(|z| {
            assert_eq!(z.pop, 0);
            assert!(!z.occupied, "empty depth cannot occupy a pop-driven zone");
        });
        assert_eq!(c.occupied_count(), 0);
        let (idx, name) = c.peak();
        assert_eq!(idx, -1);
        assert!(name.is_none());
    }

    #[test]
    fn test_uniform_fill_population_and_cog() {
        let c = catalog();
        let raw = 600u16;
        let zw = lut::depth_mm(raw as usize);
        c.add("Z", [-200, -150, zw - 50, 200, 150, zw + 50]).unwrap();
        let frame = uniform_frame(raw);
        c.update_depth(&frame);

        let mut seen = (0, 0, 0, 0);
        c.for_each(|z| seen = (z.pop, z.xc(), z.yc(), z.zc()));
        let (pop, xc, yc, zc) = seen;
        assert!(pop > 0, "uniform fill must populate the zone");
        // Pop is a multiple of the stride weight.
        assert_eq!(pop % 4, 0);
        // Center of gravity lands near the middle of each axis.
        assert!((xc - 500).abs() < 40, "xc={xc}");
        assert!((yc - 500).abs() < 40, "yc={yc}");
        assert!((zc - 500).abs() < 40, "zc={zc}");
        // Accounting: samples either land out of range or are bounded by the
        // sampled pixel count times the stride weight.
        assert!(c.oor_total() + pop <= FRAME_PIX as i32);
    }

    #[test]
    fn test_surface_area_scales_with_population() {
        let c = catalog();
        let raw = 600u16;
        let zw = lut::depth_mm(raw as usize);
        c.add("Z", [-200, -150, zw - 50, 200, 150, zw + 50]).unwrap();
        c.update_depth(&uniform_frame(raw));
        let mut got = (0, 0);
        c.for_each(|z| got = (z.pop, z.sa()));
        let (pop, sa) = got;
        let expect = (pop as f32 * lut::surface_area(zw as f32)) as i32;
        // zsum/pop is exactly zw here, so sa is the closed-form value.
        assert_eq!(sa, expect);
        let (idx, name) = c.peak();
        assert_eq!(idx, 0);
        assert_eq!(name.as_deref(), Some("Z"));
    }

    #[test]
    fn test_debounce_rising_delay() {
        let c = catalog();
        let raw = 600u16;
        let zw = lut::depth_mm(raw as usize);
        c.add("Z", [-200, -150, zw - 50, 200, 150, zw + 50]).unwrap();
        c.set_attr("Z", "on_level", "1").unwrap();
        c.set_attr("Z", "on_delay", "2").unwrap();

        let frame = uniform_frame(raw);
        let occupied = |c: &ZoneCatalog| {
            let mut o = false;
            c.for_each(|z| o = z.occupied);
            o
        };

        c.update_depth(&frame);
        assert!(!occupied(&c), "frame 1: count=1, not past delay");
        c.update_depth(&frame);
        assert!(!occupied(&c), "frame 2: count=2, not past delay");
        c.update_depth(&frame);
        assert!(occupied(&c), "frame 3: count exceeds on_delay, flips");
        assert_eq!(c.occupied_count(), 1);
    }

    #[test]
    fn test_debounce_falling_delay() {
        let c = catalog();
        let raw = 600u16;
        let zw = lut::depth_mm(raw as usize);
        c.add("Z", [-200, -150, zw - 50, 200, 150, zw + 50]).unwrap();
        c.set_attr("Z", "on_level", "1").unwrap();
        c.set_attr("Z", "on_delay", "0").unwrap();
        c.set_attr("Z", "off_delay", "1").unwrap();

        let full = uniform_frame(raw);
        let empty = uniform_frame(DEPTH_OUT_OF_RANGE);
        let occupied = |c: &ZoneCatalog| {
            let mut o = false;
            c.for_each(|z| o = z.occupied);
            o
        };

        c.update_depth(&full);
        assert!(occupied(&c), "on_delay=0 flips after one qualifying frame");
        c.update_depth(&empty);
        assert!(occupied(&c), "one empty frame is within off_delay");
        c.update_depth(&empty);
        assert!(!occupied(&c), "second empty frame clears occupancy");
    }

    #[test]
    fn test_depth_map_gates_sweep() {
        let c = catalog();
        let raw = 600u16;
        let zw = lut::depth_mm(raw as usize);
        // Zone sits well behind the uniform plane; its depth envelope
        // excludes the frame's raw value at every covered pixel.
        c.add("Z", [-200, -150, zw + 2000, 200, 150, zw + 3000]).unwrap();
        c.update_depth(&uniform_frame(raw));
        c.for_each(|z| assert_eq!(z.pop, 0));
    }

    #[test]
    fn test_video_brightness() {
        let c = catalog();
        c.add("Z", [-500, -400, 500, 500, 400, 1500]).unwrap();
        c.set_attr("Z", "px_xmin", "0").unwrap();
        c.set_attr("Z", "px_xmax", "639").unwrap();
        c.set_attr("Z", "px_ymin", "0").unwrap();
        c.set_attr("Z", "px_ymax", "479").unwrap();

        let frame = vec![100u8; VIDEO_SIZE];
        c.update_video(&frame);

        let mut got = (0i64, 0, 0);
        c.for_each(|z| got = (z.bsum, z.bright(), z.maxpop));
        let (bsum, bright, maxpop) = got;
        // 80 samples per sampled row, 60 sampled rows.
        assert_eq!(bsum, 100 * 80 * 60);
        assert_eq!(bright, (bsum * 256 / maxpop as i64) as i32);
    }

    #[test]
    fn test_video_brightness_outside_zone() {
        let c = catalog();
        c.add("Z", [-500, -400, 500, 500, 400, 1500]).unwrap();
        c.set_attr("Z", "px_xmin", "300").unwrap();
        c.set_attr("Z", "px_xmax", "301").unwrap();
        c.set_attr("Z", "px_ymin", "300").unwrap();
        c.set_attr("Z", "px_ymax", "301").unwrap();

        // No sampled column lands inside a 2px box that avoids the grid.
        let frame = vec![255u8; VIDEO_SIZE];
        c.update_video(&frame);
        let mut bsum = -1i64;
        c.for_each(|z| bsum = z.bsum);
        assert_eq!(bsum, 0);
    }
}
