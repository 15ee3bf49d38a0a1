//! Thread-safe zone catalog.
//!
//! All mutation happens under one exclusive lock, including the per-frame
//! occupancy passes, so per-zone counters are never observed half-updated.
//! Structural mutations bump a version counter used as a change token by
//! persistence and subscribers; the all-ones value is reserved as an error
//! marker and is skipped on wrap.

use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::zone::{Param, Zone, ZONE_NAME_LENGTH};
use crate::{FRAME_H, FRAME_PIX, FRAME_W};

/// Raw-depth envelope of the zones covering one sampled pixel.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DepthRange {
    pub min: u16,
    pub max: u16,
}

impl DepthRange {
    pub(crate) const EMPTY: DepthRange = DepthRange { min: u16::MAX, max: 0 };
}

pub(crate) struct CatalogState {
    pub zones: Vec<Zone>,
    /// Min/max raw depth of any zone at each sampled pixel.
    pub depth_map: Vec<DepthRange>,
    /// Set when the depth map needs a rebuild before the next sweep.
    pub map_dirty: bool,
    pub version: u32,
    pub xskip: usize,
    pub yskip: usize,
    /// Index of the zone with the highest surface area (-1 if none).
    pub max_zone: i32,
    /// Number of occupied zones after the last depth pass.
    pub occupied: i32,
    /// Out-of-range samples seen during the last depth pass.
    pub oor_total: i32,
}

impl CatalogState {
    /// Bumps the version, skipping the reserved all-ones marker, and flags
    /// the depth map for rebuild.
    pub(crate) fn bump(&mut self) -> u32 {
        self.map_dirty = true;
        self.version = self.version.wrapping_add(1);
        if self.version == u32::MAX {
            self.version = 0;
        }
        self.version
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.zones.iter().position(|z| z.name == name)
    }

    /// Assigns a zone's full world box, resyncing screen coordinates and
    /// resetting its live state. Bumps the version.
    fn set_zone_box(&mut self, idx: usize, c: [i32; 6]) -> Result<()> {
        validate_box(c)?;

        let zone = &mut self.zones[idx];
        // Mark as a new zone so that new limits get sent to subscribers
        zone.new_zone = true;

        let [xmin, ymin, zmin, xmax, ymax, zmax] = c;
        zone.xmin = xmin;
        zone.xmax = xmax;
        zone.ymin = ymin;
        zone.ymax = ymax;
        zone.zmin = zmin;
        zone.zmax = zmax;

        zone.recalc_screen_from_world();
        zone.update_maxpop();
        zone.lastpop = -1;
        zone.pop = 0;
        zone.occupied = false;

        self.bump();
        Ok(())
    }
}

/// Shared, mutex-guarded collection of zones.
pub struct ZoneCatalog {
    inner: Mutex<CatalogState>,
}

fn validate_box(c: [i32; 6]) -> Result<()> {
    let [xmin, ymin, zmin, xmax, ymax, zmax] = c;
    if xmin >= xmax || ymin >= ymax || zmin >= zmax {
        return Err(Error::conflict("Minimum must be < maximum."));
    }
    if zmin <= 0 || zmax <= 0 {
        return Err(Error::conflict("Z must be > 0."));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid("Name has zero length."));
    }
    if name.len() > ZONE_NAME_LENGTH {
        return Err(Error::invalid(format!(
            "Name is too long (limit is {} bytes, got {})",
            ZONE_NAME_LENGTH,
            name.len()
        )));
    }
    if name.contains(['\r', '\n', '\t', ',']) {
        return Err(Error::invalid("Name contains invalid characters."));
    }
    Ok(())
}

/// C-style lossy integer parse: "true" is 1, "false" is 0, otherwise leading
/// digits are taken and any non-numeric tail is ignored.
pub(crate) fn parse_value(s: &str) -> i32 {
    match s {
        "true" => 1,
        "false" => 0,
        _ => {
            let t = s.trim_start();
            let (sign, digits) = match t.as_bytes().first() {
                Some(b'-') => (-1i64, &t[1..]),
                Some(b'+') => (1i64, &t[1..]),
                _ => (1i64, t),
            };
            let mut v: i64 = 0;
            for b in digits.bytes() {
                if !b.is_ascii_digit() {
                    break;
                }
                v = v * 10 + (b - b'0') as i64;
                if v > u32::MAX as i64 {
                    break;
                }
            }
            (sign * v).clamp(i32::MIN as i64, i32::MAX as i64) as i32
        }
    }
}

enum Recalc {
    None,
    Screen,
    World,
}

impl ZoneCatalog {
    /// Creates an empty catalog. One in every `xskip` columns and `yskip`
    /// rows is considered when zones are updated.
    pub fn new(xskip: usize, yskip: usize) -> Self {
        Self {
            inner: Mutex::new(CatalogState {
                zones: Vec::new(),
                depth_map: vec![DepthRange::EMPTY; FRAME_PIX],
                map_dirty: true,
                version: 0,
                xskip,
                yskip,
                max_zone: -1,
                occupied: 0,
                oor_total: 0,
            }),
        }
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, CatalogState> {
        // A poisoned catalog lock means a panic mid-update; propagate.
        self.inner.lock().expect("zone catalog lock poisoned")
    }

    /// Adds a new rectangular zone. Dimensions are world-space millimeters.
    pub fn add(&self, name: &str, coords: [i32; 6]) -> Result<()> {
        validate_name(name)?;
        validate_box(coords)?;

        let mut state = self.lock();
        if state.zones.iter().any(|z| z.name.eq_ignore_ascii_case(name)) {
            return Err(Error::conflict(format!("Zone \"{name}\" already exists.")));
        }

        state.zones.push(Zone::new(name));
        let idx = state.zones.len() - 1;
        if let Err(e) = state.set_zone_box(idx, coords) {
            state.zones.pop();
            return Err(e);
        }

        let zone = &mut state.zones[idx];
        zone.param = Param::Pop;
        zone.rising_threshold = Param::Pop.info().def_rising;
        zone.falling_threshold = Param::Pop.info().def_falling;
        zone.rising_delay = 1;
        zone.falling_delay = 1;

        Ok(())
    }

    /// Reassigns all six world coordinates of a zone.
    pub fn set_box(&self, name: &str, coords: [i32; 6]) -> Result<()> {
        let mut state = self.lock();
        let idx = state
            .find(name)
            .ok_or_else(|| Error::not_found(format!("Zone \"{name}\" does not exist.")))?;
        state.set_zone_box(idx, coords)
    }

    /// Sets one named attribute from its string value. Measured values
    /// (pop, maxpop, xc, yc, zc, sa, occupied) and the name are read-only.
    pub fn set_attr(&self, name: &str, attr: &str, value: &str) -> Result<()> {
        let mut state = self.lock();
        let idx = state
            .find(name)
            .ok_or_else(|| Error::not_found(format!("Zone \"{name}\" does not exist.")))?;

        let ival = parse_value(value);
        let mut recalc = Recalc::None;
        let zone = &mut state.zones[idx];

        match attr {
            "xmin" => {
                zone.xmin = ival;
                if zone.xmax <= zone.xmin {
                    zone.xmax = zone.xmin + 1;
                }
                recalc = Recalc::Screen;
            }
            "xmax" => {
                zone.xmax = ival;
                if zone.xmin >= zone.xmax {
                    zone.xmin = zone.xmax - 1;
                }
                recalc = Recalc::Screen;
            }
            "ymin" => {
                zone.ymin = ival;
                if zone.ymax <= zone.ymin {
                    zone.ymax = zone.ymin + 1;
                }
                recalc = Recalc::Screen;
            }
            "ymax" => {
                zone.ymax = ival;
                if zone.ymin >= zone.ymax {
                    zone.ymin = zone.ymax - 1;
                }
                recalc = Recalc::Screen;
            }
            "zmin" => {
                if ival <= 0 {
                    return Err(Error::invalid("Zmin must be > 0."));
                }
                zone.zmin = ival;
                if zone.zmax <= zone.zmin {
                    zone.zmax = zone.zmin + 1;
                }
                recalc = Recalc::Screen;
            }
            "zmax" => {
                if ival <= 1 {
                    return Err(Error::invalid("Zmax must be > 1."));
                }
                zone.zmax = ival;
                if zone.zmin >= zone.zmax {
                    zone.zmin = zone.zmax - 1;
                }
                recalc = Recalc::Screen;
            }
            "px_xmin" => {
                if ival < 0 || ival > FRAME_W - 2 {
                    return Err(Error::invalid(format!(
                        "px_xmin must be between 0 and {}",
                        FRAME_W - 2
                    )));
                }
                zone.px_xmin = ival;
                if zone.px_xmax <= zone.px_xmin {
                    zone.px_xmax = zone.px_xmin + 1;
                }
                recalc = Recalc::World;
            }
            "px_xmax" => {
                if ival < 1 || ival > FRAME_W - 1 {
                    return Err(Error::invalid(format!(
                        "px_xmax must be between 1 and {}",
                        FRAME_W - 1
                    )));
                }
                zone.px_xmax = ival;
                if zone.px_xmin >= zone.px_xmax {
                    zone.px_xmin = zone.px_xmax - 1;
                }
                recalc = Recalc::World;
            }
            "px_ymin" => {
                if ival < 0 || ival > FRAME_H - 2 {
                    return Err(Error::invalid(format!(
                        "px_ymin must be between 0 and {}",
                        FRAME_H - 2
                    )));
                }
                zone.px_ymin = ival;
                if zone.px_ymax <= zone.px_ymin {
                    zone.px_ymax = zone.px_ymin + 1;
                }
                recalc = Recalc::World;
            }
            "px_ymax" => {
                if ival < 1 || ival > FRAME_H - 1 {
                    return Err(Error::invalid(format!(
                        "px_ymax must be between 1 and {} inclusive.",
                        FRAME_H - 1
                    )));
                }
                zone.px_ymax = ival;
                if zone.px_ymin >= zone.px_ymax {
                    zone.px_ymin = zone.px_ymax - 1;
                }
                recalc = Recalc::World;
            }
            "px_zmin" => {
                if ival < 0 || ival > crate::lut::PXZMAX as i32 {
                    return Err(Error::invalid(format!(
                        "px_zmin must be between 0 and {} inclusive.",
                        crate::lut::PXZMAX
                    )));
                }
                zone.px_zmin = ival;
                if zone.px_zmax < zone.px_zmin {
                    zone.px_zmax = zone.px_zmin;
                }
                recalc = Recalc::World;
            }
            "px_zmax" => {
                if ival < 0 || ival > crate::lut::PXZMAX as i32 {
                    return Err(Error::invalid(format!(
                        "px_zmax must be between 0 and {} inclusive.",
                        crate::lut::PXZMAX
                    )));
                }
                zone.px_zmax = ival;
                if zone.px_zmin > zone.px_zmax {
                    zone.px_zmin = zone.px_zmax;
                }
                recalc = Recalc::World;
            }
            "negate" => {
                if ival != 0 && ival != 1 {
                    return Err(Error::invalid("negate must be 0 or 1."));
                }
                zone.negate = ival != 0;
                // Reported state is occupied XOR negate; keep it false at the
                // moment of the change.
                zone.occupied = zone.negate;
            }
            "param" => {
                let param = Param::from_name(value).ok_or_else(|| {
                    Error::invalid(format!("Invalid zone control parameter: \"{value}\""))
                })?;
                zone.param = param;
                zone.occupied = false;
                zone.count = 0;
                zone.rising_threshold = param.info().def_rising;
                zone.falling_threshold = param.info().def_falling;
            }
            "on_level" => {
                let range = zone.param.info();
                zone.rising_threshold = ival.clamp(range.min, range.max);
                if zone.falling_threshold > zone.rising_threshold {
                    zone.falling_threshold = zone.rising_threshold;
                }
            }
            "off_level" => {
                let range = zone.param.info();
                zone.falling_threshold = ival.clamp(range.min, range.max);
                if zone.rising_threshold < zone.falling_threshold {
                    zone.rising_threshold = zone.falling_threshold;
                }
            }
            "on_delay" => {
                zone.rising_delay = ival.max(0);
            }
            "off_delay" => {
                zone.falling_delay = ival.max(0);
            }
            "name" | "pop" | "maxpop" | "xc" | "yc" | "zc" | "sa" | "occupied" => {
                return Err(Error::invalid(format!("Attribute \"{attr}\" is read-only.")));
            }
            _ => {
                return Err(Error::invalid(format!("Unknown attribute: \"{attr}\"")));
            }
        }

        match recalc {
            Recalc::Screen => zone.recalc_screen_from_world(),
            Recalc::World => zone.recalc_world_from_screen(),
            Recalc::None => {}
        }

        zone.update_maxpop();
        zone.new_zone = true;

        state.bump();
        Ok(())
    }

    /// Removes a zone by exact name.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        let idx = state
            .find(name)
            .ok_or_else(|| Error::not_found(format!("Zone \"{name}\" not found.")))?;
        state.zones.remove(idx);
        state.bump();
        Ok(())
    }

    /// Removes all zones.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.zones.clear();
        state.bump();
    }

    /// Calls `f` for each zone while the catalog is locked. The catalog must
    /// not be reentered from the callback.
    pub fn for_each<F: FnMut(&Zone)>(&self, mut f: F) {
        let state = self.lock();
        for zone in &state.zones {
            f(zone);
        }
    }

    /// Whether a zone with this exact name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.lock().find(name).is_some()
    }

    /// Clears new-zone flags and snapshots pop/occupied for the next
    /// differential subscription pass.
    pub fn touch(&self) {
        let mut state = self.lock();
        for zone in &mut state.zones {
            zone.new_zone = false;
            zone.lastpop = zone.pop;
            zone.lastoccupied = zone.occupied;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of occupied zones after the most recent depth pass.
    pub fn occupied_count(&self) -> i32 {
        self.lock().occupied
    }

    /// Out-of-range sample total from the most recent depth pass.
    pub fn oor_total(&self) -> i32 {
        self.lock().oor_total
    }

    /// Index and name of the zone with the highest surface area, or
    /// `(-1, None)` when no zone qualifies.
    pub fn peak(&self) -> (i32, Option<String>) {
        let state = self.lock();
        if state.max_zone >= 0 {
            let name = state.zones[state.max_zone as usize].name.clone();
            (state.max_zone, Some(name))
        } else {
            (-1, None)
        }
    }

    /// Current catalog version.
    pub fn version(&self) -> u32 {
        self.lock().version
    }

    /// Increments the catalog version.
    pub fn bump_version(&self) -> u32 {
        self.lock().bump()
    }

    /// Restores tuning fields from a persisted record. Does not reset the
    /// zone's live state or bump the version; callers record the version
    /// after a whole load pass.
    pub(crate) fn load_tuning(
        &self,
        name: &str,
        param: i32,
        rising: i32,
        falling: i32,
        rising_delay: i32,
        falling_delay: i32,
    ) -> Result<()> {
        let mut state = self.lock();
        let idx = state
            .find(name)
            .ok_or_else(|| Error::not_found(format!("Zone \"{name}\" does not exist.")))?;
        let param = Param::from_index(param)
            .ok_or_else(|| Error::invalid(format!("Invalid zone parameter index {param}")))?;
        let zone = &mut state.zones[idx];
        zone.param = param;
        zone.rising_threshold = rising;
        zone.falling_threshold = falling;
        zone.rising_delay = rising_delay;
        zone.falling_delay = falling_delay;
        Ok(())
    }
}
