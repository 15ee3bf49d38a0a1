//! Zone types and world/screen coordinate conversion.
//!
//! A zone is a named rectangular volume in front of the sensor, described
//! both in world-space millimeters and in on-screen pixel + raw-depth
//! coordinates. The two descriptions are kept synchronized: assigning one
//! recomputes the other through the fixed-point projection below and the
//! depth look-up table.

pub(crate) mod catalog;
mod occupancy;

pub use catalog::ZoneCatalog;

use crate::lut;
use crate::{FRAME_H, FRAME_W};

/// Maximum zone name length in bytes (excluding terminator semantics).
pub const ZONE_NAME_LENGTH: usize = 127;

/// Measure that drives a zone's occupancy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Pop,
    Sa,
    Bright,
    Xc,
    Yc,
    Zc,
}

/// Acceptable range and default thresholds for an occupancy parameter.
pub struct ParamInfo {
    pub name: &'static str,
    pub min: i32,
    pub max: i32,
    pub def_rising: i32,
    pub def_falling: i32,
}

static PARAM_RANGES: [ParamInfo; 6] = [
    ParamInfo { name: "pop", min: 0, max: crate::FRAME_PIX as i32, def_rising: 160, def_falling: 140 },
    ParamInfo { name: "sa", min: 0, max: crate::FRAME_PIX as i32 * 150, def_rising: 3000, def_falling: 1000 }, // mm^2
    ParamInfo { name: "bright", min: 0, max: 1000, def_rising: 350, def_falling: 150 },
    ParamInfo { name: "xc", min: 0, max: 1000, def_rising: 600, def_falling: 400 },
    ParamInfo { name: "yc", min: 0, max: 1000, def_rising: 600, def_falling: 400 },
    ParamInfo { name: "zc", min: 0, max: 1000, def_rising: 600, def_falling: 400 },
];

impl Param {
    pub fn info(self) -> &'static ParamInfo {
        &PARAM_RANGES[self.index() as usize]
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "pop" => Some(Param::Pop),
            "sa" => Some(Param::Sa),
            "bright" => Some(Param::Bright),
            "xc" => Some(Param::Xc),
            "yc" => Some(Param::Yc),
            "zc" => Some(Param::Zc),
            _ => None,
        }
    }

    /// Stable numeric code used by the persistence format.
    pub fn index(self) -> i32 {
        match self {
            Param::Pop => 0,
            Param::Sa => 1,
            Param::Bright => 2,
            Param::Xc => 3,
            Param::Yc => 4,
            Param::Zc => 5,
        }
    }

    pub fn from_index(index: i32) -> Option<Self> {
        match index {
            0 => Some(Param::Pop),
            1 => Some(Param::Sa),
            2 => Some(Param::Bright),
            3 => Some(Param::Xc),
            4 => Some(Param::Yc),
            5 => Some(Param::Zc),
            _ => None,
        }
    }
}

/// A named rectangular detection volume.
#[derive(Debug, Clone)]
pub struct Zone {
    pub name: String,
    /// Not yet announced to subscribers with full attributes.
    pub new_zone: bool,

    // Bounding box (dimensions in world-space millimeters)
    pub xmin: i32,
    pub xmax: i32,
    pub ymin: i32,
    pub ymax: i32,
    pub zmin: i32,
    pub zmax: i32,

    // On-screen bounding box (in pixels and nonlinear depth units)
    pub px_xmin: i32,
    pub px_xmax: i32,
    pub px_ymin: i32,
    pub px_ymax: i32,
    pub px_zmin: i32,
    pub px_zmax: i32,

    // Zone population
    pub maxpop: i32,
    pub lastpop: i32,
    pub pop: i32,
    // Center-of-gravity accumulators, weighted by sample count
    pub xsum: i64,
    pub ysum: i64,
    pub zsum: i64,

    pub occupied: bool,
    pub lastoccupied: bool,

    /// Reverse the reported occupied flag if true.
    pub negate: bool,
    pub param: Param,
    pub rising_threshold: i32,
    pub falling_threshold: i32,
    /// Continuous qualifying frames required before flipping on/off.
    pub rising_delay: i32,
    pub falling_delay: i32,
    /// Frames seen so far while waiting for a delay to expire.
    pub count: i32,

    // Brightness accumulator from video
    pub bsum: i64,
}

impl Zone {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            new_zone: true,
            xmin: 0,
            xmax: 0,
            ymin: 0,
            ymax: 0,
            zmin: 0,
            zmax: 0,
            px_xmin: 0,
            px_xmax: 0,
            px_ymin: 0,
            px_ymax: 0,
            px_zmin: 0,
            px_zmax: 0,
            maxpop: 1,
            lastpop: -1,
            pop: 0,
            xsum: 0,
            ysum: 0,
            zsum: 0,
            occupied: false,
            lastoccupied: false,
            negate: false,
            param: Param::Pop,
            rising_threshold: PARAM_RANGES[0].def_rising,
            falling_threshold: PARAM_RANGES[0].def_falling,
            rising_delay: 1,
            falling_delay: 1,
            count: 0,
            bsum: 0,
        }
    }

    /// Proportional X-axis center of gravity, 0-1000, or -1 when empty.
    #[inline]
    pub fn xc(&self) -> i32 {
        if self.pop > 0 {
            ((self.xsum / self.pop as i64 - self.xmin as i64) * 1000
                / (self.xmax - self.xmin) as i64) as i32
        } else {
            -1
        }
    }

    /// Proportional Y-axis center of gravity, 0-1000, or -1 when empty.
    #[inline]
    pub fn yc(&self) -> i32 {
        if self.pop > 0 {
            ((self.ysum / self.pop as i64 - self.ymin as i64) * 1000
                / (self.ymax - self.ymin) as i64) as i32
        } else {
            -1
        }
    }

    /// Proportional Z-axis center of gravity, 0-1000, or -1 when empty.
    #[inline]
    pub fn zc(&self) -> i32 {
        if self.pop > 0 {
            ((self.zsum / self.pop as i64 - self.zmin as i64) * 1000
                / (self.zmax - self.zmin) as i64) as i32
        } else {
            -1
        }
    }

    /// Approximate occupied surface area in mm^2 (accurate to 3-4 digits).
    #[inline]
    pub fn sa(&self) -> i32 {
        if self.pop > 0 {
            (self.pop as f32 * lut::surface_area(self.zsum as f32 / self.pop as f32)) as i32
        } else {
            0
        }
    }

    /// Average brightness scaled by screen-space area, 0-1000ish.
    #[inline]
    pub fn bright(&self) -> i32 {
        (self.bsum * 256 / self.maxpop as i64) as i32
    }

    /// Recomputes the screen-space pixel area normalizer. Never zero.
    pub(crate) fn update_maxpop(&mut self) {
        self.maxpop = (self.px_ymax - self.px_ymin) * (self.px_xmax - self.px_xmin);
        if self.maxpop <= 0 {
            self.maxpop = 1;
        }
    }

    /// Recalculates world coordinates from the screen box. The endpoint of
    /// the zone farthest from the optical axis comes from the near depth on
    /// that side of the frame.
    pub(crate) fn recalc_world_from_screen(&mut self) {
        self.xmin = xworld(
            self.px_xmax,
            if self.px_xmax < FRAME_W / 2 { self.zmax } else { self.zmin },
        );
        self.xmax = xworld(
            self.px_xmin,
            if self.px_xmin < FRAME_W / 2 { self.zmin } else { self.zmax },
        );
        self.ymin = yworld(
            self.px_ymax,
            if self.px_ymax < FRAME_H / 2 { self.zmax } else { self.zmin },
        );
        self.ymax = yworld(
            self.px_ymin,
            if self.px_ymin < FRAME_H / 2 { self.zmin } else { self.zmax },
        );
        self.zmin = lut::depth_mm(self.px_zmin as usize);
        self.zmax = lut::depth_mm(self.px_zmax as usize);
    }

    /// Recalculates the screen box from world coordinates.
    pub(crate) fn recalc_screen_from_world(&mut self) {
        self.px_xmin = xscreen(self.xmax, if self.xmax >= 0 { self.zmin } else { self.zmax })
            .clamp(0, FRAME_W - 1);
        self.px_xmax = xscreen(self.xmin, if self.xmin >= 0 { self.zmax } else { self.zmin })
            .clamp(0, FRAME_W - 1);
        self.px_ymin = yscreen(self.ymax, if self.ymax >= 0 { self.zmin } else { self.zmax })
            .clamp(0, FRAME_H - 1);
        self.px_ymax = yscreen(self.ymin, if self.ymin >= 0 { self.zmax } else { self.zmin })
            .clamp(0, FRAME_H - 1);
        self.px_zmin = lut::reverse_lut(self.zmin) as i32;
        self.px_zmax = lut::reverse_lut(self.zmax) as i32;
    }
}

/// Converts x in pixels and z in world millimeters to x in world millimeters.
///
/// tan 28 ~= .53171 (1089 ~= .53171 * 2048); 0xcccd is the ~reciprocal of 10
/// (factor of W/2=320). 2^34 is added for rounding before the shift. The
/// shift of 35 accounts for 11 bits of tangent scale, 19 bits of reciprocal
/// multiplication by 1/10, and 5 bits for division by 32.
#[inline]
pub fn xworld(x: i32, zw: i32) -> i32 {
    ((zw as i64 * (320 - x) as i64 * 1089 * 0xcccd + 0x4_0000_0000) >> 35) as i32
}

/// Converts y in pixels and z in world millimeters to y in world millimeters.
#[inline]
pub fn yworld(y: i32, zw: i32) -> i32 {
    xworld(y + (FRAME_W - FRAME_H) / 2, zw)
}

/// Converts x and z in world millimeters to x in pixels.
#[inline]
pub fn xscreen(xw: i32, zw: i32) -> i32 {
    (320 - ((xw as i64) << 35) / (1089 * 0xcccd * zw as i64)) as i32
}

/// Converts y and z in world millimeters to y in pixels.
#[inline]
pub fn yscreen(yw: i32, zw: i32) -> i32 {
    xscreen(yw, zw) - (FRAME_W - FRAME_H) / 2
}
