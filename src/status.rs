//! Control status: the aiding configuration the core reads every cycle.
//!
//! Mutually exclusive choices are enums so an illegal combination (two height
//! sources, heading and 3-axis magnetometer fusion together, magnetometer
//! fusion while vision supplies yaw) cannot be represented. Orthogonal
//! concerns stay plain booleans.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeightSource {
    #[default]
    Baro,
    Gps,
    Range,
    Vision,
}

impl HeightSource {
    pub fn label(self) -> &'static str {
        match self {
            Self::Baro => "baro",
            Self::Gps => "GPS",
            Self::Range => "rng",
            Self::Vision => "ev",
        }
    }
}

/// Magnetometer fusion mode while the magnetometer owns yaw.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MagMode {
    #[default]
    Off,
    Heading,
    ThreeAxis,
}

/// Which sensor family may observe yaw.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YawSource {
    Magnetometer(MagMode),
    Vision,
}

impl Default for YawSource {
    fn default() -> Self {
        Self::Magnetometer(MagMode::Off)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlStatus {
    pub tilt_align: bool,
    pub yaw_align: bool,
    pub gps: bool,
    pub opt_flow: bool,
    pub ev_pos: bool,
    pub in_air: bool,
    pub wind: bool,
    pub height: HeightSource,
    yaw: YawSource,
    mag_dec: bool,
}

// Bit positions of the packed status word.
const BIT_TILT_ALIGN: u32 = 0;
const BIT_YAW_ALIGN: u32 = 1;
const BIT_GPS: u32 = 2;
const BIT_OPT_FLOW: u32 = 3;
const BIT_MAG_HDG: u32 = 4;
const BIT_MAG_3D: u32 = 5;
const BIT_MAG_DEC: u32 = 6;
const BIT_IN_AIR: u32 = 7;
const BIT_WIND: u32 = 8;
const BIT_BARO_HGT: u32 = 9;
const BIT_RNG_HGT: u32 = 10;
const BIT_GPS_HGT: u32 = 11;
const BIT_EV_POS: u32 = 12;
const BIT_EV_YAW: u32 = 13;
const BIT_EV_HGT: u32 = 14;

impl ControlStatus {
    pub fn yaw_source(&self) -> YawSource {
        self.yaw
    }

    pub fn mag_mode(&self) -> MagMode {
        match self.yaw {
            YawSource::Magnetometer(mode) => mode,
            YawSource::Vision => MagMode::Off,
        }
    }

    pub fn ev_yaw(&self) -> bool {
        self.yaw == YawSource::Vision
    }

    pub fn mag_hdg(&self) -> bool {
        self.mag_mode() == MagMode::Heading
    }

    pub fn mag_3d(&self) -> bool {
        self.mag_mode() == MagMode::ThreeAxis
    }

    pub fn mag_dec(&self) -> bool {
        self.mag_dec
    }

    /// Hand yaw observation to external vision. Clears every magnetometer mode
    /// and declination fusion in the same step.
    pub fn claim_vision_yaw(&mut self) {
        self.yaw = YawSource::Vision;
        self.mag_dec = false;
    }

    /// Select a magnetometer mode. Ignored while vision owns yaw.
    pub fn set_mag_mode(&mut self, mode: MagMode) -> bool {
        if self.ev_yaw() {
            return false;
        }
        self.yaw = YawSource::Magnetometer(mode);
        true
    }

    /// Declination fusion only exists alongside 3-axis magnetometer fusion.
    pub fn set_mag_dec(&mut self, fuse: bool) {
        self.mag_dec = fuse && self.mag_3d();
    }

    pub fn height_is(&self, source: HeightSource) -> bool {
        self.height == source
    }

    /// Pack into the telemetry status word.
    pub fn bits(&self) -> u32 {
        let flags = [
            (BIT_TILT_ALIGN, self.tilt_align),
            (BIT_YAW_ALIGN, self.yaw_align),
            (BIT_GPS, self.gps),
            (BIT_OPT_FLOW, self.opt_flow),
            (BIT_MAG_HDG, self.mag_hdg()),
            (BIT_MAG_3D, self.mag_3d()),
            (BIT_MAG_DEC, self.mag_dec),
            (BIT_IN_AIR, self.in_air),
            (BIT_WIND, self.wind),
            (BIT_BARO_HGT, self.height == HeightSource::Baro),
            (BIT_RNG_HGT, self.height == HeightSource::Range),
            (BIT_GPS_HGT, self.height == HeightSource::Gps),
            (BIT_EV_POS, self.ev_pos),
            (BIT_EV_YAW, self.ev_yaw()),
            (BIT_EV_HGT, self.height == HeightSource::Vision),
        ];
        flags
            .iter()
            .filter(|(_, set)| *set)
            .fold(0, |word, (bit, _)| word | (1 << bit))
    }

    /// Flags that differ between `prev` and `self`, as `(name, now_set)`.
    pub fn transitions(&self, prev: &ControlStatus) -> Vec<(&'static str, bool)> {
        const NAMES: [(&str, u32); 15] = [
            ("tilt_align", BIT_TILT_ALIGN),
            ("yaw_align", BIT_YAW_ALIGN),
            ("gps", BIT_GPS),
            ("opt_flow", BIT_OPT_FLOW),
            ("mag_hdg", BIT_MAG_HDG),
            ("mag_3D", BIT_MAG_3D),
            ("mag_dec", BIT_MAG_DEC),
            ("in_air", BIT_IN_AIR),
            ("wind", BIT_WIND),
            ("baro_hgt", BIT_BARO_HGT),
            ("rng_hgt", BIT_RNG_HGT),
            ("gps_hgt", BIT_GPS_HGT),
            ("ev_pos", BIT_EV_POS),
            ("ev_yaw", BIT_EV_YAW),
            ("ev_hgt", BIT_EV_HGT),
        ];
        let (now, before) = (self.bits(), prev.bits());
        let changed = now ^ before;
        NAMES
            .iter()
            .filter(|(_, bit)| changed & (1 << bit) != 0)
            .map(|(name, bit)| (*name, now & (1 << bit) != 0))
            .collect()
    }
}
