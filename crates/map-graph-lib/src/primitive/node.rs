use super::{IdGenerator, PrimitiveCommon, PrimitiveKind};
use crate::{BBox, Result, utils};
use geo::Point;
use std::ops::{Deref, DerefMut};
use std::sync::OnceLock;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A WGS84 coordinate in degrees
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Whether the coordinate lies on the globe
    pub fn is_valid(&self) -> bool {
        utils::is_valid_wgs84(self.lat, self.lon)
    }

    /// Whether both coordinates differ by less than `epsilon` degrees on each axis
    pub fn equals_epsilon(&self, other: &LatLon, epsilon: f64) -> bool {
        (self.lat - other.lat).abs() <= epsilon && (self.lon - other.lon).abs() <= epsilon
    }

    /// The coordinate rounded to the precision stored by the server
    pub fn rounded(&self) -> LatLon {
        LatLon::new(
            utils::round_to_server_precision(self.lat),
            utils::round_to_server_precision(self.lon),
        )
    }

    pub fn to_bbox(&self) -> BBox {
        BBox::from_point(self.lat, self.lon)
    }
}

/// A point primitive
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) common: PrimitiveCommon,
    /// `None` while the position is unknown
    coor: Option<LatLon>,
    /// Web Mercator projection of `coor`, computed on first use
    projected: OnceLock<Point<f64>>,
}

impl Node {
    /// A new local node with an id from `ids`
    pub fn new_local(ids: &IdGenerator) -> Self {
        Self::from_common(PrimitiveCommon::new_local(PrimitiveKind::Node, ids))
    }

    /// A node with a given id; a positive id with version 0 is incomplete
    pub fn with_id(id: i64, version: u32) -> Result<Self> {
        Ok(Self::from_common(PrimitiveCommon::new(
            PrimitiveKind::Node,
            id,
            version,
        )?))
    }

    pub(crate) fn from_common(common: PrimitiveCommon) -> Self {
        Self {
            common,
            coor: None,
            projected: OnceLock::new(),
        }
    }

    /// Builder: set the position, which also makes the node complete
    pub fn with_coor(mut self, coor: LatLon) -> Self {
        self.set_coor(Some(coor));
        self.common.set_incomplete(false);
        self
    }

    /// Builder: set a tag
    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.common.put(key, Some(value));
        self
    }

    #[inline]
    pub fn coor(&self) -> Option<LatLon> {
        self.coor
    }

    pub fn is_latlon_known(&self) -> bool {
        self.coor.is_some()
    }

    /// Move the node; the projection cache is invalidated
    pub fn set_coor(&mut self, coor: Option<LatLon>) {
        self.coor = coor;
        self.projected = OnceLock::new();
    }

    /// Web Mercator position in meters
    pub fn east_north(&self) -> Option<Point<f64>> {
        let coor = self.coor?;
        Some(
            *self
                .projected
                .get_or_init(|| utils::wgs84_to_mercator(coor.lat, coor.lon)),
        )
    }

    /// Degenerate box at the node's position, empty when the position is unknown
    pub fn bbox(&self) -> BBox {
        self.coor.map(|c| c.to_bbox()).unwrap_or_default()
    }
}

impl Deref for Node {
    type Target = PrimitiveCommon;

    fn deref(&self) -> &PrimitiveCommon {
        &self.common
    }
}

impl DerefMut for Node {
    fn deref_mut(&mut self) -> &mut PrimitiveCommon {
        &mut self.common
    }
}
