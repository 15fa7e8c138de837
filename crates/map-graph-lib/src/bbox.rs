//! Geographic bounding boxes
//!
//! [`BBox`] wraps a [`geo::Rect`] in WGS84 degrees (x = longitude, y = latitude) and adds
//! the notion of an empty box, which is what a way without nodes or a node with unknown
//! coordinates covers.

use geo::{Coord, Rect};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// An axis-aligned bounding box in WGS84 degrees, possibly empty
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BBox {
    rect: Option<Rect<f64>>,
}

impl BBox {
    /// The world tile: longitude -180..180, latitude -90..90
    pub fn world() -> Self {
        Self::new(-180.0, -90.0, 180.0, 90.0)
    }

    /// An empty box that intersects nothing
    pub const fn empty() -> Self {
        Self { rect: None }
    }

    /// Create a box from two corners given as (lon, lat); corners are normalized
    pub fn new(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> Self {
        Self {
            rect: Some(Rect::new(
                Coord { x: lon1, y: lat1 },
                Coord { x: lon2, y: lat2 },
            )),
        }
    }

    /// A degenerate box covering a single coordinate
    pub fn from_point(lat: f64, lon: f64) -> Self {
        Self::new(lon, lat, lon, lat)
    }

    /// Wrap an existing rectangle (x = longitude, y = latitude)
    pub fn from_rect(rect: Rect<f64>) -> Self {
        Self { rect: Some(rect) }
    }

    /// The underlying rectangle, `None` if the box is empty
    #[inline]
    pub fn rect(&self) -> Option<Rect<f64>> {
        self.rect
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rect.is_none()
    }

    /// Minimum corner as (lon, lat)
    pub fn min(&self) -> Option<Coord<f64>> {
        self.rect.map(|r| r.min())
    }

    /// Maximum corner as (lon, lat)
    pub fn max(&self) -> Option<Coord<f64>> {
        self.rect.map(|r| r.max())
    }

    /// Whether the box is a single coordinate
    pub fn is_point(&self) -> bool {
        self.rect.is_some_and(|r| r.min() == r.max())
    }

    /// Grow the box so it covers the given coordinate
    pub fn add_point(&mut self, lat: f64, lon: f64) {
        self.add(&BBox::from_point(lat, lon));
    }

    /// Grow the box so it covers `other`
    pub fn add(&mut self, other: &BBox) {
        self.rect = match (self.rect, other.rect) {
            (None, r) | (r, None) => r,
            (Some(a), Some(b)) => Some(Rect::new(
                Coord {
                    x: a.min().x.min(b.min().x),
                    y: a.min().y.min(b.min().y),
                },
                Coord {
                    x: a.max().x.max(b.max().x),
                    y: a.max().y.max(b.max().y),
                },
            )),
        };
    }

    /// The union of two boxes
    pub fn union(mut self, other: &BBox) -> BBox {
        self.add(other);
        self
    }

    /// Whether two boxes share at least one coordinate (edges included)
    pub fn intersects(&self, other: &BBox) -> bool {
        match (self.rect, other.rect) {
            (Some(a), Some(b)) => {
                !(a.max().x < b.min().x
                    || a.min().x > b.max().x
                    || a.max().y < b.min().y
                    || a.min().y > b.max().y)
            }
            _ => false,
        }
    }

    /// Whether `other` lies completely inside this box
    pub fn bounds(&self, other: &BBox) -> bool {
        match (self.rect, other.rect) {
            (Some(a), Some(b)) => {
                a.min().x <= b.min().x
                    && a.min().y <= b.min().y
                    && a.max().x >= b.max().x
                    && a.max().y >= b.max().y
            }
            _ => false,
        }
    }

    /// Whether the coordinate lies inside the box (edges included)
    pub fn contains_point(&self, lat: f64, lon: f64) -> bool {
        self.rect.is_some_and(|r| {
            lon >= r.min().x && lon <= r.max().x && lat >= r.min().y && lat <= r.max().y
        })
    }

    /// Center of the box as (lat, lon)
    pub fn center(&self) -> Option<(f64, f64)> {
        self.rect.map(|r| {
            let c = r.center();
            (c.y, c.x)
        })
    }
}

impl From<Rect<f64>> for BBox {
    fn from(rect: Rect<f64>) -> Self {
        BBox::from_rect(rect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_box_intersects_nothing() {
        let empty = BBox::empty();
        assert!(empty.is_empty());
        assert!(!empty.intersects(&BBox::world()));
        assert!(!BBox::world().intersects(&empty));
        assert!(!BBox::world().bounds(&empty));
    }

    #[test]
    fn test_add_grows_box() {
        let mut bbox = BBox::empty();
        bbox.add_point(10.0, 20.0);
        assert!(bbox.is_point());
        bbox.add_point(-5.0, 30.0);

        assert_eq!(bbox.min(), Some(Coord { x: 20.0, y: -5.0 }));
        assert_eq!(bbox.max(), Some(Coord { x: 30.0, y: 10.0 }));
        assert!(!bbox.is_point());
    }

    #[test]
    fn test_new_normalizes_corners() {
        let bbox = BBox::new(10.0, 10.0, 0.0, 0.0);
        assert_eq!(bbox.min(), Some(Coord { x: 0.0, y: 0.0 }));
        assert_eq!(bbox.max(), Some(Coord { x: 10.0, y: 10.0 }));
    }

    #[test]
    fn test_intersects_and_bounds() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 5.0, 15.0, 15.0);
        let c = BBox::new(2.0, 2.0, 3.0, 3.0);
        let d = BBox::new(20.0, 20.0, 30.0, 30.0);

        assert!(a.intersects(&b));
        assert!(a.bounds(&c));
        assert!(!a.bounds(&b));
        assert!(!a.intersects(&d));

        // Touching edges count as intersecting
        let edge = BBox::new(10.0, 0.0, 12.0, 10.0);
        assert!(a.intersects(&edge));
    }

    #[test]
    fn test_contains_point() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        assert!(a.contains_point(5.0, 5.0));
        assert!(a.contains_point(10.0, 0.0));
        assert!(!a.contains_point(11.0, 5.0));
        assert!(!BBox::empty().contains_point(0.0, 0.0));
    }

    #[test]
    fn test_center() {
        let a = BBox::new(0.0, 0.0, 10.0, 20.0);
        assert_eq!(a.center(), Some((10.0, 5.0)));
        assert_eq!(BBox::empty().center(), None);
    }
}
