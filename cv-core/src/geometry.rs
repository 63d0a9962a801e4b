use nalgebra::{Point2, Point3, Unit, Vector2};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// An axis aligned 2D box, e.g. an image region.
///
/// A box built from no points is invalid, see [`Box2::is_valid`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Box2 {
    pub lower: Point2<f64>,
    pub upper: Point2<f64>,
}

impl Default for Box2 {
    fn default() -> Self {
        Self::invalid()
    }
}

impl Box2 {
    pub fn new(lower: Point2<f64>, upper: Point2<f64>) -> Self {
        Self { lower, upper }
    }

    pub fn invalid() -> Self {
        Self {
            lower: Point2::new(f64::MAX, f64::MAX),
            upper: Point2::new(f64::MIN, f64::MIN),
        }
    }

    pub fn from_points(points: impl IntoIterator<Item = Point2<f64>>) -> Self {
        points.into_iter().fold(Self::invalid(), |mut acc, point| {
            acc.lower = acc.lower.inf(&point);
            acc.upper = acc.upper.sup(&point);
            acc
        })
    }

    pub fn is_valid(&self) -> bool {
        self.lower.x <= self.upper.x && self.lower.y <= self.upper.y
    }

    pub fn width(&self) -> f64 {
        (self.upper.x - self.lower.x).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.upper.y - self.lower.y).max(0.0)
    }

    pub fn contains(&self, point: &Point2<f64>) -> bool {
        point.x >= self.lower.x
            && point.y >= self.lower.y
            && point.x <= self.upper.x
            && point.y <= self.upper.y
    }

    /// The overlapping area of two boxes, invalid if they do not overlap.
    pub fn intersection(&self, other: &Box2) -> Box2 {
        Box2 {
            lower: self.lower.sup(&other.lower),
            upper: self.upper.inf(&other.upper),
        }
    }
}

/// An axis aligned 3D box, e.g. the bounds of a feature map.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Box3 {
    pub lower: Point3<f64>,
    pub upper: Point3<f64>,
}

impl Default for Box3 {
    fn default() -> Self {
        Self::invalid()
    }
}

impl Box3 {
    pub fn new(lower: Point3<f64>, upper: Point3<f64>) -> Self {
        Self { lower, upper }
    }

    pub fn invalid() -> Self {
        Self {
            lower: Point3::new(f64::MAX, f64::MAX, f64::MAX),
            upper: Point3::new(f64::MIN, f64::MIN, f64::MIN),
        }
    }

    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point3<f64>>) -> Self {
        points.into_iter().fold(Self::invalid(), |mut acc, point| {
            acc.lower = acc.lower.inf(point);
            acc.upper = acc.upper.sup(point);
            acc
        })
    }

    pub fn is_valid(&self) -> bool {
        self.lower.x <= self.upper.x && self.lower.y <= self.upper.y && self.lower.z <= self.upper.z
    }

    pub fn center(&self) -> Point3<f64> {
        nalgebra::center(&self.lower, &self.upper)
    }

    /// Length of the diagonal, zero for an invalid box.
    pub fn diagonal(&self) -> f64 {
        if self.is_valid() {
            (self.upper - self.lower).norm()
        } else {
            0.0
        }
    }

    pub fn corners(&self) -> [Point3<f64>; 8] {
        let (l, u) = (self.lower, self.upper);
        [
            Point3::new(l.x, l.y, l.z),
            Point3::new(u.x, l.y, l.z),
            Point3::new(l.x, u.y, l.z),
            Point3::new(u.x, u.y, l.z),
            Point3::new(l.x, l.y, u.z),
            Point3::new(u.x, l.y, u.z),
            Point3::new(l.x, u.y, u.z),
            Point3::new(u.x, u.y, u.z),
        ]
    }
}

/// An infinite 2D line through `point` along `direction`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Line2 {
    pub point: Point2<f64>,
    pub direction: Unit<Vector2<f64>>,
}

impl Line2 {
    /// Creates the line through two distinct points.
    pub fn through(a: Point2<f64>, b: Point2<f64>) -> Option<Self> {
        Unit::try_new(b - a, f64::EPSILON).map(|direction| Self { point: a, direction })
    }

    /// Squared distance between the line and a point.
    pub fn sqr_distance(&self, point: &Point2<f64>) -> f64 {
        let offset = point - self.point;
        let direction = self.direction.into_inner();
        (offset - direction * offset.dot(&direction)).norm_squared()
    }
}
