// packages/engine/src/partition/geometry.rs
//! Points and half-open hyper-rectangles in `D` dimensions
//!
//! Every rectangle is `[lo, hi)` on each axis. A real point belongs to the
//! integer rectangle containing its floor, so continuous and grid fields
//! agree on ownership.

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;

/// Integer lattice point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntPoint<const D: usize>(pub [i64; D]);

/// Continuous point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RealPoint<const D: usize>(pub [f64; D]);

impl<const D: usize> IntPoint<D> {
    pub fn splat(v: i64) -> Self {
        Self([v; D])
    }

    /// Shift every coordinate, saturating at the `i64` range
    pub fn offset(&self, delta: i64) -> Self {
        Self(self.0.map(|c| c.saturating_add(delta)))
    }

    pub fn to_real(&self) -> RealPoint<D> {
        RealPoint(self.0.map(|c| c as f64))
    }

    /// Chebyshev distance
    pub fn chebyshev(&self, other: &Self) -> i64 {
        (0..D)
            .map(|d| self.0[d].abs_diff(other.0[d]).min(i64::MAX as u64) as i64)
            .max()
            .unwrap_or(0)
    }
}

impl<const D: usize> RealPoint<D> {
    pub fn floor(&self) -> IntPoint<D> {
        IntPoint(self.0.map(|c| c.floor() as i64))
    }

    pub fn distance(&self, other: &Self) -> f64 {
        self.distance_sq(other).sqrt()
    }

    pub fn distance_sq(&self, other: &Self) -> f64 {
        (0..D).map(|d| (self.0[d] - other.0[d]).powi(2)).sum()
    }

    pub fn translate(&self, delta: &[f64; D]) -> Self {
        let mut out = self.0;
        for d in 0..D {
            out[d] += delta[d];
        }
        Self(out)
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|c| c.is_finite())
    }
}

impl<const D: usize> fmt::Display for IntPoint<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl<const D: usize> fmt::Display for RealPoint<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Half-open integer hyper-rectangle `[lo, hi)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntRect<const D: usize> {
    pub lo: IntPoint<D>,
    pub hi: IntPoint<D>,
}

impl<const D: usize> IntRect<D> {
    pub fn new(lo: IntPoint<D>, hi: IntPoint<D>) -> Self {
        Self { lo, hi }
    }

    pub fn is_empty(&self) -> bool {
        (0..D).any(|d| self.hi.0[d] <= self.lo.0[d])
    }

    pub fn width(&self, axis: usize) -> i64 {
        (self.hi.0[axis] - self.lo.0[axis]).max(0)
    }

    pub fn volume(&self) -> u64 {
        (0..D).map(|d| self.width(d) as u64).product()
    }

    pub fn contains(&self, p: &IntPoint<D>) -> bool {
        (0..D).all(|d| self.lo.0[d] <= p.0[d] && p.0[d] < self.hi.0[d])
    }

    pub fn contains_real(&self, p: &RealPoint<D>) -> bool {
        (0..D).all(|d| self.lo.0[d] as f64 <= p.0[d] && p.0[d] < self.hi.0[d] as f64)
    }

    pub fn contains_rect(&self, other: &Self) -> bool {
        other.is_empty() || (0..D).all(|d| self.lo.0[d] <= other.lo.0[d] && other.hi.0[d] <= self.hi.0[d])
    }

    pub fn intersects(&self, other: &Self) -> bool {
        self.intersection(other).is_some()
    }

    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let mut lo = [0i64; D];
        let mut hi = [0i64; D];
        for d in 0..D {
            lo[d] = self.lo.0[d].max(other.lo.0[d]);
            hi[d] = self.hi.0[d].min(other.hi.0[d]);
        }
        let rect = Self::new(IntPoint(lo), IntPoint(hi));
        (!rect.is_empty()).then_some(rect)
    }

    /// Grow by `by` on every side
    pub fn expand(&self, by: i64) -> Self {
        Self::new(self.lo.offset(-by), self.hi.offset(by))
    }

    /// Midpoint, rounded down
    pub fn center(&self) -> IntPoint<D> {
        let mut c = [0i64; D];
        for d in 0..D {
            c[d] = self.lo.0[d] + (self.hi.0[d] - self.lo.0[d]).div_euclid(2);
        }
        IntPoint(c)
    }

    pub fn real_center(&self) -> RealPoint<D> {
        let mut c = [0f64; D];
        for d in 0..D {
            c[d] = (self.lo.0[d] + self.hi.0[d]) as f64 / 2.0;
        }
        RealPoint(c)
    }

    /// Euclidean distance from a point to the closest point of the rectangle
    pub fn distance_to(&self, p: &RealPoint<D>) -> f64 {
        let mut sq = 0.0;
        for d in 0..D {
            let lo = self.lo.0[d] as f64;
            let hi = self.hi.0[d] as f64;
            let gap = if p.0[d] < lo {
                lo - p.0[d]
            } else if p.0[d] >= hi {
                p.0[d] - hi
            } else {
                0.0
            };
            sq += gap * gap;
        }
        sq.sqrt()
    }

    /// Lattice points in row-major order (last axis fastest)
    pub fn points(&self) -> RectPoints<D> {
        RectPoints {
            rect: *self,
            next: (!self.is_empty()).then_some(self.lo),
        }
    }

    /// Row-major offset of `p` inside the rectangle
    pub fn offset_of(&self, p: &IntPoint<D>) -> Option<usize> {
        if !self.contains(p) {
            return None;
        }
        let mut index = 0usize;
        for d in 0..D {
            index = index * self.width(d) as usize + (p.0[d] - self.lo.0[d]) as usize;
        }
        Some(index)
    }
}

impl<const D: usize> fmt::Display for IntRect<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?})", self.lo.0, self.hi.0)
    }
}

/// Row-major iterator over the points of an `IntRect`
pub struct RectPoints<const D: usize> {
    rect: IntRect<D>,
    next: Option<IntPoint<D>>,
}

impl<const D: usize> Iterator for RectPoints<D> {
    type Item = IntPoint<D>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        let mut succ = current;
        let mut axis = D;
        self.next = loop {
            if axis == 0 {
                break None;
            }
            axis -= 1;
            succ.0[axis] += 1;
            if succ.0[axis] < self.rect.hi.0[axis] {
                break Some(succ);
            }
            succ.0[axis] = self.rect.lo.0[axis];
        };
        Some(current)
    }
}

// Arrays of a generic length have no serde impls, so points go over the
// wire as fixed-length tuples.

fn serialize_array<S: Serializer, T: Serialize, const D: usize>(values: &[T; D], serializer: S) -> Result<S::Ok, S::Error> {
    let mut tuple = serializer.serialize_tuple(D)?;
    for v in values {
        tuple.serialize_element(v)?;
    }
    tuple.end()
}

struct ArrayVisitor<T, const D: usize>(PhantomData<T>);

impl<'de, T: Deserialize<'de> + Copy + Default, const D: usize> Visitor<'de> for ArrayVisitor<T, D> {
    type Value = [T; D];

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a tuple of {} coordinates", D)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut out = [T::default(); D];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = seq.next_element()?.ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        Ok(out)
    }
}

impl<const D: usize> Serialize for IntPoint<D> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_array(&self.0, serializer)
    }
}

impl<'de, const D: usize> Deserialize<'de> for IntPoint<D> {
    fn deserialize<De: Deserializer<'de>>(deserializer: De) -> Result<Self, De::Error> {
        deserializer.deserialize_tuple(D, ArrayVisitor::<i64, D>(PhantomData)).map(IntPoint)
    }
}

impl<const D: usize> Serialize for RealPoint<D> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_array(&self.0, serializer)
    }
}

impl<'de, const D: usize> Deserialize<'de> for RealPoint<D> {
    fn deserialize<De: Deserializer<'de>>(deserializer: De) -> Result<Self, De::Error> {
        deserializer.deserialize_tuple(D, ArrayVisitor::<f64, D>(PhantomData)).map(RealPoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect2(lo: [i64; 2], hi: [i64; 2]) -> IntRect<2> {
        IntRect::new(IntPoint(lo), IntPoint(hi))
    }

    #[test]
    fn test_half_open_containment() {
        let r = rect2([0, 0], [10, 5]);
        assert!(r.contains(&IntPoint([0, 0])));
        assert!(r.contains(&IntPoint([9, 4])));
        assert!(!r.contains(&IntPoint([10, 4])));
        assert!(r.contains_real(&RealPoint([9.99, 0.0])));
        assert!(!r.contains_real(&RealPoint([10.0, 0.0])));
        assert_eq!(r.volume(), 50);
    }

    #[test]
    fn test_intersection_and_expand() {
        let a = rect2([0, 0], [50, 50]);
        let b = rect2([50, 0], [100, 50]);
        assert!(a.intersection(&b).is_none());
        let halo = a.expand(5);
        assert_eq!(halo.intersection(&b), Some(rect2([50, 0], [55, 50])));
        assert!(halo.contains_rect(&a));
    }

    #[test]
    fn test_points_row_major() {
        let r = rect2([0, 0], [2, 3]);
        let points: Vec<_> = r.points().collect();
        assert_eq!(points.len(), 6);
        assert_eq!(points[0], IntPoint([0, 0]));
        assert_eq!(points[1], IntPoint([0, 1]));
        assert_eq!(points[3], IntPoint([1, 0]));
        for (i, p) in points.iter().enumerate() {
            assert_eq!(r.offset_of(p), Some(i));
        }
        assert_eq!(rect2([0, 0], [0, 3]).points().count(), 0);
    }

    #[test]
    fn test_distance_to() {
        let r = rect2([0, 0], [10, 10]);
        assert_eq!(r.distance_to(&RealPoint([5.0, 5.0])), 0.0);
        assert_eq!(r.distance_to(&RealPoint([13.0, 14.0])), 5.0);
    }

    #[test]
    fn test_point_serde() {
        let p = RealPoint([1.5, -2.0, 3.25]);
        let bytes = serde_cbor::to_vec(&p).unwrap();
        let back: RealPoint<3> = serde_cbor::from_slice(&bytes).unwrap();
        assert_eq!(back, p);

        let json = serde_json::to_string(&IntPoint([4, 5])).unwrap();
        assert_eq!(json, "[4,5]");
        assert!(serde_json::from_str::<IntPoint<2>>("[4]").is_err());
    }

    #[test]
    fn test_offset_saturates() {
        assert_eq!(IntPoint([i64::MAX - 1]).offset(5), IntPoint([i64::MAX]));
        assert_eq!(IntPoint([i64::MIN + 1]).offset(-5), IntPoint([i64::MIN]));
        assert_eq!(IntPoint([i64::MIN]).chebyshev(&IntPoint([i64::MAX])), i64::MAX);
    }
}
