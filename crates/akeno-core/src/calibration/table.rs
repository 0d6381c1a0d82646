//! Breakpoint tables and interpolation
//!
//! Tables hold fixed-point `i32` grids over strictly increasing `i32` axes.
//! Lookups clamp at the axis ends and interpolate linearly in between. The
//! per-axis fraction is quantised to Q16 and all nested interpolation is
//! carried in `i128`, so there is a single rounding step per lookup
//! (round half away from zero).

use serde::{Deserialize, Serialize};

use super::CalibrationError;

/// Number of fractional bits used for the per-axis interpolation weight.
pub const FRACTION_BITS: u32 = 16;

const ONE: i128 = 1 << FRACTION_BITS;

/// Integer division rounding half away from zero. `denominator` must be positive.
pub(crate) fn round_div(numerator: i128, denominator: i128) -> i128 {
    let half = denominator / 2;
    if numerator >= 0 {
        (numerator + half) / denominator
    } else {
        -((-numerator + half) / denominator)
    }
}

fn narrow(value: i128) -> i32 {
    value.clamp(i128::from(i32::MIN), i128::from(i32::MAX)) as i32
}

/// Interpolate between two values already scaled by `scale`, yielding a
/// result scaled by `scale * ONE`.
fn lerp(lo: i128, hi: i128, frac: i128) -> i128 {
    lo * ONE + frac * (hi - lo)
}

/// Position of a query on an axis: the bracketing indices and the Q16 weight
/// of the upper one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bracket {
    lo: usize,
    hi: usize,
    frac: i128,
}

impl Bracket {
    fn at(index: usize) -> Self {
        Self {
            lo: index,
            hi: index,
            frac: 0,
        }
    }
}

/// A strictly increasing sequence of breakpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Axis {
    points: Vec<i32>,
}

impl Axis {
    /// Validate and wrap a breakpoint list.
    pub fn new(points: Vec<i32>) -> Result<Self, CalibrationError> {
        Self::validated(points, 0)
    }

    fn validated(points: Vec<i32>, axis: usize) -> Result<Self, CalibrationError> {
        if points.is_empty() {
            return Err(CalibrationError::EmptyAxis { axis });
        }
        if let Some(index) = points.windows(2).position(|w| w[1] <= w[0]) {
            return Err(CalibrationError::AxisNotIncreasing {
                axis,
                index: index + 1,
            });
        }
        Ok(Self { points })
    }

    /// Axis `0, 1, .., len - 1`, used for tables indexed by an operating-mode
    /// state.
    pub fn enumerated(len: usize) -> Self {
        Self {
            points: (0..len.max(1) as i32).collect(),
        }
    }

    /// Evenly spaced axis starting at `start`.
    pub fn linear(start: i32, step: u16, count: usize) -> Self {
        let step = i32::from(step.max(1));
        Self {
            points: (0..count.max(1) as i32).map(|i| start + i * step).collect(),
        }
    }

    /// Check whether this axis is exactly `0..len`.
    pub fn is_enumerated(&self, len: usize) -> bool {
        self.points.len() == len && self.points.iter().enumerate().all(|(i, &p)| p == i as i32)
    }

    /// Breakpoint values
    pub fn points(&self) -> &[i32] {
        &self.points
    }

    /// Number of breakpoints
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn bracket(&self, x: i32) -> Bracket {
        let points = &self.points;
        let last = points.len() - 1;
        if x <= points[0] {
            return Bracket::at(0);
        }
        if x >= points[last] {
            return Bracket::at(last);
        }

        // points[0] < x < points[last], so 1 <= hi <= last
        let hi = points.partition_point(|&p| p <= x);
        let lo = hi - 1;
        let span = i128::from(points[hi]) - i128::from(points[lo]);
        let offset = i128::from(x) - i128::from(points[lo]);

        Bracket {
            lo,
            hi,
            frac: round_div(offset << FRACTION_BITS, span),
        }
    }
}

fn check_grid(expected: usize, values: &[i32]) -> Result<(), CalibrationError> {
    if values.len() != expected {
        return Err(CalibrationError::DimensionMismatch {
            expected,
            actual: values.len(),
        });
    }
    Ok(())
}

/// One-dimensional table (curve).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Table1D {
    x: Axis,
    values: Vec<i32>,
}

impl Table1D {
    /// Create a table; the grid length must match the axis.
    pub fn new(x: Axis, values: Vec<i32>) -> Result<Self, CalibrationError> {
        check_grid(x.len(), &values)?;
        Ok(Self { x, values })
    }

    /// Build a table by evaluating `f` at every breakpoint.
    pub fn from_fn(x: Axis, f: impl Fn(i32) -> i32) -> Self {
        let values = x.points().iter().map(|&p| f(p)).collect();
        Self { x, values }
    }

    /// Look up `x`, clamping outside the axis.
    pub fn lookup(&self, x: i32) -> i32 {
        let bx = self.x.bracket(x);
        let lo = i128::from(self.values[bx.lo]);
        let hi = i128::from(self.values[bx.hi]);
        narrow(round_div(lerp(lo, hi, bx.frac), ONE))
    }

    /// X axis
    pub fn x_axis(&self) -> &Axis {
        &self.x
    }

    /// Stored values
    pub fn values(&self) -> &[i32] {
        &self.values
    }
}

/// Two-dimensional table, row-major with `y` innermost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Table2D {
    x: Axis,
    y: Axis,
    values: Vec<i32>,
}

impl Table2D {
    /// Create a table; the grid must hold `x.len() * y.len()` values.
    pub fn new(x: Axis, y: Axis, values: Vec<i32>) -> Result<Self, CalibrationError> {
        check_grid(x.len() * y.len(), &values)?;
        Ok(Self { x, y, values })
    }

    /// Build a table by evaluating `f` at every breakpoint pair.
    pub fn from_fn(x: Axis, y: Axis, f: impl Fn(i32, i32) -> i32) -> Self {
        let mut values = Vec::with_capacity(x.len() * y.len());
        for &xp in x.points() {
            for &yp in y.points() {
                values.push(f(xp, yp));
            }
        }
        Self { x, y, values }
    }

    fn at(&self, i: usize, j: usize) -> i128 {
        i128::from(self.values[i * self.y.len() + j])
    }

    fn row(&self, i: usize, by: Bracket) -> i128 {
        lerp(self.at(i, by.lo), self.at(i, by.hi), by.frac)
    }

    /// Bilinear lookup, clamping on both axes.
    pub fn lookup(&self, x: i32, y: i32) -> i32 {
        let bx = self.x.bracket(x);
        let by = self.y.bracket(y);
        let scaled = lerp(self.row(bx.lo, by), self.row(bx.hi, by), bx.frac);
        narrow(round_div(scaled, ONE * ONE))
    }

    /// Stored value at grid position `(i, j)`.
    pub fn value_at(&self, i: usize, j: usize) -> Option<i32> {
        if i < self.x.len() && j < self.y.len() {
            self.values.get(i * self.y.len() + j).copied()
        } else {
            None
        }
    }

    /// X (outer) axis
    pub fn x_axis(&self) -> &Axis {
        &self.x
    }

    /// Y (inner) axis
    pub fn y_axis(&self) -> &Axis {
        &self.y
    }

    /// Flat value grid
    pub fn values(&self) -> &[i32] {
        &self.values
    }
}

/// Three-dimensional table, row-major with `z` innermost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Table3D {
    x: Axis,
    y: Axis,
    z: Axis,
    values: Vec<i32>,
}

impl Table3D {
    /// Create a table; the grid must hold `x.len() * y.len() * z.len()` values.
    pub fn new(x: Axis, y: Axis, z: Axis, values: Vec<i32>) -> Result<Self, CalibrationError> {
        check_grid(x.len() * y.len() * z.len(), &values)?;
        Ok(Self { x, y, z, values })
    }

    /// Build a table by evaluating `f` at every breakpoint triple.
    pub fn from_fn(x: Axis, y: Axis, z: Axis, f: impl Fn(i32, i32, i32) -> i32) -> Self {
        let mut values = Vec::with_capacity(x.len() * y.len() * z.len());
        for &xp in x.points() {
            for &yp in y.points() {
                for &zp in z.points() {
                    values.push(f(xp, yp, zp));
                }
            }
        }
        Self { x, y, z, values }
    }

    fn at(&self, i: usize, j: usize, k: usize) -> i128 {
        i128::from(self.values[(i * self.y.len() + j) * self.z.len() + k])
    }

    fn column(&self, i: usize, j: usize, bz: Bracket) -> i128 {
        lerp(self.at(i, j, bz.lo), self.at(i, j, bz.hi), bz.frac)
    }

    fn plane(&self, i: usize, by: Bracket, bz: Bracket) -> i128 {
        lerp(self.column(i, by.lo, bz), self.column(i, by.hi, bz), by.frac)
    }

    /// Trilinear lookup, clamping on all axes.
    pub fn lookup(&self, x: i32, y: i32, z: i32) -> i32 {
        let bx = self.x.bracket(x);
        let by = self.y.bracket(y);
        let bz = self.z.bracket(z);
        let scaled = lerp(self.plane(bx.lo, by, bz), self.plane(bx.hi, by, bz), bx.frac);
        narrow(round_div(scaled, ONE * ONE * ONE))
    }

    /// X (outer) axis
    pub fn x_axis(&self) -> &Axis {
        &self.x
    }

    /// Y (middle) axis
    pub fn y_axis(&self) -> &Axis {
        &self.y
    }

    /// Z (inner) axis
    pub fn z_axis(&self) -> &Axis {
        &self.z
    }

    /// Flat value grid
    pub fn values(&self) -> &[i32] {
        &self.values
    }
}

/// Wire form of a table: axes plus a flat grid, any rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTable {
    /// Breakpoints per axis, outermost first
    pub axes: Vec<Vec<i32>>,
    /// Flat row-major grid
    pub values: Vec<i32>,
}

impl RawTable {
    fn into_axes<const N: usize>(self) -> Result<([Axis; N], Vec<i32>), CalibrationError> {
        if self.axes.len() != N {
            return Err(CalibrationError::RankMismatch {
                expected: N,
                actual: self.axes.len(),
            });
        }
        let mut axes = Vec::with_capacity(N);
        for (i, points) in self.axes.into_iter().enumerate() {
            axes.push(Axis::validated(points, i)?);
        }
        let axes: [Axis; N] = axes
            .try_into()
            .map_err(|_| CalibrationError::RankMismatch { expected: N, actual: 0 })?;
        Ok((axes, self.values))
    }
}

impl TryFrom<RawTable> for Table1D {
    type Error = CalibrationError;

    fn try_from(raw: RawTable) -> Result<Self, Self::Error> {
        let ([x], values) = raw.into_axes::<1>()?;
        Table1D::new(x, values)
    }
}

impl TryFrom<RawTable> for Table2D {
    type Error = CalibrationError;

    fn try_from(raw: RawTable) -> Result<Self, Self::Error> {
        let ([x, y], values) = raw.into_axes::<2>()?;
        Table2D::new(x, y, values)
    }
}

impl TryFrom<RawTable> for Table3D {
    type Error = CalibrationError;

    fn try_from(raw: RawTable) -> Result<Self, Self::Error> {
        let ([x, y, z], values) = raw.into_axes::<3>()?;
        Table3D::new(x, y, z, values)
    }
}

impl From<&Table1D> for RawTable {
    fn from(table: &Table1D) -> Self {
        Self {
            axes: vec![table.x.points.clone()],
            values: table.values.clone(),
        }
    }
}

impl From<&Table2D> for RawTable {
    fn from(table: &Table2D) -> Self {
        Self {
            axes: vec![table.x.points.clone(), table.y.points.clone()],
            values: table.values.clone(),
        }
    }
}

impl From<&Table3D> for RawTable {
    fn from(table: &Table3D) -> Self {
        Self {
            axes: vec![
                table.x.points.clone(),
                table.y.points.clone(),
                table.z.points.clone(),
            ],
            values: table.values.clone(),
        }
    }
}
