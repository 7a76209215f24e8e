use crate::basis;
use crate::error::{ConstraintKind, NurbsError, Result};
use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};

/// A planar NURBS curve with a clamped knot vector over the `[0, 1]` domain.
///
/// Fields are public so callers can build, inspect, and mutate the control
/// net directly; every evaluation entry point re-validates the invariants
/// before touching the data, so an inconsistent mutation surfaces as an
/// error on the next call rather than as silent garbage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NurbsCurve {
    pub degree: usize,
    /// Control points, shape `(n, 2)`.
    pub control_points: Array2<f64>,
    /// One positive weight per control point.
    pub weights: Array1<f64>,
    /// Clamped knot vector of length `n + degree + 1`.
    pub knots: Array1<f64>,
}

impl NurbsCurve {
    /// Builds a curve and validates it eagerly, so construction fails on the
    /// same inputs evaluation would later reject.
    pub fn new(
        degree: usize,
        control_points: Array2<f64>,
        weights: Array1<f64>,
        knots: Array1<f64>,
    ) -> Result<Self> {
        let curve = Self {
            degree,
            control_points,
            weights,
            knots,
        };
        curve.validate()?;
        Ok(curve)
    }

    /// Allocates a placeholder curve of the requested size: control points
    /// at the origin, unit weights, and a clamped knot vector whose interior
    /// knots sit at 0.5. The result validates and can be refined in place.
    pub fn allocate(degree: usize, control_point_count: usize) -> Result<Self> {
        if control_point_count <= degree {
            return Err(NurbsError::InvalidConfiguration(format!(
                "A degree {degree} curve needs at least {} control points, got {control_point_count}.",
                degree + 1
            )));
        }
        Ok(Self {
            degree,
            control_points: Array2::zeros((control_point_count, 2)),
            weights: Array1::ones(control_point_count),
            knots: placeholder_knots(degree, control_point_count),
        })
    }

    /// Checks the sizing and value invariants of the curve.
    pub fn validate(&self) -> Result<()> {
        let count = self.control_points.nrows();
        if count <= self.degree {
            return Err(NurbsError::InvalidConfiguration(format!(
                "A degree {} curve needs at least {} control points, got {count}.",
                self.degree,
                self.degree + 1
            )));
        }
        if self.control_points.ncols() != 2 {
            return Err(ConstraintKind::WrongDimension {
                expected: 2,
                found: self.control_points.ncols(),
            }
            .into());
        }
        if self.weights.len() != count {
            return Err(NurbsError::InvalidConfiguration(format!(
                "Expected one weight per control point ({count}), got {}.",
                self.weights.len()
            )));
        }
        let expected_knots = count + self.degree + 1;
        if self.knots.len() != expected_knots {
            return Err(NurbsError::InvalidConfiguration(format!(
                "Expected a knot vector of length {expected_knots}, got {}.",
                self.knots.len()
            )));
        }
        for (index, &weight) in self.weights.iter().enumerate() {
            if !(weight > 0.0 && weight.is_finite()) {
                return Err(ConstraintKind::NonPositiveWeight {
                    index,
                    value: weight,
                }
                .into());
            }
        }
        basis::validate_clamped_knots(self.knots.view(), self.degree, count, "u")?;
        Ok(())
    }

    /// Control points lifted into homogeneous space: `(w * x, w * y, w)`.
    pub fn projected_control_points(&self) -> Array2<f64> {
        let count = self.control_points.nrows();
        let mut projected = Array2::zeros((count, 3));
        for i in 0..count {
            let w = self.weights[i];
            projected[[i, 0]] = w * self.control_points[[i, 0]];
            projected[[i, 1]] = w * self.control_points[[i, 1]];
            projected[[i, 2]] = w;
        }
        projected
    }

    /// Evaluates the curve at a batch of parameters, returning one `(x, y)`
    /// row per parameter.
    pub fn evaluate(&self, parameters: ArrayView1<f64>) -> Result<Array2<f64>> {
        self.validate()?;
        let projected = self.projected_control_points();
        let count = projected.nrows();
        let spans = basis::find_spans(parameters, self.degree, count, self.knots.view());
        let values = basis::basis_values(parameters, spans.view(), self.degree, self.knots.view());

        let mut points = Array2::zeros((parameters.len(), 2));
        Zip::from(points.rows_mut())
            .and(spans.view())
            .and(values.rows())
            .par_for_each(|mut point, &span, window| {
                let first = span - self.degree;
                let mut homogeneous = [0.0; 3];
                for (j, &coefficient) in window.iter().enumerate() {
                    for (c, slot) in homogeneous.iter_mut().enumerate() {
                        *slot += coefficient * projected[[first + j, c]];
                    }
                }
                point[0] = homogeneous[0] / homogeneous[2];
                point[1] = homogeneous[1] / homogeneous[2];
            });
        Ok(points)
    }

    /// Derivatives of the underlying non-rational B-spline over the raw
    /// control polygon, ignoring weights. The result has shape
    /// `(parameters.len(), order + 1, 2)` with row 0 holding the B-spline
    /// position; orders beyond the degree are zero.
    pub fn bspline_derivatives(
        &self,
        parameters: ArrayView1<f64>,
        order: usize,
    ) -> Result<Array3<f64>> {
        self.validate()?;
        Ok(self.net_derivatives(self.control_points.view(), parameters, order))
    }

    /// Derivatives of the rational curve, shape
    /// `(parameters.len(), order + 1, 2)`. Row 0 matches [`Self::evaluate`].
    pub fn derivatives(&self, parameters: ArrayView1<f64>, order: usize) -> Result<Array3<f64>> {
        self.validate()?;
        let projected = self.projected_control_points();
        let homogeneous = self.net_derivatives(projected.view(), parameters, order);

        let mut derivatives = Array3::zeros((parameters.len(), order + 1, 2));
        Zip::from(derivatives.axis_iter_mut(Axis(0)))
            .and(homogeneous.axis_iter(Axis(0)))
            .par_for_each(|mut out, lifted| {
                // Leibniz de-projection: A(u) = w(u) * C(u), so each
                // derivative of C is recovered from the lifted derivatives
                // and the lower-order results already in `out`.
                for k in 0..=order {
                    let mut x = lifted[[k, 0]];
                    let mut y = lifted[[k, 1]];
                    for i in 1..=k {
                        let scale = basis::binomial(k, i) * lifted[[i, 2]];
                        x -= scale * out[[k - i, 0]];
                        y -= scale * out[[k - i, 1]];
                    }
                    out[[k, 0]] = x / lifted[[0, 2]];
                    out[[k, 1]] = y / lifted[[0, 2]];
                }
            });
        Ok(derivatives)
    }

    /// B-spline derivatives over an arbitrary-width control net. The width
    /// generalizes over plain `(x, y)` nets and homogeneous `(wx, wy, w)`
    /// nets so both derivative flavors share one kernel.
    fn net_derivatives(
        &self,
        net: ArrayView2<f64>,
        parameters: ArrayView1<f64>,
        order: usize,
    ) -> Array3<f64> {
        let count = net.nrows();
        let width = net.ncols();
        let spans = basis::find_spans(parameters, self.degree, count, self.knots.view());
        let tables =
            basis::basis_derivatives(parameters, spans.view(), self.degree, self.knots.view(), order);

        let mut result = Array3::zeros((parameters.len(), order + 1, width));
        let effective_order = order.min(self.degree);
        Zip::from(result.axis_iter_mut(Axis(0)))
            .and(spans.view())
            .and(tables.axis_iter(Axis(0)))
            .par_for_each(|mut rows, &span, table| {
                let first = span - self.degree;
                for k in 0..=effective_order {
                    for j in 0..=self.degree {
                        let coefficient = table[[k, j]];
                        for c in 0..width {
                            rows[[k, c]] += coefficient * net[[first + j, c]];
                        }
                    }
                }
            });
        result
    }
}

/// Clamped placeholder knot vector with all interior knots at 0.5.
fn placeholder_knots(degree: usize, control_point_count: usize) -> Array1<f64> {
    let mut knots = Array1::zeros(control_point_count + degree + 1);
    knots.slice_mut(s![control_point_count..]).fill(1.0);
    knots
        .slice_mut(s![degree + 1..control_point_count])
        .fill(0.5);
    knots
}
