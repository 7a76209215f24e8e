use crate::basis;
use crate::error::{ConstraintKind, NurbsError, Result};
use crate::inversion::{self, InversionConfig};
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView1, ArrayView2, ArrayView3, Axis, Zip};
use serde::{Deserialize, Serialize};

/// A tensor-product NURBS surface in 3-space with clamped knot vectors over
/// the `[0, 1] x [0, 1]` domain.
///
/// As with [`crate::NurbsCurve`], the fields are public and every operation
/// re-validates the invariants on entry, so direct mutation is allowed and
/// checked lazily.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NurbsSurface {
    pub degree_u: usize,
    pub degree_v: usize,
    /// Control net, shape `(count_u, count_v, 3)`.
    pub control_points: Array3<f64>,
    /// One positive weight per control point, shape `(count_u, count_v)`.
    pub weights: Array2<f64>,
    /// Clamped knot vector of length `count_u + degree_u + 1`.
    pub knots_u: Array1<f64>,
    /// Clamped knot vector of length `count_v + degree_v + 1`.
    pub knots_v: Array1<f64>,
}

impl NurbsSurface {
    /// Builds a surface and validates it eagerly.
    pub fn new(
        degree_u: usize,
        degree_v: usize,
        control_points: Array3<f64>,
        weights: Array2<f64>,
        knots_u: Array1<f64>,
        knots_v: Array1<f64>,
    ) -> Result<Self> {
        let surface = Self {
            degree_u,
            degree_v,
            control_points,
            weights,
            knots_u,
            knots_v,
        };
        surface.validate()?;
        Ok(surface)
    }

    /// Allocates a placeholder surface: control points at the origin, unit
    /// weights, and clamped knot vectors with all interior knots at 0.5.
    pub fn allocate(
        degree_u: usize,
        degree_v: usize,
        count_u: usize,
        count_v: usize,
    ) -> Result<Self> {
        for (axis, degree, count) in [("u", degree_u, count_u), ("v", degree_v, count_v)] {
            if count <= degree {
                return Err(NurbsError::InvalidConfiguration(format!(
                    "A degree {degree} axis {axis} needs at least {} control points, got {count}.",
                    degree + 1
                )));
            }
        }
        Ok(Self {
            degree_u,
            degree_v,
            control_points: Array3::zeros((count_u, count_v, 3)),
            weights: Array2::ones((count_u, count_v)),
            knots_u: placeholder_knots(degree_u, count_u),
            knots_v: placeholder_knots(degree_v, count_v),
        })
    }

    /// Checks the sizing and value invariants of the surface.
    pub fn validate(&self) -> Result<()> {
        let (count_u, count_v, components) = self.control_points.dim();
        for (axis, degree, count) in [("u", self.degree_u, count_u), ("v", self.degree_v, count_v)]
        {
            if count <= degree {
                return Err(NurbsError::InvalidConfiguration(format!(
                    "A degree {degree} axis {axis} needs at least {} control points, got {count}.",
                    degree + 1
                )));
            }
        }
        if components != 3 {
            return Err(ConstraintKind::WrongDimension {
                expected: 3,
                found: components,
            }
            .into());
        }
        if self.weights.dim() != (count_u, count_v) {
            return Err(NurbsError::InvalidConfiguration(format!(
                "Expected a ({count_u}, {count_v}) weight grid, got {:?}.",
                self.weights.dim()
            )));
        }
        for (axis, degree, count, knots) in [
            ("u", self.degree_u, count_u, &self.knots_u),
            ("v", self.degree_v, count_v, &self.knots_v),
        ] {
            let expected = count + degree + 1;
            if knots.len() != expected {
                return Err(NurbsError::InvalidConfiguration(format!(
                    "Expected a knot vector of length {expected} along {axis}, got {}.",
                    knots.len()
                )));
            }
        }
        for ((i, j), &weight) in self.weights.indexed_iter() {
            if !(weight > 0.0 && weight.is_finite()) {
                return Err(ConstraintKind::NonPositiveWeight {
                    index: i * count_v + j,
                    value: weight,
                }
                .into());
            }
        }
        basis::validate_clamped_knots(self.knots_u.view(), self.degree_u, count_u, "u")?;
        basis::validate_clamped_knots(self.knots_v.view(), self.degree_v, count_v, "v")?;
        Ok(())
    }

    /// Control net lifted into homogeneous space: `(wx, wy, wz, w)`.
    pub fn projected_control_points(&self) -> Array3<f64> {
        let (count_u, count_v, _) = self.control_points.dim();
        let mut projected = Array3::zeros((count_u, count_v, 4));
        for i in 0..count_u {
            for j in 0..count_v {
                let w = self.weights[[i, j]];
                for c in 0..3 {
                    projected[[i, j, c]] = w * self.control_points[[i, j, c]];
                }
                projected[[i, j, 3]] = w;
            }
        }
        projected
    }

    /// Evaluates the surface at paired parameters, one `(x, y, z)` row per
    /// `(parameters_u[i], parameters_v[i])` pair.
    pub fn evaluate(
        &self,
        parameters_u: ArrayView1<f64>,
        parameters_v: ArrayView1<f64>,
    ) -> Result<Array2<f64>> {
        self.validate()?;
        check_paired_parameters(parameters_u, parameters_v)?;
        let projected = self.projected_control_points();
        let net = projected.view();
        let (count_u, count_v, _) = net.dim();

        let spans_u = basis::find_spans(parameters_u, self.degree_u, count_u, self.knots_u.view());
        let spans_v = basis::find_spans(parameters_v, self.degree_v, count_v, self.knots_v.view());
        let values_u =
            basis::basis_values(parameters_u, spans_u.view(), self.degree_u, self.knots_u.view());
        let values_v =
            basis::basis_values(parameters_v, spans_v.view(), self.degree_v, self.knots_v.view());

        let mut points = Array2::zeros((parameters_u.len(), 3));
        Zip::from(points.rows_mut())
            .and(spans_u.view())
            .and(spans_v.view())
            .and(values_u.rows())
            .and(values_v.rows())
            .par_for_each(|mut point, &span_u, &span_v, window_u, window_v| {
                let first_u = span_u - self.degree_u;
                let first_v = span_v - self.degree_v;
                // Collapse along u first, then blend the v window.
                let mut column = Array2::<f64>::zeros((self.degree_v + 1, 4));
                for j in 0..=self.degree_v {
                    for (r, &coefficient) in window_u.iter().enumerate() {
                        for c in 0..4 {
                            column[[j, c]] += coefficient * net[[first_u + r, first_v + j, c]];
                        }
                    }
                }
                let mut homogeneous = [0.0; 4];
                for (j, &coefficient) in window_v.iter().enumerate() {
                    for (c, slot) in homogeneous.iter_mut().enumerate() {
                        *slot += coefficient * column[[j, c]];
                    }
                }
                for c in 0..3 {
                    point[c] = homogeneous[c] / homogeneous[3];
                }
            });
        Ok(points)
    }

    /// Derivatives of the underlying non-rational B-spline over the raw
    /// control net, ignoring weights. Shape is
    /// `(len, order + 1, order + 1, 3)`; entry `[i, k, m, ..]` is the mixed
    /// derivative taken `k` times along `u` and `m` times along `v`. Entries
    /// with `k + m > order` and orders beyond either degree are zero.
    pub fn bspline_derivatives(
        &self,
        parameters_u: ArrayView1<f64>,
        parameters_v: ArrayView1<f64>,
        order: usize,
    ) -> Result<Array4<f64>> {
        self.validate()?;
        check_paired_parameters(parameters_u, parameters_v)?;
        Ok(self.net_derivatives(self.control_points.view(), parameters_u, parameters_v, order))
    }

    /// Derivatives of the rational surface, laid out like
    /// [`Self::bspline_derivatives`]. Entry `[i, 0, 0, ..]` matches
    /// [`Self::evaluate`].
    pub fn derivatives(
        &self,
        parameters_u: ArrayView1<f64>,
        parameters_v: ArrayView1<f64>,
        order: usize,
    ) -> Result<Array4<f64>> {
        self.validate()?;
        check_paired_parameters(parameters_u, parameters_v)?;
        let projected = self.projected_control_points();
        let lifted = self.net_derivatives(projected.view(), parameters_u, parameters_v, order);

        let mut derivatives = Array4::zeros((parameters_u.len(), order + 1, order + 1, 3));
        Zip::from(derivatives.axis_iter_mut(Axis(0)))
            .and(lifted.axis_iter(Axis(0)))
            .par_for_each(|mut out, table| {
                // Two-dimensional Leibniz de-projection, filling the
                // triangle k + m <= order in ascending total order so every
                // lower-order term is already available.
                for k in 0..=order {
                    for m in 0..=(order - k) {
                        let mut vector = [table[[k, m, 0]], table[[k, m, 1]], table[[k, m, 2]]];
                        for j in 1..=m {
                            let scale = basis::binomial(m, j) * table[[0, j, 3]];
                            for c in 0..3 {
                                vector[c] -= scale * out[[k, m - j, c]];
                            }
                        }
                        for i in 1..=k {
                            let along_u = basis::binomial(k, i);
                            let scale = along_u * table[[i, 0, 3]];
                            for c in 0..3 {
                                vector[c] -= scale * out[[k - i, m, c]];
                            }
                            for j in 1..=m {
                                let scale = along_u * basis::binomial(m, j) * table[[i, j, 3]];
                                for c in 0..3 {
                                    vector[c] -= scale * out[[k - i, m - j, c]];
                                }
                            }
                        }
                        for c in 0..3 {
                            out[[k, m, c]] = vector[c] / table[[0, 0, 3]];
                        }
                    }
                }
            });
        Ok(derivatives)
    }

    /// Unit surface normals, one `(x, y, z)` row per parameter pair. The
    /// normal is the normalized cross product of the two first-order
    /// tangents; where a tangent degenerates to zero the entries are
    /// non-finite rather than an error, so callers can mask them.
    pub fn normals(
        &self,
        parameters_u: ArrayView1<f64>,
        parameters_v: ArrayView1<f64>,
    ) -> Result<Array2<f64>> {
        let derivatives = self.derivatives(parameters_u, parameters_v, 1)?;
        Ok(normals_from_derivatives(&derivatives))
    }

    /// Evaluates positions and unit normals in a single derivative pass,
    /// cheaper than calling [`Self::evaluate`] and [`Self::normals`]
    /// separately.
    pub fn evaluate_with_normals(
        &self,
        parameters_u: ArrayView1<f64>,
        parameters_v: ArrayView1<f64>,
    ) -> Result<(Array2<f64>, Array2<f64>)> {
        let derivatives = self.derivatives(parameters_u, parameters_v, 1)?;
        let points = derivatives.slice(s![.., 0, 0, ..]).to_owned();
        let normals = normals_from_derivatives(&derivatives);
        Ok((points, normals))
    }

    /// Finds surface parameters whose images are closest to the given world
    /// points, one `(u, v)` row per target, along with each target's
    /// remaining distance to the surface. See [`InversionConfig`] for the
    /// search controls.
    pub fn invert_points(
        &self,
        targets: ArrayView2<f64>,
        config: &InversionConfig,
    ) -> Result<(Array2<f64>, Array1<f64>)> {
        self.validate()?;
        inversion::invert_points(self, targets, config)
    }

    /// B-spline derivatives over an arbitrary-width control net, shared by
    /// the plain and homogeneous derivative paths.
    fn net_derivatives(
        &self,
        net: ArrayView3<f64>,
        parameters_u: ArrayView1<f64>,
        parameters_v: ArrayView1<f64>,
        order: usize,
    ) -> Array4<f64> {
        let (count_u, count_v, width) = net.dim();
        let spans_u = basis::find_spans(parameters_u, self.degree_u, count_u, self.knots_u.view());
        let spans_v = basis::find_spans(parameters_v, self.degree_v, count_v, self.knots_v.view());
        let tables_u = basis::basis_derivatives(
            parameters_u,
            spans_u.view(),
            self.degree_u,
            self.knots_u.view(),
            order,
        );
        let tables_v = basis::basis_derivatives(
            parameters_v,
            spans_v.view(),
            self.degree_v,
            self.knots_v.view(),
            order,
        );

        let effective_u = order.min(self.degree_u);
        let effective_v = order.min(self.degree_v);
        let mut result = Array4::zeros((parameters_u.len(), order + 1, order + 1, width));
        Zip::from(result.axis_iter_mut(Axis(0)))
            .and(spans_u.view())
            .and(spans_v.view())
            .and(tables_u.axis_iter(Axis(0)))
            .and(tables_v.axis_iter(Axis(0)))
            .par_for_each(|mut out, &span_u, &span_v, table_u, table_v| {
                let first_u = span_u - self.degree_u;
                let first_v = span_v - self.degree_v;
                let mut column = Array2::zeros((self.degree_v + 1, width));
                for k in 0..=effective_u {
                    // Collapse the u window at derivative order k, then
                    // blend every v derivative that keeps k + m <= order.
                    column.fill(0.0);
                    for j in 0..=self.degree_v {
                        for r in 0..=self.degree_u {
                            let coefficient = table_u[[k, r]];
                            for c in 0..width {
                                column[[j, c]] +=
                                    coefficient * net[[first_u + r, first_v + j, c]];
                            }
                        }
                    }
                    for m in 0..=effective_v.min(order - k) {
                        for j in 0..=self.degree_v {
                            let coefficient = table_v[[m, j]];
                            for c in 0..width {
                                out[[k, m, c]] += coefficient * column[[j, c]];
                            }
                        }
                    }
                }
            });
        result
    }
}

/// Normals from a batch of order-1 derivative tables.
fn normals_from_derivatives(derivatives: &Array4<f64>) -> Array2<f64> {
    let count = derivatives.len_of(Axis(0));
    let mut normals = Array2::zeros((count, 3));
    Zip::from(normals.rows_mut())
        .and(derivatives.axis_iter(Axis(0)))
        .par_for_each(|mut normal, table| {
            let du = [table[[1, 0, 0]], table[[1, 0, 1]], table[[1, 0, 2]]];
            let dv = [table[[0, 1, 0]], table[[0, 1, 1]], table[[0, 1, 2]]];
            let cross = [
                du[1] * dv[2] - du[2] * dv[1],
                du[2] * dv[0] - du[0] * dv[2],
                du[0] * dv[1] - du[1] * dv[0],
            ];
            let length = (cross[0] * cross[0] + cross[1] * cross[1] + cross[2] * cross[2]).sqrt();
            for c in 0..3 {
                normal[c] = cross[c] / length;
            }
        });
    normals
}

/// Rejects evaluation batches whose u and v arrays differ in length.
fn check_paired_parameters(
    parameters_u: ArrayView1<f64>,
    parameters_v: ArrayView1<f64>,
) -> Result<()> {
    if parameters_u.len() != parameters_v.len() {
        return Err(ConstraintKind::ShapeMismatch {
            expected: parameters_u.len(),
            found: parameters_v.len(),
        }
        .into());
    }
    Ok(())
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
