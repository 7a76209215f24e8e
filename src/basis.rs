use crate::error::ConstraintKind;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayViewMut1, ArrayViewMut2, Axis, Zip};

/// Locates the knot span containing each parameter value.
///
/// For every entry of `parameters` this returns the index `i` such that
/// `knots[i] <= u < knots[i+1]`, found by binary search. A parameter equal to
/// the upper domain boundary is placed in the last span
/// (`control_point_count - 1`), so the final span is inclusive of its right
/// edge. Parameters outside the domain are clamped into the boundary spans.
pub fn find_spans(
    parameters: ArrayView1<f64>,
    degree: usize,
    control_point_count: usize,
    knots: ArrayView1<f64>,
) -> Array1<usize> {
    let mut spans = Array1::zeros(parameters.len());
    Zip::from(&mut spans).and(parameters).par_for_each(|span, &u| {
        *span = internal::span_for(u, degree, control_point_count, &knots);
    });
    spans
}

/// Evaluates the `degree + 1` nonzero basis functions at each parameter.
///
/// Row `i` of the result holds the local basis window for
/// `(parameters[i], spans[i])`; entry `j` belongs to control point
/// `spans[i] - degree + j`. The values are produced by the triangular
/// Cox-de Boor recurrence, one independent recurrence per evaluation point.
pub fn basis_values(
    parameters: ArrayView1<f64>,
    spans: ArrayView1<usize>,
    degree: usize,
    knots: ArrayView1<f64>,
) -> Array2<f64> {
    let mut values = Array2::zeros((parameters.len(), degree + 1));
    Zip::from(values.rows_mut())
        .and(parameters)
        .and(spans)
        .par_for_each(|mut row, &u, &span| {
            internal::basis_row(u, span, degree, &knots, &mut row);
        });
    values
}

/// Evaluates the single named basis function `N_{index, degree}` at each
/// parameter, without computing the rest of the local window.
///
/// `index` must be a valid control-point index for the knot vector. The
/// boundary conventions match the windowed evaluation: the first basis
/// function is exactly 1 at the domain minimum, the last is exactly 1 at the
/// domain maximum, and the value is 0 outside the function's local support.
/// The least-squares fit uses this to sample one basis column at many
/// parameters at once.
pub fn one_basis_values(
    parameters: ArrayView1<f64>,
    index: usize,
    degree: usize,
    knots: ArrayView1<f64>,
) -> Array1<f64> {
    let mut values = Array1::zeros(parameters.len());
    Zip::from(&mut values).and(parameters).par_for_each(|value, &u| {
        *value = internal::one_basis(u, index, degree, &knots);
    });
    values
}

/// Evaluates basis function values and derivatives up to `order`.
///
/// The result has shape `(parameters.len(), order + 1, degree + 1)`; entry
/// `[i, k, j]` is the k-th derivative of the j-th local basis function at
/// `parameters[i]`. Row 0 reproduces [`basis_values`]. Derivative orders
/// beyond the polynomial degree are identically zero and are returned as
/// zero-filled rows.
pub fn basis_derivatives(
    parameters: ArrayView1<f64>,
    spans: ArrayView1<usize>,
    degree: usize,
    knots: ArrayView1<f64>,
    order: usize,
) -> Array3<f64> {
    let mut derivatives = Array3::zeros((parameters.len(), order + 1, degree + 1));
    Zip::from(derivatives.axis_iter_mut(Axis(0)))
        .and(parameters)
        .and(spans)
        .par_for_each(|mut table, &u, &span| {
            internal::derivative_table(u, span, degree, &knots, order, &mut table);
        });
    derivatives
}

/// Checks that a knot vector is clamped to the `[0, 1]` domain and
/// non-decreasing. Length invariants are enforced at construction; this
/// guards the values, which remain mutable through the owning entity.
pub(crate) fn validate_clamped_knots(
    knots: ArrayView1<f64>,
    degree: usize,
    control_point_count: usize,
    axis: &'static str,
) -> Result<(), ConstraintKind> {
    let multiplicity = degree + 1;
    for i in 0..multiplicity {
        if knots[i] != 0.0 {
            return Err(ConstraintKind::UnclampedKnots { axis, multiplicity });
        }
    }
    for i in control_point_count..knots.len() {
        if knots[i] != 1.0 {
            return Err(ConstraintKind::UnclampedKnots { axis, multiplicity });
        }
    }
    for i in 1..knots.len() {
        // Written so that a NaN knot also fails the ordering check.
        if !(knots[i - 1] <= knots[i]) {
            return Err(ConstraintKind::UnsortedKnots { axis, index: i });
        }
    }
    Ok(())
}

/// Binomial coefficient as a float, used by the rational derivative
/// de-projection. Call sites guarantee `k <= n`.
pub(crate) fn binomial(n: usize, k: usize) -> f64 {
    let k = k.min(n - k);
    let mut coefficient = 1.0;
    for i in 0..k {
        coefficient = coefficient * (n - i) as f64 / (i + 1) as f64;
    }
    coefficient
}

/// Internal module for the per-point recurrences behind the batched API.
mod internal {
    use super::*;

    /// Index of the first knot strictly greater than `u`.
    fn upper_bound(knots: &ArrayView1<f64>, u: f64) -> usize {
        let mut low = 0;
        let mut high = knots.len();
        while low < high {
            let mid = (low + high) / 2;
            if knots[mid] <= u {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }

    pub(super) fn span_for(
        u: f64,
        degree: usize,
        control_point_count: usize,
        knots: &ArrayView1<f64>,
    ) -> usize {
        // The upper domain boundary belongs to the last span.
        if u == knots[control_point_count] {
            return control_point_count - 1;
        }
        upper_bound(knots, u)
            .saturating_sub(1)
            .clamp(degree, control_point_count - 1)
    }

    /// Triangular Cox-de Boor recurrence for one `(u, span)` pair, writing
    /// the `degree + 1` nonzero values into `values`.
    pub(super) fn basis_row(
        u: f64,
        span: usize,
        degree: usize,
        knots: &ArrayView1<f64>,
        values: &mut ArrayViewMut1<f64>,
    ) {
        let mut left = vec![0.0; degree + 1];
        let mut right = vec![0.0; degree + 1];
        values[0] = 1.0;
        for j in 1..=degree {
            left[j] = u - knots[span + 1 - j];
            right[j] = knots[span + j] - u;
            let mut saved = 0.0;
            for r in 0..j {
                let tmp = values[r] / (right[r + 1] + left[j - r]);
                values[r] = saved + right[r + 1] * tmp;
                saved = left[j - r] * tmp;
            }
            values[j] = saved;
        }
    }

    /// Direct evaluation of the single basis function `N_{index, degree}`
    /// at `u`, including the boundary and support edge cases.
    pub(super) fn one_basis(
        u: f64,
        index: usize,
        degree: usize,
        knots: &ArrayView1<f64>,
    ) -> f64 {
        let last = knots.len() - 1;
        // The two corner basis functions own the domain boundaries exactly.
        if (index == 0 && u == knots[0]) || (index == last - degree - 1 && u == knots[last]) {
            return 1.0;
        }
        if u < knots[index] || u >= knots[index + degree + 1] {
            return 0.0;
        }

        // Degree-zero seeds over the local support.
        let mut table = vec![0.0; degree + 1];
        for (j, seed) in table.iter_mut().enumerate() {
            if u >= knots[index + j] && u < knots[index + j + 1] {
                *seed = 1.0;
            }
        }

        // Work upward through the degrees, collapsing the table toward
        // entry 0. Zero entries are propagated without forming their
        // (possibly 0/0) quotients.
        for k in 1..=degree {
            let mut saved = if table[0] == 0.0 {
                0.0
            } else {
                (u - knots[index]) * table[0] / (knots[index + k] - knots[index])
            };
            for j in 0..=(degree - k) {
                let left = knots[index + j + 1];
                let right = knots[index + j + k + 1];
                if table[j + 1] == 0.0 {
                    table[j] = saved;
                    saved = 0.0;
                } else {
                    let tmp = table[j + 1] / (right - left);
                    table[j] = saved + (right - u) * tmp;
                    saved = (u - left) * tmp;
                }
            }
        }
        table[0]
    }

    /// Basis values and derivatives for one `(u, span)` pair.
    ///
    /// First builds the full triangular table (`ndu`), whose upper triangle
    /// holds basis values of all intermediate degrees and whose lower
    /// triangle holds the knot-difference denominators. The derivative rows
    /// are then assembled with a pair of rolling coefficient buffers swapped
    /// each order, and finally rescaled by the falling factorial of the
    /// degree. `out` must be zero-initialized with shape
    /// `(order + 1, degree + 1)`; rows beyond the degree stay zero.
    pub(super) fn derivative_table(
        u: f64,
        span: usize,
        degree: usize,
        knots: &ArrayView1<f64>,
        order: usize,
        out: &mut ArrayViewMut2<f64>,
    ) {
        let effective_order = order.min(degree);
        let width = degree + 1;

        let mut ndu = Array2::zeros((width, width));
        let mut left = vec![0.0; width];
        let mut right = vec![0.0; width];
        ndu[[0, 0]] = 1.0;
        for j in 1..=degree {
            left[j] = u - knots[span + 1 - j];
            right[j] = knots[span + j] - u;
            let mut saved = 0.0;
            for r in 0..j {
                ndu[[j, r]] = right[r + 1] + left[j - r];
                let tmp = ndu[[r, j - 1]] / ndu[[j, r]];
                ndu[[r, j]] = saved + right[r + 1] * tmp;
                saved = left[j - r] * tmp;
            }
            ndu[[j, j]] = saved;
        }

        for j in 0..width {
            out[[0, j]] = ndu[[j, degree]];
        }

        let mut previous = vec![0.0; width];
        let mut current = vec![0.0; width];
        for r in 0..width {
            previous.fill(0.0);
            previous[0] = 1.0;
            for k in 1..=effective_order {
                let mut d = 0.0;
                let rk = r as isize - k as isize;
                let pk = degree - k;
                if r >= k {
                    current[0] = previous[0] / ndu[[pk + 1, (rk) as usize]];
                    d = current[0] * ndu[[rk as usize, pk]];
                }
                let j1 = if rk >= -1 { 1 } else { (-rk) as usize };
                let j2 = if r as isize - 1 <= pk as isize {
                    k - 1
                } else {
                    degree - r
                };
                for j in j1..=j2 {
                    let column = (rk + j as isize) as usize;
                    current[j] = (previous[j] - previous[j - 1]) / ndu[[pk + 1, column]];
                    d += current[j] * ndu[[column, pk]];
                }
                if r <= pk {
                    current[k] = -previous[k - 1] / ndu[[pk + 1, r]];
                    d += current[k] * ndu[[r, pk]];
                }
                out[[k, r]] = d;
                std::mem::swap(&mut previous, &mut current);
            }
        }

        // Undo the degree normalization of the raw coefficients: row k is
        // scaled by degree * (degree - 1) * ... * (degree - k + 1).
        let mut factor = degree as f64;
        for k in 1..=effective_order {
            for j in 0..width {
                out[[k, j]] *= factor;
            }
            factor *= (degree - k) as f64;
        }
    }
}
