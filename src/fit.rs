//! Least-squares approximation of a rectangular grid of world points by a
//! tensor-product B-spline surface. The fit runs one axis at a time: every
//! column line is reduced to `count_u` control points, then every row of the
//! intermediate net is reduced to `count_v`, with the grid boundary points
//! pinned exactly.

use crate::basis;
use crate::error::{ConstraintKind, NurbsError, Result};
use crate::linalg::FaerLu;
use crate::surface::NurbsSurface;
use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView3, Axis};

/// Chord-length parameters for a grid of world points, averaged over the
/// grid lines of each axis.
///
/// The returned pair is `(parameters_u, parameters_v)` with lengths matching
/// the grid rows and columns. Lines with zero total chord length are left
/// out of the average; an axis where every line degenerates is an error.
pub fn grid_parameters(world: ArrayView3<f64>) -> Result<(Array1<f64>, Array1<f64>)> {
    let (rows, cols, components) = world.dim();
    if components != 3 {
        return Err(ConstraintKind::WrongDimension {
            expected: 3,
            found: components,
        }
        .into());
    }
    if rows < 2 || cols < 2 {
        return Err(NurbsError::InvalidConfiguration(format!(
            "Chord-length parameters need at least a 2 x 2 grid, got ({rows}, {cols})."
        )));
    }
    // Lines along u hold a column index fixed, so the u pass runs over the
    // transposed view.
    let parameters_u = averaged_chord_parameters(world.permuted_axes([1, 0, 2]), "u")?;
    let parameters_v = averaged_chord_parameters(world, "v")?;
    Ok((parameters_u, parameters_v))
}

/// Knot vector for approximation, averaging runs of parameters so every knot
/// span receives data support. The boundary knots are clamped to 0 and 1.
pub fn place_knots(
    parameters: ArrayView1<f64>,
    degree: usize,
    control_point_count: usize,
) -> Result<Array1<f64>> {
    if control_point_count <= degree {
        return Err(NurbsError::InvalidConfiguration(format!(
            "A degree {degree} fit needs at least {} control points, got {control_point_count}.",
            degree + 1
        )));
    }
    if parameters.len() < control_point_count {
        return Err(NurbsError::InvalidConfiguration(format!(
            "Knot placement needs at least {control_point_count} parameters, got {}.",
            parameters.len()
        )));
    }

    let n = control_point_count - 1;
    let m = parameters.len() - 1;
    let mut knots = Array1::zeros(control_point_count + degree + 1);
    knots.slice_mut(s![control_point_count..]).fill(1.0);
    let stride = (m + 1) as f64 / (n - degree + 1) as f64;
    for j in 1..=(n - degree) {
        let position = j as f64 * stride;
        let k = position as usize;
        let alpha = position - k as f64;
        knots[degree + j] = (1.0 - alpha) * parameters[k - 1] + alpha * parameters[k];
    }
    Ok(knots)
}

/// Collocation matrix of the interior basis functions at the interior
/// parameters: entry `(r, c)` is `N_{c + 1}(parameters[r + 1])`. The first
/// and last parameters and basis functions are excluded because the fit pins
/// the boundary points instead of solving for them.
///
/// `parameters` and `knots` must be consistent with `control_point_count`,
/// as produced by [`grid_parameters`] and [`place_knots`].
pub fn basis_matrix(
    parameters: ArrayView1<f64>,
    degree: usize,
    control_point_count: usize,
    knots: ArrayView1<f64>,
) -> Array2<f64> {
    let interior = parameters.slice(s![1..parameters.len() - 1]);
    let mut matrix = Array2::zeros((interior.len(), control_point_count - 2));
    for (c, mut column) in matrix.axis_iter_mut(Axis(1)).enumerate() {
        let values = basis::one_basis_values(interior, c + 1, degree, knots);
        column.assign(&values);
    }
    matrix
}

/// Fits a B-spline surface with the requested degrees and control counts to
/// a `(rows, cols, 3)` grid of world points, returning a unit-weight
/// [`NurbsSurface`]. Custom clamped knot vectors may be supplied per axis;
/// by default they are placed from the averaged chord-length parameters.
///
/// The grid corners are interpolated exactly; interior control points solve
/// the two normal-equation systems, one per axis, each factored once and
/// reused across all lines and coordinate channels.
pub fn approximate_surface(
    world: ArrayView3<f64>,
    degree_u: usize,
    degree_v: usize,
    count_u: usize,
    count_v: usize,
    knots_u: Option<ArrayView1<f64>>,
    knots_v: Option<ArrayView1<f64>>,
) -> Result<NurbsSurface> {
    let (rows, cols, components) = world.dim();
    if components != 3 {
        return Err(ConstraintKind::WrongDimension {
            expected: 3,
            found: components,
        }
        .into());
    }
    for (axis, degree, count, samples) in [
        ("u", degree_u, count_u, rows),
        ("v", degree_v, count_v, cols),
    ] {
        if count <= degree {
            return Err(NurbsError::InvalidConfiguration(format!(
                "A degree {degree} fit needs at least {} control points along {axis}, got {count}.",
                degree + 1
            )));
        }
        if samples < count {
            return Err(NurbsError::InvalidConfiguration(format!(
                "Cannot fit {count} control points to {samples} samples along {axis}."
            )));
        }
    }

    let (parameters_u, parameters_v) = grid_parameters(world)?;
    let knots_u = resolve_knots(knots_u, &parameters_u, degree_u, count_u, "u")?;
    let knots_v = resolve_knots(knots_v, &parameters_v, degree_v, count_v, "v")?;
    log::info!(
        "Fitting a ({count_u}, {count_v}) control net to a ({rows}, {cols}) sample grid"
    );

    // First reduce every column line along u, then every row of the
    // intermediate net along v. The second pass works on a transposed view
    // and its output is transposed back.
    let intermediate = fit_axis(world, &parameters_u, degree_u, count_u, &knots_u, "u")?;
    let fitted = fit_axis(
        intermediate.view().permuted_axes([1, 0, 2]),
        &parameters_v,
        degree_v,
        count_v,
        &knots_v,
        "v",
    )?;
    let control_points = fitted.permuted_axes([1, 0, 2]);

    NurbsSurface::new(
        degree_u,
        degree_v,
        control_points,
        Array2::ones((count_u, count_v)),
        knots_u,
        knots_v,
    )
}

/// Chord-length parameters along the second axis of `lines`, averaged over
/// the first axis, with degenerate lines skipped.
fn averaged_chord_parameters(lines: ArrayView3<f64>, axis: &'static str) -> Result<Array1<f64>> {
    let point_count = lines.len_of(Axis(1));
    let last = point_count - 1;
    let mut parameters = Array1::zeros(point_count);
    parameters[last] = 1.0;

    let mut contributing = 0usize;
    let mut chords = vec![0.0; last];
    for line in lines.axis_iter(Axis(0)) {
        let mut total = 0.0;
        for k in 0..last {
            let mut squared = 0.0;
            for c in 0..3 {
                let step = line[[k + 1, c]] - line[[k, c]];
                squared += step * step;
            }
            chords[k] = squared.sqrt();
            total += chords[k];
        }
        if total == 0.0 {
            continue;
        }
        contributing += 1;
        let mut cumulative = 0.0;
        for k in 1..last {
            cumulative += chords[k - 1];
            parameters[k] += cumulative / total;
        }
    }
    if contributing == 0 {
        return Err(NurbsError::DegenerateInput { axis });
    }
    let scale = 1.0 / contributing as f64;
    for k in 1..last {
        parameters[k] *= scale;
    }
    Ok(parameters)
}

fn resolve_knots(
    overridden: Option<ArrayView1<f64>>,
    parameters: &Array1<f64>,
    degree: usize,
    control_point_count: usize,
    axis: &'static str,
) -> Result<Array1<f64>> {
    match overridden {
        Some(knots) => {
            let expected = control_point_count + degree + 1;
            if knots.len() != expected {
                return Err(NurbsError::InvalidConfiguration(format!(
                    "Expected a knot vector of length {expected} along {axis}, got {}.",
                    knots.len()
                )));
            }
            basis::validate_clamped_knots(knots, degree, control_point_count, axis)?;
            Ok(knots.to_owned())
        }
        None => place_knots(parameters.view(), degree, control_point_count),
    }
}

/// Least-squares reduction of every line of `data` along its first axis to
/// `count` control points. Input shape `(points, lines, 3)`, output
/// `(count, lines, 3)`, with the first and last data points of each line
/// carried over unchanged.
fn fit_axis(
    data: ArrayView3<f64>,
    parameters: &Array1<f64>,
    degree: usize,
    count: usize,
    knots: &Array1<f64>,
    axis: &'static str,
) -> Result<Array3<f64>> {
    let (points, lines, _) = data.dim();
    let mut fitted = Array3::zeros((count, lines, 3));
    for l in 0..lines {
        for c in 0..3 {
            fitted[[0, l, c]] = data[[0, l, c]];
            fitted[[count - 1, l, c]] = data[[points - 1, l, c]];
        }
    }
    let interior_count = count - 2;
    if interior_count == 0 {
        return Ok(fitted);
    }

    // The boundary control points are fixed, so their basis contributions
    // move to the right-hand side before the normal equations are formed.
    let interior = parameters.slice(s![1..points - 1]);
    let first_basis = basis::one_basis_values(interior, 0, degree, knots.view());
    let last_basis = basis::one_basis_values(interior, count - 1, degree, knots.view());
    let collocation = basis_matrix(parameters.view(), degree, count, knots.view());

    // One flattened right-hand-side column per (line, coordinate) pair, so
    // a single factorization serves the whole axis.
    let mut rhs = Array2::zeros((points - 2, lines * 3));
    for r in 0..points - 2 {
        for l in 0..lines {
            for c in 0..3 {
                rhs[[r, l * 3 + c]] = data[[r + 1, l, c]]
                    - first_basis[r] * data[[0, l, c]]
                    - last_basis[r] * data[[points - 1, l, c]];
            }
        }
    }

    let normal = collocation.t().dot(&collocation);
    let reduced = collocation.t().dot(&rhs);
    let factor = normal.lu().map_err(|err| {
        log::warn!("Normal equations along {axis} are singular: {err}");
        NurbsError::DegenerateInput { axis }
    })?;
    let solution = factor.solve_mat(&reduced);

    for i in 0..interior_count {
        for l in 0..lines {
            for c in 0..3 {
                fitted[[1 + i, l, c]] = solution[[i, l * 3 + c]];
            }
        }
    }
    Ok(fitted)
}
