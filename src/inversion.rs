//! Closest-point inversion: recovering `(u, v)` parameters from world-space
//! points. A coarse per-span sampling pass seeds a batched Newton iteration
//! on the squared-distance objective.

use crate::error::{ConstraintKind, NurbsError, Result};
use crate::surface::NurbsSurface;
use itertools::Itertools;
use ndarray::{Array1, Array2, Array4, ArrayView1, ArrayView2, ArrayView3, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Controls for the inversion search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InversionConfig {
    /// Seed samples per knot span and axis. The span endpoints are included,
    /// so 2 samples degenerate to the span boundaries.
    pub num_samples: usize,
    /// Exponent of the L^p norm used for distances. 2 selects the ordinary
    /// Euclidean distance and takes a cheaper code path.
    pub norm_p: f64,
    /// Newton iterations allowed after seeding. 0 means classify the seeds
    /// and fail for any target that is not already converged.
    pub max_iters: usize,
    /// A target converges when its distance to the surface drops below this.
    pub distance_tolerance: f64,
    /// A target also converges when the residual is this close to orthogonal
    /// to both tangents, which covers points off the surface.
    pub cosine_tolerance: f64,
}

impl Default for InversionConfig {
    fn default() -> Self {
        Self {
            num_samples: 8,
            norm_p: 2.0,
            max_iters: 100,
            distance_tolerance: 1e-5,
            cosine_tolerance: 1e-7,
        }
    }
}

impl InversionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_samples < 2 {
            return Err(NurbsError::InvalidConfiguration(format!(
                "`num_samples` must be at least 2 to cover each span, got {}.",
                self.num_samples
            )));
        }
        if !(self.norm_p >= 1.0 && self.norm_p.is_finite()) {
            return Err(NurbsError::InvalidConfiguration(format!(
                "`norm_p` must be a finite exponent >= 1, got {}.",
                self.norm_p
            )));
        }
        for (name, value) in [
            ("distance_tolerance", self.distance_tolerance),
            ("cosine_tolerance", self.cosine_tolerance),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(NurbsError::InvalidConfiguration(format!(
                    "`{name}` must be positive and finite, got {value}."
                )));
            }
        }
        Ok(())
    }
}

/// Seed parameters along one axis: `num_samples` evenly spaced values per
/// knot span, with the shared span boundaries emitted once and the domain
/// maximum appended at the end.
pub fn candidate_parameters(
    knots: ArrayView1<f64>,
    degree: usize,
    control_point_count: usize,
    num_samples: usize,
) -> Array1<f64> {
    let spans = control_point_count - degree;
    let mut samples = Vec::with_capacity(spans * (num_samples - 1) + 1);
    for span in degree..control_point_count {
        let start = knots[span];
        let width = knots[span + 1] - start;
        for i in 0..(num_samples - 1) {
            samples.push(start + width * i as f64 / (num_samples - 1) as f64);
        }
    }
    samples.push(knots[control_point_count]);
    Array1::from_vec(samples)
}

/// Nearest seed parameters for each target over the cartesian candidate
/// grid. Ties go to the first grid point in u-major order.
pub fn coarse_search(
    surface: &NurbsSurface,
    targets: ArrayView2<f64>,
    config: &InversionConfig,
) -> Result<Array2<f64>> {
    surface.validate()?;
    config.validate()?;
    check_target_width(targets)?;

    let (count_u, count_v, _) = surface.control_points.dim();
    let candidates_u = candidate_parameters(
        surface.knots_u.view(),
        surface.degree_u,
        count_u,
        config.num_samples,
    );
    let candidates_v = candidate_parameters(
        surface.knots_v.view(),
        surface.degree_v,
        count_v,
        config.num_samples,
    );

    let pairs: Vec<(f64, f64)> = candidates_u
        .iter()
        .cartesian_product(candidates_v.iter())
        .map(|(&u, &v)| (u, v))
        .collect();
    let grid_u = Array1::from_iter(pairs.iter().map(|pair| pair.0));
    let grid_v = Array1::from_iter(pairs.iter().map(|pair| pair.1));
    let grid_points = surface.evaluate(grid_u.view(), grid_v.view())?;
    log::debug!(
        "Coarse search over {} candidate pairs for {} targets",
        pairs.len(),
        targets.nrows()
    );

    let mut seeds = Array2::zeros((targets.nrows(), 2));
    Zip::from(seeds.rows_mut())
        .and(targets.rows())
        .par_for_each(|mut seed, target| {
            let mut best_distance = f64::INFINITY;
            let mut best_index = 0;
            for (index, point) in grid_points.rows().into_iter().enumerate() {
                let distance = lp_norm3(
                    [
                        point[0] - target[0],
                        point[1] - target[1],
                        point[2] - target[2],
                    ],
                    config.norm_p,
                );
                if distance < best_distance {
                    best_distance = distance;
                    best_index = index;
                }
            }
            seed[0] = grid_u[best_index];
            seed[1] = grid_v[best_index];
        });
    Ok(seeds)
}

/// Batched Newton refinement from coarse seeds, returning the recovered
/// `(u, v)` rows and each target's residual distance to the surface. See
/// [`NurbsSurface::invert_points`] for the public entry point.
pub(crate) fn invert_points(
    surface: &NurbsSurface,
    targets: ArrayView2<f64>,
    config: &InversionConfig,
) -> Result<(Array2<f64>, Array1<f64>)> {
    config.validate()?;
    check_target_width(targets)?;
    let total = targets.nrows();
    let seeds = coarse_search(surface, targets, config)?;
    let mut params_u = seeds.column(0).to_owned();
    let mut params_v = seeds.column(1).to_owned();
    log::info!(
        "Inverting {total} points, at most {} Newton iterations",
        config.max_iters
    );

    let (mut derivatives, mut differences, mut distances) =
        residuals(surface, &params_u, &params_v, targets, config.norm_p)?;
    let mut converged = Array1::from_elem(total, false);
    let mut iteration = 0;
    loop {
        // A target is done once it sits on the surface within tolerance, or
        // once its residual is orthogonal to both tangents (the closest
        // point to a target away from the surface). Marks are sticky.
        Zip::from(&mut converged)
            .and(&distances)
            .and(differences.rows())
            .and(derivatives.axis_iter(Axis(0)))
            .par_for_each(|flag, &distance, difference, table| {
                if *flag {
                    return;
                }
                if distance <= config.distance_tolerance {
                    *flag = true;
                    return;
                }
                let tangent_u = tangent(&table, 1, 0);
                let tangent_v = tangent(&table, 0, 1);
                let norm_u = lp_norm3(tangent_u, config.norm_p);
                let norm_v = lp_norm3(tangent_v, config.norm_p);
                if norm_u > 0.0 && norm_v > 0.0 {
                    let residual = [difference[0], difference[1], difference[2]];
                    let cos_u = dot3(tangent_u, residual).abs() / (norm_u * distance);
                    let cos_v = dot3(tangent_v, residual).abs() / (norm_v * distance);
                    if cos_u <= config.cosine_tolerance && cos_v <= config.cosine_tolerance {
                        *flag = true;
                    }
                }
            });

        let remaining = converged.iter().filter(|&&done| !done).count();
        if remaining == 0 {
            log::info!("All {total} points converged after {iteration} iterations");
            break;
        }
        if iteration == config.max_iters {
            log::warn!(
                "{remaining} of {total} points failed to converge within {} iterations",
                config.max_iters
            );
            return Err(NurbsError::NoConvergence {
                unconverged: remaining,
                total,
                max_iters: config.max_iters,
            });
        }
        log::debug!("Iteration {iteration}: {remaining} of {total} points remaining");

        // The step-size stop below compares against the tangents at the
        // point we stepped from, so they are saved before the update.
        let previous_u = params_u.clone();
        let previous_v = params_v.clone();
        let mut tangents_u = Array2::zeros((total, 3));
        let mut tangents_v = Array2::zeros((total, 3));
        Zip::from(tangents_u.rows_mut())
            .and(tangents_v.rows_mut())
            .and(derivatives.axis_iter(Axis(0)))
            .par_for_each(|mut along_u, mut along_v, table| {
                for c in 0..3 {
                    along_u[c] = table[[1, 0, c]];
                    along_v[c] = table[[0, 1, c]];
                }
            });

        Zip::from(&mut params_u)
            .and(&mut params_v)
            .and(&converged)
            .and(derivatives.axis_iter(Axis(0)))
            .and(differences.rows())
            .par_for_each(|u, v, &done, table, difference| {
                if done {
                    return;
                }
                let residual = [difference[0], difference[1], difference[2]];
                let tangent_u = tangent(&table, 1, 0);
                let tangent_v = tangent(&table, 0, 1);
                // Newton step on f = |S(u, v) - target|^2 / 2; the Hessian
                // entries mix first and second derivatives.
                let j00 = lp_norm3(tangent_u, config.norm_p).powi(2)
                    + dot3(residual, tangent(&table, 2, 0));
                let j01 =
                    dot3(tangent_u, tangent_v) + dot3(residual, tangent(&table, 1, 1));
                let j11 = lp_norm3(tangent_v, config.norm_p).powi(2)
                    + dot3(residual, tangent(&table, 0, 2));
                let rhs_u = -dot3(residual, tangent_u);
                let rhs_v = -dot3(residual, tangent_v);
                let determinant = j00 * j11 - j01 * j01;
                let step_u = (rhs_u * j11 - rhs_v * j01) / determinant;
                let step_v = (j00 * rhs_v - j01 * rhs_u) / determinant;
                // Singular systems produce non-finite steps; those targets
                // hold their parameters and wait for the iteration cap.
                if step_u.is_finite() && step_v.is_finite() {
                    *u = (*u + step_u).clamp(0.0, 1.0);
                    *v = (*v + step_v).clamp(0.0, 1.0);
                }
            });

        let refreshed = residuals(surface, &params_u, &params_v, targets, config.norm_p)?;
        derivatives = refreshed.0;
        differences = refreshed.1;
        distances = refreshed.2;

        // Stop criterion for stalled steps: the world-space motion implied
        // by the parameter change, measured with the pre-update tangents.
        let delta_u = &params_u - &previous_u;
        let delta_v = &params_v - &previous_v;
        Zip::from(&mut converged)
            .and(&delta_u)
            .and(&delta_v)
            .and(tangents_u.rows())
            .and(tangents_v.rows())
            .par_for_each(|flag, &du, &dv, along_u, along_v| {
                if *flag {
                    return;
                }
                let motion = [
                    du * along_u[0] + dv * along_v[0],
                    du * along_u[1] + dv * along_v[1],
                    du * along_u[2] + dv * along_v[2],
                ];
                if lp_norm3(motion, config.norm_p) <= config.distance_tolerance {
                    *flag = true;
                }
            });

        iteration += 1;
    }

    // The last refresh already evaluated the returned parameters, so the
    // distance array matches them without another surface pass.
    let mut parameters = Array2::zeros((total, 2));
    for i in 0..total {
        parameters[[i, 0]] = params_u[i];
        parameters[[i, 1]] = params_v[i];
    }
    Ok((parameters, distances))
}

/// Order-2 derivative tables plus residual vectors and distances for the
/// current parameter estimates.
fn residuals(
    surface: &NurbsSurface,
    params_u: &Array1<f64>,
    params_v: &Array1<f64>,
    targets: ArrayView2<f64>,
    norm_p: f64,
) -> Result<(Array4<f64>, Array2<f64>, Array1<f64>)> {
    let derivatives = surface.derivatives(params_u.view(), params_v.view(), 2)?;
    let mut differences = Array2::zeros((targets.nrows(), 3));
    let mut distances = Array1::zeros(targets.nrows());
    Zip::from(differences.rows_mut())
        .and(&mut distances)
        .and(targets.rows())
        .and(derivatives.axis_iter(Axis(0)))
        .par_for_each(|mut difference, distance, target, table| {
            for c in 0..3 {
                difference[c] = table[[0, 0, c]] - target[c];
            }
            *distance = lp_norm3(
                [difference[0], difference[1], difference[2]],
                norm_p,
            );
        });
    Ok((derivatives, differences, distances))
}

fn check_target_width(targets: ArrayView2<f64>) -> Result<()> {
    if targets.ncols() != 3 {
        return Err(ConstraintKind::WrongDimension {
            expected: 3,
            found: targets.ncols(),
        }
        .into());
    }
    Ok(())
}

fn tangent(table: &ArrayView3<f64>, order_u: usize, order_v: usize) -> [f64; 3] {
    [
        table[[order_u, order_v, 0]],
        table[[order_u, order_v, 1]],
        table[[order_u, order_v, 2]],
    ]
}

fn dot3(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn lp_norm3(vector: [f64; 3], p: f64) -> f64 {
    if p == 2.0 {
        return (vector[0] * vector[0] + vector[1] * vector[1] + vector[2] * vector[2]).sqrt();
    }
    (vector[0].abs().powf(p) + vector[1].abs().powf(p) + vector[2].abs().powf(p)).powf(1.0 / p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    /// Flat bilinear patch mapping (u, v) to (u, v, 0).
    fn planar_patch() -> NurbsSurface {
        let mut control_points = Array3::zeros((2, 2, 3));
        for i in 0..2 {
            for j in 0..2 {
                control_points[[i, j, 0]] = i as f64;
                control_points[[i, j, 1]] = j as f64;
            }
        }
        NurbsSurface::new(
            1,
            1,
            control_points,
            Array2::ones((2, 2)),
            array![0.0, 0.0, 1.0, 1.0],
            array![0.0, 0.0, 1.0, 1.0],
        )
        .unwrap()
    }

    /// Quadratic dome: a 3x3 net with the center raised to z = 1.
    fn dome_patch() -> NurbsSurface {
        let mut control_points = Array3::zeros((3, 3, 3));
        for i in 0..3 {
            for j in 0..3 {
                control_points[[i, j, 0]] = i as f64 / 2.0;
                control_points[[i, j, 1]] = j as f64 / 2.0;
            }
        }
        control_points[[1, 1, 2]] = 1.0;
        NurbsSurface::new(
            2,
            2,
            control_points,
            Array2::ones((3, 3)),
            array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0],
            array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0],
        )
        .unwrap()
    }

    #[test]
    fn test_default_config_values() {
        let config = InversionConfig::default();
        assert_eq!(config.num_samples, 8);
        assert_eq!(config.norm_p, 2.0);
        assert_eq!(config.max_iters, 100);
        assert_eq!(config.distance_tolerance, 1e-5);
        assert_eq!(config.cosine_tolerance, 1e-7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_rejects_bad_values() {
        for config in [
            InversionConfig {
                num_samples: 1,
                ..Default::default()
            },
            InversionConfig {
                norm_p: 0.5,
                ..Default::default()
            },
            InversionConfig {
                norm_p: f64::NAN,
                ..Default::default()
            },
            InversionConfig {
                distance_tolerance: 0.0,
                ..Default::default()
            },
            InversionConfig {
                cosine_tolerance: -1e-7,
                ..Default::default()
            },
        ] {
            match config.validate() {
                Err(NurbsError::InvalidConfiguration(_)) => {}
                other => panic!("Expected InvalidConfiguration, got {other:?}"),
            }
        }
        // An iteration budget of zero is a legitimate "classify only" run.
        let classify_only = InversionConfig {
            max_iters: 0,
            ..Default::default()
        };
        assert!(classify_only.validate().is_ok());
    }

    #[test]
    fn test_candidate_parameters_cover_every_span() {
        // Two spans, three samples each: the interior samples of each span
        // plus the shared boundary and the appended domain maximum.
        let knots = array![0.0, 0.0, 0.0, 0.5, 1.0, 1.0, 1.0];
        let candidates = candidate_parameters(knots.view(), 2, 4, 3);
        let expected = array![0.0, 0.25, 0.5, 0.75, 1.0];
        assert_eq!(candidates.len(), expected.len());
        for (got, want) in candidates.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn test_candidate_parameters_single_span() {
        let knots = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let candidates = candidate_parameters(knots.view(), 2, 3, 4);
        let expected = array![0.0, 1.0 / 3.0, 2.0 / 3.0, 1.0];
        assert_eq!(candidates.len(), expected.len());
        for (got, want) in candidates.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn test_coarse_search_snaps_to_nearest_grid_point() {
        let surface = planar_patch();
        let config = InversionConfig {
            num_samples: 5,
            ..Default::default()
        };
        // Candidates per axis are [0, 0.25, 0.5, 0.75, 1]; the first target
        // sits exactly on a grid point, the second rounds to one.
        let targets = array![[0.25, 0.75, 0.0], [0.26, 0.74, 0.0]];
        let seeds = coarse_search(&surface, targets.view(), &config).unwrap();
        for row in 0..2 {
            assert!((seeds[[row, 0]] - 0.25).abs() < 1e-12);
            assert!((seeds[[row, 1]] - 0.75).abs() < 1e-12);
        }
    }

    #[test]
    fn test_invert_recovers_planar_parameters() {
        let surface = planar_patch();
        let config = InversionConfig::default();
        let targets = array![
            [0.12, 0.88, 0.0],
            [0.5, 0.5, 0.0],
            [0.99, 0.01, 0.0],
            [0.0, 1.0, 0.0]
        ];
        let (parameters, distances) = surface.invert_points(targets.view(), &config).unwrap();
        for i in 0..targets.nrows() {
            assert!((parameters[[i, 0]] - targets[[i, 0]]).abs() < 1e-4);
            assert!((parameters[[i, 1]] - targets[[i, 1]]).abs() < 1e-4);
            // The targets lie on the patch, so the residuals vanish.
            assert!(distances[i] < 1e-4);
        }
    }

    #[test]
    fn test_invert_point_above_surface_uses_orthogonality() {
        // The target floats above the plane, so the distance criterion can
        // never fire; the residual is orthogonal to both tangents instead.
        let surface = planar_patch();
        let config = InversionConfig::default();
        let targets = array![[0.5, 0.5, 1.0]];
        let (parameters, distances) = surface.invert_points(targets.view(), &config).unwrap();
        assert!((parameters[[0, 0]] - 0.5).abs() < 1e-4);
        assert!((parameters[[0, 1]] - 0.5).abs() < 1e-4);
        // The reported residual is the height of the target over its foot.
        assert!((distances[0] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_invert_roundtrip_on_dome() {
        let surface = dome_patch();
        let config = InversionConfig::default();
        let us = array![0.1, 0.37, 0.62, 0.9];
        let vs = array![0.8, 0.68, 0.2, 0.45];
        let targets = surface.evaluate(us.view(), vs.view()).unwrap();
        let (parameters, distances) = surface.invert_points(targets.view(), &config).unwrap();
        assert!(distances.iter().all(|&distance| distance < 1e-4));
        // Compare in world space; the dome has no self-intersections, so
        // the recovered parameters must map back onto the targets.
        let images = surface
            .evaluate(
                parameters.column(0).to_owned().view(),
                parameters.column(1).to_owned().view(),
            )
            .unwrap();
        for (got, want) in images.iter().zip(targets.iter()) {
            assert!((got - want).abs() < 1e-4);
        }
    }

    #[test]
    fn test_zero_iterations_fails_for_off_grid_target() {
        let surface = dome_patch();
        let config = InversionConfig {
            num_samples: 3,
            max_iters: 0,
            ..Default::default()
        };
        // Off every coarse sample and well off the surface normal criteria.
        let off_grid = surface
            .evaluate(array![0.37].view(), array![0.68].view())
            .unwrap();
        match surface.invert_points(off_grid.view(), &config) {
            Err(NurbsError::NoConvergence {
                unconverged: 1,
                total: 1,
                max_iters: 0,
            }) => {}
            other => panic!("Expected NoConvergence, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_iterations_succeeds_for_seed_hit() {
        let surface = dome_patch();
        let config = InversionConfig {
            num_samples: 5,
            max_iters: 0,
            ..Default::default()
        };
        // (0.25, 0.5) is one of the coarse candidates, so the seed already
        // satisfies the distance criterion without any Newton steps.
        let target = surface
            .evaluate(array![0.25].view(), array![0.5].view())
            .unwrap();
        let (parameters, distances) = surface.invert_points(target.view(), &config).unwrap();
        assert!((parameters[[0, 0]] - 0.25).abs() < 1e-12);
        assert!((parameters[[0, 1]] - 0.5).abs() < 1e-12);
        assert!(distances[0] <= config.distance_tolerance);
    }

    #[test]
    fn test_invert_rejects_planar_targets() {
        let surface = planar_patch();
        let config = InversionConfig::default();
        let targets = Array2::zeros((2, 2));
        match surface.invert_points(targets.view(), &config) {
            Err(NurbsError::ConstraintViolation(ConstraintKind::WrongDimension {
                expected: 3,
                found: 2,
            })) => {}
            other => panic!("Expected WrongDimension, got {other:?}"),
        }
    }
}
