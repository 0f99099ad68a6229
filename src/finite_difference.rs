use std::convert::Infallible;

use na::{DMatrix, DVector};

use crate::types::Float;

/// Ridders' extrapolation parameters
const RIDDERS_STEP_SHRINK: Float = 1.4;
const RIDDERS_TABLE_SIZE: usize = 10;
const RIDDERS_SAFE: Float = 2.0;

/// Central-difference Jacobian of a vector function of `dim` inputs.
///
/// `f(eps, i)` must return the function value with input `i` perturbed by
/// `eps` (and every other input at its nominal value). Column i of the
/// result is df/dx_i.
///
/// With `use_ridders`, each column is refined by Ridders' polynomial
/// extrapolation, starting from step `eps` and shrinking it geometrically.
/// Ref: Numerical Recipes, 3rd ed., 5.7 Numerical Derivatives
pub fn try_finite_difference_jacobian<F, E>(
    mut f: F,
    dim: usize,
    eps: Float,
    use_ridders: bool,
) -> Result<DMatrix<Float>, E>
where
    F: FnMut(Float, usize) -> Result<DVector<Float>, E>,
{
    let mut columns: Vec<DVector<Float>> = Vec::with_capacity(dim);
    for i in 0..dim {
        let column = if use_ridders {
            ridders_column(&mut f, i, eps)?
        } else {
            central_difference(&mut f, i, eps)?
        };
        columns.push(column);
    }

    if columns.is_empty() {
        return Ok(DMatrix::zeros(0, 0));
    }
    Ok(DMatrix::from_columns(&columns))
}

pub fn finite_difference_jacobian<F>(
    mut f: F,
    dim: usize,
    eps: Float,
    use_ridders: bool,
) -> DMatrix<Float>
where
    F: FnMut(Float, usize) -> DVector<Float>,
{
    let result: Result<_, Infallible> =
        try_finite_difference_jacobian(|eps, i| Ok(f(eps, i)), dim, eps, use_ridders);
    match result {
        Ok(jac) => jac,
        Err(never) => match never {},
    }
}

/// Gradient of a scalar function of `dim` inputs, see
/// `try_finite_difference_jacobian`.
pub fn try_finite_difference_gradient<F, E>(
    mut f: F,
    dim: usize,
    eps: Float,
    use_ridders: bool,
) -> Result<DVector<Float>, E>
where
    F: FnMut(Float, usize) -> Result<Float, E>,
{
    let jac = try_finite_difference_jacobian(
        |eps, i| f(eps, i).map(|v| DVector::from_element(1, v)),
        dim,
        eps,
        use_ridders,
    )?;
    if dim == 0 {
        return Ok(DVector::zeros(0));
    }
    Ok(jac.row(0).transpose())
}

fn central_difference<F, E>(f: &mut F, i: usize, eps: Float) -> Result<DVector<Float>, E>
where
    F: FnMut(Float, usize) -> Result<DVector<Float>, E>,
{
    let plus = f(eps, i)?;
    let minus = f(-eps, i)?;
    Ok((plus - minus) / (2. * eps))
}

fn ridders_column<F, E>(f: &mut F, i: usize, eps: Float) -> Result<DVector<Float>, E>
where
    F: FnMut(Float, usize) -> Result<DVector<Float>, E>,
{
    let con2 = RIDDERS_STEP_SHRINK * RIDDERS_STEP_SHRINK;
    let mut step = eps;

    // tab[k][j]: j-th extrapolation built from the k-th step size
    let mut tab: Vec<Vec<DVector<Float>>> = Vec::with_capacity(RIDDERS_TABLE_SIZE);
    tab.push(vec![central_difference(f, i, step)?]);
    let mut best = tab[0][0].clone();
    let mut best_error = Float::INFINITY;

    for k in 1..RIDDERS_TABLE_SIZE {
        step /= RIDDERS_STEP_SHRINK;
        let mut row = vec![central_difference(f, i, step)?];

        let mut fac = con2;
        for j in 1..=k {
            let extrapolated = (&row[j - 1] * fac - &tab[k - 1][j - 1]) / (fac - 1.);
            fac *= con2;

            let error = (&extrapolated - &row[j - 1])
                .amax()
                .max((&extrapolated - &tab[k - 1][j - 1]).amax());
            if error <= best_error {
                best_error = error;
                best = extrapolated.clone();
            }
            row.push(extrapolated);
        }

        // Stop once higher order makes the error significantly worse
        let diverged = (&row[k] - &tab[k - 1][k - 1]).amax() >= RIDDERS_SAFE * best_error;
        tab.push(row);
        if diverged {
            break;
        }
    }

    Ok(best)
}

#[cfg(test)]
mod finite_difference_tests {
    use na::dvector;

    use super::*;
    use crate::{assert_close, assert_vec_close};

    #[test]
    fn ridders_is_much_tighter_than_plain_central_difference() {
        // Arrange
        let x0: DVector<Float> = dvector![0.7, -1.3];
        let f = |x: &DVector<Float>| dvector![(3. * x[0]).sin() * x[1].exp(), x[0] * x[0] * x[1]];
        let expected = DMatrix::from_row_slice(
            2,
            2,
            &[
                3. * (3. * x0[0]).cos() * x0[1].exp(),
                (3. * x0[0]).sin() * x0[1].exp(),
                2. * x0[0] * x0[1],
                x0[0] * x0[0],
            ],
        );
        let perturbed = |eps: Float, i: usize| {
            let mut x = x0.clone();
            x[i] += eps;
            f(&x)
        };

        // Act
        let ridders = finite_difference_jacobian(perturbed, 2, 1e-2, true);
        let central = finite_difference_jacobian(perturbed, 2, 1e-2, false);

        // Assert
        assert_vec_close!(ridders, &expected, 1e-9);
        assert!((central - &expected).amax() > 1e-6);
    }

    #[test]
    fn gradient_propagates_errors() {
        let result: Result<DVector<Float>, &str> =
            try_finite_difference_gradient(|_, _| Err("boom"), 3, 1e-3, true);
        assert_eq!(result, Err("boom"));
    }

    #[test]
    fn gradient_of_quadratic() {
        let grad = try_finite_difference_gradient::<_, Infallible>(
            |eps, i| {
                let mut x = dvector![1., 2., 3.];
                x[i] += eps;
                Ok(x.norm_squared())
            },
            3,
            1e-3,
            false,
        )
        .unwrap();
        assert_close!(grad[2], 6., 1e-9);
    }
}
