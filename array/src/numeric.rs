//! Bracketed root finding used by every numeric inversion in the crate.
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum RootFindError {
    #[error("Root not bracketed: f({lower}) = {f_lower}, f({upper}) = {f_upper}")]
    NotBracketed {
        lower: f64,
        upper: f64,
        f_lower: f64,
        f_upper: f64,
    },
    #[error("No convergence after {0} iterations")]
    NoConvergence(usize),
    #[error("Function is not finite at {0}")]
    NotFinite(f64),
}

#[derive(Clone, Copy, Debug)]
pub struct RootFinder {
    pub relative_tolerance: f64,
    pub absolute_tolerance: f64,
    pub max_iterations: usize,
}

impl Default for RootFinder {
    fn default() -> Self {
        Self {
            relative_tolerance: 1e-12,
            absolute_tolerance: 1e-12,
            max_iterations: 200,
        }
    }
}

impl RootFinder {
    /// Brent's method on `[lower, upper]`; `f(lower)` and `f(upper)` must differ in sign
    /// (or one of them be zero).
    pub fn brent<F: Fn(f64) -> f64>(
        &self,
        f: F,
        lower: f64,
        upper: f64,
    ) -> Result<f64, RootFindError> {
        let (mut a, mut b) = (lower, upper);
        let (mut fa, mut fb) = (f(a), f(b));
        if !fa.is_finite() {
            return Err(RootFindError::NotFinite(a));
        }
        if !fb.is_finite() {
            return Err(RootFindError::NotFinite(b));
        }
        if fa == 0.0 {
            return Ok(a);
        }
        if fb == 0.0 {
            return Ok(b);
        }
        if fa.signum() == fb.signum() {
            return Err(RootFindError::NotBracketed {
                lower,
                upper,
                f_lower: fa,
                f_upper: fb,
            });
        }

        let tolerance =
            self.absolute_tolerance + self.relative_tolerance * lower.abs().max(upper.abs());
        let (mut c, mut fc) = (b, fb);
        let mut d = b - a;
        let mut e = d;

        for _ in 0..self.max_iterations {
            if fb.signum() == fc.signum() {
                c = a;
                fc = fa;
                d = b - a;
                e = d;
            }
            if fc.abs() < fb.abs() {
                a = b;
                b = c;
                c = a;
                fa = fb;
                fb = fc;
                fc = fa;
            }
            let tol1 = 2.0 * f64::EPSILON * b.abs() + 0.5 * tolerance;
            let xm = 0.5 * (c - b);
            if xm.abs() <= tol1 || fb == 0.0 {
                return Ok(b);
            }
            if e.abs() >= tol1 && fa.abs() > fb.abs() {
                // Attempt inverse quadratic interpolation
                let s = fb / fa;
                let (mut p, mut q) = if a == c {
                    (2.0 * xm * s, 1.0 - s)
                } else {
                    let q = fa / fc;
                    let r = fb / fc;
                    (
                        s * (2.0 * xm * q * (q - r) - (b - a) * (r - 1.0)),
                        (q - 1.0) * (r - 1.0) * (s - 1.0),
                    )
                };
                if p > 0.0 {
                    q = -q;
                }
                p = p.abs();
                let min1 = 3.0 * xm * q - (tol1 * q).abs();
                let min2 = (e * q).abs();
                if 2.0 * p < min1.min(min2) {
                    e = d;
                    d = p / q;
                } else {
                    d = xm;
                    e = d;
                }
            } else {
                d = xm;
                e = d;
            }
            a = b;
            fa = fb;
            b += if d.abs() > tol1 { d } else { tol1.copysign(xm) };
            fb = f(b);
            if !fb.is_finite() {
                return Err(RootFindError::NotFinite(b));
            }
        }
        Err(RootFindError::NoConvergence(self.max_iterations))
    }

    /// Solves `f(x) = target` for a strictly increasing `f` on `[lower, upper]`.
    pub fn invert_increasing<F: Fn(f64) -> f64>(
        &self,
        f: F,
        target: f64,
        lower: f64,
        upper: f64,
    ) -> Result<f64, RootFindError> {
        self.brent(|x| f(x) - target, lower, upper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn square_root() {
        let root = RootFinder::default().brent(|x| x * x - 2.0, 0.0, 2.0).unwrap();
        assert_approx_eq!(root, 2f64.sqrt(), 1e-10);
    }

    #[test]
    fn cubic_with_flat_region() {
        let root = RootFinder::default()
            .brent(|x| (x - 1.0).powi(3), -3.0, 4.0)
            .unwrap();
        assert_approx_eq!(root, 1.0, 1e-4);
    }

    #[test]
    fn root_on_bound() {
        let root = RootFinder::default().brent(|x| x - 3.0, 3.0, 5.0).unwrap();
        assert_eq!(root, 3.0);
    }

    #[test]
    fn not_bracketed() {
        let result = RootFinder::default().brent(|x| x * x + 1.0, -1.0, 1.0);
        assert!(matches!(result, Err(RootFindError::NotBracketed { .. })));
    }

    #[test]
    fn inverse_of_exponential() {
        let x = RootFinder::default()
            .invert_increasing(f64::exp, 10.0, 0.0, 5.0)
            .unwrap();
        assert_approx_eq!(x, 10f64.ln(), 1e-10);
    }
}
