use crate::{UNIT_ROUNDOFF, error::EvalResult};

const MAX_BRENT_ITERATIONS: usize = 100;

/// The closest points on either side of a 1-D root seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct Bracket {
    /// `(x, f)` with the largest `f ≤ 0`.
    below: Option<(f64, f64)>,
    /// `(x, f)` with the smallest `f > 0`.
    above: Option<(f64, f64)>,
}

impl Bracket {
    pub(crate) fn record(&mut self, x: f64, f: f64) {
        if !(x.is_finite() && f.is_finite()) {
            return;
        }
        if f <= 0.0 {
            if self.below.is_none_or(|(_, fb)| f > fb) {
                self.below = Some((x, f));
            }
        } else if self.above.is_none_or(|(_, fa)| f < fa) {
            self.above = Some((x, f));
        }
    }

    /// Both sides, if a sign change has been seen.
    pub(crate) fn interval(&self) -> Option<((f64, f64), (f64, f64))> {
        Some((self.below?, self.above?))
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct BrentOutcome {
    pub x: f64,
    pub f: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Brent's zero-in on `[a, b]`, where `f(a)` and `f(b)` must differ in sign.
///
/// Stops when the bracket is narrower than `2ε|x| + xtol/2` or an exact zero
/// is hit. Errors from `f` are passed straight back.
pub(crate) fn find_root(
    mut f: impl FnMut(f64) -> EvalResult<f64>,
    (mut a, mut fa): (f64, f64),
    (mut b, mut fb): (f64, f64),
    xtol: f64,
) -> EvalResult<BrentOutcome> {
    if fa == 0.0 {
        return Ok(BrentOutcome {
            x: a,
            f: fa,
            iterations: 0,
            converged: true,
        });
    }
    let (mut c, mut fc) = (b, fb);
    let mut d = b - a;
    let mut e = d;
    for iteration in 0..MAX_BRENT_ITERATIONS {
        if (fb > 0.0 && fc > 0.0) || (fb < 0.0 && fc < 0.0) {
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
        let tol1 = 2.0 * UNIT_ROUNDOFF * b.abs() + 0.5 * xtol;
        let xm = 0.5 * (c - b);
        if xm.abs() <= tol1 || fb == 0.0 {
            return Ok(BrentOutcome {
                x: b,
                f: fb,
                iterations: iteration,
                converged: true,
            });
        }
        if e.abs() >= tol1 && fa.abs() > fb.abs() {
            // Inverse quadratic interpolation, or secant when only two points are distinct.
            let s = fb / fa;
            let mut p;
            let mut q;
            if a == c {
                p = 2.0 * xm * s;
                q = 1.0 - s;
            } else {
                let qa = fa / fc;
                let r = fb / fc;
                p = s * (2.0 * xm * qa * (qa - r) - (b - a) * (r - 1.0));
                q = (qa - 1.0) * (r - 1.0) * (s - 1.0);
            }
            if p > 0.0 {
                q = -q;
            }
            p = p.abs();
            let min1 = 3.0 * xm * q - (tol1 * q).abs();
            let min2 = (e * q).abs();
            if 2.0 * p < libm::fmin(min1, min2) {
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
        fb = f(b)?;
    }
    Ok(BrentOutcome {
        x: b,
        f: fb,
        iterations: MAX_BRENT_ITERATIONS,
        converged: false,
    })
}
