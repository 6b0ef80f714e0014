//! Keeping Newton steps inside the box `[min, max]`.
use crate::UNIT_ROUNDOFF;

/// Which side of the box a bound is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundKind {
    /// Lower bound.
    Min,
    /// Upper bound.
    Max,
}

/// What a bound did to the most recent step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoundClass {
    /// The step does not reach the bound.
    #[default]
    Inactive,
    /// The bound shortened the whole step.
    Limiting,
    /// The variable was pinned to the bound and the rest of the step kept its length.
    Active,
}

/// One finite half-bound of one variable.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundDescriptor {
    /// Index of the variable.
    pub index: usize,
    /// Lower or upper.
    pub kind: BoundKind,
    /// The bound itself.
    pub value: f64,
    /// Classification from the last call to [`Bounds::limit_step`].
    pub class: BoundClass,
}

impl BoundDescriptor {
    /// Would moving by `step` from the current value leave the box on this side?
    /// `distance` is the admissible move towards the bound.
    fn crossed_by(&self, distance: f64, step: f64) -> bool {
        match self.kind {
            BoundKind::Max => step > distance,
            BoundKind::Min => step < distance,
        }
    }

    /// Is the current value already on the wrong side of this bound?
    fn violated_by(&self, distance: f64) -> bool {
        match self.kind {
            BoundKind::Max => distance < 0.0,
            BoundKind::Min => distance > 0.0,
        }
    }
}

/// Outcome of limiting one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLimit {
    /// Multiplier applied to the free components of the step.
    pub ratio: f64,
    /// Number of variables pinned to a bound.
    pub active: usize,
    /// Variable whose bound shortened the step, if any.
    pub limiting: Option<usize>,
    /// Variable whose step-size cap shortened the step, if any.
    pub range_limited: Option<usize>,
}

/// All finite bounds of a block plus the per-variable range caps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bounds {
    descriptors: Vec<BoundDescriptor>,
    /// `range * step_limit_factor` when both bounds are finite with the same sign.
    range_limits: Vec<f64>,
    /// Distance to move a pinned variable, per variable.
    pins: Vec<Option<f64>>,
}

impl Bounds {
    /// Build descriptors for every finite bound.
    pub fn new(min: &[f64], max: &[f64], step_limit_factor: Option<f64>) -> Self {
        debug_assert_eq!(min.len(), max.len());
        let mut descriptors = Vec::new();
        let mut range_limits = Vec::with_capacity(min.len());
        for (index, (&lo, &hi)) in min.iter().zip(max).enumerate() {
            if hi.is_finite() {
                descriptors.push(BoundDescriptor {
                    index,
                    kind: BoundKind::Max,
                    value: hi,
                    class: BoundClass::Inactive,
                });
            }
            if lo.is_finite() {
                descriptors.push(BoundDescriptor {
                    index,
                    kind: BoundKind::Min,
                    value: lo,
                    class: BoundClass::Inactive,
                });
            }
            let range = hi - lo;
            // Only meaningful when the range does not straddle zero.
            let limit = match step_limit_factor {
                Some(factor) if lo.is_finite() && hi.is_finite() && range > 0.0 && lo * hi > 0.0 => {
                    range * factor
                }
                _ => f64::INFINITY,
            };
            range_limits.push(limit);
        }
        Self {
            descriptors,
            range_limits,
            pins: vec![None; min.len()],
        }
    }

    /// The bound descriptors, with their latest classification.
    pub fn descriptors(&self) -> &[BoundDescriptor] {
        &self.descriptors
    }

    /// Shrink and project `step` so that `x + step` stays within the box.
    ///
    /// Bounds the step would cross are either limiting (the whole step is
    /// scaled down to reach them) or, when the admissible fraction is below
    /// `min_step_ratio`, active (the variable is pinned to the bound and the
    /// rest of the step is kept). The nominal/range cap then applies.
    pub fn limit_step(
        &mut self,
        x: &[f64],
        nominal: &[f64],
        step: &mut [f64],
        min_step_ratio: f64,
        step_limit_factor: Option<f64>,
    ) -> StepLimit {
        let n = step.len();
        self.pins.clear();
        self.pins.resize(n, None);
        let mut ratio: f64 = 1.0;
        let mut limiting_bound = None;

        for (k, bound) in self.descriptors.iter_mut().enumerate() {
            bound.class = BoundClass::Inactive;
            let i = bound.index;
            let pi = step[i];
            let distance = (bound.value - x[i]) * (1.0 - UNIT_ROUNDOFF);
            // Already outside: the variable goes straight back onto the bound.
            if bound.violated_by(distance) {
                bound.class = BoundClass::Active;
                self.pins[i] = Some(bound.value - x[i]);
                step[i] = 0.0;
                continue;
            }
            if pi == 0.0 || !bound.crossed_by(distance, pi) {
                continue;
            }
            let step_ratio = distance / pi;
            if step_ratio < min_step_ratio {
                bound.class = BoundClass::Active;
                self.pins[i] = Some(distance);
                step[i] = 0.0;
            } else if step_ratio < ratio {
                ratio = step_ratio;
                limiting_bound = Some(k);
            }
        }

        let mut range_limited = None;
        if let Some(factor) = step_limit_factor {
            for i in 0..n {
                let pin = self.pins[i];
                let length = match (step[i].abs(), pin) {
                    (p, _) if p > 0.0 => p,
                    (_, Some(d)) if d != 0.0 => d.abs(),
                    _ => continue,
                };
                let nom = libm::fmax(nominal[i].abs(), x[i].abs());
                let nom_limit = if nom > 0.0 { nom * factor } else { f64::INFINITY };
                let cap = libm::fmin(self.range_limits[i], nom_limit);
                if length < cap {
                    continue;
                }
                match pin {
                    Some(d) => self.pins[i] = Some(cap.copysign(d)),
                    None => {
                        let r = cap / length;
                        if r < ratio {
                            ratio = r;
                            range_limited = Some(i);
                            limiting_bound = None;
                        }
                    }
                }
            }
        }

        let limiting = limiting_bound.map(|k| {
            self.descriptors[k].class = BoundClass::Limiting;
            self.descriptors[k].index
        });
        for (i, s) in step.iter_mut().enumerate() {
            match self.pins[i] {
                Some(d) => *s = d,
                None => *s *= ratio,
            }
        }
        StepLimit {
            ratio,
            active: self.pins.iter().filter(|p| p.is_some()).count(),
            limiting,
            range_limited,
        }
    }

    /// Clamp `x` into the box. Used by back-ends that project instead of limiting.
    pub fn clamp(&self, x: &mut [f64]) {
        for bound in &self.descriptors {
            let v = &mut x[bound.index];
            match bound.kind {
                BoundKind::Max if *v > bound.value => *v = bound.value,
                BoundKind::Min if *v < bound.value => *v = bound.value,
                _ => {}
            }
        }
    }

    /// Is `x[i]` within `tol` of one of its bounds?
    pub(crate) fn near_bound(&self, i: usize, x: f64, tol: f64) -> bool {
        self.descriptors
            .iter()
            .filter(|b| b.index == i)
            .any(|b| (b.value - x).abs() <= tol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INF: f64 = f64::INFINITY;

    #[test]
    fn descriptors_only_for_finite_bounds() {
        let bounds = Bounds::new(&[-INF, 0.0, 1.0], &[INF, INF, 2.0], Some(10.0));
        let kinds: Vec<_> = bounds
            .descriptors()
            .iter()
            .map(|d| (d.index, d.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![(1, BoundKind::Min), (2, BoundKind::Max), (2, BoundKind::Min)]
        );
        // Range 1 on a same-signed interval gives a cap of 10.
        assert_eq!(bounds.range_limits, vec![INF, INF, 10.0]);
    }

    #[test]
    fn step_inside_box_is_untouched() {
        let mut bounds = Bounds::new(&[0.0], &[10.0], None);
        let mut step = [3.0];
        let limit = bounds.limit_step(&[1.0], &[1.0], &mut step, 1e-10, None);
        assert_eq!(step, [3.0]);
        assert_eq!(limit.active, 0);
        assert_eq!(limit.limiting, None);
        assert!(
            bounds
                .descriptors()
                .iter()
                .all(|d| d.class == BoundClass::Inactive)
        );
    }

    #[test]
    fn crossing_bound_shortens_whole_step() {
        let mut bounds = Bounds::new(&[-INF, -INF], &[5.0, INF], None);
        let mut step = [10.0, 4.0];
        let limit = bounds.limit_step(&[0.0, 0.0], &[1.0, 1.0], &mut step, 1e-10, None);
        assert!((limit.ratio - 0.5).abs() < 1e-12);
        assert_eq!(limit.limiting, Some(0));
        assert!((step[0] - 5.0).abs() < 1e-12);
        assert!((step[1] - 2.0).abs() < 1e-12);
        assert_eq!(bounds.descriptors()[0].class, BoundClass::Limiting);
    }

    #[test]
    fn variable_at_bound_becomes_active() {
        let mut bounds = Bounds::new(&[-INF, -INF], &[5.0, INF], None);
        let mut step = [10.0, 4.0];
        let x = [5.0, 0.0];
        let limit = bounds.limit_step(&x, &[1.0, 1.0], &mut step, 1e-10, None);
        assert_eq!(limit.active, 1);
        assert_eq!(step[0], 0.0);
        // The free component keeps its full length.
        assert_eq!(step[1], 4.0);
        assert_eq!(bounds.descriptors()[0].class, BoundClass::Active);
    }

    #[test]
    fn variable_outside_box_is_pulled_back() {
        let mut bounds = Bounds::new(&[-INF, 0.0], &[5.0, INF], None);
        // Moving towards the box, but not far enough to get back in.
        let mut step = [-1.0, 2.0];
        let limit = bounds.limit_step(&[7.0, -3.0], &[1.0, 1.0], &mut step, 1e-10, None);
        assert_eq!(limit.active, 2);
        assert_eq!(step, [-2.0, 3.0]);
        assert!(
            bounds
                .descriptors()
                .iter()
                .all(|d| d.class == BoundClass::Active)
        );
    }

    #[test]
    fn nominal_cap_limits_long_steps() {
        let mut bounds = Bounds::new(&[-INF], &[INF], Some(10.0));
        let mut step = [1000.0];
        let limit = bounds.limit_step(&[1.0], &[2.0], &mut step, 1e-10, Some(10.0));
        assert_eq!(limit.range_limited, Some(0));
        assert!((step[0] - 20.0).abs() < 1e-12);
    }

    #[test]
    fn range_cap_applies_to_same_sign_intervals() {
        let mut bounds = Bounds::new(&[1.0], &[1.5], Some(0.1));
        // Range 0.5, cap 0.05; the nominal cap (0.1 * 1.2) is looser.
        let mut step = [0.2];
        bounds.limit_step(&[1.2], &[1.0], &mut step, 1e-10, Some(0.1));
        assert!((step[0] - 0.05).abs() < 1e-12);
    }

    #[test]
    fn clamp_projects_into_box() {
        let bounds = Bounds::new(&[0.0, -INF], &[1.0, 2.0], None);
        let mut x = [-1.0, 3.0];
        bounds.clamp(&mut x);
        assert_eq!(x, [0.0, 2.0]);
    }
}
