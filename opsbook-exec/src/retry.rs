//! Loop controller policy: bounded count, until-predicate, and the wait
//! schedule between iterations.

use std::time::Duration;

use opsbook_core::expr::{eval_count, Env, ExprError};
use opsbook_core::step::{CountSpec, IntervalSpec, LoopSpec};

pub struct Loop<'a> {
    spec: &'a LoopSpec,
}

impl<'a> Loop<'a> {
    pub fn new(spec: &'a LoopSpec) -> Self {
        Self { spec }
    }

    /// The iteration bound, evaluated once before the first iteration.
    pub fn count(&self, env: &Env<'_>) -> Result<usize, ExprError> {
        match &self.spec.count {
            CountSpec::Fixed(n) => Ok(*n),
            CountSpec::Expr(src) => eval_count(src, env),
        }
    }

    pub fn until(&self) -> Option<&str> {
        self.spec.until.as_deref()
    }

    /// Wait before iteration `completed + 1`. A fixed interval is used as
    /// declared; a min/max range doubles from `min` and clamps at `max`.
    pub fn interval(&self, completed: usize) -> Duration {
        interval_for(&self.spec.interval, completed)
    }
}

pub(crate) fn interval_for(spec: &IntervalSpec, completed: usize) -> Duration {
    match spec {
        IntervalSpec::Fixed(d) => *d,
        IntervalSpec::Range { min, max } => {
            let factor = 2f64.powi(completed.min(62) as i32);
            let want = min.as_secs_f64() * factor;
            if !want.is_finite() || want >= max.as_secs_f64() {
                *max
            } else {
                Duration::from_secs_f64(want)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_interval_is_constant() {
        let spec = IntervalSpec::Fixed(Duration::from_millis(50));
        for i in 0..4 {
            assert_eq!(interval_for(&spec, i), Duration::from_millis(50));
        }
    }

    #[test]
    fn range_interval_doubles_and_clamps() {
        let spec = IntervalSpec::Range {
            min: Duration::from_millis(10),
            max: Duration::from_millis(35),
        };
        assert_eq!(interval_for(&spec, 0), Duration::from_millis(10));
        assert_eq!(interval_for(&spec, 1), Duration::from_millis(20));
        assert_eq!(interval_for(&spec, 2), Duration::from_millis(35));
        assert_eq!(interval_for(&spec, 10), Duration::from_millis(35));
    }
}
