use std::marker::PhantomData;
use std::time::Duration;

/// Values the EWMA can smooth. The accumulator is kept as `f64` in the
/// value's natural unit.
pub trait Smoothable: Copy {
    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
}

impl Smoothable for f64 {
    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Self {
        value
    }
}

impl Smoothable for Duration {
    fn to_f64(self) -> f64 {
        self.as_secs_f64()
    }

    fn from_f64(value: f64) -> Self {
        Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
    }
}

/// Fixed-weight exponential moving average, smoothing factor `1 / weight`.
///
/// The first sample seeds the accumulator with `value * weight` so the
/// average equals that sample straight away.
#[derive(Clone, Debug)]
pub struct Ewma<T> {
    weight: f64,
    accumulator: f64,
    initialized: bool,
    _value: PhantomData<T>,
}

impl<T: Smoothable> Ewma<T> {
    /// `weight` must be positive; callers validate it up front.
    pub fn new(weight: f64) -> Self {
        Self {
            weight,
            accumulator: 0.0,
            initialized: false,
            _value: PhantomData,
        }
    }

    pub fn add(&mut self, value: T) {
        let value = value.to_f64();
        if self.initialized {
            self.accumulator += value - self.accumulator / self.weight;
        } else {
            self.accumulator = value * self.weight;
            self.initialized = true;
        }
    }

    pub fn average(&self) -> T {
        T::from_f64(self.accumulator / self.weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_is_the_average() {
        for weight in [0.5, 1.0, 2.0, 8.0, 100.0] {
            let mut avg = Ewma::<f64>::new(weight);
            avg.add(42.5);
            assert!((avg.average() - 42.5).abs() < 1e-9, "weight {weight}");
        }
    }

    #[test]
    fn empty_average_is_zero() {
        let avg = Ewma::<Duration>::new(8.0);
        assert!(!avg.initialized);
        assert_eq!(avg.average(), Duration::ZERO);
    }

    #[test]
    fn moves_by_one_over_weight() {
        let mut avg = Ewma::<f64>::new(4.0);
        avg.add(100.0);
        avg.add(0.0);
        // 400 + 0 - 100 = 300 -> 75
        assert!((avg.average() - 75.0).abs() < 1e-9);
    }

    #[test]
    fn constant_input_converges() {
        let mut avg = Ewma::<f64>::new(8.0);
        avg.add(1_000.0);
        for _ in 0..200 {
            avg.add(10.0);
        }
        assert!((avg.average() - 10.0).abs() < 1e-6);
    }

    #[test]
    fn smooths_durations() {
        let mut avg = Ewma::<Duration>::new(8.0);
        avg.add(Duration::from_millis(800));
        assert_eq!(avg.average(), Duration::from_millis(800));
        for _ in 0..200 {
            avg.add(Duration::from_secs(1));
        }
        let diff = Duration::from_secs(1).as_secs_f64() - avg.average().as_secs_f64();
        assert!(diff.abs() < 1e-6);
    }

    #[test]
    fn duration_drop_does_not_underflow() {
        let mut avg = Ewma::<Duration>::new(8.0);
        avg.add(Duration::from_secs(2));
        avg.add(Duration::ZERO);
        assert_eq!(avg.average(), Duration::from_millis(1750));
    }
}
