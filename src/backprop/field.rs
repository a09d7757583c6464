//! Scalar field abstraction
//!
//! One generic forward pass serves three instantiations: `f32` (the working
//! precision), `f64`, and `Complex<f64>` for the complex-step derivative
//! oracle. Every operation used by the forward pass is complex-analytic, so
//! `Imag(F(x + ih)) / h` recovers `dF/dx` to machine precision.

use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Sub, SubAssign};

use num_complex::Complex;
use num_traits::{One, Zero};

pub trait Field:
    Copy
    + Default
    + Send
    + Sync
    + 'static
    + PartialEq
    + Zero
    + One
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
{
    fn from_f64(v: f64) -> Self;

    fn from_f32(v: f32) -> Self {
        Self::from_f64(f64::from(v))
    }

    /// Real part; used for comparisons (softmax max) and reporting only.
    fn real(self) -> f64;

    fn sqrt(self) -> Self;
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn tanh(self) -> Self;
}

impl Field for f32 {
    fn from_f64(v: f64) -> Self {
        v as f32
    }

    fn real(self) -> f64 {
        f64::from(self)
    }

    fn sqrt(self) -> Self {
        f32::sqrt(self)
    }

    fn exp(self) -> Self {
        f32::exp(self)
    }

    fn ln(self) -> Self {
        f32::ln(self)
    }

    fn tanh(self) -> Self {
        f32::tanh(self)
    }
}

impl Field for f64 {
    fn from_f64(v: f64) -> Self {
        v
    }

    fn real(self) -> f64 {
        self
    }

    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }

    fn exp(self) -> Self {
        f64::exp(self)
    }

    fn ln(self) -> Self {
        f64::ln(self)
    }

    fn tanh(self) -> Self {
        f64::tanh(self)
    }
}

impl Field for Complex<f64> {
    fn from_f64(v: f64) -> Self {
        Complex::new(v, 0.0)
    }

    fn real(self) -> f64 {
        self.re
    }

    fn sqrt(self) -> Self {
        Complex::sqrt(self)
    }

    fn exp(self) -> Self {
        Complex::exp(self)
    }

    fn ln(self) -> Self {
        Complex::ln(self)
    }

    fn tanh(self) -> Self {
        // num_complex computes cosh(2*re), which overflows to inf for
        // |re| > ~355 and turns the quotient into NaN. Past |re| = 20 the
        // exact value is sign(re) to f64 precision, with the imaginary
        // part scaled by 2 / cosh(2*re) ~ 4 * exp(-2|re|).
        let a = self.re.abs();
        if a > 20.0 {
            let im = (2.0 * self.im).sin() * 2.0 * (-2.0 * a).exp();
            return Complex::new(self.re.signum(), im);
        }
        Complex::tanh(self)
    }
}

/// Dot product.
#[must_use]
pub fn dot<T: Field>(a: &[T], b: &[T]) -> T {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = T::zero();
    for (&x, &y) in a.iter().zip(b) {
        sum += x * y;
    }
    sum
}

/// Dot of an f32 cotangent with a generic vector; the oracle objective
/// `sum(dy * F(x))` needs this mixed form.
#[must_use]
pub fn dot_mixed<T: Field>(a: &[f32], b: &[T]) -> T {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = T::zero();
    for (&x, &y) in a.iter().zip(b) {
        sum += T::from_f32(x) * y;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_ops_match_inherent() {
        assert_eq!(<f32 as Field>::sqrt(9.0), 3.0);
        assert_eq!(<f64 as Field>::tanh(0.0), 0.0);
        let z = Complex::new(0.0, std::f64::consts::PI);
        // exp(i*pi) = -1
        let e = <Complex<f64> as Field>::exp(z);
        assert!((e.re + 1.0).abs() < 1e-12);
        assert!(e.im.abs() < 1e-12);
    }

    #[test]
    fn test_complex_step_recovers_derivative() {
        // d/dx tanh(x) at 0.3 via Imag(tanh(x + ih)) / h.
        let h = 1e-50;
        let x = Complex::new(0.3, h);
        let d = Field::tanh(x).im / h;
        let exact = 1.0 - 0.3f64.tanh().powi(2);
        assert!((d - exact).abs() < 1e-12);
    }

    #[test]
    fn test_complex_tanh_saturates_for_large_real_part() {
        // Pre-activations far outside the tanh linear range must not NaN
        // the complex-step path.
        let h = 1e-50;
        let t = Field::tanh(Complex::new(400.0, h));
        assert_eq!(t.re, 1.0);
        assert!(t.im.is_finite());
        let n = Field::tanh(Complex::new(-400.0, h));
        assert_eq!(n.re, -1.0);
        assert!(n.im.is_finite());
        // Continuity across the saturation crossover.
        let a = Field::tanh(Complex::new(19.9, h));
        let b = Field::tanh(Complex::new(20.1, h));
        assert!((a.re - b.re).abs() < 1e-12);
    }

    #[test]
    fn test_dot() {
        let a = [1.0f32, 2.0, 3.0];
        let b = [4.0f32, 5.0, 6.0];
        assert_eq!(dot(&a, &b), 32.0);
        let c = [Complex::new(1.0, 1.0), Complex::new(0.0, 0.0), Complex::new(2.0, 0.0)];
        let m = dot_mixed(&a, &c);
        assert_eq!(m, Complex::new(7.0, 1.0));
    }
}
