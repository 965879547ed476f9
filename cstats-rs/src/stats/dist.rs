//! Probability distributions used by the hypothesis tests.
//!
//! Student t and F come from the regularized incomplete beta function. The
//! studentized range and Dunnett distributions are integrated numerically:
//! an inner integral over a standard normal variate, mixed over the
//! distribution of the pooled scale `s = sqrt(chi2_df / df)`.

use libm::{erfc, lgamma};
use std::f64::consts::{PI, SQRT_2};

/// Degrees of freedom above which the scale mixture is treated as s = 1.
const DF_LARGE: f64 = 5000.0;
const Z_LIMIT: f64 = 8.0;
const Z_STEPS: usize = 200;
const S_STEPS: usize = 400;

pub fn normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / SQRT_2)
}

pub fn normal_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * PI).sqrt()
}

/// Continued fraction for the incomplete beta function (modified Lentz).
fn beta_cf(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 300;
    const EPS: f64 = 1e-15;
    const FPMIN: f64 = 1e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < FPMIN {
        d = FPMIN;
    }
    d = 1.0 / d;
    let mut h = d;
    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;
        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        h *= d * c;
        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        let del = d * c;
        h *= del;
        if (del - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

/// Regularized incomplete beta function I_x(a, b).
pub fn incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front = lgamma(a + b) - lgamma(a) - lgamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_cf(a, b, x) / a
    } else {
        1.0 - front * beta_cf(b, a, 1.0 - x) / b
    }
}

/// P(|T| >= |t|) for Student's t with `df` degrees of freedom.
pub fn student_t_two_sided(t: f64, df: f64) -> f64 {
    if t.is_nan() {
        return f64::NAN;
    }
    if t.is_infinite() {
        return 0.0;
    }
    incomplete_beta(0.5 * df, 0.5, df / (df + t * t))
}

/// P(T > t).
pub fn student_t_sf(t: f64, df: f64) -> f64 {
    let tail = 0.5 * student_t_two_sided(t, df);
    if t > 0.0 {
        tail
    } else {
        1.0 - tail
    }
}

/// P(T <= t).
pub fn student_t_cdf(t: f64, df: f64) -> f64 {
    student_t_sf(-t, df)
}

/// P(F > f) for the F distribution with (d1, d2) degrees of freedom.
pub fn f_sf(f: f64, d1: f64, d2: f64) -> f64 {
    if f <= 0.0 {
        return 1.0;
    }
    if f.is_infinite() {
        return 0.0;
    }
    incomplete_beta(0.5 * d2, 0.5 * d1, d2 / (d2 + d1 * f))
}

/// Composite Simpson rule over [a, b]; `n` is rounded up to an even count.
fn simpson(f: impl Fn(f64) -> f64, a: f64, b: f64, n: usize) -> f64 {
    let n = (n.max(2) + 1) & !1;
    let h = (b - a) / n as f64;
    let mut sum = f(a) + f(b);
    for i in 1..n {
        let w = if i % 2 == 1 { 4.0 } else { 2.0 };
        sum += w * f(a + i as f64 * h);
    }
    sum * h / 3.0
}

/// ln density of s = sqrt(chi2_df / df).
fn ln_scale_density(s: f64, df: f64) -> f64 {
    let half = 0.5 * df;
    half * df.ln() - lgamma(half) - (half - 1.0) * 2f64.ln() + (df - 1.0) * s.ln() - half * s * s
}

/// E[g(s)] over the scale distribution; g(1) for very large df.
fn mix_over_scale(df: f64, g: impl Fn(f64) -> f64) -> f64 {
    if !df.is_finite() || df > DF_LARGE {
        return g(1.0);
    }
    let lo = (1.0 - 10.0 / (2.0 * df).sqrt()).max(0.0);
    let hi = 1.0 + 12.0 / df.sqrt();
    simpson(
        |s| {
            if s <= 0.0 {
                // density at 0 is finite only for df <= 1
                if df <= 1.0 {
                    (ln_scale_density(1e-12, df)).exp() * g(0.0)
                } else {
                    0.0
                }
            } else {
                ln_scale_density(s, df).exp() * g(s)
            }
        },
        lo,
        hi,
        S_STEPS,
    )
}

/// P(range of k standard normals <= w).
fn normal_range_cdf(w: f64, k: usize) -> f64 {
    if w <= 0.0 {
        return 0.0;
    }
    let k_f = k as f64;
    let p = simpson(
        |z| {
            let inner = normal_cdf(z) - normal_cdf(z - w);
            if inner <= 0.0 {
                0.0
            } else {
                normal_pdf(z) * inner.powi(k as i32 - 1)
            }
        },
        -Z_LIMIT,
        Z_LIMIT,
        Z_STEPS,
    );
    (k_f * p).clamp(0.0, 1.0)
}

/// CDF of the studentized range distribution with `k` groups and `df` degrees
/// of freedom.
pub fn studentized_range_cdf(q: f64, k: usize, df: f64) -> f64 {
    if q <= 0.0 || k < 2 {
        return 0.0;
    }
    if q.is_infinite() {
        return 1.0;
    }
    mix_over_scale(df, |s| normal_range_cdf(q * s, k)).clamp(0.0, 1.0)
}

/// P(all T_i <= c) (one-sided) or P(all |T_i| <= c) (two-sided) for
/// multivariate t with correlations `lambda_i * lambda_j`, as in Dunnett's
/// many-to-one comparisons.
pub fn dunnett_cdf(c: f64, lambdas: &[f64], df: f64, two_sided: bool) -> f64 {
    if lambdas.is_empty() {
        return 1.0;
    }
    if two_sided && c <= 0.0 {
        return 0.0;
    }
    let roots: Vec<f64> = lambdas.iter().map(|l| (1.0 - l * l).max(1e-12).sqrt()).collect();
    let inner = |x: f64| -> f64 {
        simpson(
            |z| {
                let mut prod = normal_pdf(z);
                for (l, r) in lambdas.iter().zip(roots.iter()) {
                    let upper = normal_cdf((x - l * z) / r);
                    let term = if two_sided {
                        upper - normal_cdf((-x - l * z) / r)
                    } else {
                        upper
                    };
                    prod *= term.max(0.0);
                }
                prod
            },
            -Z_LIMIT,
            Z_LIMIT,
            Z_STEPS,
        )
    };
    mix_over_scale(df, |s| inner(c * s)).clamp(0.0, 1.0)
}
