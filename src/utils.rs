use colored::Colorize;
use std::f64::consts::PI;
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, info};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Relative tolerance used when checking momentum conservation and mass shells.
pub const CONSERVATION_TOLERANCE: f64 = 1.0e-9;

pub trait ApproxEq<U, T> {
    fn approx_eq(&self, other: &U, tolerance: &T) -> bool;

    fn approx_eq_res(&self, other: &U, tolerance: &T) -> color_eyre::Result<()>
    where
        Self: std::fmt::Debug,
        U: std::fmt::Debug,
    {
        if self.approx_eq(other, tolerance) {
            Ok(())
        } else {
            Err(eyre::eyre!("{:?} != {:?}", self, other))
        }
    }
}

impl ApproxEq<f64, f64> for f64 {
    fn approx_eq(&self, other: &f64, tolerance: &f64) -> bool {
        if self == other {
            return true;
        }
        let scale = self.abs().max(other.abs());
        if scale < *tolerance {
            (self - other).abs() < *tolerance
        } else {
            (self - other).abs() / scale < *tolerance
        }
    }
}

/// Two-body Källén function `λ(a,b,c) = a² + b² + c² − 2ab − 2bc − 2ca`.
#[inline]
pub fn kallen(a: f64, b: f64, c: f64) -> f64 {
    // (a - b - c)² - 4bc has less cancellation close to threshold
    let d = a - b - c;
    d * d - 4. * b * c
}

/// Magnitude of the spatial momentum of either product of the two-body split
/// `s -> (s1, s2)` in the rest frame of `s`. `None` below threshold.
pub fn two_body_momentum(s: f64, s1: f64, s2: f64) -> Option<f64> {
    let lambda = kallen(s, s1, s2);
    if !(lambda > 0.) || !(s > 0.) {
        return None;
    }
    Some(lambda.sqrt() / (2. * s.sqrt()))
}

/// Returns the surface of the unit `n_dim`-sphere (embedded in `n_dim + 1`
/// dimensions) and the volume of the unit `n_dim`-ball, both scaled by
/// `radius`.
pub fn compute_surface_and_volume(n_dim: usize, radius: f64) -> (f64, f64) {
    let mut surface = 2.0;
    let mut volume = 1.0;
    for i in 1..n_dim + 1 {
        (surface, volume) = (2.0 * PI * volume, surface / (i as f64));
    }
    (
        surface * radius.powi(n_dim as i32),
        volume * radius.powi(n_dim as i32),
    )
}

/// Volume of two-body phase space in `dimension` spacetime dimensions, with the
/// normalisation `dΦ_n = (2π)^{D-n(D-1)} Π d^{D-1}p_i/(2E_i) δ^D(P - Σp_i)`.
/// Reduces to `sqrt(λ)/(8π s)` in four dimensions.
pub fn two_body_phase_space(s: f64, s1: f64, s2: f64, dimension: usize) -> f64 {
    match two_body_momentum(s, s1, s2) {
        Some(p) => two_body_prefactor(s, dimension) * p.powi(dimension as i32 - 3),
        None => 0.,
    }
}

/// The part of the two-body phase space volume that only depends on `√s`.
pub fn two_body_prefactor(s: f64, dimension: usize) -> f64 {
    let angular = compute_surface_and_volume(dimension - 2, 1.0).0;
    (2. * PI).powi(2 - dimension as i32) * angular / (4. * s.sqrt())
}

pub fn box_muller(x1: f64, x2: f64) -> (f64, f64) {
    let r = (-2. * x1.ln()).sqrt();
    let theta = 2. * PI * x2;
    (r * theta.cos(), r * theta.sin())
}

/// Nodes and weights of the Gauss–Legendre rule of the given order on `[-1, 1]`.
pub fn gauss_legendre(order: usize) -> Vec<(f64, f64)> {
    let n = order.max(1);
    let mut rule = Vec::with_capacity(n);
    for i in 0..n {
        // Tricomi initial guess followed by Newton iterations on P_n
        let mut x = (PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
        let mut dp = 1.;
        for _ in 0..100 {
            let (p, d) = legendre_with_derivative(n, x);
            dp = d;
            let dx = p / d;
            x -= dx;
            if dx.abs() < 1e-15 {
                break;
            }
        }
        let (_, d) = legendre_with_derivative(n, x);
        if d != 0. {
            dp = d;
        }
        rule.push((x, 2. / ((1. - x * x) * dp * dp)));
    }
    rule
}

fn legendre_with_derivative(n: usize, x: f64) -> (f64, f64) {
    let mut p0 = 1.;
    let mut p1 = x;
    for k in 2..=n {
        let p2 = ((2 * k - 1) as f64 * x * p1 - (k - 1) as f64 * p0) / k as f64;
        p0 = p1;
        p1 = p2;
    }
    if n == 0 {
        return (1., 0.);
    }
    let d = n as f64 * (x * p1 - p0) / (x * x - 1.);
    (p1, d)
}

/// Integrate `f` over `[a, b]` with a precomputed Gauss–Legendre rule.
pub fn integrate_gauss_legendre(rule: &[(f64, f64)], a: f64, b: f64, f: impl Fn(f64) -> f64) -> f64 {
    let half = 0.5 * (b - a);
    let mid = 0.5 * (b + a);
    rule.iter()
        .map(|(x, w)| w * f(mid + half * x))
        .sum::<f64>()
        * half
}

/// Format a mean ± sdev as mean(sdev) with the correct number of digits.
/// Based on the Python package gvar.
pub fn format_uncertainty(mean: f64, sdev: f64) -> String {
    fn ndec(x: f64, offset: usize) -> i32 {
        let mut ans = (offset as f64 - x.log10()) as i32;
        if ans > 0 && x * 10.0_f64.powi(ans) >= [0.5, 9.5, 99.5][offset] {
            ans -= 1;
        }
        if ans < 0 {
            0
        } else {
            ans
        }
    }
    fn split_exponent(e: &str) -> (&str, &str) {
        let mut parts = e.split('e');
        (parts.next().unwrap_or(""), parts.next().unwrap_or("0"))
    }
    let v = mean;
    let dv = sdev.abs();

    // special cases
    if v.is_nan() || dv.is_nan() {
        format!("{:e} ± {:e}", v, dv)
    } else if dv.is_infinite() {
        format!("{:e} ± inf", v)
    } else if v == 0. && (dv >= 1e5 || dv < 1e-4) {
        if dv == 0. {
            "0(0)".to_owned()
        } else {
            let e = format!("{:.1e}", dv);
            let (e1, e2) = split_exponent(&e);
            "0.0(".to_owned() + e1 + ")e" + e2
        }
    } else if v == 0. {
        if dv >= 9.95 {
            format!("0({:.0})", dv)
        } else if dv >= 0.995 {
            format!("0.0({:.1})", dv)
        } else {
            let ndecimal = ndec(dv, 2);
            format!(
                "{:.*}({:.0})",
                ndecimal as usize,
                v,
                dv * 10.0_f64.powi(ndecimal)
            )
        }
    } else if dv == 0. {
        let e = format!("{:e}", v);
        let (e1, e2) = split_exponent(&e);
        if e2 != "0" {
            e1.to_owned() + "(0)e" + e2
        } else {
            e1.to_owned() + "(0)"
        }
    } else if dv > 1e4 * v.abs() {
        format!("{:.1e} ± {:.2e}", v, dv)
    } else if v.abs() >= 1e6 || v.abs() < 1e-5 {
        // exponential notation for large |self.mean|
        let exponent = v.abs().log10().floor();
        let fac = 10.0_f64.powf(exponent);
        let mantissa = format_uncertainty(v / fac, dv / fac);
        let e = format!("{:.0e}", fac);
        let (_, e2) = split_exponent(&e);
        mantissa + "e" + e2
    }
    // normal cases
    else if dv >= 9.95 {
        if v.abs() >= 9.5 {
            format!("{:.0}({:.0})", v, dv)
        } else {
            let ndecimal = ndec(v.abs(), 1);
            format!("{:.*}({:.*})", ndecimal as usize, v, ndecimal as usize, dv)
        }
    } else if dv >= 0.995 {
        if v.abs() >= 0.95 {
            format!("{:.1}({:.1})", v, dv)
        } else {
            let ndecimal = ndec(v.abs(), 1);
            format!("{:.*}({:.*})", ndecimal as usize, v, ndecimal as usize, dv)
        }
    } else {
        let ndecimal = ndec(v.abs(), 1).max(ndec(dv, 2));
        format!(
            "{:.*}({:.0})",
            ndecimal as usize,
            v,
            dv * 10.0_f64.powi(ndecimal)
        )
    }
}

pub const MINUTE: usize = 60;
pub const HOUR: usize = 3_600;
pub const DAY: usize = 86_400;
pub const WEEK: usize = 604_800;
pub fn format_wdhms(seconds: usize) -> String {
    let mut compound_duration = vec![];
    if seconds == 0 {
        compound_duration.push("0s".to_string());
        return compound_duration.join(" ");
    }

    let mut sec = seconds % WEEK;
    // weeks
    let ws = seconds / WEEK;
    if ws != 0 {
        compound_duration.push(format!("{ws}w"));
    }

    // days
    let ds = sec / DAY;
    sec %= DAY;
    if ds != 0 {
        compound_duration.push(format!("{ds}d"));
    }

    // hours
    let hs = sec / HOUR;
    sec %= HOUR;
    if hs != 0 {
        compound_duration.push(format!("{hs}h"));
    }

    // minutes
    let ms = sec / MINUTE;
    sec %= MINUTE;
    if ms != 0 {
        compound_duration.push(format!("{ms}m"));
    }

    // seconds
    if sec != 0 {
        compound_duration.push(format!("{sec}s"));
    }

    compound_duration.join(" ")
}

pub fn format_evaluation_time(time: Duration) -> String {
    let time_secs = time.as_secs_f64();
    if time_secs < 1e-6 {
        format!("{} ns", time.as_nanos())
    } else if time_secs < 1e-3 {
        format!("{:.2} µs", (time_secs * 1e6))
    } else if time_secs < 1.0 {
        format!("{:.2} ms", (time_secs * 1e3))
    } else {
        format!("{:.2} s", time_secs)
    }
}

pub fn print_banner() {
    info!(
        "\n{}\n{}\n",
        r#"        _
  _ __ | |__   __ _ ___  ___  ___ _ __   __ _  ___ ___
 | '_ \| '_ \ / _` / __|/ _ \/ __| '_ \ / _` |/ __/ _ \
 | |_) | | | | (_| \__ \  __/\__ \ |_) | (_| | (_|  __/
 | .__/|_| |_|\__,_|___/\___||___/ .__/ \__,_|\___\___|
 |_|                             |_|                    "#
            .bold()
            .blue(),
        format!("  version: {}", format!("{:<15}", VERSION).green())
            .bold()
            .blue(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kallen_is_symmetric() {
        let (a, b, c) = (7.3, 1.1, 0.4);
        let l = kallen(a, b, c);
        assert!(l.approx_eq(&kallen(b, c, a), &1e-14));
        assert!(l.approx_eq(&kallen(c, a, b), &1e-14));
        assert!(l.approx_eq(&(a * a + b * b + c * c - 2. * (a * b + b * c + c * a)), &1e-14));
    }

    #[test]
    fn massless_two_body_volume() {
        let volume = two_body_phase_space(13.0, 0., 0., 4);
        assert!(volume.approx_eq(&(1. / (8. * PI)), &1e-14));
        assert_eq!(two_body_phase_space(1.0, 0.6, 0.6, 4), 0.);
    }

    #[test]
    fn sphere_surfaces() {
        assert!(compute_surface_and_volume(1, 1.).0.approx_eq(&(2. * PI), &1e-14));
        assert!(compute_surface_and_volume(2, 1.).0.approx_eq(&(4. * PI), &1e-14));
        assert!(compute_surface_and_volume(3, 1.).0.approx_eq(&(2. * PI * PI), &1e-14));
    }

    #[test]
    fn gauss_legendre_is_exact_for_polynomials() {
        let rule = gauss_legendre(20);
        let total_weight: f64 = rule.iter().map(|(_, w)| w).sum();
        assert!(total_weight.approx_eq(&2., &1e-13));
        let integral = integrate_gauss_legendre(&rule, 0., 2., |x| x.powi(7) - 3. * x * x);
        assert!(integral.approx_eq(&(256. / 8. - 8.), &1e-12));
    }

    #[test]
    fn uncertainty_formatting() {
        assert_eq!(format_uncertainty(1.234567, 0.0012), "1.2346(12)");
        assert_eq!(format_uncertainty(0., 0.), "0(0)");
        assert_eq!(format_wdhms(3_725), "1h 2m 5s");
    }
}
