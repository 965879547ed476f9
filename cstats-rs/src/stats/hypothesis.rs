use clap::ValueEnum;
use serde::Serialize;

use super::dist;
use super::{mean, variance, Sample};
use crate::error::{Error, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Alternative {
    TwoSided,
    Greater,
    Less,
}

impl Alternative {
    /// p-value of statistic `t` under Student's t with `df` degrees of freedom.
    fn t_p_value(self, t: f64, df: f64) -> f64 {
        match self {
            Alternative::TwoSided => dist::student_t_two_sided(t, df),
            Alternative::Greater => dist::student_t_sf(t, df),
            Alternative::Less => dist::student_t_cdf(t, df),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestResult {
    pub statistic: f64,
    pub df: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnovaResult {
    pub f: f64,
    pub df_between: f64,
    pub df_within: f64,
    pub p_value: f64,
}

/// One post-hoc comparison; `mean_diff` is mean(group1) - mean(group2).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairwiseResult {
    pub group1: String,
    pub group2: String,
    pub mean_diff: f64,
    pub statistic: f64,
    pub p_value: f64,
}

fn require_n(sample: &Sample, min: usize) -> Result<()> {
    if sample.n() < min {
        return Err(Error::InsufficientData(format!(
            "group {:?} has {} observation(s), need {}",
            sample.name,
            sample.n(),
            min
        )));
    }
    Ok(())
}

/// Pooled within-group variance and its degrees of freedom.
fn pooled_variance(groups: &[&Sample]) -> Result<(f64, f64)> {
    let mut ss = 0.0;
    let mut df = 0usize;
    for g in groups {
        require_n(g, 2)?;
        let m = g.mean();
        ss += g.values.iter().map(|v| (v - m).powi(2)).sum::<f64>();
        df += g.n() - 1;
    }
    let mse = ss / df as f64;
    if !(mse > 0.0) {
        return Err(Error::InsufficientData("zero within-group variance".into()));
    }
    Ok((mse, df as f64))
}

/// Independent two-sample t-test: Student's (pooled) when `equal_var`, else Welch's.
pub fn ttest_ind(a: &Sample, b: &Sample, equal_var: bool, alternative: Alternative) -> Result<TestResult> {
    require_n(a, 2)?;
    require_n(b, 2)?;
    let (na, nb) = (a.n() as f64, b.n() as f64);
    let diff = a.mean() - b.mean();

    let (se, df) = if equal_var {
        let (sp2, df) = pooled_variance(&[a, b])?;
        ((sp2 * (1.0 / na + 1.0 / nb)).sqrt(), df)
    } else {
        let (va, vb) = (variance(&a.values) / na, variance(&b.values) / nb);
        let se2 = va + vb;
        if !(se2 > 0.0) {
            return Err(Error::InsufficientData("zero variance in both groups".into()));
        }
        let df = se2 * se2 / (va * va / (na - 1.0) + vb * vb / (nb - 1.0));
        (se2.sqrt(), df)
    };

    let t = diff / se;
    Ok(TestResult {
        statistic: t,
        df,
        p_value: alternative.t_p_value(t, df),
    })
}

pub fn one_way_anova(groups: &[Sample]) -> Result<AnovaResult> {
    if groups.len() < 2 {
        return Err(Error::InsufficientData("ANOVA needs at least two groups".into()));
    }
    let refs: Vec<&Sample> = groups.iter().collect();
    let (msw, df_within) = pooled_variance(&refs)?;
    let all: Vec<f64> = groups.iter().flat_map(|g| g.values.iter().copied()).collect();
    let grand = mean(&all);
    let ssb: f64 = groups
        .iter()
        .map(|g| g.n() as f64 * (g.mean() - grand).powi(2))
        .sum();
    let df_between = (groups.len() - 1) as f64;
    let f = (ssb / df_between) / msw;
    Ok(AnovaResult {
        f,
        df_between,
        df_within,
        p_value: dist::f_sf(f, df_between, df_within),
    })
}

/// Tukey-Kramer HSD over every pair of `groups`, in input order.
pub fn tukey_hsd(groups: &[Sample]) -> Result<Vec<PairwiseResult>> {
    if groups.len() < 2 {
        return Err(Error::InsufficientData("Tukey HSD needs at least two groups".into()));
    }
    let refs: Vec<&Sample> = groups.iter().collect();
    let (mse, df) = pooled_variance(&refs)?;
    let k = groups.len();

    let mut out = Vec::with_capacity(k * (k - 1) / 2);
    for i in 0..k {
        for j in (i + 1)..k {
            let (gi, gj) = (&groups[i], &groups[j]);
            let diff = gi.mean() - gj.mean();
            let se = (0.5 * mse * (1.0 / gi.n() as f64 + 1.0 / gj.n() as f64)).sqrt();
            let q = diff.abs() / se;
            let p = 1.0 - dist::studentized_range_cdf(q, k, df);
            out.push(PairwiseResult {
                group1: gi.name.clone(),
                group2: gj.name.clone(),
                mean_diff: diff,
                statistic: q,
                p_value: p.clamp(0.0, 1.0),
            });
        }
    }
    Ok(out)
}

/// Dunnett's many-to-one comparisons of each of `others` against `control`.
/// Variance is pooled over every group, control included.
pub fn dunnett(control: &Sample, others: &[Sample], alternative: Alternative) -> Result<Vec<PairwiseResult>> {
    if others.is_empty() {
        return Err(Error::InsufficientData("Dunnett needs at least one treatment group".into()));
    }
    let mut refs: Vec<&Sample> = vec![control];
    refs.extend(others.iter());
    let (mse, df) = pooled_variance(&refs)?;
    let n0 = control.n() as f64;
    let lambdas: Vec<f64> = others
        .iter()
        .map(|g| (g.n() as f64 / (g.n() as f64 + n0)).sqrt())
        .collect();

    Ok(others
        .iter()
        .map(|g| {
            let diff = g.mean() - control.mean();
            let t = diff / (mse * (1.0 / g.n() as f64 + 1.0 / n0)).sqrt();
            let p = match alternative {
                Alternative::TwoSided => 1.0 - dist::dunnett_cdf(t.abs(), &lambdas, df, true),
                Alternative::Greater => 1.0 - dist::dunnett_cdf(t, &lambdas, df, false),
                Alternative::Less => 1.0 - dist::dunnett_cdf(-t, &lambdas, df, false),
            };
            PairwiseResult {
                group1: g.name.clone(),
                group2: control.name.clone(),
                mean_diff: diff,
                statistic: t,
                p_value: p.clamp(0.0, 1.0),
            }
        })
        .collect())
}

/// Holm-Šidák step-down adjustment, returned in input order.
pub fn holm_sidak(p_values: &[f64]) -> Vec<f64> {
    let m = p_values.len();
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));

    let mut adjusted = vec![0.0; m];
    let mut running = 0.0f64;
    for (rank, &i) in order.iter().enumerate() {
        let p = p_values[i];
        let a = 1.0 - (1.0 - p).powi((m - rank) as i32);
        running = running.max(a);
        adjusted[i] = running.min(1.0);
    }
    adjusted
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn s(name: &str, v: &[f64]) -> Sample {
        Sample::new(name, v.to_vec())
    }

    #[test]
    fn student_t_test_reference() {
        let a = s("a", &[1.0, 2.0, 3.0, 4.0, 5.0]);
        let b = s("b", &[2.0, 4.0, 6.0, 8.0, 10.0]);
        let r = ttest_ind(&a, &b, true, Alternative::TwoSided).unwrap();
        assert_relative_eq!(r.statistic, -1.8973665961010275, epsilon = 1e-10);
        assert_eq!(r.df, 8.0);
        assert_abs_diff_eq!(r.p_value, 0.0943497728, epsilon = 1e-6);

        let less = ttest_ind(&a, &b, true, Alternative::Less).unwrap();
        let greater = ttest_ind(&a, &b, true, Alternative::Greater).unwrap();
        assert_abs_diff_eq!(less.p_value, r.p_value / 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(less.p_value + greater.p_value, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn welch_uses_satterthwaite_df() {
        let a = s("a", &[1.0, 2.0, 3.0, 4.0, 5.0]);
        let b = s("b", &[2.0, 4.0, 6.0, 8.0, 10.0]);
        let r = ttest_ind(&a, &b, false, Alternative::TwoSided).unwrap();
        assert_relative_eq!(r.df, 6.25 / 1.0625, epsilon = 1e-12);
        let student = ttest_ind(&a, &b, true, Alternative::TwoSided).unwrap();
        assert!(r.p_value > student.p_value);
    }

    #[test]
    fn t_test_rejects_degenerate_groups() {
        let a = s("a", &[1.0]);
        let b = s("b", &[1.0, 2.0]);
        assert!(matches!(
            ttest_ind(&a, &b, true, Alternative::TwoSided),
            Err(Error::InsufficientData(_))
        ));
        let c = s("c", &[3.0, 3.0]);
        let d = s("d", &[3.0, 3.0, 3.0]);
        assert!(ttest_ind(&c, &d, true, Alternative::TwoSided).is_err());
        assert!(ttest_ind(&c, &d, false, Alternative::TwoSided).is_err());
    }

    fn three_groups() -> Vec<Sample> {
        vec![
            s("A", &[1.0, 2.0, 3.0]),
            s("B", &[4.0, 5.0, 6.0]),
            s("C", &[7.0, 8.0, 9.0]),
        ]
    }

    #[test]
    fn anova_reference() {
        let r = one_way_anova(&three_groups()).unwrap();
        assert_relative_eq!(r.f, 27.0, epsilon = 1e-12);
        assert_eq!((r.df_between, r.df_within), (2.0, 6.0));
        // F(2, 6) tail: (1 + 2F/6)^-3
        assert_relative_eq!(r.p_value, 0.001, epsilon = 1e-9);
    }

    #[test]
    fn tukey_covers_every_pair() {
        let groups = vec![
            s("A", &[1.0, 2.0, 3.0]),
            s("B", &[4.0, 5.0, 6.0, 5.5]),
            s("C", &[7.0, 8.0, 9.0]),
            s("D", &[2.0, 3.5, 1.0]),
        ];
        let r = tukey_hsd(&groups).unwrap();
        assert_eq!(r.len(), 6);
        assert_eq!((r[0].group1.as_str(), r[0].group2.as_str()), ("A", "B"));
        assert!(r.iter().all(|c| (0.0..=1.0).contains(&c.p_value)));
        let ac = r.iter().find(|c| c.group1 == "A" && c.group2 == "C").unwrap();
        let ad = r.iter().find(|c| c.group1 == "A" && c.group2 == "D").unwrap();
        assert!(ac.p_value < ad.p_value);
    }

    #[test]
    fn tukey_with_two_groups_matches_student_t() {
        let a = s("a", &[1.0, 2.0, 3.0, 4.0, 5.0]);
        let b = s("b", &[2.0, 4.0, 6.0, 8.0, 10.0]);
        let t = ttest_ind(&a, &b, true, Alternative::TwoSided).unwrap();
        let r = tukey_hsd(&[a, b]).unwrap();
        assert_eq!(r.len(), 1);
        assert_abs_diff_eq!(r[0].p_value, t.p_value, epsilon = 5e-4);
    }

    #[test]
    fn dunnett_with_one_treatment_matches_student_t() {
        let ctrl = s("ctrl", &[1.0, 2.0, 3.0, 4.0, 5.0]);
        let drug = s("drug", &[2.0, 4.0, 6.0, 8.0, 10.0]);
        let t = ttest_ind(&drug, &ctrl, true, Alternative::TwoSided).unwrap();
        let r = dunnett(&ctrl, &[drug.clone()], Alternative::TwoSided).unwrap();
        assert_eq!(r[0].group1, "drug");
        assert_relative_eq!(r[0].statistic, t.statistic, epsilon = 1e-12);
        assert_abs_diff_eq!(r[0].p_value, t.p_value, epsilon = 5e-4);

        let greater = dunnett(&ctrl, &[drug], Alternative::Greater).unwrap();
        assert_abs_diff_eq!(greater[0].p_value, t.p_value / 2.0, epsilon = 5e-4);
    }

    #[test]
    fn dunnett_is_more_conservative_than_unadjusted() {
        let groups = three_groups();
        let r = dunnett(&groups[0], &groups[1..], Alternative::TwoSided).unwrap();
        assert_eq!(r.len(), 2);
        for c in &r {
            let raw = dist::student_t_two_sided(c.statistic, 6.0);
            assert!(c.p_value >= raw - 1e-6);
        }
    }

    #[test]
    fn holm_sidak_reference() {
        let adj = holm_sidak(&[0.01, 0.04, 0.03]);
        assert_relative_eq!(adj[0], 1.0 - 0.99f64.powi(3), epsilon = 1e-12);
        assert_relative_eq!(adj[2], 1.0 - 0.97f64.powi(2), epsilon = 1e-12);
        // step-down keeps the adjusted values monotone
        assert_relative_eq!(adj[1], adj[2], epsilon = 1e-12);
        for (&p, &a) in [0.01, 0.04, 0.03].iter().zip(adj.iter()) {
            assert!(a >= p && a <= 1.0);
        }
        assert!(holm_sidak(&[]).is_empty());
    }
}
