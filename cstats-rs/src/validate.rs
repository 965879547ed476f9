use clap::{Args, ValueEnum};
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{self, Error};
use crate::ids;
use crate::index;
use crate::report;
use crate::stats::hypothesis::{self, Alternative, PairwiseResult};
use crate::stats::{self, Sample};
use crate::volume::{self, VolumeRef};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestKind {
    /// Unadjusted two-sample t-test per comparison
    TTest,
    /// Tukey-Kramer HSD across every group
    Tukey,
    /// Dunnett's test of every group against --control
    Dunnett,
    /// Pairwise t-tests with Holm-Šidák adjustment
    HolmSidak,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Criterion {
    /// At least one comparison supports the hypothesis
    Any,
    /// Every comparison supports the hypothesis
    All,
}

/// "A vs B": the hypothesis is about mean(A) relative to mean(B).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Comparison {
    pub a: String,
    pub b: String,
}

impl Comparison {
    pub fn label(&self) -> String {
        format!("{} vs {}", self.a, self.b)
    }
}

/// Expand comparison strings against the groups present. "all" yields every
/// pair of sorted groups, or every group against the control for Dunnett.
pub fn parse_comparisons(
    specs: &[String],
    groups: &[String],
    kind: TestKind,
    control: Option<&str>,
) -> error::Result<Vec<Comparison>> {
    let known: BTreeSet<&str> = groups.iter().map(String::as_str).collect();
    if let Some(c) = control {
        if !known.contains(c) {
            return Err(Error::UnknownGroup(c.to_string()));
        }
    }
    if kind == TestKind::Dunnett && control.is_none() {
        return Err(Error::InvalidInput("dunnett requires --control".into()));
    }

    let mut out = Vec::new();
    let wants_all = specs.iter().any(|s| s.trim().eq_ignore_ascii_case("all"));
    if wants_all {
        match (kind, control) {
            (TestKind::Dunnett, Some(c)) => {
                for g in groups.iter().filter(|g| g.as_str() != c) {
                    out.push(Comparison {
                        a: g.clone(),
                        b: c.to_string(),
                    });
                }
            }
            _ => {
                for i in 0..groups.len() {
                    for j in (i + 1)..groups.len() {
                        out.push(Comparison {
                            a: groups[i].clone(),
                            b: groups[j].clone(),
                        });
                    }
                }
            }
        }
        return Ok(out);
    }

    for spec in specs {
        let (a, b) = spec
            .split_once(" vs ")
            .ok_or_else(|| Error::InvalidInput(format!("expected \"A vs B\", got {:?}", spec)))?;
        let (a, b) = (a.trim(), b.trim());
        for g in [a, b] {
            if !known.contains(g) {
                return Err(Error::UnknownGroup(g.to_string()));
            }
        }
        if a == b {
            return Err(Error::InvalidInput(format!("comparison of {:?} with itself", a)));
        }
        if kind == TestKind::Dunnett && Some(b) != control {
            return Err(Error::InvalidInput(format!(
                "dunnett comparisons must be \"<group> vs {}\", got {:?}",
                control.unwrap_or_default(),
                spec
            )));
        }
        let c = Comparison {
            a: a.to_string(),
            b: b.to_string(),
        };
        if !out.contains(&c) {
            out.push(c);
        }
    }
    if out.is_empty() {
        return Err(Error::InvalidInput("no comparisons given".into()));
    }
    Ok(out)
}

/// Values per cluster, then per group (condition).
pub type ClusterData = BTreeMap<u32, BTreeMap<String, Vec<f64>>>;

/// Read every `<condition>_<sample>.csv` in `dir`, taking `column` per cluster.
pub fn load_density_dir(dir: &Path, column: &str) -> error::Result<ClusterData> {
    let re = Regex::new(r"^([^_]+)_(.+)\.csv$").map_err(|e| Error::InvalidInput(e.to_string()))?;
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut data = ClusterData::new();
    let mut n_files = 0usize;
    for path in paths {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        let condition = match re.captures(name) {
            Some(c) => c[1].to_string(),
            None => {
                log::debug!("skipping {}", path.display());
                continue;
            }
        };
        let mut rdr = csv::Reader::from_path(&path)?;
        let headers = rdr.headers()?.clone();
        let find = |col: &str| {
            headers
                .iter()
                .position(|h| h == col)
                .ok_or_else(|| Error::InvalidInput(format!("{} has no column {:?}", path.display(), col)))
        };
        let id_col = find("cluster_ID")?;
        let value_col = find(column)?;
        for record in rdr.records() {
            let record = record?;
            let parse_err = || Error::InvalidInput(format!("bad row {:?} in {}", record, path.display()));
            let id: u32 = record.get(id_col).and_then(|v| v.trim().parse().ok()).ok_or_else(parse_err)?;
            let value: f64 = record
                .get(value_col)
                .and_then(|v| v.trim().parse().ok())
                .ok_or_else(parse_err)?;
            data.entry(id)
                .or_default()
                .entry(condition.clone())
                .or_default()
                .push(value);
        }
        n_files += 1;
    }
    if n_files == 0 {
        return Err(Error::InvalidInput(format!(
            "no <condition>_<sample>.csv files in {}",
            dir.display()
        )));
    }
    log::info!("read {} sample file(s), {} cluster(s)", n_files, data.len());
    Ok(data)
}

#[derive(Debug, Clone)]
pub struct TestConfig {
    pub kind: TestKind,
    pub comparisons: Vec<Comparison>,
    pub control: Option<String>,
    pub alternative: Alternative,
    pub alpha: f64,
    pub criterion: Criterion,
    pub anova_gate: bool,
    pub welch: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonRow {
    #[serde(rename = "cluster_ID")]
    pub cluster_id: u32,
    pub comparison: String,
    pub mean_a: f64,
    pub mean_b: f64,
    pub mean_diff: f64,
    pub statistic: f64,
    pub p_value: f64,
    pub supports: bool,
}

#[derive(Debug, Clone)]
pub struct ClusterOutcome {
    pub cluster_id: u32,
    pub rows: Vec<ComparisonRow>,
    pub anova_p: Option<f64>,
    pub valid: bool,
}

fn direction_ok(mean_diff: f64, alternative: Alternative) -> bool {
    match alternative {
        Alternative::TwoSided => true,
        Alternative::Greater => mean_diff > 0.0,
        Alternative::Less => mean_diff < 0.0,
    }
}

fn sample(groups: &BTreeMap<String, Vec<f64>>, name: &str) -> Sample {
    Sample::new(name, groups.get(name).cloned().unwrap_or_default())
}

/// Find the post-hoc result for `c`, flipping it when the test reported the
/// pair the other way round.
fn oriented(results: &[PairwiseResult], c: &Comparison) -> Option<(f64, f64, f64)> {
    results.iter().find_map(|r| {
        if r.group1 == c.a && r.group2 == c.b {
            Some((r.mean_diff, r.statistic, r.p_value))
        } else if r.group1 == c.b && r.group2 == c.a {
            Some((-r.mean_diff, r.statistic, r.p_value))
        } else {
            None
        }
    })
}

/// Run the configured test for one cluster and decide whether it is valid.
pub fn test_cluster(
    cluster_id: u32,
    groups: &BTreeMap<String, Vec<f64>>,
    cfg: &TestConfig,
) -> error::Result<ClusterOutcome> {
    let welch = cfg.welch;
    let pairwise: Vec<(f64, f64, f64)> = match cfg.kind {
        TestKind::TTest | TestKind::HolmSidak => {
            let mut raw = Vec::with_capacity(cfg.comparisons.len());
            for c in &cfg.comparisons {
                let (a, b) = (sample(groups, &c.a), sample(groups, &c.b));
                let r = hypothesis::ttest_ind(&a, &b, !welch, cfg.alternative)?;
                raw.push((a.mean() - b.mean(), r.statistic, r.p_value));
            }
            if cfg.kind == TestKind::HolmSidak {
                let p: Vec<f64> = raw.iter().map(|r| r.2).collect();
                let adjusted = hypothesis::holm_sidak(&p);
                for (r, adj) in raw.iter_mut().zip(adjusted) {
                    r.2 = adj;
                }
            }
            raw
        }
        TestKind::Tukey => {
            let all: Vec<Sample> = groups.iter().map(|(n, v)| Sample::new(n.clone(), v.clone())).collect();
            let results = hypothesis::tukey_hsd(&all)?;
            cfg.comparisons
                .iter()
                .map(|c| {
                    oriented(&results, c)
                        .ok_or_else(|| Error::InsufficientData(format!("{} missing in cluster {}", c.label(), cluster_id)))
                })
                .collect::<error::Result<_>>()?
        }
        TestKind::Dunnett => {
            let control_name = cfg.control.as_deref().unwrap_or_default();
            let control = sample(groups, control_name);
            let others: Vec<Sample> = groups
                .iter()
                .filter(|(n, _)| n.as_str() != control_name)
                .map(|(n, v)| Sample::new(n.clone(), v.clone()))
                .collect();
            let results = hypothesis::dunnett(&control, &others, cfg.alternative)?;
            cfg.comparisons
                .iter()
                .map(|c| {
                    oriented(&results, c)
                        .ok_or_else(|| Error::InsufficientData(format!("{} missing in cluster {}", c.label(), cluster_id)))
                })
                .collect::<error::Result<_>>()?
        }
    };

    let rows: Vec<ComparisonRow> = cfg
        .comparisons
        .iter()
        .zip(pairwise)
        .map(|(c, (diff, stat, p))| ComparisonRow {
            cluster_id,
            comparison: c.label(),
            mean_a: groups.get(&c.a).map(|v| stats::mean(v)).unwrap_or(f64::NAN),
            mean_b: groups.get(&c.b).map(|v| stats::mean(v)).unwrap_or(f64::NAN),
            mean_diff: diff,
            statistic: stat,
            p_value: p,
            supports: p < cfg.alpha && direction_ok(diff, cfg.alternative),
        })
        .collect();

    let anova_p = if cfg.anova_gate {
        let all: Vec<Sample> = groups.iter().map(|(n, v)| Sample::new(n.clone(), v.clone())).collect();
        Some(hypothesis::one_way_anova(&all)?.p_value)
    } else {
        None
    };

    let supported = match cfg.criterion {
        Criterion::Any => rows.iter().any(|r| r.supports),
        Criterion::All => !rows.is_empty() && rows.iter().all(|r| r.supports),
    };
    let valid = supported && anova_p.map_or(true, |p| p < cfg.alpha);
    Ok(ClusterOutcome {
        cluster_id,
        rows,
        anova_p,
        valid,
    })
}

/// Test every cluster in parallel. Clusters whose test cannot be computed are
/// reported as invalid.
pub fn validate_clusters(data: &ClusterData, cfg: &TestConfig) -> Vec<ClusterOutcome> {
    data.par_iter()
        .map(|(&id, groups)| match test_cluster(id, groups, cfg) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("cluster {}: {}", id, e);
                ClusterOutcome {
                    cluster_id: id,
                    rows: Vec::new(),
                    anova_p: None,
                    valid: false,
                }
            }
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct SummaryRow {
    test: TestKind,
    criterion: Criterion,
    alternative: Alternative,
    alpha: f64,
    total_clusters: usize,
    valid_clusters: usize,
    percent_valid: f64,
}

#[derive(Debug, Serialize)]
struct GroupRow {
    #[serde(rename = "cluster_ID")]
    cluster_id: u32,
    group: String,
    n: usize,
    mean: f64,
    sd: f64,
    sem: f64,
}

#[derive(Debug, Serialize)]
struct AnovaRow {
    #[serde(rename = "cluster_ID")]
    cluster_id: u32,
    anova_p: f64,
}

#[derive(Args, Clone, Serialize)]
pub struct StatsArgs {
    /// Directory of <condition>_<sample>.csv files written by `density`
    #[arg(long)]
    pub input: PathBuf,
    /// Value column to test
    #[arg(long, default_value = "cell_density")]
    pub column: String,
    #[arg(long, value_enum, default_value = "tukey")]
    pub test: TestKind,
    /// "all" or one or more "A vs B"
    #[arg(long, num_args = 1.., default_value = "all")]
    pub comparisons: Vec<String>,
    /// Control group for Dunnett's test
    #[arg(long)]
    pub control: Option<String>,
    /// Expected direction of the effect of A relative to B
    #[arg(long, value_enum, default_value = "two-sided")]
    pub alternate: Alternative,
    #[arg(long, default_value_t = 0.05)]
    pub alpha: f64,
    #[arg(long, value_enum, default_value = "any")]
    pub criterion: Criterion,
    /// Require a significant one-way ANOVA across groups
    #[arg(long)]
    pub anova_gate: bool,
    /// Welch's t-test (unequal variances) for t-test and holm-sidak
    #[arg(long)]
    pub welch: bool,
    /// Cluster index to filter down to valid clusters, STORE[::ARRAY]
    #[arg(long, requires = "index_out")]
    pub index: Option<VolumeRef>,
    /// Where to write the valid-cluster index
    #[arg(long, requires = "index")]
    pub index_out: Option<VolumeRef>,
    #[arg(long)]
    pub output: PathBuf,
}

pub fn run(args: StatsArgs, progress: impl Fn(f64, &str)) -> Result<(), Box<dyn std::error::Error>> {
    if !(args.alpha > 0.0 && args.alpha < 1.0) {
        return Err(Error::InvalidInput(format!("alpha must be in (0, 1), got {}", args.alpha)).into());
    }
    let data = load_density_dir(&args.input, &args.column)?;
    let groups: Vec<String> = data
        .values()
        .flat_map(|g| g.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if groups.len() < 2 {
        return Err(Error::InsufficientData(format!("need at least two conditions, found {:?}", groups)).into());
    }
    progress(0.2, &format!("Loaded {} cluster(s) across {:?}", data.len(), groups));

    let cfg = TestConfig {
        kind: args.test,
        comparisons: parse_comparisons(&args.comparisons, &groups, args.test, args.control.as_deref())?,
        control: args.control.clone(),
        alternative: args.alternate,
        alpha: args.alpha,
        criterion: args.criterion,
        anova_gate: args.anova_gate,
        welch: args.welch,
    };
    log::info!(
        "{:?} over {} comparison(s): {}",
        cfg.kind,
        cfg.comparisons.len(),
        cfg.comparisons.iter().map(Comparison::label).collect::<Vec<_>>().join(", ")
    );

    let outcomes = validate_clusters(&data, &cfg);
    progress(0.8, &format!("Tested {} cluster(s)", outcomes.len()));

    let rows: Vec<ComparisonRow> = outcomes.iter().flat_map(|o| o.rows.iter().cloned()).collect();
    report::write_csv(
        &args.output.join("cluster_stats.csv"),
        &rows,
        Some(&[
            "cluster_ID", "comparison", "mean_a", "mean_b", "mean_diff", "statistic", "p_value", "supports",
        ]),
    )?;
    let groups_out: Vec<GroupRow> = data
        .iter()
        .flat_map(|(&id, groups)| {
            groups.iter().map(move |(name, values)| {
                let s = stats::summarize(&Sample::new(name.clone(), values.clone()));
                GroupRow {
                    cluster_id: id,
                    group: s.name,
                    n: s.n,
                    mean: s.mean,
                    sd: s.sd,
                    sem: s.sem,
                }
            })
        })
        .collect();
    report::write_csv(
        &args.output.join("group_summary.csv"),
        &groups_out,
        Some(&["cluster_ID", "group", "n", "mean", "sd", "sem"]),
    )?;
    if cfg.anova_gate {
        let anova: Vec<AnovaRow> = outcomes
            .iter()
            .filter_map(|o| {
                o.anova_p.map(|p| AnovaRow {
                    cluster_id: o.cluster_id,
                    anova_p: p,
                })
            })
            .collect();
        report::write_csv(&args.output.join("anova.csv"), &anova, Some(&["cluster_ID", "anova_p"]))?;
    }

    let valid: Vec<u32> = outcomes.iter().filter(|o| o.valid).map(|o| o.cluster_id).collect();
    ids::write_id_file(&args.output.join("valid_cluster_ids.txt"), &valid)?;
    let total = outcomes.len();
    let summary = SummaryRow {
        test: cfg.kind,
        criterion: cfg.criterion,
        alternative: cfg.alternative,
        alpha: cfg.alpha,
        total_clusters: total,
        valid_clusters: valid.len(),
        percent_valid: if total == 0 { 0.0 } else { valid.len() as f64 / total as f64 * 100.0 },
    };
    log::info!("{}/{} cluster(s) valid", valid.len(), total);
    report::write_csv(&args.output.join("significance_summary.csv"), &[summary], None)?;

    if let (Some(index_ref), Some(out_ref)) = (&args.index, &args.index_out) {
        let idx = volume::load_labels(index_ref)?;
        let keep: BTreeSet<u32> = valid.iter().copied().collect();
        let filtered = index::keep_ids(&idx, &keep);
        volume::save_labels(out_ref, &filtered, volume::read_voxel_size(index_ref), None)?;
        progress(0.95, &format!("Wrote {}", out_ref));
    }

    report::write_params(&args.output, &args)?;
    progress(1.0, &format!("Wrote {}", args.output.display()));
    Ok(())
}
