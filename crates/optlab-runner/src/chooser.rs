use anyhow::{anyhow, Context, Result};
use optlab_core::{JobId, Parameter};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::path::Path;

use crate::grid::GridSnapshot;

#[derive(Debug, Clone, PartialEq)]
pub enum Choice {
    Existing(JobId),
    New(Vec<Parameter>),
}

pub trait Chooser {
    fn name(&self) -> &'static str;

    fn next(
        &mut self,
        grid: &GridSnapshot,
        candidates: &[JobId],
        pending: &[JobId],
        complete: &[JobId],
    ) -> Result<Choice>;
}

#[derive(Debug, Default)]
pub struct SequentialChooser;

impl Chooser for SequentialChooser {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn next(
        &mut self,
        _grid: &GridSnapshot,
        candidates: &[JobId],
        _pending: &[JobId],
        _complete: &[JobId],
    ) -> Result<Choice> {
        candidates
            .iter()
            .min()
            .map(|&id| Choice::Existing(id))
            .ok_or_else(|| anyhow!("no candidates to choose from"))
    }
}

/// Picks a uniformly random candidate. Accepts `seed=<u64>`.
#[derive(Debug)]
pub struct RandomChooser {
    rng: StdRng,
}

impl RandomChooser {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { rng }
    }
}

impl Chooser for RandomChooser {
    fn name(&self) -> &'static str {
        "random"
    }

    fn next(
        &mut self,
        _grid: &GridSnapshot,
        candidates: &[JobId],
        _pending: &[JobId],
        _complete: &[JobId],
    ) -> Result<Choice> {
        candidates
            .choose(&mut self.rng)
            .map(|&id| Choice::Existing(id))
            .ok_or_else(|| anyhow!("no candidates to choose from"))
    }
}

/// Parses `key=value` pairs separated by commas, e.g. `seed=7,noiseless=1`.
pub fn parse_chooser_args(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid chooser argument '{}': expected k=v", part))?;
        if key.trim().is_empty() {
            return Err(anyhow!("invalid chooser argument '{}': key cannot be empty", part));
        }
        out.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(out)
}

pub type ChooserCtor = fn(&Path, &BTreeMap<String, String>) -> Result<Box<dyn Chooser>>;

fn sequential(_expt_dir: &Path, _args: &BTreeMap<String, String>) -> Result<Box<dyn Chooser>> {
    Ok(Box::new(SequentialChooser))
}

fn random(_expt_dir: &Path, args: &BTreeMap<String, String>) -> Result<Box<dyn Chooser>> {
    let seed = args
        .get("seed")
        .map(|s| s.parse::<u64>())
        .transpose()
        .context("random chooser: seed must be an unsigned integer")?;
    Ok(Box::new(RandomChooser::new(seed)))
}

pub struct ChooserRegistry {
    ctors: BTreeMap<&'static str, ChooserCtor>,
}

impl Default for ChooserRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("sequential", sequential);
        registry.register("random", random);
        registry
    }
}

impl ChooserRegistry {
    pub fn empty() -> Self {
        Self {
            ctors: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: &'static str, ctor: ChooserCtor) {
        self.ctors.insert(name, ctor);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.ctors.keys().copied().collect()
    }

    pub fn resolve(&self, name: &str, expt_dir: &Path, raw_args: &str) -> Result<Box<dyn Chooser>> {
        let ctor = self.ctors.get(name).ok_or_else(|| {
            anyhow!(
                "unknown chooser '{}' (available: {})",
                name,
                self.names().join(", ")
            )
        })?;
        let args = parse_chooser_args(raw_args)?;
        ctor(expt_dir, &args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_takes_lowest_candidate() {
        let mut chooser = SequentialChooser;
        let grid = GridSnapshot::default();
        let choice = chooser.next(&grid, &[9, 4, 6], &[1], &[0]).expect("choice");
        assert_eq!(choice, Choice::Existing(4));
        assert!(chooser.next(&grid, &[], &[1], &[0]).is_err());
    }

    #[test]
    fn seeded_random_chooser_is_reproducible() {
        let grid = GridSnapshot::default();
        let candidates: Vec<JobId> = (0..100).collect();
        let picks = |seed| {
            let mut chooser = RandomChooser::new(Some(seed));
            (0..10)
                .map(|_| chooser.next(&grid, &candidates, &[], &[]).expect("choice"))
                .collect::<Vec<_>>()
        };
        assert_eq!(picks(3), picks(3));
        for choice in picks(5) {
            match choice {
                Choice::Existing(id) => assert!(id < 100),
                other => panic!("unexpected choice {:?}", other),
            }
        }
    }

    #[test]
    fn chooser_args_parse_key_value_pairs() {
        let args = parse_chooser_args(" seed=7, mcmc_iters = 10 ,").expect("args");
        assert_eq!(args.get("seed").map(String::as_str), Some("7"));
        assert_eq!(args.get("mcmc_iters").map(String::as_str), Some("10"));
        assert!(parse_chooser_args("").expect("empty").is_empty());
        assert!(parse_chooser_args("seed").is_err());
        assert!(parse_chooser_args("=3").is_err());
    }

    #[test]
    fn registry_resolves_names_and_rejects_unknown() {
        let registry = ChooserRegistry::default();
        assert_eq!(registry.names(), vec!["random", "sequential"]);
        let chooser = registry
            .resolve("random", Path::new("."), "seed=1")
            .expect("random chooser");
        assert_eq!(chooser.name(), "random");
        assert!(registry.resolve("random", Path::new("."), "seed=abc").is_err());
        let err = registry
            .resolve("GPEIOptChooser", Path::new("."), "")
            .err()
            .expect("unknown chooser");
        assert!(err.to_string().contains("unknown chooser"), "{}", err);
    }
}
